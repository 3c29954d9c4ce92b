// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{cmp::Ordering, collections::HashMap, fs, path::Path};

use anyhow::{Context, Result, ensure};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Profile table shipped with the binary. Regions map to an ordered list of
/// profiles, one per released bundle version.
const BUILTIN_REGIONS: &str = include_str!("../../config/regions.yaml");

static BUILTIN_TABLE: OnceCell<RegionTable> = OnceCell::new();

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RegionTable {
    /// Region code -> profiles, newest bundle first by convention (the order
    /// is not relied upon; resolution always compares versions).
    pub regions: HashMap<String, Vec<ServerProfile>>,
}

/// Immutable description of one API deployment. Everything the session
/// engine and the asset pipeline need to talk to a server lives here.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerProfile {
    /// API root URL, no trailing slash.
    pub root: String,
    /// Platform-agnostic user agent sent on every request.
    pub user_agent: String,
    /// Client-app semantic version this profile belongs to.
    pub bundle_version: String,
    /// 16-byte HMAC key used for signing before a session exists.
    pub bootstrap_key: String,
    /// Hex-encoded 32-byte keys folded into the session key after login, in
    /// order.
    #[serde(default)]
    pub session_mixkey: Vec<String>,
    /// RSA public key, PEM.
    pub public_key: String,
    /// Per-deployment master keys for content decryption.
    pub master_keys: [u32; 3],
    /// Primary asset language; absent means the server has a single
    /// implicit language ("ja").
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub additional_languages: Vec<String>,
}

impl RegionTable {
    /// The table compiled into the binary, parsed once.
    pub fn builtin() -> Result<&'static Self> {
        BUILTIN_TABLE.get_or_try_init(|| {
            let mut table: RegionTable = serde_yaml::from_str(BUILTIN_REGIONS)
                .context("built-in region table does not parse")?;
            table.validate_and_normalize()?;
            Ok(table)
        })
    }

    /// Loads a replacement table from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut table: RegionTable =
            serde_yaml::from_str(&s).context("failed to parse region table YAML")?;
        table.validate_and_normalize()?;
        Ok(table)
    }

    /// Validates invariants on every profile.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        for (region, profiles) in &mut self.regions {
            ensure!(
                !profiles.is_empty(),
                "region '{region}' has no server profiles"
            );
            for p in profiles {
                p.root = p.root.trim_end_matches('/').to_string();
                ensure!(
                    p.bootstrap_key.len() == 16,
                    "region '{region}' bundle {}: bootstrap_key must be 16 bytes",
                    p.bundle_version
                );
                for mk in &p.session_mixkey {
                    let decoded = hex::decode(mk).with_context(|| {
                        format!("region '{region}': session_mixkey is not hex")
                    })?;
                    ensure!(
                        decoded.len() == 32,
                        "region '{region}': session_mixkey must decode to 32 bytes"
                    );
                }
                ensure!(
                    p.public_key.contains("BEGIN PUBLIC KEY"),
                    "region '{region}' bundle {}: public_key is not PEM",
                    p.bundle_version
                );
            }
        }
        Ok(())
    }

    /// Resolves `(region, bundle?)` to one profile. Without an exact bundle
    /// the highest bundle version wins; with one, it must match.
    pub fn resolve(&self, region: &str, exact: Option<&str>) -> Result<&ServerProfile> {
        let profiles = self.regions.get(region).ok_or_else(|| {
            ClientError::ConfigNotFound {
                region: region.to_string(),
                bundle: exact.map(str::to_string),
            }
        })?;

        if let Some(want) = exact {
            return profiles
                .iter()
                .find(|p| p.bundle_version == want)
                .ok_or_else(|| {
                    ClientError::ConfigNotFound {
                        region: region.to_string(),
                        bundle: Some(want.to_string()),
                    }
                    .into()
                });
        }

        profiles
            .iter()
            .max_by(|a, b| vercmp(&a.bundle_version, &b.bundle_version))
            .ok_or_else(|| {
                ClientError::ConfigNotFound {
                    region: region.to_string(),
                    bundle: None,
                }
                .into()
            })
    }
}

impl ServerProfile {
    pub fn bootstrap_key_bytes(&self) -> &[u8] {
        self.bootstrap_key.as_bytes()
    }

    /// Decoded session mix keys, in fold order.
    pub fn mix_keys(&self) -> Vec<Vec<u8>> {
        // Validated at table load, so decoding cannot fail here.
        self.session_mixkey
            .iter()
            .filter_map(|k| hex::decode(k).ok())
            .collect()
    }

    /// Primary asset language code.
    pub fn primary_language(&self) -> &str {
        self.language.as_deref().unwrap_or("ja")
    }

    /// Primary language followed by the additional ones.
    pub fn languages(&self) -> Vec<String> {
        let mut langs = vec![self.primary_language().to_string()];
        langs.extend(self.additional_languages.iter().cloned());
        langs
    }
}

/// Component-wise numeric version comparison. Missing components count as
/// zero, so `1.2 == 1.2.0` and `1.10 > 1.9`.
pub fn vercmp(a: &str, b: &str) -> Ordering {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|c| c.parse::<u64>().unwrap_or(0))
            .collect()
    };
    let aa = parse(a);
    let bb = parse(b);
    let n = aa.len().max(bb.len());
    for i in 0..n {
        let av = aa.get(i).copied().unwrap_or(0);
        let bv = bb.get(i).copied().unwrap_or(0);
        match av.cmp(&bv) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
