// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Explicit per-region context: resolved server profile, on-disk roots, the
//! memo store, and session engine checkout/release.

use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{Context as _, Result};
use tracing::{error, info, warn};

use crate::{
    cfg::{
        config::{RegionTable, ServerProfile},
        enums::Platform,
    },
    ctx::memo::MemoStore,
    error::ClientError,
    session::engine::SessionEngine,
};

pub mod memo;

/// Environment variable naming the storage root all regions live under.
pub const STORAGE_ENV: &str = "ICE_STORAGE";

#[derive(Debug)]
pub struct Context {
    pub region: String,
    /// Resolved bundle version.
    pub bundle: String,
    pub profile: Arc<ServerProfile>,
    pub root: PathBuf,
    pub cache: PathBuf,
    pub masters: PathBuf,
    memo: MemoStore,
}

impl Context {
    /// Resolves the profile and prepares `<storage>/<region>/{cache,masters}`.
    pub fn new(
        table: &RegionTable,
        region: &str,
        bundle: Option<&str>,
        memo_name: &str,
    ) -> Result<Self> {
        let profile = table.resolve(region, bundle)?.clone();

        let storage = std::env::var_os(STORAGE_ENV)
            .map(PathBuf::from)
            .unwrap_or_default();
        let root = storage.join(region);
        let cache = root.join("cache");
        let masters = root.join("masters");
        fs::create_dir_all(&cache)
            .with_context(|| format!("cannot create cache dir {cache:?}"))?;
        fs::create_dir_all(&masters)
            .with_context(|| format!("cannot create masters dir {masters:?}"))?;

        let memo = MemoStore::new(root.join(format!("{memo_name}.json")));

        Ok(Self {
            region: region.to_string(),
            bundle: profile.bundle_version.clone(),
            profile: Arc::new(profile),
            root,
            cache,
            masters,
            memo,
        })
    }

    pub fn memo(&self) -> &MemoStore {
        &self.memo
    }

    /// An engine with no account attached, for bootstrap flows.
    pub fn empty_engine(&self) -> Result<SessionEngine> {
        SessionEngine::new(Arc::clone(&self.profile), Platform::Ios, None, None, 0)
    }

    /// Checks out a session engine for the stored account. Fast resume is
    /// attempted from the memo's blob (and the blob is consumed); on
    /// `reauth`, or when resume fails, a full login runs instead.
    pub async fn get_engine(&self, reauth: bool, validate: bool) -> Result<SessionEngine> {
        let memo = self.memo.read()?;
        let (user_id, password, auth_count) =
            memo.credentials().ok_or(ClientError::NoCredentials)?;

        let mut engine = SessionEngine::new(
            Arc::clone(&self.profile),
            Platform::Ios,
            Some(user_id),
            Some(password),
            auth_count,
        )?;

        let resumed = if reauth {
            false
        } else {
            engine
                .resume_session(memo.resume_data.as_ref(), false, validate)
                .await
                .unwrap_or_else(|e| {
                    warn!("resume failed: {e:#}");
                    false
                })
        };

        if !resumed {
            let ret = engine.relogin().await?;
            if ret.return_code != 0 {
                return Err(ClientError::SessionInvalid(format!(
                    "login returned code {}",
                    ret.return_code
                ))
                .into());
            }
        }

        Ok(engine)
    }

    /// Creates an account, accepts the TOS, and leaves the memo ready for
    /// resume: credentials, `auth_count == 1`, and a usable resume blob.
    pub async fn bootstrap(&self) -> Result<()> {
        let mut engine = self.empty_engine()?;
        let ret = engine
            .login_startup(Some(serde_json::json!({
                "resemara_detection_identifier": "",
                "time_difference": 0,
            })))
            .await?;

        let user_id = ret.user_id().context("startup did not return a user_id")?;
        let password = ret
            .authorization_key()
            .context("startup did not return an authorization key")?
            .to_string();

        self.memo.update(|memo| {
            memo.user_id = Some(user_id);
            memo.password = Some(password.clone());
            memo.auth_count = Some(0);
        })?;
        info!("Bootstrapped with id={user_id}");

        engine.set_login(Some(user_id), Some(password.as_str()), 1)?;
        engine.login_login().await?;

        let ret = engine.terms_agreement(1).await?;
        if ret.return_code == 0 {
            info!("Agreed to the terms of service...");
        } else {
            error!("TOS agreement failed: {} {}", ret.return_code, ret.app_data);
        }

        let master_version = engine.master_version().map(str::to_string);
        let resume_data = engine.save_session();
        self.memo.update(|memo| {
            memo.master_version = master_version;
            memo.auth_count = Some(1);
            memo.resume_data = resume_data;
        })
    }

    /// Accepts the TOS with the stored account.
    pub async fn accept_tos(&self) -> Result<()> {
        let mut engine = self.get_engine(false, false).await?;

        let ret = engine.terms_agreement(1).await?;
        if ret.return_code == 0 {
            info!("Agreed to the terms of service...");
        }

        self.release_engine(engine, true)
    }

    /// Returns an engine to the memo: persists the master version and auth
    /// counter, plus a fresh single-use resume blob when requested. The
    /// engine is consumed; it cannot issue requests afterwards.
    pub fn release_engine(&self, engine: SessionEngine, save_session: bool) -> Result<()> {
        let master_version = engine.master_version().map(str::to_string);
        let auth_count = engine.auth_count();
        let resume_data = if save_session {
            engine.save_session()
        } else {
            None
        };

        self.memo.update(|memo| {
            memo.master_version = master_version;
            memo.auth_count = Some(auth_count);
            memo.resume_data = resume_data;
        })
    }
}
