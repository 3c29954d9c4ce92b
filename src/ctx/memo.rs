// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::session::engine::FastResumeData;

/// Persisted per-region account state. Either all three of `user_id`,
/// `password`, and `auth_count` are present, or none are.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Memo {
    #[serde(default)]
    pub user_id: Option<i64>,
    /// Base64 authorization key.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub auth_count: Option<i64>,
    /// Last master version seen on the wire.
    #[serde(default)]
    pub master_version: Option<String>,
    /// Set only after a fully successful sync.
    #[serde(default)]
    pub latest_complete_master: Option<String>,
    /// Single-use session snapshot; cleared whenever it is consumed.
    #[serde(default)]
    pub resume_data: Option<FastResumeData>,
}

impl Memo {
    /// The stored account, if complete.
    pub fn credentials(&self) -> Option<(i64, &str, i64)> {
        match (self.user_id, self.password.as_deref(), self.auth_count) {
            (Some(uid), Some(pwd), Some(auc)) => Some((uid, pwd, auc)),
            _ => None,
        }
    }
}

/// Atomic read-modify-write store for the memo JSON under the region root.
/// Writers within one process are serialized; cross-process coordination is
/// not provided (the region root is a private working directory).
#[derive(Debug)]
pub struct MemoStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl MemoStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Memo> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("memo at {:?} does not parse", self.path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Memo::default()),
            Err(e) => Err(e).with_context(|| format!("cannot read memo at {:?}", self.path)),
        }
    }

    /// Reads the memo without taking the writer path.
    pub fn read(&self) -> Result<Memo> {
        let _guard = self.lock.lock().expect("memo lock poisoned");
        self.load()
    }

    /// Scoped read-modify-write: the closure mutates the memo, and the
    /// result is written back atomically on success.
    pub fn update<T>(&self, f: impl FnOnce(&mut Memo) -> T) -> Result<T> {
        let _guard = self.lock.lock().expect("memo lock poisoned");
        let mut memo = self.load()?;
        let out = f(&mut memo);

        let bytes = serde_json::to_vec(&memo).context("memo serialization failed")?;
        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .context("memo path has no file name")?;
        let tmp = self.path.with_file_name(format!("._tmp_{file_name}"));

        fs::write(&tmp, &bytes)
            .with_context(|| format!("cannot write memo temp file {tmp:?}"))?;
        set_mode_0644(&tmp)?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("cannot publish memo at {:?}", self.path))?;
        Ok(out)
    }
}

#[cfg(unix)]
fn set_mode_0644(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
        .with_context(|| format!("cannot chmod {path:?}"))
}

#[cfg(not(unix))]
fn set_mode_0644(_path: &Path) -> Result<()> {
    Ok(())
}
