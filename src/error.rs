// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Error taxonomy shared by the session engine and the asset pipeline.
//!
//! Most functions return `anyhow::Result`; these variants are attached as the
//! root cause where a caller needs to distinguish kinds (session recovery,
//! forced re-download, exit codes).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// No server profile matches the requested (region, bundle) pair.
    #[error("no server profile for region '{region}' bundle {bundle:?}")]
    ConfigNotFound {
        region: String,
        bundle: Option<String>,
    },

    /// The memo has no usable account but the operation requires one.
    #[error("no account in the memo; run bootstrap first")]
    NoCredentials,

    /// HTTP-level failure: connect, TLS, non-2xx status.
    #[error("transport failure on {path}: {detail}")]
    Transport { path: String, detail: String },

    /// The response body is not the expected `[time, master, code, data]`
    /// 4-tuple.
    #[error("malformed API response on {path}")]
    ProtocolMalformed { path: String },

    /// 403 on an API call, a failed resume probe, or use of an engine whose
    /// session was already saved.
    #[error("session invalid: {0}")]
    SessionInvalid(String),

    /// `skip_validity_check` and `revalidate_immediately` requested together.
    #[error("skip_validity_check and revalidate_immediately are mutually exclusive")]
    InvalidArgument,

    /// Downloaded bytes do not hash to the manifest's encrypted SHA-1.
    #[error("integrity failure for {name}: expected {expected}, got {actual}")]
    IntegrityFailure {
        name: String,
        expected: String,
        actual: String,
    },

    /// A single download task failed; fatal for the whole job.
    #[error("download of {name} failed: {detail}")]
    DownloadFailure { name: String, detail: String },

    /// I/O error on the cache or masters tree.
    #[error("filesystem error at {path}: {source}")]
    FileSystem {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
