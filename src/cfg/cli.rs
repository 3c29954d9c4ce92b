// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

/// Live-content API client and asset cache tool.
#[derive(Debug, Parser)]
#[command(name = "ice-client", version, about)]
pub struct Cli {
    /// API region (a key of the region table, e.g. "jp").
    pub region: String,

    /// Pin an exact bundle version instead of the newest one.
    #[arg(short, long)]
    pub bundle: Option<String>,

    /// Name of the memo file to use.
    #[arg(short = 'f', long, default_value = "ice_store")]
    pub memo: String,

    /// Replace the built-in region table with a YAML file.
    #[arg(long)]
    pub regions: Option<PathBuf>,

    /// Disable logging.
    #[arg(short, long)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create an account and accept the TOS.
    Bootstrap,
    /// Accept the TOS with the stored account.
    AcceptTos,
    /// Print the resolved bundle version.
    Resolve,
    /// Print the last fully synced master version.
    CurrentMaster,
    /// Remove fast resume data from the memo.
    Invalidate,
    /// Download and decrypt the master manifest file set.
    DlMaster {
        /// Master version (default: probe or memo).
        #[arg(short, long)]
        master: Option<String>,
        /// Always re-download files.
        #[arg(short, long)]
        force: bool,
    },
    /// Download or validate package groups.
    PkgSync {
        /// Assume master version (that you already have an asset DB for).
        #[arg(short, long)]
        master: Option<String>,
        /// Don't download anything, just validate.
        #[arg(short = 'n', long)]
        validate_only: bool,
        /// Asset language (default: profile language).
        #[arg(short = 'g', long)]
        lang: Option<String>,
        /// Package groups to validate or complete: group keys or LIKE
        /// patterns, "everything" for all groups, or "@" followed by
        /// literal package names.
        groups: Vec<String>,
    },
    /// Delete packages no master references.
    PkgGc {
        #[arg(short, long)]
        master: Option<String>,
        /// Don't delete anything, just report.
        #[arg(short = 'n', long)]
        dry_run: bool,
        #[arg(short = 'g', long)]
        lang: Option<String>,
    },
    /// Delete database payloads of stale master directories.
    MasterGc {
        /// Dry run. Don't delete any files.
        #[arg(short = 'n', long)]
        dry_run: bool,
    },
    /// Re-decrypt a manifest-listed file in place (debugging aid).
    DecryptMaster { file: PathBuf },
}

/// Resolves a possibly relative path against the current working directory.
pub fn resolve_config_path(rel: &Path) -> Result<PathBuf> {
    let abs = if rel.is_absolute() {
        rel.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(rel)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}
