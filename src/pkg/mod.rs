// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Package cache reconciliation against the asset index, plus the sync and
//! garbage-collection entry points the CLI drives.

use std::{collections::HashSet, path::PathBuf};

use anyhow::{Context as _, Result, bail};
use tracing::{info, warn};

use crate::{ctx::Context, pkg::manager::PackageManager};

/// Asset index lookups.
pub mod index;
/// Reconciliation and planning.
pub mod manager;
/// The concurrent scheduler.
pub mod download;

/// Locates the asset DB for `(master, lang)`, trying the split layout first.
pub fn find_asset_db(ctx: &Context, master: &str, lang: &str) -> Option<PathBuf> {
    let dir = ctx.masters.join(master);
    let split = dir.join(format!("asset_i_{lang}_0.db"));
    if split.exists() {
        return Some(split);
    }
    let merged = dir.join(format!("asset_i_{lang}.db"));
    merged.exists().then_some(merged)
}

fn resolve_master(ctx: &Context, master: Option<String>) -> Result<String> {
    match master {
        Some(m) => Ok(m),
        None => ctx
            .memo()
            .read()?
            .master_version
            .context("no master version in the memo; run dl-master first"),
    }
}

/// Download or validate package groups. `groups` may be explicit keys,
/// `LIKE` patterns, or the single word "everything".
pub async fn sync(
    ctx: &Context,
    master: Option<String>,
    validate_only: bool,
    lang: Option<String>,
    groups: &[String],
) -> Result<()> {
    let lang = lang.unwrap_or_else(|| ctx.profile.primary_language().to_string());
    let master = resolve_master(ctx, master)?;

    if groups.is_empty() {
        warn!("No groups specified. Exiting.");
        return Ok(());
    }

    let Some(db_path) = find_asset_db(ctx, &master, &lang) else {
        bail!("can't find the asset DB for master {master} lang {lang}");
    };
    let manager = PackageManager::new(&db_path, vec![ctx.cache.clone()])?;

    info!("Master: {master}");
    info!("Packages on disk: {}", manager.package_state.len());

    let wanted_packages = if groups[0] == "@" {
        // Direct mode: the remaining arguments are literal package names.
        info!("Proceeding in direct mode.");
        manager.prune_package_list(&groups[1..])
    } else {
        let packages = if groups.len() == 1 && groups[0] == "everything" {
            manager.index().package_groups()?
        } else {
            manager.index().matching_package_groups(groups)?
        };

        info!("Validating packages...");
        let mut wanted = HashSet::new();
        for package_group in &packages {
            let (have, donthave) = manager.get_package_group(package_group)?;
            info!(
                "Validating '{package_group}'... {}/{}",
                have.len(),
                have.len() + donthave.len()
            );
            wanted.extend(donthave);
        }
        wanted
    };

    let download_tasks = manager.compute_download_list(wanted_packages)?;
    if download_tasks.is_empty() {
        info!("All packages are up to date. There is nothing to do.");
        return Ok(());
    }

    let npkg: usize = download_tasks.iter().map(|t| t.package_count()).sum();
    let nbytes: u64 = download_tasks.iter().map(|t| t.total_bytes()).sum();
    info!("Update statistics:");
    info!("  {} jobs,", download_tasks.len());
    info!("  {npkg} new packages,");
    info!("  {nbytes} bytes, ({} MB).", nbytes / (1024 * 1024));

    if validate_only {
        return Ok(());
    }

    let engine = ctx.get_engine(false, false).await?;
    download::execute_job_list(ctx, &manager, engine, download_tasks, |ctx, engine| {
        ctx.release_engine(engine, true)
    })
    .await
}

/// Delete unreferenced packages. Returns the number of bytes freed (or
/// freeable, on a dry run).
pub fn gc(
    ctx: &Context,
    master: Option<String>,
    dry_run: bool,
    lang: Option<String>,
) -> Result<u64> {
    let lang = lang.unwrap_or_else(|| ctx.profile.primary_language().to_string());
    let master = resolve_master(ctx, master)?;

    let Some(db_path) = find_asset_db(ctx, &master, &lang) else {
        bail!("can't find the asset DB for master {master} lang {lang}");
    };
    let manager = PackageManager::new(&db_path, vec![ctx.cache.clone()])?;

    info!("Master: {master}");
    info!("Packages on disk: {}", manager.package_state.len());

    let garbage = manager.unreferenced_packages()?;
    let mut freeable = 0u64;
    for pack in &garbage {
        let Some(path) = manager.lookup_file(pack) else {
            continue;
        };
        freeable += std::fs::metadata(&path)?.len();
        if !dry_run {
            info!("Removing {pack}...");
            std::fs::remove_file(&path)
                .with_context(|| format!("cannot delete {path:?}"))?;
        }
    }

    info!(
        "{freeable} bytes ({} MB) {} freed by deleting these unused packages.",
        freeable / (1024 * 1024),
        if dry_run { "can be" } else { "were" },
    );
    Ok(freeable)
}
