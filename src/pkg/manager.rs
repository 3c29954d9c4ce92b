// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Package reconciliation and download planning: the local cache set, group
//! validation against the asset index, and the Leaf/Meta task synthesis the
//! scheduler executes.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use dashmap::DashSet;

use crate::pkg::index::AssetIndex;

/// Every cache shard directory: `pkg0` through `pkgz`.
pub const PACKAGE_PREFIXES: &str = "0123456789abcdefghijklmnopqrstuvwxyz";

/// One package to materialize: either a standalone download or a slice of a
/// metapackage at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDownload {
    pub name: String,
    pub size: u64,
    pub offset: u64,
}

/// A unit of download work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadTask {
    /// One whole file fetched into the cache.
    Leaf(PackageDownload),
    /// One metapackage stream demultiplexed into its members, splits in
    /// ascending non-overlapping offset order.
    Meta {
        name: String,
        splits: Vec<PackageDownload>,
    },
}

impl DownloadTask {
    /// The name sent to the URL minting endpoint.
    pub fn name(&self) -> &str {
        match self {
            DownloadTask::Leaf(p) => &p.name,
            DownloadTask::Meta { name, .. } => name,
        }
    }

    pub fn package_count(&self) -> usize {
        match self {
            DownloadTask::Leaf(_) => 1,
            DownloadTask::Meta { splits, .. } => splits.len(),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        match self {
            DownloadTask::Leaf(p) => p.size,
            DownloadTask::Meta { splits, .. } => splits.iter().map(|s| s.size).sum(),
        }
    }
}

/// Splits must march forward along the byte stream without overlapping.
pub fn meta_list_is_monotonic(splits: &[PackageDownload]) -> bool {
    let mut cursor = 0u64;
    for split in splits {
        if split.offset < cursor {
            return false;
        }
        cursor = split.offset + split.size;
    }
    true
}

#[derive(Debug)]
pub struct PackageManager {
    search_paths: Vec<PathBuf>,
    /// Names present in the cache. Shared with the download workers, which
    /// insert as files complete.
    pub package_state: Arc<DashSet<String>>,
    index: AssetIndex,
}

impl PackageManager {
    /// Opens the asset DB and enumerates the cache shards (creating missing
    /// ones).
    pub fn new(asset_db: &Path, search_paths: Vec<PathBuf>) -> Result<Self> {
        anyhow::ensure!(!search_paths.is_empty(), "no search paths configured");
        let package_state = Arc::new(compute_package_state(&search_paths)?);
        let index = AssetIndex::open(asset_db)?;
        Ok(Self {
            search_paths,
            package_state,
            index,
        })
    }

    pub fn index(&self) -> &AssetIndex {
        &self.index
    }

    /// Finds a package on disk across the search paths.
    pub fn lookup_file(&self, pack: &str) -> Option<PathBuf> {
        let shard = shard_name(pack)?;
        self.search_paths
            .iter()
            .map(|p| p.join(&shard).join(pack))
            .find(|candidate| candidate.exists())
    }

    /// The root new files land under.
    pub fn destination_root(&self) -> &Path {
        self.search_paths
            .last()
            .expect("search paths verified non-empty at construction")
    }

    /// New files land in the last search path.
    pub fn destination_for_new_file(&self, pack: &str) -> Result<PathBuf> {
        let shard = shard_name(pack).context("package name is empty")?;
        Ok(self.destination_root().join(shard).join(pack))
    }

    /// Partitions one group into (present, missing) against the local set.
    pub fn get_package_group(&self, package_key: &str) -> Result<(HashSet<String>, HashSet<String>)> {
        let mut have = HashSet::new();
        let mut missing = HashSet::new();
        for name in self.index.group_members(package_key)? {
            if self.package_state.contains(&name) {
                have.insert(name);
            } else {
                missing.insert(name);
            }
        }
        Ok((have, missing))
    }

    /// Direct selection: literal package names, pruned down to the ones not
    /// already in the cache.
    pub fn prune_package_list(&self, names: &[String]) -> HashSet<String> {
        names
            .iter()
            .filter(|name| !self.package_state.contains(name.as_str()))
            .cloned()
            .collect()
    }

    /// Packages on disk that no mapping row references. Garbage; callers may
    /// delete.
    pub fn unreferenced_packages(&self) -> Result<HashSet<String>> {
        let indexed = self.index.all_pack_names()?;
        Ok(self
            .package_state
            .iter()
            .filter(|name| !indexed.contains(name.key()))
            .map(|name| name.key().clone())
            .collect())
    }

    /// Expands metapackage names into Meta tasks, one per metapackage, with
    /// splits sorted by offset. Returns the member names covered.
    fn resolve_metapackages(
        &self,
        metas: Vec<String>,
    ) -> Result<(HashSet<String>, Vec<DownloadTask>)> {
        let mut seen = HashSet::new();
        let mut tasks = Vec::new();

        let mut current: Option<(String, Vec<PackageDownload>)> = None;
        for row in self.index.metapack_rows(&metas)? {
            let switching = current.as_ref().map(|(name, _)| name.as_str())
                != Some(row.metapack_name.as_str());
            if switching {
                if let Some((name, mut splits)) = current.take() {
                    splits.sort_by_key(|s| s.offset);
                    tasks.push(DownloadTask::Meta { name, splits });
                }
                current = Some((row.metapack_name.clone(), Vec::new()));
            }

            seen.insert(row.pack_name.clone());
            if let Some((_, splits)) = current.as_mut() {
                splits.push(PackageDownload {
                    name: row.pack_name,
                    size: row.file_size,
                    offset: row.metapack_offset,
                });
            }
        }

        if let Some((name, mut splits)) = current.take() {
            splits.sort_by_key(|s| s.offset);
            tasks.push(DownloadTask::Meta { name, splits });
        }

        Ok((seen, tasks))
    }

    /// Turns a wanted set into the minimal task list: standalone rows become
    /// Leaf tasks, metapackage members are batched into Meta tasks, paged
    /// through the index in fixed batches.
    pub fn compute_download_list(
        &self,
        wanted_pkgs: HashSet<String>,
    ) -> Result<Vec<DownloadTask>> {
        let mut wanted: Vec<String> = wanted_pkgs.into_iter().collect();
        wanted.sort();
        let mut dl = Vec::new();

        while !wanted.is_empty() {
            let tail = wanted.len().saturating_sub(super::index::SELECT_PAGE);
            let page: Vec<String> = wanted.split_off(tail);

            let mut metapackages = Vec::new();
            for row in self.index.mapping_rows(&page)? {
                match row.metapack_name {
                    None => dl.push(DownloadTask::Leaf(PackageDownload {
                        name: row.pack_name,
                        size: row.file_size,
                        offset: 0,
                    })),
                    Some(meta) => {
                        if !metapackages.contains(&meta) {
                            metapackages.push(meta);
                        }
                    },
                }
            }

            let (seen_packages, dl_tasks) = self.resolve_metapackages(metapackages)?;
            dl.extend(dl_tasks);
            wanted.retain(|name| !seen_packages.contains(name));
        }

        Ok(dl)
    }

    /// Merges task lists, keeping the first task for each name.
    pub fn combine_download_lists(dls: Vec<Vec<DownloadTask>>) -> Vec<DownloadTask> {
        let mut combined_names = HashSet::new();
        let mut deduplicated = Vec::new();
        for dl in dls {
            for task in dl {
                if combined_names.insert(task.name().to_string()) {
                    deduplicated.push(task);
                }
            }
        }
        deduplicated
    }
}

fn shard_name(pack: &str) -> Option<String> {
    pack.chars().next().map(|c| format!("pkg{c}"))
}

/// Creates every `pkg<c>` shard under each root and collects the names found
/// there. Only files whose name starts with the shard letter count.
pub fn compute_package_state(roots: &[PathBuf]) -> Result<DashSet<String>> {
    let packages = DashSet::new();
    for root in roots {
        for letter in PACKAGE_PREFIXES.chars() {
            let shard = root.join(format!("pkg{letter}"));
            std::fs::create_dir_all(&shard)
                .with_context(|| format!("cannot create shard {shard:?}"))?;
            for entry in std::fs::read_dir(&shard)? {
                let name = entry?.file_name().to_string_lossy().into_owned();
                if name.starts_with(letter) {
                    packages.insert(name);
                }
            }
        }
    }
    Ok(packages)
}
