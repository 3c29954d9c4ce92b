// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Read-only view over the asset index database bundled with every master.
//! Only two tables matter here: `m_asset_package` (the group keys) and
//! `m_asset_package_mapping` (pack name, size, and optional metapackage
//! placement).

use std::{collections::HashSet, path::Path};

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};

/// One `m_asset_package_mapping` row as seen by the planner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRow {
    pub pack_name: String,
    pub metapack_name: Option<String>,
    pub file_size: u64,
}

/// A metapackage member with its byte-range placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaSplitRow {
    pub pack_name: String,
    pub file_size: u64,
    pub metapack_name: String,
    pub metapack_offset: u64,
}

/// Query page size for `IN (...)` lists.
pub const SELECT_PAGE: usize = 500;

#[derive(Debug)]
pub struct AssetIndex {
    db: Connection,
}

impl AssetIndex {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("cannot open asset DB at {path:?}"))?;
        Ok(Self { db })
    }

    /// All package group keys.
    pub fn package_groups(&self) -> Result<Vec<String>> {
        let mut stmt = self.db.prepare("SELECT package_key FROM m_asset_package")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Group keys matching any of the `LIKE` patterns, first-match order,
    /// deduplicated.
    pub fn matching_package_groups(&self, patterns: &[String]) -> Result<Vec<String>> {
        let mut stmt = self
            .db
            .prepare("SELECT package_key FROM m_asset_package WHERE package_key LIKE ?1")?;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for pattern in patterns {
            let rows = stmt.query_map([pattern], |row| row.get::<_, String>(0))?;
            for key in rows {
                let key = key?;
                if seen.insert(key.clone()) {
                    out.push(key);
                }
            }
        }
        Ok(out)
    }

    /// Pack names belonging to one group.
    pub fn group_members(&self, package_key: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .db
            .prepare("SELECT pack_name FROM m_asset_package_mapping WHERE package_key = ?1")?;
        let rows = stmt.query_map([package_key], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Every pack name the index references.
    pub fn all_pack_names(&self) -> Result<HashSet<String>> {
        let mut stmt = self
            .db
            .prepare("SELECT pack_name FROM m_asset_package_mapping")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Mapping rows for one page of pack names (at most [`SELECT_PAGE`]).
    pub fn mapping_rows(&self, page: &[String]) -> Result<Vec<MappingRow>> {
        self.paged_select(
            page,
            "SELECT DISTINCT pack_name, metapack_name, file_size \
             FROM m_asset_package_mapping WHERE pack_name IN ({})",
            |row| {
                Ok(MappingRow {
                    pack_name: row.get(0)?,
                    metapack_name: row.get(1)?,
                    file_size: row.get::<_, i64>(2)? as u64,
                })
            },
        )
    }

    /// All member rows of the given metapackages, ordered by
    /// `(metapack_name, metapack_offset)` so the planner can group
    /// consecutive rows.
    pub fn metapack_rows(&self, metas: &[String]) -> Result<Vec<MetaSplitRow>> {
        self.paged_select(
            metas,
            "SELECT DISTINCT pack_name, file_size, metapack_name, metapack_offset \
             FROM m_asset_package_mapping WHERE metapack_name IN ({}) \
             ORDER BY metapack_name, metapack_offset",
            |row| {
                Ok(MetaSplitRow {
                    pack_name: row.get(0)?,
                    file_size: row.get::<_, i64>(1)? as u64,
                    metapack_name: row.get(2)?,
                    metapack_offset: row.get::<_, i64>(3)? as u64,
                })
            },
        )
    }

    fn paged_select<T>(
        &self,
        items: &[String],
        sql_template: &str,
        mut map: impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for page in items.chunks(SELECT_PAGE) {
            let placeholders = vec!["?"; page.len()].join(",");
            let sql = sql_template.replace("{}", &placeholders);
            let mut stmt = self.db.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(page.iter()), &mut map)?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }
}
