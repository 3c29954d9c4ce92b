// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Master manifest synchronisation: fetching and caching the manifest,
//! validating files against their encrypted SHA-1, and the streaming
//! download path that tees raw bytes to the `enc/` sidecar while feeding a
//! decrypt-then-inflate pipeline into the clear file.
//!
//! Produces the following structure under the region root:
//!
//! ```text
//! masters/<mv>/masterdata_<platform>_<lang>   cached manifest
//! masters/<mv>/auxinfo_<platform>             {"bundle_version": ...}
//! masters/<mv>/enc/<name>                     encrypted file
//! masters/<mv>/<name>                         decrypted file
//! masters/current                             symlink to the last synced <mv>
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail, ensure};
use flate2::{Decompress, FlushDecompress, Status};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{error, info, warn};

use crate::{
    cfg::{config::RegionTable, enums::Platform},
    crypto::hwdecrypt::{self, Keyset},
    ctx::Context,
    error::ClientError,
    manifest::{FileReference, Manifest},
};

/// Environment variable that allows a live master-version probe during sync.
pub const LIVE_MASTER_CHECK_ENV: &str = "ICE_LIVE_MASTER_CHECK";

/// Sidecar recording which bundle version fetched a master directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuxInfo {
    pub bundle_version: String,
}

fn manifest_name(platform: Platform, lang: &str) -> String {
    format!("masterdata_{}_{lang}", platform.code())
}

/// Fetches the manifest for `(master_version, lang)`, preferring a parseable
/// on-disk copy. A fresh download also writes the auxinfo sidecar.
pub async fn download_remote_manifest(
    ctx: &Context,
    master_version: &str,
    force: bool,
    platform: Platform,
    lang: Option<&str>,
) -> Result<Manifest> {
    let lang = lang.unwrap_or_else(|| ctx.profile.primary_language());
    let local_store = ctx.masters.join(master_version);
    fs::create_dir_all(&local_store)
        .await
        .with_context(|| format!("cannot create {local_store:?}"))?;

    let dest = local_store.join(manifest_name(platform, lang));
    if !force
        && let Ok(bytes) = fs::read(&dest).await
    {
        match Manifest::parse(&bytes, ctx.profile.master_keys) {
            Ok(m) => return Ok(m),
            Err(e) => {
                warn!("Can't read the disk manifest ({e:#}), downloading a fresh one.");
            },
        }
    }

    let url = format!(
        "{}/static/{master_version}/{}",
        ctx.profile.root,
        manifest_name(platform, lang)
    );
    let client = reqwest::Client::builder()
        .user_agent(&ctx.profile.user_agent)
        .build()
        .context("failed to build HTTP client")?;
    let rsp = client.get(&url).send().await.map_err(|e| {
        ClientError::Transport {
            path: url.clone(),
            detail: e.to_string(),
        }
    })?;
    if rsp.status() != reqwest::StatusCode::OK {
        error!(
            "Could not get the manifest for version {master_version}, is it out of date? \
             The original status code was {}.",
            rsp.status()
        );
        return Err(ClientError::Transport {
            path: url,
            detail: format!("HTTP {}", rsp.status()),
        }
        .into());
    }

    let bytes = rsp.bytes().await.map_err(|e| ClientError::Transport {
        path: url.clone(),
        detail: e.to_string(),
    })?;
    let manifest = Manifest::parse(&bytes, ctx.profile.master_keys)?;

    fs::write(&dest, &bytes)
        .await
        .with_context(|| format!("cannot cache manifest at {dest:?}"))?;
    let auxinfo = AuxInfo {
        bundle_version: ctx.profile.bundle_version.clone(),
    };
    let aux_path = local_store.join(format!("auxinfo_{}", platform.code()));
    fs::write(&aux_path, serde_json::to_vec(&auxinfo)?)
        .await
        .with_context(|| format!("cannot write auxinfo at {aux_path:?}"))?;

    Ok(manifest)
}

/// A file is valid when its `enc/` sidecar hashes to the manifest's
/// encrypted SHA-1. Absence is invalid.
pub async fn file_is_valid(ctx: &Context, file: &FileReference) -> Result<bool> {
    let path = ctx.masters.join(&file.version).join("enc").join(&file.name);
    let Ok(mut f) = fs::File::open(&path).await else {
        return Ok(false);
    };

    use tokio::io::AsyncReadExt;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; 0x4000];
    loop {
        let n = f
            .read(&mut buf)
            .await
            .with_context(|| format!("read error on {path:?}"))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()) == file.encrypted_sha)
}

/// Streaming inflater for the raw-deflate content stream. Output is handed
/// to the caller in bounded slices.
struct RawInflater {
    decomp: Decompress,
    out: Vec<u8>,
}

impl RawInflater {
    fn new() -> Self {
        Self {
            // no zlib header
            decomp: Decompress::new(false),
            out: vec![0u8; 0x10000],
        }
    }

    async fn feed(&mut self, mut input: &[u8], sink: &mut fs::File) -> Result<()> {
        while !input.is_empty() {
            let before_in = self.decomp.total_in();
            let before_out = self.decomp.total_out();
            let status = self
                .decomp
                .decompress(input, &mut self.out, FlushDecompress::None)
                .context("deflate stream is corrupt")?;
            let consumed = (self.decomp.total_in() - before_in) as usize;
            let produced = (self.decomp.total_out() - before_out) as usize;
            sink.write_all(&self.out[..produced]).await?;
            input = &input[consumed..];
            if status == Status::StreamEnd {
                break;
            }
            if consumed == 0 && produced == 0 {
                bail!("deflate stream made no progress");
            }
        }
        Ok(())
    }

    async fn finish(&mut self, sink: &mut fs::File) -> Result<()> {
        loop {
            let before_out = self.decomp.total_out();
            let status = self
                .decomp
                .decompress(&[], &mut self.out, FlushDecompress::Finish)
                .context("deflate stream is corrupt at end")?;
            let produced = (self.decomp.total_out() - before_out) as usize;
            sink.write_all(&self.out[..produced]).await?;
            if status == Status::StreamEnd || produced == 0 {
                return Ok(());
            }
        }
    }
}

/// Downloads one manifest-listed file: raw bytes are teed to the `enc/`
/// sidecar while the decrypt+inflate pipeline produces the clear file. Both
/// are written to `._tmp_` siblings and renamed into place on success, the
/// clear file first (validity checks consult the sidecar).
pub async fn download_one(ctx: &Context, file: &FileReference) -> Result<()> {
    let local_store = ctx.masters.join(&file.version);
    let enc_dir = local_store.join("enc");
    fs::create_dir_all(&enc_dir)
        .await
        .with_context(|| format!("cannot create {enc_dir:?}"))?;

    let url = format!("{}/static/{}/{}", ctx.profile.root, file.version, file.name);
    let client = reqwest::Client::builder()
        .user_agent(&ctx.profile.user_agent)
        .build()
        .context("failed to build HTTP client")?;
    let rsp = client
        .get(&url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| ClientError::Transport {
            path: url.clone(),
            detail: e.to_string(),
        })?;

    let mut keys = Keyset::new(file.keys()?);
    let mut inflater = RawInflater::new();

    let clear_tmp = local_store.join(format!("._tmp_{}", file.name));
    let enc_tmp = enc_dir.join(format!("._tmp_{}", file.name));
    let clear_dest = local_store.join(&file.name);
    let enc_dest = enc_dir.join(&file.name);

    let result = async {
        let mut enc_fd = fs::File::create(&enc_tmp).await?;
        let mut clear_fd = fs::File::create(&clear_tmp).await?;

        let mut stream = rsp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ClientError::Transport {
                path: url.clone(),
                detail: e.to_string(),
            })?;
            enc_fd.write_all(&chunk).await?;

            let mut copy = chunk.to_vec();
            hwdecrypt::decrypt(&mut keys, &mut copy);
            inflater.feed(&copy, &mut clear_fd).await?;
        }
        inflater.finish(&mut clear_fd).await?;

        enc_fd.flush().await?;
        clear_fd.flush().await?;
        Ok::<(), anyhow::Error>(())
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&clear_tmp).await;
        let _ = fs::remove_file(&enc_tmp).await;
        return Err(e);
    }

    publish_atomic(&clear_tmp, &clear_dest).await?;
    publish_atomic(&enc_tmp, &enc_dest).await?;
    Ok(())
}

/// chmod 0644, drop any previous target, move the temp file into place.
async fn publish_atomic(tmp: &Path, dest: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp, std::fs::Permissions::from_mode(0o644))
            .await
            .with_context(|| format!("cannot chmod {tmp:?}"))?;
    }
    match fs::remove_file(dest).await {
        Ok(()) => {},
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => return Err(e).with_context(|| format!("cannot drop old {dest:?}")),
    }
    fs::rename(tmp, dest)
        .await
        .with_context(|| format!("cannot publish {dest:?}"))
}

/// Points `masters/current` at the freshly synced version directory.
pub fn update_current_link(ctx: &Context, master_version: &str) -> Result<()> {
    let link = ctx.masters.join("current");
    match std::fs::remove_file(&link) {
        Ok(()) => {},
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => return Err(e).with_context(|| format!("cannot drop old link {link:?}")),
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(master_version, &link)
        .with_context(|| format!("cannot link {link:?} -> {master_version}"))?;
    Ok(())
}

/// Probes the server for the current master version when the operator has
/// allowed it via the environment.
pub async fn live_master_check(ctx: &Context) -> Result<Option<String>> {
    if std::env::var_os(LIVE_MASTER_CHECK_ENV).is_none() {
        return Ok(None);
    }

    let engine = ctx.get_engine(false, true).await?;
    let master = engine.master_version().map(str::to_string);
    ctx.release_engine(engine, true)?;
    Ok(master)
}

/// Full master sync: every manifest-listed file for every profile language,
/// validated or re-downloaded, then the `current` link and the
/// `latest_complete_master` memo key.
pub async fn sync(ctx: &Context, master: Option<String>, force: bool) -> Result<()> {
    let master = match master {
        Some(m) => m,
        None => match live_master_check(ctx).await? {
            Some(m) => m,
            None => ctx
                .memo()
                .read()?
                .master_version
                .context("no master version in the memo; run with -m or log in once")?,
        },
    };

    info!("Master: {master}, Application: {}", ctx.bundle);

    let mut have_files = std::collections::HashSet::new();
    for lang in ctx.profile.languages() {
        let manifest =
            download_remote_manifest(ctx, &master, false, Platform::Ios, Some(lang.as_str()))
                .await?;
        for file in &manifest.files {
            if have_files.contains(&file.name) {
                continue;
            }
            if force || !file_is_valid(ctx, file).await? {
                info!("Retrieving and decrypting {}...", file.name);
                download_one(ctx, file).await?;
                ensure!(
                    file_is_valid(ctx, file).await?,
                    ClientError::IntegrityFailure {
                        name: file.name.clone(),
                        expected: file.encrypted_sha.clone(),
                        actual: "(mismatch after download)".to_string(),
                    }
                );
                have_files.insert(file.name.clone());
            } else {
                info!("File {} is still valid!", file.name);
            }
        }
    }

    if let Err(e) = update_current_link(ctx, &master) {
        error!("Can't update current master symlink: {e:#}");
    }

    ctx.memo().update(|memo| {
        memo.latest_complete_master = Some(master);
    })?;
    Ok(())
}

/// Deletes `.db`/`.db.gz` payloads of stale master directories, keeping the
/// five most recently fetched plus anything the memo still references.
pub fn gc(ctx: &Context, dry_run: bool) -> Result<u64> {
    let memo = ctx.memo().read()?;
    let protected: Vec<Option<String>> =
        vec![memo.master_version.clone(), memo.latest_complete_master];

    let lang = ctx.profile.primary_language();
    let mut version_list: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();

    for entry in std::fs::read_dir(&ctx.masters)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_symlink() || !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();

        if protected.iter().any(|p| p.as_deref() == Some(name.as_str())) {
            info!("{name} is in use, not adding to cleanup list");
            continue;
        }
        if !path.join("auxinfo_i").exists() && !path.join("auxinfo_a").exists() {
            info!("{name} has no auxinfo, not adding to cleanup list");
            continue;
        }

        for try_name in [format!("masterdata_i_{lang}"), format!("masterdata_a_{lang}")] {
            if let Ok(meta) = std::fs::metadata(path.join(&try_name)) {
                version_list.push((meta.modified()?, path.clone()));
                break;
            }
        }
    }

    version_list.sort_by_key(|(mtime, _)| *mtime);

    let mut cleaned_bytes = 0u64;
    let keep = version_list.len().saturating_sub(5);
    for (_, dir) in &version_list[..keep] {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // .gz for compatibility with the old archive style
            if !(name.ends_with(".db") || name.ends_with(".db.gz")) {
                continue;
            }
            cleaned_bytes += entry.metadata()?.len();
            if !dry_run {
                std::fs::remove_file(entry.path())
                    .with_context(|| format!("cannot delete {:?}", entry.path()))?;
            }
        }
    }

    info!(
        "master gc: cleaned up {cleaned_bytes} bytes, {} MB",
        cleaned_bytes / 1_048_576
    );
    Ok(cleaned_bytes)
}

/// Offline re-decrypt of a manifest-listed file, selecting the profile via
/// the auxinfo sidecar next to it. Writes `<file>.dec`.
pub fn decrypt_offline(table: &RegionTable, region: &str, path: &Path) -> Result<PathBuf> {
    let dir = path.parent().context("file has no parent directory")?;
    let aux: AuxInfo = serde_json::from_slice(
        &std::fs::read(dir.join("auxinfo_i")).context("cannot read auxinfo_i")?,
    )?;
    let profile = table.resolve(region, Some(aux.bundle_version.as_str()))?;

    let manifest_path = dir.join("masterdata_i_ja");
    let manifest = Manifest::parse(
        &std::fs::read(&manifest_path)
            .with_context(|| format!("cannot read manifest at {manifest_path:?}"))?,
        profile.master_keys,
    )?;

    let base = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("file has no name")?;
    let file = manifest
        .files
        .iter()
        .find(|f| f.name == base)
        .with_context(|| format!("{base} is not in the manifest"))?;

    let mut keys = Keyset::new(file.keys()?);
    let mut decomp = Decompress::new(false);
    let mut copy = std::fs::read(path)?;
    hwdecrypt::decrypt(&mut keys, &mut copy);

    let mut clear = Vec::with_capacity(copy.len() * 2);
    loop {
        if clear.len() == clear.capacity() {
            clear.reserve(0x10000);
        }
        let before_out = decomp.total_out();
        let consumed = decomp.total_in() as usize;
        let status = decomp
            .decompress_vec(&copy[consumed..], &mut clear, FlushDecompress::Finish)
            .context("deflate stream is corrupt")?;
        if status == Status::StreamEnd {
            break;
        }
        ensure!(
            decomp.total_out() > before_out || clear.len() == clear.capacity(),
            "deflate stream ended prematurely"
        );
    }

    let out_path = PathBuf::from(format!("{}.dec", path.display()));
    std::fs::write(&out_path, &clear)?;
    Ok(out_path)
}
