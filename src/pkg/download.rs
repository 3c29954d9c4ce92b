// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The download scheduler: a bounded pool of workers draining a shared task
//! queue against the mint-once URL list. A failed task cancels the pool and
//! fails the job; partial work already on disk stays.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result, bail, ensure};
use bytes::{Buf, Bytes};
use futures::StreamExt;
use tokio::{io::AsyncWriteExt, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    ctx::Context as RegionContext,
    error::ClientError,
    pkg::manager::{DownloadTask, PackageManager, meta_list_is_monotonic},
    session::engine::SessionEngine,
};

/// Worker pool size for the concurrent path.
pub const DEFAULT_WORKERS: usize = 10;

/// Set to force the degenerate single-worker path.
pub const SEQUENTIAL_ENV: &str = "ICE_SEQUENTIAL_DOWNLOADS";

/// Mints signed URLs for every task in one call, hands the engine back to
/// the caller through `on_release`, then drains the downloads. The engine is
/// released before the long download phase on purpose: the credentials are
/// not needed once the URLs exist.
pub async fn execute_job_list(
    ctx: &RegionContext,
    manager: &PackageManager,
    mut engine: SessionEngine,
    jobs: Vec<DownloadTask>,
    on_release: impl FnOnce(&RegionContext, SessionEngine) -> Result<()>,
) -> Result<()> {
    let names: Vec<String> = jobs.iter().map(|j| j.name().to_string()).collect();
    let ret = engine.get_pack_url(&names).await?;
    let user_agent = engine.user_agent().to_string();
    on_release(ctx, engine)?;

    ensure!(ret.return_code == 0, "failed to get the url list");
    let url_list = ret.url_list().context("url_list missing from response")?;
    ensure!(
        url_list.len() == jobs.len(),
        "url list length {} does not match job count {}",
        url_list.len(),
        jobs.len()
    );

    download_all(manager, jobs.into_iter().zip(url_list).collect(), &user_agent).await
}

/// Runs the task queue with a bounded pool. All workers share one HTTP
/// client and the manager's present-set.
pub async fn download_all(
    manager: &PackageManager,
    jobs: Vec<(DownloadTask, String)>,
    user_agent: &str,
) -> Result<()> {
    let workers = if std::env::var_os(SEQUENTIAL_ENV).is_some() {
        1
    } else {
        DEFAULT_WORKERS.min(jobs.len().max(1))
    };
    let total = jobs.len();

    let client = reqwest::Client::builder()
        .user_agent(user_agent)
        .build()
        .context("failed to build HTTP client")?;
    let queue = Arc::new(Mutex::new(jobs.into_iter().collect::<VecDeque<_>>()));
    let cancel = CancellationToken::new();
    let resolver = Arc::new(DestinationResolver {
        last_root: manager.destination_root().to_path_buf(),
    });

    let mut set = JoinSet::new();
    for _ in 0..workers {
        let client = client.clone();
        let queue = Arc::clone(&queue);
        let cancel = cancel.clone();
        let state = Arc::clone(&manager.package_state);
        let roots = Arc::clone(&resolver);

        set.spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    bail!("cancelled");
                }
                let next = queue.lock().expect("queue lock poisoned").pop_front();
                let Some((task, url)) = next else {
                    return Ok(());
                };
                let left = queue.lock().expect("queue lock poisoned").len();
                info!("Begin retrieving {}, {left} left...", task.name());

                let result = run_task(&client, &roots, &state, &task, &url, &cancel).await;
                if let Err(e) = result {
                    cancel.cancel();
                    return Err(ClientError::DownloadFailure {
                        name: task.name().to_string(),
                        detail: format!("{e:#}"),
                    }
                    .into());
                }
            }
        });
    }

    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            },
            Err(e) => {
                first_error.get_or_insert(anyhow::anyhow!("worker panicked: {e}"));
            },
        }
    }

    match first_error {
        None => {
            debug!("all {total} download tasks completed");
            Ok(())
        },
        Some(e) => Err(e),
    }
}

/// Where new packages land: `<root>/pkg<first letter>/<name>`.
#[derive(Debug)]
struct DestinationResolver {
    last_root: std::path::PathBuf,
}

impl DestinationResolver {
    fn destination(&self, pack: &str) -> Result<std::path::PathBuf> {
        let first = pack.chars().next().context("package name is empty")?;
        Ok(self.last_root.join(format!("pkg{first}")).join(pack))
    }
}

async fn run_task(
    client: &reqwest::Client,
    dests: &DestinationResolver,
    state: &dashmap::DashSet<String>,
    task: &DownloadTask,
    url: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let rsp = client
        .get(url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .with_context(|| format!("GET failed for {}", task.name()))?;
    let mut stream = rsp.bytes_stream();

    match task {
        DownloadTask::Leaf(pack) => {
            let dest = dests.destination(&pack.name)?;
            let mut file = tokio::fs::File::create(&dest)
                .await
                .with_context(|| format!("cannot create {dest:?}"))?;
            while let Some(chunk) = stream.next().await {
                if cancel.is_cancelled() {
                    bail!("cancelled");
                }
                let chunk = chunk.context("body stream failed")?;
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            state.insert(pack.name.clone());
        },
        DownloadTask::Meta { name, splits } => {
            ensure!(
                meta_list_is_monotonic(splits),
                "metapackage {name} split list is not monotonic"
            );

            let mut offset: u64 = 0;
            let mut pending = Bytes::new();

            for split in splits {
                // Discard bytes until this split starts.
                while offset < split.offset {
                    if pending.is_empty() {
                        pending = next_chunk(&mut stream, cancel)
                            .await?
                            .with_context(|| {
                                format!("{name}: stream ended before {}", split.name)
                            })?;
                    }
                    let skip = pending.len().min((split.offset - offset) as usize);
                    pending.advance(skip);
                    offset += skip as u64;
                }
                ensure!(
                    offset == split.offset,
                    "{name}: {} not aligned at start",
                    split.name
                );

                let dest = dests.destination(&split.name)?;
                let mut file = tokio::fs::File::create(&dest)
                    .await
                    .with_context(|| format!("cannot create {dest:?}"))?;
                let mut rem = split.size;
                while rem > 0 {
                    if pending.is_empty() {
                        pending = next_chunk(&mut stream, cancel)
                            .await?
                            .with_context(|| {
                                format!("{name}: stream ended inside {}", split.name)
                            })?;
                    }
                    let take = pending.len().min(rem as usize);
                    file.write_all(&pending[..take]).await?;
                    pending.advance(take);
                    offset += take as u64;
                    rem -= take as u64;
                }
                file.flush().await?;
                state.insert(split.name.clone());
                debug!("    {}...", split.name);
            }
            // Remaining body bytes are discarded with the stream.
        },
    }
    Ok(())
}

async fn next_chunk<S>(stream: &mut S, cancel: &CancellationToken) -> Result<Option<Bytes>>
where S: futures::Stream<Item = reqwest::Result<Bytes>> + Unpin {
    if cancel.is_cancelled() {
        bail!("cancelled");
    }
    match stream.next().await {
        None => Ok(None),
        Some(chunk) => Ok(Some(chunk.context("body stream failed")?)),
    }
}
