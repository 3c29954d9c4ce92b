use std::path::Path;

use anyhow::Result;
use ice_client_rs::pkg::{
    download,
    manager::{DownloadTask, PackageDownload, PackageManager},
};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

/// Minimal asset DB so a manager can be constructed around a scratch cache.
fn empty_asset_db(path: &Path) -> Result<()> {
    let db = rusqlite::Connection::open(path)?;
    db.execute_batch(
        "CREATE TABLE m_asset_package (package_key TEXT);
         CREATE TABLE m_asset_package_mapping (
             package_key TEXT, pack_name TEXT, file_size INTEGER,
             metapack_name TEXT, metapack_offset INTEGER);",
    )?;
    Ok(())
}

fn scratch_manager(dir: &Path) -> Result<PackageManager> {
    let db_path = dir.join("asset.db");
    empty_asset_db(&db_path)?;
    let cache = dir.join("cache");
    std::fs::create_dir_all(&cache)?;
    PackageManager::new(&db_path, vec![cache])
}

fn split(name: &str, size: u64, offset: u64) -> PackageDownload {
    PackageDownload {
        name: name.to_string(),
        size,
        offset,
    }
}

#[tokio::test]
async fn test_meta_demux_writes_ranges_and_discards_gaps() -> Result<()> {
    let body: Vec<u8> = (0..500u32).map(|i| (i % 256) as u8).collect();

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pack/meta0"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let manager = scratch_manager(dir.path())?;

    let task = DownloadTask::Meta {
        name: "meta0".to_string(),
        splits: vec![
            split("a1", 100, 0),
            split("b2", 200, 100),
            split("c3", 50, 400),
        ],
    };
    let url = format!("{}/pack/meta0", server.uri());
    download::download_all(&manager, vec![(task, url)], "testsuite/1").await?;

    let cache = dir.path().join("cache");
    assert_eq!(std::fs::read(cache.join("pkga").join("a1"))?, &body[0..100]);
    assert_eq!(std::fs::read(cache.join("pkgb").join("b2"))?, &body[100..300]);
    assert_eq!(std::fs::read(cache.join("pkgc").join("c3"))?, &body[400..450]);

    // Bytes [300, 400) and [450, 500) went nowhere.
    for entry in std::fs::read_dir(cache.join("pkgm"))? {
        panic!("unexpected file in pkgm: {:?}", entry?.path());
    }

    for name in ["a1", "b2", "c3"] {
        assert!(manager.package_state.contains(name), "{name} not tracked");
    }
    Ok(())
}

#[tokio::test]
async fn test_leaf_download_writes_whole_file() -> Result<()> {
    let body = b"leaf package payload".to_vec();

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pack/a9"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let manager = scratch_manager(dir.path())?;

    let task = DownloadTask::Leaf(split("a9", body.len() as u64, 0));
    let url = format!("{}/pack/a9", server.uri());
    download::download_all(&manager, vec![(task, url)], "testsuite/1").await?;

    assert_eq!(
        std::fs::read(dir.path().join("cache").join("pkga").join("a9"))?,
        body
    );
    assert!(manager.package_state.contains("a9"));
    Ok(())
}

#[tokio::test]
async fn test_failed_task_fails_the_job() -> Result<()> {
    let server = MockServer::start().await;
    // Nothing mounted: the transfer 404s.

    let dir = tempfile::tempdir()?;
    let manager = scratch_manager(dir.path())?;

    let task = DownloadTask::Leaf(split("b7", 10, 0));
    let url = format!("{}/pack/b7", server.uri());
    let result = download::download_all(&manager, vec![(task, url)], "testsuite/1").await;

    assert!(result.is_err());
    assert!(!manager.package_state.contains("b7"));
    Ok(())
}

#[tokio::test]
async fn test_non_monotonic_splits_are_rejected() -> Result<()> {
    let body = vec![0u8; 100];
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pack/meta1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let manager = scratch_manager(dir.path())?;

    let task = DownloadTask::Meta {
        name: "meta1".to_string(),
        splits: vec![split("a1", 50, 0), split("b2", 50, 25)],
    };
    let url = format!("{}/pack/meta1", server.uri());
    let result = download::download_all(&manager, vec![(task, url)], "testsuite/1").await;
    assert!(result.is_err(), "overlapping splits must fail the task");
    Ok(())
}
