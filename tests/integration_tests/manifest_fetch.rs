use anyhow::Result;
use ice_client_rs::{cfg::enums::Platform, ctx::Context as RegionContext, masters};
use serial_test::serial;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

use super::common::{manifest_bytes, set_storage, test_table};

#[tokio::test]
#[serial]
async fn test_manifest_fetch_and_disk_cache() -> Result<()> {
    let server = MockServer::start().await;
    let bytes = manifest_bytes(
        "mv1",
        "ja",
        &[(
            "asset_i_ja_0.db",
            "1122334455667788aabbccddeeff001199887766",
            [0xCD; 20],
            4,
        )],
    );
    Mock::given(method("GET"))
        .and(path("/static/mv1/masterdata_i_ja"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let storage = tempfile::tempdir()?;
    set_storage(storage.path());
    let table = test_table(&server.uri());
    let ctx = RegionContext::new(&table, "test", None, "test_store")?;

    let first =
        masters::download_remote_manifest(&ctx, "mv1", false, Platform::Ios, None).await?;
    assert_eq!(first.version, "mv1");
    assert_eq!(first.files.len(), 1);

    // Cached on disk next to the auxinfo sidecar.
    let dir = ctx.masters.join("mv1");
    assert_eq!(std::fs::read(dir.join("masterdata_i_ja"))?, bytes);
    let aux: masters::AuxInfo =
        serde_json::from_slice(&std::fs::read(dir.join("auxinfo_i"))?)?;
    assert_eq!(aux.bundle_version, "9.9.9");

    // Second fetch is served from disk; the mock's expect(1) verifies no
    // further HTTP round-trip happened.
    let second =
        masters::download_remote_manifest(&ctx, "mv1", false, Platform::Ios, None).await?;
    assert_eq!(second, first);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_manifest_fetch_propagates_http_failure() -> Result<()> {
    let server = MockServer::start().await;

    let storage = tempfile::tempdir()?;
    set_storage(storage.path());
    let table = test_table(&server.uri());
    let ctx = RegionContext::new(&table, "test", None, "test_store")?;

    // Nothing mounted: the static root answers 404.
    let result =
        masters::download_remote_manifest(&ctx, "mv404", false, Platform::Ios, None).await;
    assert!(result.is_err());
    Ok(())
}
