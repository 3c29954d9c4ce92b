use std::io::Write as _;

use anyhow::{Context, Result};
use flate2::{Compression, write::DeflateEncoder};
use ice_client_rs::{
    crypto::hwdecrypt::{self, Keyset},
    ctx::Context as RegionContext,
    manifest::Manifest,
    masters,
};
use serial_test::serial;
use sha1::{Digest, Sha1};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

use super::common::{TEST_MASTER_KEYS, manifest_bytes, set_storage, test_table};

/// Builds the encrypted wire form of `plaintext` exactly the way the server
/// does: raw deflate, then the per-file stream cipher (an involution).
fn encrypt_fixture(plaintext: &[u8], keys: [u32; 3]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(plaintext)?;
    let mut encrypted = encoder.finish()?;
    let mut keyset = Keyset::new(keys);
    hwdecrypt::decrypt(&mut keyset, &mut encrypted);
    Ok(encrypted)
}

#[tokio::test]
#[serial]
async fn test_download_one_tees_decrypts_and_validates() -> Result<()> {
    let plaintext: Vec<u8> = (0..3000u32).flat_map(|i| i.to_le_bytes()).collect();
    let clear_sha = hex::encode(Sha1::digest(&plaintext));

    // First parse with a placeholder encrypted sha, just to derive the keys.
    let probe = Manifest::parse(
        &manifest_bytes("mv1", "ja", &[("data.db", &clear_sha, [0; 20], 0)]),
        TEST_MASTER_KEYS,
    )?;
    let keys = probe.files[0].keys()?;

    let encrypted = encrypt_fixture(&plaintext, keys)?;
    let mut enc_sha = [0u8; 20];
    enc_sha.copy_from_slice(&Sha1::digest(&encrypted));

    let manifest = Manifest::parse(
        &manifest_bytes(
            "mv1",
            "ja",
            &[("data.db", &clear_sha, enc_sha, encrypted.len() as u32)],
        ),
        TEST_MASTER_KEYS,
    )?;
    let file = &manifest.files[0];

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/static/mv1/data.db"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(encrypted.clone()))
        .mount(&server)
        .await;

    let storage = tempfile::tempdir()?;
    set_storage(storage.path());
    let table = test_table(&server.uri());
    let ctx = RegionContext::new(&table, "test", None, "test_store")?;

    assert!(!masters::file_is_valid(&ctx, file).await?);
    masters::download_one(&ctx, file).await?;

    let dir = ctx.masters.join("mv1");
    assert_eq!(std::fs::read(dir.join("data.db"))?, plaintext);
    assert_eq!(std::fs::read(dir.join("enc").join("data.db"))?, encrypted);
    assert!(masters::file_is_valid(&ctx, file).await?);

    // The atomic publish leaves no temp files behind.
    for check_dir in [&dir, &dir.join("enc")] {
        let leftovers: Vec<_> = std::fs::read_dir(check_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("._tmp_"))
            .collect();
        assert!(leftovers.is_empty(), "temp files leaked: {leftovers:?}");
    }
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_corrupt_sidecar_fails_validation() -> Result<()> {
    let plaintext = b"integrity matters".to_vec();
    let clear_sha = hex::encode(Sha1::digest(&plaintext));
    let manifest = Manifest::parse(
        &manifest_bytes("mv1", "ja", &[("data.db", &clear_sha, [0xEE; 20], 17)]),
        TEST_MASTER_KEYS,
    )?;
    let file = &manifest.files[0];

    let server = MockServer::start().await;
    let storage = tempfile::tempdir()?;
    set_storage(storage.path());
    let table = test_table(&server.uri());
    let ctx = RegionContext::new(&table, "test", None, "test_store")?;

    let enc_dir = ctx.masters.join("mv1").join("enc");
    std::fs::create_dir_all(&enc_dir)?;
    std::fs::write(enc_dir.join("data.db"), b"not the real bytes")?;

    assert!(
        !masters::file_is_valid(&ctx, file).await?,
        "sidecar with the wrong hash must be invalid"
    );
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_decrypt_offline_round_trip() -> Result<()> {
    let plaintext = b"offline decryption of a cached master file".to_vec();
    let clear_sha = hex::encode(Sha1::digest(&plaintext));

    let probe = Manifest::parse(
        &manifest_bytes("mv1", "ja", &[("data.db", &clear_sha, [0; 20], 0)]),
        TEST_MASTER_KEYS,
    )?;
    let keys = probe.files[0].keys()?;
    let encrypted = encrypt_fixture(&plaintext, keys)?;
    let mut enc_sha = [0u8; 20];
    enc_sha.copy_from_slice(&Sha1::digest(&encrypted));

    let dir = tempfile::tempdir()?;
    let manifest_raw = manifest_bytes(
        "mv1",
        "ja",
        &[("data.db", &clear_sha, enc_sha, encrypted.len() as u32)],
    );
    std::fs::write(dir.path().join("masterdata_i_ja"), &manifest_raw)?;
    std::fs::write(
        dir.path().join("auxinfo_i"),
        serde_json::to_vec(&serde_json::json!({"bundle_version": "9.9.9"}))?,
    )?;
    std::fs::write(dir.path().join("data.db"), &encrypted)?;

    let table = test_table("http://unused.example");
    let out = masters::decrypt_offline(&table, "test", &dir.path().join("data.db"))?;
    assert_eq!(std::fs::read(&out)?, plaintext);
    assert_eq!(
        out.file_name().context("no name")?.to_string_lossy(),
        "data.db.dec"
    );
    Ok(())
}
