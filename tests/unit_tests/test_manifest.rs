use anyhow::Result;
use ice_client_rs::manifest::Manifest;

use super::load_fixture;

const MASTER_KEYS: [u32; 3] = [0xDEAD_BEEF, 0xCAFE_BABE, 0x1234_5678];

#[test]
fn test_manifest_parse_single_entry() -> Result<()> {
    let bytes = load_fixture("tests/fixtures/manifest_single.hex")?;
    let manifest = Manifest::parse(&bytes, MASTER_KEYS)?;

    assert_eq!(manifest.version, "1.0.0");
    assert_eq!(manifest.lang, "ja");
    assert_eq!(manifest.files.len(), 1);

    let file = &manifest.files[0];
    assert_eq!(file.name, "a.db");
    assert_eq!(file.sha, "1122334455667788aabbccddeeff001199887766");
    assert_eq!(file.encrypted_sha, "cd".repeat(20));
    assert_eq!(file.size, 4);
    Ok(())
}

#[test]
fn test_manifest_round_trip() -> Result<()> {
    let bytes = load_fixture("tests/fixtures/manifest_single.hex")?;
    let manifest = Manifest::parse(&bytes, MASTER_KEYS)?;

    let encoded = manifest.to_bytes()?;
    assert_eq!(encoded, bytes, "encoder is not the inverse of the parser");
    assert_eq!(Manifest::parse(&encoded, MASTER_KEYS)?, manifest);
    Ok(())
}

#[test]
fn test_manifest_rejects_truncation() -> Result<()> {
    let bytes = load_fixture("tests/fixtures/manifest_single.hex")?;
    for cut in [0, 10, 25, bytes.len() - 1] {
        assert!(
            Manifest::parse(&bytes[..cut], MASTER_KEYS).is_err(),
            "parse of {cut}-byte prefix should fail"
        );
    }
    Ok(())
}
