use anyhow::Result;
use ice_client_rs::{
    crypto::hwdecrypt::{self, Keyset},
    manifest::Manifest,
};

use super::load_fixture;

#[test]
fn test_per_file_keys_xor_master_keys() -> Result<()> {
    let bytes = load_fixture("tests/fixtures/manifest_single.hex")?;
    let manifest = Manifest::parse(&bytes, [0xDEAD_BEEF, 0xCAFE_BABE, 0x1234_5678])?;

    // Content hash 1122334455667788aabbccddeeff00...
    let keys = manifest.files[0].keys()?;
    assert_eq!(keys[0], 0xDEAD_BEEF ^ 0x1122_3344);
    assert_eq!(keys[1], 0xCAFE_BABE ^ 0x5566_7788);
    assert_eq!(keys[2], 0x1234_5678 ^ 0xAABB_CCDD);
    Ok(())
}

#[test]
fn test_keyset_streams_independent_of_chunking() -> Result<()> {
    let bytes = load_fixture("tests/fixtures/manifest_single.hex")?;
    let manifest = Manifest::parse(&bytes, [1, 2, 3])?;
    let file_keys = manifest.files[0].keys()?;

    let data: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();

    let mut whole = data.clone();
    let mut keys = Keyset::new(file_keys);
    hwdecrypt::decrypt(&mut keys, &mut whole);

    let mut chunked = data;
    let mut keys = Keyset::new(file_keys);
    for chunk in chunked.chunks_mut(7) {
        hwdecrypt::decrypt(&mut keys, chunk);
    }
    assert_eq!(whole, chunked);
    Ok(())
}
