use std::{collections::HashMap, path::Path};

use ice_client_rs::{
    cfg::config::{RegionTable, ServerProfile},
    ctx,
};
use serde_json::{Value, json};

/// 1024-bit test key; OAEP(SHA-1) leaves room for the 32-byte nonce.
pub const TEST_PUBLIC_KEY: &str = "-----BEGIN PUBLIC KEY-----\n\
MIGfMA0GCSqGSIb3DQEBAQUAA4GNADCBiQKBgQC/ZUSWq8LCuF2JclEp6uuW9+yd\n\
dLQvb2420+F8rxIF8+W53BiF8g9m6nCETdRw7RVnzNABevMndCCTD6oQ6a2w0Qpo\n\
KeT26578UCWtGp74NGg2Q2fHYFMAhTytVk48qO4ViCN3snFs0AURU06niM98MIcE\n\
Unj9vj6kOBlOGv4JWQIDAQAB\n\
-----END PUBLIC KEY-----\n";

pub const TEST_MASTER_KEYS: [u32; 3] = [1, 2, 3];

/// A profile pointed at a mock server, no mix keys, implicit language.
pub fn test_profile(root: &str) -> ServerProfile {
    ServerProfile {
        root: root.trim_end_matches('/').to_string(),
        user_agent: "testsuite/1 CFNetwork/0".to_string(),
        bundle_version: "9.9.9".to_string(),
        bootstrap_key: "0123456789abcdef".to_string(),
        session_mixkey: Vec::new(),
        public_key: TEST_PUBLIC_KEY.to_string(),
        master_keys: TEST_MASTER_KEYS,
        language: None,
        additional_languages: Vec::new(),
    }
}

pub fn test_table(root: &str) -> RegionTable {
    let mut regions = HashMap::new();
    regions.insert("test".to_string(), vec![test_profile(root)]);
    RegionTable { regions }
}

/// The API envelope: `[server_time_ms, master_version, return_code, app_data]`.
pub fn api_tuple(master_version: &str, return_code: i64, app_data: Value) -> Value {
    json!([1_700_000_000_000i64, master_version, return_code, app_data])
}

/// Builds manifest bytes: 20-byte leading hash, version, lang, entries of
/// `(name, clear_sha_hex, encrypted_sha_20_bytes, size)`.
pub fn manifest_bytes(
    version: &str,
    lang: &str,
    entries: &[(&str, &str, [u8; 20], u32)],
) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&[0x5A; 20]);
    buf.push(version.len() as u8);
    buf.extend_from_slice(version.as_bytes());
    buf.push(lang.len() as u8);
    buf.extend_from_slice(lang.as_bytes());
    buf.push(entries.len() as u8);
    for (name, sha, _, _) in entries {
        buf.push(name.len() as u8);
        buf.extend_from_slice(name.as_bytes());
        buf.push(sha.len() as u8);
        buf.extend_from_slice(sha.as_bytes());
    }
    for (_, _, enc_sha, size) in entries {
        buf.extend_from_slice(enc_sha);
        buf.extend_from_slice(&size.to_le_bytes());
    }
    buf
}

/// Points the storage root at a scratch directory. Callers run `#[serial]`.
pub fn set_storage(dir: &Path) {
    // Safety: tests touching the environment are serialized.
    unsafe { std::env::set_var(ctx::STORAGE_ENV, dir) };
}
