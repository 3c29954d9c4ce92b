// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Cryptographic primitives of the wire protocol: the RSA-OAEP login mask,
//! HMAC-SHA1 request signing, and the XOR pad used for key recovery.

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use rsa::{Oaep, RsaPublicKey, pkcs8::DecodePublicKey};
use sha1::Sha1;

pub mod hwdecrypt;

type HmacSha1 = Hmac<Sha1>;

/// Encrypts a 32-byte nonce with RSA-OAEP (MGF1-SHA1, SHA-1, no label).
pub fn rsa_oaep_encrypt(public_key_pem: &str, nonce: &[u8]) -> Result<Vec<u8>> {
    let key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .context("server profile public key does not parse")?;
    let padding = Oaep::new::<Sha1>();
    key.encrypt(&mut rand::thread_rng(), padding, nonce)
        .context("OAEP encryption failed")
}

/// HMAC-SHA1 over the concatenation of `parts`, as lowercase hex.
pub fn hmac_sha1_hex(key: &[u8], parts: &[&[u8]]) -> String {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts keys of any length");
    for part in parts {
        mac.update(part);
    }
    hex::encode(mac.finalize().into_bytes())
}

/// Bytewise XOR over the common prefix of `a` and `b`.
pub fn xor_pad(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect()
}
