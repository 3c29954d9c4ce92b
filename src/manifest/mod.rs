// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Codec for the binary master manifest.
//!
//! Little-endian layout:
//!
//! ```text
//! +----------------------+  20 bytes, opaque (not verified)
//! | leading hash         |
//! +----------------------+
//! | version   (len+ascii)|  1-byte length prefix
//! | language  (len+ascii)|
//! | count N   (1 byte)   |
//! +----------------------+
//! | N x name, clear sha  |  each a length-prefixed ASCII string
//! +----------------------+
//! | N x tail entry       |  20-byte raw encrypted SHA-1 + u32 size
//! +----------------------+
//! ```

use anyhow::{Context, Result, bail, ensure};
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::{LittleEndian, U32},
};

/// Fixed third key used for asset-index texture rows by extraction tooling.
pub const TEXTURE_TAIL_KEY: u32 = 0x3039;

/// One manifest entry with everything needed to fetch, decrypt, and verify
/// the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReference {
    /// Master version this entry belongs to.
    pub version: String,
    /// Logical file name, e.g. `masterdata.db`.
    pub name: String,
    /// SHA-1 of the decrypted content, 40 hex chars.
    pub sha: String,
    /// SHA-1 of the encrypted stream, 40 hex chars.
    pub encrypted_sha: String,
    /// Encrypted size in bytes.
    pub size: u32,
    master_keys: [u32; 3],
}

/// Raw trailing record: encrypted SHA-1 followed by the size.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
struct RawTailEntry {
    encrypted_sha: [u8; 20],
    size: U32<LittleEndian>,
}

impl FileReference {
    /// Decryption keys for this file: each master key XORed with the next
    /// eight hex chars of the clear content hash.
    pub fn keys(&self) -> Result<[u32; 3]> {
        ensure!(
            self.sha.len() >= 24,
            "content hash of {} is too short for key derivation",
            self.name
        );
        let mut keys = [0u32; 3];
        for (i, key) in keys.iter_mut().enumerate() {
            let chunk = &self.sha[8 * i..8 * (i + 1)];
            let derived = u32::from_str_radix(chunk, 16).with_context(|| {
                format!("content hash of {} is not hex: {chunk}", self.name)
            })?;
            *key = self.master_keys[i] ^ derived;
        }
        Ok(keys)
    }

    /// Key variant for asset-index texture rows: the third key is a fixed
    /// constant instead of being derived from the hash.
    pub fn texture_keys(&self) -> Result<[u32; 3]> {
        let mut keys = self.keys()?;
        keys[2] = TEXTURE_TAIL_KEY;
        Ok(keys)
    }
}

/// Parsed master manifest: version, language, and the ordered file list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Opaque 20-byte hash the file starts with. Retained, never verified.
    pub leading_hash: [u8; 20],
    pub version: String,
    pub lang: String,
    pub files: Vec<FileReference>,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn eat(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(
            self.pos + n <= self.data.len(),
            "manifest truncated at offset {} (need {} more bytes)",
            self.pos,
            n
        );
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn ubyte(&mut self) -> Result<u8> {
        Ok(self.eat(1)?[0])
    }

    fn prefix_string(&mut self) -> Result<String> {
        let len = self.ubyte()? as usize;
        let raw = self.eat(len)?;
        ensure!(raw.is_ascii(), "manifest string is not ASCII");
        Ok(String::from_utf8_lossy(raw).into_owned())
    }
}

impl Manifest {
    /// Parses manifest bytes; `master_keys` come from the server profile and
    /// seed per-file key derivation.
    pub fn parse(bytes: &[u8], master_keys: [u32; 3]) -> Result<Self> {
        let mut cur = Cursor {
            data: bytes,
            pos: 0,
        };

        let mut leading_hash = [0u8; 20];
        leading_hash.copy_from_slice(cur.eat(20)?);

        let version = cur.prefix_string()?;
        let lang = cur.prefix_string()?;

        let count = cur.ubyte()? as usize;
        let mut files = Vec::with_capacity(count);
        for _ in 0..count {
            let name = cur.prefix_string()?;
            let sha = cur.prefix_string()?;
            ensure!(
                sha.len() == 40,
                "content hash of {name} is not 40 hex chars"
            );
            files.push(FileReference {
                version: version.clone(),
                name,
                sha,
                encrypted_sha: String::new(),
                size: 0,
                master_keys,
            });
        }

        for file in &mut files {
            let raw = RawTailEntry::read_from_bytes(cur.eat(size_of::<RawTailEntry>())?)
                .map_err(|_| anyhow::anyhow!("manifest tail entry is malformed"))?;
            file.encrypted_sha = hex::encode(raw.encrypted_sha);
            file.size = raw.size.get();
        }

        Ok(Self {
            leading_hash,
            version,
            lang,
            files,
        })
    }

    /// Re-encodes the manifest in the on-wire layout. Inverse of [`parse`]
    /// for any manifest that was parsed from bytes.
    ///
    /// [`parse`]: Manifest::parse
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        ensure!(self.files.len() <= u8::MAX as usize, "too many entries");

        let mut out = Vec::with_capacity(64 + self.files.len() * 96);
        out.extend_from_slice(&self.leading_hash);
        push_prefix_string(&mut out, &self.version)?;
        push_prefix_string(&mut out, &self.lang)?;
        out.push(self.files.len() as u8);

        for file in &self.files {
            push_prefix_string(&mut out, &file.name)?;
            push_prefix_string(&mut out, &file.sha)?;
        }
        for file in &self.files {
            let mut encrypted_sha = [0u8; 20];
            hex::decode_to_slice(&file.encrypted_sha, &mut encrypted_sha)
                .with_context(|| format!("encrypted sha of {} is not hex", file.name))?;
            let raw = RawTailEntry {
                encrypted_sha,
                size: U32::new(file.size),
            };
            out.extend_from_slice(raw.as_bytes());
        }
        Ok(out)
    }
}

fn push_prefix_string(out: &mut Vec<u8>, s: &str) -> Result<()> {
    ensure!(s.is_ascii(), "manifest string '{s}' is not ASCII");
    match u8::try_from(s.len()) {
        Ok(len) => {
            out.push(len);
            out.extend_from_slice(s.as_bytes());
            Ok(())
        },
        Err(_) => bail!("manifest string '{s}' exceeds 255 bytes"),
    }
}
