// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fmt, str::FromStr};

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Client platform reported in every request's `p=` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Ios,
    Android,
}

impl Platform {
    /// Single-letter wire code.
    pub fn code(self) -> &'static str {
        match self {
            Platform::Ios => "i",
            Platform::Android => "a",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Platform {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "i" | "ios" | "iOS" => Ok(Platform::Ios),
            "a" | "android" | "Android" => Ok(Platform::Android),
            other => bail!("not a platform code: {other}"),
        }
    }
}

/// Where the 32-byte login mask nonce comes from.
///
/// The wire protocol works with any value because the client keeps its own
/// copy for the XOR recovery; `Zero` exists for byte-exact replay of captured
/// traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NonceSource {
    #[default]
    Random,
    Zero,
}
