// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use reqwest::header::HeaderMap;
use serde_json::Value;

/// One decoded API response. Every call returns the same envelope:
/// `[server_time_ms, master_version, return_code, app_data]`.
///
/// `return_code` is business-level and is never raised as an error here;
/// callers inspect it and decide. `app_data` stays an untyped tree; the
/// accessors below cover the handful of paths the client reads.
#[derive(Debug)]
pub struct ApiReturn {
    pub headers: HeaderMap,
    pub return_code: i64,
    pub app_data: Value,
    /// Server wall clock, seconds.
    pub server_time: f64,
}

impl ApiReturn {
    /// A response standing in for an unparseable body.
    pub fn malformed(headers: HeaderMap) -> Self {
        Self {
            headers,
            return_code: -1,
            app_data: Value::Null,
            server_time: 0.0,
        }
    }

    fn drill(&self, path: &[&str]) -> Option<&Value> {
        let mut level = &self.app_data;
        for key in path {
            level = level.get(key)?;
        }
        Some(level)
    }

    pub fn user_id(&self) -> Option<i64> {
        self.drill(&["user_id"])?.as_i64()
    }

    pub fn authorization_key(&self) -> Option<&str> {
        self.drill(&["authorization_key"])?.as_str()
    }

    pub fn authorization_count(&self) -> Option<i64> {
        self.drill(&["authorization_count"])?.as_i64()
    }

    pub fn session_key(&self) -> Option<&str> {
        self.drill(&["session_key"])?.as_str()
    }

    pub fn device_token(&self) -> Option<&str> {
        self.drill(&["user_model", "user_status", "device_token"])?
            .as_str()
    }

    pub fn tutorial_end_at(&self) -> Option<i64> {
        self.drill(&["user_model", "user_status", "tutorial_end_at"])?
            .as_i64()
    }

    pub fn url_list(&self) -> Option<Vec<String>> {
        self.drill(&["url_list"])?
            .as_array()?
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect()
    }
}
