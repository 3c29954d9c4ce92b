// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use base64::prelude::{BASE64_STANDARD, Engine as _};
use rand::RngCore;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::{
    cfg::{
        config::ServerProfile,
        enums::{NonceSource, Platform},
    },
    crypto::{hmac_sha1_hex, rsa_oaep_encrypt, xor_pad},
    error::ClientError,
    session::{
        endpoints::{self, Behaviour},
        response::ApiReturn,
    },
};

/// Opaque asset state blob sent on masked logins.
pub const DEFAULT_ASSET_STATE: &str =
    "AW9YpftGljWY/fnzPXciMnWWoSOIQXcdctowkQPUfpAjasaYRfvSidpw1D2\
     lmb6Ns2/LLhnLAAXMWlpKtyOIQpFTu3CmZHkVSg==";

/// Snapshot of a healthy session. Hydrating a fresh engine from this skips
/// the login round-trip entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FastResumeData {
    /// Base64 of the 32-byte session key.
    pub session_key: String,
    pub request_id: u64,
    pub master_version: Option<String>,
    pub device_token: Option<String>,
}

/// The session protocol engine.
///
/// One instance drives one sequential request stream: every request is
/// signed with the current key and carries a strictly increasing `id` query
/// parameter. The engine is not re-entrant; at most one request may be in
/// flight at a time.
#[derive(Debug)]
pub struct SessionEngine {
    profile: Arc<ServerProfile>,
    platform: Platform,
    nonce_source: NonceSource,

    user_id: Option<i64>,
    authorization_key: Option<String>,
    auth_count: i64,

    session_key: Vec<u8>,
    request_id: u64,
    master_version: Option<String>,
    device_token: Option<String>,
    has_session: bool,
    has_time: bool,
    fast_resume_in_progress: bool,

    http: reqwest::Client,
}

impl SessionEngine {
    /// Creates an engine in the unbound state (bootstrap-key signing). Both
    /// of `user_id` and `auth_key` must be given, or neither.
    pub fn new(
        profile: Arc<ServerProfile>,
        platform: Platform,
        user_id: Option<i64>,
        auth_key: Option<&str>,
        auth_count: i64,
    ) -> Result<Self> {
        ensure!(
            user_id.is_some() == auth_key.is_some(),
            "user_id and auth_key must be provided together"
        );

        let http = build_http(&profile)?;
        let mut engine = Self {
            profile,
            platform,
            nonce_source: NonceSource::default(),
            user_id: None,
            authorization_key: None,
            auth_count: 0,
            session_key: Vec::new(),
            request_id: 1,
            master_version: None,
            device_token: None,
            has_session: false,
            has_time: false,
            fast_resume_in_progress: false,
            http,
        };
        engine.set_login(user_id, auth_key, auth_count)?;
        Ok(engine)
    }

    /// Overrides where login mask nonces come from.
    pub fn set_nonce_source(&mut self, source: NonceSource) {
        self.nonce_source = source;
    }

    pub fn user_id(&self) -> Option<i64> {
        self.user_id
    }

    pub fn auth_count(&self) -> i64 {
        self.auth_count
    }

    pub fn master_version(&self) -> Option<&str> {
        self.master_version.as_deref()
    }

    pub fn has_session(&self) -> bool {
        self.has_session
    }

    pub fn user_agent(&self) -> &str {
        &self.profile.user_agent
    }

    /// Resets the engine to the unbound state with new credentials. The
    /// request counter restarts at 1 and any session state is dropped.
    pub fn set_login(
        &mut self,
        user_id: Option<i64>,
        auth_key: Option<&str>,
        auth_count: i64,
    ) -> Result<()> {
        ensure!(
            user_id.is_some() == auth_key.is_some(),
            "user_id and auth_key must be provided together"
        );

        self.user_id = user_id;
        self.auth_count = auth_count;
        match auth_key {
            Some(key) => {
                let decoded = BASE64_STANDARD
                    .decode(key)
                    .context("authorization key is not base64")?;
                ensure!(decoded.len() == 32, "authorization key must be 32 bytes");
                self.session_key = decoded;
                self.authorization_key = Some(key.to_string());
            },
            None => {
                self.session_key = self.profile.bootstrap_key_bytes().to_vec();
                self.authorization_key = None;
            },
        }

        self.request_id = 1;
        self.master_version = None;
        self.device_token = None;
        self.has_session = false;
        self.has_time = false;
        self.fast_resume_in_progress = false;
        self.http = build_http(&self.profile)?;
        Ok(())
    }

    /// Hydrates session state from a resume blob. With `skip_validity_check`
    /// the session is trusted blindly; with `revalidate_immediately` a probe
    /// request decides; otherwise the first live request performs the check.
    pub async fn resume_session(
        &mut self,
        resume: Option<&FastResumeData>,
        skip_validity_check: bool,
        revalidate_immediately: bool,
    ) -> Result<bool> {
        if skip_validity_check && revalidate_immediately {
            return Err(ClientError::InvalidArgument.into());
        }

        let Some(resume) = resume else {
            return Ok(false);
        };

        let decoded = BASE64_STANDARD
            .decode(&resume.session_key)
            .context("resume blob session key is not base64")?;
        ensure!(decoded.len() == 32, "resume blob session key must be 32 bytes");

        self.session_key = decoded;
        self.request_id = resume.request_id;
        self.master_version = resume.master_version.clone();
        self.device_token = resume.device_token.clone();
        self.has_session = true;
        self.has_time = true;
        self.fast_resume_in_progress = false;
        self.http = build_http(&self.profile)?;

        if skip_validity_check {
            debug!("Fast resume: picked up session without check");
            return Ok(true);
        }

        if revalidate_immediately {
            return self.fast_resume_validate(resume).await;
        }

        self.fast_resume_in_progress = true;
        Ok(true)
    }

    async fn fast_resume_validate(&mut self, resume: &FastResumeData) -> Result<bool> {
        let probe = json!({
            // banner fetch type
            "bootstrap_fetch_types": [2],
            "device_token": self.device_token,
        });
        let response = match self
            .default_hit_api(endpoints::BOOTSTRAP_FETCH, &probe, false, false)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("Fast resume: failing because {e:#}");
                return Ok(false);
            },
        };

        if response.return_code != 0 {
            warn!("Fast resume: failing because session check returned non-zero");
            return Ok(false);
        }

        if self.master_version != resume.master_version {
            warn!(
                "Fast resume: master version changed: {:?} -> {:?}; accepting anyway",
                resume.master_version, self.master_version
            );
        }

        debug!("Fast resume: picked up session successfully");
        Ok(true)
    }

    /// Emits the resume blob and consumes the engine; a saved session must
    /// not be reused from this instance.
    pub fn save_session(self) -> Option<FastResumeData> {
        if !self.has_session {
            return None;
        }
        debug!("Save session: this engine is no longer valid past this point");
        Some(FastResumeData {
            session_key: BASE64_STANDARD.encode(&self.session_key),
            request_id: self.request_id,
            master_version: self.master_version,
            device_token: self.device_token,
        })
    }

    /// Dispatches `path` through the flat endpoint table.
    pub async fn call(&mut self, path: &str, payload: Value) -> Result<ApiReturn> {
        let ret = match endpoints::behaviour_for(path) {
            Behaviour::MaskedStartup => self.login_startup(Some(payload)).await,
            Behaviour::MaskedLogin => self.login_login().await,
            Behaviour::MaskedPrelogin => {
                self.fetch_game_service_data_before_login(Some(payload)).await
            },
            Behaviour::Default => self.default_hit_api(path, &payload, false, false).await,
        }?;
        debug!("callout {path} -> {}", ret.return_code);
        Ok(ret)
    }

    // ── signed request plumbing ─────────────────────────────────────────────

    /// Assembles the querystring and advances the request counter.
    fn query(&mut self) -> String {
        let mut q = vec![format!("p={}", self.platform.code())];

        if let Some(mv) = &self.master_version {
            q.push(format!("mv={mv}"));
        }

        q.push(format!("id={}", self.request_id));

        if let Some(uid) = self.user_id {
            q.push(format!("u={uid}"));
        }

        if self.has_time {
            q.push(format!("t={}", chrono::Utc::now().timestamp_millis()));
        }

        if let Some(lang) = &self.profile.language {
            q.push(format!("l={lang}"));
        }

        self.request_id += 1;
        q.join("&")
    }

    /// Signs `payload` for `path_query` and wraps it in the wire envelope
    /// `[<payload>,"<hmac hex>"]`.
    fn bless(&self, path_query: &str, payload: &str) -> String {
        let digest = hmac_sha1_hex(
            &self.session_key,
            &[path_query.as_bytes(), b" ", payload.as_bytes()],
        );
        format!("[{payload},\"{digest}\"]")
    }

    async fn post_signed(&mut self, path: &str, payload: &Value) -> Result<reqwest::Response> {
        let q = self.query();
        let dest = format!("{}{path}?{q}", self.profile.root);
        let payload_json =
            serde_json::to_string(payload).context("payload serialization failed")?;
        let body = self.bless(&format!("{path}?{q}"), &payload_json);

        if std::env::var_os("ICE_DEBUG_REQUESTS").is_some() {
            debug!("request {dest}: {body}");
        }

        self.http
            .post(&dest)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                ClientError::Transport {
                    path: path.to_string(),
                    detail: e.to_string(),
                }
                .into()
            })
    }

    /// Decodes the 4-tuple envelope, updating `has_time` and the engine's
    /// master version on the way.
    async fn extract_response(&mut self, path: &str, rsp: reqwest::Response) -> Result<ApiReturn> {
        let status = rsp.status();
        let headers = rsp.headers().clone();
        if !status.is_success() {
            return Err(ClientError::Transport {
                path: path.to_string(),
                detail: format!("HTTP {status}"),
            }
            .into());
        }

        let body = rsp.bytes().await.map_err(|e| ClientError::Transport {
            path: path.to_string(),
            detail: e.to_string(),
        })?;

        let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
            return Ok(ApiReturn::malformed(headers));
        };

        if std::env::var_os("ICE_DEBUG_RESPONSES").is_some() {
            debug!("response {path}: {payload}");
        }

        let tuple = payload.as_array().filter(|a| a.len() == 4).ok_or(
            ClientError::ProtocolMalformed {
                path: path.to_string(),
            },
        )?;

        let server_time_ms = tuple[0]
            .as_f64()
            .ok_or_else(|| ClientError::ProtocolMalformed {
                path: path.to_string(),
            })?;
        let master_version = tuple[1].as_str().map(str::to_string);
        let return_code = tuple[2]
            .as_i64()
            .ok_or_else(|| ClientError::ProtocolMalformed {
                path: path.to_string(),
            })?;

        self.has_time = true;
        if master_version.is_some() {
            self.master_version = master_version;
            debug!("Set master version to {:?}", self.master_version);
        }

        Ok(ApiReturn {
            headers,
            return_code,
            app_data: tuple[3].clone(),
            server_time: server_time_ms / 1000.0,
        })
    }

    /// The default request path. Fast-resume sessions get one transparent
    /// relogin on a 403; master-version drift is logged and accepted.
    pub async fn default_hit_api(
        &mut self,
        path: &str,
        payload: &Value,
        skip_session_key_check: bool,
        skip_fast_resume: bool,
    ) -> Result<ApiReturn> {
        if !skip_session_key_check && !self.has_session {
            return Err(ClientError::SessionInvalid(
                "establish a session before calling this endpoint".to_string(),
            )
            .into());
        }

        if self.fast_resume_in_progress && !skip_fast_resume {
            let master = self.master_version.clone();

            let mut rsp = self.post_signed(path, payload).await?;
            if rsp.status() == StatusCode::FORBIDDEN {
                warn!("The session has gone invalid.");
                rsp = self.relogin_and_retry(path, payload).await?;
            }
            let ret = self.extract_response(path, rsp).await?;

            if self.master_version != master {
                warn!(
                    "Fast resume: master version changed: {:?} -> {:?}; accepting anyway",
                    master, self.master_version
                );
            }

            self.fast_resume_in_progress = false;
            Ok(ret)
        } else {
            let rsp = self.post_signed(path, payload).await?;
            self.extract_response(path, rsp).await
        }
    }

    /// Re-runs login; on a non-zero return code, resets the auth counter
    /// from the server's value and retries once.
    pub async fn relogin(&mut self) -> Result<ApiReturn> {
        debug!("Retrying login...");
        let ret = self.login_login().await?;
        if ret.return_code != 0 {
            warn!("Login failed, trying to reset auth count...");
            let server_count = ret
                .authorization_count()
                .context("login failure response lacks authorization_count")?;
            let auth_key = self.authorization_key.clone();
            self.set_login(self.user_id, auth_key.as_deref(), server_count + 1)?;
            return self.login_login().await;
        }
        Ok(ret)
    }

    /// 403 recovery: relogin, then re-issue the original request with a
    /// fresh query and signature. The caller extracts the response.
    async fn relogin_and_retry(
        &mut self,
        path: &str,
        payload: &Value,
    ) -> Result<reqwest::Response> {
        self.relogin().await?;
        self.post_signed(path, payload).await
    }

    // ── masked endpoints ────────────────────────────────────────────────────

    fn generate_nonce(&self) -> [u8; 32] {
        match self.nonce_source {
            NonceSource::Zero => [0u8; 32],
            NonceSource::Random => {
                let mut nonce = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut nonce);
                nonce
            },
        }
    }

    fn masked_nonce(&self) -> Result<([u8; 32], String)> {
        let nonce = self.generate_nonce();
        let mask = rsa_oaep_encrypt(&self.profile.public_key, &nonce)?;
        Ok((nonce, BASE64_STANDARD.encode(mask)))
    }

    /// Account creation. The server's `authorization_key` is its mixing
    /// value; the real key is recovered by XOR with our nonce and written
    /// back into the returned payload.
    pub async fn login_startup(&mut self, extra: Option<Value>) -> Result<ApiReturn> {
        let (nonce, mask) = self.masked_nonce()?;

        let mut params = json!({
            "mask": mask,
            "asset_state": DEFAULT_ASSET_STATE,
        });
        if let Some(Value::Object(extra)) = extra {
            let obj = params.as_object_mut().expect("params is an object");
            obj.extend(extra);
        }

        let mut result = self
            .default_hit_api(endpoints::LOGIN_STARTUP, &params, true, false)
            .await?;

        if let Some(server_key) = result.authorization_key().map(str::to_string) {
            let server_mixed = BASE64_STANDARD
                .decode(&server_key)
                .context("server authorization_key is not base64")?;
            let recovered = BASE64_STANDARD.encode(xor_pad(&nonce, &server_mixed));
            self.authorization_key = Some(recovered.clone());
            if let Some(obj) = result.app_data.as_object_mut() {
                obj.insert("authorization_key".to_string(), Value::String(recovered));
            }
        }
        Ok(result)
    }

    /// Full login. Derives the session key from the nonce, the server's
    /// mixing value, and the profile mix keys, in that order.
    pub async fn login_login(&mut self) -> Result<ApiReturn> {
        if self.has_session {
            let auth_key = self.authorization_key.clone();
            self.set_login(self.user_id, auth_key.as_deref(), self.auth_count)?;
        }

        let (nonce, mask) = self.masked_nonce()?;

        let payload = json!({
            "user_id": self.user_id,
            "auth_count": self.auth_count,
            "mask": mask,
            "asset_state": DEFAULT_ASSET_STATE,
        });
        let result = Box::pin(self.default_hit_api(endpoints::LOGIN_LOGIN, &payload, true, true))
            .await?;

        if let Some(server_key) = result.session_key() {
            let server_mixed = BASE64_STANDARD
                .decode(server_key)
                .context("server session_key is not base64")?;
            let mut session_key = xor_pad(&nonce, &server_mixed);
            for mix in self.profile.mix_keys() {
                session_key = xor_pad(&session_key, &mix);
            }
            ensure!(
                session_key.len() == 32,
                "derived session key is {} bytes, expected 32",
                session_key.len()
            );
            ensure!(
                session_key != self.profile.bootstrap_key_bytes(),
                "derived session key equals the bootstrap key"
            );
            self.session_key = session_key;
            debug!("A session has been established.");
            self.has_session = true;
        }

        if let Some(token) = result.device_token() {
            debug!("Device token: {token}");
            self.device_token = Some(token.to_string());
        }

        self.auth_count += 1;
        Ok(result)
    }

    /// Masked fetch available before a session exists.
    pub async fn fetch_game_service_data_before_login(
        &mut self,
        extra: Option<Value>,
    ) -> Result<ApiReturn> {
        let (_nonce, mask) = self.masked_nonce()?;

        let mut params = json!({ "mask": mask });
        if let Some(Value::Object(extra)) = extra {
            let obj = params.as_object_mut().expect("params is an object");
            obj.extend(extra);
        }

        self.default_hit_api(endpoints::DATALINK_FETCH_BEFORE_LOGIN, &params, true, true)
            .await
    }

    // ── typed endpoint wrappers ─────────────────────────────────────────────

    pub async fn terms_agreement(&mut self, terms_version: i64) -> Result<ApiReturn> {
        self.call(
            endpoints::TERMS_AGREEMENT,
            json!({ "terms_version": terms_version }),
        )
        .await
    }

    /// Mints signed download URLs for `pack_names`, order-preserving.
    pub async fn get_pack_url(&mut self, pack_names: &[String]) -> Result<ApiReturn> {
        self.call(
            endpoints::ASSET_GET_PACK_URL,
            json!({ "pack_names": pack_names }),
        )
        .await
    }
}

fn build_http(profile: &ServerProfile) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(&profile.user_agent)
        .build()
        .context("failed to build HTTP client")
}
