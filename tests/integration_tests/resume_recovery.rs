use std::sync::Arc;

use anyhow::{Context, Result};
use base64::prelude::{BASE64_STANDARD, Engine as _};
use ice_client_rs::{
    cfg::enums::{NonceSource, Platform},
    crypto::hmac_sha1_hex,
    session::engine::{FastResumeData, SessionEngine},
};
use serde_json::{Value, json};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

use super::common::{api_tuple, test_profile};

/// Login returns this as the mixing value; with a zero nonce and no profile
/// mix keys, it becomes the derived session key verbatim.
const SERVER_MIXED: [u8; 32] = [0x99; 32];
const OLD_SESSION_KEY: [u8; 32] = [0x07; 32];

#[tokio::test]
async fn test_403_on_resumed_session_relogins_and_retries() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/bootstrap/fetchBootstrap"))
        .respond_with(ResponseTemplate::new(403))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/login/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(api_tuple(
            "mv2",
            0,
            json!({
                "session_key": BASE64_STANDARD.encode(SERVER_MIXED),
                "user_model": {"user_status": {"device_token": "tok2"}},
            }),
        )))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bootstrap/fetchBootstrap"))
        .respond_with(ResponseTemplate::new(200).set_body_json(api_tuple("mv2", 0, json!({}))))
        .mount(&server)
        .await;

    let profile = Arc::new(test_profile(&server.uri()));
    let auth_key = BASE64_STANDARD.encode(OLD_SESSION_KEY);
    let mut engine =
        SessionEngine::new(profile, Platform::Ios, Some(42), Some(auth_key.as_str()), 1)?;
    engine.set_nonce_source(NonceSource::Zero);

    let blob = FastResumeData {
        session_key: BASE64_STANDARD.encode(OLD_SESSION_KEY),
        request_id: 5,
        master_version: Some("mv0".to_string()),
        device_token: Some("tok".to_string()),
    };
    let resumed = engine.resume_session(Some(&blob), false, false).await?;
    assert!(resumed);

    let ret = engine
        .call(
            "/bootstrap/fetchBootstrap",
            json!({"bootstrap_fetch_types": [2], "device_token": "tok"}),
        )
        .await?;
    assert_eq!(ret.return_code, 0);
    // Master drift mv0 -> mv2 is accepted, not fatal.
    assert_eq!(engine.master_version(), Some("mv2"));

    let requests = server.received_requests().await.context("no requests")?;
    let id_of = |r: &wiremock::Request| -> Result<u64> {
        r.url
            .query_pairs()
            .find(|(k, _)| k == "id")
            .map(|(_, v)| v.parse::<u64>())
            .context("id missing")?
            .context("id not numeric")
    };

    let probes: Vec<_> = requests
        .iter()
        .filter(|r| r.url.path() == "/bootstrap/fetchBootstrap")
        .collect();
    let logins: Vec<_> = requests
        .iter()
        .filter(|r| r.url.path() == "/login/login")
        .collect();
    assert_eq!(probes.len(), 2, "one 403 probe, one retry");
    assert_eq!(logins.len(), 1, "exactly one relogin");

    // The relogin resets the counter: login goes out with id=1, the retry
    // with the next id.
    assert_eq!(id_of(logins[0])?, 1);
    assert_eq!(id_of(probes[1])?, 2);

    // The retry is signed with the freshly derived session key.
    let retry = probes[1];
    let body = String::from_utf8(retry.body.clone())?;
    let (payload, signature): (Value, String) =
        serde_json::from_str(&body).context("retry body is not [payload, signature]")?;
    let payload_json = serde_json::to_string(&payload)?;
    let path_query = format!(
        "{}?{}",
        retry.url.path(),
        retry.url.query().context("query missing")?
    );
    let expected = hmac_sha1_hex(
        &SERVER_MIXED,
        &[path_query.as_bytes(), b" ", payload_json.as_bytes()],
    );
    assert_eq!(signature, expected, "retry not signed with the new key");
    Ok(())
}

#[tokio::test]
async fn test_revalidate_probe_rejects_dead_session() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bootstrap/fetchBootstrap"))
        .respond_with(ResponseTemplate::new(200).set_body_json(api_tuple("mv1", 13, json!({}))))
        .mount(&server)
        .await;

    let profile = Arc::new(test_profile(&server.uri()));
    let mut engine = SessionEngine::new(profile, Platform::Ios, None, None, 0)?;

    let blob = FastResumeData {
        session_key: BASE64_STANDARD.encode(OLD_SESSION_KEY),
        request_id: 9,
        master_version: Some("mv1".to_string()),
        device_token: Some("tok".to_string()),
    };
    let resumed = engine.resume_session(Some(&blob), false, true).await?;
    assert!(!resumed, "non-zero probe return code must fail the resume");
    Ok(())
}

#[tokio::test]
async fn test_skip_and_revalidate_are_mutually_exclusive() -> Result<()> {
    let server = MockServer::start().await;
    let profile = Arc::new(test_profile(&server.uri()));
    let mut engine = SessionEngine::new(profile, Platform::Ios, None, None, 0)?;

    let blob = FastResumeData {
        session_key: BASE64_STANDARD.encode(OLD_SESSION_KEY),
        request_id: 1,
        master_version: None,
        device_token: None,
    };
    assert!(engine.resume_session(Some(&blob), true, true).await.is_err());
    Ok(())
}
