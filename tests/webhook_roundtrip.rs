//! End-to-end webhook tests: encrypted request in, encrypted reply out,
//! against a stub drive provider.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use quark_relay::credential::CredentialStore;
use quark_relay::crypto::{CallbackSignature, EnvelopeCipher};
use quark_relay::dedup::MessageDedup;
use quark_relay::dispatch::Dispatcher;
use quark_relay::message::ReplyMessage;
use quark_relay::orchestrator::{Orchestrator, OrchestratorConfig};
use quark_relay::provider::{DriveProvider, ProviderError, SavedContent, SearchHit};
use quark_relay::push::PushClient;
use quark_relay::session::SessionStore;
use quark_relay::webhook::{router, AppState};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

const TEST_KEY: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQ";
const TOKEN: &str = "callback-token";
const CORP_ID: &str = "wwtestcorp01";

/// Deterministic in-memory drive used instead of the HTTP client.
#[derive(Default)]
struct StubProvider {
    transfers: AtomicUsize,
}

#[async_trait]
impl DriveProvider for StubProvider {
    async fn submit_transfer(
        &self,
        _link: &str,
        _folder_id: &str,
        _credential: &str,
    ) -> Result<SavedContent, ProviderError> {
        self.transfers.fetch_add(1, Ordering::SeqCst);
        Ok(SavedContent {
            fid: Some("fid-1".to_string()),
            title: "Movie".to_string(),
            file_count: 1,
            folder_count: 0,
        })
    }

    async fn create_share_link(
        &self,
        _fid: &str,
        _title: &str,
        _credential: &str,
    ) -> Result<String, ProviderError> {
        Ok("https://pan.quark.cn/s/fresh1".to_string())
    }

    async fn search(
        &self,
        query: &str,
        _folder_id: &str,
        _credential: &str,
    ) -> Result<Vec<SearchHit>, ProviderError> {
        Ok(vec![SearchHit {
            fid: "fid-2".to_string(),
            name: format!("{query}.pdf"),
            is_dir: false,
            path: "/docs".to_string(),
        }])
    }

    async fn check_credential(&self, _credential: &str) -> Result<String, ProviderError> {
        Ok("tester".to_string())
    }
}

struct TestApp {
    app: Router,
    signature: CallbackSignature,
    cipher: EnvelopeCipher,
    provider: Arc<StubProvider>,
}

async fn test_app() -> TestApp {
    let signature = Arc::new(CallbackSignature::new(TOKEN));
    let cipher = Arc::new(EnvelopeCipher::new(TEST_KEY, CORP_ID).expect("valid test key"));

    let path = std::env::temp_dir().join(format!(
        "quark-relay-webhook-{}-{}.txt",
        std::process::id(),
        rand::random::<u32>()
    ));
    let credentials = Arc::new(CredentialStore::load(path).await);
    credentials.set("cookie=test").await.expect("persist");

    let provider = Arc::new(StubProvider::default());
    let orchestrator = Orchestrator::new(
        provider.clone(),
        credentials.clone(),
        OrchestratorConfig {
            default_folder_id: "0".to_string(),
            search_folder_id: "0".to_string(),
            retries: 0,
            search_display_limit: 10,
        },
    );
    let dispatcher = Arc::new(Dispatcher::new(
        SessionStore::new(60),
        credentials,
        orchestrator,
    ));

    let state = AppState {
        signature: signature.clone(),
        cipher: cipher.clone(),
        dedup: Arc::new(MessageDedup::new(60, 100)),
        dispatcher,
        // Never reachable; deferred replies are not exercised here
        push: Arc::new(PushClient::new(
            "http://127.0.0.1:9",
            CORP_ID,
            "1000002",
            "secret",
            1,
        )),
        reply_deadline: Duration::from_secs(4),
    };

    TestApp {
        app: router(state),
        signature: CallbackSignature::new(TOKEN),
        cipher: EnvelopeCipher::new(TEST_KEY, CORP_ID).expect("valid test key"),
        provider,
    }
}

fn urlencode(input: &str) -> String {
    let mut out = String::new();
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn inbound_payload(sender: &str, msg_id: &str, content: &str) -> String {
    json!({
        "from_user": sender,
        "msg_id": msg_id,
        "create_time": 1_700_000_000u64,
        "msg_type": "text",
        "content": content,
    })
    .to_string()
}

fn post_request(test: &TestApp, payload: &str) -> Request<Body> {
    let encrypt = test.cipher.encrypt(payload).expect("encrypt");
    let timestamp = "1700000000";
    let nonce = "nonce42";
    let sig = test.signature.compute(timestamp, nonce, &encrypt);
    let uri = format!("/callback?msg_signature={sig}&timestamp={timestamp}&nonce={nonce}");
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "encrypt": encrypt }).to_string(),
        ))
        .expect("request")
}

async fn decode_reply(test: &TestApp, response: axum::response::Response) -> ReplyMessage {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value: Value = serde_json::from_slice(&bytes).expect("reply JSON");
    let encrypt = value["encrypt"].as_str().expect("encrypt field");

    // The reply must carry a verifiable signature
    let ts = value["timestamp"].as_str().expect("timestamp field");
    let nonce = value["nonce"].as_str().expect("nonce field");
    let sig = value["msgsignature"].as_str().expect("msgsignature field");
    assert!(
        test.signature.verify(ts, nonce, encrypt, sig),
        "reply signature must verify"
    );

    let payload = test.cipher.decrypt(encrypt).expect("reply decrypts");
    serde_json::from_str(&payload).expect("reply payload")
}

#[tokio::test]
async fn url_verification_echoes_the_challenge() {
    let test = test_app().await;
    let echostr = test.cipher.encrypt("challenge-123").expect("encrypt");
    let timestamp = "1700000000";
    let nonce = "nonce42";
    let sig = test.signature.compute(timestamp, nonce, &echostr);

    let uri = format!(
        "/callback?msg_signature={sig}&timestamp={timestamp}&nonce={nonce}&echostr={}",
        urlencode(&echostr)
    );
    let response = test
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(uri)
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(&bytes[..], b"challenge-123");
}

#[tokio::test]
async fn bad_signature_is_rejected_without_side_effects() {
    let test = test_app().await;
    let payload = inbound_payload("alice", "m-100", "https://pan.quark.cn/s/abc123");
    let mut request = post_request(&test, &payload);
    *request.uri_mut() = "/callback?msg_signature=badbadbad&timestamp=1700000000&nonce=nonce42"
        .parse()
        .expect("uri");

    let response = test.app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(test.provider.transfers.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn help_round_trip_produces_an_encrypted_reply() {
    let test = test_app().await;
    let response = test
        .app
        .clone()
        .oneshot(post_request(&test, &inbound_payload("alice", "m-1", "help")))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let reply = decode_reply(&test, response).await;
    assert_eq!(reply.to_user, "alice");
    assert!(reply.content.contains("Commands"), "reply: {}", reply.content);
}

#[tokio::test]
async fn transfer_round_trip_returns_the_fresh_share_link() {
    let test = test_app().await;
    let response = test
        .app
        .clone()
        .oneshot(post_request(
            &test,
            &inbound_payload("alice", "m-2", "https://pan.quark.cn/s/abc123"),
        ))
        .await
        .expect("response");

    let reply = decode_reply(&test, response).await;
    assert!(
        reply.content.contains("https://pan.quark.cn/s/fresh1"),
        "reply: {}",
        reply.content
    );
    assert_eq!(test.provider.transfers.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn duplicate_delivery_replays_without_a_second_submission() {
    let test = test_app().await;
    let payload = inbound_payload("alice", "m-3", "https://pan.quark.cn/s/abc123");

    let first = test
        .app
        .clone()
        .oneshot(post_request(&test, &payload))
        .await
        .expect("response");
    let first_reply = decode_reply(&test, first).await;

    let second = test
        .app
        .clone()
        .oneshot(post_request(&test, &payload))
        .await
        .expect("response");
    let second_reply = decode_reply(&test, second).await;

    assert_eq!(first_reply.content, second_reply.content);
    assert_eq!(
        test.provider.transfers.load(Ordering::SeqCst),
        1,
        "a retried delivery must not submit a second transfer"
    );
}

#[tokio::test]
async fn undecryptable_body_gets_an_empty_ok() {
    let test = test_app().await;
    let garbage = "AAAABBBBCCCCDDDDEEEEFFFFGGGGHHHH";
    let timestamp = "1700000000";
    let nonce = "nonce42";
    let sig = test.signature.compute(timestamp, nonce, garbage);
    let uri = format!("/callback?msg_signature={sig}&timestamp={timestamp}&nonce={nonce}");

    let response = test
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(json!({ "encrypt": garbage }).to_string()))
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert!(bytes.is_empty());
}
