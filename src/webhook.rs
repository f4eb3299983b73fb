//! HTTP callback endpoints
//!
//! The platform talks to exactly two routes: `GET /callback` proves
//! control of the shared secret during setup by echoing a decrypted
//! challenge, and `POST /callback` delivers encrypted messages. Replies
//! go back in the response body, encrypted and signed like the inbound
//! envelope. Work that outruns the platform's response deadline is
//! finished in the background and delivered as a push message.
//!
//! Protocol failures are deliberately uniform: a bad signature is a bare
//! 403, an undecryptable body is an empty 200 (so the platform does not
//! keep retrying a request that can never succeed), and neither reveals
//! which check failed.

use crate::crypto::{CallbackSignature, EnvelopeCipher};
use crate::dedup::{Claim, MessageDedup};
use crate::dispatch::Dispatcher;
use crate::message::{DecryptedMessage, MessageKind, ReplyMessage};
use crate::push::PushClient;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shared state of the callback handlers
#[derive(Clone)]
pub struct AppState {
    /// Signs and verifies callback envelopes
    pub signature: Arc<CallbackSignature>,
    /// Encrypts and decrypts payloads
    pub cipher: Arc<EnvelopeCipher>,
    /// Duplicate-delivery suppression
    pub dedup: Arc<MessageDedup>,
    /// Command routing
    pub dispatcher: Arc<Dispatcher>,
    /// Deferred-reply delivery
    pub push: Arc<PushClient>,
    /// Synchronous reply window before degrading to a deferred reply
    pub reply_deadline: Duration,
}

/// Query parameters the platform attaches to every callback
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    msg_signature: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    nonce: String,
    /// Present only on the GET verification request
    #[serde(default)]
    echostr: Option<String>,
}

/// JSON body of an encrypted delivery
#[derive(Debug, Deserialize)]
pub struct EncryptedBody {
    encrypt: String,
}

/// JSON body of an encrypted reply
#[derive(Debug, Serialize)]
struct EncryptedReply {
    encrypt: String,
    msgsignature: String,
    timestamp: String,
    nonce: String,
}

/// Build the application router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/callback", get(verify_url).post(receive_message))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// `GET /callback` — the platform's URL verification handshake.
async fn verify_url(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let Some(echostr) = params.echostr.as_deref() else {
        // A browser poking at the endpoint, not the platform
        return (StatusCode::OK, "quark-relay callback endpoint").into_response();
    };

    if !state
        .signature
        .verify(&params.timestamp, &params.nonce, echostr, &params.msg_signature)
    {
        warn!("URL verification failed: bad signature");
        return forbidden();
    }

    match state.cipher.decrypt(echostr) {
        Ok(challenge) => {
            info!("URL verification succeeded");
            (StatusCode::OK, challenge).into_response()
        }
        Err(e) => {
            warn!(error = %e, "URL verification failed: undecryptable challenge");
            forbidden()
        }
    }
}

/// `POST /callback` — one encrypted message delivery.
async fn receive_message(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
    Json(body): Json<EncryptedBody>,
) -> Response {
    if !state.signature.verify(
        &params.timestamp,
        &params.nonce,
        &body.encrypt,
        &params.msg_signature,
    ) {
        warn!("delivery rejected: bad signature");
        return forbidden();
    }

    let payload = match state.cipher.decrypt(&body.encrypt) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "delivery rejected: undecryptable payload");
            return empty_ok();
        }
    };
    let msg = match DecryptedMessage::from_payload(&payload) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "delivery rejected: malformed payload");
            return empty_ok();
        }
    };

    if msg.msg_type == MessageKind::Event {
        debug!(sender = %msg.from_user, "event acknowledged");
        return empty_ok();
    }

    match state.dedup.claim(&msg.msg_id).await {
        Claim::Replied(reply) => {
            debug!(msg_id = %msg.msg_id, "replaying cached reply");
            encrypted_reply(&state, &msg.from_user, &reply)
        }
        Claim::InFlight => encrypted_reply(
            &state,
            &msg.from_user,
            "⏳ Still working on your previous message.",
        ),
        Claim::First => process_first_delivery(state, msg).await,
    }
}

/// Dispatch a first delivery, degrading to a deferred push reply when the
/// synchronous window closes before the work does.
async fn process_first_delivery(state: AppState, msg: DecryptedMessage) -> Response {
    let (tx, rx) = oneshot::channel();
    let task_state = state.clone();
    let task_msg = msg.clone();
    tokio::spawn(async move {
        let reply = task_state.dispatcher.handle(&task_msg).await;
        task_state.dedup.store_reply(&task_msg.msg_id, &reply).await;
        if reply.is_empty() {
            return;
        }
        if tx.send(reply.clone()).is_err() {
            // The synchronous window is gone; deliver through the push API
            if let Err(e) = task_state.push.send_text(&task_msg.from_user, &reply).await {
                error!(sender = %task_msg.from_user, error = %e, "deferred reply lost");
            }
        }
    });

    match tokio::time::timeout(state.reply_deadline, rx).await {
        Ok(Ok(reply)) => encrypted_reply(&state, &msg.from_user, &reply),
        Ok(Err(_)) => empty_ok(),
        Err(_) => {
            debug!(msg_id = %msg.msg_id, "reply deadline passed; deferring");
            encrypted_reply(
                &state,
                &msg.from_user,
                "⏳ Working on it; the result will follow in a moment.",
            )
        }
    }
}

/// Encrypt and sign a reply envelope.
fn encrypted_reply(state: &AppState, to_user: &str, content: &str) -> Response {
    let reply = ReplyMessage {
        to_user: to_user.to_string(),
        content: content.to_string(),
        create_time: u64::try_from(Utc::now().timestamp()).unwrap_or_default(),
    };
    let payload = match serde_json::to_string(&reply) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error = %e, "reply serialization failed");
            return empty_ok();
        }
    };
    let encrypt = match state.cipher.encrypt(&payload) {
        Ok(ciphertext) => ciphertext,
        Err(e) => {
            error!(error = %e, "reply encryption failed");
            return empty_ok();
        }
    };

    let timestamp = Utc::now().timestamp().to_string();
    let nonce: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    let msgsignature = state.signature.compute(&timestamp, &nonce, &encrypt);

    Json(EncryptedReply {
        encrypt,
        msgsignature,
        timestamp,
        nonce,
    })
    .into_response()
}

fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, "forbidden").into_response()
}

/// An empty 200, which the platform accepts without retrying.
fn empty_ok() -> Response {
    StatusCode::OK.into_response()
}
