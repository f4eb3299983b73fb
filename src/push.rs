//! Platform push messages
//!
//! The webhook reply path is synchronous, but a transfer can outrun the
//! platform's response deadline. Results that miss the deadline are
//! delivered through the platform's application-message API instead. The
//! access token required for that API is cached and refreshed shortly
//! before its advertised expiry.

use reqwest::Client as HttpClient;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::PUSH_TOKEN_REFRESH_MARGIN_SECS;

/// Errors from the platform message API
#[derive(Error, Debug)]
pub enum PushError {
    /// The platform could not be reached
    #[error("platform unreachable: {0}")]
    Network(String),
    /// The platform answered with an error code
    #[error("platform error {code}: {message}")]
    Api {
        /// Platform error code
        code: i64,
        /// Platform error message
        message: String,
    },
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Client for platform-initiated text messages.
pub struct PushClient {
    http: HttpClient,
    api_base: String,
    corp_id: String,
    agent_id: String,
    secret: String,
    token: RwLock<Option<CachedToken>>,
}

impl PushClient {
    /// Build a push client for one application.
    #[must_use]
    pub fn new(
        api_base: impl Into<String>,
        corp_id: impl Into<String>,
        agent_id: impl Into<String>,
        secret: impl Into<String>,
        timeout_secs: u64,
    ) -> Self {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_else(|_| HttpClient::new());
        Self {
            http,
            api_base: api_base.into(),
            corp_id: corp_id.into(),
            agent_id: agent_id.into(),
            secret: secret.into(),
            token: RwLock::new(None),
        }
    }

    /// A usable access token, fetched or refreshed as needed.
    async fn access_token(&self) -> Result<String, PushError> {
        if let Some(cached) = self.token.read().await.as_ref() {
            if Instant::now() < cached.expires_at {
                return Ok(cached.token.clone());
            }
        }

        let url = format!("{}/cgi-bin/gettoken", self.api_base);
        let value: Value = self
            .http
            .get(&url)
            .query(&[
                ("corpid", self.corp_id.as_str()),
                ("corpsecret", self.secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| PushError::Network(e.to_string()))?
            .json()
            .await
            .map_err(|e| PushError::Network(e.to_string()))?;

        check_errcode(&value)?;
        let token = value
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or(PushError::Api {
                code: -1,
                message: "access_token missing in response".to_string(),
            })?
            .to_string();
        let expires_in = value
            .get("expires_in")
            .and_then(Value::as_u64)
            .unwrap_or(7200);
        let lifetime = expires_in.saturating_sub(PUSH_TOKEN_REFRESH_MARGIN_SECS);

        *self.token.write().await = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + Duration::from_secs(lifetime),
        });
        debug!(expires_in, "push access token refreshed");
        Ok(token)
    }

    /// Send a text message to one user.
    ///
    /// # Errors
    ///
    /// Returns [`PushError`] when the token cannot be obtained or the
    /// platform rejects the message. Callers on the deferred-reply path
    /// log the error; a failed push is never fatal.
    pub async fn send_text(&self, to_user: &str, content: &str) -> Result<(), PushError> {
        let token = self.access_token().await?;
        let url = format!("{}/cgi-bin/message/send", self.api_base);
        let body = json!({
            "touser": to_user,
            "msgtype": "text",
            "agentid": self.agent_id,
            "text": { "content": content },
            "safe": 0,
        });

        let value: Value = self
            .http
            .post(&url)
            .query(&[("access_token", token.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| PushError::Network(e.to_string()))?
            .json()
            .await
            .map_err(|e| PushError::Network(e.to_string()))?;

        if let Err(e) = check_errcode(&value) {
            warn!(to_user, error = %e, "push message rejected");
            return Err(e);
        }
        Ok(())
    }
}

fn check_errcode(value: &Value) -> Result<(), PushError> {
    let code = value.get("errcode").and_then(Value::as_i64).unwrap_or(0);
    if code == 0 {
        return Ok(());
    }
    Err(PushError::Api {
        code,
        message: value
            .get("errmsg")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string(),
    })
}
