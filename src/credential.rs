//! Drive credential store
//!
//! Holds the drive session cookie together with what is currently known
//! about its validity. The cookie is persisted to a flat file; a missing
//! file on startup simply means no credential has been set yet and must
//! never fail the process.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Errors from credential persistence
#[derive(Error, Debug)]
pub enum CredentialError {
    /// Reading or writing the credential file failed
    #[error("credential file error: {0}")]
    Io(#[from] std::io::Error),
}

/// What is currently known about the stored credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// Never checked, or the last check was inconclusive
    Unknown,
    /// The last provider check accepted the credential
    Valid,
    /// The provider rejected the credential; a new one is required
    Invalid,
}

#[derive(Debug)]
struct CredentialState {
    token: Option<String>,
    validity: Validity,
    last_validated: Option<DateTime<Utc>>,
}

/// Owner of the drive session cookie.
///
/// All mutation goes through [`set`](Self::set),
/// [`mark_valid`](Self::mark_valid) and [`mark_invalid`](Self::mark_invalid).
pub struct CredentialStore {
    state: RwLock<CredentialState>,
    path: PathBuf,
}

impl CredentialStore {
    /// Load the store, reading a previously persisted credential if the
    /// file exists. A missing or unreadable file is treated as "no
    /// credential set".
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let token = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let trimmed = content.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    info!("loaded persisted credential");
                    Some(trimmed.to_string())
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(error = %e, "could not read credential file; starting without one");
                None
            }
        };

        Self {
            state: RwLock::new(CredentialState {
                token,
                validity: Validity::Unknown,
                last_validated: None,
            }),
            path,
        }
    }

    /// Replace the credential with a user-supplied value and persist it.
    /// Validity resets to [`Validity::Unknown`] until the next check.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Io`] if the file cannot be written; the
    /// in-memory credential is updated regardless.
    pub async fn set(&self, token: impl Into<String>) -> Result<(), CredentialError> {
        let token = token.into();
        {
            let mut state = self.state.write().await;
            state.token = Some(token.clone());
            state.validity = Validity::Unknown;
            state.last_validated = None;
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, token.as_bytes()).await?;
        info!("credential updated and persisted");
        Ok(())
    }

    /// Current credential, if any.
    pub async fn token(&self) -> Option<String> {
        self.state.read().await.token.clone()
    }

    /// Current validity flag.
    pub async fn validity(&self) -> Validity {
        self.state.read().await.validity
    }

    /// Timestamp of the last conclusive validity check.
    pub async fn last_validated(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.last_validated
    }

    /// Record that the provider accepted the credential.
    pub async fn mark_valid(&self) {
        let mut state = self.state.write().await;
        state.validity = Validity::Valid;
        state.last_validated = Some(Utc::now());
    }

    /// Record that the provider rejected the credential.
    pub async fn mark_invalid(&self) {
        let mut state = self.state.write().await;
        state.validity = Validity::Invalid;
        state.last_validated = Some(Utc::now());
        warn!("credential marked invalid; a new one must be supplied");
    }
}
