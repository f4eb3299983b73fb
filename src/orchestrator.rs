//! Transfer and search workflows
//!
//! Sits between the dispatcher and the drive capability. Owns the retry
//! policy: transient failures are retried a small bounded number of times
//! with jittered exponential backoff; auth, quota and input failures are
//! never retried. Reports auth failures to the credential store so no
//! further drive calls are attempted until the user supplies a new
//! credential.

use crate::config::{PROVIDER_INITIAL_BACKOFF_MS, PROVIDER_MAX_BACKOFF_MS};
use crate::credential::{CredentialStore, Validity};
use crate::provider::{DriveProvider, ProviderError, SearchHit};
use std::sync::Arc;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{info, warn};

/// Outcome of a transfer or selection workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Content saved; a fresh share link when one could be created
    Success {
        /// Share link for the saved content, if the drive issued one
        share_link: Option<String>,
        /// Display title of the saved content
        title: String,
    },
    /// No credential has been set yet
    MissingCredential,
    /// The drive rejected the credential; the user must supply a new one
    AuthFailure,
    /// The link or selection was unusable; nothing was submitted
    SourceInvalid(String),
    /// The drive account is out of capacity
    QuotaExceeded,
    /// A temporary failure survived all retries
    Transient,
}

/// Outcome of a search workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    /// Matches found; `hits` is already truncated for display
    Results {
        /// Hits up to the display limit
        hits: Vec<SearchHit>,
        /// Total number of matches before truncation
        total: usize,
    },
    /// The query matched nothing
    NoMatches,
    /// The query was empty or whitespace
    EmptyQuery,
    /// No credential has been set yet
    MissingCredential,
    /// The drive rejected the credential
    AuthFailure,
    /// A temporary failure survived all retries
    Transient,
}

/// Outcome of a credential verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialCheck {
    /// The drive accepted the credential; account display name attached
    Valid(String),
    /// The drive rejected the credential
    Invalid,
    /// No credential has been set yet
    Missing,
    /// The check could not be completed; validity is left untouched
    Transient,
}

/// Tuning for the orchestrator workflows
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Folder transfers are saved into
    pub default_folder_id: String,
    /// Folder searches are scoped to
    pub search_folder_id: String,
    /// Retries after a transient failure
    pub retries: usize,
    /// Maximum hits rendered per search reply
    pub search_display_limit: usize,
}

/// Executes drive workflows on behalf of the dispatcher.
pub struct Orchestrator {
    provider: Arc<dyn DriveProvider>,
    credentials: Arc<CredentialStore>,
    cfg: OrchestratorConfig,
}

impl Orchestrator {
    /// Wire an orchestrator to its provider and credential store.
    #[must_use]
    pub fn new(
        provider: Arc<dyn DriveProvider>,
        credentials: Arc<CredentialStore>,
        cfg: OrchestratorConfig,
    ) -> Self {
        Self {
            provider,
            credentials,
            cfg,
        }
    }

    /// Credential to use for a drive call, refusing early when the stored
    /// one is absent or already known to be rejected.
    async fn usable_credential(&self) -> Result<String, TransferOutcome> {
        match self.credentials.token().await {
            None => Err(TransferOutcome::MissingCredential),
            Some(_) if self.credentials.validity().await == Validity::Invalid => {
                Err(TransferOutcome::AuthFailure)
            }
            Some(token) => Ok(token),
        }
    }

    fn retry_strategy(&self) -> impl Iterator<Item = std::time::Duration> {
        ExponentialBackoff::from_millis(PROVIDER_INITIAL_BACKOFF_MS)
            .max_delay(std::time::Duration::from_millis(PROVIDER_MAX_BACKOFF_MS))
            .map(jitter)
            .take(self.cfg.retries)
    }

    /// Save the content behind a share link and answer with a fresh share
    /// link for it.
    pub async fn transfer(&self, link: &str) -> TransferOutcome {
        if !is_share_link(link) {
            return TransferOutcome::SourceInvalid("not a drive share link".to_string());
        }
        let credential = match self.usable_credential().await {
            Ok(token) => token,
            Err(outcome) => return outcome,
        };

        let saved = RetryIf::spawn(
            self.retry_strategy(),
            || {
                self.provider
                    .submit_transfer(link, &self.cfg.default_folder_id, &credential)
            },
            ProviderError::is_transient,
        )
        .await;

        let saved = match saved {
            Ok(saved) => saved,
            Err(e) => return self.failure_outcome(e).await,
        };
        info!(
            files = saved.file_count,
            folders = saved.folder_count,
            "transfer completed"
        );

        let share_link = match &saved.fid {
            Some(fid) => match self
                .provider
                .create_share_link(fid, &saved.title, &credential)
                .await
            {
                Ok(url) => Some(url),
                Err(e) => {
                    // The content is saved either way; a missing link is
                    // reported, not fatal
                    warn!(error = %e, "share link creation failed after save");
                    None
                }
            },
            None => None,
        };

        TransferOutcome::Success {
            share_link,
            title: saved.title,
        }
    }

    /// Search the configured folder and keep at most the display limit.
    pub async fn search(&self, query: &str) -> SearchOutcome {
        let query = query.trim();
        if query.is_empty() {
            return SearchOutcome::EmptyQuery;
        }
        let credential = match self.usable_credential().await {
            Ok(token) => token,
            Err(TransferOutcome::MissingCredential) => return SearchOutcome::MissingCredential,
            Err(_) => return SearchOutcome::AuthFailure,
        };

        let hits = RetryIf::spawn(
            self.retry_strategy(),
            || {
                self.provider
                    .search(query, &self.cfg.search_folder_id, &credential)
            },
            ProviderError::is_transient,
        )
        .await;

        match hits {
            Ok(hits) if hits.is_empty() => SearchOutcome::NoMatches,
            Ok(mut hits) => {
                let total = hits.len();
                hits.truncate(self.cfg.search_display_limit);
                SearchOutcome::Results { hits, total }
            }
            Err(e) => match self.failure_outcome(e).await {
                TransferOutcome::AuthFailure => SearchOutcome::AuthFailure,
                _ => SearchOutcome::Transient,
            },
        }
    }

    /// Create a share link for a previously found hit.
    pub async fn share_hit(&self, hit: &SearchHit) -> TransferOutcome {
        let credential = match self.usable_credential().await {
            Ok(token) => token,
            Err(outcome) => return outcome,
        };

        let result = RetryIf::spawn(
            self.retry_strategy(),
            || {
                self.provider
                    .create_share_link(&hit.fid, &hit.name, &credential)
            },
            ProviderError::is_transient,
        )
        .await;

        match result {
            Ok(url) => TransferOutcome::Success {
                share_link: Some(url),
                title: hit.name.clone(),
            },
            Err(e) => self.failure_outcome(e).await,
        }
    }

    /// Probe the stored credential and record the result.
    ///
    /// Auth rejections mark the credential invalid; network-class failures
    /// leave validity untouched so a flaky connection cannot lock the user
    /// out.
    pub async fn verify_credential(&self) -> CredentialCheck {
        let Some(credential) = self.credentials.token().await else {
            return CredentialCheck::Missing;
        };

        match self.provider.check_credential(&credential).await {
            Ok(nickname) => {
                self.credentials.mark_valid().await;
                CredentialCheck::Valid(nickname)
            }
            Err(ProviderError::Auth(reason)) => {
                info!(reason, "credential check rejected");
                self.credentials.mark_invalid().await;
                CredentialCheck::Invalid
            }
            Err(e) => {
                warn!(error = %e, "credential check inconclusive");
                CredentialCheck::Transient
            }
        }
    }

    /// Map a provider failure to an outcome, recording auth rejections.
    async fn failure_outcome(&self, error: ProviderError) -> TransferOutcome {
        match error {
            ProviderError::Auth(reason) => {
                info!(reason, "drive rejected the credential");
                self.credentials.mark_invalid().await;
                TransferOutcome::AuthFailure
            }
            ProviderError::Quota => TransferOutcome::QuotaExceeded,
            ProviderError::InvalidSource(reason) => TransferOutcome::SourceInvalid(reason),
            ProviderError::Transient(reason) => {
                warn!(reason, "drive operation failed after retries");
                TransferOutcome::Transient
            }
        }
    }
}

/// Whether a piece of text is a drive share link.
#[must_use]
pub fn is_share_link(text: &str) -> bool {
    lazy_regex::regex_is_match!(r"^https?://pan\.quark\.cn/s/[^\s)]+$", text.trim())
}

/// Extract every drive share link contained in a text.
#[must_use]
pub fn extract_share_links(text: &str) -> Vec<String> {
    lazy_regex::regex!(r"https?://pan\.quark\.cn/s/[^\s)]+")
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}
