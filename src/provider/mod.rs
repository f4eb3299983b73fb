//! Drive capability boundary
//!
//! Everything the rest of the system needs from the cloud drive is behind
//! [`DriveProvider`]: submit a transfer, create a share link, search a
//! folder, probe the credential. The concrete HTTP client lives in
//! [`quark`]; tests substitute a mock.

mod quark;

pub use quark::QuarkClient;

use async_trait::async_trait;
use thiserror::Error;

/// Errors reported by the drive.
///
/// The taxonomy mirrors what callers need to decide: auth and quota
/// failures are final, invalid sources are the user's problem, and only
/// transient failures may be retried.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The drive rejected the credential
    #[error("drive rejected the credential: {0}")]
    Auth(String),
    /// The drive account is out of storage capacity
    #[error("drive capacity exceeded")]
    Quota,
    /// The share link is dead, empty or otherwise unusable
    #[error("share link is not usable: {0}")]
    InvalidSource(String),
    /// Timeout, connection failure or server-side error; may be retried
    #[error("transient drive error: {0}")]
    Transient(String),
}

impl ProviderError {
    /// Whether a bounded retry is appropriate for this error.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Content saved into the drive by a transfer
#[derive(Debug, Clone)]
pub struct SavedContent {
    /// Drive file id of the saved content, when it could be located
    pub fid: Option<String>,
    /// Display title of the saved content
    pub title: String,
    /// Number of files saved
    pub file_count: usize,
    /// Number of folders saved
    pub folder_count: usize,
}

/// One search match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    /// Drive file id
    pub fid: String,
    /// File or folder name
    pub name: String,
    /// Whether the hit is a folder
    pub is_dir: bool,
    /// Path of the containing folder, for display
    pub path: String,
}

/// The drive capability used by the orchestrator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DriveProvider: Send + Sync {
    /// Save the content behind a share link into a folder.
    async fn submit_transfer(
        &self,
        link: &str,
        folder_id: &str,
        credential: &str,
    ) -> Result<SavedContent, ProviderError>;

    /// Create a fresh share link for previously saved content.
    async fn create_share_link(
        &self,
        fid: &str,
        title: &str,
        credential: &str,
    ) -> Result<String, ProviderError>;

    /// Search a folder (and its subfolders) for names matching a query.
    async fn search(
        &self,
        query: &str,
        folder_id: &str,
        credential: &str,
    ) -> Result<Vec<SearchHit>, ProviderError>;

    /// Light-weight read-only probe of the credential.
    /// Returns the account display name on success.
    async fn check_credential(&self, credential: &str) -> Result<String, ProviderError>;
}
