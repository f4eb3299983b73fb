//! HTTP client for the drive API
//!
//! Implements [`DriveProvider`] against the drive's web endpoints. A
//! transfer is a chain: share token → share detail → save task → task
//! poll; a share link is another chain: share task → share id → submit.
//! Search is a bounded walk over the folder listing endpoint. Every
//! request carries the session cookie and a per-attempt timeout.

use super::{DriveProvider, ProviderError, SavedContent, SearchHit};
use crate::config::{
    SEARCH_MAX_DEPTH, SEARCH_MAX_DIRS, SEARCH_PAGE_SIZE, TASK_POLL_ATTEMPTS, TASK_POLL_INTERVAL_MS,
};
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// Drive capacity exhausted
const CODE_CAPACITY: i64 = 32003;
/// Destination folder no longer exists
const CODE_MISSING_FOLDER: i64 = 41013;

/// reqwest-backed drive client.
pub struct QuarkClient {
    http: HttpClient,
    api_base: String,
    account_base: String,
}

impl QuarkClient {
    /// Build a client for the given API bases with a per-attempt timeout.
    #[must_use]
    pub fn new(api_base: impl Into<String>, account_base: impl Into<String>, timeout_secs: u64) -> Self {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_else(|_| HttpClient::new());
        Self {
            http,
            api_base: api_base.into(),
            account_base: account_base.into(),
        }
    }

    fn origin(&self) -> &str {
        &self.account_base
    }

    async fn get_json(
        &self,
        url: &str,
        query: &[(&str, &str)],
        credential: &str,
    ) -> Result<Value, ProviderError> {
        let response = self
            .http
            .get(url)
            .query(query)
            .header("user-agent", USER_AGENT)
            .header("origin", self.origin())
            .header("referer", format!("{}/", self.origin()))
            .header("cookie", credential)
            .send()
            .await
            .map_err(request_error)?;
        decode_response(response).await
    }

    async fn post_json(
        &self,
        url: &str,
        query: &[(&str, &str)],
        body: &Value,
        credential: &str,
    ) -> Result<Value, ProviderError> {
        let response = self
            .http
            .post(url)
            .query(query)
            .json(body)
            .header("user-agent", USER_AGENT)
            .header("origin", self.origin())
            .header("referer", format!("{}/", self.origin()))
            .header("cookie", credential)
            .send()
            .await
            .map_err(request_error)?;
        decode_response(response).await
    }

    async fn fetch_stoken(
        &self,
        pwd_id: &str,
        passcode: &str,
        credential: &str,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/1/clouddrive/share/sharepage/token", self.api_base);
        let body = json!({ "pwd_id": pwd_id, "passcode": passcode });
        let value = self
            .post_json(&url, &[("pr", "ucpro"), ("fr", "pc")], &body, credential)
            .await?;

        match json_str(&value, &["data", "stoken"]) {
            Some(stoken) if !stoken.is_empty() => Ok(stoken.to_string()),
            _ => Err(ProviderError::InvalidSource(
                json_message(&value).unwrap_or_else(|| "share token unavailable".to_string()),
            )),
        }
    }

    async fn fetch_detail(
        &self,
        pwd_id: &str,
        stoken: &str,
        credential: &str,
    ) -> Result<(bool, Vec<Value>), ProviderError> {
        let url = format!("{}/1/clouddrive/share/sharepage/detail", self.api_base);
        let value = self
            .get_json(
                &url,
                &[
                    ("pr", "ucpro"),
                    ("fr", "pc"),
                    ("pwd_id", pwd_id),
                    ("stoken", stoken),
                    ("pdir_fid", "0"),
                    ("force", "0"),
                    ("_page", "1"),
                    ("_size", "50"),
                    ("_sort", "file_type:asc,updated_at:desc"),
                ],
                credential,
            )
            .await?;

        let is_owner = value
            .pointer("/data/is_owner")
            .and_then(Value::as_i64)
            .unwrap_or(0)
            == 1;
        let list = value
            .pointer("/data/list")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok((is_owner, list))
    }

    async fn start_save_task(
        &self,
        share: &ShareSource<'_>,
        folder_id: &str,
        credential: &str,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/1/clouddrive/share/sharepage/save", self.api_base);
        let body = json!({
            "fid_list": share.fids,
            "fid_token_list": share.fid_tokens,
            "to_pdir_fid": folder_id,
            "pwd_id": share.pwd_id,
            "stoken": share.stoken,
            "pdir_fid": "0",
            "scene": "link",
        });
        let value = self
            .post_json(&url, &[("pr", "ucpro"), ("fr", "pc")], &body, credential)
            .await?;
        check_drive_code(&value)?;

        json_str(&value, &["data", "task_id"])
            .map(ToString::to_string)
            .ok_or_else(|| {
                ProviderError::Transient("save task was not accepted".to_string())
            })
    }

    /// Poll a drive task until it reports completion (status 2).
    async fn poll_task(&self, task_id: &str, credential: &str) -> Result<Value, ProviderError> {
        let url = format!("{}/1/clouddrive/task", self.api_base);
        for attempt in 0..TASK_POLL_ATTEMPTS {
            tokio::time::sleep(Duration::from_millis(TASK_POLL_INTERVAL_MS)).await;
            let retry_index = attempt.to_string();
            let value = self
                .get_json(
                    &url,
                    &[
                        ("pr", "ucpro"),
                        ("fr", "pc"),
                        ("task_id", task_id),
                        ("retry_index", &retry_index),
                    ],
                    credential,
                )
                .await?;
            check_drive_code(&value)?;

            let status = value.pointer("/data/status").and_then(Value::as_i64);
            if status == Some(2) {
                return Ok(value);
            }
            debug!(task_id, attempt, ?status, "drive task still running");
        }
        Err(ProviderError::Transient(
            "drive task did not complete in time".to_string(),
        ))
    }

    /// List one page of a folder, sorted by name.
    async fn list_folder(
        &self,
        folder_id: &str,
        credential: &str,
    ) -> Result<Vec<Value>, ProviderError> {
        let url = format!("{}/1/clouddrive/file/sort", self.api_base);
        let size = SEARCH_PAGE_SIZE.to_string();
        let value = self
            .get_json(
                &url,
                &[
                    ("pr", "ucpro"),
                    ("fr", "pc"),
                    ("pdir_fid", folder_id),
                    ("_page", "1"),
                    ("_size", &size),
                    ("_fetch_total", "false"),
                    ("_sort", "file_name:asc"),
                ],
                credential,
            )
            .await?;
        check_drive_code(&value)?;
        Ok(value
            .pointer("/data/list")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Find the freshly saved content in the destination folder by name.
    async fn locate_saved(
        &self,
        folder_id: &str,
        names: &[String],
        credential: &str,
    ) -> Option<String> {
        let items = match self.list_folder(folder_id, credential).await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "could not list destination folder after save");
                return None;
            }
        };
        items.iter().find_map(|item| {
            let name = json_str(item, &["file_name"])?;
            if names.iter().any(|n| n == name) {
                json_str(item, &["fid"]).map(ToString::to_string)
            } else {
                None
            }
        })
    }
}

struct ShareSource<'a> {
    pwd_id: &'a str,
    stoken: &'a str,
    fids: Vec<String>,
    fid_tokens: Vec<String>,
}

#[async_trait]
impl DriveProvider for QuarkClient {
    async fn submit_transfer(
        &self,
        link: &str,
        folder_id: &str,
        credential: &str,
    ) -> Result<SavedContent, ProviderError> {
        let pwd_id = pwd_id_from(link)
            .ok_or_else(|| ProviderError::InvalidSource("not a share link".to_string()))?;
        let passcode = passcode_from(link);

        let stoken = self.fetch_stoken(&pwd_id, &passcode, credential).await?;
        let (is_owner, entries) = self.fetch_detail(&pwd_id, &stoken, credential).await?;
        if entries.is_empty() {
            return Err(ProviderError::InvalidSource(
                "the share link contains no files".to_string(),
            ));
        }
        if is_owner {
            return Err(ProviderError::InvalidSource(
                "the content is already in this drive".to_string(),
            ));
        }

        let mut names = Vec::new();
        let mut file_count = 0;
        let mut folder_count = 0;
        let mut fids = Vec::new();
        let mut fid_tokens = Vec::new();
        for entry in &entries {
            if entry.get("dir").and_then(Value::as_bool).unwrap_or(false) {
                folder_count += 1;
            } else {
                file_count += 1;
            }
            if let Some(name) = json_str(entry, &["file_name"]) {
                names.push(name.to_string());
            }
            if let Some(fid) = json_str(entry, &["fid"]) {
                fids.push(fid.to_string());
            }
            if let Some(token) = json_str(entry, &["share_fid_token"]) {
                fid_tokens.push(token.to_string());
            }
        }

        let share = ShareSource {
            pwd_id: &pwd_id,
            stoken: &stoken,
            fids,
            fid_tokens,
        };
        let task_id = self.start_save_task(&share, folder_id, credential).await?;
        self.poll_task(&task_id, credential).await?;

        let fid = self.locate_saved(folder_id, &names, credential).await;
        let title = names.first().cloned().unwrap_or_else(|| "saved content".to_string());
        Ok(SavedContent {
            fid,
            title,
            file_count,
            folder_count,
        })
    }

    async fn create_share_link(
        &self,
        fid: &str,
        title: &str,
        credential: &str,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/1/clouddrive/share", self.api_base);
        let body = json!({
            "fid_list": [fid],
            "title": title,
            "url_type": 1,
            "expired_type": 1,
        });
        let value = self
            .post_json(&url, &[("pr", "ucpro"), ("fr", "pc")], &body, credential)
            .await?;
        check_drive_code(&value)?;
        let task_id = json_str(&value, &["data", "task_id"])
            .map(ToString::to_string)
            .ok_or_else(|| ProviderError::Transient("share task was not accepted".to_string()))?;

        let task = self.poll_task(&task_id, credential).await?;
        let share_id = json_str(&task, &["data", "share_id"])
            .map(ToString::to_string)
            .ok_or_else(|| ProviderError::Transient("share id was not issued".to_string()))?;

        let url = format!("{}/1/clouddrive/share/password", self.api_base);
        let value = self
            .post_json(
                &url,
                &[("pr", "ucpro"), ("fr", "pc")],
                &json!({ "share_id": share_id }),
                credential,
            )
            .await?;
        check_drive_code(&value)?;

        let share_url = json_str(&value, &["data", "share_url"])
            .map(ToString::to_string)
            .ok_or_else(|| ProviderError::Transient("share link missing in response".to_string()))?;
        Ok(match json_str(&value, &["data", "passcode"]) {
            Some(passcode) if !passcode.is_empty() => format!("{share_url}?pwd={passcode}"),
            _ => share_url,
        })
    }

    async fn search(
        &self,
        query: &str,
        folder_id: &str,
        credential: &str,
    ) -> Result<Vec<SearchHit>, ProviderError> {
        let needle = query.to_lowercase();
        let mut hits = Vec::new();
        // (folder id, display path, depth) — iterative walk, bounded both
        // in depth and in total folders listed
        let mut stack = vec![(folder_id.to_string(), String::new(), 0usize)];
        let mut listed = 0usize;

        while let Some((fid, path, depth)) = stack.pop() {
            if listed >= SEARCH_MAX_DIRS {
                break;
            }
            listed += 1;
            let items = self.list_folder(&fid, credential).await?;

            for item in items {
                let Some(name) = json_str(&item, &["file_name"]) else {
                    continue;
                };
                let Some(item_fid) = json_str(&item, &["fid"]) else {
                    continue;
                };
                let is_dir = item.get("dir").and_then(Value::as_bool).unwrap_or(false);

                if name.to_lowercase().contains(&needle) {
                    hits.push(SearchHit {
                        fid: item_fid.to_string(),
                        name: name.to_string(),
                        is_dir,
                        path: if path.is_empty() {
                            "/".to_string()
                        } else {
                            path.clone()
                        },
                    });
                }
                if is_dir && depth + 1 < SEARCH_MAX_DEPTH {
                    stack.push((item_fid.to_string(), format!("{path}/{name}"), depth + 1));
                }
            }
        }
        Ok(hits)
    }

    async fn check_credential(&self, credential: &str) -> Result<String, ProviderError> {
        let url = format!("{}/account/info", self.account_base);
        let value = self
            .get_json(&url, &[("fr", "pc"), ("platform", "pc")], credential)
            .await?;

        json_str(&value, &["data", "nickname"])
            .map(ToString::to_string)
            .ok_or_else(|| ProviderError::Auth("account info unavailable".to_string()))
    }
}

/// Extract the share id from a link (the segment after `/s/`).
fn pwd_id_from(link: &str) -> Option<String> {
    let after = link.split("/s/").nth(1)?;
    let id: String = after
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect();
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

/// Extract an optional `pwd=` passcode from a link.
fn passcode_from(link: &str) -> String {
    link.split_once("pwd=")
        .map(|(_, rest)| rest.split('&').next().unwrap_or_default().to_string())
        .unwrap_or_default()
}

fn request_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() || e.is_connect() {
        ProviderError::Transient(format!("drive unreachable: {e}"))
    } else {
        ProviderError::Transient(format!("drive request failed: {e}"))
    }
}

async fn decode_response(response: reqwest::Response) -> Result<Value, ProviderError> {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(ProviderError::Auth(format!("drive answered {status}")));
    }
    if status.is_server_error() {
        return Err(ProviderError::Transient(format!("drive answered {status}")));
    }
    response
        .json()
        .await
        .map_err(|e| ProviderError::Transient(format!("drive response unreadable: {e}")))
}

/// Translate a non-zero drive status code into the error taxonomy.
fn check_drive_code(value: &Value) -> Result<(), ProviderError> {
    let code = value
        .get("code")
        .and_then(Value::as_i64)
        .or_else(|| value.get("status").and_then(Value::as_i64).map(|s| if s == 200 { 0 } else { s }))
        .unwrap_or(0);
    if code == 0 {
        return Ok(());
    }
    let message = json_message(value).unwrap_or_else(|| format!("drive error {code}"));
    match code {
        CODE_CAPACITY => Err(ProviderError::Quota),
        CODE_MISSING_FOLDER => Err(ProviderError::InvalidSource(message)),
        401 => Err(ProviderError::Auth(message)),
        _ => Err(ProviderError::Transient(message)),
    }
}

fn json_message(value: &Value) -> Option<String> {
    value
        .get("message")
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn json_str<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = value;
    for segment in path {
        current = current.get(segment)?;
    }
    current.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pwd_id_is_extracted() {
        assert_eq!(
            pwd_id_from("https://pan.quark.cn/s/abc123DEF"),
            Some("abc123DEF".to_string())
        );
        assert_eq!(
            pwd_id_from("https://pan.quark.cn/s/abc123#frag"),
            Some("abc123".to_string())
        );
        assert_eq!(
            pwd_id_from("https://pan.quark.cn/s/abc123?pwd=xy"),
            Some("abc123".to_string())
        );
        assert_eq!(pwd_id_from("https://pan.quark.cn/about"), None);
    }

    #[test]
    fn passcode_is_extracted() {
        assert_eq!(passcode_from("https://pan.quark.cn/s/abc?pwd=xyz"), "xyz");
        assert_eq!(
            passcode_from("https://pan.quark.cn/s/abc?pwd=xyz&from=share"),
            "xyz"
        );
        assert_eq!(passcode_from("https://pan.quark.cn/s/abc"), "");
    }

    #[test]
    fn capacity_code_maps_to_quota() {
        let value = json!({ "code": CODE_CAPACITY, "message": "capacity limit" });
        assert!(matches!(
            check_drive_code(&value),
            Err(ProviderError::Quota)
        ));
    }

    #[test]
    fn missing_folder_maps_to_invalid_source() {
        let value = json!({ "code": CODE_MISSING_FOLDER, "message": "folder missing" });
        assert!(matches!(
            check_drive_code(&value),
            Err(ProviderError::InvalidSource(_))
        ));
    }

    #[test]
    fn ok_status_passes() {
        assert!(check_drive_code(&json!({ "status": 200, "code": 0 })).is_ok());
        assert!(check_drive_code(&json!({ "message": "ok" })).is_ok());
    }
}
