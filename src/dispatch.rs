//! Per-sender command classification and routing
//!
//! Turns one decrypted message into exactly one reply. Commands are
//! recognized from any dialogue mode; share links win over everything
//! else, so a link pasted while a search query is awaited is still a
//! transfer. Free text is interpreted by the current mode: a search
//! query, a credential, or a nudge towards the help text.

use crate::credential::CredentialStore;
use crate::message::{DecryptedMessage, MessageKind};
use crate::orchestrator::{
    extract_share_links, CredentialCheck, Orchestrator, SearchOutcome, TransferOutcome,
};
use crate::session::{SessionEntry, SessionMode, SessionStore};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// A classified inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    /// `cookie: <value>` — set the credential immediately
    SetCookie(String),
    /// Bare `cookie:` — ask for the credential as the next message
    CookiePrompt,
    /// `verify` — probe the stored credential
    Verify,
    /// `help` / `/help`
    Help,
    /// `/search <query>` — search immediately
    Search(String),
    /// `search` / `/search` — ask for the query as the next message
    SearchPrompt,
    /// One or more drive share links; handled from any mode
    Links(Vec<String>),
    /// `cancel` — drop any pending mode
    Cancel,
    /// A bare number; a selection when search hits are cached
    Number(usize),
    /// Anything else; meaning depends on the dialogue mode
    Free(String),
}

fn classify(text: &str) -> Command {
    let lower = text.to_lowercase();

    if lower.starts_with("cookie:") {
        // Slice the original text so the credential keeps its casing
        let value = text.get("cookie:".len()..).unwrap_or("").trim();
        return if value.is_empty() {
            Command::CookiePrompt
        } else {
            Command::SetCookie(value.to_string())
        };
    }
    if lower == "verify" {
        return Command::Verify;
    }
    if lower == "help" || lower == "/help" {
        return Command::Help;
    }
    if lower == "search" || lower == "/search" {
        return Command::SearchPrompt;
    }
    if lower.starts_with("/search ") {
        let query = text.get("/search ".len()..).unwrap_or("").trim();
        return if query.is_empty() {
            Command::SearchPrompt
        } else {
            Command::Search(query.to_string())
        };
    }

    // Links beat everything else, whatever the current mode
    let links = extract_share_links(text);
    if !links.is_empty() {
        return Command::Links(links);
    }

    if lower == "cancel" {
        return Command::Cancel;
    }
    if let Ok(n) = text.parse::<usize>() {
        return Command::Number(n);
    }
    Command::Free(text.to_string())
}

/// Routes decrypted messages and produces reply text.
pub struct Dispatcher {
    sessions: SessionStore,
    credentials: Arc<CredentialStore>,
    orchestrator: Orchestrator,
}

impl Dispatcher {
    /// Wire a dispatcher to its stores and orchestrator.
    #[must_use]
    pub fn new(
        sessions: SessionStore,
        credentials: Arc<CredentialStore>,
        orchestrator: Orchestrator,
    ) -> Self {
        Self {
            sessions,
            credentials,
            orchestrator,
        }
    }

    /// Handle one decrypted message and produce its reply.
    ///
    /// Holds the sender's session lock for the whole call, which
    /// serializes concurrent deliveries from the same sender. Events are
    /// acknowledged with an empty reply and never routed.
    pub async fn handle(&self, msg: &DecryptedMessage) -> String {
        if msg.msg_type == MessageKind::Event {
            return String::new();
        }

        let session = self.sessions.entry(&msg.from_user);
        let mut guard = session.lock().await;
        self.sessions.expire_if_stale(&msg.from_user, &mut guard);

        let reply = self.route(&msg.from_user, msg.content.trim(), &mut guard).await;
        guard.last_activity = Instant::now();
        reply
    }

    async fn route(&self, sender: &str, text: &str, session: &mut SessionEntry) -> String {
        let command = classify(text);
        debug!(sender, ?command, mode = ?session.mode, "routing message");

        match command {
            Command::SetCookie(value) => {
                session.mode = SessionMode::Idle;
                self.set_credential(sender, &value).await
            }
            Command::CookiePrompt => {
                session.mode = SessionMode::AwaitingCookie;
                "Send the drive credential as your next message.\n\
                 Send `cancel` to abort."
                    .to_string()
            }
            Command::Verify => {
                session.mode = SessionMode::Idle;
                self.verify_credential().await
            }
            Command::Help => {
                session.mode = SessionMode::Idle;
                help_text()
            }
            Command::Search(query) => {
                session.mode = SessionMode::Idle;
                self.run_search(&query, session).await
            }
            Command::SearchPrompt => {
                session.mode = SessionMode::AwaitingSearchQuery;
                "🔍 Search mode. Send the keyword to look for.\n\
                 Send `cancel` to abort."
                    .to_string()
            }
            Command::Links(links) => {
                session.mode = SessionMode::Idle;
                self.run_transfers(sender, &links).await
            }
            Command::Cancel => {
                session.mode = SessionMode::Idle;
                session.search_hits.clear();
                "Okay, nothing pending.".to_string()
            }
            Command::Number(n) if !session.search_hits.is_empty() => {
                self.share_selection(n, session).await
            }
            Command::Number(_) | Command::Free(_) => self.route_free(sender, text, session).await,
        }
    }

    /// Free text: its meaning depends on the dialogue mode.
    async fn route_free(&self, sender: &str, text: &str, session: &mut SessionEntry) -> String {
        match session.mode {
            SessionMode::AwaitingSearchQuery => {
                session.mode = SessionMode::Idle;
                self.run_search(text, session).await
            }
            SessionMode::AwaitingCookie => {
                session.mode = SessionMode::Idle;
                self.set_credential(sender, text).await
            }
            SessionMode::Idle => {
                "I did not understand that. Send a drive share link to save it, \
                 `search` to look for files, or `help` for all commands."
                    .to_string()
            }
        }
    }

    async fn set_credential(&self, sender: &str, value: &str) -> String {
        info!(sender, "credential update requested");
        if let Err(e) = self.credentials.set(value).await {
            // The in-memory credential is updated even when persisting fails
            tracing::warn!(error = %e, "credential persisted incompletely");
        }
        match self.orchestrator.verify_credential().await {
            CredentialCheck::Valid(nickname) => {
                format!("✅ Credential saved and verified.\nAccount: {nickname}")
            }
            CredentialCheck::Invalid => "❌ Credential saved, but the drive rejected it.\n\
                 Copy a fresh cookie and send `cookie: <value>` again."
                .to_string(),
            CredentialCheck::Missing => {
                // set() just stored one; only an empty value gets here
                "❌ That credential looks empty. Send `cookie: <value>`.".to_string()
            }
            CredentialCheck::Transient => "✅ Credential saved.\n\
                 ⏳ The drive could not be reached to verify it; send `verify` later."
                .to_string(),
        }
    }

    async fn verify_credential(&self) -> String {
        match self.orchestrator.verify_credential().await {
            CredentialCheck::Valid(nickname) => {
                format!("✅ Credential is valid.\nAccount: {nickname}")
            }
            CredentialCheck::Invalid => "❌ The drive rejected the stored credential.\n\
                 Send `cookie: <value>` with a fresh one."
                .to_string(),
            CredentialCheck::Missing => {
                "No credential set yet. Send `cookie: <value>` first.".to_string()
            }
            CredentialCheck::Transient => {
                "⏳ The drive could not be reached. Try `verify` again later.".to_string()
            }
        }
    }

    async fn run_search(&self, query: &str, session: &mut SessionEntry) -> String {
        match self.orchestrator.search(query).await {
            SearchOutcome::Results { hits, total } => {
                let mut lines = Vec::with_capacity(hits.len() + 2);
                lines.push(format!("🔍 {total} match(es) for \"{}\":", query.trim()));
                for (idx, hit) in hits.iter().enumerate() {
                    let marker = if hit.is_dir { "📁" } else { "📄" };
                    lines.push(format!("{}. {marker} {} — {}", idx + 1, hit.name, hit.path));
                }
                if total > hits.len() {
                    lines.push(format!("…and {} more. Refine the keyword.", total - hits.len()));
                }
                lines.push("Reply with a number to get a share link.".to_string());
                session.search_hits = hits;
                lines.join("\n")
            }
            SearchOutcome::NoMatches => {
                format!("No matches for \"{}\".", query.trim())
            }
            SearchOutcome::EmptyQuery => {
                "The search keyword cannot be empty. Send `search` and then the keyword."
                    .to_string()
            }
            SearchOutcome::MissingCredential => {
                "No credential set yet. Send `cookie: <value>` first.".to_string()
            }
            SearchOutcome::AuthFailure => "❌ The drive rejected the stored credential.\n\
                 Send `cookie: <value>` with a fresh one."
                .to_string(),
            SearchOutcome::Transient => {
                "⏳ The drive did not respond. Try the search again later.".to_string()
            }
        }
    }

    async fn run_transfers(&self, sender: &str, links: &[String]) -> String {
        info!(sender, count = links.len(), "transfer requested");
        if links.len() == 1 {
            return render_transfer(&self.orchestrator.transfer(&links[0]).await);
        }

        let mut lines = Vec::with_capacity(links.len() + 1);
        let mut saved = 0;
        for (idx, link) in links.iter().enumerate() {
            let outcome = self.orchestrator.transfer(link).await;
            if matches!(outcome, TransferOutcome::Success { .. }) {
                saved += 1;
            }
            lines.push(format!("{}. {}", idx + 1, render_transfer(&outcome)));
        }
        lines.insert(0, format!("Processed {} link(s), saved {saved}.", links.len()));
        lines.join("\n")
    }

    async fn share_selection(&self, n: usize, session: &mut SessionEntry) -> String {
        let count = session.search_hits.len();
        let Some(hit) = n.checked_sub(1).and_then(|i| session.search_hits.get(i)) else {
            return format!("Pick a number between 1 and {count}.");
        };
        render_transfer(&self.orchestrator.share_hit(hit).await)
    }
}

fn render_transfer(outcome: &TransferOutcome) -> String {
    match outcome {
        TransferOutcome::Success {
            share_link: Some(link),
            title,
        } => format!("✅ Saved \"{title}\".\n🔗 {link}"),
        TransferOutcome::Success {
            share_link: None,
            title,
        } => format!("✅ Saved \"{title}\". No share link was issued."),
        TransferOutcome::MissingCredential => {
            "No credential set yet. Send `cookie: <value>` first.".to_string()
        }
        TransferOutcome::AuthFailure => "❌ The drive rejected the stored credential.\n\
             Send `cookie: <value>` with a fresh one."
            .to_string(),
        TransferOutcome::SourceInvalid(reason) => format!("❌ Cannot use that link: {reason}"),
        TransferOutcome::QuotaExceeded => {
            "❌ The drive is out of capacity. Free some space and retry.".to_string()
        }
        TransferOutcome::Transient => {
            "⏳ The drive did not respond. Send the link again later.".to_string()
        }
    }
}

fn help_text() -> String {
    "📖 Commands\n\
     • Send a drive share link (or several) to save it\n\
     • `search` then a keyword, or `/search <keyword>`, to find files\n\
     • a number after a search to get a share link for that hit\n\
     • `cookie: <value>` to set the drive credential\n\
     • `verify` to check the credential\n\
     • `cancel` to leave any mode\n\
     • `help` to show this text"
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::OrchestratorConfig;
    use crate::provider::{MockDriveProvider, SavedContent, SearchHit};

    fn msg(sender: &str, text: &str) -> DecryptedMessage {
        DecryptedMessage {
            from_user: sender.to_string(),
            msg_id: "m-1".to_string(),
            create_time: 1_700_000_000,
            msg_type: MessageKind::Text,
            content: text.to_string(),
        }
    }

    async fn credential_store(with_token: bool) -> Arc<CredentialStore> {
        let path = std::env::temp_dir().join(format!(
            "quark-relay-dispatch-{}-{}.txt",
            std::process::id(),
            rand::random::<u32>()
        ));
        let store = Arc::new(CredentialStore::load(path).await);
        if with_token {
            store.set("cookie=ok").await.expect("persist");
        }
        store
    }

    async fn dispatcher(mock: MockDriveProvider, with_token: bool) -> Dispatcher {
        let credentials = credential_store(with_token).await;
        let orchestrator = Orchestrator::new(
            Arc::new(mock),
            credentials.clone(),
            OrchestratorConfig {
                default_folder_id: "0".to_string(),
                search_folder_id: "0".to_string(),
                retries: 0,
                search_display_limit: 10,
            },
        );
        Dispatcher::new(SessionStore::new(60), credentials, orchestrator)
    }

    #[test]
    fn classify_recognizes_commands() {
        assert_eq!(
            classify("cookie: abc=1; def=2"),
            Command::SetCookie("abc=1; def=2".to_string())
        );
        assert_eq!(classify("cookie:"), Command::CookiePrompt);
        assert_eq!(classify("VERIFY"), Command::Verify);
        assert_eq!(classify("/help"), Command::Help);
        assert_eq!(classify("search"), Command::SearchPrompt);
        assert_eq!(
            classify("/search report"),
            Command::Search("report".to_string())
        );
        assert_eq!(classify("cancel"), Command::Cancel);
        assert_eq!(classify("3"), Command::Number(3));
        assert_eq!(classify("hello"), Command::Free("hello".to_string()));
    }

    #[test]
    fn classify_prefers_links_over_mode_words() {
        match classify("see https://pan.quark.cn/s/abc123 thanks") {
            Command::Links(links) => {
                assert_eq!(links, vec!["https://pan.quark.cn/s/abc123".to_string()]);
            }
            other => panic!("expected links, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn search_keyword_then_query_dispatches_once() {
        let mut mock = MockDriveProvider::new();
        mock.expect_search()
            .withf(|query, folder, _| query == "report.pdf" && folder == "0")
            .times(1)
            .returning(|_, _, _| {
                Ok(vec![SearchHit {
                    fid: "f1".to_string(),
                    name: "report.pdf".to_string(),
                    is_dir: false,
                    path: "/docs".to_string(),
                }])
            });
        let d = dispatcher(mock, true).await;

        let prompt = d.handle(&msg("alice", "search")).await;
        assert!(prompt.contains("Search mode"));

        let reply = d.handle(&msg("alice", "report.pdf")).await;
        assert!(reply.contains("report.pdf"), "reply was: {reply}");

        // Mode is back to idle: the same text is now a usage hint
        let reply = d.handle(&msg("alice", "report.pdf")).await;
        assert!(reply.contains("did not understand"), "reply was: {reply}");
    }

    #[tokio::test]
    async fn link_during_search_mode_is_a_transfer() {
        let mut mock = MockDriveProvider::new();
        mock.expect_submit_transfer().times(1).returning(|_, _, _| {
            Ok(SavedContent {
                fid: None,
                title: "Movie".to_string(),
                file_count: 1,
                folder_count: 0,
            })
        });
        let d = dispatcher(mock, true).await;

        d.handle(&msg("alice", "search")).await;
        let reply = d
            .handle(&msg("alice", "https://pan.quark.cn/s/abc123"))
            .await;
        assert!(reply.contains("Saved"), "reply was: {reply}");
    }

    #[tokio::test]
    async fn cookie_command_sets_and_verifies() {
        let mut mock = MockDriveProvider::new();
        mock.expect_check_credential()
            .withf(|credential| credential == "newcookie=1")
            .times(1)
            .returning(|_| Ok("friend".to_string()));
        let d = dispatcher(mock, false).await;

        let reply = d.handle(&msg("alice", "cookie: newcookie=1")).await;
        assert!(reply.contains("verified"), "reply was: {reply}");
        assert_eq!(
            d.credentials.token().await.as_deref(),
            Some("newcookie=1")
        );
    }

    #[tokio::test]
    async fn bare_cookie_prompts_then_consumes_next_message() {
        let mut mock = MockDriveProvider::new();
        mock.expect_check_credential()
            .times(1)
            .returning(|_| Ok("friend".to_string()));
        let d = dispatcher(mock, false).await;

        let prompt = d.handle(&msg("alice", "cookie:")).await;
        assert!(prompt.contains("next message"), "reply was: {prompt}");

        let reply = d.handle(&msg("alice", "pasted-cookie=42")).await;
        assert!(reply.contains("Credential saved"), "reply was: {reply}");
        assert_eq!(
            d.credentials.token().await.as_deref(),
            Some("pasted-cookie=42")
        );
    }

    #[tokio::test]
    async fn number_selects_cached_search_hit() {
        let mut mock = MockDriveProvider::new();
        mock.expect_search().times(1).returning(|_, _, _| {
            Ok(vec![
                SearchHit {
                    fid: "f1".to_string(),
                    name: "a.mkv".to_string(),
                    is_dir: false,
                    path: "/".to_string(),
                },
                SearchHit {
                    fid: "f2".to_string(),
                    name: "b.mkv".to_string(),
                    is_dir: false,
                    path: "/".to_string(),
                },
            ])
        });
        mock.expect_create_share_link()
            .withf(|fid, title, _| fid == "f2" && title == "b.mkv")
            .times(1)
            .returning(|_, _, _| Ok("https://pan.quark.cn/s/new".to_string()));
        let d = dispatcher(mock, true).await;

        d.handle(&msg("alice", "/search mkv")).await;
        let reply = d.handle(&msg("alice", "2")).await;
        assert!(reply.contains("https://pan.quark.cn/s/new"), "reply was: {reply}");
    }

    #[tokio::test]
    async fn selection_out_of_range_is_an_input_error() {
        let mut mock = MockDriveProvider::new();
        mock.expect_search().times(1).returning(|_, _, _| {
            Ok(vec![SearchHit {
                fid: "f1".to_string(),
                name: "a.mkv".to_string(),
                is_dir: false,
                path: "/".to_string(),
            }])
        });
        let d = dispatcher(mock, true).await;

        d.handle(&msg("alice", "/search mkv")).await;
        let reply = d.handle(&msg("alice", "7")).await;
        assert!(reply.contains("between 1 and 1"), "reply was: {reply}");
    }

    #[tokio::test]
    async fn cancel_leaves_search_mode_without_action() {
        let mock = MockDriveProvider::new();
        let d = dispatcher(mock, true).await;

        d.handle(&msg("alice", "search")).await;
        let reply = d.handle(&msg("alice", "cancel")).await;
        assert!(reply.contains("nothing pending"), "reply was: {reply}");

        let reply = d.handle(&msg("alice", "plain text")).await;
        assert!(reply.contains("did not understand"), "reply was: {reply}");
    }

    #[tokio::test]
    async fn unknown_idle_text_gets_usage_hint() {
        let mock = MockDriveProvider::new();
        let d = dispatcher(mock, true).await;
        let reply = d.handle(&msg("alice", "what is this")).await;
        assert!(reply.contains("help"), "reply was: {reply}");
    }

    #[tokio::test]
    async fn event_messages_get_an_empty_ack() {
        let mock = MockDriveProvider::new();
        let d = dispatcher(mock, true).await;
        let mut event = msg("alice", "");
        event.msg_type = MessageKind::Event;
        assert_eq!(d.handle(&event).await, String::new());
    }

    #[tokio::test]
    async fn senders_have_independent_modes() {
        let mut mock = MockDriveProvider::new();
        mock.expect_search().times(1).returning(|_, _, _| Ok(vec![]));
        let d = dispatcher(mock, true).await;

        d.handle(&msg("alice", "search")).await;
        // Bob is still idle: his free text is a usage hint, not a query
        let reply = d.handle(&msg("bob", "holiday photos")).await;
        assert!(reply.contains("did not understand"), "reply was: {reply}");
        // Alice's next text is her query
        let reply = d.handle(&msg("alice", "holiday photos")).await;
        assert!(reply.contains("No matches"), "reply was: {reply}");
    }
}
