use anyhow::Context;
use quark_relay::config::Settings;
use quark_relay::credential::CredentialStore;
use quark_relay::crypto::{CallbackSignature, EnvelopeCipher};
use quark_relay::dedup::MessageDedup;
use quark_relay::dispatch::Dispatcher;
use quark_relay::orchestrator::{Orchestrator, OrchestratorConfig};
use quark_relay::provider::QuarkClient;
use quark_relay::push::PushClient;
use quark_relay::session::SessionStore;
use quark_relay::webhook::{self, AppState};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    info!("Starting quark-relay...");

    let settings = Settings::new().context("failed to load configuration")?;
    let state = build_state(&settings).await?;
    let app = webhook::router(state);

    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on http://{addr} (callback at /callback)");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn build_state(settings: &Settings) -> anyhow::Result<AppState> {
    let signature = Arc::new(CallbackSignature::new(settings.callback_token.clone()));
    let cipher = Arc::new(
        EnvelopeCipher::new(&settings.encoding_aes_key, settings.corp_id.clone())
            .context("encoding_aes_key must decode to 32 bytes")?,
    );

    let credentials = Arc::new(CredentialStore::load(settings.credential_path()).await);
    info!(
        configured = credentials.token().await.is_some(),
        "credential store loaded"
    );

    let provider = Arc::new(QuarkClient::new(
        settings.drive_api_base.clone(),
        settings.drive_account_base.clone(),
        settings.provider_timeout_secs,
    ));
    let orchestrator = Orchestrator::new(
        provider,
        credentials.clone(),
        OrchestratorConfig {
            default_folder_id: settings.default_folder_id.clone(),
            search_folder_id: settings.search_folder_id.clone(),
            retries: settings.provider_retries,
            search_display_limit: settings.search_display_limit,
        },
    );
    let dispatcher = Arc::new(Dispatcher::new(
        SessionStore::new(settings.session_timeout_secs),
        credentials,
        orchestrator,
    ));

    let push = Arc::new(PushClient::new(
        settings.platform_api_base.clone(),
        settings.corp_id.clone(),
        settings.agent_id.clone(),
        settings.corp_secret.clone(),
        settings.provider_timeout_secs,
    ));
    let dedup = Arc::new(MessageDedup::new(
        settings.dedup_ttl_secs,
        settings.dedup_capacity,
    ));

    Ok(AppState {
        signature,
        cipher,
        dedup,
        dispatcher,
        push,
        reply_deadline: Duration::from_secs(settings.reply_deadline_secs),
    })
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}
