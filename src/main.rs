use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use dingbridge::chatbot::{
    ChatbotEngine, DingTalkReplier, EngineConfig, EngineParts, OpenAiBackend, PublicLookup, SessionStore,
    TranscriptStore,
};
use dingbridge::config::Config;
use dingbridge::server::{self, AppState};

/// How long in-flight requests get after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Upper bound on a single session-webhook delivery.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

fn env_filter(default_level: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());
    let config = Config::load(&config_path)?;

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    let log_file = tracing_appender::rolling::daily(&log_dir, "dingbridge.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(env_filter(&config.log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(env_filter(&config.log_level)),
        )
        .init();

    info!("🚀 Starting dingbridge...");
    info!("Loaded config from {config_path}");
    info!("Service URL: {}", config.service_url);
    if let Some(ref chat_type) = config.policy.chat_type {
        info!("Chat type restricted to {}", chat_type);
    }

    let sessions = SessionStore::in_memory(config.session_ttls);
    let transcripts = Arc::new(
        TranscriptStore::open(&config.database_path())
            .with_context(|| format!("failed to open {}", config.database_path().display()))?,
    );
    let backend = Arc::new(OpenAiBackend::new(config.backend.clone())?);
    let lookup = Arc::new(PublicLookup::new(config.backend.timeout)?);
    let replier = Arc::new(DingTalkReplier::new(REPLY_TIMEOUT)?);

    let engine = Arc::new(ChatbotEngine::new(
        EngineConfig::from_config(&config),
        EngineParts {
            sessions: sessions.clone(),
            transcripts,
            backend,
            replier,
            lookup,
        },
    ));

    // Session sweeper
    let sweep_every = config.session_cleanup;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        interval.tick().await;
        loop {
            interval.tick().await;
            sessions.purge_expired();
        }
    });

    if config.console {
        tokio::spawn(dingbridge::console::run(engine.clone()));
    }

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    info!("👂 Listening on {}", listener.local_addr()?);

    let router = server::build_router(Arc::new(AppState::new(engine)));
    if let Err(e) = server::serve(listener, router, server::shutdown_signal(), SHUTDOWN_GRACE).await {
        warn!("Server stopped with error: {}", e);
    }
    info!("Server exiting!");
    Ok(())
}
