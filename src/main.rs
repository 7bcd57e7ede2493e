use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use delivery_notify::api;
use delivery_notify::channels::{HttpGateway, OutboundSender, SerializedSender};
use delivery_notify::clock::SystemClock;
use delivery_notify::config::AppConfig;
use delivery_notify::core::{Core, CoreDeps};
use delivery_notify::llm::create_provider;
use delivery_notify::orders::{HttpOrderSource, OrderSource};
use delivery_notify::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(&config);

    eprintln!("📦 Delivery Notify v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Gateway: {} (instance {})", config.gateway.base_url, config.gateway.instance);
    match &config.assistant {
        Some(a) => eprintln!("   Assistant: {:?} / {}", a.backend, a.model),
        None => eprintln!("   Assistant: disabled (no DELIVERY_NOTIFY_LLM_API_KEY)"),
    }

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Collaborators ────────────────────────────────────────────────────
    let sender: Arc<dyn OutboundSender> = Arc::new(SerializedSender::new(HttpGateway::new(&config.gateway)));
    let llm = config
        .assistant
        .as_ref()
        .map(create_provider)
        .transpose()
        .context("failed to create AI provider")?;
    let order_source = config.order_source_url.as_ref().map(|url| {
        Arc::new(HttpOrderSource::new(url.clone(), config.order_source_token.clone())) as Arc<dyn OrderSource>
    });
    if order_source.is_none() {
        eprintln!("   Orders: no DELIVERY_NOTIFY_ORDERS_URL, runs need explicit recipients");
    }

    // ── Core ─────────────────────────────────────────────────────────────
    let core = Core::new(CoreDeps {
        store,
        sender,
        llm,
        order_source,
        clock: Arc::new(SystemClock),
        survey_policy: config.survey_policy.clone(),
    })
    .await
    .context("failed to start core")?;

    let _sweep_handle = core.spawn_sweepers()?;
    eprintln!("   Survey sweeps: {}", config.survey_policy.sweep_schedule);

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api::router(Arc::clone(&core));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("failed to bind port {}", config.http_port))?;
    eprintln!("   API: http://0.0.0.0:{}/api", config.http_port);
    eprintln!("   Events: ws://0.0.0.0:{}/ws/events\n", config.http_port);
    tracing::info!(port = config.http_port, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}

/// Console logging filtered by `RUST_LOG` (default `info`), plus a daily
/// rolling file when a log directory is configured.
fn init_tracing(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "delivery-notify.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}
