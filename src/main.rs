use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use lead_router::api::{self, AppState};
use lead_router::channels::{OutboundChannel, QueueNotifier, WebhookNotifier, WhatsAppChannel};
use lead_router::config::AppConfig;
use lead_router::error::Error;
use lead_router::migration::{HealthMetrics, LegacyHttpHandler, MigrationController, TrafficRouter};
use lead_router::phone::PhoneNormalizer;
use lead_router::pipeline::RouterPipeline;
use lead_router::pipeline::types::MessageHandler;
use lead_router::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("loading configuration")?;

    // Initialize tracing: stderr always, plus daily files when a log dir is set.
    let (file_layer, _log_guard) = match config.log_dir {
        Some(ref dir) => {
            let appender = tracing_appender::rolling::daily(dir, "lead-router.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    eprintln!("📨 Lead Router v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Webhook: http://0.0.0.0:{}/webhook/messages", config.port);
    eprintln!("   Database: {}", config.db_path.display());

    let state = build_state(&config)
        .await
        .context("initializing services")?;

    // ── HTTP server ──────────────────────────────────────────────────────
    let app = api::routes(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "Lead router listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down");
        })
        .await?;
    Ok(())
}

/// Wire the store, channels, pipeline and (optionally) the migration layer.
async fn build_state(config: &AppConfig) -> Result<AppState, Error> {
    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);

    // ── Channels ─────────────────────────────────────────────────────────
    let channel: Arc<dyn OutboundChannel> = Arc::new(WhatsAppChannel::new(
        config.whatsapp.api_base.clone(),
        config.whatsapp.phone_number_id.clone(),
        config.whatsapp.access_token.clone(),
        config.whatsapp.send_timeout,
    )?);
    let notifier: Arc<dyn QueueNotifier> = Arc::new(WebhookNotifier::new(
        config.notify_urls.clone(),
        config.notify_timeout,
    )?);

    // ── Pipeline ─────────────────────────────────────────────────────────
    let pipeline = Arc::new(RouterPipeline::new(
        Arc::clone(&db),
        channel,
        notifier,
        PhoneNormalizer::new(config.country_code.clone()),
        config.evaluator,
    ));

    // ── Migration layer ──────────────────────────────────────────────────
    let controller = match config.migration {
        Some(ref migration) => {
            let health = Arc::new(HealthMetrics::new(migration.health_window).with_store(Arc::clone(&db)));
            let router = Arc::new(
                TrafficRouter::new(migration.routing.clone(), health)
                    .with_normalizer(PhoneNormalizer::new(config.country_code.clone())),
            );
            let legacy: Arc<dyn MessageHandler> =
                Arc::new(LegacyHttpHandler::new(migration.legacy_url.clone(), migration.legacy_timeout)?);
            eprintln!(
                "   Migration: legacy at {} ({}% {})",
                migration.legacy_url,
                migration.routing.percentage,
                migration.routing.mode.as_str()
            );
            Some(Arc::new(
                MigrationController::new(legacy, Arc::clone(&pipeline) as Arc<dyn MessageHandler>, router)
                    .with_store(Arc::clone(&db)),
            ))
        }
        None => None,
    };

    Ok(AppState {
        pipeline,
        controller,
    })
}
