mod config;

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use unveil_api::{AppState, router};
use unveil_engine::{ChannelProvider, Engine, LogProvider, ProviderSet, WebhookProvider, run_scheduler_loop};
use unveil_types::Channel;

use crate::config::{ServerConfig, parse_flag};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    init_logging();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {:#}", e);
            eprintln!("       Check your .env file and restart.");
            std::process::exit(1);
        }
    };

    if config.compliance.kill_switch {
        warn!("SMS kill switch is on: brand and opt-out lines are suppressed");
    }
    if config.compliance.full_fallback {
        warn!("SMS full fallback is on: messages go out as raw bodies");
    }

    let db = Arc::new(unveil_db::Database::open(&config.db_path)?);
    let providers = providers(&config)?;
    let engine = Engine::new(
        db,
        providers,
        config.compliance,
        config.dispatch,
        config.scheduler_batch_size,
    );

    // Repair counts left behind by older releases before the worker starts.
    match engine.scheduler.backfill_recipient_counts() {
        Ok(report) if report.corrected > 0 => info!(
            "Backfill corrected {} of {} scheduled messages",
            report.corrected, report.examined
        ),
        Ok(_) => {}
        Err(e) => error!("Recipient count backfill failed: {}", e),
    }

    tokio::spawn(run_scheduler_loop(
        engine.scheduler.clone(),
        config.scheduler_interval_secs,
        config.claim_timeout,
    ));

    if config.webhook_secret.is_none() {
        warn!("UNVEIL_WEBHOOK_SECRET is unset; delivery status callbacks are disabled");
    }

    let state = AppState {
        engine,
        jwt_secret: config.jwt_secret.clone(),
        webhook_secret: config.webhook_secret.clone(),
    };

    let app = router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = config.addr()?;
    info!("Unveil server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "unveil=debug,tower_http=debug".into());
    let json = std::env::var("UNVEIL_LOG_JSON")
        .ok()
        .and_then(|v| parse_flag(&v))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// A relay per configured channel; the rest only log.
fn providers(config: &ServerConfig) -> anyhow::Result<ProviderSet> {
    let secret = config.webhook_secret.clone().unwrap_or_default();
    let pick = |channel: Channel, url: Option<&str>| -> anyhow::Result<Arc<dyn ChannelProvider>> {
        let provider: Arc<dyn ChannelProvider> = match url {
            Some(url) => {
                info!("{} relay: {}", channel, url);
                Arc::new(WebhookProvider::new(
                    channel,
                    url,
                    secret.clone().into_bytes(),
                    config.dispatch.provider_timeout,
                )?)
            }
            None => {
                info!("{} relay not configured; using dry-run provider", channel);
                Arc::new(LogProvider::new(channel))
            }
        };
        Ok(provider)
    };

    Ok(ProviderSet {
        sms: pick(Channel::Sms, config.sms_webhook_url.as_deref())?,
        push: pick(Channel::Push, config.push_webhook_url.as_deref())?,
        email: pick(Channel::Email, config.email_webhook_url.as_deref())?,
    })
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    ctrl_c.await.ok();
                    info!("Received Ctrl+C, shutting down...");
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
