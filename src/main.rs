use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use slotline::config::Config;
use slotline::engine::Engine;
use slotline::notify::{Notification, NotifyHub};
use slotline::{api, observability, reaper};

/// Stand-in for the mail service: logs what would be sent.
async fn run_dispatcher(hub: Arc<NotifyHub>) {
    let mut rx = hub.subscribe();
    loop {
        match rx.recv().await {
            Ok(Notification::BookingConfirmed(b)) => {
                info!(booking = %b.id, email = %b.customer.email, "send confirmation");
            }
            Ok(Notification::BookingReminder { booking, kind }) => {
                info!(booking = %booking.id, email = %booking.customer.email, kind = kind.label(), "send reminder");
            }
            Ok(Notification::Committed(_)) => {}
            Err(RecvError::Lagged(n)) => warn!("dispatcher lagged, {n} notifications dropped"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "slotline=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    observability::init(config.metrics_port)?;
    std::fs::create_dir_all(&config.data_dir)?;

    let hub = Arc::new(NotifyHub::new());
    let engine = Arc::new(
        Engine::new(config.wal_path(), hub.clone())?.with_slot_granularity(config.slot_granularity)?,
    );

    tokio::spawn(run_dispatcher(hub));
    tokio::spawn(reaper::run_reaper(
        engine.clone(),
        config.reaper_interval,
        config.pending_payment_ttl,
    ));
    tokio::spawn(reaper::run_compactor(engine.clone(), config.compact_threshold));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("slotline listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  slot granularity: {} min", config.slot_granularity);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let app = api::router(engine, config.request_timeout);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("slotline stopped");
    Ok(())
}
