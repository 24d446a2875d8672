use pm_mode_mailer::{
    config::Config,
    logging::{self, DbLogWriter},
    notify::build_notifier,
    poll::{Mailer, Timing},
    source::MySqlConnector,
    store::StatusStore,
};
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cfg_path =
        std::env::var("APP_CONFIG").unwrap_or_else(|_| "config/config.example.yaml".into());
    let cfg = Config::load(&cfg_path)?;

    // dropping the handle stops the file writer, so it lives until main returns
    let mut log_handle = logging::init(&cfg.logging)?;
    info!(
        config = %cfg_path,
        poll_interval_secs = cfg.mailer.poll_interval_secs,
        status_file = %cfg.mailer.status_file.display(),
        "configuration loaded"
    );

    let (pool_tx, pool_rx) = watch::channel(None);
    let mut connector = MySqlConnector::new(cfg.database.clone()).with_pool_listener(pool_tx);
    if let Some(rx) = log_handle.db_logs.take() {
        let (writer, flusher) = DbLogWriter::new(rx, pool_rx, cfg.mailer.source_script.clone());
        tokio::spawn(writer.run());
        connector = connector.with_log_flusher(flusher);
    }

    let notifier = build_notifier(&cfg.notifier)?;
    let store = StatusStore::new(cfg.mailer.status_file.clone());
    let mailer = Mailer::new(connector, store, notifier, Timing::from(&cfg.mailer));

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    mailer.run(stop_rx).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
