use std::sync::Arc;

use gridbot_engine::config::Config;
use gridbot_engine::http::{router, AppState};
use gridbot_engine::notifications::NotificationBus;
use gridbot_engine::store::Store;
use gridbot_engine::supervisor::Supervisor;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.rust_log_default.clone())),
        )
        .with_max_level(Level::INFO)
        .init();

    info!("connecting to persistence store");
    let store = Store::connect(&config.database_url).await?;
    store.migrate().await?;

    let notifications = NotificationBus::new();
    let supervisor = Supervisor::new(config.clone(), store.clone(), notifications.clone());

    let app = router(AppState {
        supervisor: supervisor.clone(),
        store,
        notifications,
        config: config.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "gridbot engine listening");

    let shutdown = shutdown_signal(supervisor.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("gridbot engine exited cleanly");
    Ok(())
}

async fn shutdown_signal(supervisor: Arc<Supervisor>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl_c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, stopping all bots");
    supervisor.shutdown_all().await;
}
