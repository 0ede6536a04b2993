use sqlbridge::config::SyncConfig;
use sqlbridge::SyncApp;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = match SyncConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("sqlbridge: {}", e);
            std::process::exit(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_filter())),
        )
        .init();

    let app = match SyncApp::start(config).await {
        Ok(app) => app,
        Err(e) => {
            log::error!("Startup failed: {}", e);
            std::process::exit(1);
        }
    };
    log::info!("sqlbridge running, press Ctrl+C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
    }
    log::info!("Shutting down");
    app.stop().await;
}
