use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (SOCIAL_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("SOCIAL_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("social_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    let config = social_server::config::ServerConfig::parse();
    tracing::info!("Starting social server on {}", config.listen_addr);
    match config.db_path {
        Some(ref path) => tracing::info!("Database: {path}"),
        None => tracing::warn!("No --db-path given; data will not survive a restart"),
    }
    if config.allowed_origins.is_empty() {
        tracing::warn!("No CORS origins configured; browsers on other origins will be refused");
    }
    let server = social_server::server::Server::new(config);
    server.run().await
}
