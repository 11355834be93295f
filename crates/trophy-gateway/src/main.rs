use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use trophy_core::config::TrophyConfig;
use trophy_gateway::{app, shutdown};

/// Live challenge-completion feed over Server-Sent Events.
#[derive(Debug, Parser)]
#[command(name = "trophy-gateway", version, about)]
struct Cli {
    /// Path to trophy.toml (default: ~/.trophy/trophy.toml).
    #[arg(long, env = "TROPHY_CONFIG")]
    config: Option<String>,

    /// Override the listen port from the config file.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "trophy_gateway=info,trophy_broker=info,tower_http=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config / TROPHY_CONFIG > ~/.trophy/trophy.toml
    let mut config = TrophyConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        TrophyConfig::default()
    });
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let stream_path = config.stream.path.clone();

    let state = Arc::new(app::AppState::new(config));
    let router = app::build_router(state.clone());

    info!(%addr, stream = %stream_path, "trophy gateway listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown::shutdown_signal(Arc::clone(&state.hub)))
        .await?;

    info!("trophy gateway stopped");
    Ok(())
}
