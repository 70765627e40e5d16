use std::path::PathBuf;
use std::sync::Arc;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use pingpongd::api;
use pingpongd::config::Config;
use pingpongd::hooks::CommandHooks;
use pingpongd::{Engine, PeerCallbacks};

#[derive(Parser, Debug)]
#[command(name = "pingpongd", version, about = "Discovers ping/pong peers on the local network")]
struct Args {
    /// TOML config file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Identity prefix, overrides node.prefix
    #[arg(short, long)]
    prefix: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pingpongd=info,shared=info"))
        )
        .init();

    let args = Args::parse();
    tracing::info!("Starting pingpongd");

    let mut config = match &args.config {
        Some(path) => {
            let config = Config::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => Config::default(),
    };
    if let Some(prefix) = args.prefix {
        config.node.prefix = prefix;
    }

    let callbacks = PeerCallbacks::new()
        .on_added(|peer| {
            tracing::info!("Peer added: {} at {:?} port {}", peer.identifier, peer.addresses, peer.port);
        })
        .on_removed(|peer| {
            tracing::info!("Peer removed: {}", peer.identifier);
        });

    let engine = Engine::builder(config.clone())
        .hooks(Arc::new(CommandHooks::from_config(&config.hooks)))
        .callbacks(callbacks)
        .start()
        .await
        .context("Failed to start engine")?;
    let engine = Arc::new(engine);

    tracing::info!("Identity {} listening on port {}", engine.identity(), engine.listen_port());

    let cancel = CancellationToken::new();
    let api_handle = if config.api.enabled {
        let listener = match tokio::net::TcpListener::bind(&config.api.listen).await {
            Ok(listener) => listener,
            Err(e) => {
                engine.stop().await;
                return Err(e).with_context(|| format!("Failed to bind to {}", config.api.listen));
            }
        };
        tracing::info!("API listening on {}", config.api.listen);

        let app = api::router(api::AppState::new(engine.clone()));
        let server_cancel = cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_cancel.cancelled().await })
                .await
            {
                tracing::error!("API server error: {}", e);
            }
        }))
    } else {
        None
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c, shutting down: {}", e);
    }

    tracing::info!("Shutdown signal received");
    cancel.cancel();

    if let Some(handle) = api_handle {
        if let Err(e) = handle.await {
            tracing::error!("API task failed: {}", e);
        }
    }

    let report = engine.stop().await;
    if report.is_clean() {
        tracing::info!("Shutdown complete");
    } else {
        for failure in &report.failures {
            tracing::warn!("Shutdown step failed: {}", failure);
        }
    }
    Ok(())
}
