use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

mod config;
mod errors;
mod http;
mod manager;
mod publisher;
mod registry;
mod resolver;
mod session;
mod supervisor;

use config::Config;
use http::AppState;
use manager::StreamManager;
use registry::{CameraRegistry, SqliteCameraRegistry};
use session::RtspConnector;

#[derive(Parser, Debug)]
#[command(name = "camgate", about = "RTSP camera gateway serving live MJPEG over HTTP")]
struct Args {
    /// Configuration file (TOML, or JSON with a .json extension)
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Override the listen host from the config file
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port from the config file
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camgate=debug,info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::load(&args.config).unwrap_or_else(|e| {
        warn!("Could not load {}: {}, using default configuration", args.config, e);
        Config::default()
    });
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    info!(
        "Starting camera gateway on {}:{}",
        config.server.host, config.server.port
    );

    let registry = Arc::new(SqliteCameraRegistry::connect(&config.registry.database_url).await?);
    registry.initialize().await?;
    if config.registry.seed {
        let added = registry.seed_if_empty().await?;
        if added > 0 {
            info!("Seeded registry with {} sample cameras", added);
        }
    }

    let connector = Arc::new(RtspConnector::new(
        config.stream.transport.clone(),
        config.stream.buffer_size,
    ));
    let manager = Arc::new(StreamManager::new(config.stream.clone(), connector));

    for camera in registry.list_cameras(true).await? {
        info!("Starting stream for camera '{}'", camera.name);
        manager.on_camera_added(camera).await;
    }

    let cors_layer = if let Some(origin) = &config.server.cors_allow_origin {
        if origin == "*" {
            tower_http::cors::CorsLayer::permissive()
        } else {
            match origin.parse::<axum::http::HeaderValue>() {
                Ok(origin_header) => tower_http::cors::CorsLayer::new()
                    .allow_origin(origin_header)
                    .allow_methods(tower_http::cors::Any)
                    .allow_headers(tower_http::cors::Any),
                Err(_) => {
                    warn!("Invalid CORS origin '{}', falling back to permissive", origin);
                    tower_http::cors::CorsLayer::permissive()
                }
            }
        }
    } else {
        tower_http::cors::CorsLayer::permissive()
    };

    let state = AppState {
        manager: manager.clone(),
        registry: registry.clone(),
        fps_limit: config.stream.fps_limit,
    };
    let app = http::router(state).layer(cors_layer);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down camera streams");
    manager.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
