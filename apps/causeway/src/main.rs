use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use causeway::{
    cli::{run_streams_client, Cli, Commands},
    config::Config,
    directory::StreamDirectory,
    handlers::{health_check, list_streams, stream_stats},
    negotiate::Negotiator,
    registry::SessionRegistry,
    upstream::{MediaServer, RpcMediaServer},
    websocket::{websocket_handler, SignalingState},
};

#[tokio::main]
async fn main() {
    // Default to WARN level if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    if let Some(Commands::Streams { url }) = cli.command {
        if let Err(e) = run_streams_client(url).await {
            error!("streams client error: {}", e);
            std::process::exit(1);
        }
        return;
    }

    let config = Config::from_env();
    info!("Starting causeway signaling server on port {}", config.port);
    info!("Media server URL: {}", config.media_server_url);

    let media: Arc<dyn MediaServer> = match RpcMediaServer::connect(&config.media_server_url).await
    {
        Ok(media) => Arc::new(media),
        Err(e) => {
            error!("Failed to connect to media server: {}", e);
            std::process::exit(1);
        }
    };

    let registry = Arc::new(SessionRegistry::new(config.candidate_queue_depth));
    let directory = Arc::new(StreamDirectory::new(media.clone()));
    let negotiator = Arc::new(Negotiator::new(
        media.clone(),
        registry.clone(),
        directory.clone(),
        Duration::from_millis(config.upstream_timeout_ms),
    ));

    let state = SignalingState {
        registry,
        directory,
        negotiator,
        media,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/streams", get(list_streams))
        .route("/streams/:id/stats", get(stream_stats))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    info!("Causeway listening on {}", addr);

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
