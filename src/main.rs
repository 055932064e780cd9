#![forbid(unsafe_code)]

use anyhow::Context;
use huddle::engine::stub::StubEngine;
use huddle::media::MediaConfig;
use huddle::metrics::ServerMetrics;
use huddle::room::{events::spawn_event_pump, RoomManager};
use huddle::signaling::SignalingServer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("huddle - starting SFU signaling server");

    let jwt_secret =
        std::env::var("JWT_SECRET").context("JWT_SECRET is required for join token verification")?;

    let media_config = MediaConfig::from_env();
    let metrics = ServerMetrics::new();

    // In-process engine; a libmediasoup binding plugs in behind the same
    // trait for real media forwarding.
    let (engine, engine_events) = StubEngine::new();
    let manager = RoomManager::new(engine, media_config, jwt_secret, metrics.clone()).await?;
    let pump = spawn_event_pump(manager.clone(), engine_events);

    info!(
        "Worker pool ready ({} workers)",
        manager.worker_pool().worker_count()
    );

    let server = SignalingServer::new(manager.clone(), metrics);
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);

    tokio::select! {
        result = server.serve(port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            manager.shutdown().await;
        }
    }

    pump.abort();
    info!("Server shutdown complete");
    Ok(())
}
