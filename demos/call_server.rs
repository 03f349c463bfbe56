use std::{net::SocketAddr, sync::Arc};

use meshrelay::{
    config::{MediaConfig, OrchestratorConfig, ServerConfig},
    orchestrator::MediaOrchestrator,
    rtc_peer::RtcEngine,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), meshrelay::error::Error> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let server_config = ServerConfig::from_env()?;
    let transport = server_config.transport_config();
    let media = MediaConfig::default();

    let engine = Arc::new(RtcEngine::new(media.clone(), transport.clone()));
    let orchestrator = MediaOrchestrator::new(
        engine,
        OrchestratorConfig {
            media,
            transport,
            ..Default::default()
        },
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], server_config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    meshrelay::server::serve(listener, orchestrator).await
}
