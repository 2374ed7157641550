#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use dotenv::dotenv;
use poem::{EndpointExt, Route, Server, get, listener::TcpListener, middleware::Tracing};
use tracing::info;

use devgate::gateway::config::GatewayConfig;
use devgate::gateway::handlers::{
    FilesHandler, GitHandler, MonitorHandler, SearchHandler, SshHandler,
};
use devgate::gateway::registry::ConnectionRegistry;
use devgate::gateway::router::MessageRouter;
use devgate::gateway::server::{GatewayState, healthz, ws_endpoint};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let config = GatewayConfig::from_env();
    let bind_addr = format!("0.0.0.0:{}", config.port);
    info!("Starting gateway on {}", bind_addr);

    // The registry is constructed here and injected; the ssh handler and
    // the shutdown path share one instance.
    let registry = Arc::new(ConnectionRegistry::new());
    let router = Arc::new(MessageRouter::new(vec![
        Arc::new(SshHandler::new(registry.clone(), config.ssh_connect_timeout)),
        Arc::new(FilesHandler::new()),
        Arc::new(SearchHandler::new()),
        Arc::new(GitHandler::new()),
        Arc::new(MonitorHandler::new(config.agent_log_dir.clone())),
    ]));
    let state = Arc::new(GatewayState { config, router });

    let app = Route::new()
        .at("/ws", get(ws_endpoint))
        .at("/healthz", get(healthz))
        .data(state)
        .with(Tracing);

    info!("Gateway ready: WebSocket endpoint at /ws");

    Server::new(TcpListener::bind(bind_addr))
        .name("devgate")
        .run_with_graceful_shutdown(
            app,
            async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown signal received");
            },
            Some(Duration::from_secs(5)),
        )
        .await?;

    // Tear down every remote connection before exiting
    registry.shutdown().await;

    Ok(())
}
