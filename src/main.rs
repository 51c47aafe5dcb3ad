//! medflow-server entry point
//!
//! ```bash
//! medflow-server --http-addr 0.0.0.0:8080 --ws-addr 0.0.0.0:8081 --database medflow.db
//! ```

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use medflow_server::{api, realtime, Hub, Orchestrator, ServerConfig, WorkflowStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("medflow_server=info".parse()?))
        .init();

    let config = ServerConfig::parse();

    let store = WorkflowStore::open(&config.database, config.store_timeouts())?;
    tracing::info!("Workflow store open at {}", config.database.display());

    let hub = Arc::new(Hub::new(config.queue_capacity));
    let orchestrator = Orchestrator::new(store.clone(), Arc::clone(&hub));

    let ws_listener = TcpListener::bind(config.ws_addr).await?;
    tracing::info!(
        "Realtime channel listening on ws://{}{}",
        config.ws_addr,
        realtime::REALTIME_PATH
    );
    let heartbeat = config.heartbeat();
    let realtime_task = tokio::spawn(realtime::serve(ws_listener, hub, store, heartbeat));

    let http_listener = TcpListener::bind(config.http_addr).await?;
    tracing::info!("REST API listening on http://{}", config.http_addr);
    let app = api::router(orchestrator);

    tokio::select! {
        result = axum::serve(http_listener, app.into_make_service()) => {
            result?;
        }
        result = realtime_task => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}
