//! REST and realtime listeners bound to ephemeral local ports

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use medflow_server::{api, realtime, HeartbeatConfig, Hub, Orchestrator, WorkflowStore};
use tokio::net::TcpListener;

/// Serve the REST router and return its base URL
pub async fn spawn_api(orchestrator: Orchestrator) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind api");
    let addr = listener.local_addr().expect("api addr");
    let app = api::router(orchestrator);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service()).await;
    });
    format!("http://{}", addr)
}

/// Serve the realtime channel and return its address
pub async fn spawn_realtime(
    hub: Arc<Hub>,
    store: WorkflowStore,
    heartbeat: HeartbeatConfig,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind realtime");
    let addr = listener.local_addr().expect("realtime addr");
    tokio::spawn(realtime::serve(listener, hub, store, heartbeat));
    addr
}

/// Heartbeat settings short enough for tests that exercise idle expiry
pub fn fast_heartbeat() -> HeartbeatConfig {
    HeartbeatConfig {
        ping_interval: Duration::from_millis(100),
        idle_timeout: Duration::from_millis(300),
    }
}

/// Wait until `check` holds, polling for at most two seconds
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
