//! Realtime notification channel
//!
//! ```text
//! ┌──────────────┐  notify   ┌───────────────────────────┐  try_send  ┌──────────────┐
//! │ Orchestrator │ ────────► │ Hub (RwLock<HashMap>)     │ ─────────► │ queue (mpsc) │
//! └──────────────┘           │ id → identity, role, tx   │            └──────┬───────┘
//!                            └───────────────────────────┘                   │
//!                                                                    writer task ──► WebSocket
//! ```
//!
//! Clients connect to `/ws?userId=<identity>` (or send `X-User-ID`) and only
//! receive. Inbound frames are liveness signals and nothing more.

pub mod connection;
pub mod hub;
pub mod protocol;

use std::sync::Arc;

use tokio::net::TcpListener;

use crate::cli::HeartbeatConfig;
use crate::store::WorkflowStore;

pub use connection::{handle_connection, identity_token, REALTIME_PATH};
pub use hub::{ConnectionId, Hub, Registration};
pub use protocol::{events, Notification};

/// Accept realtime connections until the listener fails
pub async fn serve(
    listener: TcpListener,
    hub: Arc<Hub>,
    store: WorkflowStore,
    heartbeat: HeartbeatConfig,
) -> std::io::Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tracing::debug!("Accepted realtime connection from {}", addr);
                let hub = Arc::clone(&hub);
                let store = store.clone();
                tokio::spawn(async move {
                    handle_connection(stream, hub, store, heartbeat).await;
                });
            }
            Err(e) => {
                tracing::error!("Failed to accept realtime connection: {}", e);
            }
        }
    }
}
