//! Server configuration using clap with environment fallbacks
//!
//! Every flag can also be supplied through a `MEDFLOW_*` environment variable,
//! which is how container deployments configure the server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Medical examination workflow server
#[derive(Parser, Debug, Clone)]
#[command(name = "medflow-server")]
#[command(about = "REST + realtime backend for clinic/employer medical examinations")]
#[command(version)]
pub struct ServerConfig {
    /// Address for the REST listener
    #[arg(long, env = "MEDFLOW_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    pub http_addr: SocketAddr,

    /// Address for the realtime (WebSocket) listener
    #[arg(long, env = "MEDFLOW_WS_ADDR", default_value = "0.0.0.0:8081")]
    pub ws_addr: SocketAddr,

    /// SQLite database path (`:memory:` for an ephemeral store)
    #[arg(long, env = "MEDFLOW_DATABASE", default_value = "medflow.db")]
    pub database: PathBuf,

    /// Budget for point lookups, in milliseconds
    #[arg(long, env = "MEDFLOW_LOOKUP_TIMEOUT_MS", default_value = "5000")]
    pub lookup_timeout_ms: u64,

    /// Budget for list/aggregate scans, in milliseconds
    #[arg(long, env = "MEDFLOW_SCAN_TIMEOUT_MS", default_value = "10000")]
    pub scan_timeout_ms: u64,

    /// Budget for writes, in milliseconds
    #[arg(long, env = "MEDFLOW_WRITE_TIMEOUT_MS", default_value = "10000")]
    pub write_timeout_ms: u64,

    /// Outbound queue capacity per realtime connection
    #[arg(long, env = "MEDFLOW_QUEUE_CAPACITY", default_value = "256")]
    pub queue_capacity: usize,

    /// Seconds between server liveness pings
    #[arg(
        long,
        env = "MEDFLOW_PING_INTERVAL_SECS",
        default_value = "54",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub ping_interval_secs: u64,

    /// Close a connection after this many seconds without an inbound frame
    #[arg(
        long,
        env = "MEDFLOW_IDLE_TIMEOUT_SECS",
        default_value = "60",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn store_timeouts(&self) -> StoreTimeouts {
        StoreTimeouts {
            lookup: Duration::from_millis(self.lookup_timeout_ms),
            scan: Duration::from_millis(self.scan_timeout_ms),
            write: Duration::from_millis(self.write_timeout_ms),
        }
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

/// Per-call budgets for store operations, by operation class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreTimeouts {
    pub lookup: Duration,
    pub scan: Duration,
    pub write: Duration,
}

impl Default for StoreTimeouts {
    fn default() -> Self {
        Self {
            lookup: Duration::from_secs(5),
            scan: Duration::from_secs(10),
            write: Duration::from_secs(10),
        }
    }
}

/// Liveness settings for realtime connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(54),
            idle_timeout: Duration::from_secs(60),
        }
    }
}
