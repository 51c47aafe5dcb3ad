//! medflow-server: clinic/employer medical examination workflow backend
//!
//! Clinics and employers sign contracts covering employee examinations.
//! Employees then visit a clinic and walk a route sheet of specialist
//! examinations. This crate provides:
//!
//! - a SQLite-backed workflow store ([`store`])
//! - an orchestrator that applies writes and fans out their side effects
//!   ([`workflow`])
//! - a realtime hub delivering notifications over WebSocket ([`realtime`])
//! - the REST surface ([`api`])
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use medflow_server::{Hub, Orchestrator, StoreTimeouts, WorkflowStore};
//!
//! let store = WorkflowStore::open_in_memory(StoreTimeouts::default())?;
//! let hub = Arc::new(Hub::new(256));
//! let orchestrator = Orchestrator::new(store, hub);
//! let app = medflow_server::api::router(orchestrator);
//! ```

pub mod api;
pub mod cli;
pub mod error;
pub mod realtime;
pub mod schema;
pub mod store;
pub mod workflow;

// Re-export commonly used types
pub use cli::{HeartbeatConfig, ServerConfig, StoreTimeouts};
pub use error::{Result, WorkflowError};
pub use realtime::{events, Hub, Notification};
pub use schema::{
    AmbulatoryRecord, Contract, Doctor, Identity, IdentityKey, Role, RouteStep, Visit, VisitStatus,
};
pub use store::WorkflowStore;
pub use workflow::Orchestrator;
