//! Common test utilities and fixtures for medflow-server integration tests
//!
//! This module provides:
//! - `TestEnv` wiring an in-memory store, a hub and an orchestrator
//! - Builders for the entities most tests start from
//! - Helpers that bind the REST and realtime listeners on ephemeral ports

#![allow(unused_imports)]
#![allow(dead_code)]

pub mod fixtures;
pub mod servers;

pub use fixtures::*;
pub use servers::*;
