//! Realtime notification format
//!
//! The server only pushes. Every outbound frame is one JSON text message:
//!
//! ```json
//! {"type": "contract_created", "data": {...}, "timestamp": "2026-10-18T09:30:00.000Z", "userId": "clinic_1"}
//! ```
//!
//! `type` is an open taxonomy; the hub never inspects it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::now_rfc3339;

/// Well-known event names
pub mod events {
    pub const CONTRACT_CREATED: &str = "contract_created";
    pub const CONTRACT_UPDATED: &str = "contract_updated";
    pub const CONTRACT_DELETED: &str = "contract_deleted";
    pub const DOCTOR_CREATED: &str = "doctor_created";
    pub const DOCTOR_UPDATED: &str = "doctor_updated";
    pub const DOCTOR_DELETED: &str = "doctor_deleted";
    pub const VISIT_STARTED: &str = "visit_started";
    pub const VISIT_UPDATED: &str = "visit_updated";
}

/// One outbound notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: String,
    /// Addressed identity, absent for role-wide and broadcast messages
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

impl Notification {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: now_rfc3339(),
            identity: None,
        }
    }

    pub fn addressed_to(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
