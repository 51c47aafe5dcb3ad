//! Error types and response kinds for medflow-server

use thiserror::Error;

/// Main error type for workflow operations
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("{message}")]
    Validation { message: String },

    #[error("{message}")]
    Conflict { value: String, message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Store unavailable: {message}")]
    StoreUnavailable { message: String },

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WorkflowError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Conflict on a value that must be unique system-wide
    pub fn duplicate(field: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        Self::Conflict {
            message: format!("{} {} is already registered", field, value),
            value,
        }
    }

    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Machine-readable kind carried in every error response:
    /// - validation: missing/malformed field or path id
    /// - conflict: duplicate BIN/phone
    /// - not_found: resource-scoped fetch by id
    /// - store_unavailable: store timeout or connection failure
    /// - internal: anything else
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Conflict { .. } => "conflict",
            Self::NotFound { .. } => "not_found",
            Self::StoreUnavailable { .. } => "store_unavailable",
            Self::Store(_) | Self::Json(_) => "internal",
        }
    }

    /// HTTP status for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::Conflict { .. } => 409,
            Self::NotFound { .. } => 404,
            Self::StoreUnavailable { .. } => 503,
            Self::Store(_) | Self::Json(_) => 500,
        }
    }
}

/// Result type alias for workflow operations
pub type Result<T> = std::result::Result<T, WorkflowError>;
