//! Workflow store over SQLite
//!
//! One `rusqlite::Connection` guarded by a `parking_lot::Mutex`. Every call
//! runs on the blocking pool under a budget picked by operation class:
//!
//! | Budget   | Used for                          |
//! |----------|-----------------------------------|
//! | `Lookup` | point reads by id / phone / BIN   |
//! | `Scan`   | list and aggregate reads          |
//! | `Write`  | inserts, upserts, patches, deletes |
//!
//! Exceeding the budget (including time spent waiting for the connection)
//! surfaces as `WorkflowError::StoreUnavailable`. Nothing is retried.

pub mod migrations;

mod contracts;
mod doctors;
mod identities;
mod records;
mod visits;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, Row};
use serde_json::Value;

use crate::cli::StoreTimeouts;
use crate::error::{Result, WorkflowError};
use crate::workflow::specialty;

pub use visits::{Reconciliation, VisitFilter};

/// Operation class, selects the timeout budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    Lookup,
    Scan,
    Write,
}

/// Handle to the durable workflow state. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowStore {
    conn: Arc<Mutex<Connection>>,
    timeouts: StoreTimeouts,
}

impl WorkflowStore {
    /// Open (or create) a database file and bring its schema up to date
    pub fn open(path: &Path, timeouts: StoreTimeouts) -> Result<Self> {
        if path.as_os_str() == ":memory:" {
            return Self::open_in_memory(timeouts);
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn, timeouts)
    }

    /// Ephemeral store, used by tests and `--database :memory:`
    pub fn open_in_memory(timeouts: StoreTimeouts) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, timeouts)
    }

    fn from_connection(mut conn: Connection, timeouts: StoreTimeouts) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(timeouts.write)?;
        register_functions(&conn)?;
        migrations::run_migrations(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            timeouts,
        })
    }

    fn budget(&self, budget: Budget) -> Duration {
        match budget {
            Budget::Lookup => self.timeouts.lookup,
            Budget::Scan => self.timeouts.scan,
            Budget::Write => self.timeouts.write,
        }
    }

    /// Run `f` against the connection on the blocking pool, bounded by `budget`.
    ///
    /// A timed-out closure is not cancelled; its outcome is discarded and the
    /// caller sees `StoreUnavailable`.
    pub(crate) async fn call<T, F>(&self, budget: Budget, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let limit = self.budget(budget);
        let conn = Arc::clone(&self.conn);

        let task = tokio::task::spawn_blocking(move || {
            let mut guard = conn.try_lock_for(limit).ok_or_else(|| {
                WorkflowError::store_unavailable(format!("{}: connection busy", op))
            })?;
            f(&mut *guard)
        });

        let outcome = match tokio::time::timeout(limit, task).await {
            Ok(Ok(result)) => result.map_err(|e| classify(op, e)),
            Ok(Err(join_err)) => Err(WorkflowError::store_unavailable(format!(
                "{}: store task failed: {}",
                op, join_err
            ))),
            Err(_) => Err(WorkflowError::store_unavailable(format!(
                "{}: timed out after {}ms",
                op,
                limit.as_millis()
            ))),
        };

        if let Err(e) = &outcome {
            if matches!(
                e,
                WorkflowError::StoreUnavailable { .. } | WorkflowError::Store(_)
            ) {
                tracing::error!("Store call {} failed: {}", op, e);
            }
        }
        outcome
    }
}

/// Busy/locked database errors mean the store is unavailable, not broken
fn classify(op: &str, err: WorkflowError) -> WorkflowError {
    match &err {
        WorkflowError::Store(rusqlite::Error::SqliteFailure(failure, _))
            if matches!(
                failure.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            WorkflowError::store_unavailable(format!("{}: {}", op, err))
        }
        _ => err,
    }
}

/// `route_step_matches(step_specialty, labels_json)`: whether the step's
/// specialty matches any label in the JSON array, under the same rule as
/// `specialty::matches_any`.
fn register_functions(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "route_step_matches",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let step: Option<String> = ctx.get(0)?;
            let labels: Option<String> = ctx.get(1)?;
            let (Some(step), Some(labels)) = (step, labels) else {
                return Ok(false);
            };
            let labels: Vec<String> = serde_json::from_str(&labels)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            Ok(specialty::matches_any(&step, labels.as_slice()))
        },
    )?;
    Ok(())
}

/// Uniqueness violation on the given `table.column`
pub(crate) fn is_unique_violation(err: &rusqlite::Error, column: &str) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, Some(message)) => {
            failure.code == ErrorCode::ConstraintViolation
                && message.contains("UNIQUE")
                && message.contains(column)
        }
        _ => false,
    }
}

/// Serialize a JSON value for a TEXT column
pub(crate) fn json_text(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Read a JSON TEXT column, `Value::Null` for SQL NULL
pub(crate) fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let text: Option<String> = row.get(idx)?;
    match text {
        None => Ok(Value::Null),
        Some(text) => serde_json::from_str(&text)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
    }
}

/// Read a nullable JSON TEXT column into a typed value
pub(crate) fn typed_json_column<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|text| {
        serde_json::from_str(&text)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}
