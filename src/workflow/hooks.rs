//! Post-commit hooks
//!
//! After the primary write commits, an ordered list of best-effort side
//! effects runs: identity sync, route-sheet reconciliation, notifications.
//! Each hook is error-isolated: a failure is logged and the remaining hooks
//! still run. Nothing here can fail the operation that triggered it.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::future::Future;

use crate::error::Result;

/// Result from a single hook
#[derive(Debug, Clone, PartialEq)]
pub struct HookResult {
    pub hook_name: &'static str,
    pub success: bool,
    pub message: Option<String>,
}

/// Ordered list of side effects for one committed operation
pub struct PostCommit<'a> {
    operation: &'static str,
    hooks: Vec<(&'static str, BoxFuture<'a, Result<String>>)>,
}

impl<'a> PostCommit<'a> {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            hooks: Vec::new(),
        }
    }

    /// Append a hook. It runs after every hook added before it.
    pub fn hook<F>(mut self, name: &'static str, hook: F) -> Self
    where
        F: Future<Output = Result<String>> + Send + 'a,
    {
        self.hooks.push((name, hook.boxed()));
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every hook in order, isolating failures
    pub async fn run(self) -> Vec<HookResult> {
        let mut results = Vec::with_capacity(self.hooks.len());
        for (hook_name, hook) in self.hooks {
            let result = match hook.await {
                Ok(message) => {
                    tracing::debug!("Hook {}/{}: {}", self.operation, hook_name, message);
                    HookResult {
                        hook_name,
                        success: true,
                        message: Some(message),
                    }
                }
                Err(e) => {
                    tracing::warn!("Hook {}/{} failed: {}", self.operation, hook_name, e);
                    HookResult {
                        hook_name,
                        success: false,
                        message: Some(e.to_string()),
                    }
                }
            };
            results.push(result);
        }
        results
    }
}
