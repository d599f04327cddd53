//! Best-effort cleanup sequences.
//!
//! A [`CleanupPlan`] is an ordered list of independent async actions. Every
//! action runs even when earlier ones fail; failures are logged and counted,
//! never propagated.

use crate::error::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;

/// Ordered, independently fault-isolated cleanup actions.
pub struct CleanupPlan<'a> {
    scope: &'static str,
    actions: Vec<(&'static str, BoxFuture<'a, Result<()>>)>,
}

impl<'a> CleanupPlan<'a> {
    /// Create an empty plan; `scope` tags the log lines.
    pub fn new(scope: &'static str) -> Self {
        Self {
            scope,
            actions: Vec::new(),
        }
    }

    /// Append an action.
    pub fn then<F>(mut self, name: &'static str, action: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'a,
    {
        self.actions.push((name, action.boxed()));
        self
    }

    /// Number of queued actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether no actions are queued.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every action in order. Returns the number that failed.
    pub async fn run(self) -> usize {
        let mut failures = 0;
        for (name, action) in self.actions {
            match action.await {
                Ok(()) => tracing::debug!(scope = self.scope, action = name, "Cleanup step done"),
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        scope = self.scope,
                        action = name,
                        error = %e,
                        "Cleanup step failed"
                    );
                }
            }
        }
        failures
    }
}
