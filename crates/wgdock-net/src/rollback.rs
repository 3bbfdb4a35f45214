//! Reversible-step composition for multi-stage kernel setup.
//!
//! Network creation touches namespaces, links, addresses, routes and
//! netfilter in a fixed order. Each completed step pushes its inverse onto
//! a [`RollbackStack`]; on failure the stack unwinds the completed prefix
//! newest-first. Undo errors are logged and never mask the original error.

use std::future::Future;
use std::pin::Pin;

use wgdock_common::WgdockResult;

type UndoFuture = Pin<Box<dyn Future<Output = WgdockResult<()>> + Send>>;
type UndoFn = Box<dyn FnOnce() -> UndoFuture + Send>;

/// Stack of named undo actions, unwound in reverse push order.
#[derive(Default)]
pub struct RollbackStack {
    steps: Vec<(&'static str, UndoFn)>,
}

impl RollbackStack {
    /// Create an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the inverse of a step that just completed.
    pub fn push<F, Fut>(&mut self, name: &'static str, undo: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = WgdockResult<()>> + Send + 'static,
    {
        self.steps.push((name, Box::new(move || Box::pin(undo()))));
    }

    /// Number of registered undo actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether no undo actions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Drop all undo actions without running them.
    ///
    /// Called once the composed operation has fully succeeded, or when the
    /// caller asked for no cleanup on failure.
    pub fn disarm(mut self) {
        self.steps.clear();
    }

    /// Run every undo action, newest first.
    ///
    /// All actions are attempted; failures are logged per step.
    pub async fn unwind(mut self) {
        while let Some((name, undo)) = self.steps.pop() {
            tracing::debug!(step = name, "Rolling back");
            if let Err(e) = undo().await {
                tracing::warn!(step = name, error = %e, "Rollback step failed");
            }
        }
    }
}
