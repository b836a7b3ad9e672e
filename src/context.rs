use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::table::TableError;

/// Namespace used when a context does not carry one.
pub const DEFAULT_NAMESPACE: &str = "default";

// ============================================================================
// Call Context
// ============================================================================
//
// Carries the logical namespace of a call and an optional deadline. Every
// table service call made on behalf of a context goes through `run`, so an
// expired deadline drops the in-flight future and reports an error.
//
// ============================================================================

#[derive(Clone, Debug, Default)]
pub struct Context {
    namespace: Option<String>,
    deadline: Option<Instant>,
}

impl Context {
    /// Context with the default namespace and no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Drive a table service call, aborting it once the deadline passes.
    pub(crate) async fn run<F, T>(&self, operation: F) -> Result<T, TableError>
    where
        F: Future<Output = Result<T, TableError>>,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, operation)
                .await
                .map_err(|_| TableError::DeadlineExceeded)?,
            None => operation.await,
        }
    }
}
