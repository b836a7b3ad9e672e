use std::fmt;

use crate::table::TableError;

// ============================================================================
// Store Errors
// ============================================================================
//
// Every failure leaving the repository or the event store is a StoreError.
// Backend errors (TableError) are never returned as-is: they are classified
// into one of the ErrorKind values and kept as the source for diagnostics.
//
// ============================================================================

/// Closed set of failure kinds reported by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Entity or event absent on read, or delete of an absent entity.
    NotFound,
    /// A read was attempted before an entity factory was installed.
    ModelNotConfigured,
    /// Save attempted with a nil entity identifier.
    MissingId,
    /// Expected version did not match the stored stream.
    ConcurrencyConflict,
    /// Events in one batch disagree on aggregate identity.
    InvalidEvent,
    NoEventsToAppend,
    InvalidNamespace,
    /// The table service session could not be established.
    DialFailure,
    SaveFailed,
    QueryFailed,
}

impl ErrorKind {
    /// Kinds a caller may retry: the failed call left nothing behind.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::ConcurrencyConflict | ErrorKind::DialFailure)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorKind::NotFound => "could not find entity",
            ErrorKind::ModelNotConfigured => "model not set",
            ErrorKind::MissingId => "missing entity ID",
            ErrorKind::ConcurrencyConflict => "concurrency conflict",
            ErrorKind::InvalidEvent => "invalid event",
            ErrorKind::NoEventsToAppend => "no events to append",
            ErrorKind::InvalidNamespace => "invalid namespace",
            ErrorKind::DialFailure => "could not dial database",
            ErrorKind::SaveFailed => "could not save",
            ErrorKind::QueryFailed => "could not query",
        };
        f.write_str(text)
    }
}

type Source = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned by the repository and event store.
///
/// Carries the namespace of the failing call and, when the failure came from
/// the table service, the underlying error.
#[derive(Debug, thiserror::Error)]
pub struct StoreError {
    kind: ErrorKind,
    namespace: String,
    #[source]
    source: Option<Source>,
}

impl StoreError {
    pub fn new(kind: ErrorKind, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            source: None,
        }
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Into<Source>,
    {
        self.source = Some(source.into());
        self
    }

    /// Classify a backend failure. Precondition failures on a write become
    /// conflicts; everything else keeps the caller supplied kind.
    pub(crate) fn from_table(fallback: ErrorKind, namespace: &str, err: TableError) -> Self {
        let kind = match err {
            TableError::ConditionFailed if fallback == ErrorKind::SaveFailed => {
                ErrorKind::ConcurrencyConflict
            }
            _ => fallback,
        };
        Self::new(kind, namespace).with_source(err)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {} ({})", self.kind, source, self.namespace),
            None => write!(f, "{} ({})", self.kind, self.namespace),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
