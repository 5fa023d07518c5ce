//! Error types for the reconciliation engine.
//!
//! Two layers of errors exist:
//! - [`DescriptorError`] is what a descriptor (and the dataplane behind it)
//!   returns from Add/Delete/Update/Dump/Validate.
//! - [`SchedulerError`] is what the engine reports per key. Its [`ErrorKind`]
//!   tag is a plain enumeration so that retriability and reporting are
//!   decided on data, never by comparing error instances.

use thiserror::Error;

/// Errors returned by descriptors and the southbound handlers behind them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    /// The value is invalid for this item type. Never retriable by default.
    #[error("invalid value: {message}")]
    InvalidValue { message: String },

    /// The dataplane rejected or failed the call.
    #[error("dataplane call failed (retval {retval}): {message}")]
    Dataplane { retval: i32, message: String },

    /// The dataplane call did not complete in time.
    #[error("dataplane call timed out after {elapsed_ms}ms: {message}")]
    Timeout { elapsed_ms: u64, message: String },

    /// The item was not found in the dataplane.
    #[error("item not found: {message}")]
    NotFound { message: String },

    /// The descriptor does not implement the requested operation.
    #[error("operation not supported by descriptor {descriptor}")]
    Unsupported { descriptor: String },

    /// A value or metadata of an unexpected type reached the descriptor.
    #[error("type mismatch: expected {expected}")]
    TypeMismatch { expected: &'static str },
}

impl DescriptorError {
    /// Create an InvalidValue error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidValue {
            message: message.into(),
        }
    }

    /// Create a Dataplane error.
    pub fn dataplane(retval: i32, message: impl Into<String>) -> Self {
        Self::Dataplane {
            retval,
            message: message.into(),
        }
    }

    /// Create a Timeout error.
    pub fn timeout(elapsed_ms: u64, message: impl Into<String>) -> Self {
        Self::Timeout {
            elapsed_ms,
            message: message.into(),
        }
    }

    /// Default retriability used when a descriptor does not classify errors itself.
    ///
    /// Invalid values, unsupported operations and type mismatches can never
    /// succeed on retry; everything coming from the dataplane may.
    pub fn is_retriable_by_default(&self) -> bool {
        !matches!(
            self,
            Self::InvalidValue { .. } | Self::Unsupported { .. } | Self::TypeMismatch { .. }
        )
    }
}

/// Tag identifying the class of a [`SchedulerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    DuplicatePrefix,
    DuplicateDescriptor,
    NoDescriptor,
    CyclicDependency,
    ValidationFailed,
    OperationFailedRetriable,
    OperationFailedTerminal,
    MaxRetriesExceeded,
    Timeout,
    DependencyFailed,
    DerivationTooDeep,
    DerivedValueImmutable,
    QueueClosed,
}

impl ErrorKind {
    /// Stable identifier used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DuplicatePrefix => "DuplicatePrefix",
            Self::DuplicateDescriptor => "DuplicateDescriptor",
            Self::NoDescriptor => "NoDescriptor",
            Self::CyclicDependency => "CyclicDependency",
            Self::ValidationFailed => "ValidationFailed",
            Self::OperationFailedRetriable => "OperationFailed-Retriable",
            Self::OperationFailedTerminal => "OperationFailed-Terminal",
            Self::MaxRetriesExceeded => "MaxRetriesExceeded",
            Self::Timeout => "Timeout",
            Self::DependencyFailed => "DependencyFailed",
            Self::DerivationTooDeep => "DerivationTooDeep",
            Self::DerivedValueImmutable => "DerivedValueImmutable",
            Self::QueueClosed => "QueueClosed",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// A descriptor's key prefix overlaps an already registered one.
    #[error("descriptor {descriptor} prefix {prefix:?} overlaps prefix {existing_prefix:?} of {existing}")]
    DuplicatePrefix {
        descriptor: String,
        prefix: String,
        existing: String,
        existing_prefix: String,
    },

    /// A descriptor with the same name is already registered.
    #[error("descriptor {name} is already registered")]
    DuplicateDescriptor { name: String },

    /// No registered descriptor selects the key.
    #[error("no descriptor registered for key {key}")]
    NoDescriptor { key: String },

    /// The key is part of a dependency cycle.
    #[error("key {key} is part of a dependency cycle: {cycle:?}")]
    CyclicDependency { key: String, cycle: Vec<String> },

    /// The descriptor rejected the value before any dataplane call.
    #[error("validation of {key} failed: {source}")]
    ValidationFailed {
        key: String,
        source: DescriptorError,
    },

    /// A dataplane operation failed.
    #[error("{operation} of {key} failed: {source}")]
    OperationFailed {
        key: String,
        operation: String,
        retriable: bool,
        source: DescriptorError,
    },

    /// A retriable failure persisted through the configured number of attempts.
    #[error("{key} still failing after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded {
        key: String,
        attempts: u32,
        last_error: DescriptorError,
    },

    /// An operation timed out.
    #[error("{operation} of {key} timed out after {elapsed_ms}ms")]
    Timeout {
        key: String,
        operation: String,
        elapsed_ms: u64,
        retriable: bool,
    },

    /// A dependency of the key failed terminally.
    #[error("{key} cannot be applied: dependency {dependency} failed")]
    DependencyFailed { key: String, dependency: String },

    /// Derived values nest deeper than the configured bound.
    #[error("derived values of {key} exceed the maximum derivation depth {max_depth}")]
    DerivationTooDeep { key: String, max_depth: usize },

    /// Derived values are owned by their parent and cannot be changed directly.
    #[error("{key} is derived from {parent} and cannot be changed directly")]
    DerivedValueImmutable { key: String, parent: String },

    /// The transaction queue has been shut down.
    #[error("transaction queue closed")]
    QueueClosed,
}

impl SchedulerError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicatePrefix { .. } => ErrorKind::DuplicatePrefix,
            Self::DuplicateDescriptor { .. } => ErrorKind::DuplicateDescriptor,
            Self::NoDescriptor { .. } => ErrorKind::NoDescriptor,
            Self::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            Self::ValidationFailed { .. } => ErrorKind::ValidationFailed,
            Self::OperationFailed {
                retriable: true, ..
            } => ErrorKind::OperationFailedRetriable,
            Self::OperationFailed {
                retriable: false, ..
            } => ErrorKind::OperationFailedTerminal,
            Self::MaxRetriesExceeded { .. } => ErrorKind::MaxRetriesExceeded,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::DependencyFailed { .. } => ErrorKind::DependencyFailed,
            Self::DerivationTooDeep { .. } => ErrorKind::DerivationTooDeep,
            Self::DerivedValueImmutable { .. } => ErrorKind::DerivedValueImmutable,
            Self::QueueClosed => ErrorKind::QueueClosed,
        }
    }

    /// Check if this error leaves the key queued for another attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::OperationFailed {
                retriable: true,
                ..
            } | Self::Timeout {
                retriable: true,
                ..
            }
        )
    }

    /// Build the per-key error for a failed dataplane operation.
    ///
    /// The descriptor's classification is taken as-is.
    pub fn from_operation(
        key: &str,
        operation: impl std::fmt::Display,
        source: DescriptorError,
        retriable: bool,
    ) -> Self {
        match source {
            DescriptorError::Timeout { elapsed_ms, .. } => Self::Timeout {
                key: key.to_string(),
                operation: operation.to_string(),
                elapsed_ms,
                retriable,
            },
            source => Self::OperationFailed {
                key: key.to_string(),
                operation: operation.to_string(),
                retriable,
                source,
            },
        }
    }
}

/// Result type using SchedulerError.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
