//! Error types for the release controller.
//!
//! Verification failures are not errors: a job that ends in failure is a
//! [`PayloadPhase::Failed`](crate::model::PayloadPhase::Failed) outcome recorded
//! on the payload. Errors describe problems talking to the backends or with the
//! process configuration.

/// The result type used throughout the release controller.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reconciling releases.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The process configuration is invalid or refers to missing namespaces.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// A backend call failed. These are transient and the key is retried.
    #[error("backend error during {operation}: {message}")]
    Backend {
        /// The backend operation that failed (e.g. `create_job`).
        operation: String,
        /// Description of the failure.
        message: String,
    },

    /// A create call found an object with the same name.
    #[error("{kind} already exists: {name}")]
    AlreadyExists {
        /// The resource kind.
        kind: &'static str,
        /// The object name.
        name: String,
    },

    /// The requested object does not exist.
    #[error("{kind} not found: {name}")]
    NotFound {
        /// The resource kind.
        kind: &'static str,
        /// The object name.
        name: String,
    },

    /// A deterministically named object holds content other than expected.
    ///
    /// Usually caused by a lagging cache; recomputing from fresher state
    /// resolves it.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the conflict.
        message: String,
    },

    /// Annotation or snapshot (de)serialization failed.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },
}

impl Error {
    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new backend error for the given operation.
    #[must_use]
    pub fn backend(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a new already-exists error.
    #[must_use]
    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    /// Creates a new not-found error.
    #[must_use]
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Creates a new conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Returns true if the failed key should be requeued with backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend { .. } | Self::Conflict { .. })
    }

    /// Returns true if this is an already-exists error from a create call.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Returns true if this is a not-found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_are_retryable() {
        let err = Error::backend("create_job", "connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("create_job"));
    }

    #[test]
    fn conflict_is_retryable_but_already_exists_is_not() {
        assert!(Error::conflict("tag taken").is_retryable());

        let exists = Error::already_exists("job", "release-20240101-0-install");
        assert!(!exists.is_retryable());
        assert!(exists.is_already_exists());
        assert!(exists.to_string().contains("already exists"));
    }

    #[test]
    fn configuration_error_display() {
        let err = Error::configuration("no job namespace set, use --job-namespace");
        let msg = err.to_string();
        assert!(msg.contains("configuration error"));
        assert!(msg.contains("--job-namespace"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn serde_errors_convert_to_serialization() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err = Error::from(parse.unwrap_err());
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
