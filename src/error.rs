//! Error types for Berth

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type for Berth operations
pub type Result<T> = std::result::Result<T, BerthError>;

/// Berth error types
///
/// Errors are `Clone` so a startup failure captured once can be handed to
/// every caller that joined the same in-flight startup.
#[derive(Error, Debug, Clone)]
pub enum BerthError {
    #[error("Container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Service {name} not ready after {timeout:?}: {last_error}")]
    ReadinessTimeout {
        name: String,
        timeout: Duration,
        last_error: String,
    },

    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("Port {port} of service {name} is not mapped")]
    PortNotMapped { name: String, port: u16 },

    #[error("Identity conflict: service {0} is declared more than once in this scope")]
    IdentityConflict(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Startup of service {name} failed: {message}")]
    Startup { name: String, message: String },

    #[error("Invalid state transition for {name}: {from} -> {to}")]
    InvalidTransition {
        name: String,
        from: String,
        to: String,
    },

    #[error("Release of {0} without a matching acquire")]
    NotAcquired(String),

    #[error("Scope is closed: {0}")]
    ScopeClosed(String),

    #[error("Invalid service spec: {0}")]
    InvalidSpec(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Fixture file parse error: {0}")]
    FixtureParse(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    #[error("YAML error: {0}")]
    Yaml(Arc<serde_yaml::Error>),
}

impl From<std::io::Error> for BerthError {
    fn from(err: std::io::Error) -> Self {
        BerthError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for BerthError {
    fn from(err: serde_json::Error) -> Self {
        BerthError::Json(Arc::new(err))
    }
}

impl From<serde_yaml::Error> for BerthError {
    fn from(err: serde_yaml::Error) -> Self {
        BerthError::Yaml(Arc::new(err))
    }
}

/// Outcome class reported to the surrounding test runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The container engine could not be reached
    Infrastructure,
    /// A dependency could not be created, started or configured
    Setup,
    /// A dependency started but never became usable
    ProbeTimeout,
    /// The harness was driven incorrectly
    Usage,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Infrastructure => write!(f, "infrastructure"),
            FailureKind::Setup => write!(f, "setup"),
            FailureKind::ProbeTimeout => write!(f, "probe-timeout"),
            FailureKind::Usage => write!(f, "usage"),
        }
    }
}

impl BerthError {
    /// Classify the error for reporting
    pub fn kind(&self) -> FailureKind {
        match self {
            BerthError::EngineUnavailable(_) => FailureKind::Infrastructure,
            BerthError::ReadinessTimeout { .. } | BerthError::Probe(_) => {
                FailureKind::ProbeTimeout
            }
            BerthError::InstanceNotFound(_)
            | BerthError::PortNotMapped { .. }
            | BerthError::IdentityConflict(_)
            | BerthError::InvalidTransition { .. }
            | BerthError::NotAcquired(_)
            | BerthError::ScopeClosed(_)
            | BerthError::Lock(_) => FailureKind::Usage,
            BerthError::Engine(_)
            | BerthError::Startup { .. }
            | BerthError::InvalidSpec(_)
            | BerthError::InvalidConfig(_)
            | BerthError::FixtureParse(_)
            | BerthError::Io(_)
            | BerthError::Json(_)
            | BerthError::Yaml(_) => FailureKind::Setup,
        }
    }

    /// Errors that end a readiness probe immediately instead of being retried
    pub fn is_fatal_for_probe(&self) -> bool {
        matches!(
            self,
            BerthError::EngineUnavailable(_) | BerthError::InstanceNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kinds_are_distinct() {
        let unavailable = BerthError::EngineUnavailable("connection refused".to_string());
        let timeout = BerthError::ReadinessTimeout {
            name: "db".to_string(),
            timeout: Duration::from_secs(1),
            last_error: "port closed".to_string(),
        };
        let startup = BerthError::Startup {
            name: "db".to_string(),
            message: "no such image".to_string(),
        };
        let conflict = BerthError::IdentityConflict("db".to_string());

        assert_eq!(unavailable.kind(), FailureKind::Infrastructure);
        assert_eq!(timeout.kind(), FailureKind::ProbeTimeout);
        assert_eq!(startup.kind(), FailureKind::Setup);
        assert_eq!(conflict.kind(), FailureKind::Usage);
    }

    #[test]
    fn test_io_error_is_cloneable() {
        let err: BerthError = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }

    #[test]
    fn test_timeout_message_carries_last_error() {
        let err = BerthError::ReadinessTimeout {
            name: "cache".to_string(),
            timeout: Duration::from_millis(500),
            last_error: "connection refused".to_string(),
        };
        assert!(err.to_string().contains("connection refused"));
    }
}
