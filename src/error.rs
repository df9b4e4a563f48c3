//! Error types for the inbox pipeline.

use std::time::Duration;

use crate::config::ConfigIssue;
use crate::metrics::RunMetrics;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error(transparent)]
    Aborted(#[from] Box<RunAborted>),
}

/// Configuration-related errors. Raised while loading or validating, never mid-run.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Configuration has {} blocking issue(s)", .0.len())]
    Invalid(Vec<ConfigIssue>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Failure of a call into an external collaborator (mail store, categorizer,
/// label writer, persistence store).
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{service} unavailable: {reason}")]
    Transient { service: String, reason: String },

    #[error("{service} call timed out after {after:?}")]
    Timeout { service: String, after: Duration },

    #[error("Authentication failed for {service}: {reason}")]
    Auth { service: String, reason: String },

    #[error("{service}: item {id} not found")]
    NotFound { service: String, id: String },

    #[error("{service} rejected the request: {reason}")]
    Rejected { service: String, reason: String },
}

impl CollaboratorError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

impl From<DatabaseError> for CollaboratorError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::Pool(reason) => Self::Transient {
                service: "store".into(),
                reason,
            },
            other => Self::Rejected {
                service: "store".into(),
                reason: other.to_string(),
            },
        }
    }
}

/// Batch-fatal stage failure. A stage returning one of these produced no successes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StageError {
    #[error("Stage {stage} rejected its input: {reason}")]
    Validation { stage: String, reason: String },

    #[error("Stage {stage} lost authorization: {source}")]
    Auth {
        stage: String,
        #[source]
        source: CollaboratorError,
    },

    #[error("Stage {stage} could not reach its collaborator: {source}")]
    Unavailable {
        stage: String,
        #[source]
        source: CollaboratorError,
    },

    #[error("Stage {stage} exceeded its failure tolerance: {failed} of {total} items failed")]
    ToleranceExceeded {
        stage: String,
        failed: usize,
        total: usize,
    },

    #[error("Stage {stage} failed: {reason}")]
    Internal { stage: String, reason: String },
}

impl StageError {
    /// Classify a collaborator failure that sank a whole batch.
    pub fn from_collaborator(stage: &str, source: CollaboratorError) -> Self {
        if source.is_auth() {
            Self::Auth {
                stage: stage.to_string(),
                source,
            }
        } else {
            Self::Unavailable {
                stage: stage.to_string(),
                source,
            }
        }
    }

    /// Auth failures end the run regardless of `continue_on_error`.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }

    pub fn stage(&self) -> &str {
        match self {
            Self::Validation { stage, .. }
            | Self::Auth { stage, .. }
            | Self::Unavailable { stage, .. }
            | Self::ToleranceExceeded { stage, .. }
            | Self::Internal { stage, .. } => stage,
        }
    }
}

/// Pipeline assembly and batch I/O errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Stage '{0}' not found")]
    UnknownStage(String),

    #[error("Stage '{0}' is already registered")]
    DuplicateStage(String),

    #[error("Failed to read or write batch file: {0}")]
    BatchIo(#[from] std::io::Error),

    #[error("Batch file is not valid JSON: {0}")]
    BatchFormat(#[from] serde_json::Error),
}

/// Metrics export errors.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("IO error writing metrics: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize metrics: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to write metrics CSV: {0}")]
    Csv(#[from] csv::Error),
}

/// A run that stopped before its last stage.
///
/// Carries the first fatal error and the metrics collected up to that point.
#[derive(Debug, thiserror::Error)]
#[error("Run {} aborted at stage '{stage}': {error}", .metrics.run_id)]
pub struct RunAborted {
    pub stage: String,
    pub error: StageError,
    pub metrics: RunMetrics,
    pub stages_completed: Vec<String>,
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let timeout = CollaboratorError::Timeout {
            service: "gmail".into(),
            after: Duration::from_secs(1),
        };
        assert!(timeout.is_transient());
        let nf = CollaboratorError::NotFound {
            service: "gmail".into(),
            id: "m1".into(),
        };
        assert!(!nf.is_transient());
    }

    #[test]
    fn auth_is_run_fatal() {
        let err = StageError::from_collaborator(
            "load",
            CollaboratorError::Auth {
                service: "gmail".into(),
                reason: "expired".into(),
            },
        );
        assert!(err.is_run_fatal());
        assert_eq!(err.stage(), "load");

        let err = StageError::from_collaborator(
            "extract",
            CollaboratorError::Transient {
                service: "gmail".into(),
                reason: "503".into(),
            },
        );
        assert!(!err.is_run_fatal());
        assert!(matches!(err, StageError::Unavailable { .. }));
    }

    #[test]
    fn pool_errors_are_retryable() {
        let err: CollaboratorError = DatabaseError::Pool("locked".into()).into();
        assert!(err.is_transient());
        let err: CollaboratorError = DatabaseError::Query("bad sql".into()).into();
        assert!(!err.is_transient());
    }
}
