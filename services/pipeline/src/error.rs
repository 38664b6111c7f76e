//! Error taxonomy shared by the capability adapters, the worker and the
//! lifecycle mover.

use thiserror::Error;

/// Errors surfaced by pipeline components
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Network or service blip. Safe to retry.
    #[error("transient failure during {operation}: {message}")]
    Transient { operation: String, message: String },

    /// The service refused the request (permissions, missing bucket, bad
    /// parameter). Retrying will not help.
    #[error("request rejected during {operation}: {message}")]
    Rejected { operation: String, message: String },

    /// The addressed object, message or record does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The transformation failed for a specific item
    #[error("processing failed: {0}")]
    Processing(String),

    /// Unparseable message body, key or date
    #[error("malformed input: {0}")]
    Malformed(String),

    /// Retry budget spent; carries the error from the final attempt
    #[error("write exhausted after {attempts} attempts: {source}")]
    WriteExhausted {
        attempts: u32,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn transient(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    /// Whether the retrying writer should try the operation again
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::NotFound("status record".to_string()),
            other => Self::transient("status store", other),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(PipelineError::transient("put", "connection reset").is_transient());
        assert!(!PipelineError::Processing("bad image".into()).is_transient());
        assert!(!PipelineError::NotFound("k".into()).is_transient());
        assert!(!PipelineError::Rejected {
            operation: "put_object".into(),
            message: "AccessDenied".into(),
        }
        .is_transient());
    }

    #[test]
    fn test_write_exhausted_carries_last_error() {
        let err = PipelineError::WriteExhausted {
            attempts: 3,
            source: Box::new(PipelineError::transient("put_object", "timeout")),
        };
        let message = err.to_string();
        assert!(message.contains("3 attempts"));
        assert!(message.contains("timeout"));
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: PipelineError = sqlx::Error::RowNotFound.into();
        assert!(err.is_not_found());
    }
}
