//! Error taxonomy for practice lifecycle operations.
//!
//! Every failure carries a stable [`ErrorKind`] so callers (the CLI, an HTTP
//! layer, a job runner) can map it to a response without matching on message
//! text. Only [`ErrorKind::ConcurrentModification`] is safe to retry blindly.

use thiserror::Error;
use uuid::Uuid;

use crate::models::PracticeState;

pub type Result<T> = std::result::Result<T, PracticeError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PracticeError {
    /// Caller role or identity does not satisfy the guard for the operation
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("practice not found: {0}")]
    PracticeNotFound(Uuid),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid state transition from {current} to {requested}")]
    InvalidStateTransition {
        current: PracticeState,
        requested: PracticeState,
    },

    /// The record changed between read and write; re-read and try again
    #[error("practice {0} was modified concurrently, re-read and retry")]
    ConcurrentModification(Uuid),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("incomplete criteria, missing: {}", .0.join(", "))]
    IncompleteCriteria(Vec<String>),

    #[error("score {score} for criterion {criterion} is outside 1-7")]
    ScoreOutOfRange { criterion: String, score: i32 },

    #[error("invalid weight policy: employer {employer}% + report {report}% must equal 100%")]
    InvalidPolicy { employer: i32, report: i32 },

    #[error("practice cannot be closed while {0}")]
    PrematureClose(PracticeState),

    #[error("persistence error: {0}")]
    Persistence(String),

    /// A derived value broke an invariant that valid inputs guarantee
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthorized,
    NotFound,
    InvalidStateTransition,
    ConcurrentModification,
    ValidationError,
    PrematureClose,
    PersistenceError,
    Internal,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            ErrorKind::ConcurrentModification => "CONCURRENT_MODIFICATION",
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::PrematureClose => "PREMATURE_CLOSE",
            ErrorKind::PersistenceError => "PERSISTENCE_ERROR",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }
}

impl PracticeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PracticeError::Unauthorized(_) => ErrorKind::Unauthorized,
            PracticeError::PracticeNotFound(_) | PracticeError::NotFound { .. } => {
                ErrorKind::NotFound
            }
            PracticeError::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            PracticeError::ConcurrentModification(_) => ErrorKind::ConcurrentModification,
            PracticeError::Validation(_)
            | PracticeError::IncompleteCriteria(_)
            | PracticeError::ScoreOutOfRange { .. }
            | PracticeError::InvalidPolicy { .. } => ErrorKind::ValidationError,
            PracticeError::PrematureClose(_) => ErrorKind::PrematureClose,
            PracticeError::Persistence(_) => ErrorKind::PersistenceError,
            PracticeError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::ConcurrentModification
    }

    pub fn validation(message: impl Into<String>) -> Self {
        PracticeError::Validation(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        PracticeError::Unauthorized(message.into())
    }
}

impl From<sqlx::Error> for PracticeError {
    fn from(err: sqlx::Error) -> Self {
        PracticeError::Persistence(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_error_names_both_states() {
        let err = PracticeError::InvalidStateTransition {
            current: PracticeState::Cerrada,
            requested: PracticeState::EnCurso,
        };
        assert_eq!(
            err.to_string(),
            "invalid state transition from CERRADA to EN_CURSO"
        );
        assert_eq!(err.kind().code(), "INVALID_STATE_TRANSITION");
    }

    #[test]
    fn scoring_failures_are_validation_errors() {
        let missing = PracticeError::IncompleteCriteria(vec!["teamwork".to_string()]);
        let range = PracticeError::ScoreOutOfRange {
            criterion: "teamwork".to_string(),
            score: 9,
        };
        let policy = PracticeError::InvalidPolicy {
            employer: 70,
            report: 40,
        };
        for err in [missing, range, policy] {
            assert_eq!(err.kind(), ErrorKind::ValidationError);
        }
    }

    #[test]
    fn only_concurrent_modification_is_retryable() {
        assert!(PracticeError::ConcurrentModification(Uuid::new_v4()).is_retryable());
        assert!(!PracticeError::Persistence("connection reset".to_string()).is_retryable());
        assert!(!PracticeError::PrematureClose(PracticeState::EnCurso).is_retryable());
    }

    #[test]
    fn sqlx_errors_become_persistence_errors() {
        let err: PracticeError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.kind(), ErrorKind::PersistenceError);
    }
}
