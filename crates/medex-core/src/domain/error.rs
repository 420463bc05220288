use thiserror::Error;

/// Typed errors surfaced to the transport layer.
///
/// Each variant maps onto one error kind of the public contract; the
/// transport layer owns the HTTP status mapping.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Approval required: {0}")]
    ApprovalRequired(String),

    #[error("Invalid confirmation phrase: {0}")]
    InvalidConfirmation(String),

    #[error("Not enough questions: {available} available, {requested} requested")]
    NotEnoughQuestions { available: usize, requested: usize },

    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable machine-readable code for the transport layer.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::NotAuthorized(_) => "NOT_AUTHORIZED",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Conflict(_) => "CONFLICT",
            EngineError::ApprovalRequired(_) => "APPROVAL_REQUIRED",
            EngineError::InvalidConfirmation(_) => "INVALID_CONFIRMATION",
            EngineError::NotEnoughQuestions { .. } => "NOT_ENOUGH_QUESTIONS",
            EngineError::Integrity(_) => "INTEGRITY_ERROR",
            EngineError::Transient(_) => "TRANSIENT_ERROR",
            EngineError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            EngineError::NotEnoughQuestions {
                available: 3,
                requested: 5
            }
            .code(),
            "NOT_ENOUGH_QUESTIONS"
        );
        assert_eq!(
            EngineError::ApprovalRequired("x".into()).code(),
            "APPROVAL_REQUIRED"
        );
        assert_eq!(
            EngineError::InvalidConfirmation("x".into()).code(),
            "INVALID_CONFIRMATION"
        );
    }

    #[test]
    fn test_not_enough_questions_message() {
        let err = EngineError::NotEnoughQuestions {
            available: 3,
            requested: 5,
        };
        assert!(err.to_string().contains("3 available"));
        assert!(err.to_string().contains("5 requested"));
    }
}
