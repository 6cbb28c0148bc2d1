use thiserror::Error;

use super::types::JobState;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("domain validation failed: {message}")]
    Validation { message: String },
    #[error("illegal job transition from `{from}` to `{to}`")]
    IllegalTransition { from: JobState, to: JobState },
}

impl DomainError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn illegal_transition(from: JobState, to: JobState) -> Self {
        Self::IllegalTransition { from, to }
    }
}
