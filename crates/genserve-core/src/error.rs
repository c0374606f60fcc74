use thiserror::Error;

/// Outcome of a failed lifecycle step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServableError {
    /// The client went away or the generation was stopped. Nothing is sent back.
    #[error("request cancelled")]
    Cancelled,
    /// The request is malformed or violates a servable limit.
    #[error("{0}")]
    InvalidArgument(String),
    /// Something went wrong inside the servable or the engine.
    #[error("{0}")]
    Internal(String),
}

impl ServableError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T, E = ServableError> = std::result::Result<T, E>;
