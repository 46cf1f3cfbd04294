use chat_api::{ErrorCode, HouseId, RpcError};
use thiserror::Error;

/// Failures surfaced by hub operations to the invoking connection.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("not a tenant of house {0}")]
    Forbidden(HouseId),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("message store unavailable: {0}")]
    Persistence(#[from] anyhow::Error),
}

impl ChatError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ChatError::Unauthenticated => ErrorCode::Unauthenticated,
            ChatError::Forbidden(_) => ErrorCode::Forbidden,
            ChatError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            ChatError::Persistence(_) => ErrorCode::PersistenceFailure,
        }
    }
}

impl From<&ChatError> for RpcError {
    fn from(err: &ChatError) -> Self {
        // store internals stay on the server
        let message = match err {
            ChatError::Persistence(_) => "message_not_saved".to_string(),
            other => other.to_string(),
        };
        RpcError::new(err.code(), message)
    }
}
