use chat_api::{ErrorCode, RpcError};
use thiserror::Error;

/// Failures reported by [`crate::ChatClient`] operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not connected")]
    NotConnected,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("message not saved: {0}")]
    Persistence(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("timed out")]
    Timeout,
    #[error("connection attempt cancelled")]
    Cancelled,
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<RpcError> for ClientError {
    fn from(err: RpcError) -> Self {
        match err.code {
            ErrorCode::Unauthenticated => ClientError::Unauthenticated,
            ErrorCode::Forbidden => ClientError::Forbidden(err.message),
            ErrorCode::InvalidArgument => ClientError::InvalidArgument(err.message),
            ErrorCode::NotFound => ClientError::NotFound(err.message),
            ErrorCode::PersistenceFailure => ClientError::Persistence(err.message),
            ErrorCode::Malformed => ClientError::Protocol(err.message),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Http(resp) if resp.status().as_u16() == 401 => ClientError::Unauthenticated,
            WsError::Http(resp) if resp.status().as_u16() == 403 => {
                ClientError::Forbidden("handshake rejected".into())
            }
            other => ClientError::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_errors_map_to_variants() {
        let err = ClientError::from(RpcError::new(
            ErrorCode::PersistenceFailure,
            "message_not_saved",
        ));
        assert_eq!(err, ClientError::Persistence("message_not_saved".into()));
        let err = ClientError::from(RpcError::new(ErrorCode::Unauthenticated, "unauthenticated"));
        assert_eq!(err, ClientError::Unauthenticated);
        assert_eq!(err.to_string(), "unauthenticated");
    }
}
