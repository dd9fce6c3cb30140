use crate::session::SessionState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailure(String),

    #[error("Session is not ready (state: {0})")]
    SessionNotReady(SessionState),

    #[error("Session is invalid: {0}")]
    SessionInvalid(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("Tool handler failed: {0}")]
    HandlerFailure(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Tool already registered: {0}")]
    DuplicateToolName(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("MCP protocol error {code}: {message}")]
    Protocol { code: i64, message: String },

    #[error("Model API error: {0}")]
    Model(String),

    #[error("Missing API key: environment variable {0} is not set")]
    MissingApiKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    pub fn connection_lost(details: impl Into<String>) -> Self {
        BridgeError::ConnectionLost(details.into())
    }

    pub fn transport(details: impl std::fmt::Display) -> Self {
        BridgeError::Transport(details.to_string())
    }

    pub fn protocol(code: i64, message: impl Into<String>) -> Self {
        BridgeError::Protocol {
            code,
            message: message.into(),
        }
    }

    /// JSON-RPC error code used when this error crosses the protocol boundary
    pub fn rpc_code(&self) -> i64 {
        use crate::protocol::error_codes;
        match self {
            BridgeError::Protocol { code, .. } => *code,
            BridgeError::SessionNotReady(_) => error_codes::SERVER_NOT_INITIALIZED,
            BridgeError::SessionInvalid(_) => error_codes::INVALID_REQUEST,
            BridgeError::UnknownTool(_) | BridgeError::SchemaValidation(_) => {
                error_codes::INVALID_PARAMS
            }
            BridgeError::Json(_) => error_codes::PARSE_ERROR,
            _ => error_codes::INTERNAL_ERROR,
        }
    }
}

impl From<anyhow::Error> for BridgeError {
    fn from(err: anyhow::Error) -> Self {
        BridgeError::Internal(err.to_string())
    }
}

/// A peer that refused, reset or cut off the exchange is gone; anything
/// else (bad URL, TLS, timeout) is a transport fault.
impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_request() || err.is_body() {
            BridgeError::ConnectionLost(err.to_string())
        } else {
            BridgeError::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::UnknownTool("multiply".to_string());
        assert_eq!(err.to_string(), "Unknown tool: multiply");

        let err = BridgeError::SessionNotReady(SessionState::Handshaking);
        assert_eq!(err.to_string(), "Session is not ready (state: handshaking)");
    }

    #[test]
    fn test_rpc_codes() {
        assert_eq!(BridgeError::protocol(-32601, "x").rpc_code(), -32601);
        assert_eq!(
            BridgeError::SessionNotReady(SessionState::Closed).rpc_code(),
            -32002
        );
        assert_eq!(
            BridgeError::Internal("boom".to_string()).rpc_code(),
            -32603
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: BridgeError = io_err.into();
        assert!(matches!(err, BridgeError::Io(_)));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{invalid}").unwrap_err();
        let err: BridgeError = json_err.into();
        assert!(matches!(err, BridgeError::Json(_)));
        assert_eq!(err.rpc_code(), -32700);
    }

    #[test]
    fn test_error_from_anyhow() {
        let err: BridgeError = anyhow::anyhow!("something went wrong").into();
        assert!(matches!(err, BridgeError::Internal(_)));
        assert!(err.to_string().contains("something went wrong"));
    }
}
