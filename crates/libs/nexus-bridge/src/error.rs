use serde::{Deserialize, Serialize};

use crate::event::StreamId;

/// Errors returned by bridge operations.
///
/// Registration variants (`DuplicateName`, `Config`) come out of
/// [`BridgeBuilder`](crate::BridgeBuilder) and indicate a programming mistake;
/// hosts treat them as fatal at startup.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum BridgeError {
    #[error("unknown method: {method}")]
    UnknownMethod { method: String },

    #[error("duplicate method name: {name}")]
    DuplicateName { name: String },

    #[error("stream id already active: {stream_id}")]
    DuplicateStreamId { stream_id: StreamId },

    #[error("unknown stream: {stream_id}")]
    UnknownStream { stream_id: StreamId },

    /// The wrapped call failed. The message is the handle's, unchanged.
    #[error("{message}")]
    Invocation { method: String, message: String },

    #[error("stream is not bidirectional: {stream_id}")]
    NotBidirectional { stream_id: StreamId },

    #[error("stream no longer accepts writes: {stream_id}")]
    StreamClosed { stream_id: StreamId },

    #[error("invalid payload: {message}")]
    InvalidPayload { message: String },

    #[error("invalid config: {message}")]
    Config { message: String },

    #[error("invalid state: {message}")]
    InvalidState { message: String },

    #[error("daemon {operation} failed: {message}")]
    Daemon { operation: String, message: String },
}

impl BridgeError {
    /// Stable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownMethod { .. } => "UNKNOWN_METHOD",
            Self::DuplicateName { .. } => "DUPLICATE_NAME",
            Self::DuplicateStreamId { .. } => "DUPLICATE_STREAM_ID",
            Self::UnknownStream { .. } => "UNKNOWN_STREAM",
            Self::Invocation { .. } => "INVOCATION_FAILED",
            Self::NotBidirectional { .. } => "NOT_BIDIRECTIONAL",
            Self::StreamClosed { .. } => "STREAM_CLOSED",
            Self::InvalidPayload { .. } => "INVALID_PAYLOAD",
            Self::Config { .. } => "CONFIG",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::Daemon { .. } => "DAEMON",
        }
    }

    /// Returns `true` for errors raised while assembling the bridge.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::DuplicateName { .. } | Self::Config { .. })
    }

    pub fn unknown_method(method: impl Into<String>) -> Self {
        Self::UnknownMethod { method: method.into() }
    }

    pub fn unknown_stream(stream_id: impl Into<StreamId>) -> Self {
        Self::UnknownStream { stream_id: stream_id.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState { message: message.into() }
    }
}

/// Failure reported by a wrapped daemon handle.
///
/// Carries only the daemon's message; the bridge attaches the method name when
/// it turns this into [`BridgeError::Invocation`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandleError {
    message: String,
}

impl HandleError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    pub fn not_implemented(operation: &str) -> Self {
        Self::new(format!("not implemented: {operation}"))
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn into_message(self) -> String {
        self.message
    }
}

impl From<String> for HandleError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandleError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for HandleError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_error_passes_message_through() {
        let err = BridgeError::Invocation {
            method: "getinfo".into(),
            message: "wallet locked".into(),
        };
        assert_eq!(err.to_string(), "wallet locked");
        assert_eq!(err.code(), "INVOCATION_FAILED");
    }

    #[test]
    fn configuration_variants_are_flagged() {
        assert!(BridgeError::DuplicateName { name: "x".into() }.is_configuration());
        assert!(BridgeError::config("relative path").is_configuration());
        assert!(!BridgeError::unknown_method("x").is_configuration());
        assert!(!BridgeError::unknown_stream("7").is_configuration());
    }

    #[test]
    fn codes_are_distinct() {
        let errors = [
            BridgeError::unknown_method("a"),
            BridgeError::DuplicateName { name: "a".into() },
            BridgeError::DuplicateStreamId { stream_id: "1".into() },
            BridgeError::unknown_stream("1"),
            BridgeError::Invocation { method: "a".into(), message: "b".into() },
            BridgeError::NotBidirectional { stream_id: "1".into() },
            BridgeError::StreamClosed { stream_id: "1".into() },
            BridgeError::InvalidPayload { message: "x".into() },
            BridgeError::config("x"),
            BridgeError::invalid_state("x"),
            BridgeError::Daemon { operation: "start".into(), message: "x".into() },
        ];
        let mut codes: Vec<_> = errors.iter().map(BridgeError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn handle_error_conversions() {
        assert_eq!(HandleError::from("boom").message(), "boom");
        assert_eq!(HandleError::from(String::from("boom")).into_message(), "boom");
        assert_eq!(HandleError::not_implemented("stop").to_string(), "not implemented: stop");
    }
}
