use std::fmt;
use thiserror::Error;

use crate::frame::Frame;

/// Errors produced by the codec, the operation layer and the session.
///
/// The variants follow how far a failure reaches:
/// - `MalformedFrame`: inbound bytes that do not parse. Local to the decode.
/// - `ProtocolViolation`: a request the session refuses (wrong state,
///   duplicate correlation key, unencodable header). Fatal to that operation
///   only; nothing is sent.
/// - `ConnectionLost`: transport failure, liveness timeout or teardown. Fatal
///   to the session and to every operation still pending on it.
/// - `Broker`: an ERROR frame from the broker.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StompError {
    /// Received bytes could not be decoded into a frame.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    /// The request is not valid for the protocol or the session state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// The transport went away or the peer stopped heart-beating.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The broker answered with an ERROR frame.
    #[error("{0}")]
    Broker(ServerError),
    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,
    /// A caller-level wait elapsed.
    #[error("timeout: no response for '{0}' within the allotted time")]
    Timeout(String),
}

impl StompError {
    pub(crate) fn malformed(msg: impl fmt::Display) -> Self {
        StompError::MalformedFrame(msg.to_string())
    }

    pub(crate) fn violation(msg: impl fmt::Display) -> Self {
        StompError::ProtocolViolation(msg.to_string())
    }

    pub(crate) fn lost(msg: impl fmt::Display) -> Self {
        StompError::ConnectionLost(msg.to_string())
    }

    /// True when the error tears down the whole session rather than a
    /// single operation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StompError::ConnectionLost(_) | StompError::Broker(_))
    }
}

impl From<std::io::Error> for StompError {
    fn from(err: std::io::Error) -> Self {
        StompError::ConnectionLost(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StompError>;

/// Details of an ERROR frame sent by the broker.
///
/// The broker closes the connection after sending ERROR, so a `ServerError`
/// reaching a caller also means the session is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// The `message` header, or `"unknown error"` when absent.
    pub message: String,
    /// The frame body as text, if any.
    pub body: Option<String>,
    /// The `receipt-id` header, present when the broker attributes the error
    /// to a frame that requested a receipt.
    pub receipt_id: Option<String>,
    /// The ERROR frame as received.
    pub frame: Frame,
}

impl ServerError {
    pub fn from_frame(frame: Frame) -> Self {
        let message = frame
            .get_header("message")
            .unwrap_or("unknown error")
            .to_string();
        let body = if frame.body.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&frame.body).into_owned())
        };
        let receipt_id = frame.get_header("receipt-id").map(str::to_string);
        Self {
            message,
            body,
            receipt_id,
            frame,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "STOMP server error: {}", self.message)?;
        if let Some(body) = &self.body {
            write!(f, ": {}", body)?;
        }
        Ok(())
    }
}

impl std::error::Error for ServerError {}
