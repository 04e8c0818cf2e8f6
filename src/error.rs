//! Error taxonomy shared by the stream consumer and the wait helpers.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::stream::consumer::SessionState;
use crate::stream::proto::EventKind;

/// Failure of the duplex event channel.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// A frame could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Access token could not be converted to a valid header value.
    #[error("invalid authorization header: {0}")]
    InvalidAuthHeader(#[from] InvalidHeaderValue),

    /// The peer terminated the channel with an error status.
    #[error("stream closed by server ({code}): {detail}")]
    Remote { code: String, detail: String },

    /// Channel contract violation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn remote(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Remote {
            code: code.into(),
            detail: detail.into(),
        }
    }

    /// Machine-readable failure code.
    pub fn code(&self) -> &str {
        match self {
            Self::WebSocket(_) => "websocket",
            Self::Json(_) => "json",
            Self::InvalidAuthHeader(_) => "invalid_auth_header",
            Self::Remote { code, .. } => code.as_str(),
            Self::Protocol(_) => "protocol",
        }
    }

    /// Human-readable detail without the code prefix.
    pub fn detail(&self) -> String {
        match self {
            Self::WebSocket(err) => err.to_string(),
            Self::Json(err) => err.to_string(),
            Self::InvalidAuthHeader(err) => err.to_string(),
            Self::Remote { detail, .. } => detail.clone(),
            Self::Protocol(detail) => detail.clone(),
        }
    }
}

/// Failure reported by a request/response call against the remote service.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("remote call failed ({code}): {detail}")]
pub struct RemoteCallError {
    pub code: String,
    pub detail: String,
}

impl RemoteCallError {
    pub fn new(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            detail: detail.into(),
        }
    }
}

/// Errors surfaced by the harness to the orchestrating caller.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// No matching event arrived before the deadline.
    #[error("timed out after {timeout:?} waiting for event {kind}")]
    TimedOut { kind: EventKind, timeout: Duration },

    /// A polled condition stayed false until the deadline.
    #[error("condition not met after {timeout:?}: {description}")]
    ConditionNotMet {
        description: String,
        timeout: Duration,
    },

    #[error(transparent)]
    RemoteCall(#[from] RemoteCallError),

    /// The session can no longer be started.
    #[error("session is {state:?} and cannot be started")]
    SessionClosed { state: SessionState },
}

impl HarnessError {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    pub fn is_condition_not_met(&self) -> bool {
        matches!(self, Self::ConditionNotMet { .. })
    }
}
