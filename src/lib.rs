//! Client-side harness for asserting on a chat server's push event stream.
//!
//! The crate is organized by concern:
//! - `stream`: per-session stream consumer, event buffer, matcher, and
//!   transports.
//! - `wait`: polling helpers that confirm state through request/response
//!   calls when stream delivery cannot be relied on.
//! - `error`: transport and harness error types.

/// Transport and harness errors.
pub mod error;
/// Stream consumer, buffer, matcher, and transports.
pub mod stream;
/// Condition polling helpers and default wait timings.
pub mod wait;

pub use error::{HarnessError, RemoteCallError, TransportError};
pub use stream::buffer::{EventBuffer, EventCursor};
pub use stream::consumer::{
    SessionState, StopOutcome, StreamConsumer, StreamDefaults, StreamOptions, TransportFailure,
};
pub use stream::matcher::{EventMatcher, EventPredicate};
pub use stream::proto::{ClientEvent, EventKind, EventPayload, ServerEvent};
pub use wait::{try_wait_until, wait_until, WaitDefaults};
