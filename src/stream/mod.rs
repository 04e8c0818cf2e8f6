//! Realtime stream modules.
//!
//! - `proto`: events pushed by the server and markers sent by the client.
//! - `buffer`: append-only per-session event log with caller-owned cursors.
//! - `matcher`: deadline-bounded search of the buffer by kind and predicate.
//! - `transport`: seam for opening the duplex event channel.
//! - `consumer`: session lifecycle, send loop, and receive loop.
//! - `websocket`: websocket transport carrying JSON text frames.
//! - `memory`: in-process transport for tests and demos.

/// Append-only event buffer and read cursors.
pub mod buffer;
/// Session consumer and lifecycle types.
pub mod consumer;
/// Event matching with per-matcher cursors.
pub mod matcher;
/// In-process transport pair.
pub mod memory;
/// Stream protocol messages.
pub mod proto;
/// Transport trait and stream aliases.
pub mod transport;
/// Websocket transport.
pub mod websocket;
