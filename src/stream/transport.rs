use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;

use crate::error::TransportError;
use crate::stream::proto::{ClientEvent, ServerEvent};

/// Lazily produced client-to-server markers handed to the transport.
pub type ClientEventStream = BoxStream<'static, ClientEvent>;

/// Ordered server-to-client events. The stream ends on clean closure and
/// yields an error when the channel fails.
pub type ServerEventStream = BoxStream<'static, Result<ServerEvent, TransportError>>;

/// Factory for the duplex event channel of one session.
///
/// `open` is called once per session. The transport drains `outbound` for as
/// long as the channel is up. Exhaustion of `outbound` signals that the client
/// is hanging up, after which a well-behaved peer ends the inbound stream.
pub trait StreamTransport: Send + Sync + 'static {
    fn open(
        &self,
        outbound: ClientEventStream,
    ) -> BoxFuture<'static, Result<ServerEventStream, TransportError>>;
}
