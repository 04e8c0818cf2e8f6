//! Websocket duplex channel carrying JSON text frames.
//!
//! Each client marker is sent as one text frame; each inbound text frame is
//! decoded as one [`ServerEvent`]. Frames that fail to decode are logged and
//! skipped. Closing the outbound side sends a close frame so the server ends
//! the stream.

use futures_util::future::{self, BoxFuture};
use futures_util::{Sink, SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::stream::proto::ServerEvent;
use crate::stream::transport::{ClientEventStream, ServerEventStream, StreamTransport};

/// Opens session channels against a websocket endpoint.
#[derive(Clone)]
pub struct WebSocketTransport {
    endpoint: String,
    access_token: Option<SecretString>,
}

impl WebSocketTransport {
    /// Creates a transport for `endpoint` (`ws://` or `wss://`).
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            endpoint: endpoint.trim_end().to_string(),
            access_token: None,
        }
    }

    /// Sends `token` as a bearer credential on the upgrade request.
    pub fn with_access_token(mut self, token: SecretString) -> Self {
        self.access_token = Some(token);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request(&self) -> Result<Request, TransportError> {
        let mut request = self.endpoint.as_str().into_client_request()?;
        if let Some(token) = self.access_token.as_ref() {
            let header = format!("Bearer {}", token.expose_secret()).parse()?;
            request.headers_mut().insert("authorization", header);
        }
        Ok(request)
    }
}

impl StreamTransport for WebSocketTransport {
    fn open(
        &self,
        outbound: ClientEventStream,
    ) -> BoxFuture<'static, Result<ServerEventStream, TransportError>> {
        let request = self.request();
        Box::pin(async move {
            let (socket, _) = connect_async(request?).await?;
            let (sink, inbound) = socket.split();
            tokio::spawn(forward_client_events(sink, outbound));
            Ok(inbound
                .filter_map(|frame| future::ready(decode_frame(frame)))
                .boxed())
        })
    }
}

async fn forward_client_events<S>(mut sink: S, mut outbound: ClientEventStream)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(event) = outbound.next().await {
        let text = match event.to_text() {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "client_event_encode_failed", error = %err);
                continue;
            }
        };
        if let Err(err) = sink.send(Message::Text(text)).await {
            debug!(event = "client_event_send_failed", error = %err);
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

fn decode_frame(frame: Result<Message, WsError>) -> Option<Result<ServerEvent, TransportError>> {
    match frame {
        Ok(Message::Text(text)) => match ServerEvent::from_text(&text) {
            Ok(event) => Some(Ok(event)),
            Err(err) => {
                warn!(event = "server_event_decode_failed", error = %err, frame = %text);
                None
            }
        },
        Ok(Message::Ping(_) | Message::Pong(_)) => None,
        Ok(Message::Close(Some(close))) if close.code != CloseCode::Normal => Some(Err(
            TransportError::remote(u16::from(close.code).to_string(), close.reason.into_owned()),
        )),
        Ok(Message::Close(_)) => None,
        Ok(Message::Binary(_) | Message::Frame(_)) => Some(Err(TransportError::Protocol(
            "received non-text frame".to_string(),
        ))),
        Err(err) => Some(Err(TransportError::WebSocket(err))),
    }
}
