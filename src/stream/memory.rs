//! In-process duplex channel for driving sessions from tests and demos.
//!
//! [`memory_channel`] returns the transport half handed to a
//! [`StreamConsumer`](crate::stream::consumer::StreamConsumer) and a
//! [`MemoryServer`] that plays the remote side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use futures_util::{stream, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TransportError;
use crate::stream::proto::{ClientEvent, ServerEvent};
use crate::stream::transport::{ClientEventStream, ServerEventStream, StreamTransport};

enum Frame {
    Event(ServerEvent),
    Fail(TransportError),
    Close,
}

struct MemoryShared {
    inbound_tx: mpsc::UnboundedSender<Frame>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    open_failure: Mutex<Option<TransportError>>,
    client_events: Mutex<Vec<ClientEvent>>,
    attached: AtomicBool,
    hold_open: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Creates a connected transport/server pair.
pub fn memory_channel() -> (MemoryTransport, MemoryServer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(MemoryShared {
        inbound_tx,
        inbound_rx: Mutex::new(Some(inbound_rx)),
        open_failure: Mutex::new(None),
        client_events: Mutex::new(Vec::new()),
        attached: AtomicBool::new(false),
        hold_open: AtomicBool::new(false),
    });
    (
        MemoryTransport {
            shared: Arc::clone(&shared),
        },
        MemoryServer { shared },
    )
}

/// Transport half of a [`memory_channel`]. Can be opened once.
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<MemoryShared>,
}

impl StreamTransport for MemoryTransport {
    fn open(
        &self,
        outbound: ClientEventStream,
    ) -> BoxFuture<'static, Result<ServerEventStream, TransportError>> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            if let Some(err) = lock(&shared.open_failure).take() {
                return Err(err);
            }
            let inbound_rx = lock(&shared.inbound_rx).take().ok_or_else(|| {
                TransportError::Protocol("memory channel was already opened".to_string())
            })?;

            shared.attached.store(true, Ordering::SeqCst);
            tokio::spawn(record_client_events(outbound, Arc::clone(&shared)));

            let inbound = stream::unfold(inbound_rx, |mut rx| async move {
                match rx.recv().await? {
                    Frame::Event(event) => Some((Ok(event), rx)),
                    Frame::Fail(err) => Some((Err(err), rx)),
                    Frame::Close => None,
                }
            });
            Ok(inbound.boxed())
        })
    }
}

async fn record_client_events(mut outbound: ClientEventStream, shared: Arc<MemoryShared>) {
    while let Some(event) = outbound.next().await {
        lock(&shared.client_events).push(event);
    }
    shared.attached.store(false, Ordering::SeqCst);
    if shared.hold_open.load(Ordering::SeqCst) {
        debug!(event = "memory_client_hangup_ignored");
        return;
    }
    let _ = shared.inbound_tx.send(Frame::Close);
}

/// Remote side of a [`memory_channel`].
#[derive(Clone)]
pub struct MemoryServer {
    shared: Arc<MemoryShared>,
}

impl MemoryServer {
    /// Delivers an event to the client. Events pushed before the client
    /// attaches are queued.
    pub fn push(&self, event: ServerEvent) {
        let _ = self.shared.inbound_tx.send(Frame::Event(event));
    }

    /// Terminates the channel with an error after queued events.
    pub fn fail(&self, code: impl Into<String>, detail: impl Into<String>) {
        let _ = self
            .shared
            .inbound_tx
            .send(Frame::Fail(TransportError::remote(code, detail)));
    }

    /// Ends the channel cleanly after queued events.
    pub fn close(&self) {
        let _ = self.shared.inbound_tx.send(Frame::Close);
    }

    /// Keeps the inbound side open after the client stops sending, like a
    /// peer that never notices the hangup.
    pub fn hold_open_on_hangup(&self) {
        self.shared.hold_open.store(true, Ordering::SeqCst);
    }

    /// Makes the next `open` call fail with `err`.
    pub fn reject_next_open(&self, err: TransportError) {
        *lock(&self.shared.open_failure) = Some(err);
    }

    /// Whether a client is attached and still sending.
    pub fn is_attached(&self) -> bool {
        self.shared.attached.load(Ordering::SeqCst)
    }

    /// Client markers received so far, in order.
    pub fn client_events(&self) -> Vec<ClientEvent> {
        lock(&self.shared.client_events).clone()
    }
}
