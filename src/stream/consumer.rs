//! Session-scoped stream consumer.
//!
//! `StreamConsumer` owns one duplex channel and mirrors everything the server
//! pushes into its [`EventBuffer`]. Two background tasks run while the session
//! is active: a send loop that emits the handshake and periodic keepalives,
//! and a receive loop that appends every inbound event in arrival order.
//!
//! There is no backpressure: the buffer is unbounded and never evicts.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, TransportError};
use crate::stream::buffer::EventBuffer;
use crate::stream::matcher::EventMatcher;
use crate::stream::proto::{ClientEvent, ServerEvent};
use crate::stream::transport::{ClientEventStream, StreamTransport};

/// Default stream session timings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
    pub const STOP_GRACE: Duration = Duration::from_secs(2);
    pub const ATTACH_SETTLE: Duration = Duration::from_millis(200);
}

#[derive(Clone, Debug)]
pub struct StreamOptions {
    /// Delay between keepalive markers after the handshake.
    pub keepalive_interval: Duration,
    /// How long `stop` waits for the receive loop to observe closure.
    pub stop_grace: Duration,
    /// Pause after the channel opens before `start` returns, giving the
    /// server time to register the subscriber.
    pub attach_settle: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            keepalive_interval: StreamDefaults::KEEPALIVE_INTERVAL,
            stop_grace: StreamDefaults::STOP_GRACE,
            attach_settle: StreamDefaults::ATTACH_SETTLE,
        }
    }
}

/// Session lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// No background activity yet.
    Idle,
    /// Send and receive loops are running.
    Active,
    /// Shutdown requested; loops are winding down.
    Stopping,
    /// Terminal. The buffer stays readable.
    Stopped,
    /// Terminal after a transport failure. The buffer stays readable.
    Errored,
}

/// Transport failure recorded on the session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransportFailure {
    pub code: String,
    pub detail: String,
}

impl From<&TransportError> for TransportFailure {
    fn from(err: &TransportError) -> Self {
        Self {
            code: err.code().to_string(),
            detail: err.detail(),
        }
    }
}

/// How [`StreamConsumer::stop`] finished.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopOutcome {
    /// The session was not active.
    NotRunning,
    /// The receive loop observed closure and exited within the grace period.
    Drained,
    /// The grace period elapsed first; the receive loop was left running.
    Abandoned,
}

#[derive(Debug)]
struct Lifecycle {
    state: SessionState,
    last_error: Option<TransportFailure>,
}

#[derive(Clone, Debug)]
struct SharedLifecycle(Arc<Mutex<Lifecycle>>);

impl SharedLifecycle {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Lifecycle {
            state: SessionState::Idle,
            last_error: None,
        })))
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> SessionState {
        self.lock().state
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let mut guard = self.lock();
        if guard.state != from {
            return false;
        }
        guard.state = to;
        true
    }

    /// Moves a running session to `Stopped`.
    fn finish(&self) {
        let mut guard = self.lock();
        if matches!(guard.state, SessionState::Active | SessionState::Stopping) {
            guard.state = SessionState::Stopped;
        }
    }

    fn fail(&self, err: &TransportError) {
        let mut guard = self.lock();
        guard.last_error = Some(TransportFailure::from(err));
        if matches!(guard.state, SessionState::Active | SessionState::Stopping) {
            guard.state = SessionState::Errored;
        }
    }
}

/// Consumer of one session's server-push event stream.
pub struct StreamConsumer {
    client: String,
    transport: Arc<dyn StreamTransport>,
    options: StreamOptions,
    buffer: EventBuffer,
    lifecycle: SharedLifecycle,
    cancel: CancellationToken,
    send_task: Option<JoinHandle<()>>,
    receive_task: Option<JoinHandle<()>>,
}

impl StreamConsumer {
    /// Creates an idle consumer. `client` labels every log record.
    pub fn new<T>(client: impl Into<String>, transport: T) -> Self
    where
        T: StreamTransport,
    {
        Self {
            client: client.into(),
            transport: Arc::new(transport),
            options: StreamOptions::default(),
            buffer: EventBuffer::new(),
            lifecycle: SharedLifecycle::new(),
            cancel: CancellationToken::new(),
            send_task: None,
            receive_task: None,
        }
    }

    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    /// Failure that moved the session to [`SessionState::Errored`], if any.
    pub fn last_error(&self) -> Option<TransportFailure> {
        self.lifecycle.lock().last_error.clone()
    }

    /// Shared handle to the session buffer.
    pub fn buffer(&self) -> EventBuffer {
        self.buffer.clone()
    }

    pub fn events(&self) -> Vec<Arc<ServerEvent>> {
        self.buffer.snapshot()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// New matcher with its own cursor at the start of the buffer.
    pub fn matcher(&self) -> EventMatcher {
        EventMatcher::new(self.buffer()).with_client(self.client.clone())
    }

    /// Opens the channel and starts the send and receive loops.
    ///
    /// Returns once the channel is open and the attach pause has passed.
    /// Calling `start` on an active session is a no-op. A stopped or errored
    /// session cannot be restarted.
    pub async fn start(&mut self) -> Result<(), HarnessError> {
        match self.state() {
            SessionState::Active => return Ok(()),
            SessionState::Idle => {}
            state => return Err(HarnessError::SessionClosed { state }),
        }
        info!(event = "stream_starting", client = %self.client);
        self.lifecycle
            .transition(SessionState::Idle, SessionState::Active);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        self.send_task = Some(tokio::spawn(send_loop(
            self.client.clone(),
            outbound_tx,
            self.cancel.clone(),
            self.options.keepalive_interval,
        )));
        self.receive_task = Some(tokio::spawn(receive_loop(ReceiveLoop {
            client: self.client.clone(),
            transport: Arc::clone(&self.transport),
            outbound: UnboundedReceiverStream::new(outbound_rx).boxed(),
            buffer: self.buffer.clone(),
            lifecycle: self.lifecycle.clone(),
            cancel: self.cancel.clone(),
            ready_tx,
        })));

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                return Err(TransportError::Protocol(
                    "stream worker stopped before the channel opened".to_string(),
                )
                .into());
            }
        }

        if !self.options.attach_settle.is_zero() {
            tokio::time::sleep(self.options.attach_settle).await;
        }
        Ok(())
    }

    /// Requests shutdown and waits up to the grace period for the receive
    /// loop to observe channel closure.
    ///
    /// Cancellation is cooperative. When the grace period elapses first the
    /// loop is abandoned, not aborted, and [`StopOutcome::Abandoned`] is
    /// returned. The buffer remains readable either way.
    pub async fn stop(&mut self) -> StopOutcome {
        if !self
            .lifecycle
            .transition(SessionState::Active, SessionState::Stopping)
        {
            // An idle session keeps its token so it can still be started.
            if self.state() != SessionState::Idle {
                self.cancel.cancel();
            }
            self.send_task.take();
            self.receive_task.take();
            return StopOutcome::NotRunning;
        }
        self.cancel.cancel();
        info!(event = "stream_stopping", client = %self.client);

        let outcome = match self.receive_task.take() {
            Some(task) => match tokio::time::timeout(self.options.stop_grace, task).await {
                Ok(Ok(())) => StopOutcome::Drained,
                Ok(Err(err)) => {
                    warn!(event = "receive_loop_failed", client = %self.client, error = %err);
                    StopOutcome::Drained
                }
                Err(_) => {
                    warn!(
                        event = "stream_stop_abandoned",
                        client = %self.client,
                        grace_ms = self.options.stop_grace.as_millis() as u64,
                        "receive loop did not observe channel closure in time; abandoning it"
                    );
                    StopOutcome::Abandoned
                }
            },
            None => StopOutcome::Drained,
        };

        self.send_task.take();
        self.lifecycle.finish();
        info!(
            event = "stream_stopped",
            client = %self.client,
            events = self.buffer.len(),
            outcome = ?outcome
        );
        outcome
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

async fn send_loop(
    client: String,
    outbound_tx: mpsc::UnboundedSender<ClientEvent>,
    cancel: CancellationToken,
    keepalive_interval: Duration,
) {
    if outbound_tx
        .send(ClientEvent::Handshake {
            client_time_ms: now_ms(),
        })
        .is_err()
    {
        return;
    }

    let period = keepalive_interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let keepalive = ClientEvent::Keepalive { client_time_ms: now_ms() };
                if outbound_tx.send(keepalive).is_err() {
                    break;
                }
            }
        }
    }
    debug!(event = "send_loop_exited", client = %client);
}

struct ReceiveLoop {
    client: String,
    transport: Arc<dyn StreamTransport>,
    outbound: ClientEventStream,
    buffer: EventBuffer,
    lifecycle: SharedLifecycle,
    cancel: CancellationToken,
    ready_tx: oneshot::Sender<Result<(), TransportError>>,
}

async fn receive_loop(ctx: ReceiveLoop) {
    let ReceiveLoop {
        client,
        transport,
        outbound,
        buffer,
        lifecycle,
        cancel,
        ready_tx,
    } = ctx;

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransportError::Protocol(
            "session stopped before the channel opened".to_string(),
        )),
        opened = transport.open(outbound) => opened,
    };
    let mut inbound = match opened {
        Ok(inbound) => {
            let _ = ready_tx.send(Ok(()));
            inbound
        }
        Err(err) => {
            warn!(
                event = "stream_open_failed",
                client = %client,
                code = err.code(),
                detail = %err.detail()
            );
            lifecycle.fail(&err);
            cancel.cancel();
            let _ = ready_tx.send(Err(err));
            return;
        }
    };
    info!(event = "stream_started", client = %client);

    while let Some(next) = inbound.next().await {
        match next {
            Ok(event) => {
                match event.kind() {
                    Some(kind) => debug!(
                        event = "server_event",
                        client = %client,
                        index = buffer.len(),
                        kind = %kind,
                        summary = %event.payload
                    ),
                    None => warn!(
                        event = "unrecognized_server_event",
                        client = %client,
                        index = buffer.len(),
                        event_id = %event.event_id
                    ),
                }
                buffer.append(event);
                if cancel.is_cancelled() {
                    debug!(event = "receive_loop_cancelled", client = %client);
                    break;
                }
            }
            Err(err) => {
                warn!(
                    event = "stream_error",
                    client = %client,
                    code = err.code(),
                    detail = %err.detail()
                );
                lifecycle.fail(&err);
                cancel.cancel();
                return;
            }
        }
    }

    lifecycle.finish();
    cancel.cancel();
    info!(event = "stream_closed", client = %client, events = buffer.len());
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{SessionState, StopOutcome, StreamConsumer, StreamOptions};
    use crate::error::{HarnessError, TransportError};
    use crate::stream::memory::memory_channel;
    use crate::stream::proto::{ClientEvent, EventPayload, ServerEvent};

    fn quick_options() -> StreamOptions {
        StreamOptions {
            keepalive_interval: Duration::from_secs(1),
            stop_grace: Duration::from_millis(500),
            attach_settle: Duration::ZERO,
        }
    }

    fn removed(user: &str) -> ServerEvent {
        ServerEvent::new(EventPayload::MemberRemoved {
            room_id: "R1".to_string(),
            user_id: user.to_string(),
        })
    }

    async fn wait_for_len(consumer: &StreamConsumer, len: usize) {
        for _ in 0..100 {
            if consumer.len() >= len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("buffer never reached {len} events");
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_while_active() {
        let (transport, server) = memory_channel();
        let mut consumer = StreamConsumer::new("A", transport).with_options(quick_options());
        assert_eq!(consumer.state(), SessionState::Idle);

        consumer.start().await.expect("start");
        consumer.start().await.expect("second start is a no-op");
        assert_eq!(consumer.state(), SessionState::Active);
        assert!(server.is_attached());

        assert_eq!(consumer.stop().await, StopOutcome::Drained);
        assert_eq!(consumer.state(), SessionState::Stopped);
        assert!(matches!(
            consumer.start().await,
            Err(HarnessError::SessionClosed {
                state: SessionState::Stopped
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_start_leaves_session_startable() {
        let (transport, server) = memory_channel();
        let mut consumer = StreamConsumer::new("A", transport).with_options(quick_options());

        assert_eq!(consumer.stop().await, StopOutcome::NotRunning);
        assert_eq!(consumer.state(), SessionState::Idle);

        consumer.start().await.expect("idle session still starts");
        assert_eq!(consumer.state(), SessionState::Active);
        assert!(server.is_attached());
        assert_eq!(consumer.stop().await, StopOutcome::Drained);
    }

    #[tokio::test(start_paused = true)]
    async fn send_loop_emits_handshake_then_keepalives() {
        let (transport, server) = memory_channel();
        let mut consumer = StreamConsumer::new("A", transport).with_options(quick_options());
        consumer.start().await.expect("start");

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        let sent = server.client_events();
        assert!(matches!(sent.first(), Some(ClientEvent::Handshake { .. })));
        let keepalives = sent
            .iter()
            .filter(|event| matches!(event, ClientEvent::Keepalive { .. }))
            .count();
        assert_eq!(keepalives, 3);

        consumer.stop().await;
        let after_stop = server.client_events().len();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(server.client_events().len(), after_stop);
    }

    #[tokio::test]
    async fn events_are_buffered_in_arrival_order() {
        let (transport, server) = memory_channel();
        let mut consumer = StreamConsumer::new("A", transport).with_options(quick_options());
        consumer.start().await.expect("start");

        for user in ["U1", "U2", "U3"] {
            server.push(removed(user));
        }
        wait_for_len(&consumer, 3).await;

        let users: Vec<String> = consumer
            .events()
            .iter()
            .map(|event| match &event.payload {
                EventPayload::MemberRemoved { user_id, .. } => user_id.clone(),
                other => panic!("unexpected payload: {other:?}"),
            })
            .collect();
        assert_eq!(users, vec!["U1", "U2", "U3"]);
        consumer.stop().await;
    }

    #[tokio::test]
    async fn transport_failure_is_recorded_and_buffer_kept() {
        let (transport, server) = memory_channel();
        let mut consumer = StreamConsumer::new("A", transport).with_options(quick_options());
        consumer.start().await.expect("start");

        server.push(removed("U1"));
        server.fail("unavailable", "server going away");
        for _ in 0..100 {
            if consumer.state() == SessionState::Errored {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(consumer.state(), SessionState::Errored);
        let failure = consumer.last_error().expect("failure recorded");
        assert_eq!(failure.code, "unavailable");
        assert_eq!(failure.detail, "server going away");
        assert_eq!(consumer.len(), 1);
        assert_eq!(consumer.stop().await, StopOutcome::NotRunning);
    }

    #[tokio::test]
    async fn open_failure_is_returned_from_start() {
        let (transport, server) = memory_channel();
        server.reject_next_open(TransportError::remote("unauthenticated", "bad token"));
        let mut consumer = StreamConsumer::new("A", transport).with_options(quick_options());

        let err = consumer.start().await.expect_err("open fails");
        assert!(matches!(
            err,
            HarnessError::Transport(TransportError::Remote { ref code, .. }) if code == "unauthenticated"
        ));
        assert_eq!(consumer.state(), SessionState::Errored);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_abandons_a_receive_loop_that_never_sees_closure() {
        let (transport, server) = memory_channel();
        server.hold_open_on_hangup();
        let mut consumer = StreamConsumer::new("A", transport).with_options(quick_options());
        consumer.start().await.expect("start");
        server.push(removed("U1"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = tokio::time::Instant::now();
        assert_eq!(consumer.stop().await, StopOutcome::Abandoned);
        assert!(started.elapsed() <= Duration::from_millis(600));
        assert_eq!(consumer.state(), SessionState::Stopped);
        assert_eq!(consumer.len(), 1);
    }
}
