//! Cursor-driven lookup of the next matching event in a session buffer.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::HarnessError;
use crate::stream::buffer::{EventBuffer, EventCursor};
use crate::stream::proto::{EventKind, ServerEvent};
use crate::wait::{deadline_after, WaitDefaults};

/// Predicate applied to events whose tag already matched.
pub type EventPredicate<'a> = &'a (dyn Fn(&ServerEvent) -> bool + Sync);

/// Waiter that owns one cursor over a shared [`EventBuffer`].
///
/// Every inspected event advances the cursor, matching or not. An event of
/// another kind that is drained while looking for `kind` is skipped for good
/// as far as this matcher is concerned. Use a separate matcher (or
/// [`crate::wait::wait_until`] against authoritative state) when ordering
/// between different kinds is not known up front.
#[derive(Debug)]
pub struct EventMatcher {
    client: String,
    buffer: EventBuffer,
    cursor: EventCursor,
    poll_interval: Duration,
}

impl EventMatcher {
    /// Creates a matcher positioned at the start of `buffer`.
    pub fn new(buffer: EventBuffer) -> Self {
        Self {
            client: String::new(),
            buffer,
            cursor: EventCursor::start(),
            poll_interval: WaitDefaults::EVENT_POLL_INTERVAL,
        }
    }

    /// Sets the client label attached to log records.
    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = client.into();
        self
    }

    /// Sets the sleep between buffer scans.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn cursor(&self) -> EventCursor {
        self.cursor
    }

    /// Waits for the next event of `kind` with no extra predicate.
    pub async fn wait_for_kind(
        &mut self,
        kind: EventKind,
        timeout: Duration,
    ) -> Result<Arc<ServerEvent>, HarnessError> {
        self.wait_for_event(kind, timeout, None).await
    }

    /// Scans forward from the cursor for an event of `kind` that satisfies
    /// `predicate`, polling until `timeout` has elapsed since the call.
    pub async fn wait_for_event(
        &mut self,
        kind: EventKind,
        timeout: Duration,
        predicate: Option<EventPredicate<'_>>,
    ) -> Result<Arc<ServerEvent>, HarnessError> {
        debug!(
            event = "wait_for_event",
            client = %self.client,
            kind = %kind,
            timeout_ms = timeout.as_millis() as u64,
            cursor = self.cursor.position()
        );
        let deadline = deadline_after(timeout);

        loop {
            if let Some(found) = self.scan(kind, predicate) {
                debug!(
                    event = "wait_for_event_matched",
                    client = %self.client,
                    kind = %kind,
                    cursor = self.cursor.position()
                );
                return Ok(found);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(
                    event = "wait_for_event_timed_out",
                    client = %self.client,
                    kind = %kind,
                    cursor = self.cursor.position()
                );
                return Err(HarnessError::TimedOut { kind, timeout });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    fn scan(
        &mut self,
        kind: EventKind,
        predicate: Option<EventPredicate<'_>>,
    ) -> Option<Arc<ServerEvent>> {
        for event in self.buffer.read_from(self.cursor) {
            self.cursor.advance();
            if event.kind() == Some(kind) && predicate.map_or(true, |accept| accept(&event)) {
                return Some(event);
            }
        }
        None
    }
}
