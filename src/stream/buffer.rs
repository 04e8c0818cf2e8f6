//! Append-only event log shared between the receive loop and waiters.
//!
//! The buffer grows without bound and never evicts. Sessions are short-lived
//! test fixtures, so memory is reclaimed when the session is dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::stream::proto::ServerEvent;

/// Thread-safe ordered record of received events with stable indices.
///
/// Clones share the same underlying log. Readers take snapshots and never
/// hold the lock beyond the copy of the requested range.
#[derive(Clone, Debug, Default)]
pub struct EventBuffer {
    inner: Arc<BufferInner>,
}

#[derive(Debug, Default)]
struct BufferInner {
    events: RwLock<Vec<Arc<ServerEvent>>>,
    len: AtomicUsize,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event and returns the index it was stored at.
    pub fn append(&self, event: ServerEvent) -> usize {
        let mut events = self
            .inner
            .events
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let index = events.len();
        events.push(Arc::new(event));
        self.inner.len.store(events.len(), Ordering::Release);
        index
    }

    /// Returns events at `[cursor, len)` as of the call.
    pub fn read_from(&self, cursor: EventCursor) -> Vec<Arc<ServerEvent>> {
        if cursor.position() >= self.len() {
            return Vec::new();
        }
        let events = self
            .inner
            .events
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        events
            .get(cursor.position()..)
            .map(<[Arc<ServerEvent>]>::to_vec)
            .unwrap_or_default()
    }

    pub fn get(&self, index: usize) -> Option<Arc<ServerEvent>> {
        self.inner
            .events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .cloned()
    }

    /// Copy of every event received so far.
    pub fn snapshot(&self) -> Vec<Arc<ServerEvent>> {
        self.read_from(EventCursor::start())
    }

    pub fn len(&self) -> usize {
        self.inner.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-waiter offset into an [`EventBuffer`].
///
/// A cursor at `c` means events `[0, c)` have been inspected and will not be
/// inspected again through this cursor. It only moves forward.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventCursor(usize);

impl EventCursor {
    pub fn start() -> Self {
        Self(0)
    }

    pub fn position(self) -> usize {
        self.0
    }

    pub(crate) fn advance(&mut self) {
        self.0 += 1;
    }
}
