//! Deadline-bounded polling against arbitrary probes.
//!
//! Stream delivery is at-most-once, so scenarios that must not flake confirm
//! state through the authoritative request/response calls with these helpers.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::HarnessError;

/// Default timings for event and condition waits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WaitDefaults;

impl WaitDefaults {
    pub const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(50);
    pub const EVENT_TIMEOUT: Duration = Duration::from_secs(3);
    pub const CONDITION_POLL_INTERVAL: Duration = Duration::from_millis(100);
    pub const CONDITION_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Deadline `timeout` from now. Timeouts too large to represent, such as
/// `Duration::MAX`, saturate to a deadline decades away.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

/// Polls `probe` until it returns `true` or `timeout` elapses.
///
/// The probe runs at least once. On timeout the returned
/// [`HarnessError::ConditionNotMet`] carries `description`.
pub async fn wait_until<Probe, Fut>(
    description: &str,
    timeout: Duration,
    poll_interval: Duration,
    mut probe: Probe,
) -> Result<(), HarnessError>
where
    Probe: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    try_wait_until(description, timeout, poll_interval, || {
        let check = probe();
        async move { Ok::<bool, HarnessError>(check.await) }
    })
    .await
}

/// Like [`wait_until`] for probes that perform fallible remote calls.
///
/// A probe error ends the wait immediately and is returned unchanged. A probe
/// still in flight when the deadline passes is dropped and the wait fails
/// with [`HarnessError::ConditionNotMet`].
pub async fn try_wait_until<Probe, Fut, E>(
    description: &str,
    timeout: Duration,
    poll_interval: Duration,
    mut probe: Probe,
) -> Result<(), HarnessError>
where
    Probe: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: Into<HarnessError>,
{
    debug!(
        event = "wait_until",
        description,
        timeout_ms = timeout.as_millis() as u64
    );
    let deadline = deadline_after(timeout);
    let not_met = || HarnessError::ConditionNotMet {
        description: description.to_string(),
        timeout,
    };

    let mut attempts: u64 = 0;
    loop {
        attempts += 1;
        match tokio::time::timeout_at(deadline, probe()).await {
            Ok(Ok(true)) => {
                debug!(event = "condition_satisfied", description, attempts);
                return Ok(());
            }
            Ok(Ok(false)) => {}
            Ok(Err(error)) => return Err(error.into()),
            Err(_) => {
                debug!(event = "condition_not_met", description, attempts);
                return Err(not_met());
            }
        }

        let now = Instant::now();
        if now >= deadline {
            debug!(event = "condition_not_met", description, attempts);
            return Err(not_met());
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}
