//! Two clients in one room. B's `member_joined` broadcast is dropped, so the
//! scenario falls back to polling the authoritative member list.
//!
//! Run with `RUST_LOG=debug cargo run --example lost_broadcast`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use concord_harness::stream::consumer::{StreamConsumer, StreamOptions};
use concord_harness::stream::memory::memory_channel;
use concord_harness::stream::proto::{EventKind, EventPayload, Member, Role, ServerEvent};
use concord_harness::wait::{wait_until, WaitDefaults};
use concord_harness::HarnessError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ROOM: &str = "R1";

#[tokio::main]
async fn main() -> Result<(), HarnessError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let (transport_a, server_a) = memory_channel();
    let (transport_b, _server_b) = memory_channel();
    let options = StreamOptions {
        attach_settle: Duration::from_millis(50),
        ..StreamOptions::default()
    };
    let mut a = StreamConsumer::new("A", transport_a).with_options(options.clone());
    let mut b = StreamConsumer::new("B", transport_b).with_options(options);
    a.start().await?;
    b.start().await?;

    // Membership table standing in for the request/response surface.
    let members: Arc<Mutex<HashSet<String>>> = Arc::default();

    // A invites B. The write lands and A hears about it; B's copy is lost.
    members
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert("U_B".to_string());
    server_a.push(ServerEvent::new(EventPayload::MemberJoined {
        member: Member {
            room_id: ROOM.to_string(),
            user_id: "U_B".to_string(),
            role: Role::Member,
            nickname: None,
        },
    }));

    let in_room = |event: &ServerEvent| event.payload.room_id() == Some(ROOM);
    let joined = a
        .matcher()
        .wait_for_event(EventKind::MemberJoined, WaitDefaults::EVENT_TIMEOUT, Some(&in_room))
        .await?;
    info!(client = "A", summary = %joined.payload, "inviter saw the join");

    match b
        .matcher()
        .wait_for_event(EventKind::MemberJoined, Duration::from_millis(500), Some(&in_room))
        .await
    {
        Ok(event) => info!(client = "B", summary = %event.payload, "invitee saw the join"),
        Err(err) => {
            warn!(client = "B", error = %err, "broadcast missed; checking member list");
            let members = Arc::clone(&members);
            wait_until(
                "B listed as member of R1",
                WaitDefaults::CONDITION_TIMEOUT,
                WaitDefaults::CONDITION_POLL_INTERVAL,
                move || {
                    let listed = members
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .contains("U_B");
                    async move { listed }
                },
            )
            .await?;
            info!(client = "B", "membership confirmed");
        }
    }

    info!(outcome = ?a.stop().await, events = a.len(), "A stopped");
    info!(outcome = ?b.stop().await, events = b.len(), "B stopped");
    Ok(())
}
