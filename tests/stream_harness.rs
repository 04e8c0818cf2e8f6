use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use concord_harness::stream::consumer::{SessionState, StopOutcome, StreamConsumer, StreamOptions};
use concord_harness::stream::memory::{memory_channel, MemoryServer};
use concord_harness::stream::proto::{EventKind, EventPayload, Member, Role, ServerEvent};
use concord_harness::wait::{try_wait_until, wait_until, WaitDefaults};
use concord_harness::{HarnessError, RemoteCallError};
use tokio::time::Instant;

fn options() -> StreamOptions {
    StreamOptions {
        attach_settle: Duration::ZERO,
        ..StreamOptions::default()
    }
}

fn member_joined(room: &str, user: &str) -> ServerEvent {
    ServerEvent::new(EventPayload::MemberJoined {
        member: Member {
            room_id: room.to_string(),
            user_id: user.to_string(),
            role: Role::Member,
            nickname: None,
        },
    })
}

fn member_removed(room: &str, user: &str) -> ServerEvent {
    ServerEvent::new(EventPayload::MemberRemoved {
        room_id: room.to_string(),
        user_id: user.to_string(),
    })
}

fn in_room(room: &'static str) -> impl Fn(&ServerEvent) -> bool + Sync {
    move |event| event.payload.room_id() == Some(room)
}

async fn started(client: &str) -> (StreamConsumer, MemoryServer) {
    let (transport, server) = memory_channel();
    let mut consumer = StreamConsumer::new(client, transport).with_options(options());
    consumer.start().await.expect("start consumer");
    (consumer, server)
}

#[tokio::test(start_paused = true)]
async fn event_published_after_wait_begins_is_matched() {
    let (mut consumer, server) = started("B").await;
    let mut matcher = consumer.matcher();

    let publisher = {
        let server = server.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            server.push(member_joined("R1", "U2"));
        })
    };

    let started_at = Instant::now();
    let event = matcher
        .wait_for_event(
            EventKind::MemberJoined,
            WaitDefaults::EVENT_TIMEOUT,
            Some(&in_room("R1")),
        )
        .await
        .expect("member_joined arrives");
    assert!(started_at.elapsed() < Duration::from_millis(200));
    match &event.payload {
        EventPayload::MemberJoined { member } => assert_eq!(member.user_id, "U2"),
        other => panic!("unexpected payload: {other:?}"),
    }

    publisher.await.expect("publisher joins");
    assert_eq!(consumer.stop().await, StopOutcome::Drained);
}

#[tokio::test(start_paused = true)]
async fn drained_events_of_other_kinds_are_not_revisited() {
    let (mut consumer, server) = started("A").await;
    server.push(member_removed("R1", "U3"));
    server.push(member_joined("R1", "U2"));

    let mut matcher = consumer.matcher();
    matcher
        .wait_for_kind(EventKind::MemberJoined, Duration::from_secs(1))
        .await
        .expect("member_joined buffered");
    assert_eq!(matcher.cursor().position(), 2);

    let err = matcher
        .wait_for_kind(EventKind::MemberRemoved, Duration::from_millis(300))
        .await
        .expect_err("member_removed was already passed over");
    assert!(err.is_timed_out());

    // A fresh matcher has its own cursor and still sees it.
    let mut fresh = consumer.matcher();
    fresh
        .wait_for_kind(EventKind::MemberRemoved, Duration::from_millis(300))
        .await
        .expect("fresh cursor finds member_removed");

    consumer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn wait_for_event_timeout_is_bounded() {
    let (mut consumer, server) = started("A").await;
    server.push(member_joined("R9", "U1"));

    let mut matcher = consumer.matcher();
    let started_at = Instant::now();
    let err = matcher
        .wait_for_event(
            EventKind::MemberJoined,
            Duration::from_millis(500),
            Some(&in_room("R1")),
        )
        .await
        .expect_err("no member_joined for R1");
    let elapsed = started_at.elapsed();
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed <= Duration::from_millis(550));
    match err {
        HarnessError::TimedOut { kind, timeout } => {
            assert_eq!(kind, EventKind::MemberJoined);
            assert_eq!(timeout, Duration::from_millis(500));
        }
        other => panic!("unexpected error variant: {other:?}"),
    }

    consumer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn lost_broadcast_is_confirmed_through_authoritative_state() {
    let (mut consumer, _server) = started("B").await;
    // The membership write succeeds but the broadcast never reaches B.
    let membership_written = Arc::new(AtomicBool::new(false));
    {
        let membership_written = Arc::clone(&membership_written);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            membership_written.store(true, Ordering::SeqCst);
        });
    }

    let mut matcher = consumer.matcher();
    let err = matcher
        .wait_for_event(
            EventKind::MemberJoined,
            Duration::from_secs(1),
            Some(&in_room("R1")),
        )
        .await
        .expect_err("broadcast was dropped");
    assert!(err.is_timed_out());

    let probe_state = Arc::clone(&membership_written);
    wait_until(
        "B listed as member of R1",
        WaitDefaults::CONDITION_TIMEOUT,
        WaitDefaults::CONDITION_POLL_INTERVAL,
        move || {
            let probe_state = Arc::clone(&probe_state);
            async move { probe_state.load(Ordering::SeqCst) }
        },
    )
    .await
    .expect("membership is authoritative");

    consumer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn remote_call_failure_ends_condition_wait() {
    let err = try_wait_until(
        "members listed",
        WaitDefaults::CONDITION_TIMEOUT,
        WaitDefaults::CONDITION_POLL_INTERVAL,
        || async { Err::<bool, _>(RemoteCallError::new("permission_denied", "not a member")) },
    )
    .await
    .expect_err("remote failure surfaces");
    assert!(matches!(
        err,
        HarnessError::RemoteCall(ref inner) if inner.code == "permission_denied"
    ));
}

#[tokio::test(start_paused = true)]
async fn stop_is_bounded_when_peer_never_closes() {
    let (transport, server) = memory_channel();
    server.hold_open_on_hangup();
    let mut consumer = StreamConsumer::new("A", transport).with_options(options());
    consumer.start().await.expect("start consumer");
    server.push(member_joined("R1", "U2"));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let started_at = Instant::now();
    assert_eq!(consumer.stop().await, StopOutcome::Abandoned);
    let elapsed = started_at.elapsed();
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_millis(2_100));

    assert_eq!(consumer.state(), SessionState::Stopped);
    let mut matcher = consumer.matcher();
    matcher
        .wait_for_kind(EventKind::MemberJoined, Duration::ZERO)
        .await
        .expect("buffer stays readable after stop");
}

#[tokio::test]
async fn sessions_buffer_independently() {
    let (mut a, server_a) = started("A").await;
    let (mut b, server_b) = started("B").await;

    server_a.push(member_removed("R1", "U9"));
    server_b.push(member_joined("R1", "U2"));
    server_b.push(member_joined("R2", "U2"));

    let mut b_matcher = b.matcher();
    b_matcher
        .wait_for_event(
            EventKind::MemberJoined,
            Duration::from_secs(2),
            Some(&in_room("R2")),
        )
        .await
        .expect("B sees its second event");
    a.matcher()
        .wait_for_kind(EventKind::MemberRemoved, Duration::from_secs(2))
        .await
        .expect("A sees its own event");

    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 2);
    assert!(a
        .events()
        .iter()
        .all(|event| event.kind() == Some(EventKind::MemberRemoved)));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn server_close_ends_session_cleanly() {
    let (mut consumer, server) = started("A").await;
    server.push(member_joined("R1", "U2"));
    server.close();

    wait_until(
        "session stopped",
        Duration::from_secs(2),
        Duration::from_millis(10),
        || {
            let state = consumer.state();
            async move { state == SessionState::Stopped }
        },
    )
    .await
    .expect("close observed");
    assert_eq!(consumer.len(), 1);
    assert!(consumer.last_error().is_none());
    assert_eq!(consumer.stop().await, StopOutcome::NotRunning);
}

#[tokio::test(start_paused = true)]
async fn unrecognized_events_do_not_interrupt_the_session() {
    let (mut consumer, server) = started("A").await;
    server.push(ServerEvent::new(EventPayload::Unrecognized));
    server.push(member_joined("R1", "U2"));

    let mut matcher = consumer.matcher();
    matcher
        .wait_for_event(
            EventKind::MemberJoined,
            Duration::from_secs(1),
            Some(&in_room("R1")),
        )
        .await
        .expect("known event after an unrecognized one is matched");
    assert_eq!(consumer.state(), SessionState::Active);
    assert_eq!(consumer.len(), 2);
    assert!(consumer.last_error().is_none());
    assert_eq!(consumer.events()[0].kind(), None);

    assert_eq!(consumer.stop().await, StopOutcome::Drained);
}
