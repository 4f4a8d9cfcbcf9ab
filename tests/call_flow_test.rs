// Integration test: two or three call managers talking through the in-process
// relay and peer network. Covers the user-visible call flows end to end.

mod common;

use common::{World, connect, eventually};
use peer_call::calls::{CallDirection, OutboundSignal, SignalKind};
use peer_call::events::CallNotice;
use peer_call::identity::PeerId;
use peer_call::{CallError, CallPhase, Participant};

#[tokio::test]
async fn test_outgoing_call_accepted_then_ended() {
    // === 1. SETUP ===
    let world = World::new();
    let alice = world.join("alice").await;
    let mut bob = world.join("bob").await;

    // === 2. RING ===
    alice
        .manager
        .start(Participant::new("bob", "Bob"))
        .await
        .unwrap();
    let ringing = bob.wait_phase(CallPhase::Incoming).await;
    assert_eq!(ringing.direction, Some(CallDirection::Incoming));
    assert_eq!(ringing.remote_participant, Some(Participant::new("alice", "Alice")));
    assert_eq!(ringing.remote_identifier, Some(alice.id()));
    assert!(!ringing.has_local_stream, "callee must not open media before accepting");

    // === 3. CONNECT ===
    bob.manager.accept().await.unwrap();
    let a = alice.wait_connected().await;
    let b = bob.wait_connected().await;
    assert_eq!(a.remote_identifier, Some(bob.id()));
    assert!(a.started_at.is_some() && b.started_at.is_some());
    assert!(a.has_local_stream && b.has_local_stream);

    // === 4. END ===
    alice.manager.end().await.unwrap();
    assert!(alice.manager.snapshot().phase.is_idle());
    bob.wait_phase(CallPhase::Idle).await;

    assert_eq!(world.sent("alice", SignalKind::End), 1);
    assert_eq!(world.sent("bob", SignalKind::End), 0);
    assert_eq!(alice.manager.media_stats().held(), 0);
    eventually("bob to release media", || bob.manager.media_stats().held() == 0).await;

    let ended = bob
        .expect_notice(|n| matches!(n, CallNotice::CallEnded { .. }))
        .await;
    assert_eq!(
        ended,
        CallNotice::CallEnded {
            remote: Participant::new("alice", "Alice"),
            by_remote: true
        }
    );
}

#[tokio::test]
async fn test_callee_accept_announces_its_identifier() {
    let world = World::new();
    let alice = world.join("alice").await;
    let bob = world.join("bob").await;

    connect(&alice, &bob).await;

    let accepts: Vec<_> = world
        .relay
        .sent_by("bob")
        .into_iter()
        .filter_map(|s| match s {
            OutboundSignal::Accept(p) => Some(p),
            _ => None,
        })
        .collect();
    assert_eq!(accepts.len(), 1);
    assert_eq!(accepts[0].caller_id, "alice");
    assert_eq!(accepts[0].peer_id, bob.id());
    assert_eq!(world.sent("bob", SignalKind::Start), 0);
}

#[tokio::test]
async fn test_remote_end_returns_both_to_idle() {
    let world = World::new();
    let mut alice = world.join("alice").await;
    let bob = world.join("bob").await;

    connect(&alice, &bob).await;
    bob.manager.hangup().await.unwrap();
    alice.wait_phase(CallPhase::Idle).await;

    assert_eq!(world.sent("alice", SignalKind::End), 0);
    assert_eq!(world.sent("bob", SignalKind::End), 1);

    let ended = alice
        .expect_notice(|n| matches!(n, CallNotice::CallEnded { .. }))
        .await;
    assert!(matches!(ended, CallNotice::CallEnded { by_remote: true, .. }));
    eventually("both parties to release media", || {
        alice.manager.media_stats().held() == 0 && bob.manager.media_stats().held() == 0
    })
    .await;
}

#[tokio::test]
async fn test_rejected_call() {
    let world = World::new();
    let alice = world.join("alice").await;
    let bob = world.join("bob").await;

    alice
        .manager
        .start(Participant::new("bob", "Bob"))
        .await
        .unwrap();
    bob.wait_phase(CallPhase::Incoming).await;
    bob.manager.reject().await.unwrap();
    alice.wait_phase(CallPhase::Idle).await;

    assert_eq!(world.sent("bob", SignalKind::End), 1);
    assert_eq!(world.sent("bob", SignalKind::Accept), 0);
    assert_eq!(bob.devices.requests(), 0, "rejecting never opens media");
    eventually("alice to release media", || {
        alice.manager.media_stats().held() == 0
    })
    .await;
}

#[tokio::test]
async fn test_cancel_ignores_late_accept() {
    // === 1. SETUP ===
    let world = World::new();
    let alice = world.join("alice").await;
    let bob = world.join("bob").await;

    alice
        .manager
        .start(Participant::new("bob", "Bob"))
        .await
        .unwrap();
    bob.wait_phase(CallPhase::Incoming).await;

    // === 2. CANCEL WHILE RINGING ===
    alice.manager.cancel().await.unwrap();
    bob.wait_phase(CallPhase::Idle).await;
    assert_eq!(world.sent("alice", SignalKind::End), 1);

    // === 3. A STALE ACCEPT ARRIVES ===
    let late = world.raw_client("bob-2").await;
    late.emit(OutboundSignal::accept("alice", &bob.id()))
        .await
        .unwrap();
    eventually("alice to acknowledge the late accept", || {
        world.relay.unacknowledged().is_empty()
    })
    .await;

    // Round-trip through alice's worker so the late signal has been handled
    assert_eq!(alice.manager.toggle_mic().await.unwrap(), false);
    let snapshot = alice.manager.snapshot();
    assert_eq!(snapshot.phase, CallPhase::Idle);
    assert!(!snapshot.has_local_stream && !snapshot.has_remote_stream);
    assert_eq!(alice.manager.media_stats().held(), 0);
    assert_eq!(bob.peer.pending_offers(), 0);
}

#[tokio::test]
async fn test_denied_media_sends_nothing() {
    let world = World::new();
    let mut alice = world.join("alice").await;
    let bob = world.join("bob").await;
    alice.devices.set_denied(true);

    alice
        .manager
        .start(Participant::new("bob", "Bob"))
        .await
        .unwrap();
    let notice = alice
        .expect_notice(|n| matches!(n, CallNotice::MediaUnavailable { .. }))
        .await;
    assert!(matches!(notice, CallNotice::MediaUnavailable { .. }));
    alice.wait_phase(CallPhase::Idle).await;

    assert_eq!(world.sent("alice", SignalKind::Start), 0);
    assert_eq!(world.sent("alice", SignalKind::End), 0);
    assert_eq!(bob.manager.snapshot().phase, CallPhase::Idle);
    assert_eq!(alice.manager.media_stats().acquisitions, 0);

    // Access restored: the next attempt goes through
    alice.devices.set_denied(false);
    connect(&alice, &bob).await;
}

#[tokio::test]
async fn test_mic_toggle_keeps_the_capture() {
    let world = World::new();
    let alice = world.join("alice").await;
    let bob = world.join("bob").await;
    connect(&alice, &bob).await;

    let before = alice.manager.media_stats();
    assert_eq!(alice.manager.toggle_mic().await.unwrap(), false);
    assert!(!alice.manager.snapshot().mic_enabled);
    assert_eq!(alice.manager.toggle_mic().await.unwrap(), true);
    assert!(alice.manager.snapshot().mic_enabled);

    assert_eq!(alice.manager.toggle_camera().await.unwrap(), false);
    let snapshot = alice.manager.snapshot();
    assert!(snapshot.mic_enabled && !snapshot.cam_enabled);

    assert_eq!(alice.manager.media_stats(), before);
    assert_eq!(alice.devices.requests(), 1);
    assert_eq!(snapshot.phase, CallPhase::Active);
}

#[tokio::test]
async fn test_second_caller_gets_busy() {
    // === 1. ALICE AND BOB ARE TALKING ===
    let world = World::new();
    let alice = world.join("alice").await;
    let mut bob = world.join("bob").await;
    let mut carol = world.join("carol").await;
    connect(&alice, &bob).await;

    // === 2. CAROL CALLS BOB ===
    carol
        .manager
        .start(Participant::new("bob", "Bob"))
        .await
        .unwrap();
    let busy = bob
        .expect_notice(|n| matches!(n, CallNotice::Busy { .. }))
        .await;
    assert_eq!(
        busy,
        CallNotice::Busy {
            caller_id: "carol".into()
        }
    );
    carol.wait_phase(CallPhase::Idle).await;
    let ended = carol
        .expect_notice(|n| matches!(n, CallNotice::CallEnded { .. }))
        .await;
    assert!(matches!(ended, CallNotice::CallEnded { by_remote: true, .. }));

    // === 3. THE ORIGINAL CALL IS UNTOUCHED ===
    let b = bob.manager.snapshot();
    assert_eq!(b.phase, CallPhase::Active);
    assert_eq!(b.remote_participant.map(|p| p.id), Some("alice".to_string()));
    assert_eq!(world.sent("bob", SignalKind::End), 1);
    assert_eq!(alice.manager.snapshot().phase, CallPhase::Active);
    eventually("carol to release media", || {
        carol.manager.media_stats().held() == 0
    })
    .await;
}

#[tokio::test]
async fn test_start_while_live_is_busy() {
    let world = World::new();
    let alice = world.join("alice").await;
    let bob = world.join("bob").await;
    connect(&alice, &bob).await;

    let err = alice
        .manager
        .start(Participant::new("carol", "Carol"))
        .await
        .unwrap_err();
    assert_eq!(err, CallError::Busy);
    assert_eq!(world.sent("alice", SignalKind::Start), 1);
    assert_eq!(alice.manager.snapshot().phase, CallPhase::Active);
}

#[tokio::test]
async fn test_identifier_is_stable_across_sessions() {
    let world = World::new();
    let alice = world.join("alice").await;
    let bob = world.join("bob").await;

    for _ in 0..3 {
        connect(&alice, &bob).await;
        alice.manager.end().await.unwrap();
        bob.wait_phase(CallPhase::Idle).await;
    }
    connect(&bob, &alice).await;
    bob.manager.end().await.unwrap();
    alice.wait_phase(CallPhase::Idle).await;

    let alice_ids = world.announced_ids("alice");
    assert_eq!(alice_ids.len(), 4);
    assert!(alice_ids.iter().all(|id| *id == alice.id()));
    let bob_ids: Vec<PeerId> = world.announced_ids("bob");
    assert!(bob_ids.iter().all(|id| *id == bob.id()));

    // Every session released what it acquired
    eventually("media to be released", || {
        alice.manager.media_stats().held() == 0 && bob.manager.media_stats().held() == 0
    })
    .await;
    assert_eq!(alice.manager.media_stats().acquisitions, 4);
    assert_eq!(alice.manager.snapshot().epoch, 4);
}
