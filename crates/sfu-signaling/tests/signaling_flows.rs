//! Integration tests for client signaling flows.
//!
//! Drives peers through the session controller and peer actors against the
//! loopback engine: publish, consume, resume, chat and the ordering rules
//! between them.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use common::types::{Direction, MediaKind};
use sfu_signaling::signaling::protocol::{Notification, Response};
use sfu_test_utils::fixtures::{client_capabilities, h264_only_capabilities, requests};
use sfu_test_utils::TestRoom;

// ============================================================================
// Publish / consume
// ============================================================================

#[tokio::test]
async fn test_publish_then_consume_both_tracks() {
    let room = TestRoom::new();

    let alice = room.connect().await;
    assert!(!alice.ack.publisher_exists);
    let producers = alice.publish(&[MediaKind::Video, MediaKind::Audio]).await;

    let bob = room.connect().await;
    assert!(bob.ack.publisher_exists);
    let consumed = bob.subscribe_and_consume().await;

    assert_eq!(consumed.producer_peer_id, alice.peer_id());
    let video = consumed.video_params.as_ref().expect("video descriptor");
    let audio = consumed.audio_params.as_ref().expect("audio descriptor");
    assert_eq!(video.producer_id, producers[0]);
    assert_eq!(video.kind, MediaKind::Video);
    assert_eq!(audio.producer_id, producers[1]);
    assert_eq!(audio.kind, MediaKind::Audio);

    // Consumers start paused until the client resumes them
    for descriptor in consumed.descriptors() {
        assert_eq!(room.engine.consumer_paused(descriptor.id).await, Some(true));
    }

    let Response::Resumed(resumed) = bob.expect_ok(requests::resume_all()).await else {
        panic!("expected resumed response");
    };
    assert_eq!(resumed.resumed.len(), 2);
    for descriptor in consumed.descriptors() {
        assert_eq!(room.engine.consumer_paused(descriptor.id).await, Some(false));
    }

    assert_eq!(room.gateway.producer_count().await, 2);
    assert_eq!(room.gateway.consumer_count().await, 2);
}

#[tokio::test]
async fn test_audio_only_publisher_yields_null_video() {
    let room = TestRoom::new();
    let alice = room.connect().await;
    alice.publish(&[MediaKind::Audio]).await;

    let bob = room.connect().await;
    let consumed = bob.subscribe_and_consume().await;
    assert!(consumed.video_params.is_none());
    assert!(consumed.audio_params.is_some());
    assert_eq!(consumed.descriptors().len(), 1);
}

#[tokio::test]
async fn test_new_producer_announced_to_other_peers() {
    let room = TestRoom::new();

    let mut bob = room.connect().await;
    bob.join().await;

    let mut alice = room.connect().await;
    let producers = alice.publish(&[MediaKind::Video]).await;

    match bob.expect_notification("new-producer").await {
        Notification::NewProducer(announced) => {
            assert_eq!(announced.peer_id, alice.peer_id());
            assert_eq!(announced.producer_id, producers[0]);
            assert_eq!(announced.kind, MediaKind::Video);
        }
        other => panic!("unexpected notification: {other:?}"),
    }

    // The publisher is not told about its own producer
    alice.assert_no_notification().await;
}

#[tokio::test]
async fn test_consume_prefers_earliest_publisher() {
    let room = TestRoom::new();
    let first = room.connect().await;
    first.publish(&[MediaKind::Video]).await;
    let second = room.connect().await;
    second.publish(&[MediaKind::Video]).await;

    let viewer = room.connect().await;
    let consumed = viewer.subscribe_and_consume().await;
    assert_eq!(consumed.producer_peer_id, first.peer_id());

    // An explicit publisher overrides the default
    let Response::Consumed(explicit) = viewer
        .expect_ok(requests::consume_with(
            client_capabilities(),
            Some(second.peer_id()),
        ))
        .await
    else {
        panic!("expected consume response");
    };
    assert_eq!(explicit.producer_peer_id, second.peer_id());
}

// ============================================================================
// Ordering rules
// ============================================================================

#[tokio::test]
async fn test_consume_before_any_producer_cannot_consume() {
    let room = TestRoom::new();
    let bob = room.connect().await;
    bob.join().await;
    bob.open_transport(Direction::Recv).await;

    assert_eq!(bob.expect_err(requests::consume()).await, "cannot-consume");
    assert_eq!(room.gateway.consumer_count().await, 0);

    // The connection is still usable
    let alice = room.connect().await;
    alice.publish(&[MediaKind::Video]).await;
    assert_eq!(bob.consume().await.descriptors().len(), 1);
}

#[tokio::test]
async fn test_consume_without_recv_transport_is_protocol_order() {
    let room = TestRoom::new();
    let alice = room.connect().await;
    alice.publish(&[MediaKind::Video]).await;

    let bob = room.connect().await;
    bob.join().await;
    assert_eq!(bob.expect_err(requests::consume()).await, "protocol-order");
}

#[tokio::test]
async fn test_produce_before_connect_is_rejected_without_side_effects() {
    let room = TestRoom::new();
    let alice = room.connect().await;
    alice.join().await;
    alice
        .expect_ok(requests::create_transport(Direction::Send))
        .await;

    assert_eq!(
        alice.expect_err(requests::produce(MediaKind::Video)).await,
        "protocol-order"
    );

    let snapshot = room.gateway.snapshot_peer(alice.peer_id()).await.unwrap();
    assert!(snapshot.producers.is_empty());
    assert_eq!(room.engine.producer_count().await, 0);

    // Connecting afterwards makes the same request succeed
    alice
        .expect_ok(requests::connect_transport(Direction::Send))
        .await;
    alice.produce(MediaKind::Video).await;
}

#[tokio::test]
async fn test_requests_before_join_are_protocol_order() {
    let room = TestRoom::new();
    let alice = room.connect().await;

    assert_eq!(
        alice
            .expect_err(requests::create_transport(Direction::Send))
            .await,
        "protocol-order"
    );
    assert_eq!(
        alice
            .expect_err(requests::connect_transport(Direction::Send))
            .await,
        "protocol-order"
    );
    assert_eq!(room.engine.open_transport_count().await, 0);
}

#[tokio::test]
async fn test_duplicate_kind_is_rejected_for_every_peer() {
    let room = TestRoom::new();
    let alice = room.connect().await;
    let bob = room.connect().await;

    for peer in [&alice, &bob] {
        peer.publish(&[MediaKind::Video]).await;
        assert_eq!(
            peer.expect_err(requests::produce(MediaKind::Video)).await,
            "conflict"
        );
        // The other kind is still free
        peer.produce(MediaKind::Audio).await;
        assert_eq!(
            peer.expect_err(requests::produce(MediaKind::Audio)).await,
            "conflict"
        );
    }

    assert_eq!(room.gateway.producer_count().await, 4);
    assert_eq!(room.engine.producer_count().await, 4);
}

#[tokio::test]
async fn test_second_transport_per_direction_is_conflict() {
    let room = TestRoom::new();
    let alice = room.connect().await;
    alice.join().await;
    alice.open_transport(Direction::Send).await;

    assert_eq!(
        alice
            .expect_err(requests::create_transport(Direction::Send))
            .await,
        "conflict"
    );
    // The other direction is independent
    alice.open_transport(Direction::Recv).await;
    assert_eq!(room.engine.open_transport_count().await, 2);
}

#[tokio::test]
async fn test_incompatible_capabilities_cannot_consume() {
    let room = TestRoom::new();
    let alice = room.connect().await;
    alice.publish(&[MediaKind::Video]).await;

    let bob = room.connect().await;
    bob.join().await;
    bob.open_transport(Direction::Recv).await;

    assert_eq!(
        bob.expect_err(requests::consume_with(h264_only_capabilities(), None))
            .await,
        "cannot-consume"
    );
    assert_eq!(room.engine.consumer_count().await, 0);
}

#[tokio::test]
async fn test_requests_from_one_peer_run_in_order() {
    let room = TestRoom::new();
    let alice = room.connect().await;

    // Each request depends on the previous one; submit all before awaiting any.
    let pipeline = [
        requests::join(),
        requests::create_transport(Direction::Send),
        requests::connect_transport(Direction::Send),
        requests::produce(MediaKind::Video),
        requests::produce(MediaKind::Audio),
    ];
    let mut replies = Vec::new();
    for request in pipeline {
        replies.push(alice.handle.submit(request).await.unwrap());
    }

    let mut results = Vec::new();
    for reply in replies {
        results.push(reply.await.unwrap());
    }
    assert!(results.iter().all(Result::is_ok), "{results:?}");
    assert!(matches!(results[0], Ok(Response::Joined(_))));
    assert!(matches!(results[3], Ok(Response::Produced(_))));
    assert_eq!(room.gateway.producer_count().await, 2);
}

// ============================================================================
// Chat and admission
// ============================================================================

#[tokio::test]
async fn test_chat_reaches_every_peer_including_sender() {
    let room = TestRoom::new();
    let mut alice = room.connect().await;
    let mut bob = room.connect().await;
    let mut carol = room.connect().await;

    let response = alice.expect_ok(requests::chat("alice", "hello")).await;
    assert!(matches!(response, Response::Ack(_)));

    for peer in [&mut alice, &mut bob, &mut carol] {
        match peer.expect_notification("chat-message").await {
            Notification::ChatMessage(chat) => {
                assert_eq!(chat.username, "alice");
                assert_eq!(chat.text, "hello");
                assert_eq!(chat.line, "alice: hello");
            }
            other => panic!("unexpected notification: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_chat_does_not_require_join() {
    let room = TestRoom::new();
    let mut alice = room.connect().await;
    alice.expect_ok(requests::chat("alice", "early")).await;
    alice.expect_notification("chat-message").await;
}

#[tokio::test]
async fn test_connections_beyond_capacity_are_refused() {
    let room = TestRoom::builder().max_peers(2).build();
    let _alice = room.connect().await;
    let bob = room.connect().await;

    match room.try_connect().await {
        Err(e) => assert_eq!(e.error_code(), "capacity-exceeded"),
        Ok(_) => panic!("third peer should be refused"),
    }

    // A slot frees up once a peer leaves
    room.disconnect(&bob).await;
    let carol = room.connect().await;
    assert_eq!(room.gateway.peer_count().await, 2);
    assert!(!carol.ack.publisher_exists);
}

#[tokio::test]
async fn test_late_joiner_sees_existing_publisher() {
    let room = TestRoom::new();
    let alice = room.connect().await;
    alice.publish(&[MediaKind::Audio]).await;

    let bob = room.connect().await;
    assert!(bob.ack.publisher_exists);
    assert_ne!(bob.ack.connection_id, alice.ack.connection_id);
}
