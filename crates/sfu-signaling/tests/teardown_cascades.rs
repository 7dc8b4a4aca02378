//! Integration tests for resource teardown.
//!
//! Covers the cascades triggered by peers leaving, the engine closing
//! producers or transports, requests racing a disconnect, and the fatal
//! path when the media worker dies.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use std::time::Duration;

use common::types::{Direction, MediaKind};
use sfu_signaling::signaling::protocol::{ClientRequest, Notification};
use sfu_test_utils::fixtures::requests;
use sfu_test_utils::{wait_until, TestPeer, TestRoom};

/// Count `producer-closed` notifications queued for `peer` right now.
fn producer_closed_count(peer: &mut TestPeer) -> usize {
    peer.drain_notifications()
        .iter()
        .filter(|n| matches!(n, Notification::ProducerClosed(_)))
        .count()
}

// ============================================================================
// Peer disconnect
// ============================================================================

#[tokio::test]
async fn test_publisher_disconnect_notifies_each_consumer_once() {
    let room = TestRoom::new();
    let alice = room.connect().await;
    alice.publish(&[MediaKind::Video, MediaKind::Audio]).await;

    let mut bob = room.connect().await;
    let mut carol = room.connect().await;
    bob.subscribe_and_consume().await;
    carol.subscribe_and_consume().await;
    assert_eq!(room.gateway.consumer_count().await, 4);

    bob.drain_notifications();
    carol.drain_notifications();

    room.disconnect(&alice).await;

    // One producer-closed per consumer: two tracks each
    assert_eq!(producer_closed_count(&mut bob), 2);
    assert_eq!(producer_closed_count(&mut carol), 2);
    bob.assert_no_notification().await;
    carol.assert_no_notification().await;

    assert_eq!(room.gateway.peer_count().await, 2);
    assert_eq!(room.gateway.producer_count().await, 0);
    assert_eq!(room.gateway.consumer_count().await, 0);
    assert_eq!(room.engine.producer_count().await, 0);
    assert_eq!(room.engine.consumer_count().await, 0);

    // Subscribers keep their receive transports and connection
    assert_eq!(room.engine.open_transport_count().await, 2);
    assert_eq!(bob.expect_err(requests::consume()).await, "cannot-consume");
}

#[tokio::test]
async fn test_subscriber_disconnect_leaves_publisher_untouched() {
    let room = TestRoom::new();
    let mut alice = room.connect().await;
    alice.publish(&[MediaKind::Video]).await;

    let bob = room.connect().await;
    bob.subscribe_and_consume().await;
    alice.drain_notifications();

    room.disconnect(&bob).await;

    alice.assert_no_notification().await;
    assert_eq!(room.gateway.producer_count().await, 1);
    assert_eq!(room.gateway.consumer_count().await, 0);
    assert_eq!(room.engine.consumer_count().await, 0);
    assert_eq!(room.engine.open_transport_count().await, 1);
}

#[tokio::test]
async fn test_disconnect_twice_is_not_found() {
    let room = TestRoom::new();
    let alice = room.connect().await;
    room.disconnect(&alice).await;

    let err = room.controller.disconnect(alice.peer_id()).await.unwrap_err();
    assert_eq!(err.error_code(), "not-found");
}

#[tokio::test]
async fn test_disconnect_during_transport_creation_releases_engine_transport() {
    let room = TestRoom::new();
    let alice = room.connect().await;
    alice.join().await;

    room.engine
        .set_transport_delay(Duration::from_millis(200))
        .await;
    let reply = alice
        .handle
        .submit(requests::create_transport(Direction::Send))
        .await
        .unwrap();

    // Let the request reach the engine, then drop the peer underneath it
    tokio::time::sleep(Duration::from_millis(50)).await;
    room.disconnect(&alice).await;
    assert_eq!(room.gateway.peer_count().await, 0);

    let result = reply.await.unwrap();
    assert_eq!(result.unwrap_err().error_code(), "not-found");
    assert_eq!(room.engine.open_transport_count().await, 0);
}

#[tokio::test]
async fn test_disconnect_during_produce_releases_engine_producer() {
    let room = TestRoom::new();
    let alice = room.connect().await;
    alice.join().await;
    alice.open_transport(Direction::Send).await;

    let mut bob = room.connect().await;
    bob.join().await;
    bob.drain_notifications();

    room.engine.set_produce_delay(Duration::from_millis(200)).await;
    let reply = alice
        .handle
        .submit(requests::produce(MediaKind::Video))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    room.disconnect(&alice).await;

    let result = reply.await.unwrap();
    assert_eq!(result.unwrap_err().error_code(), "not-found");
    assert_eq!(room.engine.producer_count().await, 0);
    assert_eq!(room.gateway.producer_count().await, 0);
    bob.assert_no_notification().await;
}

#[tokio::test]
async fn test_disconnect_during_consume_releases_engine_consumer() {
    let room = TestRoom::new();
    let alice = room.connect().await;
    alice.publish(&[MediaKind::Video]).await;

    let bob = room.connect().await;
    bob.join().await;
    bob.open_transport(Direction::Recv).await;

    room.engine.set_consume_delay(Duration::from_millis(200)).await;
    let reply = bob.handle.submit(requests::consume()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    room.disconnect(&bob).await;

    let result = reply.await.unwrap();
    assert_eq!(result.unwrap_err().error_code(), "not-found");
    assert_eq!(room.engine.consumer_count().await, 0);
    assert_eq!(room.gateway.consumer_count().await, 0);

    // The publisher is unaffected
    assert_eq!(room.gateway.producer_count().await, 1);
    assert_eq!(room.engine.producer_count().await, 1);
}

// ============================================================================
// Engine-initiated closes
// ============================================================================

#[tokio::test]
async fn test_ended_track_closes_only_its_consumers() {
    let room = TestRoom::new();
    let alice = room.connect().await;
    let producers = alice.publish(&[MediaKind::Video, MediaKind::Audio]).await;

    let mut bob = room.connect().await;
    bob.subscribe_and_consume().await;
    bob.drain_notifications();

    assert!(room.engine.end_track(producers[0]).await);

    match bob.expect_notification("producer-closed").await {
        Notification::ProducerClosed(closed) => {
            assert_eq!(closed.producer_id, producers[0]);
            assert_eq!(closed.kind, MediaKind::Video);
        }
        other => panic!("unexpected notification: {other:?}"),
    }
    bob.assert_no_notification().await;

    assert_eq!(room.gateway.producer_count().await, 1);
    assert_eq!(room.gateway.consumer_count().await, 1);

    // The publisher may produce video again
    alice.produce(MediaKind::Video).await;
}

#[tokio::test]
async fn test_remote_transport_close_cascades() {
    let room = TestRoom::new();
    let mut alice = room.connect().await;
    alice.join().await;
    let send_transport = alice.open_transport(Direction::Send).await;
    alice.produce(MediaKind::Video).await;
    alice.produce(MediaKind::Audio).await;

    let mut bob = room.connect().await;
    bob.subscribe_and_consume().await;
    bob.drain_notifications();
    alice.drain_notifications();

    assert!(room.engine.close_transport_remote(send_transport).await);

    match alice.expect_notification("transport-closed").await {
        Notification::TransportClosed(closed) => {
            assert_eq!(closed.transport_id, send_transport);
            assert_eq!(closed.direction, Direction::Send);
        }
        other => panic!("unexpected notification: {other:?}"),
    }

    let gateway = &room.gateway;
    wait_until("both consumers are closed", move || async move {
        gateway.consumer_count().await == 0
    })
    .await;
    assert_eq!(producer_closed_count(&mut bob), 2);

    let snapshot = room.gateway.snapshot_peer(alice.peer_id()).await.unwrap();
    assert!(snapshot.producers.is_empty());
    assert!(snapshot.transports.is_empty());

    // Producing now needs a new send transport
    assert_eq!(
        alice.expect_err(requests::produce(MediaKind::Video)).await,
        "protocol-order"
    );
    alice.open_transport(Direction::Send).await;
    alice.produce(MediaKind::Video).await;
}

#[tokio::test]
async fn test_failed_transport_creation_leaves_no_state() {
    let room = TestRoom::new();
    let alice = room.connect().await;
    alice.join().await;

    room.engine.fail_next_transport("no ports left").await;
    assert_eq!(
        alice
            .expect_err(requests::create_transport(Direction::Send))
            .await,
        "engine-error"
    );
    assert!(!room.gateway.fatal_token().is_cancelled());

    // The next attempt succeeds
    alice.open_transport(Direction::Send).await;
}

// ============================================================================
// Fatal engine failure
// ============================================================================

#[tokio::test]
async fn test_worker_death_is_fatal() {
    let room = TestRoom::new();
    let alice = room.connect().await;
    alice.publish(&[MediaKind::Video]).await;

    room.engine.kill_worker("worker crashed").await;

    let fatal = room.gateway.fatal_token();
    tokio::time::timeout(Duration::from_secs(2), fatal.cancelled())
        .await
        .expect("fatal signal not raised");
    assert_eq!(room.gateway.fatal_reason(), Some("worker crashed"));

    // Every request now fails with engine-fatal
    let err = room
        .gateway
        .handle_request(alice.peer_id(), ClientRequest::JoinRoom)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "engine-fatal");

    // The controller closes every peer and stops
    let controller = &room.controller;
    wait_until("controller stops", move || async move { controller.is_cancelled() }).await;
    let peer = &alice.handle;
    wait_until("peer actor is cancelled", move || async move { peer.is_cancelled() }).await;
    assert!(room.try_connect().await.is_err());
}

#[tokio::test]
async fn test_room_initialization_failure_is_fatal() {
    let room = TestRoom::new();

    // The worker dies before anyone joined, so the room cannot be created
    room.engine.kill_worker("startup crash").await;

    let err = room.gateway.ensure_room().await.unwrap_err();
    assert_eq!(err.error_code(), "engine-fatal");
    assert!(room.gateway.fatal_token().is_cancelled());
}
