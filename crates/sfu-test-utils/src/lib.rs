//! # SFU Test Utilities
//!
//! Shared test utilities for the SFU signaling server.
//!
//! The loopback engine from `sfu-signaling` stands in for a real media
//! engine, so every flow runs in-process without ports or media.
//!
//! ## Modules
//!
//! - `fixtures` - Capability descriptors, DTLS/RTP payloads, request and frame builders
//! - `harness` - `TestRoom` (engine + gateway + controller) and `TestPeer`
//! - `ws` - `TestServer` on an ephemeral port and a `WsClient`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let room = TestRoom::new();
//!
//!     let alice = room.connect().await;
//!     alice.publish(&[MediaKind::Video]).await;
//!
//!     let mut bob = room.connect().await;
//!     assert!(bob.ack.publisher_exists);
//! }
//! ```
//!
//! ## Fault Injection
//!
//! ```rust,ignore
//! // Slow engine: a disconnect lands while create-transport is in flight
//! room.engine.set_transport_delay(Duration::from_millis(200)).await;
//!
//! // Worker crash: raises the process-level fatal signal
//! room.engine.kill_worker("segfault").await;
//! ```

pub mod fixtures;
pub mod harness;
pub mod ws;

// Re-export commonly used items
pub use fixtures::*;
pub use harness::*;
pub use ws::*;
