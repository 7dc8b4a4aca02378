//! SFU Signaling Service Library
//!
//! Signaling state machine for a single-room selective forwarding unit.
//! Clients negotiate WebRTC media over a WebSocket: they load the room's
//! capabilities, create and connect transports, publish producers and
//! subscribe to other peers' producers as consumers. Media itself is
//! forwarded by a [`engine::MediaEngine`]; this crate only keeps the
//! signaling state consistent with it.
//!
//! # Architecture
//!
//! ```text
//! WebSocket (/ws) ── one socket per peer
//!     │
//! SessionControllerActor ── admits peers, supervises PeerActors
//!     │
//! PeerActor ── runs one peer's requests in order
//!     │
//! SignalingGateway ── validates, calls the engine, updates registries
//!     │
//! RoomState ── capability, transport, producer, consumer registries
//!              and the session directory
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Peer and controller actors
//! - [`config`] - Service configuration from environment
//! - [`engine`] - Media engine seam and the in-process loopback engine
//! - [`errors`] - Error types with wire error codes
//! - [`gateway`] - Request validation and engine orchestration
//! - [`observability`] - Metrics and health probes
//! - [`registry`] - Per-room resource registries
//! - [`signaling`] - Wire protocol and WebSocket endpoint

pub mod actors;
pub mod config;
pub mod engine;
pub mod errors;
pub mod gateway;
pub mod observability;
pub mod registry;
pub mod signaling;
