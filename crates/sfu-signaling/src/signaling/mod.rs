//! Client-facing signaling: the wire protocol and the WebSocket endpoint.

pub mod protocol;
pub mod websocket;

pub use websocket::{signaling_router, SignalingState, NOTIFICATION_QUEUE_CAPACITY};
