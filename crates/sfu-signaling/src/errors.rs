//! Signaling error types.
//!
//! Every per-request failure is returned on the request's own response frame
//! with a stable wire code. Internal details are logged server-side but not
//! exposed to clients.

use crate::engine::EngineError;
use thiserror::Error;

/// Signaling gateway error type.
///
/// Maps to wire error codes:
/// - `ProtocolOrder`: `protocol-order` (request arrived out of sequence)
/// - `NotFound`: `not-found`
/// - `CannotConsume`: `cannot-consume` (nothing to consume or incompatible capabilities)
/// - `Conflict`: `conflict`
/// - `BadRequest`: `bad-request`
/// - `CapacityExceeded`, `Draining`: `capacity-exceeded`
/// - `Engine`: `engine-error`
/// - `EngineFatal`: `engine-fatal`
/// - `Internal`: `internal`
#[derive(Debug, Error)]
pub enum SignalingError {
    /// Request violates the negotiation sequence (e.g. produce before connect).
    #[error("Protocol order violation: {0}")]
    ProtocolOrder(String),

    /// Referenced transport, producer, consumer or peer does not exist.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// No producer to consume, or capabilities cannot receive it.
    #[error("Cannot consume: {0}")]
    CannotConsume(String),

    /// Resource already exists (e.g. second producer of the same kind).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed frame or payload.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Peer limit reached.
    #[error("Server at capacity")]
    CapacityExceeded,

    /// Server is shutting down.
    #[error("Server is draining")]
    Draining,

    /// Media engine rejected an operation (non-fatal).
    #[error("Media engine error: {0}")]
    Engine(String),

    /// Media engine is gone; the process is terminating.
    #[error("Media engine fatal error: {0}")]
    EngineFatal(String),

    /// Internal error (channel failures and similar).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SignalingError {
    /// Returns the wire error code for this error.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            SignalingError::ProtocolOrder(_) => "protocol-order",
            SignalingError::NotFound(_) => "not-found",
            SignalingError::CannotConsume(_) => "cannot-consume",
            SignalingError::Conflict(_) => "conflict",
            SignalingError::BadRequest(_) => "bad-request",
            SignalingError::CapacityExceeded | SignalingError::Draining => "capacity-exceeded",
            SignalingError::Engine(_) => "engine-error",
            SignalingError::EngineFatal(_) => "engine-fatal",
            SignalingError::Internal(_) => "internal",
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SignalingError::ProtocolOrder(msg)
            | SignalingError::NotFound(msg)
            | SignalingError::CannotConsume(msg)
            | SignalingError::Conflict(msg)
            | SignalingError::BadRequest(msg) => msg.clone(),
            SignalingError::CapacityExceeded => "Server is at capacity, please try again".to_string(),
            SignalingError::Draining => "Server is shutting down, please reconnect".to_string(),
            SignalingError::Engine(_) => "Media engine rejected the request".to_string(),
            SignalingError::EngineFatal(_) => "Media engine unavailable".to_string(),
            SignalingError::Internal(_) => "An internal error occurred".to_string(),
        }
    }

    /// Returns true if this error means the whole process is going down.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, SignalingError::EngineFatal(_))
    }
}

impl From<EngineError> for SignalingError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::WorkerDied(reason) => SignalingError::EngineFatal(reason),
            other => SignalingError::Engine(other.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::types::TransportId;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            SignalingError::ProtocolOrder("produce before connect".to_string()).error_code(),
            "protocol-order"
        );
        assert_eq!(
            SignalingError::NotFound("consumer".to_string()).error_code(),
            "not-found"
        );
        assert_eq!(
            SignalingError::CannotConsume("nothing to consume".to_string()).error_code(),
            "cannot-consume"
        );
        assert_eq!(
            SignalingError::Conflict("video producer exists".to_string()).error_code(),
            "conflict"
        );
        assert_eq!(
            SignalingError::BadRequest("unknown event".to_string()).error_code(),
            "bad-request"
        );
        assert_eq!(SignalingError::CapacityExceeded.error_code(), "capacity-exceeded");
        assert_eq!(SignalingError::Draining.error_code(), "capacity-exceeded");
        assert_eq!(
            SignalingError::Engine("rejected".to_string()).error_code(),
            "engine-error"
        );
        assert_eq!(
            SignalingError::EngineFatal("worker died".to_string()).error_code(),
            "engine-fatal"
        );
        assert_eq!(
            SignalingError::Internal("channel closed".to_string()).error_code(),
            "internal"
        );
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let internal = SignalingError::Internal("channel send failed: 10.0.0.7".to_string());
        assert!(!internal.client_message().contains("10.0.0.7"));
        assert_eq!(internal.client_message(), "An internal error occurred");

        let engine = SignalingError::Engine("router 1234 missing".to_string());
        assert!(!engine.client_message().contains("1234"));

        let order = SignalingError::ProtocolOrder("send transport is not connected".to_string());
        assert_eq!(order.client_message(), "send transport is not connected");
    }

    #[test]
    fn test_engine_error_conversion() {
        let fatal: SignalingError = EngineError::WorkerDied("SIGKILL".to_string()).into();
        assert!(fatal.is_fatal());
        assert_eq!(fatal.error_code(), "engine-fatal");

        let id = TransportId::new();
        let non_fatal: SignalingError = EngineError::UnknownTransport(id).into();
        assert!(!non_fatal.is_fatal());
        assert!(matches!(non_fatal, SignalingError::Engine(msg) if msg.contains(&id.to_string())));
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", SignalingError::CannotConsume("nothing to consume".to_string())),
            "Cannot consume: nothing to consume"
        );
        assert_eq!(format!("{}", SignalingError::Draining), "Server is draining");
    }
}
