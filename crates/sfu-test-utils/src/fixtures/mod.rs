//! Pre-configured test data fixtures for signaling tests.
//!
//! Provides:
//! - Client capability descriptors (compatible and incompatible)
//! - DTLS and RTP parameter payloads
//! - `ClientRequest` builders for every signaling event
//! - Raw JSON frames for WebSocket tests

use common::types::{ConsumerId, Direction, MediaKind, PeerId};
use serde_json::{json, Value};
use sfu_signaling::engine::{DtlsParameters, RtpCapabilities, RtpParameters};
use sfu_signaling::signaling::protocol::{
    ChatMessageRequest, ClientRequest, ConnectTransportRequest, ConsumeRequest,
    CreateTransportRequest, ProduceRequest, ResumeConsumerRequest,
};

/// Capabilities of a browser that receives the room's default codecs.
#[must_use]
pub fn client_capabilities() -> RtpCapabilities {
    RtpCapabilities(json!({
        "codecs": [
            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
            { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }
        ],
        "headerExtensions": []
    }))
}

/// Capabilities of a device that only decodes H264 video.
#[must_use]
pub fn h264_only_capabilities() -> RtpCapabilities {
    RtpCapabilities(json!({
        "codecs": [
            { "kind": "video", "mimeType": "video/H264", "clockRate": 90000 }
        ],
        "headerExtensions": []
    }))
}

/// DTLS parameters as a browser would send them.
#[must_use]
pub fn client_dtls() -> DtlsParameters {
    DtlsParameters(json!({
        "role": "client",
        "fingerprints": [
            { "algorithm": "sha-256", "value": "AB:CD:EF:01:23:45:67:89" }
        ]
    }))
}

/// RTP parameters for a track of `kind` using the room's default codec.
#[must_use]
pub fn rtp_parameters(kind: MediaKind) -> RtpParameters {
    match kind {
        MediaKind::Audio => RtpParameters(json!({
            "codecs": [{ "mimeType": "audio/opus", "clockRate": 48000, "channels": 2, "payloadType": 111 }],
            "encodings": [{ "ssrc": 1111 }]
        })),
        MediaKind::Video => RtpParameters(json!({
            "codecs": [{ "mimeType": "video/VP8", "clockRate": 90000, "payloadType": 96 }],
            "encodings": [{ "ssrc": 2222 }]
        })),
    }
}

/// Builders for every client request.
pub mod requests {
    use super::*;

    #[must_use]
    pub fn join() -> ClientRequest {
        ClientRequest::JoinRoom
    }

    #[must_use]
    pub fn create_transport(direction: Direction) -> ClientRequest {
        ClientRequest::CreateTransport(CreateTransportRequest { direction })
    }

    #[must_use]
    pub fn connect_transport(direction: Direction) -> ClientRequest {
        ClientRequest::ConnectTransport(ConnectTransportRequest {
            direction,
            dtls_parameters: client_dtls(),
        })
    }

    #[must_use]
    pub fn produce(kind: MediaKind) -> ClientRequest {
        ClientRequest::Produce(ProduceRequest {
            kind,
            rtp_parameters: rtp_parameters(kind),
            app_data: Value::Null,
        })
    }

    /// Consume from the earliest publisher with compatible capabilities.
    #[must_use]
    pub fn consume() -> ClientRequest {
        consume_with(client_capabilities(), None)
    }

    #[must_use]
    pub fn consume_with(
        capabilities: RtpCapabilities,
        producer_peer_id: Option<PeerId>,
    ) -> ClientRequest {
        ClientRequest::Consume(ConsumeRequest {
            capabilities,
            producer_peer_id,
        })
    }

    /// Resume every paused consumer of the peer.
    #[must_use]
    pub fn resume_all() -> ClientRequest {
        ClientRequest::ResumeConsumer(ResumeConsumerRequest::default())
    }

    #[must_use]
    pub fn resume(consumer_id: ConsumerId) -> ClientRequest {
        ClientRequest::ResumeConsumer(ResumeConsumerRequest {
            consumer_id: Some(consumer_id),
        })
    }

    #[must_use]
    pub fn chat(username: &str, text: &str) -> ClientRequest {
        ClientRequest::ChatMessage(ChatMessageRequest {
            text: text.to_string(),
            username: username.to_string(),
        })
    }
}

/// Raw client frames for WebSocket tests.
pub mod frames {
    use super::*;

    /// `{"id", "event", "payload"}` as sent by a client.
    #[must_use]
    pub fn client_frame(id: u64, event: &str, payload: Value) -> String {
        json!({ "id": id, "event": event, "payload": payload }).to_string()
    }

    #[must_use]
    pub fn join(id: u64) -> String {
        client_frame(id, "join-room", json!({}))
    }

    #[must_use]
    pub fn create_transport(id: u64, direction: Direction) -> String {
        client_frame(id, "create-transport", json!({ "direction": direction.as_str() }))
    }

    #[must_use]
    pub fn connect_transport(id: u64, direction: Direction) -> String {
        client_frame(
            id,
            "connect-transport",
            json!({ "direction": direction.as_str(), "dtlsParameters": client_dtls().0 }),
        )
    }

    #[must_use]
    pub fn produce(id: u64, kind: MediaKind) -> String {
        client_frame(
            id,
            "produce",
            json!({ "kind": kind.as_str(), "rtpParameters": rtp_parameters(kind).0 }),
        )
    }

    #[must_use]
    pub fn chat(id: u64, username: &str, text: &str) -> String {
        client_frame(id, "chat-message", json!({ "username": username, "text": text }))
    }
}
