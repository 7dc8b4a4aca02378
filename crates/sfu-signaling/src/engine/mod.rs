//! Media engine seam.
//!
//! The selective-forwarding engine (RTP routing, ICE/DTLS, congestion
//! control) is an external collaborator. The gateway talks to it only
//! through [`MediaEngine`], and treats everything it hands back as opaque:
//! capability descriptors, RTP parameters and ICE/DTLS parameters travel as
//! JSON values that the gateway relays without interpreting.
//!
//! Asynchronous engine events (DTLS state changes, producers closing, the
//! worker dying) are delivered on a broadcast channel obtained from
//! [`MediaEngine::subscribe`].

pub mod loopback;

pub use loopback::{LoopbackEngine, LoopbackSettings};

use async_trait::async_trait;
use common::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;
use tokio::sync::broadcast;

macro_rules! opaque_payload {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Value);

        impl From<Value> for $name {
            fn from(value: Value) -> Self {
                Self(value)
            }
        }
    };
}

opaque_payload!(
    /// Negotiated media formats and header extensions (router or device side).
    RtpCapabilities
);

opaque_payload!(
    /// Per-track RTP parameters produced by the client or the engine.
    RtpParameters
);

opaque_payload!(
    /// DTLS role and certificate fingerprints.
    DtlsParameters
);

opaque_payload!(
    /// ICE username fragment and password.
    IceParameters
);

/// Errors reported by the media engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The engine worker process is gone. Always fatal.
    #[error("media worker died: {0}")]
    WorkerDied(String),

    #[error("unknown router {0}")]
    UnknownRouter(RouterId),

    #[error("unknown transport {0}")]
    UnknownTransport(TransportId),

    #[error("unknown producer {0}")]
    UnknownProducer(ProducerId),

    #[error("unknown consumer {0}")]
    UnknownConsumer(ConsumerId),

    /// Parameters were structurally unusable.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// The engine refused the operation.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// One codec the room's router is created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaCodec {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub parameters: serde_json::Map<String, Value>,
}

/// Room codecs: Opus stereo audio and VP8 video.
#[must_use]
pub fn default_media_codecs() -> Vec<MediaCodec> {
    let mut vp8_parameters = serde_json::Map::new();
    vp8_parameters.insert("x-google-start-bitrate".to_string(), Value::from(1000));

    vec![
        MediaCodec {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: Some(2),
            parameters: serde_json::Map::new(),
        },
        MediaCodec {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: None,
            parameters: vp8_parameters,
        },
    ]
}

/// Fixed network parameters used for every WebRTC transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebRtcTransportOptions {
    pub listen_ip: IpAddr,
    /// Address advertised in ICE candidates when the listen address is not reachable.
    pub announced_ip: Option<IpAddr>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

impl Default for WebRtcTransportOptions {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }
}

/// Router identity plus the capability descriptor it advertises.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterCapabilities {
    pub router_id: RouterId,
    pub rtp_capabilities: RtpCapabilities,
}

/// Connection parameters relayed to the client after transport creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub transport_id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<Value>,
    pub dtls_parameters: DtlsParameters,
}

/// Descriptor for one consumer, relayed to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// DTLS state of an engine-side transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Why the engine closed a producer on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerCloseReason {
    /// The publishing client stopped the track.
    TrackEnded,
    /// The producer's transport went away.
    TransportClosed,
}

impl ProducerCloseReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ProducerCloseReason::TrackEnded => "track_ended",
            ProducerCloseReason::TransportClosed => "transport_closed",
        }
    }
}

/// Asynchronous event emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    DtlsStateChanged {
        transport_id: TransportId,
        state: DtlsState,
    },
    ProducerClosed {
        producer_id: ProducerId,
        reason: ProducerCloseReason,
    },
    WorkerDied {
        reason: String,
    },
}

/// Operations the signaling gateway needs from a selective-forwarding engine.
///
/// Every method may suspend for a long time; callers must never hold
/// registry locks across these calls. Close operations are idempotent and
/// infallible from the caller's point of view.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Short engine name for logs.
    fn name(&self) -> &'static str;

    /// Create the routing context for a room.
    async fn create_router(&self, codecs: &[MediaCodec])
        -> Result<RouterCapabilities, EngineError>;

    async fn create_webrtc_transport(
        &self,
        router_id: RouterId,
        options: &WebRtcTransportOptions,
    ) -> Result<TransportParams, EngineError>;

    /// Apply the client's DTLS parameters. The engine later reports
    /// `DtlsState::Connected` through an event.
    async fn connect_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError>;

    async fn produce(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerId, EngineError>;

    /// Whether a device with `rtp_capabilities` can receive `producer_id`.
    async fn can_consume(
        &self,
        router_id: RouterId,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError>;

    async fn consume(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerParams, EngineError>;

    async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<(), EngineError>;

    /// Close a transport together with every producer and consumer on it.
    async fn close_transport(&self, transport_id: TransportId);

    async fn close_producer(&self, producer_id: ProducerId);

    async fn close_consumer(&self, consumer_id: ConsumerId);

    /// Subscribe to asynchronous engine events.
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_codecs_match_room_profile() {
        let codecs = default_media_codecs();
        assert_eq!(codecs.len(), 2);

        let opus = codecs.iter().find(|c| c.kind == MediaKind::Audio).unwrap();
        assert_eq!(opus.mime_type, "audio/opus");
        assert_eq!(opus.clock_rate, 48_000);
        assert_eq!(opus.channels, Some(2));

        let vp8 = codecs.iter().find(|c| c.kind == MediaKind::Video).unwrap();
        assert_eq!(vp8.mime_type, "video/VP8");
        assert_eq!(vp8.clock_rate, 90_000);
        assert_eq!(
            vp8.parameters.get("x-google-start-bitrate"),
            Some(&json!(1000))
        );
    }

    #[test]
    fn test_codec_serialization_is_camel_case() {
        let value = serde_json::to_value(&default_media_codecs()[..1]).unwrap();
        assert_eq!(
            value,
            json!([{ "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 }])
        );
    }

    #[test]
    fn test_transport_params_wire_format() {
        let params = TransportParams {
            transport_id: TransportId::new(),
            ice_parameters: json!({ "usernameFragment": "u", "password": "p" }).into(),
            ice_candidates: vec![json!({ "ip": "127.0.0.1", "port": 2000 })],
            dtls_parameters: json!({ "role": "auto" }).into(),
        };
        let value = serde_json::to_value(&params).unwrap();
        assert!(value.get("transportId").is_some());
        assert_eq!(value["iceParameters"]["usernameFragment"], "u");
        assert_eq!(value["iceCandidates"][0]["port"], 2000);
        assert_eq!(value["dtlsParameters"]["role"], "auto");
    }

    #[test]
    fn test_opaque_payloads_are_transparent() {
        let caps = RtpCapabilities(json!({ "codecs": [] }));
        assert_eq!(serde_json::to_value(&caps).unwrap(), json!({ "codecs": [] }));
    }
}
