//! In-process loopback media engine.
//!
//! Implements [`MediaEngine`] without moving any media: it issues handles,
//! allocates ICE candidate ports from the configured RTC port range, decides
//! `can_consume` by codec MIME type, and reports DTLS `connected` as soon as a
//! transport is connected. It is the engine the binary runs with by default
//! and the one every test drives.
//!
//! Fault injection (`kill_worker`, `end_track`, `close_transport_remote`,
//! `fail_next_transport`, `set_transport_delay`, `set_produce_delay`,
//! `set_consume_delay`, `set_auto_dtls_connect`) lets tests exercise the
//! asynchronous event paths.

use super::{
    ConsumerParams, DtlsParameters, DtlsState, EngineError, EngineEvent, IceParameters,
    MediaCodec, MediaEngine, ProducerCloseReason, RouterCapabilities, RtpCapabilities,
    RtpParameters, TransportParams, WebRtcTransportOptions,
};

use async_trait::async_trait;
use common::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportId};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info};

/// Capacity of the engine event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// First dynamic payload type handed out to router codecs.
const FIRST_PAYLOAD_TYPE: u64 = 100;

/// Worker settings for the loopback engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackSettings {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for LoopbackSettings {
    fn default() -> Self {
        Self {
            rtc_min_port: 2000,
            rtc_max_port: 2020,
        }
    }
}

struct LoopTransport {
    closed: bool,
    dtls_connected: bool,
}

struct LoopProducer {
    transport_id: TransportId,
    kind: MediaKind,
    mime_type: String,
}

struct LoopConsumer {
    transport_id: TransportId,
    producer_id: ProducerId,
    paused: bool,
}

struct LoopbackState {
    worker_alive: bool,
    routers: HashMap<RouterId, RtpCapabilities>,
    transports: HashMap<TransportId, LoopTransport>,
    producers: HashMap<ProducerId, LoopProducer>,
    consumers: HashMap<ConsumerId, LoopConsumer>,
    next_port: u16,
    next_ssrc: u32,
    fail_next_transport: Option<String>,
    transport_delay: Duration,
    produce_delay: Duration,
    consume_delay: Duration,
    auto_dtls_connect: bool,
}

impl LoopbackState {
    fn ensure_alive(&self) -> Result<(), EngineError> {
        if self.worker_alive {
            Ok(())
        } else {
            Err(EngineError::WorkerDied("worker is not running".to_string()))
        }
    }

    fn open_transport(&self, transport_id: TransportId) -> Result<&LoopTransport, EngineError> {
        match self.transports.get(&transport_id) {
            Some(t) if !t.closed => Ok(t),
            _ => Err(EngineError::UnknownTransport(transport_id)),
        }
    }

    fn allocate_port(&mut self, settings: &LoopbackSettings) -> u16 {
        let port = self.next_port;
        self.next_port = if port >= settings.rtc_max_port {
            settings.rtc_min_port
        } else {
            port + 1
        };
        port
    }

    /// Drop a producer and every consumer reading from it.
    fn remove_producer(&mut self, producer_id: ProducerId) -> bool {
        let existed = self.producers.remove(&producer_id).is_some();
        self.consumers.retain(|_, c| c.producer_id != producer_id);
        existed
    }
}

/// Loopback implementation of [`MediaEngine`].
pub struct LoopbackEngine {
    settings: LoopbackSettings,
    state: Mutex<LoopbackState>,
    events: broadcast::Sender<EngineEvent>,
}

impl LoopbackEngine {
    /// Start a loopback worker.
    #[must_use]
    pub fn new(settings: LoopbackSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            target: "sfu.engine",
            rtc_min_port = settings.rtc_min_port,
            rtc_max_port = settings.rtc_max_port,
            "Loopback media worker started"
        );

        Self {
            settings,
            state: Mutex::new(LoopbackState {
                worker_alive: true,
                routers: HashMap::new(),
                transports: HashMap::new(),
                producers: HashMap::new(),
                consumers: HashMap::new(),
                next_port: settings.rtc_min_port,
                next_ssrc: 1_000_000,
                fail_next_transport: None,
                transport_delay: Duration::ZERO,
                produce_delay: Duration::ZERO,
                consume_delay: Duration::ZERO,
                auto_dtls_connect: true,
            }),
            events,
        }
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine; nothing is listening yet.
        let _ = self.events.send(event);
    }

    /// Simulate the worker process dying.
    pub async fn kill_worker(&self, reason: &str) {
        {
            let mut state = self.state.lock().await;
            state.worker_alive = false;
        }
        error!(target: "sfu.engine", reason = %reason, "Loopback media worker died");
        self.emit(EngineEvent::WorkerDied {
            reason: reason.to_string(),
        });
    }

    /// Simulate the publishing client ending a track.
    pub async fn end_track(&self, producer_id: ProducerId) -> bool {
        let existed = self.state.lock().await.remove_producer(producer_id);
        if existed {
            self.emit(EngineEvent::ProducerClosed {
                producer_id,
                reason: ProducerCloseReason::TrackEnded,
            });
        }
        existed
    }

    /// Simulate the client tearing down DTLS on a transport.
    pub async fn close_transport_remote(&self, transport_id: TransportId) -> bool {
        let known = self.state.lock().await.open_transport(transport_id).is_ok();
        if known {
            self.emit(EngineEvent::DtlsStateChanged {
                transport_id,
                state: DtlsState::Closed,
            });
        }
        known
    }

    /// Make the next transport creation fail with `reason`.
    pub async fn fail_next_transport(&self, reason: &str) {
        self.state.lock().await.fail_next_transport = Some(reason.to_string());
    }

    /// Delay every transport creation by `delay`.
    pub async fn set_transport_delay(&self, delay: Duration) {
        self.state.lock().await.transport_delay = delay;
    }

    /// Hold every producer creation for `delay` after the producer exists.
    pub async fn set_produce_delay(&self, delay: Duration) {
        self.state.lock().await.produce_delay = delay;
    }

    /// Hold every consumer creation for `delay` after the consumer exists.
    pub async fn set_consume_delay(&self, delay: Duration) {
        self.state.lock().await.consume_delay = delay;
    }

    /// When disabled, `connect_transport` succeeds but DTLS never reports connected.
    pub async fn set_auto_dtls_connect(&self, enabled: bool) {
        self.state.lock().await.auto_dtls_connect = enabled;
    }

    /// Number of live (not closed) transports.
    pub async fn open_transport_count(&self) -> usize {
        self.state
            .lock()
            .await
            .transports
            .values()
            .filter(|t| !t.closed)
            .count()
    }

    pub async fn producer_count(&self) -> usize {
        self.state.lock().await.producers.len()
    }

    pub async fn consumer_count(&self) -> usize {
        self.state.lock().await.consumers.len()
    }

    /// Whether a consumer exists and is paused, `None` if unknown.
    pub async fn consumer_paused(&self, consumer_id: ConsumerId) -> Option<bool> {
        self.state
            .lock()
            .await
            .consumers
            .get(&consumer_id)
            .map(|c| c.paused)
    }

    fn router_capabilities(codecs: &[MediaCodec]) -> RtpCapabilities {
        let codecs: Vec<Value> = codecs
            .iter()
            .zip(FIRST_PAYLOAD_TYPE..)
            .map(|(codec, payload_type)| {
                let mut entry = json!({
                    "kind": codec.kind,
                    "mimeType": codec.mime_type,
                    "clockRate": codec.clock_rate,
                    "preferredPayloadType": payload_type,
                    "parameters": codec.parameters,
                    "rtcpFeedback": [],
                });
                if let (Some(channels), Some(obj)) = (codec.channels, entry.as_object_mut()) {
                    obj.insert("channels".to_string(), Value::from(channels));
                }
                entry
            })
            .collect();

        RtpCapabilities(json!({ "codecs": codecs, "headerExtensions": [] }))
    }

    fn ice_candidates(options: &WebRtcTransportOptions, port: u16) -> Vec<Value> {
        let ip = options.announced_ip.unwrap_or(options.listen_ip).to_string();
        let mut candidates = Vec::new();
        if options.enable_udp {
            let priority = if options.prefer_udp { 1_076_302_079 } else { 1_076_302_078 };
            candidates.push(json!({
                "foundation": "udpcandidate",
                "ip": ip,
                "port": port,
                "priority": priority,
                "protocol": "udp",
                "type": "host",
            }));
        }
        if options.enable_tcp {
            let priority = if options.prefer_udp { 1_076_276_479 } else { 1_076_302_079 };
            candidates.push(json!({
                "foundation": "tcpcandidate",
                "ip": ip,
                "port": port,
                "priority": priority,
                "protocol": "tcp",
                "tcpType": "passive",
                "type": "host",
            }));
        }
        candidates
    }
}

/// First codec MIME type declared in a set of RTP parameters.
fn first_mime_type(rtp_parameters: &RtpParameters) -> Option<String> {
    rtp_parameters
        .0
        .get("codecs")?
        .as_array()?
        .first()?
        .get("mimeType")?
        .as_str()
        .map(str::to_string)
}

/// Codec entry in a capability descriptor matching `mime_type`.
fn matching_codec<'a>(capabilities: &'a RtpCapabilities, mime_type: &str) -> Option<&'a Value> {
    capabilities
        .0
        .get("codecs")?
        .as_array()?
        .iter()
        .find(|codec| {
            codec
                .get("mimeType")
                .and_then(Value::as_str)
                .is_some_and(|m| m.eq_ignore_ascii_case(mime_type))
        })
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn create_router(
        &self,
        codecs: &[MediaCodec],
    ) -> Result<RouterCapabilities, EngineError> {
        let mut state = self.state.lock().await;
        state.ensure_alive()?;

        if codecs.is_empty() {
            return Err(EngineError::InvalidParameters(
                "router needs at least one codec".to_string(),
            ));
        }

        let router_id = RouterId::new();
        let rtp_capabilities = Self::router_capabilities(codecs);
        state.routers.insert(router_id, rtp_capabilities.clone());

        debug!(target: "sfu.engine", router_id = %router_id, "Router created");

        Ok(RouterCapabilities {
            router_id,
            rtp_capabilities,
        })
    }

    async fn create_webrtc_transport(
        &self,
        router_id: RouterId,
        options: &WebRtcTransportOptions,
    ) -> Result<TransportParams, EngineError> {
        let delay = self.state.lock().await.transport_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        state.ensure_alive()?;

        if let Some(reason) = state.fail_next_transport.take() {
            return Err(EngineError::Rejected(reason));
        }
        if !state.routers.contains_key(&router_id) {
            return Err(EngineError::UnknownRouter(router_id));
        }
        if !options.enable_udp && !options.enable_tcp {
            return Err(EngineError::InvalidParameters(
                "neither UDP nor TCP enabled".to_string(),
            ));
        }

        let transport_id = TransportId::new();
        let port = state.allocate_port(&self.settings);
        state.transports.insert(
            transport_id,
            LoopTransport {
                closed: false,
                dtls_connected: false,
            },
        );

        debug!(
            target: "sfu.engine",
            transport_id = %transport_id,
            port = port,
            "WebRTC transport created"
        );

        let fingerprint = transport_id.0.simple().to_string().to_uppercase();
        Ok(TransportParams {
            transport_id,
            ice_parameters: IceParameters(json!({
                "usernameFragment": format!("{}", transport_id.0.simple()),
                "password": fingerprint.to_lowercase(),
                "iceLite": true,
            })),
            ice_candidates: Self::ice_candidates(options, port),
            dtls_parameters: DtlsParameters(json!({
                "role": "auto",
                "fingerprints": [{ "algorithm": "sha-256", "value": fingerprint }],
            })),
        })
    }

    async fn connect_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError> {
        let auto_connect = {
            let mut state = self.state.lock().await;
            state.ensure_alive()?;
            state.open_transport(transport_id)?;

            if !dtls_parameters.0.is_object() {
                return Err(EngineError::InvalidParameters(
                    "dtlsParameters must be an object".to_string(),
                ));
            }

            let auto_connect = state.auto_dtls_connect;
            let transport = state
                .transports
                .get_mut(&transport_id)
                .ok_or(EngineError::UnknownTransport(transport_id))?;
            if transport.dtls_connected {
                return Err(EngineError::Rejected("connect() already called".to_string()));
            }
            transport.dtls_connected = true;
            auto_connect
        };

        self.emit(EngineEvent::DtlsStateChanged {
            transport_id,
            state: DtlsState::Connecting,
        });
        if auto_connect {
            self.emit(EngineEvent::DtlsStateChanged {
                transport_id,
                state: DtlsState::Connected,
            });
        }
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerId, EngineError> {
        let mut state = self.state.lock().await;
        state.ensure_alive()?;
        state.open_transport(transport_id)?;

        let mime_type = first_mime_type(rtp_parameters).ok_or_else(|| {
            EngineError::InvalidParameters("rtpParameters.codecs[0].mimeType missing".to_string())
        })?;
        if !mime_type
            .to_ascii_lowercase()
            .starts_with(&format!("{}/", kind.as_str()))
        {
            return Err(EngineError::InvalidParameters(format!(
                "codec {mime_type} does not match kind {kind}"
            )));
        }

        let producer_id = ProducerId::new();
        state.producers.insert(
            producer_id,
            LoopProducer {
                transport_id,
                kind,
                mime_type,
            },
        );
        let delay = state.produce_delay;
        drop(state);

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(producer_id)
    }

    async fn can_consume(
        &self,
        router_id: RouterId,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError> {
        let state = self.state.lock().await;
        state.ensure_alive()?;
        if !state.routers.contains_key(&router_id) {
            return Err(EngineError::UnknownRouter(router_id));
        }
        let producer = state
            .producers
            .get(&producer_id)
            .ok_or(EngineError::UnknownProducer(producer_id))?;
        Ok(matching_codec(rtp_capabilities, &producer.mime_type).is_some())
    }

    async fn consume(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerParams, EngineError> {
        let mut state = self.state.lock().await;
        state.ensure_alive()?;
        state.open_transport(transport_id)?;

        let (kind, codec) = {
            let producer = state
                .producers
                .get(&producer_id)
                .ok_or(EngineError::UnknownProducer(producer_id))?;
            let codec = matching_codec(rtp_capabilities, &producer.mime_type)
                .cloned()
                .ok_or_else(|| {
                    EngineError::Rejected(format!("cannot consume {}", producer.mime_type))
                })?;
            (producer.kind, codec)
        };

        let consumer_id = ConsumerId::new();
        let ssrc = state.next_ssrc;
        state.next_ssrc = state.next_ssrc.wrapping_add(1);
        state.consumers.insert(
            consumer_id,
            LoopConsumer {
                transport_id,
                producer_id,
                paused,
            },
        );
        let delay = state.consume_delay;
        drop(state);

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(ConsumerParams {
            id: consumer_id,
            producer_id,
            kind,
            rtp_parameters: RtpParameters(json!({
                "mid": ssrc.to_string(),
                "codecs": [codec],
                "encodings": [{ "ssrc": ssrc }],
                "headerExtensions": [],
                "rtcp": { "cname": consumer_id.to_string(), "reducedSize": true },
            })),
        })
    }

    async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        state.ensure_alive()?;
        let consumer = state
            .consumers
            .get_mut(&consumer_id)
            .ok_or(EngineError::UnknownConsumer(consumer_id))?;
        consumer.paused = false;
        Ok(())
    }

    async fn close_transport(&self, transport_id: TransportId) {
        let mut state = self.state.lock().await;
        if let Some(transport) = state.transports.get_mut(&transport_id) {
            transport.closed = true;
        }
        let producers: Vec<ProducerId> = state
            .producers
            .iter()
            .filter(|(_, p)| p.transport_id == transport_id)
            .map(|(id, _)| *id)
            .collect();
        for producer_id in producers {
            state.remove_producer(producer_id);
        }
        state.consumers.retain(|_, c| c.transport_id != transport_id);
    }

    async fn close_producer(&self, producer_id: ProducerId) {
        self.state.lock().await.remove_producer(producer_id);
    }

    async fn close_consumer(&self, consumer_id: ConsumerId) {
        self.state.lock().await.consumers.remove(&consumer_id);
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}
