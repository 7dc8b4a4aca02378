//! Signaling gateway.
//!
//! Validates each client request against the room registries, calls the
//! media engine and applies the result. The gateway is shared by every peer
//! actor; ordering within one peer is provided by the actor, not here.
//!
//! # Locking
//!
//! All registries live in one [`RoomState`] behind a `RwLock`. A request
//! runs in up to three phases:
//!
//! 1. check preconditions under the lock,
//! 2. call the engine with the lock released,
//! 3. re-validate under the write lock and register the result.
//!
//! If phase 3 finds that the peer disconnected or the state moved on while
//! the engine call was in flight, the freshly created engine object is
//! closed instead of registered. The same happens when the engine closed
//! the object before phase 3 ran: closes for ids the registries do not know
//! yet are kept in [`crate::registry::EarlyCloses`] while creations are in
//! flight.
//!
//! # Engine events
//!
//! [`SignalingGateway::spawn_event_pump`] feeds engine events back into the
//! registries: DTLS `connected` completes a pending connect, DTLS
//! `closed`/`failed` and producer closes run the cascades in
//! [`crate::registry`], and a dead worker raises the fatal signal.

use crate::engine::{
    default_media_codecs, ConsumerParams, DtlsParameters, DtlsState, EngineError, EngineEvent,
    MediaCodec, MediaEngine, RtpCapabilities, RtpParameters, WebRtcTransportOptions,
};
use crate::errors::SignalingError;
use crate::observability::metrics;
use crate::registry::{
    CapabilityRegistry, ConsumerEntry, ConsumerState, EarlyCloses, PeerSnapshot, ProducerEntry,
    RoomState, Teardown, TransportEntry, TransportState,
};
use crate::signaling::protocol::{
    Ack, ChatBroadcast, ClientRequest, ConnectionAck, ConsumeResponse, JoinRoomResponse, NewProducer,
    Notification, ProduceResponse, Response, ResumeConsumerResponse, TransportClosed,
};

use chrono::Utc;
use common::types::{ConsumerId, Direction, MediaKind, PeerId, ProducerId, TransportId};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default time a `connect-transport` waits for DTLS to report connected.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Gateway tuning.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Network parameters for every WebRTC transport.
    pub transport_options: WebRtcTransportOptions,
    pub connect_timeout: Duration,
    pub codecs: Vec<MediaCodec>,
}

impl GatewaySettings {
    #[must_use]
    pub fn new(transport_options: WebRtcTransportOptions) -> Self {
        Self {
            transport_options,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            codecs: default_media_codecs(),
        }
    }
}

/// Shared signaling state machine for the room.
pub struct SignalingGateway {
    engine: Arc<dyn MediaEngine>,
    capabilities: CapabilityRegistry,
    state: RwLock<RoomState>,
    transport_options: WebRtcTransportOptions,
    connect_timeout: Duration,
    /// Cancelled once the engine is unusable.
    fatal: CancellationToken,
    fatal_reason: OnceLock<String>,
    /// Transport and producer creations awaiting the engine.
    creations_in_flight: AtomicUsize,
}

/// Counts one engine creation call as in flight until dropped.
struct CreationInFlight<'a>(&'a AtomicUsize);

impl<'a> CreationInFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for CreationInFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SignalingGateway {
    #[must_use]
    pub fn new(engine: Arc<dyn MediaEngine>, settings: GatewaySettings) -> Arc<Self> {
        Arc::new(Self {
            engine,
            capabilities: CapabilityRegistry::new(settings.codecs),
            state: RwLock::new(RoomState::new()),
            transport_options: settings.transport_options,
            connect_timeout: settings.connect_timeout,
            fatal: CancellationToken::new(),
            fatal_reason: OnceLock::new(),
            creations_in_flight: AtomicUsize::new(0),
        })
    }

    // ------------------------------------------------------------------
    // Fatal signal
    // ------------------------------------------------------------------

    /// Token cancelled when the engine becomes unusable.
    #[must_use]
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.clone()
    }

    #[must_use]
    pub fn fatal_reason(&self) -> Option<&str> {
        self.fatal_reason.get().map(String::as_str)
    }

    /// Raise the process-level fatal signal. Only the first reason is kept.
    pub fn trigger_fatal(&self, reason: &str) {
        if self.fatal_reason.set(reason.to_string()).is_ok() {
            metrics::record_engine_fatal();
            error!(
                target: "sfu.gateway",
                engine = self.engine.name(),
                reason = %reason,
                "Media engine failure is fatal, all sessions will be torn down"
            );
        }
        self.fatal.cancel();
    }

    fn ensure_not_fatal(&self) -> Result<(), SignalingError> {
        match self.fatal_reason() {
            Some(reason) => Err(SignalingError::EngineFatal(reason.to_string())),
            None => Ok(()),
        }
    }

    /// Create the room routing context ahead of the first join.
    ///
    /// A failure here is fatal exactly like one during `join-room`.
    pub async fn ensure_room(&self) -> Result<RtpCapabilities, SignalingError> {
        self.ensure_not_fatal()?;
        match self.capabilities.ensure_room(self.engine.as_ref()).await {
            Ok(room) => Ok(room.rtp_capabilities.clone()),
            Err(e) => {
                self.trigger_fatal(&e.to_string());
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Peer lifecycle
    // ------------------------------------------------------------------

    /// Add a peer to the session directory and queue its `connection-ack`.
    ///
    /// The ack is queued under the same lock as the registration, so it is
    /// always the first notification the peer sees. Returns whether a
    /// publisher already exists in the room.
    pub async fn register_peer(
        &self,
        peer_id: PeerId,
        notifier: mpsc::Sender<Notification>,
    ) -> Result<bool, SignalingError> {
        self.ensure_not_fatal()?;
        let mut state = self.state.write().await;
        state.directory.register(peer_id, notifier)?;
        metrics::set_peers_connected(state.directory.len());

        let publisher_exists = state.directory.publisher_exists();
        state.directory.notify(
            peer_id,
            Notification::ConnectionAck(ConnectionAck {
                connection_id: peer_id,
                publisher_exists,
            }),
        );
        Ok(publisher_exists)
    }

    /// Remove a peer and release everything it owns.
    ///
    /// Consumers other peers hold on this peer's producers are closed and
    /// their owners get `producer-closed`. Returns `None` if the peer was
    /// not registered.
    pub async fn disconnect_peer(&self, peer_id: PeerId) -> Option<Teardown> {
        let teardown = {
            let mut state = self.state.write().await;
            let (session, mut teardown) = state.remove_peer(peer_id)?;
            Self::evict_overflowed(&mut state, &mut teardown);
            metrics::set_peers_connected(state.directory.len());
            Self::publish_gauges(&state);
            info!(
                target: "sfu.gateway",
                peer_id = %peer_id,
                was_publisher = session.has_produced(),
                connected_ms = (Utc::now() - session.joined_at).num_milliseconds(),
                transports = teardown.transports.len(),
                producers = teardown.producers.len(),
                consumers = teardown.consumers.len(),
                producer_closed_sent = teardown.producer_closed_sent,
                "Peer removed"
            );
            teardown
        };
        self.release(&teardown).await;
        Some(teardown)
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Execute one client request for `peer_id`.
    #[instrument(skip_all, name = "sfu.gateway.request", fields(peer_id = %peer_id, event = request.event_name()))]
    pub async fn handle_request(
        &self,
        peer_id: PeerId,
        request: ClientRequest,
    ) -> Result<Response, SignalingError> {
        let event = request.event_name();
        let start = Instant::now();

        let result = match self.ensure_not_fatal() {
            Err(e) => Err(e),
            Ok(()) => self.dispatch(peer_id, request).await,
        };

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.error_code(),
        };
        metrics::record_request(event, outcome, start.elapsed());

        if let Err(e) = &result {
            if e.is_fatal() {
                self.trigger_fatal(&e.to_string());
            } else {
                debug!(
                    target: "sfu.gateway",
                    peer_id = %peer_id,
                    event = event,
                    error = %e,
                    "Request rejected"
                );
            }
        }
        result
    }

    async fn dispatch(
        &self,
        peer_id: PeerId,
        request: ClientRequest,
    ) -> Result<Response, SignalingError> {
        match request {
            ClientRequest::JoinRoom => self.join_room(peer_id).await,
            ClientRequest::CreateTransport(req) => self.create_transport(peer_id, req.direction).await,
            ClientRequest::ConnectTransport(req) => {
                self.connect_transport(peer_id, req.direction, req.dtls_parameters)
                    .await
            }
            ClientRequest::Produce(req) => {
                self.produce(peer_id, req.kind, req.rtp_parameters, req.app_data)
                    .await
            }
            ClientRequest::Consume(req) => {
                self.consume(peer_id, req.capabilities, req.producer_peer_id)
                    .await
            }
            ClientRequest::ResumeConsumer(req) => self.resume_consumer(peer_id, req.consumer_id).await,
            ClientRequest::ChatMessage(req) => self.chat_message(peer_id, req.text, req.username).await,
        }
    }

    /// `join-room`: ensure the room exists and return its capabilities.
    pub async fn join_room(&self, peer_id: PeerId) -> Result<Response, SignalingError> {
        self.state.read().await.directory.require(peer_id)?;

        let room = self.capabilities.ensure_room(self.engine.as_ref()).await?;

        self.state
            .write()
            .await
            .directory
            .mark_capabilities_loaded(peer_id)?;

        debug!(target: "sfu.gateway", peer_id = %peer_id, "Capabilities delivered");
        Ok(Response::Joined(JoinRoomResponse {
            capabilities: room.rtp_capabilities.clone(),
        }))
    }

    /// `create-transport`: one transport per peer and direction.
    pub async fn create_transport(
        &self,
        peer_id: PeerId,
        direction: Direction,
    ) -> Result<Response, SignalingError> {
        let router_id = {
            let state = self.state.read().await;
            let session = state.directory.require(peer_id)?;
            if !session.capabilities_loaded {
                return Err(SignalingError::ProtocolOrder(
                    "join-room must complete before create-transport".to_string(),
                ));
            }
            if state.transports.get_for_peer(peer_id, direction).is_some() {
                return Err(SignalingError::Conflict(format!(
                    "{direction} transport already exists"
                )));
            }
            self.capabilities.router_id().ok_or_else(|| {
                SignalingError::ProtocolOrder("room is not initialized".to_string())
            })?
        };

        let in_flight = CreationInFlight::enter(&self.creations_in_flight);
        let params = self
            .engine
            .create_webrtc_transport(router_id, &self.transport_options)
            .await?;
        let transport_id = params.transport_id;

        let registered = {
            let mut state = self.state.write().await;
            let closed_early = state.early_closes.take_transport(transport_id);
            self.settle_early_closes(&mut state);
            if closed_early {
                Err(SignalingError::Engine(
                    "transport closed by the engine during creation".to_string(),
                ))
            } else if state.directory.is_active(peer_id) {
                state
                    .transports
                    .insert(TransportEntry::new(transport_id, peer_id, direction))
                    .and_then(|()| {
                        state
                            .directory
                            .record_transport(peer_id, direction, transport_id)
                    })
            } else {
                Err(SignalingError::NotFound(format!(
                    "peer {peer_id} disconnected"
                )))
            }
        };
        drop(in_flight);

        if let Err(e) = registered {
            info!(
                target: "sfu.gateway",
                peer_id = %peer_id,
                transport_id = %transport_id,
                reason = %e,
                "Releasing transport created for a request that can no longer use it"
            );
            self.engine.close_transport(transport_id).await;
            return Err(e);
        }

        metrics::record_transport_created(direction.as_str());
        info!(
            target: "sfu.gateway",
            peer_id = %peer_id,
            transport_id = %transport_id,
            direction = %direction,
            "Transport created"
        );
        Ok(Response::TransportCreated(params))
    }

    /// `connect-transport`: apply DTLS parameters and wait for `connected`.
    pub async fn connect_transport(
        &self,
        peer_id: PeerId,
        direction: Direction,
        dtls_parameters: DtlsParameters,
    ) -> Result<Response, SignalingError> {
        let (transport_id, mut watcher) = {
            let mut state = self.state.write().await;
            state.directory.require(peer_id)?;
            let entry = state
                .transports
                .get_for_peer(peer_id, direction)
                .ok_or_else(|| {
                    SignalingError::ProtocolOrder(format!(
                        "no {direction} transport; create it first"
                    ))
                })?;
            if entry.state() != TransportState::New {
                return Err(SignalingError::ProtocolOrder(format!(
                    "{direction} transport is {}, connect already requested",
                    entry.state().as_str()
                )));
            }
            let transport_id = entry.id;
            let watcher = entry.subscribe();
            state
                .transports
                .transition(transport_id, TransportState::Connecting)?;
            (transport_id, watcher)
        };

        if let Err(e) = self
            .engine
            .connect_transport(transport_id, &dtls_parameters)
            .await
        {
            let mut state = self.state.write().await;
            if state
                .transports
                .get(transport_id)
                .is_some_and(|t| t.state() == TransportState::Connecting)
            {
                // Roll back so the client may retry with corrected parameters.
                if let Err(rollback) =
                    state.transports.transition(transport_id, TransportState::New)
                {
                    warn!(
                        target: "sfu.gateway",
                        transport_id = %transport_id,
                        error = %rollback,
                        "Failed to roll back rejected connect"
                    );
                }
            }
            return Err(e.into());
        }

        let settled = tokio::time::timeout(
            self.connect_timeout,
            watcher.wait_for(|s| matches!(s, TransportState::Connected | TransportState::Closed)),
        )
        .await;

        match settled {
            Ok(Ok(state)) if *state == TransportState::Connected => {
                info!(
                    target: "sfu.gateway",
                    peer_id = %peer_id,
                    transport_id = %transport_id,
                    direction = %direction,
                    "Transport connected"
                );
                Ok(Response::Ack(Ack {}))
            }
            Ok(_) => Err(SignalingError::ProtocolOrder(format!(
                "{direction} transport closed before DTLS connected"
            ))),
            Err(_) => {
                warn!(
                    target: "sfu.gateway",
                    peer_id = %peer_id,
                    transport_id = %transport_id,
                    timeout_ms = self.connect_timeout.as_millis(),
                    "DTLS did not connect in time"
                );
                Err(SignalingError::ProtocolOrder(format!(
                    "{direction} transport did not connect within {} ms",
                    self.connect_timeout.as_millis()
                )))
            }
        }
    }

    /// `produce`: at most one producer per kind per peer; a duplicate is rejected.
    pub async fn produce(
        &self,
        peer_id: PeerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: Value,
    ) -> Result<Response, SignalingError> {
        let transport_id = {
            let state = self.state.read().await;
            state.directory.require(peer_id)?;
            let transport_id = state.transports.require_connected(peer_id, Direction::Send)?;
            if state.producers.has_kind(peer_id, kind) {
                return Err(SignalingError::Conflict(format!(
                    "{kind} producer already exists"
                )));
            }
            transport_id
        };

        let in_flight = CreationInFlight::enter(&self.creations_in_flight);
        let producer_id = self
            .engine
            .produce(transport_id, kind, &rtp_parameters)
            .await?;

        let registered = {
            let mut state = self.state.write().await;
            let closed_early = state.early_closes.take_producer(producer_id);
            self.settle_early_closes(&mut state);
            let result = if closed_early {
                Err(SignalingError::Engine(format!(
                    "{kind} producer closed by the engine during creation"
                )))
            } else {
                Self::ensure_usable(&state, peer_id, transport_id)
            };
            let result = result.and_then(|()| {
                state.producers.insert(ProducerEntry::new(
                    producer_id,
                    peer_id,
                    kind,
                    transport_id,
                    app_data,
                ))?;
                state.directory.record_producer(peer_id, kind, producer_id)
            });
            if result.is_ok() {
                let announced = state.directory.broadcast(
                    &Notification::NewProducer(NewProducer {
                        peer_id,
                        producer_id,
                        kind,
                    }),
                    Some(peer_id),
                );
                Self::publish_gauges(&state);
                debug!(
                    target: "sfu.gateway",
                    producer_id = %producer_id,
                    announced = announced,
                    "Producer announced"
                );
            }
            result
        };
        drop(in_flight);

        if let Err(e) = registered {
            self.engine.close_producer(producer_id).await;
            return Err(e);
        }

        info!(
            target: "sfu.gateway",
            peer_id = %peer_id,
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );
        Ok(Response::Produced(ProduceResponse { producer_id }))
    }

    /// `consume`: one logical request yields a consumer per publisher track.
    pub async fn consume(
        &self,
        peer_id: PeerId,
        capabilities: RtpCapabilities,
        producer_peer_id: Option<PeerId>,
    ) -> Result<Response, SignalingError> {
        let (transport_id, router_id, publisher, targets) = {
            let state = self.state.read().await;
            state.directory.require(peer_id)?;
            let transport_id = state.transports.require_connected(peer_id, Direction::Recv)?;
            let router_id = self.capabilities.router_id().ok_or_else(|| {
                SignalingError::ProtocolOrder("room is not initialized".to_string())
            })?;

            let publisher = match producer_peer_id {
                Some(publisher) if publisher == peer_id => {
                    return Err(SignalingError::CannotConsume(
                        "cannot consume own producers".to_string(),
                    ));
                }
                Some(publisher) => publisher,
                None => state.directory.first_publisher(peer_id).ok_or_else(|| {
                    SignalingError::CannotConsume("nothing to consume".to_string())
                })?,
            };

            let targets: Vec<(ProducerId, MediaKind)> = state
                .producers
                .for_peer(publisher)
                .iter()
                .map(|p| (p.id, p.kind))
                .collect();
            if targets.is_empty() {
                return Err(SignalingError::CannotConsume("nothing to consume".to_string()));
            }
            if targets
                .iter()
                .any(|(producer_id, _)| state.consumers.is_consuming(peer_id, *producer_id))
            {
                return Err(SignalingError::Conflict(format!(
                    "already consuming peer {publisher}"
                )));
            }
            (transport_id, router_id, publisher, targets)
        };

        for (producer_id, kind) in &targets {
            let compatible = self
                .engine
                .can_consume(router_id, *producer_id, &capabilities)
                .await
                .map_err(Self::producer_gone_is_cannot_consume)?;
            if !compatible {
                return Err(SignalingError::CannotConsume(format!(
                    "capabilities cannot receive {kind}"
                )));
            }
        }

        let mut created: Vec<ConsumerParams> = Vec::with_capacity(targets.len());
        for (producer_id, _) in &targets {
            match self
                .engine
                .consume(transport_id, *producer_id, &capabilities, true)
                .await
            {
                Ok(params) => created.push(params),
                Err(e) => {
                    self.close_consumers(created.iter().map(|p| p.id)).await;
                    return Err(Self::producer_gone_is_cannot_consume(e));
                }
            }
        }

        let registered = {
            let mut state = self.state.write().await;
            let result = Self::ensure_usable(&state, peer_id, transport_id).and_then(|()| {
                if created.iter().any(|p| !state.producers.contains(p.producer_id)) {
                    return Err(SignalingError::CannotConsume("producer closed".to_string()));
                }
                if created
                    .iter()
                    .any(|p| state.consumers.is_consuming(peer_id, p.producer_id))
                {
                    return Err(SignalingError::Conflict(format!(
                        "already consuming peer {publisher}"
                    )));
                }
                for params in &created {
                    state.consumers.insert(ConsumerEntry::new(
                        params.id,
                        peer_id,
                        params.producer_id,
                        params.kind,
                        transport_id,
                    ))?;
                    state.directory.record_consumer(peer_id, params.id)?;
                }
                Ok(())
            });
            if result.is_ok() {
                Self::publish_gauges(&state);
            }
            result
        };

        if let Err(e) = registered {
            self.close_consumers(created.iter().map(|p| p.id)).await;
            return Err(e);
        }

        info!(
            target: "sfu.gateway",
            peer_id = %peer_id,
            publisher = %publisher,
            consumers = created.len(),
            "Consumers created paused"
        );

        let mut response = ConsumeResponse {
            producer_peer_id: publisher,
            video_params: None,
            audio_params: None,
        };
        for params in created {
            match params.kind {
                MediaKind::Video => response.video_params = Some(params),
                MediaKind::Audio => response.audio_params = Some(params),
            }
        }
        Ok(Response::Consumed(response))
    }

    /// `resume-consumer`: resume one consumer, or all paused consumers of the
    /// peer as a unit when no id is given. Resuming an active consumer is a
    /// no-op.
    pub async fn resume_consumer(
        &self,
        peer_id: PeerId,
        consumer_id: Option<ConsumerId>,
    ) -> Result<Response, SignalingError> {
        let (to_resume, already_active) = {
            let state = self.state.read().await;
            state.directory.require(peer_id)?;
            match consumer_id {
                Some(id) => {
                    let entry = state
                        .consumers
                        .get(id)
                        .filter(|c| c.peer_id == peer_id)
                        .ok_or_else(|| SignalingError::NotFound(format!("consumer {id}")))?;
                    if entry.state() == ConsumerState::Paused {
                        (vec![id], Vec::new())
                    } else {
                        (Vec::new(), vec![id])
                    }
                }
                None => {
                    if state.consumers.for_peer(peer_id).is_empty() {
                        return Err(SignalingError::ProtocolOrder(
                            "no consumers to resume; consume first".to_string(),
                        ));
                    }
                    (state.consumers.paused_for_peer(peer_id), Vec::new())
                }
            }
        };

        let mut engine_resumed = Vec::with_capacity(to_resume.len());
        for id in to_resume {
            match self.engine.resume_consumer(id).await {
                Ok(()) => engine_resumed.push(id),
                // Closed underneath us by a producer cascade.
                Err(EngineError::UnknownConsumer(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut resumed = already_active;
        {
            let mut state = self.state.write().await;
            for id in engine_resumed {
                if state.consumers.resume(id).is_ok() {
                    resumed.push(id);
                }
            }
        }

        debug!(
            target: "sfu.gateway",
            peer_id = %peer_id,
            resumed = resumed.len(),
            "Consumers resumed"
        );
        Ok(Response::Resumed(ResumeConsumerResponse { resumed }))
    }

    /// `chat-message`: relay to every connected peer, sender included.
    pub async fn chat_message(
        &self,
        peer_id: PeerId,
        text: String,
        username: String,
    ) -> Result<Response, SignalingError> {
        let mut state = self.state.write().await;
        state.directory.require(peer_id)?;
        let delivered = state.directory.broadcast(
            &Notification::ChatMessage(ChatBroadcast::new(username, text)),
            None,
        );
        debug!(target: "sfu.gateway", peer_id = %peer_id, delivered = delivered, "Chat relayed");
        Ok(Response::Ack(Ack {}))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn snapshot_peer(&self, peer_id: PeerId) -> Option<PeerSnapshot> {
        self.state.read().await.directory.snapshot(peer_id)
    }

    pub async fn peer_count(&self) -> usize {
        self.state.read().await.directory.len()
    }

    pub async fn transport_state(&self, transport_id: TransportId) -> Option<TransportState> {
        self.state
            .read()
            .await
            .transports
            .get(transport_id)
            .map(TransportEntry::state)
    }

    pub async fn producer_count(&self) -> usize {
        self.state.read().await.producers.len()
    }

    pub async fn consumer_count(&self) -> usize {
        self.state.read().await.consumers.len()
    }

    pub async fn consumer_state(
        &self,
        consumer_id: ConsumerId,
    ) -> Option<ConsumerState> {
        self.state
            .read()
            .await
            .consumers
            .get(consumer_id)
            .map(ConsumerEntry::state)
    }

    // ------------------------------------------------------------------
    // Engine events
    // ------------------------------------------------------------------

    /// Subscribe to engine events and process them until `cancel` fires.
    ///
    /// The subscription is taken before this returns, so no event emitted
    /// afterwards is missed.
    pub fn spawn_event_pump(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let events = self.engine.subscribe();
        let gateway = Arc::clone(self);
        tokio::spawn(async move { gateway.run_event_pump(events, cancel).await })
    }

    #[instrument(skip_all, name = "sfu.gateway.events")]
    async fn run_event_pump(
        self: Arc<Self>,
        mut events: broadcast::Receiver<EngineEvent>,
        cancel: CancellationToken,
    ) {
        debug!(target: "sfu.gateway", engine = self.engine.name(), "Engine event pump started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => self.handle_engine_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target: "sfu.gateway", skipped = skipped, "Engine event pump lagged");
                    }
                    Err(RecvError::Closed) => {
                        self.trigger_fatal("engine event stream closed");
                        break;
                    }
                },
            }
        }
        debug!(target: "sfu.gateway", "Engine event pump stopped");
    }

    /// Apply one engine event to the registries.
    pub async fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::DtlsStateChanged {
                transport_id,
                state: DtlsState::Connected,
            } => {
                let mut state = self.state.write().await;
                let pending = state
                    .transports
                    .get(transport_id)
                    .is_some_and(|t| t.state() == TransportState::Connecting);
                if pending {
                    match state
                        .transports
                        .transition(transport_id, TransportState::Connected)
                    {
                        Ok(_) => {
                            debug!(target: "sfu.gateway", transport_id = %transport_id, "DTLS connected");
                        }
                        Err(e) => {
                            warn!(
                                target: "sfu.gateway",
                                transport_id = %transport_id,
                                error = %e,
                                "Failed to apply DTLS connected"
                            );
                        }
                    }
                }
            }
            EngineEvent::DtlsStateChanged {
                transport_id,
                state: dtls @ (DtlsState::Closed | DtlsState::Failed),
            } => {
                let teardown = {
                    let mut state = self.state.write().await;
                    let Some((entry, mut teardown)) = state.close_transport(transport_id) else {
                        self.remember_early_close(&mut state, |early| {
                            early.record_transport(transport_id);
                        });
                        return;
                    };
                    state.directory.notify(
                        entry.peer_id,
                        Notification::TransportClosed(TransportClosed {
                            transport_id,
                            direction: entry.direction,
                        }),
                    );
                    Self::evict_overflowed(&mut state, &mut teardown);
                    Self::publish_gauges(&state);
                    info!(
                        target: "sfu.gateway",
                        peer_id = %entry.peer_id,
                        transport_id = %transport_id,
                        dtls_state = ?dtls,
                        producers = teardown.producers.len(),
                        consumers = teardown.consumers.len(),
                        "Transport closed by engine"
                    );
                    teardown
                };
                self.release(&teardown).await;
            }
            EngineEvent::DtlsStateChanged { .. } => {}
            EngineEvent::ProducerClosed {
                producer_id,
                reason,
            } => {
                let teardown = {
                    let mut state = self.state.write().await;
                    let Some(mut teardown) = state.close_producer(producer_id) else {
                        self.remember_early_close(&mut state, |early| {
                            early.record_producer(producer_id);
                        });
                        return;
                    };
                    Self::evict_overflowed(&mut state, &mut teardown);
                    Self::publish_gauges(&state);
                    info!(
                        target: "sfu.gateway",
                        producer_id = %producer_id,
                        reason = reason.as_str(),
                        producer_closed_sent = teardown.producer_closed_sent,
                        "Producer closed by engine"
                    );
                    teardown
                };
                self.release(&teardown).await;
            }
            EngineEvent::WorkerDied { reason } => self.trigger_fatal(&reason),
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// The peer is still connected and `transport_id` is still connected.
    fn ensure_usable(
        state: &RoomState,
        peer_id: PeerId,
        transport_id: TransportId,
    ) -> Result<(), SignalingError> {
        if !state.directory.is_active(peer_id) {
            return Err(SignalingError::NotFound(format!(
                "peer {peer_id} disconnected"
            )));
        }
        match state.transports.get(transport_id).map(TransportEntry::state) {
            Some(TransportState::Connected) => Ok(()),
            _ => Err(SignalingError::ProtocolOrder(
                "transport closed during the request".to_string(),
            )),
        }
    }

    fn producer_gone_is_cannot_consume(err: EngineError) -> SignalingError {
        match err {
            EngineError::UnknownProducer(_) => {
                SignalingError::CannotConsume("producer closed".to_string())
            }
            other => other.into(),
        }
    }

    /// Record a close for an id no registry holds, if a creation could still
    /// register it. With nothing in flight the record would never be read.
    fn remember_early_close(
        &self,
        state: &mut RoomState,
        record: impl FnOnce(&mut EarlyCloses),
    ) {
        if self.creations_in_flight.load(Ordering::SeqCst) > 0 {
            record(&mut state.early_closes);
        } else {
            state.early_closes.clear();
        }
    }

    /// Drop leftover early-close records once the caller is the only
    /// creation still in flight.
    fn settle_early_closes(&self, state: &mut RoomState) {
        if self.creations_in_flight.load(Ordering::SeqCst) <= 1 {
            state.early_closes.clear();
        }
    }

    /// Disconnect peers whose notification queue overflowed during a cascade.
    fn evict_overflowed(state: &mut RoomState, teardown: &mut Teardown) {
        let (evicted, cascade) = state.evict_overflowed();
        if evicted.is_empty() {
            return;
        }
        for peer_id in &evicted {
            warn!(
                target: "sfu.gateway",
                peer_id = %peer_id,
                "Peer evicted, notification queue overflowed"
            );
        }
        metrics::set_peers_connected(state.directory.len());
        teardown.merge(cascade);
    }

    fn publish_gauges(state: &RoomState) {
        metrics::set_producers_active(state.producers.len());
        metrics::set_consumers_active(state.consumers.len());
    }

    async fn close_consumers(&self, ids: impl Iterator<Item = ConsumerId>) {
        for id in ids {
            self.engine.close_consumer(id).await;
        }
    }

    /// Release engine objects dropped from the registries. Close calls are
    /// idempotent, so objects the engine already cascaded are harmless.
    async fn release(&self, teardown: &Teardown) {
        self.close_consumers(teardown.consumers.iter().copied()).await;
        for producer_id in &teardown.producers {
            self.engine.close_producer(*producer_id).await;
        }
        for transport_id in &teardown.transports {
            self.engine.close_transport(*transport_id).await;
        }
    }
}
