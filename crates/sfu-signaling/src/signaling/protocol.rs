//! Signaling wire protocol.
//!
//! Client frames carry a numeric `id` that is echoed on exactly one
//! `response` or `error` frame. Unsolicited server messages are
//! `notification` frames and carry no id.
//!
//! ```text
//! client -> {"id": 3, "event": "create-transport", "payload": {"direction": "send"}}
//! server <- {"type": "response", "id": 3, "data": {"transportId": "...", ...}}
//! server <- {"type": "error", "id": 4, "error": "protocol-order", "message": "..."}
//! server <- {"type": "notification", "event": "producer-closed", "payload": {...}}
//! ```

use crate::engine::{ConsumerParams, DtlsParameters, RtpCapabilities, RtpParameters, TransportParams};
use crate::errors::SignalingError;

use common::types::{ConsumerId, Direction, MediaKind, PeerId, ProducerId, TransportId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request id used for error frames when the client frame had no usable id.
pub const UNCORRELATED_REQUEST_ID: u64 = 0;

// ============================================================================
// Client -> server
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportRequest {
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub direction: Direction,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default)]
    pub app_data: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    #[serde(alias = "rtpCapabilities")]
    pub capabilities: RtpCapabilities,
    /// Publisher to consume from; the earliest-joined publisher when absent.
    #[serde(default)]
    pub producer_peer_id: Option<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeConsumerRequest {
    /// Single consumer to resume; every paused consumer of the peer when absent.
    #[serde(default)]
    pub consumer_id: Option<ConsumerId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageRequest {
    pub text: String,
    pub username: String,
}

/// A typed client request.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    JoinRoom,
    CreateTransport(CreateTransportRequest),
    ConnectTransport(ConnectTransportRequest),
    Produce(ProduceRequest),
    Consume(ConsumeRequest),
    ResumeConsumer(ResumeConsumerRequest),
    ChatMessage(ChatMessageRequest),
}

impl ClientRequest {
    /// Build a request from its event name and raw payload.
    pub fn parse(event: &str, payload: Value) -> Result<Self, SignalingError> {
        match event {
            "join-room" => Ok(ClientRequest::JoinRoom),
            "create-transport" => Ok(ClientRequest::CreateTransport(decode(event, payload)?)),
            "connect-transport" => Ok(ClientRequest::ConnectTransport(decode(event, payload)?)),
            "produce" => Ok(ClientRequest::Produce(decode(event, payload)?)),
            "consume" => Ok(ClientRequest::Consume(decode(event, payload)?)),
            "resume-consumer" => Ok(ClientRequest::ResumeConsumer(decode(event, payload)?)),
            "chat-message" => Ok(ClientRequest::ChatMessage(decode(event, payload)?)),
            other => Err(SignalingError::BadRequest(format!("unknown event '{other}'"))),
        }
    }

    /// Wire event name; also the bounded `event` metric label.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            ClientRequest::JoinRoom => "join-room",
            ClientRequest::CreateTransport(_) => "create-transport",
            ClientRequest::ConnectTransport(_) => "connect-transport",
            ClientRequest::Produce(_) => "produce",
            ClientRequest::Consume(_) => "consume",
            ClientRequest::ResumeConsumer(_) => "resume-consumer",
            ClientRequest::ChatMessage(_) => "chat-message",
        }
    }
}

fn decode<T: DeserializeOwned>(event: &str, payload: Value) -> Result<T, SignalingError> {
    let payload = if payload.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        payload
    };
    serde_json::from_value(payload)
        .map_err(|e| SignalingError::BadRequest(format!("invalid {event} payload: {e}")))
}

#[derive(Debug, Deserialize)]
struct ClientFrame {
    id: u64,
    event: String,
    #[serde(default)]
    payload: Value,
}

/// Parse one text frame into `(id, request)`.
///
/// On failure the error carries the frame's id when one could be read, so
/// the client can still correlate it.
pub fn parse_client_frame(text: &str) -> Result<(u64, ClientRequest), (u64, SignalingError)> {
    let value: Value = serde_json::from_str(text).map_err(|e| {
        (
            UNCORRELATED_REQUEST_ID,
            SignalingError::BadRequest(format!("malformed JSON: {e}")),
        )
    })?;
    let id = value
        .get("id")
        .and_then(Value::as_u64)
        .unwrap_or(UNCORRELATED_REQUEST_ID);

    let frame: ClientFrame = serde_json::from_value(value)
        .map_err(|e| (id, SignalingError::BadRequest(format!("invalid frame: {e}"))))?;
    let request = ClientRequest::parse(&frame.event, frame.payload).map_err(|e| (id, e))?;
    Ok((frame.id, request))
}

// ============================================================================
// Server -> client responses
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomResponse {
    #[serde(alias = "rtpCapabilities")]
    pub capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceResponse {
    pub producer_id: ProducerId,
}

/// Both track descriptors of one logical consume; a kind the publisher
/// does not send is `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResponse {
    pub producer_peer_id: PeerId,
    pub video_params: Option<ConsumerParams>,
    pub audio_params: Option<ConsumerParams>,
}

impl ConsumeResponse {
    /// Descriptors present in this response, video first.
    #[must_use]
    pub fn descriptors(&self) -> Vec<&ConsumerParams> {
        self.video_params
            .iter()
            .chain(self.audio_params.iter())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeConsumerResponse {
    pub resumed: Vec<ConsumerId>,
}

/// Empty acknowledgement, serialized as `{}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ack {}

/// Successful result of a client request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Joined(JoinRoomResponse),
    TransportCreated(TransportParams),
    Produced(ProduceResponse),
    Consumed(ConsumeResponse),
    Resumed(ResumeConsumerResponse),
    Ack(Ack),
}

// ============================================================================
// Server -> client notifications
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAck {
    pub connection_id: PeerId,
    pub publisher_exists: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProducer {
    pub peer_id: PeerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClosed {
    pub producer_id: ProducerId,
    pub consumer_id: ConsumerId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportClosed {
    pub transport_id: TransportId,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBroadcast {
    pub text: String,
    pub username: String,
    /// Pre-formatted `"{username}: {text}"` line.
    pub line: String,
}

impl ChatBroadcast {
    #[must_use]
    pub fn new(username: String, text: String) -> Self {
        let line = format!("{username}: {text}");
        Self {
            text,
            username,
            line,
        }
    }
}

/// Unsolicited server-to-client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum Notification {
    ConnectionAck(ConnectionAck),
    NewProducer(NewProducer),
    ProducerClosed(ProducerClosed),
    TransportClosed(TransportClosed),
    ChatMessage(ChatBroadcast),
}

impl Notification {
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Notification::ConnectionAck(_) => "connection-ack",
            Notification::NewProducer(_) => "new-producer",
            Notification::ProducerClosed(_) => "producer-closed",
            Notification::TransportClosed(_) => "transport-closed",
            Notification::ChatMessage(_) => "chat-message",
        }
    }

    /// Announcements a slow client may miss without its view of its own
    /// resources going stale. Everything else must be delivered.
    #[must_use]
    pub const fn is_best_effort(&self) -> bool {
        matches!(
            self,
            Notification::NewProducer(_) | Notification::ChatMessage(_)
        )
    }
}

// ============================================================================
// Frames
// ============================================================================

/// Any frame the server writes to the socket.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    Response { id: u64, data: Response },
    Error {
        id: u64,
        error: &'static str,
        message: String,
    },
    Notification(Notification),
}

impl ServerFrame {
    /// Frame for the outcome of request `id`.
    #[must_use]
    pub fn for_result(id: u64, result: Result<Response, SignalingError>) -> Self {
        match result {
            Ok(data) => ServerFrame::Response { id, data },
            Err(err) => ServerFrame::error(id, &err),
        }
    }

    #[must_use]
    pub fn error(id: u64, err: &SignalingError) -> Self {
        ServerFrame::Error {
            id,
            error: err.error_code(),
            message: err.client_message(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_join_room_without_payload() {
        let (id, request) = parse_client_frame(r#"{"id": 1, "event": "join-room"}"#).unwrap();
        assert_eq!(id, 1);
        assert_eq!(request, ClientRequest::JoinRoom);
    }

    #[test]
    fn test_parse_create_transport() {
        let (id, request) = parse_client_frame(
            r#"{"id": 7, "event": "create-transport", "payload": {"direction": "recv"}}"#,
        )
        .unwrap();
        assert_eq!(id, 7);
        assert_eq!(
            request,
            ClientRequest::CreateTransport(CreateTransportRequest {
                direction: Direction::Recv
            })
        );
    }

    #[test]
    fn test_parse_consume_accepts_rtp_capabilities_alias() {
        let (_, request) = parse_client_frame(
            r#"{"id": 2, "event": "consume", "payload": {"rtpCapabilities": {"codecs": []}}}"#,
        )
        .unwrap();
        match request {
            ClientRequest::Consume(consume) => {
                assert_eq!(consume.capabilities.0, json!({ "codecs": [] }));
                assert!(consume.producer_peer_id.is_none());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_parse_resume_with_null_payload() {
        let (_, request) = parse_client_frame(
            r#"{"id": 9, "event": "resume-consumer", "payload": null}"#,
        )
        .unwrap();
        assert_eq!(
            request,
            ClientRequest::ResumeConsumer(ResumeConsumerRequest { consumer_id: None })
        );
    }

    #[test]
    fn test_parse_errors_keep_the_request_id() {
        let (id, err) = parse_client_frame(
            r#"{"id": 5, "event": "produce", "payload": {"kind": "screen"}}"#,
        )
        .unwrap_err();
        assert_eq!(id, 5);
        assert_eq!(err.error_code(), "bad-request");

        let (id, err) = parse_client_frame(r#"{"id": 6, "event": "teleport"}"#).unwrap_err();
        assert_eq!(id, 6);
        assert!(err.client_message().contains("teleport"));

        let (id, _) = parse_client_frame("not json").unwrap_err();
        assert_eq!(id, UNCORRELATED_REQUEST_ID);
    }

    #[test]
    fn test_response_frame_wire_format() {
        let producer_id = ProducerId::new();
        let frame = ServerFrame::for_result(
            3,
            Ok(Response::Produced(ProduceResponse { producer_id })),
        );
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({ "type": "response", "id": 3, "data": { "producerId": producer_id.to_string() } })
        );

        let ack = ServerFrame::for_result(4, Ok(Response::Ack(Ack {})));
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({ "type": "response", "id": 4, "data": {} })
        );
    }

    #[test]
    fn test_error_frame_wire_format() {
        let frame = ServerFrame::for_result(
            8,
            Err(SignalingError::CannotConsume("nothing to consume".to_string())),
        );
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "type": "error",
                "id": 8,
                "error": "cannot-consume",
                "message": "nothing to consume"
            })
        );
    }

    #[test]
    fn test_notification_frame_wire_format() {
        let connection_id = PeerId::new();
        let frame = ServerFrame::Notification(Notification::ConnectionAck(ConnectionAck {
            connection_id,
            publisher_exists: true,
        }));
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "type": "notification",
                "event": "connection-ack",
                "payload": { "connectionId": connection_id.to_string(), "publisherExists": true }
            })
        );
    }

    #[test]
    fn test_chat_broadcast_line() {
        let chat = ChatBroadcast::new("ana".to_string(), "hello".to_string());
        assert_eq!(chat.line, "ana: hello");
        assert_eq!(Notification::ChatMessage(chat).event_name(), "chat-message");
    }

    #[test]
    fn test_consume_response_descriptors_video_first() {
        let video = ConsumerParams {
            id: ConsumerId::new(),
            producer_id: ProducerId::new(),
            kind: MediaKind::Video,
            rtp_parameters: RtpParameters::default(),
        };
        let audio = ConsumerParams {
            kind: MediaKind::Audio,
            id: ConsumerId::new(),
            ..video.clone()
        };
        let response = ConsumeResponse {
            producer_peer_id: PeerId::new(),
            video_params: Some(video),
            audio_params: Some(audio),
        };
        let kinds: Vec<MediaKind> = response.descriptors().iter().map(|p| p.kind).collect();
        assert_eq!(kinds, vec![MediaKind::Video, MediaKind::Audio]);

        let value = serde_json::to_value(&response).unwrap();
        assert!(value.get("videoParams").is_some());
        assert!(value.get("audioParams").is_some());
    }
}
