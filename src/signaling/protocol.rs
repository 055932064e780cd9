#![forbid(unsafe_code)]

// Wire protocol for the signaling channel.
//
// Client requests are `{"id": <n>, "type": "<name>", "data": {...}}`; the
// server acknowledges each id-bearing request exactly once with
// `{"id": <n>, "data": {...}}` or `{"id": <n>, "error": "..."}`.
// Server-initiated events carry `{"type": "<name>", "data": {...}}` and no
// id.

use crate::engine::{
    AppData, ConsumerId, DtlsParameters, IceCandidate, IceParameters, MediaKind, ProducerId,
    RtpCapabilities, RtpParameters, SctpParameters, TransportDirection, TransportId,
};
use crate::media::ProducerEntry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Inbound frame: optional ack id plus the tagged message.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// Client-to-server messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Join a room; the token is the verified principal identity.
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        token: String,
        room_id: String,
        #[serde(default)]
        user_name: Option<String>,
    },
    /// Create a send or recv WebRTC transport on the room's router.
    #[serde(rename_all = "camelCase")]
    CreateTransport {
        room_id: String,
        #[serde(rename = "type")]
        direction: TransportDirection,
    },
    /// Complete the DTLS handshake on a transport.
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    /// Publish a media track on a send transport.
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default)]
        app_data: AppData,
    },
    /// Subscribe to another participant's producer. The consumer starts
    /// paused; the client resumes it once its renderer is bound.
    #[serde(rename_all = "camelCase")]
    Consume {
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    PauseConsumer { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    PauseProducer { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    ResumeProducer { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    CloseProducer { producer_id: ProducerId },
    ToggleHandRaise,
    ChatMessage { message: String },
    GetExistingProducers,
    #[serde(rename_all = "camelCase")]
    GetRoomStats { room_id: String },
    #[serde(rename_all = "camelCase")]
    SetConsumerPreferredLayers {
        consumer_id: ConsumerId,
        spatial_layer: u8,
        #[serde(default)]
        temporal_layer: Option<u8>,
    },
    #[serde(rename_all = "camelCase")]
    EndMeeting { room_id: String },
    LeaveRoom,
}

/// Server-to-client events (no acknowledgment).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    ParticipantJoined(ParticipantView),
    #[serde(rename_all = "camelCase")]
    ParticipantLeft { peer_id: String, user_id: String },
    NewProducer(ProducerEntry),
    #[serde(rename_all = "camelCase")]
    ProducerClosed { producer_id: ProducerId, peer_id: String },
    #[serde(rename_all = "camelCase")]
    ProducerPaused { producer_id: ProducerId, peer_id: String },
    #[serde(rename_all = "camelCase")]
    ProducerResumed { producer_id: ProducerId, peer_id: String },
    #[serde(rename_all = "camelCase")]
    ConsumerClosed { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    ConsumerPaused { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    ConsumerResumed { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    HandRaiseChanged {
        peer_id: String,
        is_hand_raised: bool,
    },
    NewChatMessage(ChatBroadcast),
    MeetingEnded { reason: String },
    /// Out-of-band failure (malformed frame, rate limit). Request failures
    /// travel in the ack instead.
    Error { message: String },
}

impl ServerMessage {
    /// Pre-serializes the event for fan-out; one allocation shared across
    /// all recipients.
    pub fn to_frame(&self) -> Option<Arc<String>> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Arc::new(json)),
            Err(e) => {
                warn!("Failed to serialize server event: {e}");
                None
            }
        }
    }
}

/// How a peer appears to other peers. Never exposes transports, producers,
/// consumers, or the channel handle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub socket_id: String,
    pub peer_id: String,
    pub user_id: String,
    pub user_name: String,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub hand_raised: bool,
    pub joined_at: u64,
    pub is_owner: bool,
}

/// Chat message as fanned out to the room (including the sender).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBroadcast {
    pub id: u64,
    pub peer_id: String,
    pub user_name: String,
    pub message: String,
    pub timestamp: u64,
}

/// Ack payload for `joinRoom`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinReply {
    pub router_rtp_capabilities: RtpCapabilities,
    pub participants: Vec<ParticipantView>,
    pub existing_producers: Vec<ProducerEntry>,
    pub peer_id: String,
    pub is_owner: bool,
}

/// Ack payload for `createTransport`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportReply {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
    pub sctp_parameters: Option<SctpParameters>,
}

/// Ack payload for `consume`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeReply {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub producer_paused: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub peer_count: usize,
    pub producer_count: usize,
    pub created_at: u64,
    pub uptime: u64,
}

/// Ack payload for `getRoomStats`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStatsReply {
    pub stats: RoomStats,
    pub participants: Vec<ParticipantView>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_room_envelope_parses() {
        let raw = r#"{"id":7,"type":"joinRoom","data":{"token":"t","roomId":"room-a","userName":"Alice"}}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.id, Some(7));
        match envelope.message {
            ClientMessage::JoinRoom {
                token,
                room_id,
                user_name,
            } => {
                assert_eq!(token, "t");
                assert_eq!(room_id, "room-a");
                assert_eq!(user_name.as_deref(), Some("Alice"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn create_transport_direction_uses_type_key() {
        let raw = r#"{"id":1,"type":"createTransport","data":{"roomId":"r","type":"recv"}}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        match envelope.message {
            ClientMessage::CreateTransport { direction, .. } => {
                assert_eq!(direction, TransportDirection::Recv);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn payload_free_messages_parse_without_data() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"id":3,"type":"toggleHandRaise"}"#).unwrap();
        assert!(matches!(envelope.message, ClientMessage::ToggleHandRaise));

        let envelope: Envelope = serde_json::from_str(r#"{"type":"leaveRoom","id":4}"#).unwrap();
        assert!(matches!(envelope.message, ClientMessage::LeaveRoom));
    }

    #[test]
    fn events_serialize_with_type_and_data() {
        let event = ServerMessage::ConsumerPaused {
            consumer_id: ConsumerId::from("c1"),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "consumerPaused");
        assert_eq!(value["data"]["consumerId"], "c1");

        let event = ServerMessage::MeetingEnded {
            reason: "Host ended the meeting".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "meetingEnded");
        assert_eq!(value["data"]["reason"], "Host ended the meeting");
    }
}
