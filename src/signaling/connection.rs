#![forbid(unsafe_code)]

// Per-connection handler: reads frames off one WebSocket, dispatches them
// to the room manager, and acknowledges each request exactly once.

use super::protocol::{ClientMessage, Envelope, ServerMessage};
use crate::metrics::ServerMetrics;
use crate::room::{RoomManager, SignalError};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded per-client outbound buffer. Events beyond this are stale; drop
/// them rather than queueing unboundedly.
const CHANNEL_CAPACITY: usize = 64;

/// Close connections that stay silent this long; the channel's liveness
/// check is what reaps dead peers.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Token bucket: burst capacity and refill rate (messages per second).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
const RATE_LIMIT_REFILL_RATE: u64 = 100;
const TOKEN_US: u64 = 1_000_000;
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

const MAX_ROOM_ID_LEN: usize = 128;
const MAX_USER_NAME_LEN: usize = 64;
const MAX_CHAT_LEN: usize = 4096;

/// One-shot acknowledgment handle for a request id. Consumed by value on
/// either path, so a handler cannot reply twice or not at all once it holds
/// one.
pub struct ReplyHandle {
    id: u64,
    tx: mpsc::Sender<Arc<String>>,
}

impl ReplyHandle {
    fn new(id: u64, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self { id, tx }
    }

    pub fn ok(self, data: serde_json::Value) {
        self.send(json!({ "id": self.id, "data": data }));
    }

    pub fn err(self, message: impl std::fmt::Display) {
        self.send(json!({ "id": self.id, "error": message.to_string() }));
    }

    fn send(&self, value: serde_json::Value) {
        match serde_json::to_string(&value) {
            Ok(frame) => {
                if self.tx.try_send(Arc::new(frame)).is_err() {
                    debug!("Ack for request {} dropped (channel gone)", self.id);
                }
            }
            Err(e) => warn!("Failed to serialize ack for request {}: {e}", self.id),
        }
    }
}

fn send_event(tx: &mpsc::Sender<Arc<String>>, message: &ServerMessage) {
    if let Some(frame) = message.to_frame() {
        let _ = tx.try_send(frame);
    }
}

fn to_value<T: Serialize>(value: T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        warn!("Reply serialization failed: {e}");
        serde_json::Value::Null
    })
}

/// Drives one client's WebSocket until it closes, then runs the disconnect
/// cleanup cascade.
pub async fn handle_connection(
    socket: WebSocket,
    manager: Arc<RoomManager>,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let peer_id = Uuid::new_v4().to_string();
    info!("New signaling connection: {}", peer_id);

    metrics.inc_connections();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    // Writer task: everything outbound funnels through the bounded channel.
    let send_metrics = metrics.clone();
    let send_peer_id = peer_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            send_metrics.inc_messages_sent();
            if ws_sender
                .send(Message::Text((*frame).clone().into()))
                .await
                .is_err()
            {
                break;
            }
        }
        debug!("Writer finished for peer {}", send_peer_id);
    });

    // Token bucket state.
    let mut tokens_us: u64 = MAX_TOKENS_US;
    let mut last_refill = Instant::now();
    let mut rate_limit_warned = false;

    loop {
        let frame = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                warn!("Idle timeout for peer {}", peer_id);
                break;
            }
        };

        match frame {
            Message::Text(text) => {
                metrics.inc_messages_received();

                let now = Instant::now();
                let elapsed_us = now.duration_since(last_refill).as_micros() as u64;
                last_refill = now;
                tokens_us = (tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);
                if tokens_us >= TOKEN_US {
                    tokens_us -= TOKEN_US;
                    rate_limit_warned = false;
                } else {
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded for peer {}", peer_id);
                        send_event(
                            &tx,
                            &ServerMessage::Error {
                                message: format!(
                                    "Rate limit exceeded: max {RATE_LIMIT_REFILL_RATE} messages/second"
                                ),
                            },
                        );
                    }
                    continue;
                }

                match serde_json::from_str::<Envelope>(&text) {
                    Ok(envelope) => {
                        let started = Instant::now();
                        let result =
                            handle_request(&envelope.message, &peer_id, &manager, &tx).await;
                        metrics.observe_message_handling(started.elapsed());

                        match envelope.id {
                            Some(id) => {
                                let reply = ReplyHandle::new(id, tx.clone());
                                match result {
                                    Ok(data) => reply.ok(data),
                                    Err(e) => {
                                        metrics.inc_errors();
                                        reply.err(e);
                                    }
                                }
                            }
                            None => {
                                if let Err(e) = result {
                                    metrics.inc_errors();
                                    debug!("Unacknowledged request failed for {}: {e}", peer_id);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        metrics.inc_errors();
                        warn!("Malformed frame from {}: {e}", peer_id);
                        send_event(
                            &tx,
                            &ServerMessage::Error {
                                message: format!("Invalid message format: {e}"),
                            },
                        );
                    }
                }
            }
            Message::Close(_) => {
                info!("Peer {} closed the connection", peer_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
            _ => {
                warn!("Unexpected frame type from peer {}", peer_id);
            }
        }
    }

    // Disconnect is fire-and-forget: full cleanup cascade, no ack.
    manager.cleanup_peer(&peer_id).await;

    drop(tx);
    let _ = send_task.await;
    info!("Connection handler finished for peer {}", peer_id);
}

/// Routes one request to the room manager and shapes its ack payload.
async fn handle_request(
    message: &ClientMessage,
    peer_id: &str,
    manager: &Arc<RoomManager>,
    tx: &mpsc::Sender<Arc<String>>,
) -> Result<serde_json::Value, SignalError> {
    match message {
        ClientMessage::JoinRoom {
            token,
            room_id,
            user_name,
        } => {
            if room_id.is_empty() || room_id.len() > MAX_ROOM_ID_LEN {
                return Err(SignalError::InvalidRequest(format!(
                    "roomId must be 1-{MAX_ROOM_ID_LEN} characters"
                )));
            }
            if let Some(name) = user_name {
                if name.len() > MAX_USER_NAME_LEN {
                    return Err(SignalError::InvalidRequest(format!(
                        "userName must be at most {MAX_USER_NAME_LEN} characters"
                    )));
                }
            }
            let reply = manager
                .join_room(peer_id, token, room_id, user_name.clone(), tx.clone())
                .await?;
            Ok(to_value(reply))
        }

        ClientMessage::CreateTransport { room_id, direction } => {
            let reply = manager
                .create_transport(peer_id, room_id, *direction)
                .await?;
            Ok(to_value(reply))
        }

        ClientMessage::ConnectTransport {
            transport_id,
            dtls_parameters,
        } => {
            manager
                .connect_transport(peer_id, transport_id, dtls_parameters.clone())
                .await?;
            Ok(json!({ "connected": true }))
        }

        ClientMessage::Produce {
            transport_id,
            kind,
            rtp_parameters,
            app_data,
        } => {
            let producer_id = manager
                .produce(
                    peer_id,
                    transport_id,
                    *kind,
                    rtp_parameters.clone(),
                    app_data.clone(),
                )
                .await?;
            Ok(json!({ "id": producer_id }))
        }

        ClientMessage::Consume {
            producer_id,
            rtp_capabilities,
        } => {
            let reply = manager
                .consume(peer_id, producer_id, rtp_capabilities.clone())
                .await?;
            Ok(to_value(reply))
        }

        ClientMessage::ResumeConsumer { consumer_id } => {
            manager.resume_consumer(peer_id, consumer_id).await?;
            Ok(json!({ "resumed": true }))
        }

        ClientMessage::PauseConsumer { consumer_id } => {
            manager.pause_consumer(peer_id, consumer_id).await?;
            Ok(json!({ "paused": true }))
        }

        ClientMessage::PauseProducer { producer_id } => {
            manager.pause_producer(peer_id, producer_id).await?;
            Ok(json!({ "paused": true }))
        }

        ClientMessage::ResumeProducer { producer_id } => {
            manager.resume_producer(peer_id, producer_id).await?;
            Ok(json!({ "resumed": true }))
        }

        ClientMessage::CloseProducer { producer_id } => {
            manager.close_producer(peer_id, producer_id).await?;
            Ok(json!({ "closed": true }))
        }

        ClientMessage::ToggleHandRaise => {
            let raised = manager.toggle_hand_raise(peer_id).await?;
            Ok(json!({ "isHandRaised": raised }))
        }

        ClientMessage::ChatMessage { message } => {
            if message.is_empty() || message.len() > MAX_CHAT_LEN {
                return Err(SignalError::InvalidRequest(format!(
                    "message must be 1-{MAX_CHAT_LEN} characters"
                )));
            }
            manager.chat_message(peer_id, message.clone()).await?;
            Ok(json!({ "sent": true }))
        }

        ClientMessage::GetExistingProducers => {
            let producers = manager.existing_producers(peer_id).await?;
            Ok(json!({ "producers": producers }))
        }

        ClientMessage::GetRoomStats { room_id } => {
            let reply = manager.room_stats(peer_id, room_id).await?;
            Ok(to_value(reply))
        }

        ClientMessage::SetConsumerPreferredLayers {
            consumer_id,
            spatial_layer,
            temporal_layer,
        } => {
            manager
                .set_consumer_preferred_layers(peer_id, consumer_id, *spatial_layer, *temporal_layer)
                .await?;
            Ok(json!({ "success": true }))
        }

        ClientMessage::EndMeeting { room_id } => {
            manager.end_meeting(peer_id, room_id).await?;
            Ok(json!({ "ended": true }))
        }

        ClientMessage::LeaveRoom => {
            manager.leave_room(peer_id).await?;
            Ok(json!({ "left": true }))
        }
    }
}
