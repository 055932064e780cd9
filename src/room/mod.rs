#![forbid(unsafe_code)]

// Room orchestration: membership and ownership, the peer registry, the
// signaling verbs, event fan-out, and the cleanup cascade.

pub mod events;
pub mod peers;

use crate::auth;
use crate::engine::{
    ConsumerId, ConsumerLayers, ConsumerOptions, EngineError, MediaEngine, MediaKind, ProducerId,
    ProducerOptions, RtpCapabilities, RtpParameters, TransportDirection, TransportId,
};
use crate::media::router_registry::RouterCreateError;
use crate::media::worker_pool::{LoadCounter, NoWorkersAvailable};
use crate::media::{MediaConfig, RouterRegistry, TransportConfig, WorkerPool};
use crate::metrics::ServerMetrics;
use crate::signaling::protocol::{
    ChatBroadcast, ConsumeReply, JoinReply, RoomStats, RoomStatsReply, ServerMessage,
    TransportReply,
};
use peers::{unix_millis, Peer, PeerRegistry};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::RwLock as StdRwLock;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, info, warn};

/// Room capacity applied at join time.
pub const DEFAULT_MAX_PEERS: usize = 150;

const MEETING_ENDED_REASON: &str = "Host ended the meeting";

/// Failures surfaced to clients as `{error}` acknowledgments. Engine errors
/// pass through with their own message.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("Invalid or expired token")]
    Unauthenticated,
    #[error("Room is full")]
    RoomFull,
    #[error("Peer not found")]
    PeerNotFound,
    #[error("Transport not found: {0}")]
    TransportNotFound(TransportId),
    #[error("Producer not found: {0}")]
    ProducerNotFound(ProducerId),
    #[error("Consumer not found: {0}")]
    ConsumerNotFound(ConsumerId),
    #[error("No receive transport")]
    NoRecvTransport,
    #[error("Cannot consume producer {0}")]
    CodecMismatch(ProducerId),
    #[error("Router not found for room: {0}")]
    RouterNotFound(String),
    #[error("Only the host can end the meeting")]
    NotOwner,
    #[error("No workers available")]
    NoWorkersAvailable,
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    Engine(#[from] EngineError),
}

impl From<NoWorkersAvailable> for SignalError {
    fn from(_: NoWorkersAvailable) -> Self {
        SignalError::NoWorkersAvailable
    }
}

impl From<RouterCreateError> for SignalError {
    fn from(e: RouterCreateError) -> Self {
        match e {
            RouterCreateError::NoWorkers(_) => SignalError::NoWorkersAvailable,
            RouterCreateError::Engine(e) => SignalError::Engine(e),
        }
    }
}

/// Live membership of one room. The owner is fixed when the room record is
/// created and never reassigned.
pub struct Room {
    pub id: String,
    pub owner_peer_id: String,
    members: HashMap<String, mpsc::Sender<Arc<String>>>,
    pub created_at: u64,
}

impl Room {
    fn new(id: String, owner_peer_id: String) -> Self {
        Self {
            id,
            owner_peer_id,
            members: HashMap::new(),
            created_at: unix_millis(),
        }
    }

    fn send_frame(&self, peer_id: &str, sender: &mpsc::Sender<Arc<String>>, frame: &Arc<String>) {
        match sender.try_send(frame.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Channel full for peer {} in room {}, dropping event", peer_id, self.id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Channel closed for peer {} in room {}", peer_id, self.id);
            }
        }
    }

    /// Best-effort fan-out to every member except `sender_peer_id`.
    fn broadcast_except(&self, sender_peer_id: &str, message: &ServerMessage) {
        let Some(frame) = message.to_frame() else { return };
        for (peer_id, sender) in &self.members {
            if peer_id != sender_peer_id {
                self.send_frame(peer_id, sender, &frame);
            }
        }
    }

    /// Best-effort fan-out to every member, sender included. Only chat uses
    /// this.
    fn broadcast_all(&self, message: &ServerMessage) {
        let Some(frame) = message.to_frame() else { return };
        for (peer_id, sender) in &self.members {
            self.send_frame(peer_id, sender, &frame);
        }
    }
}

/// Who owns an engine handle; lets the event pump route engine signals back
/// to the right peer, room, and worker.
#[derive(Debug, Clone)]
pub(crate) struct OwnerRef {
    pub peer_id: String,
    pub room_id: String,
    pub worker_pid: u32,
}

#[derive(Default)]
struct MediaIndex {
    transports: HashMap<TransportId, OwnerRef>,
    producers: HashMap<ProducerId, OwnerRef>,
    consumers: HashMap<ConsumerId, OwnerRef>,
}

/// Coordinates every registry. All handler verbs live here; the WebSocket
/// layer parses and acknowledges, the event pump feeds engine signals back
/// in.
pub struct RoomManager {
    pool: Arc<WorkerPool>,
    routers: RouterRegistry,
    peers: PeerRegistry,
    rooms: StdRwLock<HashMap<String, Arc<TokioRwLock<Room>>>>,
    media_index: StdMutex<MediaIndex>,
    transport_config: TransportConfig,
    jwt_secret: String,
    metrics: ServerMetrics,
    max_peers: AtomicUsize,
}

impl RoomManager {
    pub async fn new(
        engine: Arc<dyn MediaEngine>,
        config: MediaConfig,
        jwt_secret: impl Into<String>,
        metrics: ServerMetrics,
    ) -> Result<Arc<Self>, EngineError> {
        let pool = WorkerPool::start(engine, config.workers.clone()).await?;
        Ok(Arc::new(Self {
            routers: RouterRegistry::new(pool.clone()),
            pool,
            peers: PeerRegistry::new(),
            rooms: StdRwLock::new(HashMap::new()),
            media_index: StdMutex::new(MediaIndex::default()),
            transport_config: config.transport,
            jwt_secret: jwt_secret.into(),
            metrics,
            max_peers: AtomicUsize::new(DEFAULT_MAX_PEERS),
        }))
    }

    /// Overrides the room capacity (tests and future room settings).
    pub fn set_max_peers(&self, max_peers: usize) {
        self.max_peers.store(max_peers, Ordering::Relaxed);
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn router_registry(&self) -> &RouterRegistry {
        &self.routers
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    pub fn has_peer(&self, peer_id: &str) -> bool {
        self.peers.contains(peer_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn has_room(&self, room_id: &str) -> bool {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(room_id)
    }

    /// Whether the room is at capacity. Joins are gated on the same check
    /// under the room lock.
    pub async fn is_full(&self, room_id: &str) -> bool {
        match self.room(room_id) {
            Some(room) => room.read().await.members.len() >= self.max_peers.load(Ordering::Relaxed),
            None => false,
        }
    }

    fn room(&self, room_id: &str) -> Option<Arc<TokioRwLock<Room>>> {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(room_id)
            .cloned()
    }

    // --- Fan-out primitives ---

    pub(crate) async fn to_room_except_sender(
        &self,
        room_id: &str,
        sender_peer_id: &str,
        message: &ServerMessage,
    ) {
        if let Some(room) = self.room(room_id) {
            room.read().await.broadcast_except(sender_peer_id, message);
        }
    }

    pub(crate) async fn to_room_including_sender(&self, room_id: &str, message: &ServerMessage) {
        if let Some(room) = self.room(room_id) {
            room.read().await.broadcast_all(message);
        }
    }

    pub(crate) async fn send_to_peer(&self, peer_id: &str, message: &ServerMessage) {
        let Some(frame) = message.to_frame() else { return };
        if let Some(peer_lock) = self.peers.get(peer_id) {
            let peer = peer_lock.lock().await;
            if peer.sender.try_send(frame).is_err() {
                debug!("Dropped direct event for peer {}", peer_id);
            }
        }
    }

    // --- Media index (event pump routing) ---

    fn index(&self) -> std::sync::MutexGuard<'_, MediaIndex> {
        self.media_index.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn take_transport_ref(&self, id: &TransportId) -> Option<OwnerRef> {
        self.index().transports.remove(id)
    }

    pub(crate) fn transport_ref(&self, id: &TransportId) -> Option<OwnerRef> {
        self.index().transports.get(id).cloned()
    }

    pub(crate) fn take_producer_ref(&self, id: &ProducerId) -> Option<OwnerRef> {
        self.index().producers.remove(id)
    }

    pub(crate) fn take_consumer_ref(&self, id: &ConsumerId) -> Option<OwnerRef> {
        self.index().consumers.remove(id)
    }

    pub(crate) fn consumer_ref(&self, id: &ConsumerId) -> Option<OwnerRef> {
        self.index().consumers.get(id).cloned()
    }

    // --- Handler verbs ---

    /// Verifies the token, places the peer in the room (creating router and
    /// room on first join), marks ownership, announces the join, and
    /// returns the state a client needs to start negotiating.
    pub async fn join_room(
        &self,
        peer_id: &str,
        token: &str,
        room_id: &str,
        user_name: Option<String>,
        sender: mpsc::Sender<Arc<String>>,
    ) -> Result<JoinReply, SignalError> {
        let claims = auth::verify_join_token(token, &self.jwt_secret)
            .map_err(|_| SignalError::Unauthenticated)?;
        let user_name = user_name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| claims.name.clone());

        // A joining peer that is already somewhere else moves rooms.
        if self.peers.contains(peer_id) {
            self.cleanup_peer(peer_id).await;
        }

        let (router, _worker_pid) = self.routers.get_or_create(room_id).await?;

        let room_lock = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            match rooms.get(room_id) {
                Some(existing) => existing.clone(),
                None => {
                    // First joiner becomes the owner, fixed for the room's
                    // lifetime.
                    let room = Arc::new(TokioRwLock::new(Room::new(
                        room_id.to_string(),
                        peer_id.to_string(),
                    )));
                    rooms.insert(room_id.to_string(), room.clone());
                    self.metrics.inc_rooms_created();
                    room
                }
            }
        };

        // Membership mutation and the member snapshot happen under one room
        // write lock, so concurrent joins observe each other in a total
        // order.
        let (other_member_ids, is_owner) = {
            let mut room = room_lock.write().await;
            if room.members.len() >= self.max_peers.load(Ordering::Relaxed) {
                return Err(SignalError::RoomFull);
            }
            let is_owner = room.owner_peer_id == peer_id;
            room.members.insert(peer_id.to_string(), sender.clone());
            let others: Vec<String> = room
                .members
                .keys()
                .filter(|id| id.as_str() != peer_id)
                .cloned()
                .collect();
            (others, is_owner)
        };

        let peer = Peer::new(
            peer_id.to_string(),
            claims.sub,
            user_name.clone(),
            room_id.to_string(),
            sender,
            is_owner,
        );
        let own_view = peer.view();
        self.peers.insert(peer);
        self.metrics.inc_joins();
        info!(
            "Peer {} ({}) joined room {} (owner: {})",
            peer_id, user_name, room_id, is_owner
        );

        self.to_room_except_sender(room_id, peer_id, &ServerMessage::ParticipantJoined(own_view))
            .await;

        let mut participants = Vec::with_capacity(other_member_ids.len());
        for id in &other_member_ids {
            if let Some(peer_lock) = self.peers.get(id) {
                participants.push(peer_lock.lock().await.view());
            }
        }
        let existing_producers = self.routers.others_of(room_id, peer_id);

        Ok(JoinReply {
            router_rtp_capabilities: router.rtp_capabilities(),
            participants,
            existing_producers,
            peer_id: peer_id.to_string(),
            is_owner,
        })
    }

    /// Creates a WebRTC transport on the room's router and stores it on the
    /// peer under the requested direction.
    pub async fn create_transport(
        &self,
        peer_id: &str,
        room_id: &str,
        direction: TransportDirection,
    ) -> Result<TransportReply, SignalError> {
        let peer_lock = self.peers.get(peer_id).ok_or(SignalError::PeerNotFound)?;
        let (router, worker_pid) = self
            .routers
            .get(room_id)
            .ok_or_else(|| SignalError::RouterNotFound(room_id.to_string()))?;

        let transport = router
            .create_webrtc_transport(self.transport_config.webrtc_options())
            .await?;
        if direction == TransportDirection::Recv {
            let bitrate = self.transport_config.max_incoming_bitrate;
            if let Err(e) = transport.set_max_incoming_bitrate(bitrate).await {
                warn!(
                    "Failed to set max incoming bitrate on transport {}: {e}",
                    transport.id()
                );
            }
        }

        let transport_id = transport.id();
        self.pool.update_load(worker_pid, LoadCounter::Transports, 1);
        self.index().transports.insert(
            transport_id.clone(),
            OwnerRef {
                peer_id: peer_id.to_string(),
                room_id: room_id.to_string(),
                worker_pid,
            },
        );

        let mut peer = peer_lock.lock().await;
        if !self.peers.contains(peer_id) {
            // Peer vanished while the engine call was in flight.
            drop(peer);
            self.index().transports.remove(&transport_id);
            if let Err(e) = transport.close().await {
                warn!("Failed to close orphaned transport {}: {e}", transport_id);
            }
            return Err(SignalError::PeerNotFound);
        }

        let reply = TransportReply {
            id: transport_id.clone(),
            ice_parameters: transport.ice_parameters(),
            ice_candidates: transport.ice_candidates(),
            dtls_parameters: transport.dtls_parameters(),
            sctp_parameters: transport.sctp_parameters(),
        };
        match direction {
            TransportDirection::Send => {
                peer.send_transports.insert(transport_id, transport);
            }
            TransportDirection::Recv => {
                peer.add_recv_transport(transport);
            }
        }
        Ok(reply)
    }

    /// Completes DTLS on a transport found in either direction map.
    pub async fn connect_transport(
        &self,
        peer_id: &str,
        transport_id: &TransportId,
        dtls_parameters: crate::engine::DtlsParameters,
    ) -> Result<(), SignalError> {
        let peer_lock = self.peers.get(peer_id).ok_or(SignalError::PeerNotFound)?;
        let peer = peer_lock.lock().await;
        let transport = peer
            .transport(transport_id)
            .ok_or_else(|| SignalError::TransportNotFound(transport_id.clone()))?;
        transport.connect(dtls_parameters).await?;
        Ok(())
    }

    /// Creates a producer on the peer's send transport, flips the matching
    /// media flag, registers it in the room's producer index, and announces
    /// it.
    pub async fn produce(
        &self,
        peer_id: &str,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        mut app_data: crate::engine::AppData,
    ) -> Result<ProducerId, SignalError> {
        let peer_lock = self.peers.get(peer_id).ok_or(SignalError::PeerNotFound)?;
        let mut peer = peer_lock.lock().await;
        let transport = peer
            .send_transports
            .get(transport_id)
            .cloned()
            .ok_or_else(|| SignalError::TransportNotFound(transport_id.clone()))?;

        app_data.insert("peerId".to_string(), json!(peer_id));
        let screen_share = app_data.get("source").and_then(|v| v.as_str()) == Some("screen");

        let producer = transport
            .produce(ProducerOptions {
                kind,
                rtp_parameters,
                app_data,
            })
            .await?;
        let producer_id = producer.id();
        peer.producers.insert(producer_id.clone(), producer);

        match kind {
            MediaKind::Audio => peer.flags.audio_enabled = true,
            MediaKind::Video if screen_share => peer.flags.screen_sharing = true,
            MediaKind::Video => peer.flags.video_enabled = true,
        }

        let room_id = peer.room_id.clone();
        let user_name = peer.user_name.clone();

        // Register while the peer lock is still held. A racing cleanup has
        // already taken the registry entry and is blocked on this lock, so
        // it drains and unregisters the producer it finds here; releasing
        // first would let the teardown run between insert and registration,
        // stranding the index entry and the load increment.
        self.routers
            .register(&room_id, producer_id.clone(), peer_id, kind, &user_name);
        if let Some((_, worker_pid)) = self.routers.get(&room_id) {
            self.pool.update_load(worker_pid, LoadCounter::Producers, 1);
            self.index().producers.insert(
                producer_id.clone(),
                OwnerRef {
                    peer_id: peer_id.to_string(),
                    room_id: room_id.clone(),
                    worker_pid,
                },
            );
        }
        self.metrics.inc_producers_created();
        drop(peer);

        self.to_room_except_sender(
            &room_id,
            peer_id,
            &ServerMessage::NewProducer(crate::media::ProducerEntry {
                producer_id: producer_id.clone(),
                peer_id: peer_id.to_string(),
                kind,
                user_name,
            }),
        )
        .await;

        Ok(producer_id)
    }

    /// Creates a consumer for another participant's producer on the peer's
    /// newest recv transport. The consumer starts paused so no media flows
    /// before the client has bound its renderer.
    pub async fn consume(
        &self,
        peer_id: &str,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumeReply, SignalError> {
        let peer_lock = self.peers.get(peer_id).ok_or(SignalError::PeerNotFound)?;
        let mut peer = peer_lock.lock().await;
        let room_id = peer.room_id.clone();
        let (router, worker_pid) = self
            .routers
            .get(&room_id)
            .ok_or_else(|| SignalError::RouterNotFound(room_id.clone()))?;

        if !router.can_consume(producer_id, &rtp_capabilities) {
            return Err(SignalError::CodecMismatch(producer_id.clone()));
        }
        let transport = peer
            .latest_recv_transport()
            .ok_or(SignalError::NoRecvTransport)?;

        let consumer = transport
            .consume(ConsumerOptions {
                producer_id: producer_id.clone(),
                rtp_capabilities,
                paused: true,
            })
            .await?;

        let consumer_id = consumer.id();
        let reply = ConsumeReply {
            id: consumer_id.clone(),
            producer_id: consumer.producer_id(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            producer_paused: consumer.producer_paused(),
        };
        peer.consumers.insert(consumer_id.clone(), consumer);
        self.pool.update_load(worker_pid, LoadCounter::Consumers, 1);
        self.index().consumers.insert(
            consumer_id,
            OwnerRef {
                peer_id: peer_id.to_string(),
                room_id,
                worker_pid,
            },
        );
        self.metrics.inc_consumers_created();
        Ok(reply)
    }

    pub async fn resume_consumer(
        &self,
        peer_id: &str,
        consumer_id: &ConsumerId,
    ) -> Result<(), SignalError> {
        let peer_lock = self.peers.get(peer_id).ok_or(SignalError::PeerNotFound)?;
        let peer = peer_lock.lock().await;
        let consumer = peer
            .consumers
            .get(consumer_id)
            .ok_or_else(|| SignalError::ConsumerNotFound(consumer_id.clone()))?;
        consumer.resume().await?;
        Ok(())
    }

    pub async fn pause_consumer(
        &self,
        peer_id: &str,
        consumer_id: &ConsumerId,
    ) -> Result<(), SignalError> {
        let peer_lock = self.peers.get(peer_id).ok_or(SignalError::PeerNotFound)?;
        let peer = peer_lock.lock().await;
        let consumer = peer
            .consumers
            .get(consumer_id)
            .ok_or_else(|| SignalError::ConsumerNotFound(consumer_id.clone()))?;
        consumer.pause().await?;
        Ok(())
    }

    /// Pauses the peer's own producer (mute), clears the matching flag, and
    /// tells the rest of the room.
    pub async fn pause_producer(
        &self,
        peer_id: &str,
        producer_id: &ProducerId,
    ) -> Result<(), SignalError> {
        let room_id = self
            .set_producer_paused(peer_id, producer_id, true)
            .await?;
        self.to_room_except_sender(
            &room_id,
            peer_id,
            &ServerMessage::ProducerPaused {
                producer_id: producer_id.clone(),
                peer_id: peer_id.to_string(),
            },
        )
        .await;
        Ok(())
    }

    /// Resumes the peer's own producer (unmute), restores the flag, and
    /// tells the rest of the room.
    pub async fn resume_producer(
        &self,
        peer_id: &str,
        producer_id: &ProducerId,
    ) -> Result<(), SignalError> {
        let room_id = self
            .set_producer_paused(peer_id, producer_id, false)
            .await?;
        self.to_room_except_sender(
            &room_id,
            peer_id,
            &ServerMessage::ProducerResumed {
                producer_id: producer_id.clone(),
                peer_id: peer_id.to_string(),
            },
        )
        .await;
        Ok(())
    }

    async fn set_producer_paused(
        &self,
        peer_id: &str,
        producer_id: &ProducerId,
        paused: bool,
    ) -> Result<String, SignalError> {
        let peer_lock = self.peers.get(peer_id).ok_or(SignalError::PeerNotFound)?;
        let mut peer = peer_lock.lock().await;
        let producer = peer
            .producers
            .get(producer_id)
            .cloned()
            .ok_or_else(|| SignalError::ProducerNotFound(producer_id.clone()))?;

        if paused {
            producer.pause().await?;
        } else {
            producer.resume().await?;
        }

        let screen_share =
            producer.app_data().get("source").and_then(|v| v.as_str()) == Some("screen");
        match producer.kind() {
            MediaKind::Audio => peer.flags.audio_enabled = !paused,
            MediaKind::Video if screen_share => peer.flags.screen_sharing = !paused,
            MediaKind::Video => peer.flags.video_enabled = !paused,
        }
        Ok(peer.room_id.clone())
    }

    /// Closes the peer's own producer. The engine's close signal drives the
    /// room broadcast and final bookkeeping.
    pub async fn close_producer(
        &self,
        peer_id: &str,
        producer_id: &ProducerId,
    ) -> Result<(), SignalError> {
        let peer_lock = self.peers.get(peer_id).ok_or(SignalError::PeerNotFound)?;
        let mut peer = peer_lock.lock().await;
        let producer = peer
            .producers
            .remove(producer_id)
            .ok_or_else(|| SignalError::ProducerNotFound(producer_id.clone()))?;

        let screen_share =
            producer.app_data().get("source").and_then(|v| v.as_str()) == Some("screen");
        match producer.kind() {
            MediaKind::Audio => peer.flags.audio_enabled = false,
            MediaKind::Video if screen_share => peer.flags.screen_sharing = false,
            MediaKind::Video => peer.flags.video_enabled = false,
        }
        let room_id = peer.room_id.clone();
        drop(peer);

        if let Err(e) = producer.close().await {
            warn!("Failed to close producer {}: {e}", producer_id);
        }
        self.routers.unregister(&room_id, producer_id);
        Ok(())
    }

    /// Flips the hand-raise flag and announces the new state.
    pub async fn toggle_hand_raise(&self, peer_id: &str) -> Result<bool, SignalError> {
        let peer_lock = self.peers.get(peer_id).ok_or(SignalError::PeerNotFound)?;
        let mut peer = peer_lock.lock().await;
        peer.flags.hand_raised = !peer.flags.hand_raised;
        let raised = peer.flags.hand_raised;
        let room_id = peer.room_id.clone();
        drop(peer);

        self.to_room_except_sender(
            &room_id,
            peer_id,
            &ServerMessage::HandRaiseChanged {
                peer_id: peer_id.to_string(),
                is_hand_raised: raised,
            },
        )
        .await;
        Ok(raised)
    }

    /// Fans a chat message out to the whole room, sender included.
    pub async fn chat_message(&self, peer_id: &str, message: String) -> Result<(), SignalError> {
        let peer_lock = self.peers.get(peer_id).ok_or(SignalError::PeerNotFound)?;
        let (room_id, user_name) = {
            let peer = peer_lock.lock().await;
            (peer.room_id.clone(), peer.user_name.clone())
        };
        let timestamp = unix_millis();
        self.to_room_including_sender(
            &room_id,
            &ServerMessage::NewChatMessage(ChatBroadcast {
                id: timestamp,
                peer_id: peer_id.to_string(),
                user_name,
                message,
                timestamp,
            }),
        )
        .await;
        self.metrics.inc_chat_messages();
        Ok(())
    }

    /// Producer entries of everyone else in the peer's room.
    pub async fn existing_producers(
        &self,
        peer_id: &str,
    ) -> Result<Vec<crate::media::ProducerEntry>, SignalError> {
        let peer_lock = self.peers.get(peer_id).ok_or(SignalError::PeerNotFound)?;
        let room_id = peer_lock.lock().await.room_id.clone();
        Ok(self.routers.others_of(&room_id, peer_id))
    }

    /// Room statistics plus the public views of its members.
    pub async fn room_stats(
        &self,
        peer_id: &str,
        room_id: &str,
    ) -> Result<RoomStatsReply, SignalError> {
        if !self.peers.contains(peer_id) {
            return Err(SignalError::PeerNotFound);
        }
        let room_lock = self
            .room(room_id)
            .ok_or_else(|| SignalError::RouterNotFound(room_id.to_string()))?;
        let (member_ids, created_at) = {
            let room = room_lock.read().await;
            (
                room.members.keys().cloned().collect::<Vec<_>>(),
                room.created_at,
            )
        };
        let uptime = self
            .routers
            .room_age(room_id)
            .map(|(_, age)| age)
            .unwrap_or(Duration::ZERO);

        let mut participants = Vec::with_capacity(member_ids.len());
        for id in &member_ids {
            if let Some(peer_lock) = self.peers.get(id) {
                participants.push(peer_lock.lock().await.view());
            }
        }

        Ok(RoomStatsReply {
            stats: RoomStats {
                peer_count: member_ids.len(),
                producer_count: self.routers.producer_count(room_id),
                created_at,
                uptime: uptime.as_secs(),
            },
            participants,
        })
    }

    /// Applies preferred simulcast layers to one of the peer's consumers.
    pub async fn set_consumer_preferred_layers(
        &self,
        peer_id: &str,
        consumer_id: &ConsumerId,
        spatial_layer: u8,
        temporal_layer: Option<u8>,
    ) -> Result<(), SignalError> {
        let peer_lock = self.peers.get(peer_id).ok_or(SignalError::PeerNotFound)?;
        let peer = peer_lock.lock().await;
        let consumer = peer
            .consumers
            .get(consumer_id)
            .ok_or_else(|| SignalError::ConsumerNotFound(consumer_id.clone()))?;
        consumer
            .set_preferred_layers(ConsumerLayers {
                spatial_layer,
                temporal_layer,
            })
            .await?;
        Ok(())
    }

    /// Owner-only: ends the meeting for everyone, cleaning up every peer in
    /// the room (owner included) and collapsing the room.
    pub async fn end_meeting(&self, peer_id: &str, room_id: &str) -> Result<(), SignalError> {
        if !self.peers.contains(peer_id) {
            return Err(SignalError::PeerNotFound);
        }
        let room_lock = self
            .room(room_id)
            .ok_or_else(|| SignalError::RouterNotFound(room_id.to_string()))?;
        let member_ids = {
            let room = room_lock.read().await;
            if room.owner_peer_id != peer_id {
                return Err(SignalError::NotOwner);
            }
            room.members.keys().cloned().collect::<Vec<_>>()
        };

        self.to_room_except_sender(
            room_id,
            peer_id,
            &ServerMessage::MeetingEnded {
                reason: MEETING_ENDED_REASON.to_string(),
            },
        )
        .await;

        for member_id in &member_ids {
            self.cleanup_peer(member_id).await;
        }
        self.metrics.inc_meetings_ended();
        info!("Meeting in room {} ended by owner {}", room_id, peer_id);
        Ok(())
    }

    /// Leaves the current room. Same cascade as a disconnect.
    pub async fn leave_room(&self, peer_id: &str) -> Result<(), SignalError> {
        if self.cleanup_peer(peer_id).await {
            Ok(())
        } else {
            Err(SignalError::PeerNotFound)
        }
    }

    /// Tears a peer down: consumers, then producers (dropping their index
    /// entries), then transports, then membership; collapses the room when
    /// it empties. Idempotent — the registry entry is taken atomically up
    /// front, and every engine failure is logged and skipped so the cascade
    /// always runs to completion.
    pub async fn cleanup_peer(&self, peer_id: &str) -> bool {
        let Some(peer_lock) = self.peers.take(peer_id) else {
            return false;
        };

        let (room_id, user_id, consumers, producers, transports) = {
            let mut peer = peer_lock.lock().await;
            let consumers: Vec<_> = peer.consumers.drain().collect();
            let producers: Vec<_> = peer.producers.drain().collect();
            let mut transports: Vec<_> = peer.send_transports.drain().collect();
            transports.extend(peer.recv_transports.drain());
            (
                peer.room_id.clone(),
                peer.user_id.clone(),
                consumers,
                producers,
                transports,
            )
        };

        for (consumer_id, consumer) in consumers {
            if let Err(e) = consumer.close().await {
                warn!("Cleanup: failed to close consumer {consumer_id}: {e}");
            }
        }
        for (producer_id, producer) in producers {
            self.routers.unregister(&room_id, &producer_id);
            if let Err(e) = producer.close().await {
                warn!("Cleanup: failed to close producer {producer_id}: {e}");
            }
        }
        for (transport_id, transport) in transports {
            if let Err(e) = transport.close().await {
                warn!("Cleanup: failed to close transport {transport_id}: {e}");
            }
        }

        let mut room_now_empty = false;
        if let Some(room_lock) = self.room(&room_id) {
            {
                let mut room = room_lock.write().await;
                if room.members.remove(peer_id).is_some() {
                    room.broadcast_all(&ServerMessage::ParticipantLeft {
                        peer_id: peer_id.to_string(),
                        user_id,
                    });
                    room_now_empty = room.members.is_empty();
                }
            }
            if room_now_empty {
                // Re-check under the outer write lock; a join may have
                // slipped in.
                let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
                let still_empty = rooms.get(&room_id).map_or(false, |entry| {
                    entry
                        .try_write()
                        .map_or(false, |room| room.members.is_empty())
                });
                if still_empty {
                    rooms.remove(&room_id);
                } else {
                    room_now_empty = false;
                }
            }
        }
        if room_now_empty {
            self.routers.cleanup(&room_id).await;
            info!("Room {} is empty; router closed and records dropped", room_id);
        }

        self.metrics.inc_leaves();
        info!("Cleaned up peer {} (room {})", peer_id, room_id);
        true
    }

    /// Drains every room and closes the workers.
    pub async fn shutdown(&self) {
        info!("Shutting down room manager");
        for peer_id in self.peers.peer_ids() {
            self.cleanup_peer(&peer_id).await;
        }
        self.pool.shutdown().await;
    }
}
