#![forbid(unsafe_code)]

// Per-peer state: one `Peer` per connected client, owning that client's
// engine handles.

use crate::engine::{ConsumerId, ProducerId, RtcConsumer, RtcProducer, RtcTransport, TransportId};
use crate::signaling::protocol::ParticipantView;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Toggleable media state, surfaced to the room in the public view.
#[derive(Debug, Clone, Copy, Default)]
pub struct MediaFlags {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub hand_raised: bool,
    pub is_owner: bool,
}

/// One connected client's server-side state. Owned by the registry behind a
/// per-peer async mutex; a peer belongs to at most one room at a time.
pub struct Peer {
    pub peer_id: String,
    pub user_id: String,
    pub user_name: String,
    pub room_id: String,
    pub sender: mpsc::Sender<Arc<String>>,
    pub send_transports: HashMap<TransportId, Arc<dyn RtcTransport>>,
    pub recv_transports: HashMap<TransportId, Arc<dyn RtcTransport>>,
    // Creation order of recv transports; consume picks the newest live one.
    recv_order: Vec<TransportId>,
    pub producers: HashMap<ProducerId, Arc<dyn RtcProducer>>,
    pub consumers: HashMap<ConsumerId, Arc<dyn RtcConsumer>>,
    pub flags: MediaFlags,
    pub joined_at: u64,
}

impl Peer {
    pub fn new(
        peer_id: String,
        user_id: String,
        user_name: String,
        room_id: String,
        sender: mpsc::Sender<Arc<String>>,
        is_owner: bool,
    ) -> Self {
        Self {
            peer_id,
            user_id,
            user_name,
            room_id,
            sender,
            send_transports: HashMap::new(),
            recv_transports: HashMap::new(),
            recv_order: Vec::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            flags: MediaFlags {
                is_owner,
                ..MediaFlags::default()
            },
            joined_at: unix_millis(),
        }
    }

    /// The peer as other participants see it.
    pub fn view(&self) -> ParticipantView {
        ParticipantView {
            socket_id: self.peer_id.clone(),
            peer_id: self.peer_id.clone(),
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            audio_enabled: self.flags.audio_enabled,
            video_enabled: self.flags.video_enabled,
            screen_sharing: self.flags.screen_sharing,
            hand_raised: self.flags.hand_raised,
            joined_at: self.joined_at,
            is_owner: self.flags.is_owner,
        }
    }

    pub fn add_recv_transport(&mut self, transport: Arc<dyn RtcTransport>) {
        let id = transport.id();
        self.recv_order.push(id.clone());
        self.recv_transports.insert(id, transport);
    }

    /// Looks a transport up in either direction map.
    pub fn transport(&self, transport_id: &TransportId) -> Option<Arc<dyn RtcTransport>> {
        self.send_transports
            .get(transport_id)
            .or_else(|| self.recv_transports.get(transport_id))
            .cloned()
    }

    /// The most recently created recv transport still alive.
    pub fn latest_recv_transport(&self) -> Option<Arc<dyn RtcTransport>> {
        self.recv_order
            .iter()
            .rev()
            .find_map(|id| self.recv_transports.get(id))
            .cloned()
    }

    /// Drops a transport from whichever map holds it.
    pub fn remove_transport(&mut self, transport_id: &TransportId) {
        self.send_transports.remove(transport_id);
        if self.recv_transports.remove(transport_id).is_some() {
            self.recv_order.retain(|id| id != transport_id);
        }
    }
}

/// Registry of connected peers. The outer map is behind a std RwLock held
/// only for brief lookups; each peer has its own tokio mutex held across
/// engine calls.
pub struct PeerRegistry {
    peers: StdRwLock<HashMap<String, Arc<TokioMutex<Peer>>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: StdRwLock::new(HashMap::new()),
        }
    }

    /// Registers a peer, replacing any stale entry under the same id.
    pub fn insert(&self, peer: Peer) -> Arc<TokioMutex<Peer>> {
        let id = peer.peer_id.clone();
        let entry = Arc::new(TokioMutex::new(peer));
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, entry.clone());
        entry
    }

    pub fn get(&self, peer_id: &str) -> Option<Arc<TokioMutex<Peer>>> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer_id)
            .cloned()
    }

    /// Atomically removes and returns the peer entry. Cleanup goes through
    /// this, which is what makes it idempotent.
    pub fn take(&self, peer_id: &str) -> Option<Arc<TokioMutex<Peer>>> {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::stub::StubEngine;
    use crate::engine::{MediaEngine, WebRtcTransportOptions};
    use crate::media::config::{media_codecs, WorkerPoolConfig};

    fn peer() -> Peer {
        let (tx, _rx) = mpsc::channel(8);
        Peer::new(
            "peer-1".into(),
            "user-1".into(),
            "Alice".into(),
            "room-a".into(),
            tx,
            true,
        )
    }

    #[test]
    fn view_hides_internals_and_carries_flags() {
        let mut p = peer();
        p.flags.audio_enabled = true;
        let view = p.view();
        assert_eq!(view.peer_id, "peer-1");
        assert_eq!(view.socket_id, "peer-1");
        assert_eq!(view.user_name, "Alice");
        assert!(view.audio_enabled);
        assert!(view.is_owner);
        assert!(!view.video_enabled);
    }

    #[tokio::test]
    async fn newest_live_recv_transport_wins() {
        let (engine, _rx) = StubEngine::new();
        let settings = WorkerPoolConfig::default().settings_for(0);
        let worker = engine.create_worker(settings).await.unwrap();
        let router = worker.create_router(media_codecs()).await.unwrap();

        let mut p = peer();
        let first = router
            .create_webrtc_transport(WebRtcTransportOptions::default())
            .await
            .unwrap();
        let second = router
            .create_webrtc_transport(WebRtcTransportOptions::default())
            .await
            .unwrap();
        p.add_recv_transport(first.clone());
        p.add_recv_transport(second.clone());

        assert_eq!(p.latest_recv_transport().unwrap().id(), second.id());

        p.remove_transport(&second.id());
        assert_eq!(p.latest_recv_transport().unwrap().id(), first.id());
    }

    #[test]
    fn take_is_idempotent() {
        let registry = PeerRegistry::new();
        registry.insert(peer());
        assert!(registry.take("peer-1").is_some());
        assert!(registry.take("peer-1").is_none());
        assert!(registry.is_empty());
    }
}
