#![forbid(unsafe_code)]

// Router registry: one media router per room, plus the per-room producer
// index used to tell late joiners what they can consume.

use crate::engine::{
    EngineError, MediaKind, ProducerId, RouterId, RtcRouter,
};
use crate::media::config::media_codecs;
use crate::media::worker_pool::{LoadCounter, NoWorkersAvailable, WorkerPool};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RouterCreateError {
    #[error(transparent)]
    NoWorkers(#[from] NoWorkersAvailable),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// One entry of a room's producer index.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerEntry {
    pub producer_id: ProducerId,
    pub peer_id: String,
    pub kind: MediaKind,
    pub user_name: String,
}

struct RoomRouter {
    router: Arc<dyn RtcRouter>,
    worker_pid: u32,
    producers: HashMap<ProducerId, ProducerEntry>,
    created_at: SystemTime,
    created: Instant,
}

/// Maps room id → router + owning worker + live producer index. Locks are
/// held only for map access, never across engine calls.
pub struct RouterRegistry {
    pool: Arc<WorkerPool>,
    rooms: StdMutex<HashMap<String, RoomRouter>>,
    // router id → (room id, worker pid); survives `cleanup` so the event
    // pump can attribute the router-closed signal, which removes it.
    router_index: StdMutex<HashMap<RouterId, (String, u32)>>,
}

impl RouterRegistry {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            rooms: StdMutex::new(HashMap::new()),
            router_index: StdMutex::new(HashMap::new()),
        }
    }

    fn rooms_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RoomRouter>> {
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the room's router, creating it on the least-loaded worker on
    /// first use. Concurrent calls for the same room yield the same router.
    pub async fn get_or_create(
        &self,
        room_id: &str,
    ) -> Result<(Arc<dyn RtcRouter>, u32), RouterCreateError> {
        if let Some(existing) = self.get(room_id) {
            return Ok(existing);
        }

        let worker = self.pool.least_loaded()?;
        let worker_pid = worker.pid();
        let router = worker.create_router(media_codecs()).await?;
        let router_id = router.id();

        let raced = {
            let mut rooms = self.rooms_lock();
            match rooms.get(room_id) {
                Some(entry) => Some((entry.router.clone(), entry.worker_pid)),
                None => {
                    rooms.insert(
                        room_id.to_string(),
                        RoomRouter {
                            router: router.clone(),
                            worker_pid,
                            producers: HashMap::new(),
                            created_at: SystemTime::now(),
                            created: Instant::now(),
                        },
                    );
                    None
                }
            }
        };

        if let Some(existing) = raced {
            // Lost the creation race; discard the extra router.
            debug!("Discarding duplicate router for room {}", room_id);
            if let Err(e) = router.close().await {
                warn!("Failed to close duplicate router for room {}: {e}", room_id);
            }
            return Ok(existing);
        }

        self.router_index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(router_id.clone(), (room_id.to_string(), worker_pid));
        self.pool.update_load(worker_pid, LoadCounter::Routers, 1);
        info!(
            "Created router {} for room {} on worker {}",
            router_id, room_id, worker_pid
        );
        Ok((router, worker_pid))
    }

    /// Pure lookup.
    pub fn get(&self, room_id: &str) -> Option<(Arc<dyn RtcRouter>, u32)> {
        self.rooms_lock()
            .get(room_id)
            .map(|entry| (entry.router.clone(), entry.worker_pid))
    }

    /// Closes the room's router (the engine cascades to everything on it),
    /// dropping the producer index and the room entry with it.
    pub async fn cleanup(&self, room_id: &str) {
        let entry = self.rooms_lock().remove(room_id);
        if let Some(entry) = entry {
            info!(
                "Closing router for room {} on worker {}",
                room_id, entry.worker_pid
            );
            if let Err(e) = entry.router.close().await {
                warn!("Failed to close router for room {}: {e}", room_id);
            }
        }
    }

    /// Records a live producer in the room's index.
    pub fn register(
        &self,
        room_id: &str,
        producer_id: ProducerId,
        peer_id: &str,
        kind: MediaKind,
        user_name: &str,
    ) {
        let mut rooms = self.rooms_lock();
        if let Some(entry) = rooms.get_mut(room_id) {
            entry.producers.insert(
                producer_id.clone(),
                ProducerEntry {
                    producer_id,
                    peer_id: peer_id.to_string(),
                    kind,
                    user_name: user_name.to_string(),
                },
            );
        }
    }

    /// Drops a producer from the room's index; unknown ids are ignored.
    pub fn unregister(&self, room_id: &str, producer_id: &ProducerId) {
        let mut rooms = self.rooms_lock();
        if let Some(entry) = rooms.get_mut(room_id) {
            entry.producers.remove(producer_id);
        }
    }

    /// Producer entries of everyone but `exclude_peer_id`.
    pub fn others_of(&self, room_id: &str, exclude_peer_id: &str) -> Vec<ProducerEntry> {
        self.rooms_lock()
            .get(room_id)
            .map(|entry| {
                entry
                    .producers
                    .values()
                    .filter(|p| p.peer_id != exclude_peer_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn producer_count(&self, room_id: &str) -> usize {
        self.rooms_lock()
            .get(room_id)
            .map(|entry| entry.producers.len())
            .unwrap_or(0)
    }

    /// Creation time and uptime of the room's router.
    pub fn room_age(&self, room_id: &str) -> Option<(SystemTime, Duration)> {
        self.rooms_lock()
            .get(room_id)
            .map(|entry| (entry.created_at, entry.created.elapsed()))
    }

    pub fn room_count(&self) -> usize {
        self.rooms_lock().len()
    }

    /// Resolves a router id to its room and worker without removing it.
    pub fn room_for_router(&self, router_id: &RouterId) -> Option<(String, u32)> {
        self.router_index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(router_id)
            .cloned()
    }

    /// Removes the router attribution entry; called by the event pump when
    /// the engine announces the router closed.
    pub fn take_router_index(&self, router_id: &RouterId) -> Option<(String, u32)> {
        self.router_index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(router_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::stub::StubEngine;
    use crate::media::config::WorkerPoolConfig;

    async fn registry() -> (Arc<StubEngine>, Arc<WorkerPool>, RouterRegistry) {
        let (engine, _rx) = StubEngine::new();
        let pool = WorkerPool::start(
            engine.clone(),
            WorkerPoolConfig {
                num_workers: 2,
                ..WorkerPoolConfig::default()
            },
        )
        .await
        .unwrap();
        let reg = RouterRegistry::new(pool.clone());
        (engine, pool, reg)
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let (_engine, pool, reg) = registry().await;
        let (router_a, pid_a) = reg.get_or_create("room-1").await.unwrap();
        let (router_b, pid_b) = reg.get_or_create("room-1").await.unwrap();
        assert_eq!(router_a.id(), router_b.id());
        assert_eq!(pid_a, pid_b);
        assert_eq!(pool.load_of(pid_a).unwrap().routers, 1);
    }

    #[tokio::test]
    async fn rooms_spread_across_workers_by_load() {
        let (_engine, _pool, reg) = registry().await;
        let (_, pid_a) = reg.get_or_create("room-1").await.unwrap();
        let (_, pid_b) = reg.get_or_create("room-2").await.unwrap();
        assert_ne!(pid_a, pid_b);
    }

    #[tokio::test]
    async fn producer_index_filters_by_peer() {
        let (_engine, _pool, reg) = registry().await;
        reg.get_or_create("room-1").await.unwrap();

        reg.register("room-1", ProducerId::from("p1"), "alice", MediaKind::Audio, "Alice");
        reg.register("room-1", ProducerId::from("p2"), "bob", MediaKind::Video, "Bob");

        let others = reg.others_of("room-1", "alice");
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].peer_id, "bob");
        assert_eq!(others[0].kind, MediaKind::Video);

        reg.unregister("room-1", &ProducerId::from("p2"));
        assert!(reg.others_of("room-1", "alice").is_empty());
        assert_eq!(reg.producer_count("room-1"), 1);
    }

    #[tokio::test]
    async fn cleanup_closes_router_and_drops_index() {
        let (engine, _pool, reg) = registry().await;
        let (router, _) = reg.get_or_create("room-1").await.unwrap();
        reg.register("room-1", ProducerId::from("p1"), "alice", MediaKind::Audio, "Alice");

        reg.cleanup("room-1").await;

        assert!(reg.get("room-1").is_none());
        assert_eq!(reg.producer_count("room-1"), 0);
        let (_, routers, _, _, _) = engine.live_counts();
        assert_eq!(routers, 0);
        // Attribution survives until the close event is pumped.
        assert!(reg.room_for_router(&router.id()).is_some());
    }
}
