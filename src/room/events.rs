#![forbid(unsafe_code)]

// Engine event pump.
//
// All engine-originated signals arrive on one channel and are applied here,
// in arrival order: registry bookkeeping, load-counter decrements, and the
// client notifications that mirror each signal. Running the mutations on
// the dispatcher side of the channel keeps close-time reentrancy out of the
// engine callbacks.

use crate::engine::{DtlsState, EngineEvent, IceState};
use crate::media::worker_pool::LoadCounter;
use crate::room::RoomManager;
use crate::signaling::protocol::ServerMessage;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Spawns the pump task. It ends when the engine drops its event sender.
pub fn spawn_event_pump(
    manager: Arc<RoomManager>,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            manager.handle_engine_event(event).await;
        }
        debug!("Engine event channel closed; pump exiting");
    })
}

impl RoomManager {
    pub(crate) async fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::WorkerDied { pid } => {
                self.metrics().inc_worker_restarts();
                self.worker_pool().clone().handle_worker_died(pid);
            }

            EngineEvent::RouterClosed { router_id } => {
                if let Some((room_id, worker_pid)) = self.router_registry().take_router_index(&router_id)
                {
                    self.worker_pool()
                        .update_load(worker_pid, LoadCounter::Routers, -1);
                    if self.router_registry().get(&room_id).is_some() {
                        // Router died under a live room; operations against
                        // it will surface engine errors until the room
                        // drains.
                        warn!("Router for room {} closed while the room is live", room_id);
                    } else {
                        info!("Router for room {} closed", room_id);
                    }
                }
            }

            EngineEvent::TransportClosed { transport_id } => {
                if let Some(owner) = self.take_transport_ref(&transport_id) {
                    self.worker_pool()
                        .update_load(owner.worker_pid, LoadCounter::Transports, -1);
                    if let Some(peer_lock) = self.peers.get(&owner.peer_id) {
                        let mut peer = peer_lock.lock().await;
                        peer.remove_transport(&transport_id);
                    }
                    debug!(
                        "Transport {} of peer {} closed",
                        transport_id, owner.peer_id
                    );
                }
            }

            EngineEvent::TransportDtlsStateChanged { transport_id, state } => {
                match state {
                    DtlsState::Failed | DtlsState::Closed => {
                        warn!(
                            "DTLS {:?} on transport {}; closing transport",
                            state, transport_id
                        );
                        // Close via the owning peer's handle; the close
                        // signal does the bookkeeping.
                        if let Some(owner) = self.transport_ref(&transport_id) {
                            if let Some(peer_lock) = self.peers.get(&owner.peer_id) {
                                let transport = peer_lock.lock().await.transport(&transport_id);
                                if let Some(transport) = transport {
                                    if let Err(e) = transport.close().await {
                                        warn!(
                                            "Failed to close transport {} after DTLS {:?}: {e}",
                                            transport_id, state
                                        );
                                    }
                                }
                            }
                        }
                    }
                    _ => debug!("DTLS {:?} on transport {}", state, transport_id),
                }
            }

            EngineEvent::TransportIceStateChanged { transport_id, state } => match state {
                IceState::Disconnected | IceState::Closed => {
                    warn!("ICE {:?} on transport {}", state, transport_id);
                }
                _ => debug!("ICE {:?} on transport {}", state, transport_id),
            },

            EngineEvent::ProducerClosed { producer_id } => {
                if let Some(owner) = self.take_producer_ref(&producer_id) {
                    self.worker_pool()
                        .update_load(owner.worker_pid, LoadCounter::Producers, -1);
                    self.router_registry()
                        .unregister(&owner.room_id, &producer_id);
                    if let Some(peer_lock) = self.peers.get(&owner.peer_id) {
                        let mut peer = peer_lock.lock().await;
                        peer.producers.remove(&producer_id);
                    }
                    self.to_room_except_sender(
                        &owner.room_id,
                        &owner.peer_id,
                        &ServerMessage::ProducerClosed {
                            producer_id,
                            peer_id: owner.peer_id.clone(),
                        },
                    )
                    .await;
                }
            }

            EngineEvent::ConsumerClosed { consumer_id } => {
                // The consumer's own transport went away; just drop it.
                if let Some(owner) = self.take_consumer_ref(&consumer_id) {
                    self.worker_pool()
                        .update_load(owner.worker_pid, LoadCounter::Consumers, -1);
                    if let Some(peer_lock) = self.peers.get(&owner.peer_id) {
                        let mut peer = peer_lock.lock().await;
                        peer.consumers.remove(&consumer_id);
                    }
                }
            }

            EngineEvent::ConsumerProducerClosed { consumer_id } => {
                // The upstream producer vanished; tell the subscriber.
                if let Some(owner) = self.take_consumer_ref(&consumer_id) {
                    self.worker_pool()
                        .update_load(owner.worker_pid, LoadCounter::Consumers, -1);
                    if let Some(peer_lock) = self.peers.get(&owner.peer_id) {
                        let mut peer = peer_lock.lock().await;
                        peer.consumers.remove(&consumer_id);
                    }
                    self.send_to_peer(
                        &owner.peer_id,
                        &ServerMessage::ConsumerClosed { consumer_id },
                    )
                    .await;
                }
            }

            EngineEvent::ConsumerProducerPaused { consumer_id } => {
                if let Some(owner) = self.consumer_ref(&consumer_id) {
                    self.send_to_peer(
                        &owner.peer_id,
                        &ServerMessage::ConsumerPaused { consumer_id },
                    )
                    .await;
                }
            }

            EngineEvent::ConsumerProducerResumed { consumer_id } => {
                if let Some(owner) = self.consumer_ref(&consumer_id) {
                    self.send_to_peer(
                        &owner.peer_id,
                        &ServerMessage::ConsumerResumed { consumer_id },
                    )
                    .await;
                }
            }
        }
    }
}
