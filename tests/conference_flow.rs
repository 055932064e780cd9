// End-to-end conference flows through the public RoomManager API, driven
// against the in-process engine with the event pump running.

use huddle::auth::create_join_token;
use huddle::engine::stub::StubEngine;
use huddle::engine::{AppData, MediaKind, ProducerId, RtpCapabilities, TransportDirection};
use huddle::media::{media_codecs, MediaConfig, WorkerPoolConfig};
use huddle::metrics::ServerMetrics;
use huddle::room::{events::spawn_event_pump, RoomManager, SignalError};
use huddle::signaling::protocol::{ConsumeReply, JoinReply, TransportReply};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const SECRET: &str = "integration-test-secret-0123456789abcdef";

struct Harness {
    engine: Arc<StubEngine>,
    manager: Arc<RoomManager>,
    _pump: tokio::task::JoinHandle<()>,
}

async fn harness() -> Harness {
    harness_with_workers(2).await
}

async fn harness_with_workers(num_workers: usize) -> Harness {
    let (engine, events) = StubEngine::new();
    let config = MediaConfig {
        workers: WorkerPoolConfig {
            num_workers,
            ..WorkerPoolConfig::default()
        },
        ..MediaConfig::default()
    };
    let manager = RoomManager::new(engine.clone(), config, SECRET, ServerMetrics::new())
        .await
        .expect("manager starts");
    let pump = spawn_event_pump(manager.clone(), events);
    Harness {
        engine,
        manager,
        _pump: pump,
    }
}

struct Client {
    peer_id: String,
    name: String,
    tx: mpsc::Sender<Arc<String>>,
    rx: mpsc::Receiver<Arc<String>>,
}

fn client(name: &str) -> Client {
    let (tx, rx) = mpsc::channel(64);
    Client {
        peer_id: format!("peer-{name}"),
        name: name.to_string(),
        tx,
        rx,
    }
}

fn token_for(client: &Client) -> String {
    create_join_token(&format!("user-{}", client.name), &client.name, SECRET).unwrap()
}

async fn join(harness: &Harness, client: &Client, room_id: &str) -> Result<JoinReply, SignalError> {
    harness
        .manager
        .join_room(
            &client.peer_id,
            &token_for(client),
            room_id,
            Some(client.name.clone()),
            client.tx.clone(),
        )
        .await
}

async fn create_transport(
    harness: &Harness,
    client: &Client,
    room_id: &str,
    direction: TransportDirection,
) -> TransportReply {
    harness
        .manager
        .create_transport(&client.peer_id, room_id, direction)
        .await
        .expect("transport created")
}

async fn produce(
    harness: &Harness,
    client: &Client,
    transport: &TransportReply,
    kind: MediaKind,
) -> ProducerId {
    harness
        .manager
        .produce(
            &client.peer_id,
            &transport.id,
            kind,
            Default::default(),
            AppData::new(),
        )
        .await
        .expect("producer created")
}

async fn consume(
    harness: &Harness,
    client: &Client,
    producer_id: &ProducerId,
) -> Result<ConsumeReply, SignalError> {
    harness
        .manager
        .consume(&client.peer_id, producer_id, full_caps())
        .await
}

fn full_caps() -> RtpCapabilities {
    RtpCapabilities {
        codecs: media_codecs(),
    }
}

/// Reads events off the client channel until one of the wanted type shows
/// up, skipping unrelated broadcasts (cross-path event order is
/// best-effort).
async fn expect_event(client: &mut Client, event_type: &str) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), client.rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {event_type}"))
            .expect("event channel closed");
        let value: Value = serde_json::from_str(&frame).unwrap();
        if value["type"] == event_type {
            return value;
        }
    }
}

/// Collects events until every listed type has been seen once. Broadcast
/// order across the direct and engine-event paths is unspecified, so tests
/// asserting on several events use this instead of a fixed order.
async fn expect_events(client: &mut Client, event_types: &[&str]) -> Vec<Value> {
    let mut found: Vec<Option<Value>> = vec![None; event_types.len()];
    while found.iter().any(Option::is_none) {
        let frame = tokio::time::timeout(Duration::from_secs(2), client.rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {event_types:?}"))
            .expect("event channel closed");
        let value: Value = serde_json::from_str(&frame).unwrap();
        for (i, wanted) in event_types.iter().enumerate() {
            if found[i].is_none() && value["type"] == *wanted {
                found[i] = Some(value);
                break;
            }
        }
    }
    found.into_iter().flatten().collect()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

// S1: the first joiner owns the room; later joiners see them.
#[tokio::test]
async fn first_joiner_is_owner() {
    let h = harness().await;
    let mut alice = client("Alice");
    let bob = client("Bob");

    let reply = join(&h, &alice, "room-a").await.unwrap();
    assert!(reply.is_owner);
    assert!(reply.participants.is_empty());
    assert!(reply.existing_producers.is_empty());
    assert_eq!(reply.peer_id, alice.peer_id);

    let reply = join(&h, &bob, "room-a").await.unwrap();
    assert!(!reply.is_owner);
    assert_eq!(reply.participants.len(), 1);
    assert_eq!(reply.participants[0].user_name, "Alice");
    assert!(reply.participants[0].is_owner);

    let joined = expect_event(&mut alice, "participantJoined").await;
    assert_eq!(joined["data"]["userName"], "Bob");
    assert_eq!(joined["data"]["peerId"], bob.peer_id);
}

// S2: a late joiner discovers existing streams and can consume them.
#[tokio::test]
async fn late_joiner_discovers_and_consumes_streams() {
    let h = harness().await;
    let alice = client("Alice");
    let bob = client("Bob");

    join(&h, &alice, "room-a").await.unwrap();
    let send = create_transport(&h, &alice, "room-a", TransportDirection::Send).await;
    let p1 = produce(&h, &alice, &send, MediaKind::Video).await;

    let reply = join(&h, &bob, "room-a").await.unwrap();
    assert_eq!(reply.existing_producers.len(), 1);
    let entry = &reply.existing_producers[0];
    assert_eq!(entry.producer_id, p1);
    assert_eq!(entry.peer_id, alice.peer_id);
    assert_eq!(entry.kind, MediaKind::Video);
    assert_eq!(entry.user_name, "Alice");

    create_transport(&h, &bob, "room-a", TransportDirection::Recv).await;
    let consumer = consume(&h, &bob, &p1).await.unwrap();
    assert_eq!(consumer.producer_id, p1);
    assert_eq!(consumer.kind, MediaKind::Video);
    assert!(!consumer.producer_paused);

    // Round trip finishes once the client resumes the paused consumer.
    h.manager
        .resume_consumer(&bob.peer_id, &consumer.id)
        .await
        .unwrap();
}

// S3: muting a producer pauses downstream consumers and clears the flag.
#[tokio::test]
async fn producer_pause_propagates_to_consumers() {
    let h = harness().await;
    let alice = client("Alice");
    let mut bob = client("Bob");

    join(&h, &alice, "room-a").await.unwrap();
    let send = create_transport(&h, &alice, "room-a", TransportDirection::Send).await;
    let p1 = produce(&h, &alice, &send, MediaKind::Audio).await;

    join(&h, &bob, "room-a").await.unwrap();
    create_transport(&h, &bob, "room-a", TransportDirection::Recv).await;
    let consumer = consume(&h, &bob, &p1).await.unwrap();

    h.manager
        .pause_producer(&alice.peer_id, &p1)
        .await
        .unwrap();

    let events = expect_events(&mut bob, &["consumerPaused", "producerPaused"]).await;
    assert_eq!(events[0]["data"]["consumerId"], consumer.id.as_str());
    assert_eq!(events[1]["data"]["producerId"], p1.as_str());

    let stats = h.manager.room_stats(&bob.peer_id, "room-a").await.unwrap();
    let alice_view = stats
        .participants
        .iter()
        .find(|p| p.peer_id == alice.peer_id)
        .unwrap();
    assert!(!alice_view.audio_enabled);

    // Unmute flows back the same way.
    h.manager
        .resume_producer(&alice.peer_id, &p1)
        .await
        .unwrap();
    expect_event(&mut bob, "consumerResumed").await;
}

// S4: a disconnect cascades to the other side's consumers, and the last
// leave collapses the room and its router.
#[tokio::test]
async fn disconnect_cascades_and_empty_room_collapses() {
    let h = harness().await;
    let alice = client("Alice");
    let mut bob = client("Bob");

    join(&h, &alice, "room-a").await.unwrap();
    let send = create_transport(&h, &alice, "room-a", TransportDirection::Send).await;
    let p1 = produce(&h, &alice, &send, MediaKind::Video).await;

    join(&h, &bob, "room-a").await.unwrap();
    create_transport(&h, &bob, "room-a", TransportDirection::Recv).await;
    let consumer = consume(&h, &bob, &p1).await.unwrap();

    let router_pid = h.manager.router_registry().get("room-a").unwrap().1;
    assert_eq!(h.manager.worker_pool().load_of(router_pid).unwrap().routers, 1);

    // Alice's channel dies.
    assert!(h.manager.cleanup_peer(&alice.peer_id).await);

    let events = expect_events(&mut bob, &["participantLeft", "consumerClosed"]).await;
    assert_eq!(events[0]["data"]["peerId"], alice.peer_id);
    assert_eq!(events[0]["data"]["userId"], "user-Alice");
    assert_eq!(events[1]["data"]["consumerId"], consumer.id.as_str());

    // Bob was the only peer left; his leave removes the room.
    h.manager.leave_room(&bob.peer_id).await.unwrap();
    assert!(!h.manager.has_room("room-a"));
    assert!(h.manager.router_registry().get("room-a").is_none());

    wait_until(|| h.manager.worker_pool().load_of(router_pid).unwrap().routers == 0).await;
    wait_until(|| {
        let (_, routers, transports, producers, consumers) = h.engine.live_counts();
        routers + transports + producers + consumers == 0
    })
    .await;

    let load = h.manager.worker_pool().load_of(router_pid).unwrap();
    assert_eq!((load.transports, load.producers, load.consumers), (0, 0, 0));
}

// S5: only the owner may end the meeting; when they do, everyone goes.
#[tokio::test]
async fn only_owner_may_end_meeting() {
    let h = harness().await;
    let alice = client("Alice");
    let mut bob = client("Bob");

    join(&h, &alice, "room-a").await.unwrap();
    join(&h, &bob, "room-a").await.unwrap();

    let err = h
        .manager
        .end_meeting(&bob.peer_id, "room-a")
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::NotOwner));
    assert_eq!(err.to_string(), "Only the host can end the meeting");

    h.manager
        .end_meeting(&alice.peer_id, "room-a")
        .await
        .unwrap();

    let ended = expect_event(&mut bob, "meetingEnded").await;
    assert_eq!(ended["data"]["reason"], "Host ended the meeting");

    assert_eq!(h.manager.peer_count(), 0);
    assert!(!h.manager.has_room("room-a"));
    assert!(!h.manager.has_peer(&alice.peer_id));
}

// S6: a killed worker is replaced after the back-off with the same port
// range; routers on other workers keep working.
#[tokio::test(start_paused = true)]
async fn worker_restart_keeps_port_range() {
    let h = harness_with_workers(3).await;
    let alice = client("Alice");

    join(&h, &alice, "room-a").await.unwrap();
    let (_, room_pid) = h.manager.router_registry().get("room-a").unwrap();

    let (victim_pid, victim_min, victim_max) = h
        .manager
        .worker_pool()
        .port_ranges()
        .into_iter()
        .find(|(pid, _, _)| *pid != room_pid)
        .unwrap();

    h.engine.kill_worker(victim_pid);
    tokio::time::sleep(Duration::from_millis(50)).await; // let the pump run
    assert_eq!(h.manager.worker_pool().worker_count(), 2);

    tokio::time::sleep(Duration::from_millis(2_100)).await;
    assert_eq!(h.manager.worker_pool().worker_count(), 3);
    let replacement = h
        .manager
        .worker_pool()
        .port_ranges()
        .into_iter()
        .find(|(_, min, max)| (*min, *max) == (victim_min, victim_max))
        .expect("replacement keeps the dead worker's port range");
    assert_ne!(replacement.0, victim_pid);

    // The surviving room is untouched.
    let send = create_transport(&h, &alice, "room-a", TransportDirection::Send).await;
    produce(&h, &alice, &send, MediaKind::Audio).await;
    assert_eq!(h.manager.worker_pool().load_of(room_pid).unwrap().routers, 1);
}

// S7: joins beyond the capacity are rejected.
#[tokio::test]
async fn full_room_rejects_joins() {
    let h = harness().await;
    h.manager.set_max_peers(2);

    join(&h, &client("A"), "room-a").await.unwrap();
    assert!(!h.manager.is_full("room-a").await);
    join(&h, &client("B"), "room-a").await.unwrap();
    assert!(h.manager.is_full("room-a").await);

    let err = join(&h, &client("C"), "room-a").await.unwrap_err();
    assert!(matches!(err, SignalError::RoomFull));
    assert_eq!(err.to_string(), "Room is full");
}

#[tokio::test]
async fn invalid_token_is_rejected() {
    let h = harness().await;
    let c = client("Mallory");
    let err = h
        .manager
        .join_room(&c.peer_id, "not-a-token", "room-a", None, c.tx.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::Unauthenticated));
    // Token verification happens before any room or router is created.
    assert!(!h.manager.has_room("room-a"));
    assert_eq!(h.manager.peer_count(), 0);
}

#[tokio::test]
async fn consume_requires_recv_transport_and_codec_match() {
    let h = harness().await;
    let alice = client("Alice");
    let bob = client("Bob");

    join(&h, &alice, "room-a").await.unwrap();
    let send = create_transport(&h, &alice, "room-a", TransportDirection::Send).await;
    let p1 = produce(&h, &alice, &send, MediaKind::Video).await;

    join(&h, &bob, "room-a").await.unwrap();

    // No recv transport yet.
    let err = consume(&h, &bob, &p1).await.unwrap_err();
    assert!(matches!(err, SignalError::NoRecvTransport));

    // Audio-only capabilities cannot consume a video producer.
    create_transport(&h, &bob, "room-a", TransportDirection::Recv).await;
    let audio_caps = RtpCapabilities {
        codecs: media_codecs()
            .into_iter()
            .filter(|c| c.kind == MediaKind::Audio)
            .collect(),
    };
    let err = h
        .manager
        .consume(&bob.peer_id, &p1, audio_caps)
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::CodecMismatch(_)));

    // Unknown producer fails the same gate.
    let err = consume(&h, &bob, &ProducerId::from("no-such-producer"))
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::CodecMismatch(_)));
}

#[tokio::test]
async fn handlers_require_a_registered_peer() {
    let h = harness().await;
    let ghost = client("Ghost");

    let err = h
        .manager
        .create_transport(&ghost.peer_id, "room-a", TransportDirection::Send)
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::PeerNotFound));
    assert_eq!(err.to_string(), "Peer not found");

    let err = h.manager.leave_room(&ghost.peer_id).await.unwrap_err();
    assert!(matches!(err, SignalError::PeerNotFound));
}

#[tokio::test]
async fn cleanup_is_idempotent() {
    let h = harness().await;
    let alice = client("Alice");
    join(&h, &alice, "room-a").await.unwrap();
    let send = create_transport(&h, &alice, "room-a", TransportDirection::Send).await;
    produce(&h, &alice, &send, MediaKind::Audio).await;

    assert!(h.manager.cleanup_peer(&alice.peer_id).await);
    assert!(!h.manager.cleanup_peer(&alice.peer_id).await);
    assert_eq!(h.manager.peer_count(), 0);
    assert!(!h.manager.has_room("room-a"));
}

// Producer close keeps the producer index in sync and notifies the room.
#[tokio::test]
async fn closing_a_producer_unregisters_and_notifies() {
    let h = harness().await;
    let alice = client("Alice");
    let mut bob = client("Bob");

    join(&h, &alice, "room-a").await.unwrap();
    let send = create_transport(&h, &alice, "room-a", TransportDirection::Send).await;
    let p1 = produce(&h, &alice, &send, MediaKind::Video).await;

    join(&h, &bob, "room-a").await.unwrap();

    h.manager
        .close_producer(&alice.peer_id, &p1)
        .await
        .unwrap();

    let closed = expect_event(&mut bob, "producerClosed").await;
    assert_eq!(closed["data"]["producerId"], p1.as_str());

    assert!(h
        .manager
        .router_registry()
        .others_of("room-a", &bob.peer_id)
        .is_empty());

    // Flag cleared in the public view.
    let stats = h.manager.room_stats(&bob.peer_id, "room-a").await.unwrap();
    let alice_view = stats
        .participants
        .iter()
        .find(|p| p.peer_id == alice.peer_id)
        .unwrap();
    assert!(!alice_view.video_enabled);
}

// Ownership never transfers: when the owner leaves without ending the
// meeting, the room continues and endMeeting becomes impossible.
#[tokio::test]
async fn ownership_does_not_transfer_on_owner_leave() {
    let h = harness().await;
    let alice = client("Alice");
    let bob = client("Bob");

    join(&h, &alice, "room-a").await.unwrap();
    join(&h, &bob, "room-a").await.unwrap();

    h.manager.leave_room(&alice.peer_id).await.unwrap();
    assert!(h.manager.has_room("room-a"));

    let err = h
        .manager
        .end_meeting(&bob.peer_id, "room-a")
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::NotOwner));
}

#[tokio::test]
async fn chat_reaches_everyone_including_sender() {
    let h = harness().await;
    let mut alice = client("Alice");
    let mut bob = client("Bob");

    join(&h, &alice, "room-a").await.unwrap();
    join(&h, &bob, "room-a").await.unwrap();

    h.manager
        .chat_message(&alice.peer_id, "hello there".into())
        .await
        .unwrap();

    let alice_peer_id = alice.peer_id.clone();
    for receiver in [&mut alice, &mut bob] {
        let chat = expect_event(receiver, "newChatMessage").await;
        assert_eq!(chat["data"]["message"], "hello there");
        assert_eq!(chat["data"]["userName"], "Alice");
        assert_eq!(chat["data"]["peerId"], alice_peer_id);
        assert!(chat["data"]["timestamp"].as_u64().unwrap() > 0);
    }
}

#[tokio::test]
async fn hand_raise_toggles_and_broadcasts() {
    let h = harness().await;
    let alice = client("Alice");
    let mut bob = client("Bob");

    join(&h, &alice, "room-a").await.unwrap();
    join(&h, &bob, "room-a").await.unwrap();

    assert!(h.manager.toggle_hand_raise(&alice.peer_id).await.unwrap());
    let raised = expect_event(&mut bob, "handRaiseChanged").await;
    assert_eq!(raised["data"]["peerId"], alice.peer_id);
    assert_eq!(raised["data"]["isHandRaised"], true);

    assert!(!h.manager.toggle_hand_raise(&alice.peer_id).await.unwrap());
}

#[tokio::test]
async fn room_stats_report_members_and_producers() {
    let h = harness().await;
    let alice = client("Alice");
    let bob = client("Bob");

    join(&h, &alice, "room-a").await.unwrap();
    let send = create_transport(&h, &alice, "room-a", TransportDirection::Send).await;
    produce(&h, &alice, &send, MediaKind::Audio).await;
    join(&h, &bob, "room-a").await.unwrap();

    let reply = h.manager.room_stats(&bob.peer_id, "room-a").await.unwrap();
    assert_eq!(reply.stats.peer_count, 2);
    assert_eq!(reply.stats.producer_count, 1);
    assert!(reply.stats.created_at > 0);
    assert_eq!(reply.participants.len(), 2);
}

#[tokio::test]
async fn simulcast_layer_selection_applies() {
    let h = harness().await;
    let alice = client("Alice");
    let bob = client("Bob");

    join(&h, &alice, "room-a").await.unwrap();
    let send = create_transport(&h, &alice, "room-a", TransportDirection::Send).await;
    let p1 = produce(&h, &alice, &send, MediaKind::Video).await;

    join(&h, &bob, "room-a").await.unwrap();
    create_transport(&h, &bob, "room-a", TransportDirection::Recv).await;
    let consumer = consume(&h, &bob, &p1).await.unwrap();

    h.manager
        .set_consumer_preferred_layers(&bob.peer_id, &consumer.id, 1, Some(2))
        .await
        .unwrap();

    let err = h
        .manager
        .set_consumer_preferred_layers(&bob.peer_id, &huddle::engine::ConsumerId::from("nope"), 0, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::ConsumerNotFound(_)));
}
