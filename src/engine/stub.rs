#![forbid(unsafe_code)]

// In-process media engine.
//
// Implements the full capability surface with the same ownership and
// close-cascade semantics as a real SFU engine: closing a worker closes its
// routers, a router its transports, a transport its producers and consumers,
// and a producer the consumers forwarding from it. Every closed entity is
// announced exactly once on the event channel. No media flows; negotiation
// payloads are fabricated. Used by the test suite and local development;
// production deployments plug a real engine binding behind `MediaEngine`.

use super::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Weak;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Default)]
struct EngineState {
    workers: HashMap<u32, WorkerState>,
    routers: HashMap<RouterId, RouterState>,
    transports: HashMap<TransportId, TransportState>,
    producers: HashMap<ProducerId, ProducerState>,
    consumers: HashMap<ConsumerId, ConsumerState>,
}

struct WorkerState {
    rtc_min_port: u16,
    routers: Vec<RouterId>,
}

struct RouterState {
    worker_pid: u32,
    codecs: Vec<RtpCodecCapability>,
    transports: Vec<TransportId>,
}

struct TransportState {
    router_id: RouterId,
    connected: bool,
    max_incoming_bitrate: Option<u32>,
    producers: Vec<ProducerId>,
    consumers: Vec<ConsumerId>,
}

struct ProducerState {
    transport_id: TransportId,
    kind: MediaKind,
    paused: bool,
    consumers: Vec<ConsumerId>,
}

struct ConsumerState {
    transport_id: TransportId,
    producer_id: ProducerId,
    paused: bool,
    preferred_layers: Option<ConsumerLayers>,
}

pub struct StubEngine {
    state: StdMutex<EngineState>,
    events: mpsc::UnboundedSender<EngineEvent>,
    next_pid: AtomicU32,
    fail_worker_creation: AtomicBool,
    // Handles keep the engine alive through strong Arcs; this weak
    // self-reference lets trait methods taking `&self` mint them.
    weak_self: Weak<StubEngine>,
}

impl StubEngine {
    /// Creates the engine and hands back the event stream the dispatcher's
    /// pump consumes.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Arc::new_cyclic(|weak| Self {
            state: StdMutex::new(EngineState::default()),
            events: tx,
            next_pid: AtomicU32::new(1000),
            fail_worker_creation: AtomicBool::new(false),
            weak_self: weak.clone(),
        });
        (engine, rx)
    }

    fn handle(&self) -> Arc<StubEngine> {
        // Only reachable from a method invoked through an Arc, so the
        // upgrade cannot fail.
        self.weak_self.upgrade().expect("engine dropped while in use")
    }

    fn emit(&self, events: Vec<EngineEvent>) {
        for event in events {
            // Receiver may be gone during shutdown.
            let _ = self.events.send(event);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Test hook: simulate a worker process crash. Emits `WorkerDied` and
    /// cascades closure of everything the worker hosted.
    pub fn kill_worker(&self, pid: u32) {
        let mut events = vec![EngineEvent::WorkerDied { pid }];
        {
            let mut state = self.lock();
            close_worker(&mut state, pid, &mut events);
        }
        self.emit(events);
    }

    /// Test hook: make subsequent `create_worker` calls fail.
    pub fn set_worker_creation_fails(&self, fail: bool) {
        self.fail_worker_creation.store(fail, Ordering::SeqCst);
    }

    /// Test hook: inject a DTLS state change on a transport.
    pub fn set_dtls_state(&self, transport_id: &TransportId, state: DtlsState) {
        self.emit(vec![EngineEvent::TransportDtlsStateChanged {
            transport_id: transport_id.clone(),
            state,
        }]);
    }

    /// Test hook: live entity counts (workers, routers, transports,
    /// producers, consumers).
    pub fn live_counts(&self) -> (usize, usize, usize, usize, usize) {
        let state = self.lock();
        (
            state.workers.len(),
            state.routers.len(),
            state.transports.len(),
            state.producers.len(),
            state.consumers.len(),
        )
    }
}

// Cascades operate on the locked state and collect events; callers send the
// events after releasing the lock.

fn close_worker(state: &mut EngineState, pid: u32, events: &mut Vec<EngineEvent>) {
    if let Some(worker) = state.workers.remove(&pid) {
        for router_id in worker.routers {
            close_router(state, &router_id, events);
        }
    }
}

fn close_router(state: &mut EngineState, router_id: &RouterId, events: &mut Vec<EngineEvent>) {
    if let Some(router) = state.routers.remove(router_id) {
        if let Some(worker) = state.workers.get_mut(&router.worker_pid) {
            worker.routers.retain(|r| r != router_id);
        }
        for transport_id in router.transports {
            close_transport(state, &transport_id, events);
        }
        events.push(EngineEvent::RouterClosed {
            router_id: router_id.clone(),
        });
    }
}

fn close_transport(state: &mut EngineState, transport_id: &TransportId, events: &mut Vec<EngineEvent>) {
    if let Some(transport) = state.transports.remove(transport_id) {
        if let Some(router) = state.routers.get_mut(&transport.router_id) {
            router.transports.retain(|t| t != transport_id);
        }
        for producer_id in transport.producers {
            close_producer(state, &producer_id, events);
        }
        for consumer_id in transport.consumers {
            close_consumer(state, &consumer_id, events);
        }
        events.push(EngineEvent::TransportClosed {
            transport_id: transport_id.clone(),
        });
    }
}

fn close_producer(state: &mut EngineState, producer_id: &ProducerId, events: &mut Vec<EngineEvent>) {
    if let Some(producer) = state.producers.remove(producer_id) {
        if let Some(transport) = state.transports.get_mut(&producer.transport_id) {
            transport.producers.retain(|p| p != producer_id);
        }
        for consumer_id in producer.consumers {
            if let Some(consumer) = state.consumers.remove(&consumer_id) {
                if let Some(transport) = state.transports.get_mut(&consumer.transport_id) {
                    transport.consumers.retain(|c| c != &consumer_id);
                }
                events.push(EngineEvent::ConsumerProducerClosed { consumer_id });
            }
        }
        events.push(EngineEvent::ProducerClosed {
            producer_id: producer_id.clone(),
        });
    }
}

fn close_consumer(state: &mut EngineState, consumer_id: &ConsumerId, events: &mut Vec<EngineEvent>) {
    if let Some(consumer) = state.consumers.remove(consumer_id) {
        if let Some(transport) = state.transports.get_mut(&consumer.transport_id) {
            transport.consumers.retain(|c| c != consumer_id);
        }
        if let Some(producer) = state.producers.get_mut(&consumer.producer_id) {
            producer.consumers.retain(|c| c != consumer_id);
        }
        events.push(EngineEvent::ConsumerClosed {
            consumer_id: consumer_id.clone(),
        });
    }
}

#[async_trait]
impl MediaEngine for StubEngine {
    async fn create_worker(&self, settings: WorkerSettings) -> EngineResult<Arc<dyn RtcWorker>> {
        if self.fail_worker_creation.load(Ordering::SeqCst) {
            return Err(EngineError::Worker("worker process failed to start".into()));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.lock().workers.insert(
            pid,
            WorkerState {
                rtc_min_port: settings.rtc_min_port,
                routers: Vec::new(),
            },
        );
        Ok(Arc::new(StubWorker {
            engine: self.handle(),
            pid,
        }))
    }
}

struct StubWorker {
    engine: Arc<StubEngine>,
    pid: u32,
}

#[async_trait]
impl RtcWorker for StubWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn create_router(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> EngineResult<Arc<dyn RtcRouter>> {
        let router_id = RouterId::generate();
        {
            let mut state = self.engine.lock();
            let worker = state
                .workers
                .get_mut(&self.pid)
                .ok_or_else(|| EngineError::Worker(format!("worker {} is gone", self.pid)))?;
            worker.routers.push(router_id.clone());
            state.routers.insert(
                router_id.clone(),
                RouterState {
                    worker_pid: self.pid,
                    codecs: media_codecs.clone(),
                    transports: Vec::new(),
                },
            );
        }
        Ok(Arc::new(StubRouter {
            engine: self.engine.clone(),
            id: router_id,
            codecs: media_codecs,
        }))
    }

    async fn close(&self) -> EngineResult<()> {
        let mut events = Vec::new();
        {
            let mut state = self.engine.lock();
            close_worker(&mut state, self.pid, &mut events);
        }
        self.engine.emit(events);
        Ok(())
    }
}

struct StubRouter {
    engine: Arc<StubEngine>,
    id: RouterId,
    codecs: Vec<RtpCodecCapability>,
}

#[async_trait]
impl RtcRouter for StubRouter {
    fn id(&self) -> RouterId {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        RtpCapabilities {
            codecs: self.codecs.clone(),
        }
    }

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn RtcTransport>> {
        let transport_id = TransportId::generate();
        let candidate_port;
        {
            let mut state = self.engine.lock();
            let worker_pid = state
                .routers
                .get(&self.id)
                .ok_or_else(|| EngineError::Router(format!("router {} is closed", self.id)))?
                .worker_pid;
            candidate_port = state
                .workers
                .get(&worker_pid)
                .map(|w| w.rtc_min_port)
                .unwrap_or(0);
            if let Some(router) = state.routers.get_mut(&self.id) {
                router.transports.push(transport_id.clone());
            }
            state.transports.insert(
                transport_id.clone(),
                TransportState {
                    router_id: self.id.clone(),
                    connected: false,
                    max_incoming_bitrate: None,
                    producers: Vec::new(),
                    consumers: Vec::new(),
                },
            );
        }

        let address = options
            .announced_address
            .clone()
            .unwrap_or_else(|| options.listen_ip.to_string());

        Ok(Arc::new(StubTransport {
            engine: self.engine.clone(),
            id: transport_id,
            ice_parameters: IceParameters {
                username_fragment: short_token(),
                password: short_token(),
                ice_lite: true,
            },
            ice_candidates: fabricate_candidates(&options, address, candidate_port),
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".into(),
                    value: short_token(),
                }],
            },
        }))
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let state = self.engine.lock();
        match state.producers.get(producer_id) {
            Some(producer) => rtp_capabilities.supports_kind(producer.kind),
            None => false,
        }
    }

    async fn close(&self) -> EngineResult<()> {
        let mut events = Vec::new();
        {
            let mut state = self.engine.lock();
            close_router(&mut state, &self.id, &mut events);
        }
        self.engine.emit(events);
        Ok(())
    }
}

fn short_token() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

fn fabricate_candidates(
    options: &WebRtcTransportOptions,
    address: String,
    port: u16,
) -> Vec<IceCandidate> {
    let mut candidates = Vec::new();
    if options.enable_udp {
        candidates.push(IceCandidate {
            foundation: "udpcandidate".into(),
            priority: 1_076_302_079,
            address: address.clone(),
            protocol: TransportProtocol::Udp,
            port,
            candidate_type: "host".into(),
        });
    }
    if options.enable_tcp {
        candidates.push(IceCandidate {
            foundation: "tcpcandidate".into(),
            priority: if options.prefer_udp { 1_076_091_903 } else { 1_076_302_079 },
            address,
            protocol: TransportProtocol::Tcp,
            port,
            candidate_type: "host".into(),
        });
    }
    candidates
}

struct StubTransport {
    engine: Arc<StubEngine>,
    id: TransportId,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
}

#[async_trait]
impl RtcTransport for StubTransport {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls_parameters.clone()
    }

    fn sctp_parameters(&self) -> Option<SctpParameters> {
        None
    }

    async fn connect(&self, _dtls_parameters: DtlsParameters) -> EngineResult<()> {
        {
            let mut state = self.engine.lock();
            let transport = state
                .transports
                .get_mut(&self.id)
                .ok_or_else(|| EngineError::Transport(format!("transport {} is closed", self.id)))?;
            if transport.connected {
                return Err(EngineError::Transport("transport already connected".into()));
            }
            transport.connected = true;
        }
        self.engine.emit(vec![EngineEvent::TransportDtlsStateChanged {
            transport_id: self.id.clone(),
            state: DtlsState::Connected,
        }]);
        Ok(())
    }

    async fn produce(&self, options: ProducerOptions) -> EngineResult<Arc<dyn RtcProducer>> {
        let producer_id = ProducerId::generate();
        {
            let mut state = self.engine.lock();
            let transport = state
                .transports
                .get_mut(&self.id)
                .ok_or_else(|| EngineError::Transport(format!("transport {} is closed", self.id)))?;
            transport.producers.push(producer_id.clone());
            state.producers.insert(
                producer_id.clone(),
                ProducerState {
                    transport_id: self.id.clone(),
                    kind: options.kind,
                    paused: false,
                    consumers: Vec::new(),
                },
            );
        }
        Ok(Arc::new(StubProducer {
            engine: self.engine.clone(),
            id: producer_id,
            kind: options.kind,
            rtp_parameters: options.rtp_parameters,
            app_data: options.app_data,
        }))
    }

    async fn consume(&self, options: ConsumerOptions) -> EngineResult<Arc<dyn RtcConsumer>> {
        let consumer_id = ConsumerId::generate();
        let (kind, rtp_parameters, producer_paused);
        {
            let mut state = self.engine.lock();
            let producer = state
                .producers
                .get(&options.producer_id)
                .ok_or_else(|| {
                    EngineError::Consumer(format!("producer {} not found", options.producer_id))
                })?;
            if !options.rtp_capabilities.supports_kind(producer.kind) {
                return Err(EngineError::Consumer(
                    "cannot consume this producer with the given capabilities".into(),
                ));
            }
            kind = producer.kind;
            producer_paused = producer.paused;

            let transport = state
                .transports
                .get_mut(&self.id)
                .ok_or_else(|| EngineError::Transport(format!("transport {} is closed", self.id)))?;
            transport.consumers.push(consumer_id.clone());
            if let Some(producer) = state.producers.get_mut(&options.producer_id) {
                producer.consumers.push(consumer_id.clone());
            }
            state.consumers.insert(
                consumer_id.clone(),
                ConsumerState {
                    transport_id: self.id.clone(),
                    producer_id: options.producer_id.clone(),
                    paused: options.paused,
                    preferred_layers: None,
                },
            );
            // The consumer echoes the producer's negotiated parameters.
            rtp_parameters = RtpParameters(serde_json::json!({
                "producerId": options.producer_id.as_str(),
                "kind": kind,
            }));
        }
        Ok(Arc::new(StubConsumer {
            engine: self.engine.clone(),
            id: consumer_id,
            producer_id: options.producer_id,
            kind,
            rtp_parameters,
            initial_producer_paused: producer_paused,
        }))
    }

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> EngineResult<()> {
        let mut state = self.engine.lock();
        let transport = state
            .transports
            .get_mut(&self.id)
            .ok_or_else(|| EngineError::Transport(format!("transport {} is closed", self.id)))?;
        transport.max_incoming_bitrate = Some(bitrate);
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        let mut events = Vec::new();
        {
            let mut state = self.engine.lock();
            close_transport(&mut state, &self.id, &mut events);
        }
        self.engine.emit(events);
        Ok(())
    }
}

struct StubProducer {
    engine: Arc<StubEngine>,
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    app_data: AppData,
}

#[async_trait]
impl RtcProducer for StubProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn app_data(&self) -> AppData {
        self.app_data.clone()
    }

    fn paused(&self) -> bool {
        self.engine
            .lock()
            .producers
            .get(&self.id)
            .map(|p| p.paused)
            .unwrap_or(false)
    }

    async fn pause(&self) -> EngineResult<()> {
        let mut events = Vec::new();
        {
            let mut state = self.engine.lock();
            let producer = state
                .producers
                .get_mut(&self.id)
                .ok_or_else(|| EngineError::Producer(format!("producer {} is closed", self.id)))?;
            if !producer.paused {
                producer.paused = true;
                for consumer_id in producer.consumers.clone() {
                    events.push(EngineEvent::ConsumerProducerPaused { consumer_id });
                }
            }
        }
        self.engine.emit(events);
        Ok(())
    }

    async fn resume(&self) -> EngineResult<()> {
        let mut events = Vec::new();
        {
            let mut state = self.engine.lock();
            let producer = state
                .producers
                .get_mut(&self.id)
                .ok_or_else(|| EngineError::Producer(format!("producer {} is closed", self.id)))?;
            if producer.paused {
                producer.paused = false;
                for consumer_id in producer.consumers.clone() {
                    events.push(EngineEvent::ConsumerProducerResumed { consumer_id });
                }
            }
        }
        self.engine.emit(events);
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        let mut events = Vec::new();
        {
            let mut state = self.engine.lock();
            close_producer(&mut state, &self.id, &mut events);
        }
        self.engine.emit(events);
        Ok(())
    }
}

struct StubConsumer {
    engine: Arc<StubEngine>,
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    initial_producer_paused: bool,
}

#[async_trait]
impl RtcConsumer for StubConsumer {
    fn id(&self) -> ConsumerId {
        self.id.clone()
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn paused(&self) -> bool {
        self.engine
            .lock()
            .consumers
            .get(&self.id)
            .map(|c| c.paused)
            .unwrap_or(false)
    }

    fn producer_paused(&self) -> bool {
        let state = self.engine.lock();
        state
            .producers
            .get(&self.producer_id)
            .map(|p| p.paused)
            .unwrap_or(self.initial_producer_paused)
    }

    async fn pause(&self) -> EngineResult<()> {
        let mut state = self.engine.lock();
        let consumer = state
            .consumers
            .get_mut(&self.id)
            .ok_or_else(|| EngineError::Consumer(format!("consumer {} is closed", self.id)))?;
        consumer.paused = true;
        Ok(())
    }

    async fn resume(&self) -> EngineResult<()> {
        let mut state = self.engine.lock();
        let consumer = state
            .consumers
            .get_mut(&self.id)
            .ok_or_else(|| EngineError::Consumer(format!("consumer {} is closed", self.id)))?;
        consumer.paused = false;
        Ok(())
    }

    async fn set_preferred_layers(&self, layers: ConsumerLayers) -> EngineResult<()> {
        let mut state = self.engine.lock();
        let consumer = state
            .consumers
            .get_mut(&self.id)
            .ok_or_else(|| EngineError::Consumer(format!("consumer {} is closed", self.id)))?;
        consumer.preferred_layers = Some(layers);
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        let mut events = Vec::new();
        {
            let mut state = self.engine.lock();
            close_consumer(&mut state, &self.id, &mut events);
        }
        self.engine.emit(events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::config::media_codecs;

    fn worker_settings() -> WorkerSettings {
        WorkerSettings {
            log_level: WorkerLogLevel::Warn,
            log_tags: vec![WorkerLogTag::Info],
            rtc_min_port: 20000,
            rtc_max_port: 20999,
        }
    }

    fn audio_caps() -> RtpCapabilities {
        RtpCapabilities {
            codecs: media_codecs()
                .into_iter()
                .filter(|c| c.kind == MediaKind::Audio)
                .collect(),
        }
    }

    async fn setup() -> (
        Arc<StubEngine>,
        mpsc::UnboundedReceiver<EngineEvent>,
        Arc<dyn RtcTransport>,
    ) {
        let (engine, rx) = StubEngine::new();
        let worker = engine.create_worker(worker_settings()).await.unwrap();
        let router = worker.create_router(media_codecs()).await.unwrap();
        let transport = router
            .create_webrtc_transport(WebRtcTransportOptions::default())
            .await
            .unwrap();
        (engine, rx, transport)
    }

    #[tokio::test]
    async fn transport_close_cascades_to_producers() {
        let (engine, mut rx, transport) = setup().await;
        let producer = transport
            .produce(ProducerOptions {
                kind: MediaKind::Audio,
                rtp_parameters: RtpParameters::default(),
                app_data: AppData::new(),
            })
            .await
            .unwrap();

        transport.close().await.unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(
            first,
            EngineEvent::ProducerClosed {
                producer_id: producer.id()
            }
        );
        let second = rx.try_recv().unwrap();
        assert_eq!(
            second,
            EngineEvent::TransportClosed {
                transport_id: transport.id()
            }
        );
        let (_, _, transports, producers, _) = engine.live_counts();
        assert_eq!((transports, producers), (0, 0));
    }

    #[tokio::test]
    async fn producer_pause_reaches_consumers() {
        let (_engine, mut rx, transport) = setup().await;
        let producer = transport
            .produce(ProducerOptions {
                kind: MediaKind::Audio,
                rtp_parameters: RtpParameters::default(),
                app_data: AppData::new(),
            })
            .await
            .unwrap();
        let consumer = transport
            .consume(ConsumerOptions {
                producer_id: producer.id(),
                rtp_capabilities: audio_caps(),
                paused: true,
            })
            .await
            .unwrap();

        producer.pause().await.unwrap();
        assert!(producer.paused());
        assert!(consumer.producer_paused());
        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::ConsumerProducerPaused {
                consumer_id: consumer.id()
            }
        );

        // Pausing again is a no-op and emits nothing.
        producer.pause().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn producer_close_announces_orphaned_consumers() {
        let (_engine, mut rx, transport) = setup().await;
        let producer = transport
            .produce(ProducerOptions {
                kind: MediaKind::Audio,
                rtp_parameters: RtpParameters::default(),
                app_data: AppData::new(),
            })
            .await
            .unwrap();
        let consumer = transport
            .consume(ConsumerOptions {
                producer_id: producer.id(),
                rtp_capabilities: audio_caps(),
                paused: true,
            })
            .await
            .unwrap();

        producer.close().await.unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::ConsumerProducerClosed {
                consumer_id: consumer.id()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::ProducerClosed {
                producer_id: producer.id()
            }
        );
    }

    #[tokio::test]
    async fn can_consume_requires_matching_kind() {
        let (_engine, _rx, transport) = setup().await;
        let producer = transport
            .produce(ProducerOptions {
                kind: MediaKind::Video,
                rtp_parameters: RtpParameters::default(),
                app_data: AppData::new(),
            })
            .await
            .unwrap();

        let result = transport
            .consume(ConsumerOptions {
                producer_id: producer.id(),
                rtp_capabilities: audio_caps(),
                paused: true,
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn kill_worker_emits_died_then_cascade() {
        let (engine, mut rx, transport) = setup().await;
        let pid = {
            let state = engine.lock();
            *state.workers.keys().next().unwrap()
        };
        engine.kill_worker(pid);

        assert_eq!(rx.try_recv().unwrap(), EngineEvent::WorkerDied { pid });
        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::TransportClosed {
                transport_id: transport.id()
            }
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            EngineEvent::RouterClosed { .. }
        ));
        assert_eq!(engine.live_counts(), (0, 0, 0, 0, 0));
    }
}
