#![forbid(unsafe_code)]

// Capability surface of the underlying media engine.
//
// The signaling core never touches RTP/DTLS/ICE itself; it drives the engine
// exclusively through these traits and listens to engine-originated signals
// on a single `EngineEvent` channel. Handles returned by the engine are
// owned by exactly one peer entry and closed through that peer's cleanup.

pub mod stub;
pub mod types;

pub use types::*;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by the media engine. Messages are passed through to
/// clients verbatim inside `{error}` acknowledgments.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("worker error: {0}")]
    Worker(String),
    #[error("router error: {0}")]
    Router(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("producer error: {0}")]
    Producer(String),
    #[error("consumer error: {0}")]
    Consumer(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Engine-originated signals, delivered in order on one mpsc channel and
/// consumed by the dispatcher's event pump. Closing an entity cascades to
/// everything it owns; each closed entity is announced exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    WorkerDied { pid: u32 },
    RouterClosed { router_id: RouterId },
    TransportClosed { transport_id: TransportId },
    TransportDtlsStateChanged { transport_id: TransportId, state: DtlsState },
    TransportIceStateChanged { transport_id: TransportId, state: IceState },
    ProducerClosed { producer_id: ProducerId },
    /// The consumer's own transport went away.
    ConsumerClosed { consumer_id: ConsumerId },
    /// The producer this consumer forwards from was closed.
    ConsumerProducerClosed { consumer_id: ConsumerId },
    ConsumerProducerPaused { consumer_id: ConsumerId },
    ConsumerProducerResumed { consumer_id: ConsumerId },
}

/// Entry point: spawns worker processes.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(&self, settings: WorkerSettings) -> EngineResult<Arc<dyn RtcWorker>>;
}

/// A media worker process bound to a UDP port range.
#[async_trait]
pub trait RtcWorker: Send + Sync {
    fn pid(&self) -> u32;

    async fn create_router(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> EngineResult<Arc<dyn RtcRouter>>;

    async fn close(&self) -> EngineResult<()>;
}

/// A media router scoped to one room.
#[async_trait]
pub trait RtcRouter: Send + Sync {
    fn id(&self) -> RouterId;

    fn rtp_capabilities(&self) -> RtpCapabilities;

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn RtcTransport>>;

    /// Whether a client with `rtp_capabilities` can consume `producer_id`.
    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn close(&self) -> EngineResult<()>;
}

/// An encrypted transport between one client and the server.
#[async_trait]
pub trait RtcTransport: Send + Sync {
    fn id(&self) -> TransportId;
    fn ice_parameters(&self) -> IceParameters;
    fn ice_candidates(&self) -> Vec<IceCandidate>;
    fn dtls_parameters(&self) -> DtlsParameters;
    fn sctp_parameters(&self) -> Option<SctpParameters>;

    async fn connect(&self, dtls_parameters: DtlsParameters) -> EngineResult<()>;

    async fn produce(&self, options: ProducerOptions) -> EngineResult<Arc<dyn RtcProducer>>;

    async fn consume(&self, options: ConsumerOptions) -> EngineResult<Arc<dyn RtcConsumer>>;

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> EngineResult<()>;

    async fn close(&self) -> EngineResult<()>;
}

/// Server-side handle for media a client uploads.
#[async_trait]
pub trait RtcProducer: Send + Sync {
    fn id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;
    fn app_data(&self) -> AppData;
    fn paused(&self) -> bool;

    async fn pause(&self) -> EngineResult<()>;
    async fn resume(&self) -> EngineResult<()>;
    async fn close(&self) -> EngineResult<()>;
}

/// Server-side handle for media forwarded to a client.
#[async_trait]
pub trait RtcConsumer: Send + Sync {
    fn id(&self) -> ConsumerId;
    fn producer_id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;
    fn paused(&self) -> bool;
    fn producer_paused(&self) -> bool;

    async fn pause(&self) -> EngineResult<()>;
    async fn resume(&self) -> EngineResult<()>;
    async fn set_preferred_layers(&self, layers: ConsumerLayers) -> EngineResult<()>;
    async fn close(&self) -> EngineResult<()>;
}
