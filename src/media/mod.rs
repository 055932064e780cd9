#![forbid(unsafe_code)]

// Media orchestration: worker pool, per-room routers, codec/transport
// configuration.

pub mod config;
pub mod router_registry;
pub mod worker_pool;

pub use config::{media_codecs, MediaConfig, TransportConfig, WorkerPoolConfig};
pub use router_registry::{ProducerEntry, RouterCreateError, RouterRegistry};
pub use worker_pool::{LoadCounter, NoWorkersAvailable, WorkerLoad, WorkerPool};
