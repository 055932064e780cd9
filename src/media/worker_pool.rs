#![forbid(unsafe_code)]

// Worker pool: owns the media-engine worker processes, tracks per-worker
// load, places new routers, and restarts dead workers.

use crate::engine::{EngineResult, MediaEngine, RtcWorker};
use crate::media::config::WorkerPoolConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Delay before a dead worker is respawned with its original port range.
pub const RESTART_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
#[error("No workers available")]
pub struct NoWorkersAvailable;

/// The load counters kept per worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadCounter {
    Routers,
    Transports,
    Consumers,
    Producers,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerLoad {
    pub routers: u32,
    pub transports: u32,
    pub consumers: u32,
    pub producers: u32,
}

impl WorkerLoad {
    /// Placement score. Routers dominate steady-state cost, consumers are
    /// cheapest: 10·routers + transports + 0.5·consumers, doubled so the
    /// half-weight stays in integer math.
    pub fn score(&self) -> u64 {
        u64::from(self.routers) * 20 + u64::from(self.transports) * 2 + u64::from(self.consumers)
    }

    fn counter_mut(&mut self, counter: LoadCounter) -> &mut u32 {
        match counter {
            LoadCounter::Routers => &mut self.routers,
            LoadCounter::Transports => &mut self.transports,
            LoadCounter::Consumers => &mut self.consumers,
            LoadCounter::Producers => &mut self.producers,
        }
    }
}

struct PoolEntry {
    worker: Arc<dyn RtcWorker>,
    rtc_min_port: u16,
    rtc_max_port: u16,
}

#[derive(Default)]
struct PoolInner {
    workers: Vec<PoolEntry>,
    load: HashMap<u32, WorkerLoad>,
}

/// Pool of media workers. A worker appears in `workers` iff its load entry
/// exists; both are mutated together under one lock.
pub struct WorkerPool {
    engine: Arc<dyn MediaEngine>,
    config: WorkerPoolConfig,
    inner: StdMutex<PoolInner>,
    next_rr: AtomicUsize,
}

impl WorkerPool {
    /// Spawns `config.num_workers` workers, each with its own RTC port
    /// range.
    pub async fn start(
        engine: Arc<dyn MediaEngine>,
        config: WorkerPoolConfig,
    ) -> EngineResult<Arc<Self>> {
        info!("Starting worker pool with {} workers", config.num_workers);

        let mut inner = PoolInner::default();
        for i in 0..config.num_workers {
            let settings = config.settings_for(i);
            let (min, max) = (settings.rtc_min_port, settings.rtc_max_port);
            let worker = engine.create_worker(settings).await?;
            let pid = worker.pid();
            info!("Worker {} up, rtc ports {}-{}", pid, min, max);
            inner.load.insert(pid, WorkerLoad::default());
            inner.workers.push(PoolEntry {
                worker,
                rtc_min_port: min,
                rtc_max_port: max,
            });
        }

        Ok(Arc::new(Self {
            engine,
            config,
            inner: StdMutex::new(inner),
            next_rr: AtomicUsize::new(0),
        }))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the worker with the smallest load score; ties go to the
    /// first one encountered in the scan.
    pub fn least_loaded(&self) -> Result<Arc<dyn RtcWorker>, NoWorkersAvailable> {
        let inner = self.lock();
        let mut best: Option<(&PoolEntry, u64)> = None;
        for entry in &inner.workers {
            let score = inner
                .load
                .get(&entry.worker.pid())
                .map(WorkerLoad::score)
                .unwrap_or(0);
            match best {
                Some((_, best_score)) if score >= best_score => {}
                _ => best = Some((entry, score)),
            }
        }
        best.map(|(entry, _)| entry.worker.clone())
            .ok_or(NoWorkersAvailable)
    }

    /// Cyclic worker selection. Exists for test-harness use; the default
    /// placement goes through `least_loaded`.
    pub fn next_round_robin(&self) -> Result<Arc<dyn RtcWorker>, NoWorkersAvailable> {
        let inner = self.lock();
        if inner.workers.is_empty() {
            return Err(NoWorkersAvailable);
        }
        let idx = self.next_rr.fetch_add(1, Ordering::Relaxed) % inner.workers.len();
        Ok(inner.workers[idx].worker.clone())
    }

    /// Adjusts one load counter for a worker. Unknown pids (a worker that
    /// already died) are ignored; counters never go below zero.
    pub fn update_load(&self, worker_pid: u32, counter: LoadCounter, delta: i64) {
        let mut inner = self.lock();
        if let Some(load) = inner.load.get_mut(&worker_pid) {
            let slot = load.counter_mut(counter);
            *slot = (i64::from(*slot) + delta).max(0) as u32;
        }
    }

    pub fn load_of(&self, worker_pid: u32) -> Option<WorkerLoad> {
        self.lock().load.get(&worker_pid).copied()
    }

    pub fn worker_count(&self) -> usize {
        self.lock().workers.len()
    }

    /// (pid, rtc_min_port, rtc_max_port) of every live worker.
    pub fn port_ranges(&self) -> Vec<(u32, u16, u16)> {
        self.lock()
            .workers
            .iter()
            .map(|e| (e.worker.pid(), e.rtc_min_port, e.rtc_max_port))
            .collect()
    }

    /// Handles a worker death signal: drops the worker and its load entry,
    /// then schedules a replacement with the same port range after the
    /// back-off. A failed restart is fatal only when it leaves the pool
    /// empty.
    pub fn handle_worker_died(self: Arc<Self>, pid: u32) {
        let (rtc_min_port, rtc_max_port) = {
            let mut inner = self.lock();
            let Some(pos) = inner.workers.iter().position(|e| e.worker.pid() == pid) else {
                return;
            };
            let entry = inner.workers.remove(pos);
            inner.load.remove(&pid);
            (entry.rtc_min_port, entry.rtc_max_port)
        };
        warn!(
            "Worker {} died; restarting in {:?} with rtc ports {}-{}",
            pid, RESTART_BACKOFF, rtc_min_port, rtc_max_port
        );

        let pool = self;
        tokio::spawn(async move {
            tokio::time::sleep(RESTART_BACKOFF).await;
            let settings = pool.config.settings_for_range(rtc_min_port, rtc_max_port);
            match pool.engine.create_worker(settings).await {
                Ok(worker) => {
                    let new_pid = worker.pid();
                    let mut inner = pool.lock();
                    inner.load.insert(new_pid, WorkerLoad::default());
                    inner.workers.push(PoolEntry {
                        worker,
                        rtc_min_port,
                        rtc_max_port,
                    });
                    info!(
                        "Worker {} replaced by {} (rtc ports {}-{})",
                        pid, new_pid, rtc_min_port, rtc_max_port
                    );
                }
                Err(e) => {
                    let pool_empty = pool.lock().workers.is_empty();
                    if pool_empty {
                        error!("Worker restart failed with an empty pool: {e}");
                        std::process::exit(1);
                    }
                    warn!("Worker restart failed ({} workers remain): {e}", pool.worker_count());
                }
            }
        });
    }

    /// Closes every worker and clears the pool.
    pub async fn shutdown(&self) {
        info!("Shutting down worker pool");
        let entries: Vec<PoolEntry> = {
            let mut inner = self.lock();
            inner.load.clear();
            inner.workers.drain(..).collect()
        };
        for entry in entries {
            if let Err(e) = entry.worker.close().await {
                warn!("Failed to close worker {}: {e}", entry.worker.pid());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::stub::StubEngine;

    fn config(n: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            num_workers: n,
            ..WorkerPoolConfig::default()
        }
    }

    #[tokio::test]
    async fn startup_assigns_disjoint_port_ranges() {
        let (engine, _rx) = StubEngine::new();
        let pool = WorkerPool::start(engine, config(3)).await.unwrap();

        let mut ranges = pool.port_ranges();
        ranges.sort_by_key(|(_, min, _)| *min);
        assert_eq!(ranges.len(), 3);
        assert_eq!((ranges[0].1, ranges[0].2), (20_000, 20_999));
        assert_eq!((ranges[1].1, ranges[1].2), (21_000, 21_999));
        assert_eq!((ranges[2].1, ranges[2].2), (22_000, 22_999));
    }

    #[tokio::test]
    async fn placement_prefers_smallest_score() {
        let (engine, _rx) = StubEngine::new();
        let pool = WorkerPool::start(engine, config(3)).await.unwrap();
        let pids: Vec<u32> = pool.port_ranges().iter().map(|(pid, _, _)| *pid).collect();

        // One router outweighs many consumers.
        pool.update_load(pids[0], LoadCounter::Routers, 1);
        pool.update_load(pids[1], LoadCounter::Consumers, 19);
        assert_eq!(pool.least_loaded().unwrap().pid(), pids[2]);

        pool.update_load(pids[2], LoadCounter::Routers, 2);
        assert_eq!(pool.least_loaded().unwrap().pid(), pids[1]);
    }

    #[tokio::test]
    async fn ties_go_to_first_encountered() {
        let (engine, _rx) = StubEngine::new();
        let pool = WorkerPool::start(engine, config(3)).await.unwrap();
        let pids: Vec<u32> = pool.port_ranges().iter().map(|(pid, _, _)| *pid).collect();
        assert_eq!(pool.least_loaded().unwrap().pid(), pids[0]);
    }

    #[tokio::test]
    async fn round_robin_cycles_through_workers() {
        let (engine, _rx) = StubEngine::new();
        let pool = WorkerPool::start(engine, config(2)).await.unwrap();
        let a = pool.next_round_robin().unwrap().pid();
        let b = pool.next_round_robin().unwrap().pid();
        let c = pool.next_round_robin().unwrap().pid();
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[tokio::test]
    async fn load_counters_never_go_negative() {
        let (engine, _rx) = StubEngine::new();
        let pool = WorkerPool::start(engine, config(2)).await.unwrap();
        let pid = pool.port_ranges()[0].0;
        pool.update_load(pid, LoadCounter::Transports, -5);
        assert_eq!(pool.load_of(pid).unwrap().transports, 0);
    }

    #[tokio::test]
    async fn empty_pool_reports_no_workers() {
        let (engine, _rx) = StubEngine::new();
        let pool = WorkerPool::start(engine, config(0)).await.unwrap();
        assert!(pool.least_loaded().is_err());
        assert!(pool.next_round_robin().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn dead_worker_restarts_with_same_port_range() {
        let (engine, _rx) = StubEngine::new();
        let pool = WorkerPool::start(engine.clone(), config(2)).await.unwrap();
        let (dead_pid, min, max) = pool.port_ranges()[1];

        engine.kill_worker(dead_pid);
        pool.clone().handle_worker_died(dead_pid);
        assert_eq!(pool.worker_count(), 1);

        tokio::time::sleep(RESTART_BACKOFF + Duration::from_millis(100)).await;

        assert_eq!(pool.worker_count(), 2);
        let restarted = pool
            .port_ranges()
            .into_iter()
            .find(|(_, lo, hi)| (*lo, *hi) == (min, max))
            .expect("replacement worker keeps the port range");
        assert_ne!(restarted.0, dead_pid);
        assert_eq!(pool.load_of(restarted.0).unwrap(), WorkerLoad::default());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_restart_is_tolerated_while_pool_is_nonempty() {
        let (engine, _rx) = StubEngine::new();
        let pool = WorkerPool::start(engine.clone(), config(2)).await.unwrap();
        let dead_pid = pool.port_ranges()[0].0;

        engine.set_worker_creation_fails(true);
        engine.kill_worker(dead_pid);
        pool.clone().handle_worker_died(dead_pid);

        tokio::time::sleep(RESTART_BACKOFF + Duration::from_millis(100)).await;
        assert_eq!(pool.worker_count(), 1);
    }
}
