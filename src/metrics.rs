#![forbid(unsafe_code)]

// Server metrics: lock-free atomic counters, an RAII connection gauge, and
// a fixed-bucket latency histogram, rendered in Prometheus text format.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Histogram bucket upper bounds in microseconds.
const BUCKET_BOUNDS_US: [u64; 10] = [
    1_000,     // 1ms
    5_000,     // 5ms
    10_000,    // 10ms
    25_000,    // 25ms
    50_000,    // 50ms
    100_000,   // 100ms
    250_000,   // 250ms
    500_000,   // 500ms
    1_000_000, // 1s
    5_000_000, // 5s
];

const BUCKET_LABELS: [&str; 10] = [
    "0.001", "0.005", "0.01", "0.025", "0.05", "0.1", "0.25", "0.5", "1", "5",
];

/// Cumulative histogram with fixed buckets.
pub struct Histogram {
    buckets: [AtomicU64; 10],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (i, &bound) in BUCKET_BOUNDS_US.iter().enumerate() {
            if us <= bound {
                self.buckets[i].fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (i, label) in BUCKET_LABELS.iter().enumerate() {
            let val = self.buckets[i].load(Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {val}");
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

macro_rules! counters {
    ($($field:ident => $inc:ident),+ $(,)?) => {
        struct Counters {
            $($field: AtomicU64,)+
        }

        impl Counters {
            fn new() -> Self {
                Self { $($field: AtomicU64::new(0),)+ }
            }
        }

        impl ServerMetrics {
            $(
                pub fn $inc(&self) {
                    self.inner.counters.$field.fetch_add(1, Relaxed);
                }
            )+
        }
    };
}

counters! {
    connections_total => inc_connections,
    messages_received_total => inc_messages_received,
    messages_sent_total => inc_messages_sent,
    errors_total => inc_errors,
    rooms_created_total => inc_rooms_created,
    joins_total => inc_joins,
    leaves_total => inc_leaves,
    producers_created_total => inc_producers_created,
    consumers_created_total => inc_consumers_created,
    meetings_ended_total => inc_meetings_ended,
    chat_messages_total => inc_chat_messages,
    worker_restarts_total => inc_worker_restarts,
}

struct Inner {
    counters: Counters,
    connections_active: AtomicU64,
    message_handling: Histogram,
}

/// Cheap-to-clone handle over the shared metric state.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                counters: Counters::new(),
                connections_active: AtomicU64::new(0),
                message_handling: Histogram::new(),
            }),
        }
    }

    /// Bumps the active-connection gauge and returns a guard that drops it
    /// back down, panics included.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn observe_message_handling(&self, duration: Duration) {
        self.inner.message_handling.observe(duration);
    }

    /// Full Prometheus text exposition. Room and peer gauges are computed
    /// on demand by the caller.
    pub fn render_prometheus(&self, rooms_active: usize, peers_active: usize) -> String {
        let mut out = String::with_capacity(4096);
        let c = &self.inner.counters;

        counter(&mut out, "huddle_connections_total", "Signaling connections accepted", c.connections_total.load(Relaxed));
        counter(&mut out, "huddle_messages_received_total", "Messages received from clients", c.messages_received_total.load(Relaxed));
        counter(&mut out, "huddle_messages_sent_total", "Messages sent to clients", c.messages_sent_total.load(Relaxed));
        counter(&mut out, "huddle_errors_total", "Handler and protocol errors", c.errors_total.load(Relaxed));
        counter(&mut out, "huddle_rooms_created_total", "Rooms created", c.rooms_created_total.load(Relaxed));
        counter(&mut out, "huddle_joins_total", "Room joins", c.joins_total.load(Relaxed));
        counter(&mut out, "huddle_leaves_total", "Room leaves", c.leaves_total.load(Relaxed));
        counter(&mut out, "huddle_producers_created_total", "Producers created", c.producers_created_total.load(Relaxed));
        counter(&mut out, "huddle_consumers_created_total", "Consumers created", c.consumers_created_total.load(Relaxed));
        counter(&mut out, "huddle_meetings_ended_total", "Meetings ended by their host", c.meetings_ended_total.load(Relaxed));
        counter(&mut out, "huddle_chat_messages_total", "Chat messages relayed", c.chat_messages_total.load(Relaxed));
        counter(&mut out, "huddle_worker_restarts_total", "Media workers restarted after a crash", c.worker_restarts_total.load(Relaxed));

        gauge(&mut out, "huddle_connections_active", "Open signaling connections", self.inner.connections_active.load(Relaxed));
        gauge(&mut out, "huddle_rooms_active", "Live rooms", rooms_active as u64);
        gauge(&mut out, "huddle_peers_active", "Connected peers in rooms", peers_active as u64);

        self.inner.message_handling.render(
            "huddle_message_handling_seconds",
            "Signaling message handling latency",
            &mut out,
        );
        out
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements `connections_active` on drop.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_gauge_render() {
        let metrics = ServerMetrics::new();
        metrics.inc_joins();
        metrics.inc_joins();
        metrics.inc_worker_restarts();
        {
            let _guard = metrics.connection_active_guard();
            let text = metrics.render_prometheus(1, 2);
            assert!(text.contains("huddle_joins_total 2"));
            assert!(text.contains("huddle_worker_restarts_total 1"));
            assert!(text.contains("huddle_connections_active 1"));
            assert!(text.contains("huddle_rooms_active 1"));
        }
        let text = metrics.render_prometheus(0, 0);
        assert!(text.contains("huddle_connections_active 0"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let metrics = ServerMetrics::new();
        metrics.observe_message_handling(Duration::from_micros(500));
        metrics.observe_message_handling(Duration::from_millis(20));
        let text = metrics.render_prometheus(0, 0);
        assert!(text.contains("huddle_message_handling_seconds_bucket{le=\"0.001\"} 1"));
        assert!(text.contains("huddle_message_handling_seconds_bucket{le=\"0.025\"} 2"));
        assert!(text.contains("huddle_message_handling_seconds_count 2"));
    }
}
