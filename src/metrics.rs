//! Operation metrics for VoltDB.
//!
//! Lightweight, thread-safe counters shared by the facade, the tier manager
//! and the bleed engine. Counters are atomics; the latency window and the
//! slow-operation buffer are small mutex-protected rings.
//!
//! ```
//! use voltdb::metrics::{Metrics, Op};
//!
//! let metrics = Metrics::new();
//! metrics.record(Op::Recall, 15);
//! assert_eq!(metrics.snapshot().count(Op::Recall), 1);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

/// Latencies retained for percentile calculation.
const LATENCY_WINDOW_SIZE: usize = 1000;

/// Slow operations retained for reporting.
const MAX_SLOW_OPS: usize = 10;

/// Operations at or above this duration are logged and kept as slow.
pub const SLOW_OP_THRESHOLD_MS: u64 = 100;

const OP_COUNT: usize = 8;

/// Operation kinds tracked per counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Op {
    Store,
    Recall,
    Get,
    Promote,
    Demote,
    Archive,
    Flush,
    Compact,
}

impl Op {
    pub const ALL: [Op; OP_COUNT] = [
        Op::Store,
        Op::Recall,
        Op::Get,
        Op::Promote,
        Op::Demote,
        Op::Archive,
        Op::Flush,
        Op::Compact,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Op::Store => "store",
            Op::Recall => "recall",
            Op::Get => "get",
            Op::Promote => "promote",
            Op::Demote => "demote",
            Op::Archive => "archive",
            Op::Flush => "flush",
            Op::Compact => "compact",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SlowOp {
    pub operation: &'static str,
    pub duration_ms: u64,
    /// Milliseconds since metrics started.
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OperationStat {
    pub operation: &'static str,
    pub count: u64,
    pub avg_ms: u64,
}

/// Point-in-time copy of all metrics.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    pub total_ops: u64,
    pub slow_ops: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub avg_ms: u64,
    pub recall_timeouts: u64,
    pub uptime_secs: u64,
    pub operations: Vec<OperationStat>,
    pub recent_slow: Vec<SlowOp>,
}

impl MetricsSnapshot {
    pub fn count(&self, op: Op) -> u64 {
        self.operations
            .iter()
            .find(|s| s.operation == op.as_str())
            .map(|s| s.count)
            .unwrap_or(0)
    }
}

pub struct Metrics {
    total: AtomicU64,
    slow: AtomicU64,
    op_counts: [AtomicU64; OP_COUNT],
    op_latency_sums: [AtomicU64; OP_COUNT],
    latencies_ms: Mutex<VecDeque<u64>>,
    latency_sum_ms: AtomicU64,
    slow_ops: Mutex<VecDeque<SlowOp>>,
    recall_timeouts: AtomicU64,
    started_at: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            slow: AtomicU64::new(0),
            op_counts: Default::default(),
            op_latency_sums: Default::default(),
            latencies_ms: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW_SIZE)),
            latency_sum_ms: AtomicU64::new(0),
            slow_ops: Mutex::new(VecDeque::with_capacity(MAX_SLOW_OPS)),
            recall_timeouts: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Record one completed operation. O(1) amortized.
    pub fn record(&self, op: Op, duration_ms: u64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.op_counts[op.index()].fetch_add(1, Ordering::Relaxed);
        self.op_latency_sums[op.index()].fetch_add(duration_ms, Ordering::Relaxed);

        {
            let mut latencies = self.latencies_ms.lock();
            if latencies.len() >= LATENCY_WINDOW_SIZE {
                if let Some(old) = latencies.pop_front() {
                    self.latency_sum_ms.fetch_sub(old, Ordering::Relaxed);
                }
            }
            latencies.push_back(duration_ms);
            self.latency_sum_ms.fetch_add(duration_ms, Ordering::Relaxed);
        }

        if duration_ms >= SLOW_OP_THRESHOLD_MS {
            self.slow.fetch_add(1, Ordering::Relaxed);
            warn!(operation = op.as_str(), duration_ms, "slow operation");
            let mut slow = self.slow_ops.lock();
            if slow.len() >= MAX_SLOW_OPS {
                slow.pop_front();
            }
            slow.push_back(SlowOp {
                operation: op.as_str(),
                duration_ms,
                timestamp_ms: self.started_at.elapsed().as_millis() as u64,
            });
        }
    }

    /// Time `f` and record it under `op`.
    pub fn time<T>(&self, op: Op, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.record(op, start.elapsed().as_millis() as u64);
        out
    }

    pub fn record_recall_timeout(&self) {
        self.recall_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (p50, p95, p99, avg) = {
            let latencies = self.latencies_ms.lock();
            if latencies.is_empty() {
                (0, 0, 0, 0)
            } else {
                let mut sorted: Vec<u64> = latencies.iter().copied().collect();
                sorted.sort_unstable();
                let len = sorted.len();
                let p99 = sorted.get(len * 99 / 100).copied().unwrap_or(sorted[len - 1]);
                let avg = self.latency_sum_ms.load(Ordering::Relaxed) / len as u64;
                (sorted[len * 50 / 100], sorted[len * 95 / 100], p99, avg)
            }
        };

        let operations = Op::ALL
            .iter()
            .map(|op| {
                let count = self.op_counts[op.index()].load(Ordering::Relaxed);
                let sum = self.op_latency_sums[op.index()].load(Ordering::Relaxed);
                OperationStat {
                    operation: op.as_str(),
                    count,
                    avg_ms: if count > 0 { sum / count } else { 0 },
                }
            })
            .collect();

        MetricsSnapshot {
            total_ops: self.total.load(Ordering::Relaxed),
            slow_ops: self.slow.load(Ordering::Relaxed),
            p50_ms: p50,
            p95_ms: p95,
            p99_ms: p99,
            avg_ms: avg,
            recall_timeouts: self.recall_timeouts.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
            operations,
            recent_slow: self.slow_ops.lock().iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_empty_snapshot() {
        let snap = Metrics::new().snapshot();
        assert_eq!(snap.total_ops, 0);
        assert_eq!(snap.p50_ms, 0);
        assert_eq!(snap.p99_ms, 0);
        assert!(snap.recent_slow.is_empty());
        assert_eq!(snap.operations.len(), Op::ALL.len());
    }

    #[test]
    fn test_percentiles() {
        let metrics = Metrics::new();
        for ms in 1..=100 {
            metrics.record(Op::Recall, ms);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.total_ops, 100);
        assert_eq!(snap.p50_ms, 51);
        assert_eq!(snap.p95_ms, 96);
        assert_eq!(snap.p99_ms, 100);
        assert_eq!(snap.avg_ms, 50);
        // 100ms sample is at the threshold
        assert_eq!(snap.slow_ops, 1);
    }

    #[test]
    fn test_window_is_bounded() {
        let metrics = Metrics::new();
        for _ in 0..LATENCY_WINDOW_SIZE {
            metrics.record(Op::Store, 50);
        }
        for _ in 0..LATENCY_WINDOW_SIZE {
            metrics.record(Op::Store, 1);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.avg_ms, 1);
        assert_eq!(snap.count(Op::Store), 2 * LATENCY_WINDOW_SIZE as u64);
    }

    #[test]
    fn test_slow_ops_ring() {
        let metrics = Metrics::new();
        for i in 0..15 {
            metrics.record(Op::Flush, SLOW_OP_THRESHOLD_MS + i);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.slow_ops, 15);
        assert_eq!(snap.recent_slow.len(), MAX_SLOW_OPS);
        assert_eq!(snap.recent_slow[0].duration_ms, SLOW_OP_THRESHOLD_MS + 5);
        assert_eq!(snap.recent_slow[0].operation, "flush");
    }

    #[test]
    fn test_per_op_averages() {
        let metrics = Metrics::new();
        metrics.record(Op::Promote, 10);
        metrics.record(Op::Promote, 30);
        metrics.record(Op::Archive, 5);
        let snap = metrics.snapshot();
        let promote = snap.operations.iter().find(|s| s.operation == "promote").unwrap();
        assert_eq!(promote.count, 2);
        assert_eq!(promote.avg_ms, 20);
        assert_eq!(snap.count(Op::Archive), 1);
        assert_eq!(snap.count(Op::Compact), 0);
    }

    #[test]
    fn test_concurrent_recording() {
        let metrics = Arc::new(Metrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..500 {
                        m.record(Op::Get, 2);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.total_ops, 4000);
        assert_eq!(snap.count(Op::Get), 4000);
    }

    #[test]
    fn test_time_records_and_returns() {
        let metrics = Metrics::new();
        let v = metrics.time(Op::Compact, || 7);
        assert_eq!(v, 7);
        assert_eq!(metrics.snapshot().count(Op::Compact), 1);
    }
}
