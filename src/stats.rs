//! Per-node statistics: cumulative and interval accumulators over a
//! stream of latency samples.
//!
//! Latencies live in HDR histograms (1 µs to 1 h, 3 significant digits)
//! and are reported at P50/P70/P90/P95/P99 in milliseconds. A snapshot
//! returns both windows and atomically starts a new interval.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::op::{OpStat, OpType, ALL_OP_TYPES};

const NUM_OP_TYPES: usize = ALL_OP_TYPES.len();

fn new_histogram() -> Histogram<u64> {
    // 1 microsecond to 1 hour, 3 significant digits.
    Histogram::new_with_bounds(1, 3_600_000_000, 3).expect("failed to allocate histogram")
}

/// Latency percentiles in milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencySummary {
    pub p50: f64,
    pub p70: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

fn summarize(hist: &Histogram<u64>) -> LatencySummary {
    if hist.is_empty() {
        return LatencySummary::default();
    }
    let ms = |q: f64| hist.value_at_quantile(q) as f64 / 1000.0;
    LatencySummary {
        p50: ms(0.50),
        p70: ms(0.70),
        p90: ms(0.90),
        p95: ms(0.95),
        p99: ms(0.99),
    }
}

/// One accumulator window (cumulative or interval).
struct Window {
    started: Instant,
    ops: u64,
    errors: u64,
    counts: [u64; NUM_OP_TYPES],
    max_latency: [Duration; NUM_OP_TYPES],
    hists: [Histogram<u64>; NUM_OP_TYPES],
}

impl Window {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            ops: 0,
            errors: 0,
            counts: [0; NUM_OP_TYPES],
            max_latency: [Duration::ZERO; NUM_OP_TYPES],
            hists: std::array::from_fn(|_| new_histogram()),
        }
    }

    fn record(&mut self, stat: &OpStat) {
        let Some(idx) = stat.op_type.stat_index() else {
            return;
        };
        self.ops += 1;
        if stat.errored {
            self.errors += 1;
        }
        self.counts[idx] += 1;
        if stat.latency > self.max_latency[idx] {
            self.max_latency[idx] = stat.latency;
        }
        let micros = stat.latency.as_micros().min(u64::MAX as u128) as u64;
        let _ = self.hists[idx].record(micros.max(1));
    }

    fn ops_per_sec(&self, count: u64, now: Instant) -> f64 {
        let elapsed = now.duration_since(self.started).as_secs_f64();
        if elapsed <= 0.0 {
            0.0
        } else {
            count as f64 / elapsed
        }
    }
}

/// Per-op-type slice of an [`ExecutionStatus`] snapshot.
#[derive(Debug, Clone)]
pub struct OpTypeStatus {
    pub op_type: OpType,
    pub count: u64,
    pub interval_count: u64,
    pub ops_per_sec: f64,
    pub interval_ops_per_sec: f64,
    pub latencies: LatencySummary,
    pub interval_latencies: LatencySummary,
    pub max_latency_ms: f64,
    pub interval_max_latency_ms: f64,
}

/// Snapshot of one node's execution, cumulative and since the previous
/// snapshot.
#[derive(Debug, Clone)]
pub struct ExecutionStatus {
    pub ops_executed: u64,
    pub interval_ops_executed: u64,
    pub ops_errors: u64,
    pub interval_ops_errors: u64,
    pub ops_per_sec: f64,
    pub interval_ops_per_sec: f64,
    /// Per-type rows, in canonical reporting order.
    pub op_types: Vec<OpTypeStatus>,
}

struct State {
    cumulative: Window,
    interval: Window,
}

/// Consumes one node's OpStat stream and serves status snapshots.
#[derive(Clone)]
pub struct StatsAnalyzer {
    state: Arc<Mutex<State>>,
}

impl StatsAnalyzer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                cumulative: Window::new(),
                interval: Window::new(),
            })),
        }
    }

    /// Spawn the single consumer of this node's statistics channel. The
    /// task ends when every sender (one per worker executor) is dropped.
    pub fn spawn_consumer(&self, mut rx: mpsc::Receiver<OpStat>) -> JoinHandle<()> {
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(stat) = rx.recv().await {
                let mut state = state.lock();
                state.cumulative.record(&stat);
                state.interval.record(&stat);
            }
        })
    }

    /// Record one sample directly.
    pub fn record(&self, stat: OpStat) {
        let mut state = self.state.lock();
        state.cumulative.record(&stat);
        state.interval.record(&stat);
    }

    /// Snapshot both windows and atomically start a new interval.
    pub fn get_status(&self) -> ExecutionStatus {
        let mut state = self.state.lock();
        let now = Instant::now();

        let op_types = ALL_OP_TYPES
            .iter()
            .enumerate()
            .map(|(idx, ty)| OpTypeStatus {
                op_type: *ty,
                count: state.cumulative.counts[idx],
                interval_count: state.interval.counts[idx],
                ops_per_sec: state.cumulative.ops_per_sec(state.cumulative.counts[idx], now),
                interval_ops_per_sec: state.interval.ops_per_sec(state.interval.counts[idx], now),
                latencies: summarize(&state.cumulative.hists[idx]),
                interval_latencies: summarize(&state.interval.hists[idx]),
                max_latency_ms: state.cumulative.max_latency[idx].as_secs_f64() * 1000.0,
                interval_max_latency_ms: state.interval.max_latency[idx].as_secs_f64() * 1000.0,
            })
            .collect();

        let status = ExecutionStatus {
            ops_executed: state.cumulative.ops,
            interval_ops_executed: state.interval.ops,
            ops_errors: state.cumulative.errors,
            interval_ops_errors: state.interval.errors,
            ops_per_sec: state.cumulative.ops_per_sec(state.cumulative.ops, now),
            interval_ops_per_sec: state.interval.ops_per_sec(state.interval.ops, now),
            op_types,
        };

        state.interval = Window::new();
        status
    }
}

impl Default for StatsAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(ty: OpType, millis: u64, errored: bool) -> OpStat {
        OpStat {
            op_type: ty,
            latency: Duration::from_millis(millis),
            errored,
        }
    }

    #[test]
    fn test_counts_and_errors() {
        let analyzer = StatsAnalyzer::new();
        analyzer.record(stat(OpType::Insert, 1, false));
        analyzer.record(stat(OpType::Insert, 2, true));
        analyzer.record(stat(OpType::Query, 3, false));

        let status = analyzer.get_status();
        assert_eq!(status.ops_executed, 3);
        assert_eq!(status.ops_errors, 1);
        assert_eq!(status.interval_ops_executed, 3);
        assert_eq!(status.interval_ops_errors, 1);

        let insert = &status.op_types[0];
        assert_eq!(insert.op_type, OpType::Insert);
        assert_eq!(insert.count, 2);
        let query = &status.op_types[3];
        assert_eq!(query.op_type, OpType::Query);
        assert_eq!(query.count, 1);
    }

    #[test]
    fn test_interval_resets_cumulative_does_not() {
        let analyzer = StatsAnalyzer::new();
        analyzer.record(stat(OpType::Remove, 1, false));
        let first = analyzer.get_status();
        assert_eq!(first.interval_ops_executed, 1);

        let second = analyzer.get_status();
        assert_eq!(second.interval_ops_executed, 0);
        assert_eq!(second.ops_executed, 1);
    }

    #[test]
    fn test_cumulative_monotonic_and_intervals_sum_to_total() {
        let analyzer = StatsAnalyzer::new();
        let mut interval_sum = 0;
        let mut previous_total = 0;

        for round in 1..=5u64 {
            for _ in 0..round {
                analyzer.record(stat(OpType::Update, 1, false));
            }
            let status = analyzer.get_status();
            assert!(status.ops_executed >= previous_total);
            previous_total = status.ops_executed;
            interval_sum += status.interval_ops_executed;
        }

        assert_eq!(interval_sum, previous_total);
        assert_eq!(previous_total, 1 + 2 + 3 + 4 + 5);
    }

    #[test]
    fn test_percentiles_and_max() {
        let analyzer = StatsAnalyzer::new();
        for ms in 1..=100u64 {
            analyzer.record(stat(OpType::Query, ms, false));
        }
        let status = analyzer.get_status();
        let query = &status.op_types[3];

        // Millisecond-scale accuracy is all the contract asks for.
        assert!((query.latencies.p50 - 50.0).abs() < 2.0, "p50 {}", query.latencies.p50);
        assert!((query.latencies.p99 - 99.0).abs() < 2.0, "p99 {}", query.latencies.p99);
        assert!((query.max_latency_ms - 100.0).abs() < 1.0);
        assert!(query.interval_latencies.p90 > query.interval_latencies.p50);
    }

    #[tokio::test]
    async fn test_channel_consumer_drains_until_senders_drop() {
        let analyzer = StatsAnalyzer::new();
        let (tx, rx) = mpsc::channel(64);
        let consumer = analyzer.spawn_consumer(rx);

        for _ in 0..10 {
            tx.send(stat(OpType::Insert, 2, false)).await.unwrap();
        }
        drop(tx);
        consumer.await.unwrap();

        let status = analyzer.get_status();
        assert_eq!(status.ops_executed, 10);
    }
}
