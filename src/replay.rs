//! Replay orchestration: the worker pool, per-op fan-out across nodes,
//! and the periodic reporter.
//!
//! One dispatcher feeds a shared op channel; each worker owns one session
//! per node and fans every op out to all nodes in parallel, waiting for
//! the whole fan-out before advancing so per-op skew across nodes stays
//! bounded. Statistics flow per node into a single analyzer consumer.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_channel::Receiver;
use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::executor::OpsExecutor;
use crate::op::{canonicalize_op, Op, OpStat};
use crate::session::Dialer;
use crate::stats::{ExecutionStatus, StatsAnalyzer};

/// Default reporting cadence.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Immutable replay settings, plumbed through constructors.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub workers: usize,
    /// Ops whose latency on any node exceeds this are logged. `None`
    /// disables slow-op reporting.
    pub slow_op_threshold: Option<Duration>,
    /// Log per-op execution errors.
    pub verbose: bool,
    pub report_interval: Duration,
}

/// One replay target, before wiring.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: String,
    pub url: String,
    /// Optional per-node stats file, appended one CSV line per interval.
    pub stats_path: Option<PathBuf>,
}

/// A wired replay target.
struct Node {
    name: String,
    url: String,
    analyzer: StatsAnalyzer,
}

/// Run the whole replay: dial preflight, spawn workers, report until all
/// workers have drained the op channel, then emit one final report.
/// Returns the number of ops executed.
pub async fn run_replay(
    cfg: ReplayConfig,
    specs: Vec<NodeSpec>,
    ops_rx: Receiver<Op>,
    dialer: Arc<dyn Dialer>,
) -> Result<u64> {
    // Unreachable targets fail the run before any worker starts.
    for spec in &specs {
        dialer
            .dial(&spec.url)
            .await
            .with_context(|| format!("cannot reach node {} at {}", spec.name, spec.url))?;
    }

    // Deep stats channels keep executors off the blocking path under
    // bursts; a single consumer per node feeds its analyzer.
    let stats_capacity = cfg.workers * 100;
    let mut nodes = Vec::with_capacity(specs.len());
    let mut stats_senders = Vec::with_capacity(specs.len());
    let mut consumers = Vec::with_capacity(specs.len());
    let mut stats_files = Vec::with_capacity(specs.len());

    for spec in specs {
        let (tx, rx) = mpsc::channel(stats_capacity);
        let analyzer = StatsAnalyzer::new();
        consumers.push(analyzer.spawn_consumer(rx));
        stats_senders.push(tx);
        stats_files.push(match &spec.stats_path {
            Some(path) => Some(BufWriter::new(File::create(path).with_context(|| {
                format!("failed to create stats file {}", path.display())
            })?)),
            None => None,
        });
        nodes.push(Node {
            name: spec.name,
            url: spec.url,
            analyzer,
        });
    }
    let nodes = Arc::new(nodes);

    let ops_executed = Arc::new(AtomicU64::new(0));
    let mut workers = Vec::with_capacity(cfg.workers);
    for id in 0..cfg.workers {
        workers.push(tokio::spawn(worker_loop(
            id,
            ops_rx.clone(),
            nodes.clone(),
            stats_senders.clone(),
            dialer.clone(),
            cfg.clone(),
            ops_executed.clone(),
        )));
    }
    // Workers hold the only remaining stats senders; once they exit, each
    // node's channel closes and its consumer drains out.
    drop(ops_rx);
    drop(stats_senders);

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let mut reporter = Reporter {
        nodes: nodes.clone(),
        files: stats_files,
    };
    let report_interval = cfg.report_interval;
    let reporter_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(report_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => reporter.report(),
                _ = stop_rx.changed() => break,
            }
        }
        reporter
    });

    for (id, handle) in workers.into_iter().enumerate() {
        handle
            .await
            .with_context(|| format!("worker {} panicked", id))?
            .with_context(|| format!("worker {} failed", id))?;
    }

    // Let every analyzer drain its channel so the final report sees all
    // samples.
    for consumer in consumers {
        let _ = consumer.await;
    }

    let _ = stop_tx.send(true);
    let mut reporter = reporter_task.await.context("reporter panicked")?;
    reporter.report();

    Ok(ops_executed.load(Ordering::Relaxed))
}

/// One replay unit: a session and executor per node, pulling ops from the
/// shared channel until it closes.
async fn worker_loop(
    id: usize,
    ops_rx: Receiver<Op>,
    nodes: Arc<Vec<Node>>,
    stats_senders: Vec<mpsc::Sender<OpStat>>,
    dialer: Arc<dyn Dialer>,
    cfg: ReplayConfig,
    ops_executed: Arc<AtomicU64>,
) -> Result<()> {
    info!(worker = id, "worker reporting for duty");

    let mut executors: Vec<(String, OpsExecutor)> = Vec::with_capacity(nodes.len());
    for (node, stats_tx) in nodes.iter().zip(stats_senders) {
        let session = dialer.dial(&node.url).await.with_context(|| {
            format!("worker {} failed to dial {} at {}", id, node.name, node.url)
        })?;
        executors.push((node.name.clone(), OpsExecutor::new(session, Some(stats_tx))));
    }

    while let Ok(op) = ops_rx.recv().await {
        let Some(op) = canonicalize_op(op) else {
            continue;
        };

        // Synchronous fan-out: every node sees the op now, and the worker
        // only advances once the slowest node has answered.
        let results = join_all(executors.iter_mut().map(|(_, exec)| exec.execute(&op))).await;

        if cfg.verbose {
            for ((name, _), result) in executors.iter().zip(&results) {
                if let Err(err) = result {
                    error!("[{}] error executing op - {},error:{}", name, op.identity(), err);
                }
            }
        }

        if let Some(threshold) = cfg.slow_op_threshold {
            let was_any_op_slow = executors
                .iter()
                .any(|(_, exec)| exec.last_latency() > threshold);
            if was_any_op_slow {
                let timings = executors
                    .iter()
                    .map(|(name, exec)| format!("{:?} ({})", exec.last_latency(), name))
                    .collect::<Vec<_>>()
                    .join(" ");
                info!("slow op - {} {} content:{}", timings, op.identity(), op.raw.trim());
            }
        }

        ops_executed.fetch_add(1, Ordering::Relaxed);
    }

    info!(worker = id, "worker done");
    Ok(())
}

/// Periodic status printer and stats-file appender.
struct Reporter {
    nodes: Arc<Vec<Node>>,
    files: Vec<Option<BufWriter<File>>>,
}

impl Reporter {
    fn report(&mut self) {
        for (node, file) in self.nodes.iter().zip(self.files.iter_mut()) {
            let status = node.analyzer.get_status();
            print_status(&node.name, &status);
            if let Some(file) = file {
                if let Err(err) = write_stats_line(file, &status) {
                    // A broken stats file must not stop the replay.
                    warn!(node = %node.name, error = %err, "failed to write stats line");
                }
            }
        }
    }
}

fn print_status(name: &str, status: &ExecutionStatus) {
    info!(
        "[{}] Executed {} ops ({} in interval), got {} errors ({} in interval), \
         {:.2} ops/sec (total), {:.2} ops/sec (interval)",
        name,
        status.ops_executed,
        status.interval_ops_executed,
        status.ops_errors,
        status.interval_ops_errors,
        status.ops_per_sec,
        status.interval_ops_per_sec,
    );

    for row in &status.op_types {
        info!(
            "  Op type: {}, count: {}, interval count: {}, avg ops/sec: {:.2}, interval ops/sec: {:.2}",
            row.op_type, row.count, row.interval_count, row.ops_per_sec, row.interval_ops_per_sec,
        );
        info!(
            "   Total: P50: {:.2}ms, P70: {:.2}ms, P90: {:.2}ms, P95: {:.2}ms, P99: {:.2}ms, Max: {:.2}ms",
            row.latencies.p50,
            row.latencies.p70,
            row.latencies.p90,
            row.latencies.p95,
            row.latencies.p99,
            row.max_latency_ms,
        );
        info!(
            "   Interval: P50: {:.2}ms, P70: {:.2}ms, P90: {:.2}ms, P95: {:.2}ms, P99: {:.2}ms, Max: {:.2}ms",
            row.interval_latencies.p50,
            row.interval_latencies.p70,
            row.interval_latencies.p90,
            row.interval_latencies.p95,
            row.interval_latencies.p99,
            row.interval_max_latency_ms,
        );
    }
}

/// One CSV line per interval: timestamp, interval ops, interval ops/sec,
/// then interval count and ops/sec per op type in canonical order. No
/// header row.
fn write_stats_line(writer: &mut impl Write, status: &ExecutionStatus) -> std::io::Result<()> {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S %z");
    let mut line = format!(
        "{},{},{:.2}",
        timestamp, status.interval_ops_executed, status.interval_ops_per_sec
    );
    for row in &status.op_types {
        line.push_str(&format!(
            ",{},{:.2}",
            row.interval_count, row.interval_ops_per_sec
        ));
    }
    writeln!(writer, "{}", line)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::OpType;

    #[test]
    fn test_stats_line_format() {
        let analyzer = StatsAnalyzer::new();
        analyzer.record(OpStat {
            op_type: OpType::Insert,
            latency: Duration::from_millis(2),
            errored: false,
        });
        let status = analyzer.get_status();

        let mut buf = Vec::new();
        write_stats_line(&mut buf, &status).unwrap();
        let line = String::from_utf8(buf).unwrap();
        let fields: Vec<&str> = line.trim_end().split(',').collect();

        // timestamp + interval ops + interval ops/sec, then 6 types x 2.
        assert_eq!(fields.len(), 3 + 6 * 2);
        assert_eq!(fields[1], "1");
        // Insert is the first per-type pair.
        assert_eq!(fields[3], "1");
        // Timestamp carries a zone offset, e.g. "2014-04-02 10:00:00 +0000".
        assert!(fields[0].contains(' '));
    }
}
