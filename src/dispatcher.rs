//! Dispatchers: turn a trace reader into a demand-driven channel of ops.
//!
//! The stress dispatcher emits as fast as downstream consumes. The
//! time-faithful dispatcher anchors wall clock at its first emission and
//! schedules every subsequent op at the recorded offset divided by the
//! speedup factor; ops whose deadline already passed are emitted
//! immediately, with no catch-up acceleration and no dropping.
//!
//! Both run the synchronous reader loop on a dedicated blocking thread and
//! sleep with `std::thread::sleep` for sub-millisecond pacing precision.

use std::time::{Duration, Instant};

use async_channel::{bounded, Receiver, Sender};
use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::op::Op;
use crate::reader::OpsReader;

/// Capacity of the shared op channel. One producer, `workers` consumers;
/// deep enough to keep workers fed, shallow enough that stress pacing
/// tracks downstream demand.
pub const DISPATCH_QUEUE_DEPTH: usize = 128;

/// Emit ops as fast as the consumers accept them, bounded only by
/// `max_ops` (0 = unbounded).
pub fn stress_dispatcher(reader: Box<dyn OpsReader>, max_ops: u64) -> Receiver<Op> {
    let (tx, rx) = bounded(DISPATCH_QUEUE_DEPTH);
    tokio::task::spawn_blocking(move || dispatch_loop(reader, tx, max_ops, None));
    rx
}

/// Emit ops honoring the recorded inter-arrival gaps scaled by `speedup`.
pub fn timed_dispatcher(reader: Box<dyn OpsReader>, max_ops: u64, speedup: f64) -> Receiver<Op> {
    let (tx, rx) = bounded(DISPATCH_QUEUE_DEPTH);
    tokio::task::spawn_blocking(move || dispatch_loop(reader, tx, max_ops, Some(speedup)));
    rx
}

fn dispatch_loop(
    mut reader: Box<dyn OpsReader>,
    tx: Sender<Op>,
    max_ops: u64,
    speedup: Option<f64>,
) {
    // Wall-clock and trace-time anchors, set at the first emission.
    let mut anchor: Option<(Instant, DateTime<Utc>)> = None;
    let mut emitted = 0u64;

    loop {
        if max_ops > 0 && emitted >= max_ops {
            break;
        }

        let op = match reader.next_op() {
            Ok(Some(op)) => op,
            Ok(None) => break,
            Err(err) => {
                error!(error = %err, "trace read failed, closing op channel");
                break;
            }
        };

        if let Some(speedup) = speedup {
            match anchor {
                None => anchor = Some((Instant::now(), op.timestamp)),
                Some((wall_zero, trace_zero)) => {
                    let trace_elapsed = (op.timestamp - trace_zero)
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    let target = wall_zero + Duration::from_secs_f64(trace_elapsed.as_secs_f64() / speedup);
                    let now = Instant::now();
                    if target > now {
                        std::thread::sleep(target - now);
                    }
                    // A deadline in the past means the consumers fell
                    // behind; emit immediately.
                }
            }
        }

        if tx.send_blocking(op).is_err() {
            // All workers are gone.
            break;
        }
        emitted += 1;
    }

    info!(emitted, "dispatcher finished");
    // Dropping the sender closes the channel; workers drain and exit.
}
