//! Trace readers: lazy, finite or cyclic sequences of decoded ops.
//!
//! A trace is one JSON document per line in the profiler-derived format the
//! recorder produces: `ts` (epoch milliseconds, bare or `{"$date": N}`),
//! `ns` (`database.collection`), `op` (raw type tag), and the remaining
//! fields as op content. Decode failures on a single record are logged and
//! the record skipped; only an unopenable file is fatal.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::op::{Op, OpType};

/// A lazy sequence of decoded ops with positioning support.
pub trait OpsReader: Send {
    /// Next decoded op, or `None` at end of stream.
    fn next_op(&mut self) -> Result<Option<Op>>;

    /// Advance past the first `n` ops. Fails if the stream is shorter.
    fn skip_ops(&mut self, n: usize) -> Result<()>;

    /// Advance past all ops recorded before `start_ms` (epoch milliseconds).
    /// Returns the number of ops skipped.
    fn set_start_time(&mut self, start_ms: i64) -> Result<u64>;
}

/// Reads ops from a trace file, one JSON document per line.
pub struct FileOpsReader {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    op_filter: Option<OpType>,
    pending: Option<Op>,
    line_no: u64,
}

impl FileOpsReader {
    /// Open a trace file. `op_filter` restricts the reader to ops whose
    /// raw type tag matches.
    pub fn open(path: &Path, op_filter: Option<OpType>) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open trace file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            lines: BufReader::new(file).lines(),
            op_filter,
            pending: None,
            line_no: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl OpsReader for FileOpsReader {
    fn next_op(&mut self) -> Result<Option<Op>> {
        if let Some(op) = self.pending.take() {
            return Ok(Some(op));
        }

        loop {
            let Some(line) = self.lines.next() else {
                return Ok(None);
            };
            let line = line.with_context(|| {
                format!("read error in trace file {}", self.path.display())
            })?;
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            match decode_line(&line) {
                Ok(op) => {
                    if let Some(filter) = self.op_filter {
                        if op.ty != filter {
                            continue;
                        }
                    }
                    return Ok(Some(op));
                }
                Err(err) => {
                    warn!(line = self.line_no, error = %err, "skipping undecodable trace record");
                }
            }
        }
    }

    fn skip_ops(&mut self, n: usize) -> Result<()> {
        for i in 0..n {
            if self.next_op()?.is_none() {
                bail!("trace ended after {} ops while skipping {}", i, n);
            }
        }
        Ok(())
    }

    fn set_start_time(&mut self, start_ms: i64) -> Result<u64> {
        let cutoff = Utc
            .timestamp_millis_opt(start_ms)
            .single()
            .with_context(|| format!("invalid start time {}", start_ms))?;

        let mut skipped = 0u64;
        while let Some(op) = self.next_op()? {
            if op.timestamp >= cutoff {
                self.pending = Some(op);
                break;
            }
            skipped += 1;
        }
        debug!(skipped, "positioned trace at start time");
        Ok(skipped)
    }
}

/// Decode one trace line into an [`Op`].
fn decode_line(line: &str) -> Result<Op> {
    let value: Value = serde_json::from_str(line).context("invalid JSON")?;
    let doc = value.as_object().context("record is not a JSON object")?;

    let ns = doc
        .get("ns")
        .and_then(Value::as_str)
        .context("missing or non-string ns")?;
    let (database, collection) = ns
        .split_once('.')
        .with_context(|| format!("ns {:?} has no collection part", ns))?;

    let tag = doc
        .get("op")
        .and_then(Value::as_str)
        .context("missing or non-string op")?;
    let ty: OpType = tag.parse()?;

    let timestamp = doc
        .get("ts")
        .and_then(parse_timestamp)
        .context("missing or invalid ts")?;

    Ok(Op {
        database: database.to_string(),
        collection: collection.to_string(),
        ty,
        timestamp,
        content: doc.clone(),
        raw: line.to_string(),
    })
}

/// Trace timestamps are epoch milliseconds, bare or `{"$date": N}`.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let millis = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        Value::Object(map) => {
            let inner = map.get("$date")?;
            inner
                .as_i64()
                .or_else(|| inner.as_f64().map(|f| f as i64))?
        }
        _ => return None,
    };
    Utc.timestamp_millis_opt(millis).single()
}

/// Replays the underlying trace indefinitely.
///
/// On end-of-stream the file is reopened and each new cycle's timestamps
/// are shifted by an accumulated offset, so the first op of cycle k+1 is
/// scheduled immediately after the last op of cycle k and pacing stays
/// monotonic across wraps.
pub struct CyclicOpsReader {
    make_reader: Box<dyn Fn() -> Result<Box<dyn OpsReader>> + Send>,
    inner: Box<dyn OpsReader>,
    offset: chrono::Duration,
    last_timestamp: Option<DateTime<Utc>>,
}

impl CyclicOpsReader {
    pub fn new(
        make_reader: impl Fn() -> Result<Box<dyn OpsReader>> + Send + 'static,
    ) -> Result<Self> {
        let inner = make_reader()?;
        Ok(Self {
            make_reader: Box::new(make_reader),
            inner,
            offset: chrono::Duration::zero(),
            last_timestamp: None,
        })
    }
}

impl OpsReader for CyclicOpsReader {
    fn next_op(&mut self) -> Result<Option<Op>> {
        let mut op = match self.inner.next_op()? {
            Some(op) => op,
            None => {
                info!("trace exhausted, rewinding for next cycle");
                self.inner = (self.make_reader)()?;
                let Some(first) = self.inner.next_op()? else {
                    bail!("trace is empty, cannot cycle");
                };
                if let Some(last) = self.last_timestamp {
                    // Schedule the new cycle's first op right after the
                    // previous cycle's last op.
                    self.offset = last - first.timestamp;
                }
                first
            }
        };
        op.timestamp = op.timestamp + self.offset;
        self.last_timestamp = Some(op.timestamp);
        Ok(Some(op))
    }

    fn skip_ops(&mut self, n: usize) -> Result<()> {
        self.inner.skip_ops(n)
    }

    fn set_start_time(&mut self, start_ms: i64) -> Result<u64> {
        self.inner.set_start_time(start_ms)
    }
}
