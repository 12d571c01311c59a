//! Operation model for recorded MongoDB workloads.
//!
//! An [`Op`] is one recorded client action, decoded from a trace line. The
//! structured payload keeps the nested shape of the recorded document but
//! not its key order, so the raw line text travels alongside it for the
//! order-sensitive `$orderby`/`$hint` extraction in the executor.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Structured content payload of an op: string keys to dynamically typed
/// values, nested maps preserved.
pub type Document = Map<String, Value>;

/// Operation type tag.
///
/// `Command` only exists between decoding and canonicalization; every op
/// handed to an executor carries one of the other six tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    Insert,
    Update,
    Remove,
    Query,
    Command,
    Count,
    FindAndModify,
}

/// Replayable op types, in the canonical reporting order.
pub const ALL_OP_TYPES: [OpType; 6] = [
    OpType::Insert,
    OpType::Update,
    OpType::Remove,
    OpType::Query,
    OpType::Count,
    OpType::FindAndModify,
];

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Insert => "insert",
            OpType::Update => "update",
            OpType::Remove => "remove",
            OpType::Query => "query",
            OpType::Command => "command",
            OpType::Count => "command.count",
            OpType::FindAndModify => "command.findandmodify",
        }
    }

    /// Index into per-type stat arrays. Only valid for replayable types.
    pub(crate) fn stat_index(&self) -> Option<usize> {
        ALL_OP_TYPES.iter().position(|t| t == self)
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "insert" => Ok(OpType::Insert),
            "update" => Ok(OpType::Update),
            "remove" => Ok(OpType::Remove),
            "query" => Ok(OpType::Query),
            "command" => Ok(OpType::Command),
            "command.count" => Ok(OpType::Count),
            "command.findandmodify" => Ok(OpType::FindAndModify),
            _ => bail!("unknown op type: {}", s),
        }
    }
}

/// One recorded operation, with enough detail to be replayed.
#[derive(Debug, Clone)]
pub struct Op {
    pub database: String,
    pub collection: String,
    pub ty: OpType,
    /// When the op was performed, in recorded wall time.
    pub timestamp: DateTime<Utc>,
    /// Structured payload. Key order is NOT preserved.
    pub content: Document,
    /// The original decoded line. Key order is significant for ordered
    /// index hints and sort specifiers, which `content` loses.
    pub raw: String,
}

impl Op {
    /// Identifying fields for diagnostics (verbose errors, slow-op logs).
    pub fn identity(&self) -> String {
        format!(
            "type:{},database:{},collection:{}",
            self.ty, self.database, self.collection
        )
    }
}

/// One latency sample, produced once per executor invocation.
#[derive(Debug, Clone, Copy)]
pub struct OpStat {
    pub op_type: OpType,
    pub latency: Duration,
    pub errored: bool,
}

/// Normalize a recorded `command` op into a first-class typed op.
///
/// The recorded trace wraps certain operations in a generic command
/// envelope; executors dispatch on the closed type set only. Commands that
/// carry a `findandmodify` or `count` key are rewritten to the matching
/// type, with the key's string value as the target collection and the
/// inner command document promoted to the op content. Every other command
/// is dropped. Non-command ops pass through unchanged.
pub fn canonicalize_op(mut op: Op) -> Option<Op> {
    if op.ty != OpType::Command {
        return Some(op);
    }

    let cmd = op.content.get("command")?.as_object()?.clone();

    for (key, ty) in [
        ("findandmodify", OpType::FindAndModify),
        ("count", OpType::Count),
    ] {
        let Some(value) = cmd.get(key) else {
            continue;
        };
        op.ty = ty;
        op.collection = value.as_str()?.to_string();
        op.content = cmd;
        return Some(op);
    }

    None
}
