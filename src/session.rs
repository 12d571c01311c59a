//! The driver seam: an opaque database session able to execute each
//! supported operation kind, plus the error taxonomy the retry policy
//! dispatches on.
//!
//! The replay engine only ever talks to [`Session`] and [`Dialer`]; the
//! production implementation lives in [`crate::mongo`], and tests plug in
//! mock sessions.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Error classification for one database call.
///
/// Only `Transport` is retryable. Unknown driver errors are classified as
/// transport by the session implementations, so the default for anything
/// unrecognized is one refresh-and-retry.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// The server rejected the operation (query failure, write error).
    #[error("query error: {0}")]
    Query(String),

    /// The operation targeted a document that does not exist.
    #[error("not found")]
    NotFound,

    /// The op type cannot be replayed.
    #[error("op type not supported")]
    NotSupported,

    /// Socket-level failure; the session should be refreshed and the call
    /// retried once.
    #[error("transport error: {0}")]
    Transport(String),
}

impl SessionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::Transport(_))
    }
}

/// A find, with the ordered sort/hint field lists already extracted.
///
/// Sort and hint fields use the `-` prefix for descending order, in the
/// textual order they appeared in the recorded op.
#[derive(Debug, Default, Clone)]
pub struct FindSpec<'a> {
    pub selector: Option<&'a Value>,
    pub sort: Vec<String>,
    pub hint: Vec<String>,
    pub limit: Option<i64>,
    pub skip: Option<u64>,
}

/// One live connection to a replay target.
///
/// Implementations materialize query results but do not return them; the
/// engine measures performance, not result sets.
#[async_trait]
pub trait Session: Send + Sync {
    async fn insert(&self, db: &str, coll: &str, doc: &Value) -> Result<(), SessionError>;

    async fn update(
        &self,
        db: &str,
        coll: &str,
        query: &Value,
        update: &Value,
    ) -> Result<(), SessionError>;

    async fn remove(&self, db: &str, coll: &str, query: &Value) -> Result<(), SessionError>;

    /// Run a find and drain the cursor. Returns the number of documents
    /// consumed.
    async fn find(&self, db: &str, coll: &str, spec: FindSpec<'_>) -> Result<u64, SessionError>;

    async fn count(&self, db: &str, coll: &str) -> Result<u64, SessionError>;

    async fn find_and_modify(
        &self,
        db: &str,
        coll: &str,
        query: &Value,
        update: &Value,
    ) -> Result<(), SessionError>;

    /// Re-establish the underlying connection after a transport error.
    async fn refresh(&self);
}

/// Dials sessions to a node URL. One session per (worker, node); sessions
/// are never shared across workers.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, url: &str) -> Result<Arc<dyn Session>>;
}
