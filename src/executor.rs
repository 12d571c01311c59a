//! Per-(worker, node) op execution: dispatch on the op type, single-retry
//! recovery over transport failures, wall-clock latency capture, and one
//! OpStat emission per invocation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::op::{Op, OpStat, OpType};
use crate::session::{FindSpec, Session, SessionError};

/// Executes ops against one session and reports latency samples to one
/// node's statistics channel.
pub struct OpsExecutor {
    session: Arc<dyn Session>,
    stats_tx: Option<mpsc::Sender<OpStat>>,
    last_latency: Duration,
}

impl OpsExecutor {
    pub fn new(session: Arc<dyn Session>, stats_tx: Option<mpsc::Sender<OpStat>>) -> Self {
        Self {
            session,
            stats_tx,
            last_latency: Duration::ZERO,
        }
    }

    /// Latency of the most recent [`execute`](Self::execute) call,
    /// spanning both attempts when a retry happened. Used by the worker
    /// for slow-op reporting.
    pub fn last_latency(&self) -> Duration {
        self.last_latency
    }

    /// Execute one canonicalized op.
    ///
    /// Query-level errors, not-found, and unsupported types return
    /// immediately. Anything else is treated as a socket failure: the
    /// session is refreshed and the call retried exactly once, and the
    /// retry's outcome is final. Exactly one OpStat is emitted per call,
    /// success or failure.
    pub async fn execute(&mut self, op: &Op) -> Result<(), SessionError> {
        let started = Instant::now();

        let mut result = self.execute_once(op).await;
        let should_retry = match &result {
            Err(err) if err.is_retryable() => {
                warn!(error = %err, "retrying op after transport error");
                true
            }
            _ => false,
        };
        if should_retry {
            self.session.refresh().await;
            result = self.execute_once(op).await;
        }

        let latency = started.elapsed();
        self.last_latency = latency;

        if let Some(tx) = &self.stats_tx {
            let stat = OpStat {
                op_type: op.ty,
                latency,
                errored: result.is_err(),
            };
            // A closed channel means the analyzer is gone; the sample has
            // nowhere useful to go.
            let _ = tx.send(stat).await;
        }

        result
    }

    async fn execute_once(&self, op: &Op) -> Result<(), SessionError> {
        let db = op.database.as_str();
        let coll = op.collection.as_str();

        match op.ty {
            OpType::Insert => {
                let doc = required_field(op, "o")?;
                self.session.insert(db, coll, doc).await
            }
            OpType::Update => {
                let query = required_field(op, "query")?;
                let update = required_field(op, "updateobj")?;
                self.session.update(db, coll, query, update).await
            }
            OpType::Remove => {
                let query = required_field(op, "query")?;
                self.session.remove(db, coll, query).await
            }
            OpType::Query => {
                let spec = build_find_spec(op);
                self.session.find(db, coll, spec).await.map(|_| ())
            }
            OpType::Count => self.session.count(db, coll).await.map(|_| ()),
            OpType::FindAndModify => {
                let query = required_field(op, "query")?;
                let update = required_field(op, "update")?;
                self.session.find_and_modify(db, coll, query, update).await
            }
            // The canonicalizer never lets a raw command through.
            OpType::Command => Err(SessionError::NotSupported),
        }
    }
}

fn required_field<'a>(op: &'a Op, key: &str) -> Result<&'a Value, SessionError> {
    op.content
        .get(key)
        .ok_or_else(|| SessionError::Query(format!("op is missing {:?} ({})", key, op.identity())))
}

/// Assemble the find from the op content.
///
/// A query wrapped in a `$query`/`$orderby`/`$hint` envelope uses the
/// inner `$query` as selector; sort and hint field order comes from the
/// raw text, since the structured payload lost it.
fn build_find_spec(op: &Op) -> FindSpec<'_> {
    let mut spec = FindSpec::default();

    let query = op.content.get("query");
    match query {
        Some(Value::Object(envelope)) if envelope.contains_key("$query") => {
            spec.selector = envelope.get("$query");
            if envelope.contains_key("$orderby") {
                spec.sort = get_args(&op.raw, "$orderby");
            }
            if envelope.contains_key("$hint") {
                spec.hint = get_args(&op.raw, "$hint");
            }
        }
        _ => spec.selector = query,
    }

    spec.limit = numeric_field(op, "ntoreturn");
    spec.skip = numeric_field(op, "ntoskip").and_then(|v| u64::try_from(v).ok());
    spec
}

/// Recorded numerics arrive as any JSON number type; a non-numeric value
/// is logged and the option left unset rather than failing the op.
fn numeric_field(op: &Op, key: &str) -> Option<i64> {
    let value = op.content.get(key)?;
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => {
            error!(op = %op.identity(), key, "could not read numeric field, ignoring");
            None
        }
    }
}

/// Extract ordered index/sort arguments from the raw op text.
///
/// Transforms `"$orderby": { "organization": 1, "date_created": -1 }` into
/// `["organization", "-date_created"]`, keeping textual order. The text
/// has already survived JSON decoding, so the scan assumes proper format:
/// find the quoted key, then walk the `"field": ±1` entries inside the
/// enclosing braces with a three-state machine (looking for key / in key /
/// reading direction).
pub fn get_args(text: &str, key: &str) -> Vec<String> {
    let needle = format!("\"{}\"", key);
    let Some(start) = text.find(&needle) else {
        return Vec::new();
    };
    let rest = &text[start + needle.len()..];

    let mut args: Vec<String> = Vec::new();
    let mut buffer = String::new();
    let mut state = 0u8;

    for c in rest.chars() {
        if state == 0 && c == '}' {
            break;
        } else if state == 0 && c == '"' {
            state = 1;
        } else if state == 1 {
            if c == '"' {
                args.push(std::mem::take(&mut buffer));
                state = 2;
            } else {
                buffer.push(c);
            }
        } else if state == 2 && c == '-' {
            if let Some(last) = args.last_mut() {
                last.insert(0, '-');
            }
        } else if state == 2 && c == '1' {
            state = 0;
        }
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_get_args_orderby() {
        let text = r#"{"query": {"$query": {}, "$orderby": { "a": 1, "b": -1, "c": 1 }}}"#;
        assert_eq!(get_args(text, "$orderby"), vec!["a", "-b", "c"]);
    }

    #[test]
    fn test_get_args_hint() {
        let text = r#"{"$hint": {"organization": 1, "date_created": -1}}"#;
        assert_eq!(
            get_args(text, "$hint"),
            vec!["organization", "-date_created"]
        );
    }

    #[test]
    fn test_get_args_stops_at_closing_brace() {
        let text = r#"{"$orderby": {"a": 1}, "other": {"b": -1}}"#;
        assert_eq!(get_args(text, "$orderby"), vec!["a"]);
    }

    #[test]
    fn test_get_args_missing_key() {
        assert!(get_args("{}", "$orderby").is_empty());
    }

    /// Captured arguments of the last find call.
    #[derive(Debug, Default, Clone)]
    struct RecordedFind {
        selector: Option<Value>,
        sort: Vec<String>,
        hint: Vec<String>,
        limit: Option<i64>,
        skip: Option<u64>,
    }

    /// Mock session that fails the first call with a scripted error, then
    /// succeeds. Counts calls and refreshes.
    #[derive(Default)]
    struct MockSession {
        fail_first_with: Mutex<Option<SessionError>>,
        calls: AtomicU64,
        refreshes: AtomicU64,
        last_find: Mutex<Option<RecordedFind>>,
    }

    impl MockSession {
        fn failing_once(err: SessionError) -> Self {
            Self {
                fail_first_with: Mutex::new(Some(err)),
                ..Default::default()
            }
        }

        fn invoke(&self) -> Result<(), SessionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_first_with.lock().take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    #[async_trait::async_trait]
    impl Session for MockSession {
        async fn insert(&self, _: &str, _: &str, _: &Value) -> Result<(), SessionError> {
            self.invoke()
        }

        async fn update(&self, _: &str, _: &str, _: &Value, _: &Value) -> Result<(), SessionError> {
            self.invoke()
        }

        async fn remove(&self, _: &str, _: &str, _: &Value) -> Result<(), SessionError> {
            self.invoke()
        }

        async fn find(&self, _: &str, _: &str, spec: FindSpec<'_>) -> Result<u64, SessionError> {
            *self.last_find.lock() = Some(RecordedFind {
                selector: spec.selector.cloned(),
                sort: spec.sort.clone(),
                hint: spec.hint.clone(),
                limit: spec.limit,
                skip: spec.skip,
            });
            self.invoke().map(|_| 0)
        }

        async fn count(&self, _: &str, _: &str) -> Result<u64, SessionError> {
            self.invoke().map(|_| 0)
        }

        async fn find_and_modify(
            &self,
            _: &str,
            _: &str,
            _: &Value,
            _: &Value,
        ) -> Result<(), SessionError> {
            self.invoke()
        }

        async fn refresh(&self) {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn insert_op() -> Op {
        let content = json!({"o": {"a": 1}});
        Op {
            database: "db".to_string(),
            collection: "c".to_string(),
            ty: OpType::Insert,
            timestamp: Utc::now(),
            content: content.as_object().unwrap().clone(),
            raw: content.to_string(),
        }
    }

    #[tokio::test]
    async fn test_transport_error_retries_once_with_refresh() {
        let session = Arc::new(MockSession::failing_once(SessionError::Transport(
            "connection reset".to_string(),
        )));
        let (tx, mut rx) = mpsc::channel(8);
        let mut exec = OpsExecutor::new(session.clone(), Some(tx));

        let result = exec.execute(&insert_op()).await;
        assert!(result.is_ok());
        assert_eq!(session.calls.load(Ordering::SeqCst), 2);
        assert_eq!(session.refreshes.load(Ordering::SeqCst), 1);

        // Exactly one OpStat, marked as success.
        let stat = rx.try_recv().unwrap();
        assert_eq!(stat.op_type, OpType::Insert);
        assert!(!stat.errored);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_query_error_is_not_retried() {
        let session = Arc::new(MockSession::failing_once(SessionError::Query(
            "bad query".to_string(),
        )));
        let (tx, mut rx) = mpsc::channel(8);
        let mut exec = OpsExecutor::new(session.clone(), Some(tx));

        let result = exec.execute(&insert_op()).await;
        assert!(result.is_err());
        assert_eq!(session.calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.refreshes.load(Ordering::SeqCst), 0);

        let stat = rx.try_recv().unwrap();
        assert!(stat.errored);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let session = Arc::new(MockSession::failing_once(SessionError::NotFound));
        let mut exec = OpsExecutor::new(session.clone(), None);
        assert!(exec.execute(&insert_op()).await.is_err());
        assert_eq!(session.calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_plain_query_selector() {
        let session = Arc::new(MockSession::default());
        let mut exec = OpsExecutor::new(session.clone(), None);

        let content = json!({"query": {"state": "new"}});
        let op = Op {
            database: "db".to_string(),
            collection: "c".to_string(),
            ty: OpType::Query,
            timestamp: Utc::now(),
            content: content.as_object().unwrap().clone(),
            raw: content.to_string(),
        };
        exec.execute(&op).await.unwrap();

        let find = session.last_find.lock().clone().unwrap();
        assert_eq!(find.selector, Some(json!({"state": "new"})));
        assert!(find.sort.is_empty());
        assert!(find.hint.is_empty());
    }

    #[tokio::test]
    async fn test_query_envelope_extraction() {
        let session = Arc::new(MockSession::default());
        let mut exec = OpsExecutor::new(session.clone(), None);

        let raw = r#"{"query": {"$query": {"user": 7}, "$orderby": {"created": -1, "id": 1}, "$hint": {"user": 1}}, "ntoreturn": 25, "ntoskip": 5}"#;
        let content: Value = serde_json::from_str(raw).unwrap();
        let op = Op {
            database: "db".to_string(),
            collection: "c".to_string(),
            ty: OpType::Query,
            timestamp: Utc::now(),
            content: content.as_object().unwrap().clone(),
            raw: raw.to_string(),
        };
        exec.execute(&op).await.unwrap();

        let find = session.last_find.lock().clone().unwrap();
        assert_eq!(find.selector, Some(json!({"user": 7})));
        assert_eq!(find.sort, vec!["-created", "id"]);
        assert_eq!(find.hint, vec!["user"]);
        assert_eq!(find.limit, Some(25));
        assert_eq!(find.skip, Some(5));
    }

    #[tokio::test]
    async fn test_latency_spans_both_attempts() {
        struct SlowRetrySession {
            inner: MockSession,
        }

        #[async_trait::async_trait]
        impl Session for SlowRetrySession {
            async fn insert(&self, db: &str, coll: &str, doc: &Value) -> Result<(), SessionError> {
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.inner.insert(db, coll, doc).await
            }

            async fn update(
                &self,
                _: &str,
                _: &str,
                _: &Value,
                _: &Value,
            ) -> Result<(), SessionError> {
                unreachable!()
            }

            async fn remove(&self, _: &str, _: &str, _: &Value) -> Result<(), SessionError> {
                unreachable!()
            }

            async fn find(&self, _: &str, _: &str, _: FindSpec<'_>) -> Result<u64, SessionError> {
                unreachable!()
            }

            async fn count(&self, _: &str, _: &str) -> Result<u64, SessionError> {
                unreachable!()
            }

            async fn find_and_modify(
                &self,
                _: &str,
                _: &str,
                _: &Value,
                _: &Value,
            ) -> Result<(), SessionError> {
                unreachable!()
            }

            async fn refresh(&self) {
                self.inner.refresh().await;
            }
        }

        let session = Arc::new(SlowRetrySession {
            inner: MockSession::failing_once(SessionError::Transport("reset".to_string())),
        });
        let mut exec = OpsExecutor::new(session, None);
        exec.execute(&insert_op()).await.unwrap();
        // Two attempts at >= 20 ms each.
        assert!(exec.last_latency() >= Duration::from_millis(40));
    }
}
