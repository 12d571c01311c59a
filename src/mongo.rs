//! Production [`Session`] over the MongoDB driver.
//!
//! The rest of the engine never sees driver types; everything it needs is
//! behind the [`Session`]/[`Dialer`] seam so it can run against mocks.
//! Unknown driver error kinds classify as transport (refresh and retry
//! once), which is the conservative default the retry policy expects.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, FindOptions, Hint};
use mongodb::Client;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::warn;

use crate::session::{Dialer, FindSpec, Session, SessionError};

/// Dials one [`MongoSession`] per call, with the configured socket
/// timeout applied to connect and server selection.
pub struct MongoDialer {
    socket_timeout: Duration,
}

impl MongoDialer {
    pub fn new(socket_timeout: Duration) -> Self {
        Self { socket_timeout }
    }
}

#[async_trait]
impl Dialer for MongoDialer {
    async fn dial(&self, url: &str) -> Result<Arc<dyn Session>> {
        let uri = normalize_url(url);
        let mut options = ClientOptions::parse(&uri)
            .await
            .with_context(|| format!("invalid database url {}", url))?;
        options.connect_timeout = Some(self.socket_timeout);
        options.server_selection_timeout = Some(self.socket_timeout);

        let client = Client::with_options(options.clone())
            .with_context(|| format!("failed to build client for {}", url))?;
        // Fail fast on unreachable targets instead of at the first op.
        client
            .database("admin")
            .run_command(doc! {"ping": 1}, None)
            .await
            .with_context(|| format!("cannot reach database at {}", url))?;

        Ok(Arc::new(MongoSession {
            client: RwLock::new(client),
            options,
        }))
    }
}

/// A refreshable client handle bound to one node.
pub struct MongoSession {
    client: RwLock<Client>,
    options: ClientOptions,
}

impl MongoSession {
    fn collection(&self, db: &str, coll: &str) -> mongodb::Collection<Document> {
        self.client.read().database(db).collection::<Document>(coll)
    }
}

#[async_trait]
impl Session for MongoSession {
    async fn insert(&self, db: &str, coll: &str, document: &Value) -> Result<(), SessionError> {
        let document = to_document(document)?;
        self.collection(db, coll)
            .insert_one(document, None)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn update(
        &self,
        db: &str,
        coll: &str,
        query: &Value,
        update: &Value,
    ) -> Result<(), SessionError> {
        let filter = to_document(query)?;
        let change = to_document(update)?;
        let coll = self.collection(db, coll);
        // Recorded updates are either operator documents or whole-document
        // replacements; the wire op differs between the two.
        let result = if is_operator_update(&change) {
            coll.update_one(filter, change, None).await.map(|_| ())
        } else {
            coll.replace_one(filter, change, None).await.map(|_| ())
        };
        result.map_err(classify)
    }

    async fn remove(&self, db: &str, coll: &str, query: &Value) -> Result<(), SessionError> {
        let filter = to_document(query)?;
        self.collection(db, coll)
            .delete_one(filter, None)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn find(&self, db: &str, coll: &str, spec: FindSpec<'_>) -> Result<u64, SessionError> {
        let filter = match spec.selector {
            Some(selector) => Some(to_document(selector)?),
            None => None,
        };

        let mut options = FindOptions::default();
        if !spec.sort.is_empty() {
            options.sort = Some(ordered_keys_document(&spec.sort));
        }
        if !spec.hint.is_empty() {
            options.hint = Some(Hint::Keys(ordered_keys_document(&spec.hint)));
        }
        options.limit = spec.limit;
        options.skip = spec.skip;

        let mut cursor = self
            .collection(db, coll)
            .find(filter, options)
            .await
            .map_err(classify)?;

        // Materialize all results; only the count is kept.
        let mut consumed = 0u64;
        loop {
            match cursor.try_next().await {
                Ok(Some(_)) => consumed += 1,
                Ok(None) => break,
                Err(err) => return Err(classify(err)),
            }
        }
        Ok(consumed)
    }

    async fn count(&self, db: &str, coll: &str) -> Result<u64, SessionError> {
        self.collection(db, coll)
            .estimated_document_count(None)
            .await
            .map_err(classify)
    }

    async fn find_and_modify(
        &self,
        db: &str,
        coll: &str,
        query: &Value,
        update: &Value,
    ) -> Result<(), SessionError> {
        let filter = to_document(query)?;
        let change = to_document(update)?;
        let coll = self.collection(db, coll);
        let result = if is_operator_update(&change) {
            coll.find_one_and_update(filter, change, None).await
        } else {
            coll.find_one_and_replace(filter, change, None).await
        };
        match result {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(SessionError::NotFound),
            Err(err) => Err(classify(err)),
        }
    }

    async fn refresh(&self) {
        match Client::with_options(self.options.clone()) {
            Ok(client) => *self.client.write() = client,
            Err(err) => {
                warn!(error = %err, "failed to rebuild session, keeping existing connection");
            }
        }
    }
}

/// The CLI takes bare `host[:port]` targets; the driver wants a URI.
fn normalize_url(url: &str) -> String {
    if url.contains("://") {
        url.to_string()
    } else {
        format!("mongodb://{}", url)
    }
}

fn to_document(value: &Value) -> Result<Document, SessionError> {
    mongodb::bson::to_document(value)
        .map_err(|err| SessionError::Query(format!("unencodable document: {}", err)))
}

/// `["a", "-b"]` becomes `{a: 1, b: -1}`, preserving field order.
fn ordered_keys_document(fields: &[String]) -> Document {
    let mut doc = Document::new();
    for field in fields {
        match field.strip_prefix('-') {
            Some(name) => doc.insert(name, -1),
            None => doc.insert(field.as_str(), 1),
        };
    }
    doc
}

fn is_operator_update(update: &Document) -> bool {
    update.keys().next().map_or(false, |key| key.starts_with('$'))
}

fn classify(err: mongodb::error::Error) -> SessionError {
    match err.kind.as_ref() {
        // Logical failures the server reported; retrying cannot help.
        ErrorKind::Command(_) | ErrorKind::Write(_) | ErrorKind::InvalidArgument { .. } => {
            SessionError::Query(err.to_string())
        }
        // Everything else is presumed to be a socket-level failure.
        _ => SessionError::Transport(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("localhost:27017"), "mongodb://localhost:27017");
        assert_eq!(
            normalize_url("mongodb://rs0.example.com/?replicaSet=rs0"),
            "mongodb://rs0.example.com/?replicaSet=rs0"
        );
    }

    #[test]
    fn test_ordered_keys_document() {
        let doc = ordered_keys_document(&[
            "organization".to_string(),
            "-date_created".to_string(),
        ]);
        let keys: Vec<&str> = doc.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["organization", "date_created"]);
        assert_eq!(doc.get_i32("organization").unwrap(), 1);
        assert_eq!(doc.get_i32("date_created").unwrap(), -1);
    }

    #[test]
    fn test_is_operator_update() {
        let set = doc! {"$set": {"a": 1}};
        let replace = doc! {"a": 1};
        assert!(is_operator_update(&set));
        assert!(!is_operator_update(&replace));
        assert!(!is_operator_update(&Document::new()));
    }
}
