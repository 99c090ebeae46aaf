// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! Collection dispatcher.
//!
//! Consumes relayed commits and turns each typed record into storage
//! mutations. The outcome of a handler decides whether the message is
//! acknowledged: bad records and missing targets are acknowledged and
//! dropped, backend failures are returned so the message is redelivered.

mod follow;
mod like;
mod post;
mod profile;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::bus::EventHandler;
use crate::events::{
    record_uri, Commit, FirehoseEvent, FOLLOW_COLLECTION, LIKE_COLLECTION, POST_COLLECTION,
    PROFILE_COLLECTION,
};
use crate::metrics::SharedMetrics;
use crate::store::{SocialStore, StoreError};

#[derive(Debug, Error)]
pub enum IndexError {
    /// Record could not be decoded or failed validation
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    /// Operation the collection does not support, e.g. editing a post
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("not found")]
    NotFound,
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for IndexError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => IndexError::NotFound,
            // Rejected input will be rejected again on redelivery
            StoreError::InvalidArgument(message) => IndexError::InvalidRecord(message),
            other => IndexError::Store(other),
        }
    }
}

impl IndexError {
    fn status(&self) -> &'static str {
        match self {
            IndexError::InvalidRecord(_) => "invalid",
            IndexError::Unsupported(_) => "unsupported",
            IndexError::NotFound => "not_found",
            IndexError::Store(_) => "error",
        }
    }
}

pub type IndexResult<T> = Result<T, IndexError>;

/// Decode the JSON record carried on a commit
pub(crate) fn decode_record<T: serde::de::DeserializeOwned>(commit: &Commit) -> IndexResult<T> {
    crate::events::parse_record(&commit.record).map_err(|e| {
        IndexError::InvalidRecord(format!(
            "failed to decode {} record: {}",
            commit.collection, e
        ))
    })
}

pub(crate) fn parse_time(raw: &str) -> IndexResult<chrono::DateTime<chrono::Utc>> {
    crate::events::records::parse_created_at(raw)
        .map_err(|e| IndexError::InvalidRecord(format!("invalid createdAt {:?}: {}", raw, e)))
}

pub struct Indexer {
    store: Arc<dyn SocialStore>,
    metrics: SharedMetrics,
    skip_unsupported_updates: bool,
}

impl Indexer {
    pub fn new(store: Arc<dyn SocialStore>, metrics: SharedMetrics) -> Self {
        Self {
            store,
            metrics,
            skip_unsupported_updates: false,
        }
    }

    /// Acknowledge updates to immutable collections instead of retrying them
    pub fn skip_unsupported_updates(mut self, skip: bool) -> Self {
        self.skip_unsupported_updates = skip;
        self
    }

    async fn dispatch(&self, event: &FirehoseEvent, commit: &Commit) -> Option<IndexResult<()>> {
        let uri = record_uri(&event.did, &commit.collection, &commit.rkey);
        let store = self.store.as_ref();
        let result = match commit.collection.as_str() {
            PROFILE_COLLECTION => profile::handle(store, event, commit).await,
            POST_COLLECTION => post::handle(store, event, commit, &uri).await,
            LIKE_COLLECTION => like::handle(store, event, commit, &uri).await,
            FOLLOW_COLLECTION => follow::handle(store, event, commit, &uri).await,
            _ => return None,
        };
        Some(result)
    }

    fn settle(&self, event: &FirehoseEvent, commit: &Commit, result: IndexResult<()>) -> anyhow::Result<()> {
        let status = match &result {
            Ok(()) => "ok",
            Err(e) => e.status(),
        };
        self.metrics.incr(
            "indexer_events_handled",
            &[
                ("collection", commit.collection.as_str()),
                ("operation", commit.operation.as_str()),
                ("status", status),
            ],
        );

        match result {
            Ok(()) => {
                debug!(did = %event.did, collection = %commit.collection, rkey = %commit.rkey, "Indexed {}", commit.operation.as_str());
                Ok(())
            }
            Err(IndexError::InvalidRecord(message)) => {
                warn!(did = %event.did, collection = %commit.collection, rkey = %commit.rkey, "Skipping invalid record: {}", message);
                Ok(())
            }
            Err(IndexError::NotFound) => {
                warn!(did = %event.did, collection = %commit.collection, rkey = %commit.rkey, "Target of {} not found, acknowledging", commit.operation.as_str());
                Ok(())
            }
            Err(IndexError::Unsupported(message)) if self.skip_unsupported_updates => {
                warn!(did = %event.did, collection = %commit.collection, rkey = %commit.rkey, "Skipping unsupported operation: {}", message);
                Ok(())
            }
            Err(e) => {
                error!(did = %event.did, collection = %commit.collection, rkey = %commit.rkey, "Failed to index record: {}", e);
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl EventHandler for Indexer {
    async fn handle_event(&self, event: &FirehoseEvent) -> anyhow::Result<()> {
        let Some(commit) = event.commit() else {
            return Ok(());
        };
        match self.dispatch(event, commit).await {
            Some(result) => self.settle(event, commit, result),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::{CommitOperation, EventKind};
    use crate::metrics::InMemoryMetrics;
    use crate::store::MemoryStore;
    use serde_json::{json, Value};

    pub(crate) fn commit_event(
        did: &str,
        collection: &str,
        rkey: &str,
        operation: CommitOperation,
        record: Option<Value>,
    ) -> FirehoseEvent {
        FirehoseEvent {
            did: did.to_string(),
            timestamp: "2024-01-01T00:00:00Z".parse().unwrap(),
            kind: EventKind::Commit(Commit {
                rev: "3kabc".to_string(),
                operation,
                collection: collection.to_string(),
                rkey: rkey.to_string(),
                record: record
                    .map(|r| serde_json::to_vec(&r).unwrap())
                    .unwrap_or_default(),
                cid: "bafyreirecord".to_string(),
            }),
        }
    }

    pub(crate) fn indexer() -> (Indexer, Arc<MemoryStore>, Arc<InMemoryMetrics>) {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        (Indexer::new(store.clone(), metrics.clone()), store, metrics)
    }

    fn handled(metrics: &InMemoryMetrics, collection: &str, operation: &str, status: &str) -> u64 {
        metrics.counter(
            "indexer_events_handled",
            &[("collection", collection), ("operation", operation), ("status", status)],
        )
    }

    #[tokio::test]
    async fn unknown_collections_and_non_commits_are_ignored() {
        let (indexer, _, metrics) = indexer();
        let other = commit_event("did:plc:a", "app.bsky.feed.post", "1", CommitOperation::Create, Some(json!({})));
        indexer.handle_event(&other).await.unwrap();

        let identity = FirehoseEvent {
            did: "did:plc:a".to_string(),
            timestamp: "2024-01-01T00:00:00Z".parse().unwrap(),
            kind: EventKind::Identity(b"{}".to_vec()),
        };
        indexer.handle_event(&identity).await.unwrap();
        assert_eq!(metrics.counter_total("indexer_events_handled"), 0);
    }

    #[tokio::test]
    async fn invalid_records_are_acknowledged() {
        let (indexer, _, metrics) = indexer();
        let event = commit_event(
            "did:plc:a",
            FOLLOW_COLLECTION,
            "1",
            CommitOperation::Create,
            Some(json!({"subject": 5})),
        );
        indexer.handle_event(&event).await.unwrap();
        assert_eq!(handled(&metrics, FOLLOW_COLLECTION, "create", "invalid"), 1);
    }

    #[tokio::test]
    async fn unsupported_updates_block_unless_configured() {
        let (indexer, store, metrics) = indexer();
        let event = commit_event(
            "did:plc:a",
            LIKE_COLLECTION,
            "1",
            CommitOperation::Update,
            Some(json!({"subject": {"uri": "at://did:plc:b/app.vylet.feed.post/1", "cid": "c"}, "createdAt": "2024-01-01T00:00:00Z"})),
        );
        assert!(indexer.handle_event(&event).await.is_err());
        assert_eq!(handled(&metrics, LIKE_COLLECTION, "update", "unsupported"), 1);

        let lenient = Indexer::new(store, metrics.clone()).skip_unsupported_updates(true);
        lenient.handle_event(&event).await.unwrap();
        assert_eq!(handled(&metrics, LIKE_COLLECTION, "update", "unsupported"), 2);
    }

    #[tokio::test]
    async fn deleting_a_missing_record_is_acknowledged() {
        let (indexer, _, metrics) = indexer();
        let event = commit_event("did:plc:a", POST_COLLECTION, "gone", CommitOperation::Delete, None);
        indexer.handle_event(&event).await.unwrap();
        assert_eq!(handled(&metrics, POST_COLLECTION, "delete", "not_found"), 1);
    }

    #[test]
    fn store_errors_map_to_acknowledgement_policy() {
        assert!(matches!(IndexError::from(StoreError::NotFound), IndexError::NotFound));
        assert!(matches!(
            IndexError::from(StoreError::InvalidArgument("bad".into())),
            IndexError::InvalidRecord(_)
        ));
        assert!(matches!(
            IndexError::from(StoreError::Backend("timeout".into())),
            IndexError::Store(_)
        ));
    }
}
