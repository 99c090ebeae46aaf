// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! Blob reference tracker.
//!
//! Records which repository references which content-addressed blob, so that
//! moderation state can be attached to a blob independently of the records
//! pointing at it. Runs as its own consumer group on the relay.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::bus::EventHandler;
use crate::events::{CommitOperation, FirehoseEvent};
use crate::metrics::SharedMetrics;
use crate::models::BlobRef;
use crate::store::{SocialStore, StoreError};

/// Every blob CID referenced anywhere inside a record, deduplicated.
///
/// Recognises typed blobs `{"$type": "blob", "ref": {"$link": cid}}` and the
/// legacy untyped form `{"cid": cid, "mimeType": ...}`.
pub fn extract_blob_cids(record: &Value) -> Vec<String> {
    let mut found = BTreeSet::new();
    collect(record, &mut found);
    found.into_iter().collect()
}

fn collect(value: &Value, found: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            if map.get("$type").and_then(Value::as_str) == Some("blob") {
                if let Some(cid) = map
                    .get("ref")
                    .and_then(|r| r.get("$link"))
                    .and_then(Value::as_str)
                {
                    found.insert(cid.to_string());
                    return;
                }
            }
            if let (Some(cid), Some(_)) = (
                map.get("cid").and_then(Value::as_str),
                map.get("mimeType").and_then(Value::as_str),
            ) {
                found.insert(cid.to_string());
                return;
            }
            for nested in map.values() {
                collect(nested, found);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(item, found);
            }
        }
        _ => {}
    }
}

pub struct BlobTracker {
    store: Arc<dyn SocialStore>,
    metrics: SharedMetrics,
}

impl BlobTracker {
    pub fn new(store: Arc<dyn SocialStore>, metrics: SharedMetrics) -> Self {
        Self { store, metrics }
    }

    /// Record a sighting of `cid` in `did`'s repository. Takedown state on
    /// an existing reference is left untouched.
    async fn track(&self, did: &str, cid: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        match self.store.get_blob_ref(did, cid).await {
            Ok(mut existing) => {
                existing.processed_at = Some(now);
                let result = self.store.update_blob_ref(existing).await;
                self.count_db("update", &result);
                result
            }
            Err(StoreError::NotFound) => {
                let result = self
                    .store
                    .create_blob_ref(BlobRef::first_sighting(did, cid, now))
                    .await;
                self.count_db("create", &result);
                result
            }
            Err(e) => {
                self.metrics.incr(
                    "blobs_db_operations_total",
                    &[("operation", "get"), ("status", "error")],
                );
                Err(e)
            }
        }
    }

    fn count_db(&self, operation: &'static str, result: &Result<(), StoreError>) {
        let status = if result.is_ok() { "ok" } else { "error" };
        self.metrics.incr(
            "blobs_db_operations_total",
            &[("operation", operation), ("status", status)],
        );
    }
}

#[async_trait]
impl EventHandler for BlobTracker {
    async fn handle_event(&self, event: &FirehoseEvent) -> anyhow::Result<()> {
        let Some(commit) = event.commit() else {
            return Ok(());
        };
        self.metrics.incr(
            "blobs_records_processed_total",
            &[("operation", commit.operation.as_str())],
        );
        if commit.operation == CommitOperation::Delete {
            return Ok(());
        }

        let record: Value = match serde_json::from_slice(&commit.record) {
            Ok(record) => record,
            Err(e) => {
                warn!(did = %event.did, collection = %commit.collection, rkey = %commit.rkey, "Skipping undecodable record: {}", e);
                return Ok(());
            }
        };

        let cids = extract_blob_cids(&record);
        if cids.is_empty() {
            return Ok(());
        }
        self.metrics
            .incr_counter("blobs_extracted_total", &[], cids.len() as u64);
        debug!(did = %event.did, collection = %commit.collection, count = cids.len(), "Tracking blob references");

        for cid in &cids {
            if let Err(e) = self.track(&event.did, cid).await {
                error!(did = %event.did, cid = %cid, "Failed to track blob reference: {}", e);
            }
        }
        Ok(())
    }
}
