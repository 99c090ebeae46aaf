// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! Relay wire format shared by the ingestor (producer) and the indexer and
//! blob tracker (consumers). Messages are JSON; byte payloads travel as
//! base64.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::encoding::base64_bytes;

/// One relayed upstream event, keyed on the bus by `did`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirehoseEvent {
    pub did: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Upstream identity event, re-serialized as JSON
    Identity(#[serde(with = "base64_bytes")] Vec<u8>),
    /// Upstream account event, re-serialized as JSON
    Account(#[serde(with = "base64_bytes")] Vec<u8>),
    Commit(Commit),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitOperation {
    Create,
    Update,
    Delete,
}

impl CommitOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitOperation::Create => "create",
            CommitOperation::Update => "update",
            CommitOperation::Delete => "delete",
        }
    }
}

/// A single record operation extracted from an upstream commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub rev: String,
    pub operation: CommitOperation,
    pub collection: String,
    pub rkey: String,
    /// Record as JSON; empty for deletes
    #[serde(default, with = "base64_bytes")]
    pub record: Vec<u8>,
    /// Record CID; empty for deletes
    #[serde(default)]
    pub cid: String,
}

impl FirehoseEvent {
    pub fn commit(&self) -> Option<&Commit> {
        match &self.kind {
            EventKind::Commit(commit) => Some(commit),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            EventKind::Identity(_) => "identity",
            EventKind::Account(_) => "account",
            EventKind::Commit(_) => "commit",
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Ingestion progress as persisted on the cursor stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceCursor {
    pub sequence: i64,
    pub saved_on_exit: bool,
}

impl SequenceCursor {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commit_event_wire_shape() {
        let event = FirehoseEvent {
            did: "did:example:abc".to_string(),
            timestamp: "2024-01-01T00:00:00Z".parse().unwrap(),
            kind: EventKind::Commit(Commit {
                rev: "3kabc".to_string(),
                operation: CommitOperation::Create,
                collection: "app.vylet.graph.follow".to_string(),
                rkey: "3k2x".to_string(),
                record: br#"{"subject":"did:example:def"}"#.to_vec(),
                cid: "bafyrei".to_string(),
            }),
        };

        let value: serde_json::Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(value["kind"]["commit"]["operation"], json!("CREATE"));
        assert_eq!(
            value["kind"]["commit"]["record"],
            json!("eyJzdWJqZWN0IjoiZGlkOmV4YW1wbGU6ZGVmIn0=")
        );
        assert_eq!(FirehoseEvent::decode(&event.encode().unwrap()).unwrap(), event);
    }

    #[test]
    fn delete_commit_may_omit_record_and_cid() {
        let raw = json!({
            "did": "did:example:abc",
            "timestamp": "2024-01-01T00:00:00Z",
            "kind": {"commit": {
                "rev": "r", "operation": "DELETE",
                "collection": "app.vylet.feed.like", "rkey": "k"
            }}
        });
        let event: FirehoseEvent = serde_json::from_value(raw).unwrap();
        let commit = event.commit().unwrap();
        assert_eq!(commit.operation, CommitOperation::Delete);
        assert!(commit.record.is_empty());
        assert!(commit.cid.is_empty());
    }
}
