// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! Firehose consumer.
//!
//! A single reader pulls frames off the upstream websocket and hands each one
//! to a worker task; at most `parallelism` frames are in flight. Workers
//! finish in any order, so the watermark is the highest sequence observed
//! rather than the highest sequence fully relayed.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::car::BlockStore;
use super::checkpoint::{resume_point, Checkpointer, CursorStore, Watermark};
use super::filter::CollectionFilter;
use super::frames::{decode_frame, record_to_json, AccountFrame, CommitFrame, RepoOp, StreamFrame};
use super::DecodeError;
use crate::bus::{DeliveryCallback, Producer};
use crate::config::FirehoseConfig;
use crate::events::records::parse_created_at;
use crate::events::{Commit, CommitOperation, EventKind, FirehoseEvent};
use crate::metrics::SharedMetrics;

pub const SUBSCRIBE_PATH: &str = "/xrpc/com.atproto.sync.subscribeRepos";
pub const USER_AGENT: &str = concat!("vylet-social-indexer/", env!("CARGO_PKG_VERSION"));

const WEBSOCKET_GRACE: Duration = Duration::from_secs(5);
const WORKER_GRACE: Duration = Duration::from_secs(10);

pub struct Ingestor {
    host: String,
    parallelism: usize,
    cursor_save_interval: Duration,
    filter: CollectionFilter,
    producer: Arc<Producer>,
    watermark: Arc<Watermark>,
    metrics: SharedMetrics,
}

impl Ingestor {
    pub fn new(config: &FirehoseConfig, producer: Arc<Producer>, metrics: SharedMetrics) -> Self {
        Self {
            host: config.websocket_host.clone(),
            parallelism: config.parallelism.max(1),
            cursor_save_interval: Duration::from_millis(config.cursor_save_interval_ms),
            filter: CollectionFilter::new(&config.desired_collections),
            producer,
            watermark: Arc::new(Watermark::default()),
            metrics,
        }
    }

    pub fn watermark(&self) -> Arc<Watermark> {
        self.watermark.clone()
    }

    pub fn subscribe_url(&self, cursor: Option<i64>) -> String {
        let base = format!("{}{}", self.host.trim_end_matches('/'), SUBSCRIBE_PATH);
        match cursor {
            Some(seq) => format!("{}?cursor={}", base, seq),
            None => base,
        }
    }

    /// Resume from the saved cursor and consume until `cancel` fires.
    ///
    /// On a clean stop the exit cursor is written after in-flight frames have
    /// drained. A connection failure is returned without an exit save.
    pub async fn run(
        self: Arc<Self>,
        cursors: Arc<dyn CursorStore>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let resume = resume_point(cursors.as_ref()).await?;
        if let Some(seq) = resume {
            self.watermark.observe(seq);
        }

        let stop_checkpoints = CancellationToken::new();
        let checkpointer = Checkpointer::new(
            cursors,
            self.watermark.clone(),
            self.cursor_save_interval,
            self.metrics.clone(),
        );
        let checkpoints = tokio::spawn(checkpointer.run(stop_checkpoints.clone()));

        let result = self.clone().consume(resume, cancel).await;
        match &result {
            Ok(()) => {
                stop_checkpoints.cancel();
                if let Err(e) = checkpoints.await {
                    error!("Cursor checkpoint task failed: {}", e);
                }
            }
            Err(e) => {
                error!("Firehose consumer failed: {:#}", e);
                checkpoints.abort();
            }
        }
        result
    }

    async fn consume(self: Arc<Self>, cursor: Option<i64>, cancel: CancellationToken) -> Result<()> {
        let url = self.subscribe_url(cursor);
        info!(url = %url, "Connecting to upstream firehose");

        let mut request = url
            .as_str()
            .into_client_request()
            .context("invalid firehose url")?;
        request
            .headers_mut()
            .insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        let (stream, _) = connect_async(request)
            .await
            .with_context(|| format!("failed to dial {}", url))?;
        info!("Connected to upstream firehose");

        let (mut sink, mut source) = stream.split();
        let permits = Arc::new(Semaphore::new(self.parallelism));

        let outcome: Result<()> = loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => break Err(anyhow!("worker pool closed: {}", e)),
                },
            };
            let message = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                message = source.next() => message,
            };

            match message {
                Some(Ok(Message::Binary(bytes))) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.handle_message(&bytes).await;
                        drop(permit);
                    });
                }
                Some(Ok(Message::Close(frame))) => {
                    break Err(anyhow!("upstream closed the connection: {:?}", frame))
                }
                Some(Ok(other)) => trace!("Ignoring non-binary message: {:?}", other),
                Some(Err(e)) => break Err(anyhow!(e).context("firehose connection failed")),
                None => break Err(anyhow!("firehose stream ended")),
            }
        };
        outcome?;

        info!("Shutting down firehose consumer");
        match timeout(WEBSOCKET_GRACE, sink.close()).await {
            Ok(Ok(())) => info!("Websocket closed"),
            Ok(Err(e)) => warn!("Error closing websocket: {}", e),
            Err(_) => warn!(
                "Websocket did not shut down within {:?}, forcefully shutting down",
                WEBSOCKET_GRACE
            ),
        }

        let drained = timeout(WORKER_GRACE, async {
            let _all = permits.acquire_many(self.parallelism as u32).await;
            self.producer.flush().await;
        })
        .await;
        if drained.is_err() {
            warn!(
                "In-flight frames did not finish within {:?}, forcefully shutting down",
                WORKER_GRACE
            );
        }
        Ok(())
    }

    /// Decode one websocket message and relay the events it yields
    pub async fn handle_message(&self, bytes: &[u8]) {
        let frame = match decode_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.metrics.incr("firehose_decode_errors", &[]);
                warn!("Failed to decode frame: {}", e);
                return;
            }
        };
        for event in self.events_from_frame(frame) {
            self.forward(event).await;
        }
    }

    /// Turn a decoded frame into relay events, recording metrics and the
    /// watermark on the way.
    pub fn events_from_frame(&self, frame: StreamFrame) -> Vec<FirehoseEvent> {
        self.metrics
            .incr("firehose_events_received", &[("kind", frame.kind())]);

        match frame {
            StreamFrame::Commit(commit) => {
                self.observe(commit.seq);
                self.commit_events(commit)
            }
            StreamFrame::Identity(identity) => {
                self.observe(identity.seq);
                self.account_event(identity, EventKind::Identity)
                    .into_iter()
                    .collect()
            }
            StreamFrame::Account(account) => {
                self.observe(account.seq);
                self.account_event(account, EventKind::Account)
                    .into_iter()
                    .collect()
            }
            StreamFrame::Error { error, message } => {
                warn!(error = %error, message = ?message, "Upstream error frame");
                Vec::new()
            }
            StreamFrame::Info { name, message } => {
                info!(name = %name, message = ?message, "Upstream info frame");
                Vec::new()
            }
            StreamFrame::Sync { .. } | StreamFrame::Unknown(_) => Vec::new(),
        }
    }

    fn observe(&self, seq: i64) {
        self.watermark.observe(seq);
        if let Some(last) = self.watermark.get() {
            self.metrics
                .set_gauge("firehose_last_sequence", &[], last as f64);
        }
    }

    fn account_event(
        &self,
        frame: AccountFrame,
        kind: fn(Vec<u8>) -> EventKind,
    ) -> Option<FirehoseEvent> {
        let timestamp = match parse_created_at(&frame.time) {
            Ok(timestamp) => timestamp,
            Err(e) => {
                error!(seq = frame.seq, did = %frame.did, "Invalid event time {:?}: {}", frame.time, e);
                return None;
            }
        };
        let body = match serde_json::to_vec(&frame.body) {
            Ok(body) => body,
            Err(e) => {
                error!(seq = frame.seq, did = %frame.did, "Failed to serialize event: {}", e);
                return None;
            }
        };
        Some(FirehoseEvent {
            did: frame.did,
            timestamp,
            kind: kind(body),
        })
    }

    fn commit_events(&self, commit: CommitFrame) -> Vec<FirehoseEvent> {
        let blocks = match BlockStore::from_car(&commit.blocks) {
            Ok(blocks) => blocks,
            Err(e) => {
                error!(seq = commit.seq, repo = %commit.repo, "Failed to read commit blocks: {}", e);
                return Vec::new();
            }
        };
        let timestamp = match parse_created_at(&commit.time) {
            Ok(timestamp) => timestamp,
            Err(e) => {
                error!(seq = commit.seq, repo = %commit.repo, "Invalid commit time {:?}: {}", commit.time, e);
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        for op in &commit.ops {
            let (status, collection, event) = match op {
                Ok(op) => self.commit_op(&commit, &blocks, op, timestamp),
                Err(e) => {
                    warn!(seq = commit.seq, repo = %commit.repo, "Failed to decode op: {}", e);
                    ("error", "", None)
                }
            };
            self.metrics.incr(
                "firehose_records_handled",
                &[("status", status), ("collection", collection)],
            );
            events.extend(event);
        }
        events
    }

    /// Outcome of one op: metric status, collection, and the event to relay
    fn commit_op<'a>(
        &self,
        commit: &CommitFrame,
        blocks: &BlockStore,
        op: &'a RepoOp,
        timestamp: DateTime<Utc>,
    ) -> (&'static str, &'a str, Option<FirehoseEvent>) {
        let mut parts = op.path.split('/');
        let (Some(collection), Some(rkey), None) = (parts.next(), parts.next(), parts.next())
        else {
            warn!(repo = %commit.repo, path = %op.path, "Invalid op path");
            return ("error", "", None);
        };

        if !self.filter.allows(collection) {
            return ("skipped", collection, None);
        }

        let operation = match op.action.as_str() {
            "create" => CommitOperation::Create,
            "update" => CommitOperation::Update,
            "delete" => CommitOperation::Delete,
            other => {
                warn!(repo = %commit.repo, path = %op.path, "Unknown op action {:?}", other);
                return ("error", collection, None);
            }
        };

        let (record, cid) = match operation {
            CommitOperation::Delete => (Vec::new(), String::new()),
            CommitOperation::Create | CommitOperation::Update => {
                match record_json(blocks, op) {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(repo = %commit.repo, path = %op.path, "Failed to extract record: {}", e);
                        return ("error", collection, None);
                    }
                }
            }
        };

        debug!(repo = %commit.repo, path = %op.path, operation = operation.as_str(), "Relaying record");
        let event = FirehoseEvent {
            did: commit.repo.clone(),
            timestamp,
            kind: EventKind::Commit(Commit {
                rev: commit.rev.clone(),
                operation,
                collection: collection.to_string(),
                rkey: rkey.to_string(),
                record,
                cid,
            }),
        };
        ("ok", collection, Some(event))
    }

    async fn forward(&self, event: FirehoseEvent) {
        let did = event.did.clone();
        let callback: DeliveryCallback = Box::new(move |result| {
            if let Ok(offset) = result {
                trace!(did = %did, offset, "Event relayed");
            }
        });
        if let Err(e) = self
            .producer
            .produce_async(&event.did, &event, Some(callback))
            .await
        {
            self.metrics
                .incr("bus_messages_produced", &[("status", "error")]);
            error!(did = %event.did, "Failed to queue event: {}", e);
        }
    }
}

/// Verified record block for a create/update op, as JSON, plus its CID
fn record_json(blocks: &BlockStore, op: &RepoOp) -> Result<(Vec<u8>, String), DecodeError> {
    let cid = op
        .cid
        .as_ref()
        .ok_or_else(|| DecodeError::Shape("create or update without a cid".to_string()))?;
    let block = blocks.verified(cid)?;
    Ok((record_to_json(block)?, cid.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{partition_for, LogStore, MemoryLog};
    use crate::firehose::testing::{
        cbor, cid_for, commit_frame, encode_frame, link, record, text, TestOp,
    };
    use crate::metrics::InMemoryMetrics;
    use ciborium::value::Value;
    use serde_json::json;

    fn config(collections: &[&str]) -> FirehoseConfig {
        FirehoseConfig {
            websocket_host: "wss://relay.example.com/".to_string(),
            desired_collections: collections.iter().map(|c| c.to_string()).collect(),
            parallelism: 4,
            cursor_save_interval_ms: 5_000,
        }
    }

    fn ingestor(collections: &[&str]) -> (Arc<Ingestor>, Arc<MemoryLog>, Arc<InMemoryMetrics>) {
        let log = Arc::new(MemoryLog::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let producer = Arc::new(Producer::new(log.clone(), "records", 4, 100, metrics.clone()));
        let ingestor = Arc::new(Ingestor::new(&config(collections), producer, metrics.clone()));
        (ingestor, log, metrics)
    }

    fn follow(subject: &str) -> Value {
        record("app.vylet.graph.follow", vec![("subject", text(subject))])
    }

    #[tokio::test]
    async fn subscribe_url_carries_the_cursor() {
        let (ingestor, _, _) = ingestor(&["app.vylet.*"]);
        assert_eq!(
            ingestor.subscribe_url(None),
            "wss://relay.example.com/xrpc/com.atproto.sync.subscribeRepos"
        );
        assert_eq!(
            ingestor.subscribe_url(Some(42)),
            "wss://relay.example.com/xrpc/com.atproto.sync.subscribeRepos?cursor=42"
        );
    }

    #[tokio::test]
    async fn commit_ops_are_filtered_and_counted() {
        let (ingestor, _, metrics) = ingestor(&["app.vylet.*"]);
        let frame = commit_frame(
            100,
            "did:plc:alice",
            vec![
                TestOp::create("app.vylet.graph.follow/3k1", follow("did:plc:bob")),
                TestOp::create("app.bsky.feed.post/3k2", record("app.bsky.feed.post", vec![])),
                TestOp::delete("app.vylet.feed.like/3k3"),
                TestOp::delete("not-a-valid-path"),
            ],
        );

        let events = ingestor.events_from_frame(decode_frame(&frame).unwrap());

        assert_eq!(events.len(), 2);
        let follow = events[0].commit().unwrap();
        assert_eq!(events[0].did, "did:plc:alice");
        assert_eq!(follow.operation, CommitOperation::Create);
        assert_eq!(follow.collection, "app.vylet.graph.follow");
        assert_eq!(follow.rkey, "3k1");
        let body: serde_json::Value = serde_json::from_slice(&follow.record).unwrap();
        assert_eq!(body["subject"], json!("did:plc:bob"));
        assert_eq!(follow.cid, cid_for(&cbor(&follow_value())).to_string());

        let delete = events[1].commit().unwrap();
        assert_eq!(delete.operation, CommitOperation::Delete);
        assert!(delete.record.is_empty());

        let handled = |status, collection| {
            metrics.counter(
                "firehose_records_handled",
                &[("status", status), ("collection", collection)],
            )
        };
        assert_eq!(handled("ok", "app.vylet.graph.follow"), 1);
        assert_eq!(handled("ok", "app.vylet.feed.like"), 1);
        assert_eq!(handled("skipped", "app.bsky.feed.post"), 1);
        assert_eq!(handled("error", ""), 1);
        assert_eq!(
            metrics.counter("firehose_events_received", &[("kind", "commit")]),
            1
        );
        assert_eq!(ingestor.watermark().get(), Some(100));
        assert_eq!(metrics.gauge("firehose_last_sequence", &[]), Some(100.0));
    }

    fn follow_value() -> Value {
        follow("did:plc:bob")
    }

    #[tokio::test]
    async fn tampered_record_block_skips_only_that_op() {
        let (ingestor, _, metrics) = ingestor(&["app.vylet.graph.follow"]);

        let honest = cbor(&follow("did:plc:bob"));
        let honest_cid = cid_for(&honest);
        let claimed_cid = cid_for(b"the block the commit claims");
        let car = crate::firehose::testing::car_bytes(&[
            (claimed_cid, cbor(&follow("did:plc:mallory"))),
            (honest_cid, honest),
        ]);
        let op = |rkey: &str, cid| {
            Value::Map(vec![
                (text("action"), text("create")),
                (text("path"), text(&format!("app.vylet.graph.follow/{}", rkey))),
                (text("cid"), link(cid)),
            ])
        };
        let frame = encode_frame(
            "#commit",
            vec![
                (text("seq"), Value::Integer(5.into())),
                (text("repo"), text("did:plc:alice")),
                (text("rev"), text("r")),
                (text("time"), text("2024-01-01T00:00:00Z")),
                (text("blocks"), Value::Bytes(car)),
                (
                    text("ops"),
                    Value::Array(vec![op("bad", &claimed_cid), op("good", &honest_cid)]),
                ),
            ],
        );

        let events = ingestor.events_from_frame(decode_frame(&frame).unwrap());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].commit().unwrap().rkey, "good");
        assert_eq!(
            metrics.counter(
                "firehose_records_handled",
                &[("status", "error"), ("collection", "app.vylet.graph.follow")]
            ),
            1
        );
    }

    #[tokio::test]
    async fn malformed_op_is_dropped_and_its_siblings_relayed() {
        let (ingestor, _, metrics) = ingestor(&["app.vylet.graph.follow"]);
        let data = cbor(&follow("did:plc:bob"));
        let cid = cid_for(&data);
        let frame = encode_frame(
            "#commit",
            vec![
                (text("seq"), Value::Integer(77.into())),
                (text("repo"), text("did:plc:alice")),
                (text("rev"), text("r")),
                (text("time"), text("2024-01-01T00:00:00Z")),
                (
                    text("blocks"),
                    Value::Bytes(crate::firehose::testing::car_bytes(&[(cid, data)])),
                ),
                (
                    text("ops"),
                    Value::Array(vec![
                        Value::Map(vec![
                            (text("action"), text("create")),
                            (text("path"), text("app.vylet.graph.follow/good")),
                            (text("cid"), link(&cid)),
                        ]),
                        Value::Map(vec![
                            (text("action"), text("create")),
                            (text("path"), text("app.vylet.graph.follow/bad")),
                            (text("cid"), text("not-a-link")),
                        ]),
                    ]),
                ),
            ],
        );

        let frame = decode_frame(&frame).unwrap();
        let events = ingestor.events_from_frame(frame);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].commit().unwrap().rkey, "good");
        assert_eq!(ingestor.watermark().get(), Some(77));
        assert_eq!(
            metrics.counter(
                "firehose_records_handled",
                &[("status", "error"), ("collection", "")]
            ),
            1
        );
        assert_eq!(metrics.counter("firehose_decode_errors", &[]), 0);
    }

    #[tokio::test]
    async fn unreadable_archive_skips_the_commit_but_advances_the_watermark() {
        let (ingestor, _, metrics) = ingestor(&["app.vylet.*"]);
        let frame = encode_frame(
            "#commit",
            vec![
                (text("seq"), Value::Integer(9.into())),
                (text("repo"), text("did:plc:alice")),
                (text("time"), text("2024-01-01T00:00:00Z")),
                (text("blocks"), Value::Bytes(vec![0xff, 0xff])),
                (text("ops"), Value::Array(vec![])),
            ],
        );

        assert!(ingestor
            .events_from_frame(decode_frame(&frame).unwrap())
            .is_empty());
        assert_eq!(ingestor.watermark().get(), Some(9));
        assert_eq!(metrics.counter_total("firehose_records_handled"), 0);
    }

    #[tokio::test]
    async fn identity_events_are_relayed_as_json() {
        let (ingestor, _, _) = ingestor(&["app.vylet.*"]);
        let frame = encode_frame(
            "#identity",
            vec![
                (text("seq"), Value::Integer(11.into())),
                (text("did"), text("did:plc:alice")),
                (text("time"), text("2024-01-01T00:00:00.123Z")),
                (text("handle"), text("alice.test")),
            ],
        );

        let events = ingestor.events_from_frame(decode_frame(&frame).unwrap());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind_name(), "identity");
        let EventKind::Identity(body) = &events[0].kind else {
            panic!("expected an identity event");
        };
        let body: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(body["handle"], json!("alice.test"));
        assert_eq!(events[0].timestamp.timestamp_subsec_millis(), 123);
    }

    #[tokio::test]
    async fn info_and_sync_frames_are_counted_but_not_relayed() {
        let (ingestor, _, metrics) = ingestor(&["app.vylet.*"]);
        let info = encode_frame("#info", vec![(text("name"), text("OutdatedCursor"))]);
        let sync = encode_frame("#sync", vec![(text("seq"), Value::Integer(50.into()))]);

        assert!(ingestor.events_from_frame(decode_frame(&info).unwrap()).is_empty());
        assert!(ingestor.events_from_frame(decode_frame(&sync).unwrap()).is_empty());
        assert_eq!(metrics.counter("firehose_events_received", &[("kind", "info")]), 1);
        assert_eq!(metrics.counter("firehose_events_received", &[("kind", "sync")]), 1);
        assert_eq!(ingestor.watermark().get(), None);
    }

    #[tokio::test]
    async fn handled_messages_land_on_the_repository_partition() {
        let (ingestor, log, metrics) = ingestor(&["app.vylet.graph.follow"]);
        let frame = commit_frame(
            1,
            "did:plc:alice",
            vec![TestOp::create("app.vylet.graph.follow/3k1", follow("did:plc:bob"))],
        );

        ingestor.handle_message(&frame).await;
        ingestor.handle_message(b"garbage").await;
        ingestor.producer.flush().await;

        let partition = partition_for("did:plc:alice", 4);
        let records = log.read("records", partition, 0, 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "did:plc:alice");
        assert_eq!(metrics.counter("firehose_decode_errors", &[]), 1);
    }
}
