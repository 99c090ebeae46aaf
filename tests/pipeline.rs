// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! Upstream frames through the relay into the storage engine, all in memory.

use cid::multihash::Multihash;
use cid::Cid;
use ciborium::value::Value;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use vylet_social_indexer::blobs::BlobTracker;
use vylet_social_indexer::bus::{ConsumerGroup, LogCursorStore, LogStore, MemoryLog, Producer};
use vylet_social_indexer::config::FirehoseConfig;
use vylet_social_indexer::firehose::{resume_point, Checkpointer, CursorStore, Ingestor};
use vylet_social_indexer::indexer::Indexer;
use vylet_social_indexer::metrics::InMemoryMetrics;
use vylet_social_indexer::store::{MemoryStore, PageRequest, SocialStore};

const TOPIC: &str = "firehose-records-test";
const PARTITIONS: u32 = 4;

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn cbor(value: &Value) -> Vec<u8> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes).unwrap();
    bytes
}

fn cid_for(codec: u64, data: &[u8]) -> Cid {
    let digest = Sha256::digest(data);
    Cid::new_v1(codec, Multihash::<64>::wrap(0x12, &digest).unwrap())
}

fn link(cid: &Cid) -> Value {
    let mut bytes = vec![0u8];
    bytes.extend(cid.to_bytes());
    Value::Tag(42, Box::new(Value::Bytes(bytes)))
}

fn varint(out: &mut Vec<u8>, mut value: usize) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

enum Op {
    Create(&'static str, Value),
    Delete(&'static str),
}

fn commit(seq: i64, repo: &str, ops: Vec<Op>) -> Vec<u8> {
    let mut car = Vec::new();
    let header = cbor(&Value::Map(vec![
        (text("version"), Value::Integer(1.into())),
        (text("roots"), Value::Array(vec![])),
    ]));
    varint(&mut car, header.len());
    car.extend(header);

    let mut op_values = Vec::new();
    for op in ops {
        let (action, path, cid) = match op {
            Op::Create(path, record) => {
                let data = cbor(&record);
                let cid = cid_for(0x71, &data);
                let cid_bytes = cid.to_bytes();
                varint(&mut car, cid_bytes.len() + data.len());
                car.extend(cid_bytes);
                car.extend(data);
                ("create", path, link(&cid))
            }
            Op::Delete(path) => ("delete", path, Value::Null),
        };
        op_values.push(Value::Map(vec![
            (text("action"), text(action)),
            (text("path"), text(path)),
            (text("cid"), cid),
        ]));
    }

    let mut frame = cbor(&Value::Map(vec![
        (text("op"), Value::Integer(1.into())),
        (text("t"), text("#commit")),
    ]));
    frame.extend(cbor(&Value::Map(vec![
        (text("seq"), Value::Integer(seq.into())),
        (text("repo"), text(repo)),
        (text("rev"), text("3kabc")),
        (text("time"), text("2024-01-01T00:00:00.000Z")),
        (text("blocks"), Value::Bytes(car)),
        (text("ops"), Value::Array(op_values)),
    ])));
    frame
}

fn record(kind: &str, created_at: &str, fields: Vec<(&str, Value)>) -> Value {
    let mut entries = vec![
        (text("$type"), text(kind)),
        (text("createdAt"), text(created_at)),
    ];
    entries.extend(fields.into_iter().map(|(k, v)| (text(k), v)));
    Value::Map(entries)
}

fn follow(subject: &str, day: u32) -> Value {
    record(
        "app.vylet.graph.follow",
        &format!("2024-01-{:02}T00:00:00.000Z", day),
        vec![("subject", text(subject))],
    )
}

fn post_with_image(image: &Cid) -> Value {
    let blob = Value::Map(vec![
        (text("$type"), text("blob")),
        (text("ref"), link(image)),
        (text("mimeType"), text("image/jpeg")),
        (text("size"), Value::Integer(1024.into())),
    ]);
    let images = Value::Array(vec![Value::Map(vec![
        (text("image"), blob),
        (text("alt"), text("a lake")),
    ])]);
    record(
        "app.vylet.feed.post",
        "2024-01-05T00:00:00.000Z",
        vec![
            ("caption", text("morning")),
            (
                "media",
                Value::Map(vec![
                    (text("$type"), text("app.vylet.media.images")),
                    (text("images"), images),
                ]),
            ),
        ],
    )
}

fn firehose_config(collections: &[&str]) -> FirehoseConfig {
    FirehoseConfig {
        websocket_host: "wss://relay.example.com".to_string(),
        desired_collections: collections.iter().map(|c| c.to_string()).collect(),
        parallelism: 8,
        cursor_save_interval_ms: 60_000,
    }
}

struct Pipeline {
    log: Arc<MemoryLog>,
    producer: Arc<Producer>,
    ingestor: Arc<Ingestor>,
    metrics: Arc<InMemoryMetrics>,
}

fn pipeline(collections: &[&str]) -> Pipeline {
    let log = Arc::new(MemoryLog::new());
    let metrics = Arc::new(InMemoryMetrics::new());
    let producer = Arc::new(Producer::new(
        log.clone(),
        TOPIC,
        PARTITIONS,
        64,
        metrics.clone(),
    ));
    let ingestor = Arc::new(Ingestor::new(
        &firehose_config(collections),
        producer.clone(),
        metrics.clone(),
    ));
    Pipeline {
        log,
        producer,
        ingestor,
        metrics,
    }
}

fn group(log: Arc<MemoryLog>, name: &str, metrics: Arc<InMemoryMetrics>) -> ConsumerGroup {
    ConsumerGroup::new(log, name, TOPIC, PARTITIONS, metrics)
        .with_poll_interval(Duration::from_millis(5))
}

async fn eventually<F, Fut>(check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn follows_posts_and_blobs_reach_the_store() {
    let p = pipeline(&["app.vylet.*"]);
    let image = cid_for(0x55, b"lake.jpg");

    let frames = vec![
        commit(
            1,
            "did:plc:bob",
            vec![Op::Create(
                "app.vylet.actor.profile/self",
                record(
                    "app.vylet.actor.profile",
                    "2024-01-01T00:00:00.000Z",
                    vec![("displayName", text("Bob"))],
                ),
            )],
        ),
        commit(2, "did:plc:alice", vec![Op::Create("app.vylet.graph.follow/a1", follow("did:plc:bob", 2))]),
        commit(3, "did:plc:carol", vec![Op::Create("app.vylet.graph.follow/c1", follow("did:plc:bob", 3))]),
        commit(4, "did:plc:bob", vec![Op::Create("app.vylet.feed.post/p1", post_with_image(&image))]),
        commit(5, "did:plc:carol", vec![Op::Delete("app.vylet.graph.follow/c1")]),
    ];
    for frame in &frames {
        p.ingestor.handle_message(frame).await;
    }
    p.producer.flush().await;

    let store = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();
    let indexer = Arc::new(Indexer::new(store.clone(), p.metrics.clone()));
    let tracker = Arc::new(BlobTracker::new(store.clone(), p.metrics.clone()));
    let indexing = tokio::spawn(
        group(p.log.clone(), "indexer", p.metrics.clone()).run(indexer, cancel.clone()),
    );
    let tracking = tokio::spawn(
        group(p.log.clone(), "blob-tracker", p.metrics.clone()).run(tracker, cancel.clone()),
    );

    let bob = "did:plc:bob".to_string();
    let image_cid = image.to_string();
    eventually(|| {
        let store = store.clone();
        let bob = bob.clone();
        let image_cid = image_cid.clone();
        async move {
            let counts = store.get_follow_counts(&[bob.clone()]).await.unwrap();
            let posts = store.get_profile_counts(&[bob.clone()]).await.unwrap();
            let carol_gone = store
                .get_follow_for_author_subject("did:plc:carol", &bob)
                .await
                .unwrap()
                .is_none();
            let blob = store.get_blob_ref(&bob, &image_cid).await.is_ok();
            counts.get(&bob).map(|c| c.followers) == Some(1)
                && posts.get(&bob).map(|c| c.posts) == Some(1)
                && carol_gone
                && blob
        }
    })
    .await;

    cancel.cancel();
    indexing.await.unwrap().unwrap();
    tracking.await.unwrap().unwrap();

    let profile = store.get_profile(&bob).await.unwrap();
    assert_eq!(profile.display_name.as_deref(), Some("Bob"));

    let followers = store
        .get_followers_by_actor(&bob, PageRequest::new(10))
        .await
        .unwrap();
    assert_eq!(followers.items.len(), 1);
    assert_eq!(followers.items[0].author_did, "did:plc:alice");
    assert_eq!(
        followers.items[0].uri,
        "at://did:plc:alice/app.vylet.graph.follow/a1"
    );

    let posts = store
        .get_posts_by_actor(&bob, PageRequest::new(10))
        .await
        .unwrap();
    assert_eq!(posts.items[0].images[0].cid, image_cid);
    assert_eq!(posts.items[0].images[0].alt.as_deref(), Some("a lake"));

    let blob = store.get_blob_ref(&bob, &image_cid).await.unwrap();
    assert!(!blob.taken_down);
    assert_eq!(p.ingestor.watermark().get(), Some(5));
}

#[tokio::test]
async fn only_desired_collections_are_relayed() {
    let p = pipeline(&["app.vylet.graph.*"]);
    let frame = commit(
        7,
        "did:plc:alice",
        vec![
            Op::Create("app.vylet.graph.follow/a1", follow("did:plc:bob", 1)),
            Op::Create(
                "app.vylet.feed.like/l1",
                record("app.vylet.feed.like", "2024-01-01T00:00:00.000Z", vec![]),
            ),
            Op::Create(
                "app.bsky.feed.post/x1",
                record("app.bsky.feed.post", "2024-01-01T00:00:00.000Z", vec![]),
            ),
        ],
    );
    p.ingestor.handle_message(&frame).await;
    p.producer.flush().await;

    let relayed: usize = (0..PARTITIONS).map(|partition| p.log.retained(TOPIC, partition)).sum();
    assert_eq!(relayed, 1);
    assert_eq!(
        p.metrics.counter(
            "firehose_records_handled",
            &[("status", "skipped"), ("collection", "app.vylet.feed.like")]
        ),
        1
    );
}

#[tokio::test]
async fn exit_cursor_resumes_where_ingestion_stopped() {
    let p = pipeline(&["app.vylet.*"]);
    let log: Arc<dyn LogStore> = p.log.clone();
    let cursors: Arc<dyn CursorStore> = Arc::new(LogCursorStore::new(log.clone(), "cursor-test"));

    for seq in [10, 11, 12] {
        let frame = commit(
            seq,
            "did:plc:alice",
            vec![Op::Create("app.vylet.graph.follow/a1", follow("did:plc:bob", 1))],
        );
        p.ingestor.handle_message(&frame).await;
    }

    let stop = CancellationToken::new();
    let checkpoints = tokio::spawn(
        Checkpointer::new(
            cursors.clone(),
            p.ingestor.watermark(),
            Duration::from_secs(60),
            p.metrics.clone(),
        )
        .run(stop.clone()),
    );
    stop.cancel();
    checkpoints.await.unwrap();

    // A fresh process reading the same relay resumes at the exit cursor
    let restarted = LogCursorStore::new(log, "cursor-test");
    let resume = resume_point(&restarted).await.unwrap();
    assert_eq!(resume, Some(12));
    assert_eq!(
        p.ingestor.subscribe_url(resume),
        "wss://relay.example.com/xrpc/com.atproto.sync.subscribeRepos?cursor=12"
    );
    let saved = restarted.load().await.unwrap().unwrap();
    assert!(saved.saved_on_exit);
}
