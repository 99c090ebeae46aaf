// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

use chrono::Utc;

use super::{decode_record, parse_time, IndexError, IndexResult};
use crate::events::{Commit, CommitOperation, FirehoseEvent, PostRecord};
use crate::models::{Image, Post};
use crate::store::SocialStore;

pub(super) async fn handle(
    store: &dyn SocialStore,
    event: &FirehoseEvent,
    commit: &Commit,
    uri: &str,
) -> IndexResult<()> {
    match commit.operation {
        CommitOperation::Create => {
            let record: PostRecord = decode_record(commit)?;
            let post = to_post(event, commit, uri, record)?;
            store.create_post(post).await?;
        }
        CommitOperation::Update => {
            return Err(IndexError::Unsupported("posts cannot be edited".to_string()))
        }
        CommitOperation::Delete => store.delete_post(uri).await?,
    }
    Ok(())
}

fn to_post(event: &FirehoseEvent, commit: &Commit, uri: &str, record: PostRecord) -> IndexResult<Post> {
    let created_at = parse_time(&record.created_at)?;

    if record.images().is_empty() {
        return Err(IndexError::InvalidRecord(
            "post is missing images".to_string(),
        ));
    }
    let images = record
        .images()
        .iter()
        .map(|image| Image {
            cid: image.image.cid().to_string(),
            alt: image.alt.clone(),
            width: image.aspect_ratio.as_ref().map(|ratio| ratio.width),
            height: image.aspect_ratio.as_ref().map(|ratio| ratio.height),
            size: image.image.size,
            mime: image.image.mime_type.clone(),
        })
        .collect();

    let facets = match &record.facets {
        Some(facets) => Some(serde_json::to_vec(facets).map_err(|e| {
            IndexError::InvalidRecord(format!("failed to encode facets: {}", e))
        })?),
        None => None,
    };

    Ok(Post {
        uri: uri.to_string(),
        cid: commit.cid.clone(),
        author_did: event.did.clone(),
        caption: record.caption,
        facets,
        reply_root_uri: record.reply.as_ref().map(|reply| reply.root.uri.clone()),
        reply_parent_uri: record.reply.as_ref().map(|reply| reply.parent.uri.clone()),
        created_at,
        indexed_at: Utc::now(),
        images,
    })
}

#[cfg(test)]
mod tests {
    use super::super::tests::{commit_event, indexer};
    use crate::bus::EventHandler;
    use crate::events::{CommitOperation, POST_COLLECTION};
    use crate::store::{PageRequest, SocialStore};
    use serde_json::{json, Value};

    fn post_record(reply_to: Option<&str>) -> Value {
        let mut record = json!({
            "caption": "sunset",
            "media": {
                "$type": "app.vylet.media.images",
                "images": [{
                    "image": {"$type": "blob", "ref": {"$link": "bafkreiimage"}, "mimeType": "image/jpeg", "size": 2048},
                    "alt": "orange sky",
                    "aspectRatio": {"width": 4, "height": 3}
                }]
            },
            "facets": [{"index": {"byteStart": 0, "byteEnd": 6}}],
            "createdAt": "2024-01-01T00:00:00Z"
        });
        if let Some(parent) = reply_to {
            record["reply"] = json!({
                "root": {"uri": parent, "cid": "c"},
                "parent": {"uri": parent, "cid": "c"}
            });
        }
        record
    }

    #[tokio::test]
    async fn post_with_images_and_reply() {
        let (indexer, store, _) = indexer();
        let root = commit_event("did:plc:alice", POST_COLLECTION, "1", CommitOperation::Create, Some(post_record(None)));
        indexer.handle_event(&root).await.unwrap();

        let root_uri = "at://did:plc:alice/app.vylet.feed.post/1";
        let reply = commit_event(
            "did:plc:bob",
            POST_COLLECTION,
            "2",
            CommitOperation::Create,
            Some(post_record(Some(root_uri))),
        );
        indexer.handle_event(&reply).await.unwrap();

        let posts = store.get_posts(&[root_uri.to_string()]).await.unwrap();
        let post = &posts[0];
        assert_eq!(post.author_did, "did:plc:alice");
        assert_eq!(post.cid, "bafyreirecord");
        assert_eq!(post.images[0].cid, "bafkreiimage");
        assert_eq!(post.images[0].width, Some(4));
        assert_eq!(post.images[0].mime.as_deref(), Some("image/jpeg"));
        let facets: Value = serde_json::from_slice(post.facets.as_ref().unwrap()).unwrap();
        assert_eq!(facets[0]["index"]["byteEnd"], json!(6));

        let counts = store
            .get_posts_interaction_counts(&[root_uri.to_string()])
            .await
            .unwrap();
        assert_eq!(counts[root_uri].replies, 1);

        let page = store
            .get_posts_by_actor("did:plc:bob", PageRequest::new(10))
            .await
            .unwrap();
        assert_eq!(page.items[0].reply_parent_uri.as_deref(), Some(root_uri));
    }

    #[tokio::test]
    async fn post_without_images_is_rejected() {
        let (indexer, store, _) = indexer();
        let mut record = post_record(None);
        record["media"]["images"] = json!([]);
        let event = commit_event("did:plc:alice", POST_COLLECTION, "1", CommitOperation::Create, Some(record));
        indexer.handle_event(&event).await.unwrap();

        let posts = store
            .get_posts(&["at://did:plc:alice/app.vylet.feed.post/1".to_string()])
            .await
            .unwrap();
        assert!(posts.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_the_post() {
        let (indexer, store, _) = indexer();
        let create = commit_event("did:plc:alice", POST_COLLECTION, "1", CommitOperation::Create, Some(post_record(None)));
        indexer.handle_event(&create).await.unwrap();
        let delete = commit_event("did:plc:alice", POST_COLLECTION, "1", CommitOperation::Delete, None);
        indexer.handle_event(&delete).await.unwrap();

        let counts = store
            .get_profile_counts(&["did:plc:alice".to_string()])
            .await
            .unwrap();
        assert_eq!(counts["did:plc:alice"].posts, 0);
    }
}
