// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! Typed lexicon records carried as JSON in relayed commits.

use chrono::{DateTime, ParseError, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROFILE_COLLECTION: &str = "app.vylet.actor.profile";
pub const POST_COLLECTION: &str = "app.vylet.feed.post";
pub const LIKE_COLLECTION: &str = "app.vylet.feed.like";
pub const FOLLOW_COLLECTION: &str = "app.vylet.graph.follow";

/// Canonical record URI: `at://<did>/<collection>/<rkey>`
pub fn record_uri(did: &str, collection: &str, rkey: &str) -> String {
    format!("at://{}/{}/{}", did, collection, rkey)
}

/// Parse a record `createdAt` timestamp (RFC3339, any precision)
pub fn parse_created_at(raw: &str) -> Result<DateTime<Utc>, ParseError> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

/// `{"$link": "<cid>"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobLink {
    #[serde(rename = "$link")]
    pub link: String,
}

/// Blob reference as embedded in records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(rename = "$type", default)]
    pub blob_type: Option<String>,
    #[serde(rename = "ref")]
    pub reference: BlobLink,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: Option<i64>,
}

impl Blob {
    pub fn cid(&self) -> &str {
        &self.reference.link
    }
}

/// `app.vylet.actor.profile`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub pronouns: Option<String>,
    #[serde(default)]
    pub avatar: Option<Blob>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AspectRatio {
    pub width: i64,
    pub height: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostImage {
    pub image: Blob,
    #[serde(default)]
    pub alt: Option<String>,
    #[serde(default)]
    pub aspect_ratio: Option<AspectRatio>,
}

/// Media union of a post; only the image variant carries `images`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostMedia {
    #[serde(rename = "$type", default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub images: Vec<PostImage>,
}

/// `{uri, cid}` pointer to another record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrongRef {
    pub uri: String,
    pub cid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyRef {
    pub root: StrongRef,
    pub parent: StrongRef,
}

/// `app.vylet.feed.post`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRecord {
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub media: Option<PostMedia>,
    #[serde(default)]
    pub facets: Option<Value>,
    #[serde(default)]
    pub reply: Option<ReplyRef>,
    pub created_at: String,
}

impl PostRecord {
    pub fn images(&self) -> &[PostImage] {
        self.media
            .as_ref()
            .map(|media| media.images.as_slice())
            .unwrap_or(&[])
    }
}

/// `app.vylet.feed.like`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeRecord {
    pub subject: StrongRef,
    pub created_at: String,
}

/// `app.vylet.graph.follow`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowRecord {
    /// DID of the followed actor
    pub subject: String,
    pub created_at: String,
}
