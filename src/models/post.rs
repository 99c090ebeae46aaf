// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use crate::schema::images_by_post;

/// Image attached to a post, in display order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub cid: String,
    pub alt: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub size: Option<i64>,
    pub mime: Option<String>,
}

/// Post with its ordered images
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub uri: String,
    pub cid: String,
    pub author_did: String,
    pub caption: Option<String>,
    /// Rich-text facets as opaque JSON bytes
    #[serde(default, with = "crate::models::encoding::base64_bytes_opt")]
    pub facets: Option<Vec<u8>>,
    pub reply_root_uri: Option<String>,
    pub reply_parent_uri: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub indexed_at: DateTime<Utc>,
    #[serde(default)]
    pub images: Vec<Image>,
}

/// Row shape shared by `posts_by_uri` and `posts_by_actor`
#[derive(Debug, Clone, Queryable)]
pub struct PostRow {
    pub uri: String,
    pub cid: String,
    pub author_did: String,
    pub caption: Option<String>,
    pub facets: Option<Vec<u8>>,
    pub reply_root_uri: Option<String>,
    pub reply_parent_uri: Option<String>,
    pub created_at: DateTime<Utc>,
    pub indexed_at: DateTime<Utc>,
}

impl PostRow {
    pub fn into_post(self, images: Vec<Image>) -> Post {
        Post {
            uri: self.uri,
            cid: self.cid,
            author_did: self.author_did,
            caption: self.caption,
            facets: self.facets,
            reply_root_uri: self.reply_root_uri,
            reply_parent_uri: self.reply_parent_uri,
            created_at: self.created_at,
            indexed_at: self.indexed_at,
            images,
        }
    }
}

/// One row of `images_by_post`
#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = images_by_post)]
pub struct ImageRow {
    pub post_uri: String,
    pub image_index: i32,
    pub cid: String,
    pub alt: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub size: Option<i64>,
    pub mime: Option<String>,
}

impl ImageRow {
    pub fn rows_for(post: &Post) -> Vec<ImageRow> {
        post.images
            .iter()
            .enumerate()
            .map(|(index, image)| ImageRow {
                post_uri: post.uri.clone(),
                image_index: index as i32,
                cid: image.cid.clone(),
                alt: image.alt.clone(),
                width: image.width,
                height: image.height,
                size: image.size,
                mime: image.mime.clone(),
            })
            .collect()
    }
}

impl From<ImageRow> for Image {
    fn from(row: ImageRow) -> Self {
        Image {
            cid: row.cid,
            alt: row.alt,
            width: row.width,
            height: row.height,
            size: row.size,
            mime: row.mime,
        }
    }
}
