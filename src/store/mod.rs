// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! Denormalized storage engine.
//!
//! Every record entity is written into several differently keyed views in one
//! atomic fan-out batch. Counters are adjusted afterwards as a separate step,
//! so a crash between the two can leave a counter off by one.

pub mod error;
pub mod memory;
pub mod pagination;
pub mod postgres;
pub mod rpc;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::models::{
    BlobRef, Follow, FollowCounts, Like, Post, PostInteractionCounts, Profile, ProfileCounts,
};

pub use error::{is_not_found, StoreError, StoreResult, NOT_FOUND};
pub use memory::MemoryStore;
pub use pagination::{Page, PageCursor, PageRequest};
pub use postgres::PgStore;
pub use rpc::RpcStore;

/// Query and mutation surface of the storage engine
#[async_trait]
pub trait SocialStore: Send + Sync {
    // Profiles
    async fn create_profile(&self, profile: Profile) -> StoreResult<()>;
    /// Replace the mutable fields of a profile; inserts it when absent
    async fn update_profile(&self, profile: Profile) -> StoreResult<()>;
    async fn delete_profile(&self, did: &str) -> StoreResult<()>;
    async fn get_profile(&self, did: &str) -> StoreResult<Profile>;
    async fn get_profiles(&self, dids: &[String]) -> StoreResult<Vec<Profile>>;
    async fn get_profile_counts(&self, dids: &[String])
        -> StoreResult<HashMap<String, ProfileCounts>>;

    // Posts
    async fn create_post(&self, post: Post) -> StoreResult<()>;
    async fn delete_post(&self, uri: &str) -> StoreResult<()>;
    /// Posts in request order; unknown URIs are skipped
    async fn get_posts(&self, uris: &[String]) -> StoreResult<Vec<Post>>;
    async fn get_posts_by_actor(&self, did: &str, page: PageRequest) -> StoreResult<Page<Post>>;
    async fn get_posts_interaction_counts(
        &self,
        uris: &[String],
    ) -> StoreResult<HashMap<String, PostInteractionCounts>>;

    // Likes
    async fn create_like(&self, like: Like) -> StoreResult<()>;
    async fn delete_like(&self, uri: &str) -> StoreResult<()>;
    async fn get_likes_by_subject(
        &self,
        subject_uri: &str,
        page: PageRequest,
    ) -> StoreResult<Page<Like>>;
    async fn get_like_for_author_subject(
        &self,
        author_did: &str,
        subject_uri: &str,
    ) -> StoreResult<Option<Like>>;

    // Follows
    async fn create_follow(&self, follow: Follow) -> StoreResult<()>;
    async fn delete_follow(&self, uri: &str) -> StoreResult<()>;
    async fn get_follows_by_actor(&self, did: &str, page: PageRequest)
        -> StoreResult<Page<Follow>>;
    async fn get_followers_by_actor(
        &self,
        did: &str,
        page: PageRequest,
    ) -> StoreResult<Page<Follow>>;
    async fn get_follow_for_author_subject(
        &self,
        author_did: &str,
        subject_did: &str,
    ) -> StoreResult<Option<Follow>>;
    async fn get_follow_counts(&self, dids: &[String])
        -> StoreResult<HashMap<String, FollowCounts>>;

    // Blob references
    async fn create_blob_ref(&self, blob_ref: BlobRef) -> StoreResult<()>;
    async fn update_blob_ref(&self, blob_ref: BlobRef) -> StoreResult<()>;
    async fn get_blob_ref(&self, did: &str, cid: &str) -> StoreResult<BlobRef>;
}

/// Repository DID from an `at://<did>/<collection>/<rkey>` URI
pub fn uri_authority(uri: &str) -> StoreResult<&str> {
    let rest = uri
        .strip_prefix("at://")
        .ok_or_else(|| StoreError::InvalidArgument(format!("invalid at-uri: {}", uri)))?;
    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(StoreError::InvalidArgument(format!("invalid at-uri: {}", uri)));
    }
    Ok(authority)
}

/// Fill in the author from the URI when absent, reject a mismatch
pub(crate) fn check_post_author(post: &mut Post) -> StoreResult<()> {
    let authority = uri_authority(&post.uri)?.to_string();
    if post.author_did.is_empty() {
        post.author_did = authority;
    } else if post.author_did != authority {
        return Err(StoreError::InvalidArgument(format!(
            "post author {} does not own {}",
            post.author_did, post.uri
        )));
    }
    Ok(())
}

pub(crate) fn require_keys(keys: &[String], what: &str) -> StoreResult<()> {
    if keys.is_empty() {
        return Err(StoreError::InvalidArgument(format!(
            "at least one {} must be specified",
            what
        )));
    }
    Ok(())
}
