// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! HTTP client for a storage engine served by another process.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error};

use super::pagination::{Page, PageRequest};
use super::{SocialStore, StoreError, StoreResult};
use crate::api::routes::*;
use crate::models::{
    BlobRef, Follow, FollowCounts, Like, Post, PostInteractionCounts, Profile, ProfileCounts,
};

/// `SocialStore` over the `/rpc/<Method>` surface
pub struct RpcStore {
    client: reqwest::Client,
    base_url: String,
}

impl RpcStore {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn call<Req, T>(&self, method: &str, request: &Req) -> StoreResult<T>
    where
        Req: Serialize + Sync,
        T: DeserializeOwned + Default,
    {
        let url = format!("{}/rpc/{}", self.base_url, method);
        debug!("Calling {}", url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                error!("RPC {} failed: {}", method, e);
                StoreError::backend(e)
            })?;
        let envelope: Envelope<T> = response.json().await.map_err(StoreError::backend)?;
        envelope.into_result()
    }
}

#[async_trait]
impl SocialStore for RpcStore {
    async fn create_profile(&self, profile: Profile) -> StoreResult<()> {
        self.call::<_, Empty>("CreateProfile", &ProfileRequest { profile })
            .await
            .map(|_| ())
    }

    async fn update_profile(&self, profile: Profile) -> StoreResult<()> {
        self.call::<_, Empty>("UpdateProfile", &ProfileRequest { profile })
            .await
            .map(|_| ())
    }

    async fn delete_profile(&self, did: &str) -> StoreResult<()> {
        self.call::<_, Empty>("DeleteProfile", &DidRequest { did: did.to_string() })
            .await
            .map(|_| ())
    }

    async fn get_profile(&self, did: &str) -> StoreResult<Profile> {
        let data: ProfileData = self
            .call("GetProfile", &DidRequest { did: did.to_string() })
            .await?;
        data.profile.ok_or(StoreError::NotFound)
    }

    async fn get_profiles(&self, dids: &[String]) -> StoreResult<Vec<Profile>> {
        let data: ProfilesData = self
            .call("GetProfiles", &DidsRequest { dids: dids.to_vec() })
            .await?;
        Ok(data.profiles)
    }

    async fn get_profile_counts(
        &self,
        dids: &[String],
    ) -> StoreResult<HashMap<String, ProfileCounts>> {
        let data: ProfileCountsData = self
            .call("GetProfileCounts", &DidsRequest { dids: dids.to_vec() })
            .await?;
        Ok(data.counts)
    }

    async fn create_post(&self, post: Post) -> StoreResult<()> {
        self.call::<_, Empty>("CreatePost", &PostRequest { post })
            .await
            .map(|_| ())
    }

    async fn delete_post(&self, uri: &str) -> StoreResult<()> {
        self.call::<_, Empty>("DeletePost", &UriRequest { uri: uri.to_string() })
            .await
            .map(|_| ())
    }

    async fn get_posts(&self, uris: &[String]) -> StoreResult<Vec<Post>> {
        let data: PostsData = self
            .call("GetPosts", &UrisRequest { uris: uris.to_vec() })
            .await?;
        Ok(data.posts)
    }

    async fn get_posts_by_actor(&self, did: &str, page: PageRequest) -> StoreResult<Page<Post>> {
        let data: PostsData = self
            .call(
                "GetPostsByActor",
                &ActorPageRequest {
                    did: did.to_string(),
                    page,
                },
            )
            .await?;
        Ok(Page {
            items: data.posts,
            cursor: data.cursor,
        })
    }

    async fn get_posts_interaction_counts(
        &self,
        uris: &[String],
    ) -> StoreResult<HashMap<String, PostInteractionCounts>> {
        let data: PostCountsData = self
            .call("GetPostsInteractionCounts", &UrisRequest { uris: uris.to_vec() })
            .await?;
        Ok(data.counts)
    }

    async fn create_like(&self, like: Like) -> StoreResult<()> {
        self.call::<_, Empty>("CreateLike", &LikeRequest { like })
            .await
            .map(|_| ())
    }

    async fn delete_like(&self, uri: &str) -> StoreResult<()> {
        self.call::<_, Empty>("DeleteLike", &UriRequest { uri: uri.to_string() })
            .await
            .map(|_| ())
    }

    async fn get_likes_by_subject(
        &self,
        subject_uri: &str,
        page: PageRequest,
    ) -> StoreResult<Page<Like>> {
        let data: LikesData = self
            .call(
                "GetLikesBySubject",
                &SubjectPageRequest {
                    subject_uri: subject_uri.to_string(),
                    page,
                },
            )
            .await?;
        Ok(Page {
            items: data.likes,
            cursor: data.cursor,
        })
    }

    async fn get_like_for_author_subject(
        &self,
        author_did: &str,
        subject_uri: &str,
    ) -> StoreResult<Option<Like>> {
        let data: LikeData = self
            .call(
                "GetLikeForAuthorSubject",
                &LikeAuthorSubjectRequest {
                    author_did: author_did.to_string(),
                    subject_uri: subject_uri.to_string(),
                },
            )
            .await?;
        Ok(data.like)
    }

    async fn create_follow(&self, follow: Follow) -> StoreResult<()> {
        self.call::<_, Empty>("CreateFollow", &FollowRequest { follow })
            .await
            .map(|_| ())
    }

    async fn delete_follow(&self, uri: &str) -> StoreResult<()> {
        self.call::<_, Empty>("DeleteFollow", &UriRequest { uri: uri.to_string() })
            .await
            .map(|_| ())
    }

    async fn get_follows_by_actor(
        &self,
        did: &str,
        page: PageRequest,
    ) -> StoreResult<Page<Follow>> {
        let data: FollowsData = self
            .call(
                "GetFollowsByActor",
                &ActorPageRequest {
                    did: did.to_string(),
                    page,
                },
            )
            .await?;
        Ok(Page {
            items: data.follows,
            cursor: data.cursor,
        })
    }

    async fn get_followers_by_actor(
        &self,
        did: &str,
        page: PageRequest,
    ) -> StoreResult<Page<Follow>> {
        let data: FollowersData = self
            .call(
                "GetFollowersByActor",
                &ActorPageRequest {
                    did: did.to_string(),
                    page,
                },
            )
            .await?;
        Ok(Page {
            items: data.followers,
            cursor: data.cursor,
        })
    }

    async fn get_follow_for_author_subject(
        &self,
        author_did: &str,
        subject_did: &str,
    ) -> StoreResult<Option<Follow>> {
        let data: FollowData = self
            .call(
                "GetFollowForAuthorSubject",
                &FollowAuthorSubjectRequest {
                    author_did: author_did.to_string(),
                    subject_did: subject_did.to_string(),
                },
            )
            .await?;
        Ok(data.follow)
    }

    async fn get_follow_counts(&self, dids: &[String]) -> StoreResult<HashMap<String, FollowCounts>> {
        let data: FollowCountsData = self
            .call("GetFollowCounts", &DidsRequest { dids: dids.to_vec() })
            .await?;
        Ok(data.counts)
    }

    async fn create_blob_ref(&self, blob_ref: BlobRef) -> StoreResult<()> {
        self.call::<_, Empty>("CreateBlobRef", &BlobRefRequest { blob_ref })
            .await
            .map(|_| ())
    }

    async fn update_blob_ref(&self, blob_ref: BlobRef) -> StoreResult<()> {
        self.call::<_, Empty>("UpdateBlobRef", &BlobRefRequest { blob_ref })
            .await
            .map(|_| ())
    }

    async fn get_blob_ref(&self, did: &str, cid: &str) -> StoreResult<BlobRef> {
        let data: BlobRefData = self
            .call(
                "GetBlobRef",
                &BlobRefKeyRequest {
                    did: did.to_string(),
                    cid: cid.to_string(),
                },
            )
            .await?;
        data.blob_ref.ok_or(StoreError::NotFound)
    }
}
