// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! Request and response messages of the storage RPC surface. Shared by the
//! HTTP handlers and the [`RpcStore`](crate::store::RpcStore) client.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::{
    BlobRef, Follow, FollowCounts, Like, Post, PostInteractionCounts, Profile, ProfileCounts,
};
use crate::store::{PageRequest, StoreError, StoreResult};

/// Response wrapper: data fields inline, plus an optional error message.
/// Errors travel as text; the "not found" sentinel is the only one callers
/// branch on.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(flatten)]
    pub data: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Default> Envelope<T> {
    /// Create a success response with data
    pub fn success(data: T) -> Self {
        Self { data, error: None }
    }

    /// Create an error response with message
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            data: T::default(),
            error: Some(message.into()),
        }
    }

    pub fn from_result(result: StoreResult<T>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(err) => Self::error(err.to_string()),
        }
    }

    pub fn into_result(self) -> StoreResult<T> {
        match self.error {
            Some(message) => Err(StoreError::from_message(message)),
            None => Ok(self.data),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Empty {}

// Requests

#[derive(Debug, Serialize, Deserialize)]
pub struct ProfileRequest {
    pub profile: Profile,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DidRequest {
    pub did: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DidsRequest {
    pub dids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PostRequest {
    pub post: Post,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UriRequest {
    pub uri: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UrisRequest {
    pub uris: Vec<String>,
}

/// `{did, limit, cursor}`
#[derive(Debug, Serialize, Deserialize)]
pub struct ActorPageRequest {
    pub did: String,
    #[serde(flatten)]
    pub page: PageRequest,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectPageRequest {
    pub subject_uri: String,
    #[serde(flatten)]
    pub page: PageRequest,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LikeRequest {
    pub like: Like,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeAuthorSubjectRequest {
    pub author_did: String,
    pub subject_uri: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FollowRequest {
    pub follow: Follow,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowAuthorSubjectRequest {
    pub author_did: String,
    pub subject_did: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobRefRequest {
    pub blob_ref: BlobRef,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlobRefKeyRequest {
    pub did: String,
    pub cid: String,
}

// Response data

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProfileData {
    pub profile: Option<Profile>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProfilesData {
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CountsData<C> {
    #[serde(default)]
    pub counts: HashMap<String, C>,
}

impl<C> Default for CountsData<C> {
    fn default() -> Self {
        Self {
            counts: HashMap::new(),
        }
    }
}

pub type ProfileCountsData = CountsData<ProfileCounts>;
pub type FollowCountsData = CountsData<FollowCounts>;
pub type PostCountsData = CountsData<PostInteractionCounts>;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PostsData {
    #[serde(default)]
    pub posts: Vec<Post>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LikesData {
    #[serde(default)]
    pub likes: Vec<Like>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LikeData {
    pub like: Option<Like>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FollowsData {
    #[serde(default)]
    pub follows: Vec<Follow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FollowersData {
    #[serde(default)]
    pub followers: Vec<Follow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FollowData {
    pub follow: Option<Follow>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobRefData {
    pub blob_ref: Option<BlobRef>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_envelope_carries_default_data() {
        let envelope = Envelope::<FollowData>::from_result(Err(StoreError::NotFound));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value, json!({"follow": null, "error": "not found"}));
    }

    #[test]
    fn paged_request_is_flat() {
        let request: ActorPageRequest =
            serde_json::from_value(json!({"did": "did:example:abc", "limit": 1})).unwrap();
        assert_eq!(request.page, PageRequest::new(1));

        let value = serde_json::to_value(ActorPageRequest {
            did: "did:example:abc".to_string(),
            page: PageRequest::after(5, "c"),
        })
        .unwrap();
        assert_eq!(value, json!({"did": "did:example:abc", "limit": 5, "cursor": "c"}));
    }

    #[test]
    fn envelope_round_trips_the_sentinel() {
        let raw = json!({"error": "not found"});
        let envelope: Envelope<BlobRefData> = serde_json::from_value(raw).unwrap();
        assert_eq!(envelope.into_result().unwrap_err(), StoreError::NotFound);
    }
}
