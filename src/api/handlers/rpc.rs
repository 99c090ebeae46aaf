// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! `POST /rpc/<Method>` handlers. Every handler answers 200 with an
//! envelope; failures, malformed bodies included, travel in its `error`.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;

use crate::api::routes::*;
use crate::api::AppState;
use crate::store::Page;

/// Define a handler: decode the request, run `$call` against the store and
/// wrap the outcome.
macro_rules! rpc_handler {
    ($name:ident, $req:ty => $data:ty, |$store:ident, $request:ident| $call:expr) => {
        pub async fn $name(
            State(state): State<AppState>,
            payload: Result<Json<$req>, JsonRejection>,
        ) -> Json<Envelope<$data>> {
            let $request = match payload {
                Ok(Json(request)) => request,
                Err(rejection) => return Json(Envelope::error(rejection.body_text())),
            };
            let $store = state.store.as_ref();
            Json(Envelope::from_result($call.await))
        }
    };
}

fn done(_: ()) -> Empty {
    Empty {}
}

fn page_parts<T>(page: Page<T>) -> (Vec<T>, Option<String>) {
    (page.items, page.cursor)
}

// Profiles

rpc_handler!(create_profile, ProfileRequest => Empty, |store, req| async move {
    store.create_profile(req.profile).await.map(done)
});

rpc_handler!(update_profile, ProfileRequest => Empty, |store, req| async move {
    store.update_profile(req.profile).await.map(done)
});

rpc_handler!(delete_profile, DidRequest => Empty, |store, req| async move {
    store.delete_profile(&req.did).await.map(done)
});

rpc_handler!(get_profile, DidRequest => ProfileData, |store, req| async move {
    store
        .get_profile(&req.did)
        .await
        .map(|profile| ProfileData { profile: Some(profile) })
});

rpc_handler!(get_profiles, DidsRequest => ProfilesData, |store, req| async move {
    store
        .get_profiles(&req.dids)
        .await
        .map(|profiles| ProfilesData { profiles })
});

rpc_handler!(get_profile_counts, DidsRequest => ProfileCountsData, |store, req| async move {
    store
        .get_profile_counts(&req.dids)
        .await
        .map(|counts| CountsData { counts })
});

// Posts

rpc_handler!(create_post, PostRequest => Empty, |store, req| async move {
    store.create_post(req.post).await.map(done)
});

rpc_handler!(delete_post, UriRequest => Empty, |store, req| async move {
    store.delete_post(&req.uri).await.map(done)
});

rpc_handler!(get_posts, UrisRequest => PostsData, |store, req| async move {
    store
        .get_posts(&req.uris)
        .await
        .map(|posts| PostsData { posts, cursor: None })
});

rpc_handler!(get_posts_by_actor, ActorPageRequest => PostsData, |store, req| async move {
    store.get_posts_by_actor(&req.did, req.page).await.map(|page| {
        let (posts, cursor) = page_parts(page);
        PostsData { posts, cursor }
    })
});

rpc_handler!(get_posts_interaction_counts, UrisRequest => PostCountsData, |store, req| async move {
    store
        .get_posts_interaction_counts(&req.uris)
        .await
        .map(|counts| CountsData { counts })
});

// Likes

rpc_handler!(create_like, LikeRequest => Empty, |store, req| async move {
    store.create_like(req.like).await.map(done)
});

rpc_handler!(delete_like, UriRequest => Empty, |store, req| async move {
    store.delete_like(&req.uri).await.map(done)
});

rpc_handler!(get_likes_by_subject, SubjectPageRequest => LikesData, |store, req| async move {
    store
        .get_likes_by_subject(&req.subject_uri, req.page)
        .await
        .map(|page| {
            let (likes, cursor) = page_parts(page);
            LikesData { likes, cursor }
        })
});

rpc_handler!(get_like_for_author_subject, LikeAuthorSubjectRequest => LikeData, |store, req| async move {
    store
        .get_like_for_author_subject(&req.author_did, &req.subject_uri)
        .await
        .map(|like| LikeData { like })
});

// Follows

rpc_handler!(create_follow, FollowRequest => Empty, |store, req| async move {
    store.create_follow(req.follow).await.map(done)
});

rpc_handler!(delete_follow, UriRequest => Empty, |store, req| async move {
    store.delete_follow(&req.uri).await.map(done)
});

rpc_handler!(get_follows_by_actor, ActorPageRequest => FollowsData, |store, req| async move {
    store.get_follows_by_actor(&req.did, req.page).await.map(|page| {
        let (follows, cursor) = page_parts(page);
        FollowsData { follows, cursor }
    })
});

rpc_handler!(get_followers_by_actor, ActorPageRequest => FollowersData, |store, req| async move {
    store.get_followers_by_actor(&req.did, req.page).await.map(|page| {
        let (followers, cursor) = page_parts(page);
        FollowersData { followers, cursor }
    })
});

rpc_handler!(get_follow_for_author_subject, FollowAuthorSubjectRequest => FollowData, |store, req| async move {
    store
        .get_follow_for_author_subject(&req.author_did, &req.subject_did)
        .await
        .map(|follow| FollowData { follow })
});

rpc_handler!(get_follow_counts, DidsRequest => FollowCountsData, |store, req| async move {
    store
        .get_follow_counts(&req.dids)
        .await
        .map(|counts| CountsData { counts })
});

// Blob references

rpc_handler!(create_blob_ref, BlobRefRequest => Empty, |store, req| async move {
    store.create_blob_ref(req.blob_ref).await.map(done)
});

rpc_handler!(update_blob_ref, BlobRefRequest => Empty, |store, req| async move {
    store.update_blob_ref(req.blob_ref).await.map(done)
});

rpc_handler!(get_blob_ref, BlobRefKeyRequest => BlobRefData, |store, req| async move {
    store
        .get_blob_ref(&req.did, &req.cid)
        .await
        .map(|blob_ref| BlobRefData { blob_ref: Some(blob_ref) })
});
