// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! HTTP surface of the storage engine: one `POST /rpc/<Method>` route per
//! store operation, plus health and metrics.

pub mod routes;
mod handlers;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::db::Database;
use crate::metrics::PrometheusMetrics;
use crate::store::SocialStore;

use handlers::rpc;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SocialStore>,
    /// Probed by `/health` when the store is database-backed
    pub db: Option<Arc<Database>>,
    pub metrics: Option<Arc<PrometheusMetrics>>,
}

impl AppState {
    pub fn new(store: Arc<dyn SocialStore>) -> Self {
        Self {
            store,
            db: None,
            metrics: None,
        }
    }

    pub fn with_database(mut self, db: Arc<Database>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<PrometheusMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // General routes
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::health::get_metrics))
        // Profiles
        .route("/rpc/CreateProfile", post(rpc::create_profile))
        .route("/rpc/UpdateProfile", post(rpc::update_profile))
        .route("/rpc/DeleteProfile", post(rpc::delete_profile))
        .route("/rpc/GetProfile", post(rpc::get_profile))
        .route("/rpc/GetProfiles", post(rpc::get_profiles))
        .route("/rpc/GetProfileCounts", post(rpc::get_profile_counts))
        // Posts
        .route("/rpc/CreatePost", post(rpc::create_post))
        .route("/rpc/DeletePost", post(rpc::delete_post))
        .route("/rpc/GetPosts", post(rpc::get_posts))
        .route("/rpc/GetPostsByActor", post(rpc::get_posts_by_actor))
        .route(
            "/rpc/GetPostsInteractionCounts",
            post(rpc::get_posts_interaction_counts),
        )
        // Likes
        .route("/rpc/CreateLike", post(rpc::create_like))
        .route("/rpc/DeleteLike", post(rpc::delete_like))
        .route("/rpc/GetLikesBySubject", post(rpc::get_likes_by_subject))
        .route(
            "/rpc/GetLikeForAuthorSubject",
            post(rpc::get_like_for_author_subject),
        )
        // Follows
        .route("/rpc/CreateFollow", post(rpc::create_follow))
        .route("/rpc/DeleteFollow", post(rpc::delete_follow))
        .route("/rpc/GetFollowsByActor", post(rpc::get_follows_by_actor))
        .route("/rpc/GetFollowersByActor", post(rpc::get_followers_by_actor))
        .route(
            "/rpc/GetFollowForAuthorSubject",
            post(rpc::get_follow_for_author_subject),
        )
        .route("/rpc/GetFollowCounts", post(rpc::get_follow_counts))
        // Blob references
        .route("/rpc/CreateBlobRef", post(rpc::create_blob_ref))
        .route("/rpc/UpdateBlobRef", post(rpc::update_blob_ref))
        .route("/rpc/GetBlobRef", post(rpc::get_blob_ref))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve the RPC surface until `cancel` fires; in-flight requests finish.
pub async fn serve(addr: SocketAddr, state: AppState, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_on(listener, state, cancel).await
}

pub async fn serve_on(
    listener: tokio::net::TcpListener,
    state: AppState,
    cancel: CancellationToken,
) -> Result<()> {
    info!("Starting RPC server on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    info!("RPC server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsSink;
    use crate::models::{Follow, Profile};
    use crate::store::{MemoryStore, PageRequest, RpcStore, StoreError};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> Router {
        router(AppState::new(Arc::new(MemoryStore::new())))
    }

    async fn call(app: &Router, method: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(format!("/rpc/{}", method))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn follow(rkey: &str, author: &str, subject: &str, day: u32) -> Value {
        json!({"follow": {
            "uri": format!("at://{}/app.vylet.graph.follow/{}", author, rkey),
            "cid": "bafyreifollow",
            "subjectDid": subject,
            "authorDid": author,
            "createdAt": format!("2024-01-{:02}T00:00:00Z", day)
        }})
    }

    #[tokio::test]
    async fn profile_create_then_get() {
        let app = app();
        let (status, body) = call(
            &app,
            "CreateProfile",
            json!({"profile": {
                "did": "did:plc:alice",
                "displayName": "Alice",
                "createdAt": "2024-01-01T00:00:00Z"
            }}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({}));

        let (_, body) = call(&app, "GetProfile", json!({"did": "did:plc:alice"})).await;
        assert_eq!(body["profile"]["displayName"], "Alice");
        assert!(body.get("error").is_none());
    }

    #[tokio::test]
    async fn failures_ride_in_the_envelope() {
        let app = app();
        let (status, body) = call(&app, "GetProfile", json!({"did": "did:plc:nobody"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["error"], "not found");
        assert_eq!(body["profile"], Value::Null);

        let (status, body) = call(&app, "GetProfile", json!({"handle": 3})).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["error"].as_str().unwrap().contains("did"));
    }

    #[tokio::test]
    async fn followers_page_through_the_cursor() {
        let app = app();
        for (day, rkey, author) in [(1, "a", "did:plc:a"), (2, "b", "did:plc:b"), (3, "c", "did:plc:c")] {
            let (_, body) = call(&app, "CreateFollow", follow(rkey, author, "did:plc:bob", day)).await;
            assert_eq!(body, json!({}));
        }

        let (_, first) = call(
            &app,
            "GetFollowersByActor",
            json!({"did": "did:plc:bob", "limit": 2}),
        )
        .await;
        let authors: Vec<&str> = first["followers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["authorDid"].as_str().unwrap())
            .collect();
        assert_eq!(authors, vec!["did:plc:c", "did:plc:b"]);
        let cursor = first["cursor"].as_str().unwrap().to_string();

        let (_, second) = call(
            &app,
            "GetFollowersByActor",
            json!({"did": "did:plc:bob", "limit": 2, "cursor": cursor}),
        )
        .await;
        assert_eq!(second["followers"][0]["authorDid"], "did:plc:a");
        assert!(second.get("cursor").is_none());

        let (_, counts) = call(&app, "GetFollowCounts", json!({"dids": ["did:plc:bob"]})).await;
        assert_eq!(counts["counts"]["did:plc:bob"]["followers"], 3);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_prometheus_text() {
        let metrics = Arc::new(PrometheusMetrics::new());
        metrics.incr("indexer_events_handled", &[("status", "ok")]);
        let app = router(AppState::new(Arc::new(MemoryStore::new())).with_metrics(metrics));

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("vylet_indexer_events_handled"));
    }

    #[tokio::test]
    async fn rpc_store_talks_to_the_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve_on(
            listener,
            AppState::new(Arc::new(MemoryStore::new())),
            cancel.clone(),
        ));

        let client = RpcStore::new(&format!("http://{}", addr)).unwrap();
        let created_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        client
            .create_profile(Profile {
                did: "did:plc:alice".to_string(),
                display_name: Some("Alice".to_string()),
                description: None,
                pronouns: None,
                avatar: None,
                created_at,
                indexed_at: created_at,
                updated_at: created_at,
            })
            .await
            .unwrap();
        client
            .create_follow(Follow {
                uri: "at://did:plc:alice/app.vylet.graph.follow/1".to_string(),
                cid: "bafyreifollow".to_string(),
                subject_did: "did:plc:bob".to_string(),
                author_did: "did:plc:alice".to_string(),
                created_at,
                indexed_at: created_at,
            })
            .await
            .unwrap();

        let profile = client.get_profile("did:plc:alice").await.unwrap();
        assert_eq!(profile.display_name.as_deref(), Some("Alice"));
        let follows = client
            .get_follows_by_actor("did:plc:alice", PageRequest::new(10))
            .await
            .unwrap();
        assert_eq!(follows.items[0].subject_did, "did:plc:bob");
        assert_eq!(
            client.get_blob_ref("did:plc:alice", "bafkreimissing").await.unwrap_err(),
            StoreError::NotFound
        );
        assert!(client
            .get_follow_for_author_subject("did:plc:bob", "did:plc:alice")
            .await
            .unwrap()
            .is_none());

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
