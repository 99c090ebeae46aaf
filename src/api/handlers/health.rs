// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use crate::api::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let Some(db) = state.db else {
        return (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "message": "RPC server is running"
            })),
        );
    };

    match db.get_connection().await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "message": "RPC server is running"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "message": format!("Database connection failed: {}", e)
            })),
        ),
    }
}

/// Prometheus text exposition of every metric this process has recorded
pub async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let Some(metrics) = state.metrics else {
        return (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "text/plain".to_string())],
            b"metrics are not enabled".to_vec(),
        );
    };
    match metrics.render() {
        Ok((content_type, body)) => (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain".to_string())],
            format!("Failed to encode metrics: {}", e).into_bytes(),
        ),
    }
}
