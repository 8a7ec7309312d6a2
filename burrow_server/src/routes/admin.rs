//! Admin surface touch points
//!
//! Read-only inspection hooks plus the reserved-subdomain reload, which
//! goes through the registry's normal mutator.

use crate::routes::AppState;
use axum::{
    body::Body,
    http::{Method, Request, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use http_body_util::BodyExt;

pub async fn handle_admin(state: AppState, request: Request<Body>) -> Response<Body> {
    match (request.method().clone(), request.uri().path()) {
        (method, "/api/tunnels") if method == Method::GET => list_tunnels(state).await,
        (method, "/api/sessions") if method == Method::GET => list_sessions(state).await,
        (method, "/api/stats") if method == Method::GET => stats(state).await,
        (method, "/api/reserved") if method == Method::PUT => {
            reload_reserved(state, request).await
        }
        _ => (StatusCode::NOT_FOUND, "Not found").into_response(),
    }
}

async fn list_tunnels(state: AppState) -> Response<Body> {
    let tunnels: Vec<_> = state
        .registry
        .list()
        .into_iter()
        .map(|t| {
            serde_json::json!({
                "id": t.id,
                "subdomain": t.subdomain,
                "url": state.config.public_url(&t.subdomain),
                "session_id": t.session_id,
                "protocol": t.protocol.as_str(),
                "protected": t.basic_auth.is_some(),
                "created_at": t.created_at,
            })
        })
        .collect();
    Json(serde_json::json!({ "tunnels": tunnels })).into_response()
}

async fn list_sessions(state: AppState) -> Response<Body> {
    let sessions: Vec<_> = state
        .connections
        .list()
        .into_iter()
        .map(|s| {
            serde_json::json!({
                "id": s.id,
                "account_id": s.account_id(),
                "authenticated": s.is_authenticated(),
                "created_at": s.created_at,
                "idle_secs": s.idle_for().as_secs(),
            })
        })
        .collect();
    Json(serde_json::json!({ "sessions": sessions })).into_response()
}

async fn stats(state: AppState) -> Response<Body> {
    Json(serde_json::json!({
        "tunnels": state.registry.len(),
        "sessions": state.connections.len(),
        "pending_requests": state.pending_requests.len(),
        "pending_websockets": state.pending_sockets.len(),
    }))
    .into_response()
}

/// Hot-reload the reserved-subdomain set. Body: JSON array of labels.
async fn reload_reserved(state: AppState, request: Request<Body>) -> Response<Body> {
    let body = match request.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return (StatusCode::BAD_REQUEST, "Unreadable body").into_response(),
    };
    let labels: Vec<String> = match serde_json::from_slice(&body) {
        Ok(labels) => labels,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("Invalid JSON: {}", e)).into_response()
        }
    };

    let count = labels.len();
    state.registry.reload_reserved(labels);
    tracing::info!("Reserved subdomain set reloaded ({} extra labels)", count);
    Json(serde_json::json!({ "reserved": count })).into_response()
}
