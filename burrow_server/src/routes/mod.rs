//! Request routing for the Burrow server
//!
//! Everything arrives through one fallback handler because routing is
//! host-driven: the base domain serves the control plane and the small
//! public surface, every subdomain is proxied into its tunnel.

pub mod admin;
pub mod control;
pub mod ingress;
pub mod websocket;

use crate::auth::Authenticator;
use crate::config::Config;
use crate::limiter::RateLimits;
use crate::pending::{PendingRequestStore, PendingWebSocketStore};
use crate::registry::TunnelRegistry;
use crate::sessions::{spawn_heartbeat, ConnectionManager};
use axum::{
    body::Body,
    extract::{ConnectInfo, Query, State},
    http::{header, Method, Request, Response, StatusCode},
    response::IntoResponse,
};
use burrow_common::constants;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<TunnelRegistry>,
    pub connections: Arc<ConnectionManager>,
    pub pending_requests: Arc<PendingRequestStore>,
    pub pending_sockets: Arc<PendingWebSocketStore>,
    pub limits: Arc<RateLimits>,
    pub authenticator: Arc<Authenticator>,
}

impl AppState {
    /// Construct every component and start the background tasks. The
    /// returned handles are aborted in reverse order on shutdown.
    pub fn new(config: Config) -> (Self, Vec<JoinHandle<()>>) {
        let config = Arc::new(config);
        let limits = Arc::new(RateLimits::new(config.rate_limits_enabled()));
        let registry = Arc::new(TunnelRegistry::new(config.reserved.clone()));
        let connections = Arc::new(ConnectionManager::new());
        let pending_requests = Arc::new(PendingRequestStore::new());
        let pending_sockets = Arc::new(PendingWebSocketStore::new());
        let authenticator = Arc::new(Authenticator::new(config.master_key.clone()));

        let tasks = vec![
            RateLimits::spawn_sweeper(limits.clone()),
            PendingRequestStore::spawn_sweeper(
                pending_requests.clone(),
                config.request_timeout(),
            ),
            PendingWebSocketStore::spawn_sweeper(
                pending_sockets.clone(),
                config.request_timeout(),
            ),
            spawn_heartbeat(connections.clone()),
        ];

        let state = Self {
            config,
            registry,
            connections,
            pending_requests,
            pending_sockets,
            limits,
            authenticator,
        };
        (state, tasks)
    }
}

/// Where a request's Host header points.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum HostTarget {
    /// The base domain (or a host we don't route): the public surface
    Root,
    /// One subdomain label in front of the base domain
    Tunnel(String),
}

/// Purely lexical: strip the port, then peel the base domain off.
pub(crate) fn classify_host(host: &str, base_domain: &str) -> HostTarget {
    let host = host.split(':').next().unwrap_or(host).to_lowercase();
    let base = base_domain.to_lowercase();

    if host == base {
        return HostTarget::Root;
    }
    match host.strip_suffix(&base).and_then(|h| h.strip_suffix('.')) {
        Some(prefix) if !prefix.is_empty() => HostTarget::Tunnel(prefix.to_string()),
        _ => HostTarget::Root,
    }
}

/// Single entry point: route by host, then by path.
pub async fn handle_fallback(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response<Body> {
    let Some(host) = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.to_string()))
    else {
        return (StatusCode::BAD_REQUEST, "Missing Host header").into_response();
    };

    match classify_host(&host, &state.config.domain) {
        HostTarget::Tunnel(subdomain) => {
            ingress::handle_ingress(state, subdomain, request).await
        }
        HostTarget::Root => handle_root(state, addr, request).await,
    }
}

/// The base-domain surface: health, TLS verification, the control
/// endpoint, the read-only admin hooks, and a plaintext landing fallback.
async fn handle_root(
    state: AppState,
    addr: SocketAddr,
    request: Request<Body>,
) -> Response<Body> {
    let path = request.uri().path().to_string();
    let method = request.method().clone();

    if path == constants::CONTROL_PATH {
        return control::handle_control_upgrade(state, addr, request).await;
    }

    if path.starts_with("/api/") {
        return admin::handle_admin(state, request).await;
    }

    if method == Method::GET && path == "/health" {
        return health(State(state)).await.into_response();
    }
    if method == Method::GET && path == "/tunnel/verify" {
        let query: Query<HashMap<String, String>> =
            Query::try_from_uri(request.uri()).unwrap_or_else(|_| Query(HashMap::new()));
        return verify(State(state), query).await.into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "Burrow tunnel server\n",
    )
        .into_response()
}

/// Health check endpoint
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "tunnels": state.registry.len(),
    }))
}

/// On-demand TLS verification: an upstream proxy asks whether a domain
/// deserves a certificate before provisioning one.
async fn verify(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> StatusCode {
    let Some(domain) = params.get("domain") else {
        return StatusCode::BAD_REQUEST;
    };

    let host = domain.split(':').next().unwrap_or(domain).to_lowercase();
    if host == state.config.domain.to_lowercase() {
        return StatusCode::OK;
    }
    match classify_host(&host, &state.config.domain) {
        HostTarget::Tunnel(subdomain)
            if state.registry.find_by_subdomain(&subdomain).is_some() =>
        {
            StatusCode::OK
        }
        _ => StatusCode::NOT_FOUND,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_host() {
        assert_eq!(
            classify_host("demo.burrow.example", "burrow.example"),
            HostTarget::Tunnel("demo".to_string())
        );
        assert_eq!(
            classify_host("demo.burrow.example:8080", "burrow.example"),
            HostTarget::Tunnel("demo".to_string())
        );
        assert_eq!(
            classify_host("DEMO.Burrow.Example", "burrow.example"),
            HostTarget::Tunnel("demo".to_string())
        );
        assert_eq!(
            classify_host("burrow.example", "burrow.example"),
            HostTarget::Root
        );
        assert_eq!(
            classify_host("burrow.example:443", "burrow.example"),
            HostTarget::Root
        );
        // Suffix match must be on a label boundary
        assert_eq!(
            classify_host("evilburrow.example", "burrow.example"),
            HostTarget::Root
        );
        assert_eq!(classify_host("10.0.0.1:8080", "burrow.example"), HostTarget::Root);
    }
}
