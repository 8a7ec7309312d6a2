//! Public ingress - inbound HTTP for tunneled services
//!
//! The pipeline: tunnel lookup, optional basic auth, the per-tunnel
//! request bucket, then the proxied exchange. The exchange registers a
//! pending request, streams the body to the tunnel client in bounded
//! chunks, and parks on the response signal with a timeout.

use crate::auth::constant_time_eq;
use crate::pending::ResponseEvent;
use crate::routes::AppState;
use crate::sessions::ControlSession;
use axum::{
    body::Body,
    http::{header, HeaderMap, Request, Response, StatusCode},
    response::IntoResponse,
};
use base64::Engine;
use burrow_common::{constants, headers, new_request_id, ProtocolMessage};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Handle an incoming public request for `subdomain`.
pub async fn handle_ingress(
    state: AppState,
    subdomain: String,
    request: Request<Body>,
) -> Response<Body> {
    let Some(tunnel) = state.registry.find_by_subdomain(&subdomain) else {
        return (StatusCode::NOT_FOUND, "Unknown subdomain").into_response();
    };

    if let Some(expected) = &tunnel.basic_auth {
        if !basic_auth_matches(request.headers(), expected) {
            return (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"burrow\"")],
                "Unauthorized",
            )
                .into_response();
        }
    }

    if !state.limits.requests.allow(&tunnel.id) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, "1")],
            "Rate limit exceeded",
        )
            .into_response();
    }

    let Some(session) = state.connections.find(tunnel.session_id) else {
        return (StatusCode::BAD_GATEWAY, "Tunnel client disconnected").into_response();
    };

    if is_websocket_upgrade_request(request.headers()) {
        return super::websocket::handle_ws_ingress(state, tunnel, session, request).await;
    }

    proxy_exchange(state, &tunnel.id, session, request).await
}

/// One proxied HTTP exchange over the control stream.
async fn proxy_exchange(
    state: AppState,
    tunnel_id: &str,
    session: Arc<ControlSession>,
    request: Request<Body>,
) -> Response<Body> {
    let (parts, body) = request.into_parts();
    let request_id = new_request_id();

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    tracing::debug!("{} {} -> tunnel {}", parts.method, path, tunnel_id);

    let (response_tx, mut response_rx) = mpsc::channel::<ResponseEvent>(64);
    state
        .pending_requests
        .add(request_id.clone(), tunnel_id.to_string(), response_tx);

    let start = ProtocolMessage::RequestStart {
        request_id: request_id.clone(),
        tunnel_id: tunnel_id.to_string(),
        method: parts.method.to_string(),
        path,
        headers: headers::to_header_list(&parts.headers),
    };
    if session.send(&start).await.is_err() {
        state.pending_requests.remove(&request_id);
        return (StatusCode::BAD_GATEWAY, "Tunnel client disconnected").into_response();
    }

    // Stream the request body independently so the response can start
    // before the body finishes uploading
    let body_session = session.clone();
    let body_request_id = request_id.clone();
    tokio::spawn(async move {
        pump_request_body(body, body_session, body_request_id).await;
    });

    // Park on the response signal
    let first = tokio::time::timeout(state.config.request_timeout(), response_rx.recv()).await;
    let event = match first {
        Err(_) => {
            state.pending_requests.remove(&request_id);
            return (StatusCode::GATEWAY_TIMEOUT, "Gateway timeout").into_response();
        }
        Ok(None) => {
            state.pending_requests.remove(&request_id);
            return (StatusCode::BAD_GATEWAY, "Tunnel disconnected").into_response();
        }
        Ok(Some(event)) => event,
    };

    match event {
        ResponseEvent::Start {
            status,
            headers: response_headers,
        } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut builder = Response::builder().status(status);
            for (name, values) in &response_headers {
                for value in values {
                    builder = builder.header(name.as_str(), value.as_str());
                }
            }

            let body_stream = async_stream::stream! {
                while let Some(event) = response_rx.recv().await {
                    match event {
                        ResponseEvent::Chunk(data) => {
                            yield Ok::<_, std::io::Error>(data);
                        }
                        ResponseEvent::End => break,
                        ResponseEvent::Failed { status, message } => {
                            tracing::debug!(
                                "Response stream failed mid-flight: {} {}",
                                status,
                                message
                            );
                            break;
                        }
                        ResponseEvent::Start { .. } => {}
                    }
                }
            };

            builder
                .body(Body::from_stream(body_stream))
                .unwrap_or_else(|_| {
                    (StatusCode::INTERNAL_SERVER_ERROR, "Response build failed").into_response()
                })
        }

        ResponseEvent::Failed { status, message } => {
            state.pending_requests.remove(&request_id);
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, message).into_response()
        }

        ResponseEvent::Chunk(_) | ResponseEvent::End => {
            state.pending_requests.remove(&request_id);
            tracing::warn!("Body chunk before headers for request {}", request_id);
            (StatusCode::BAD_GATEWAY, "Protocol error").into_response()
        }
    }
}

/// Forward the request body in bounded chunks, always terminating with an
/// empty final chunk - the client needs the terminator even on GET.
async fn pump_request_body(body: Body, session: Arc<ControlSession>, request_id: String) {
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!("Request body read failed for {}: {}", request_id, e);
                break;
            }
        };
        for piece in chunk.chunks(constants::CHUNK_SIZE) {
            let frame = ProtocolMessage::RequestBody {
                request_id: request_id.clone(),
                chunk: piece.to_vec(),
                is_final: false,
            };
            if session.send(&frame).await.is_err() {
                return;
            }
        }
    }

    let terminator = ProtocolMessage::RequestBody {
        request_id,
        chunk: Vec::new(),
        is_final: true,
    };
    let _ = session.send(&terminator).await;
}

/// Constant-time check of `Authorization: Basic ...` against the
/// tunnel's configured `user:pass`.
fn basic_auth_matches(request_headers: &HeaderMap, expected: &str) -> bool {
    let expected_token = base64::engine::general_purpose::STANDARD.encode(expected);
    request_headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .map(|token| constant_time_eq(token.as_bytes(), expected_token.as_bytes()))
        .unwrap_or(false)
}

fn is_websocket_upgrade_request(request_headers: &HeaderMap) -> bool {
    let has_upgrade_connection = request_headers
        .get(header::CONNECTION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_websocket_upgrade = request_headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    has_upgrade_connection && has_websocket_upgrade
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::{HeaderName, HeaderValue};

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                name.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_basic_auth_matches() {
        // base64("user:pass") == dXNlcjpwYXNz
        let ok = headers_with(&[("authorization", "Basic dXNlcjpwYXNz")]);
        assert!(basic_auth_matches(&ok, "user:pass"));

        let wrong = headers_with(&[("authorization", "Basic dXNlcjpvb3Bz")]);
        assert!(!basic_auth_matches(&wrong, "user:pass"));

        let missing = headers_with(&[]);
        assert!(!basic_auth_matches(&missing, "user:pass"));

        let bearer = headers_with(&[("authorization", "Bearer dXNlcjpwYXNz")]);
        assert!(!basic_auth_matches(&bearer, "user:pass"));
    }

    #[test]
    fn test_websocket_upgrade_detection() {
        let ws = headers_with(&[("connection", "keep-alive, Upgrade"), ("upgrade", "websocket")]);
        assert!(is_websocket_upgrade_request(&ws));

        let plain = headers_with(&[("connection", "keep-alive")]);
        assert!(!is_websocket_upgrade_request(&plain));

        let other_upgrade = headers_with(&[("connection", "Upgrade"), ("upgrade", "h2c")]);
        assert!(!is_websocket_upgrade_request(&other_upgrade));
    }
}
