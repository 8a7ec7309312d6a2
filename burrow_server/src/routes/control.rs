//! Control-plane dispatcher
//!
//! One WebSocket per tunnel client at the control path. The read loop
//! decodes frames, walks the session through auth and tunnel
//! registration, and feeds response/WebSocket traffic into the pending
//! stores. Teardown releases everything the session owned before the
//! session record is dropped.

use crate::limiter::defaults;
use crate::registry::Tunnel;
use crate::routes::AppState;
use crate::sessions::ControlSession;
use axum::{
    body::Body,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::FromRequestParts,
    http::{header, Request, Response, StatusCode},
    response::IntoResponse,
};
use burrow_common::{headers, ProtocolMessage, SessionLimits};
use chrono::Utc;
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Accept a control-plane connection, gated by the per-peer bucket.
pub async fn handle_control_upgrade(
    state: AppState,
    addr: SocketAddr,
    request: Request<Body>,
) -> Response<Body> {
    if !state.limits.connections.allow(&addr.ip().to_string()) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, "1")],
            "Connection rate limit exceeded",
        )
            .into_response();
    }

    let (mut parts, _body) = request.into_parts();
    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sink, mut receiver) = socket.split();
    let (session, mut shutdown_rx) = ControlSession::new(sink);
    state.connections.add(session.clone());
    tracing::debug!("Control session {} connected", session.id);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,

            msg = receiver.next() => {
                let Some(msg) = msg else { break };
                let data = match msg {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                        // Transport-level keepalive also counts as activity
                        session.touch();
                        continue;
                    }
                    Ok(Message::Text(_)) => continue,
                    Ok(Message::Close(_)) | Err(_) => break,
                };

                session.touch();

                let message = match ProtocolMessage::from_bytes(&data) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(
                            "Malformed control frame from session {}: {}",
                            session.id,
                            e
                        );
                        break;
                    }
                };

                if !handle_message(&state, &session, message).await {
                    break;
                }
            }
        }
    }

    teardown(&state, &session).await;
}

/// Dispatch one decoded control frame. Returns false to close the
/// transport.
async fn handle_message(
    state: &AppState,
    session: &Arc<ControlSession>,
    message: ProtocolMessage,
) -> bool {
    // Auth and keepalives are always allowed; anything else needs an
    // authenticated session first.
    match &message {
        ProtocolMessage::Auth { .. }
        | ProtocolMessage::Ping { .. }
        | ProtocolMessage::Pong { .. } => {}
        _ => {
            if !session.is_authenticated() {
                if state.config.auth_required {
                    let _ = session
                        .send(&ProtocolMessage::AuthError {
                            reason: "Authentication required".to_string(),
                        })
                        .await;
                    return false;
                }
                // Auth disabled: first frame authenticates implicitly
                session.mark_authenticated(None);
            }
        }
    }

    match message {
        ProtocolMessage::Auth { api_key } => {
            if state.config.auth_required && !state.authenticator.validate(&api_key) {
                tracing::info!("Rejected credential on session {}", session.id);
                let _ = session
                    .send(&ProtocolMessage::AuthError {
                        reason: "Invalid API key".to_string(),
                    })
                    .await;
                return false;
            }
            let account_id = state.authenticator.account_id_for(&api_key);
            session.mark_authenticated(Some(account_id.clone()));
            session
                .send(&ProtocolMessage::AuthOk {
                    account_id,
                    limits: SessionLimits {
                        max_tunnels: defaults::TUNNELS_MAX,
                        requests_per_second: defaults::REQUESTS_RATE as u32,
                    },
                })
                .await
                .is_ok()
        }

        ProtocolMessage::TunnelOpen {
            subdomain,
            protocol,
            basic_auth,
        } => {
            if !state.limits.tunnels.allow(&session.id.to_string()) {
                // Empty tunnel_id: nothing was actually created
                let _ = session
                    .send(&ProtocolMessage::TunnelClose {
                        tunnel_id: String::new(),
                        reason: "Rate limit exceeded".to_string(),
                    })
                    .await;
                return true;
            }

            let label = match subdomain {
                Some(requested) => state.registry.validate(&requested),
                None => state.registry.generate_subdomain(),
            };
            let label = match label {
                Ok(label) => label,
                Err(e) => {
                    let _ = session
                        .send(&ProtocolMessage::TunnelClose {
                            tunnel_id: String::new(),
                            reason: e.to_string(),
                        })
                        .await;
                    return true;
                }
            };

            let tunnel = Tunnel::new(label, session.id, basic_auth, protocol);
            match state.registry.register(tunnel) {
                Ok(tunnel) => {
                    let url = state.config.public_url(&tunnel.subdomain);
                    tracing::info!(
                        "Tunnel established: {} ({}, session {})",
                        url,
                        tunnel.protocol.as_str(),
                        session.id
                    );
                    session
                        .send(&ProtocolMessage::TunnelReady {
                            tunnel_id: tunnel.id.clone(),
                            subdomain: tunnel.subdomain.clone(),
                            url,
                        })
                        .await
                        .is_ok()
                }
                Err(e) => {
                    let _ = session
                        .send(&ProtocolMessage::TunnelClose {
                            tunnel_id: String::new(),
                            reason: e.to_string(),
                        })
                        .await;
                    true
                }
            }
        }

        ProtocolMessage::TunnelClose { tunnel_id, .. } => {
            // Only the owning session may tear a tunnel down
            if let Some(tunnel) = state.registry.find_by_id(&tunnel_id) {
                if tunnel.session_id == session.id {
                    release_tunnel(state, &tunnel_id).await;
                    tracing::info!("Tunnel {} closed by client", tunnel.subdomain);
                } else {
                    tracing::warn!(
                        "Session {} tried to close foreign tunnel {}",
                        session.id,
                        tunnel_id
                    );
                }
            }
            true
        }

        ProtocolMessage::ResponseStart {
            request_id,
            status,
            headers,
        } => {
            // Unknown ids are late responses after a timeout: drop
            if let Some(entry) = state.pending_requests.get(&request_id) {
                entry.mark_started();
                let _ = entry
                    .deliver(crate::pending::ResponseEvent::Start { status, headers })
                    .await;
            }
            true
        }

        ProtocolMessage::ResponseBody { request_id, chunk } => {
            if let Some(entry) = state.pending_requests.get(&request_id) {
                let _ = entry
                    .deliver(crate::pending::ResponseEvent::Chunk(chunk.into()))
                    .await;
            }
            true
        }

        ProtocolMessage::ResponseEnd { request_id } => {
            if let Some(entry) = state.pending_requests.remove(&request_id) {
                let _ = entry.deliver(crate::pending::ResponseEvent::End).await;
            }
            true
        }

        ProtocolMessage::WebSocketUpgradeOk {
            request_id,
            headers: upgrade_headers,
        } => {
            let upgrade_headers = headers::strip_hop_by_hop(upgrade_headers);
            state
                .pending_sockets
                .confirm_upgrade(&request_id, upgrade_headers);
            true
        }

        ProtocolMessage::WebSocketUpgradeError {
            request_id,
            status,
            message,
        } => {
            state.pending_sockets.fail_upgrade(&request_id, status, message);
            true
        }

        ProtocolMessage::WebSocketFrame {
            request_id,
            opcode,
            payload,
        } => {
            state.pending_sockets.frame(&request_id, opcode, payload).await;
            true
        }

        ProtocolMessage::WebSocketClose { request_id, code } => {
            state.pending_sockets.close(&request_id, code).await;
            true
        }

        ProtocolMessage::Ping { timestamp } => session
            .send(&ProtocolMessage::Pong { timestamp })
            .await
            .is_ok(),

        ProtocolMessage::Pong { .. } => true,

        other => {
            tracing::debug!(
                "Unexpected frame {:?} from session {}",
                discriminator(&other),
                session.id
            );
            true
        }
    }
}

/// Unregister one tunnel and fail everything waiting on it.
async fn release_tunnel(state: &AppState, tunnel_id: &str) {
    state.registry.unregister(tunnel_id);
    state.pending_requests.remove_by_tunnel(tunnel_id).await;
    state.pending_sockets.remove_by_tunnel(tunnel_id).await;
    state.limits.requests.reset(tunnel_id);
}

/// Transport gone: release the session's tunnels and waiters, reset its
/// buckets, then drop the session record.
async fn teardown(state: &AppState, session: &Arc<ControlSession>) {
    let removed = state.registry.unregister_session(session.id);
    for tunnel in &removed {
        state.pending_requests.remove_by_tunnel(&tunnel.id).await;
        state.pending_sockets.remove_by_tunnel(&tunnel.id).await;
        state.limits.requests.reset(&tunnel.id);
    }
    state.limits.tunnels.reset(&session.id.to_string());
    state.connections.remove(session.id);

    tracing::info!(
        "Control session {} closed ({} tunnels released, {}s old)",
        session.id,
        removed.len(),
        (Utc::now() - session.created_at).num_seconds()
    );
}

fn discriminator(message: &ProtocolMessage) -> &'static str {
    match message {
        ProtocolMessage::Auth { .. } => "Auth",
        ProtocolMessage::AuthOk { .. } => "AuthOk",
        ProtocolMessage::AuthError { .. } => "AuthError",
        ProtocolMessage::TunnelOpen { .. } => "TunnelOpen",
        ProtocolMessage::TunnelReady { .. } => "TunnelReady",
        ProtocolMessage::TunnelClose { .. } => "TunnelClose",
        ProtocolMessage::RequestStart { .. } => "RequestStart",
        ProtocolMessage::RequestBody { .. } => "RequestBody",
        ProtocolMessage::ResponseStart { .. } => "ResponseStart",
        ProtocolMessage::ResponseBody { .. } => "ResponseBody",
        ProtocolMessage::ResponseEnd { .. } => "ResponseEnd",
        ProtocolMessage::Ping { .. } => "Ping",
        ProtocolMessage::Pong { .. } => "Pong",
        ProtocolMessage::WebSocketUpgrade { .. } => "WebSocketUpgrade",
        ProtocolMessage::WebSocketUpgradeOk { .. } => "WebSocketUpgradeOk",
        ProtocolMessage::WebSocketUpgradeError { .. } => "WebSocketUpgradeError",
        ProtocolMessage::WebSocketFrame { .. } => "WebSocketFrame",
        ProtocolMessage::WebSocketClose { .. } => "WebSocketClose",
    }
}
