//! WebSocket ingress frame loop
//!
//! Bridges an externally-terminated WebSocket to the logical frame stream
//! inside the control channel. The 101 is only written after the tunnel
//! client confirms the local upgrade, so a refused upgrade surfaces as a
//! plain HTTP error; once upgraded, the handler stays parked on the frame
//! loop until either side closes.

use crate::pending::{UpgradeOutcome, WsEvent};
use crate::registry::Tunnel;
use crate::routes::AppState;
use crate::sessions::ControlSession;
use axum::{
    body::Body,
    extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    extract::FromRequestParts,
    http::{Request, Response, StatusCode},
    response::IntoResponse,
};
use burrow_common::{headers, new_request_id, opcode, ProtocolMessage};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;

/// Handle a qualifying upgrade request on a tunnel subdomain.
pub async fn handle_ws_ingress(
    state: AppState,
    tunnel: Arc<Tunnel>,
    session: Arc<ControlSession>,
    request: Request<Body>,
) -> Response<Body> {
    let (mut parts, _body) = request.into_parts();

    let requested_protocol = parts
        .headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());

    // Validates Sec-WebSocket-Key and version 13; rejection renders 400
    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(ws) => ws,
        Err(rejection) => {
            tracing::debug!("WebSocket upgrade rejected: {}", rejection);
            return rejection.into_response();
        }
    };

    let request_id = new_request_id();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    tracing::debug!("WS upgrade {} -> tunnel {}", path, tunnel.id);

    let (_entry, confirm_rx, events_rx) = state
        .pending_sockets
        .add(request_id.clone(), tunnel.id.clone());

    let upgrade = ProtocolMessage::WebSocketUpgrade {
        request_id: request_id.clone(),
        tunnel_id: tunnel.id.clone(),
        path,
        headers: headers::to_header_list(&parts.headers),
    };
    if session.send(&upgrade).await.is_err() {
        state.pending_sockets.remove(&request_id);
        return (StatusCode::BAD_GATEWAY, "Tunnel client disconnected").into_response();
    }

    // Park until the tunnel client reports the local upgrade result
    let outcome =
        tokio::time::timeout(state.config.request_timeout(), confirm_rx).await;
    let outcome = match outcome {
        Err(_) => {
            state.pending_sockets.remove(&request_id);
            return (StatusCode::GATEWAY_TIMEOUT, "Upgrade timed out").into_response();
        }
        Ok(Err(_)) => {
            state.pending_sockets.remove(&request_id);
            return (StatusCode::BAD_GATEWAY, "Tunnel disconnected").into_response();
        }
        Ok(Ok(outcome)) => outcome,
    };

    match outcome {
        UpgradeOutcome::Rejected { status, message } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, message).into_response()
        }
        UpgradeOutcome::Accepted {
            headers: upstream_headers,
        } => {
            // Prefer the protocol the upstream actually selected
            let protocol = upstream_headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("sec-websocket-protocol"))
                .and_then(|(_, values)| values.first().cloned())
                .or(requested_protocol);

            let mut ws = ws;
            if let Some(protocol) = protocol {
                ws = ws.protocols([protocol]);
            }

            ws.on_upgrade(move |socket| async move {
                frame_loop(socket, state, session, request_id, events_rx).await;
            })
        }
    }
}

/// The server-side frame loop over the upgraded stream. Inbound frames
/// become control messages; control messages from the tunnel client
/// materialize as frames to the external peer.
async fn frame_loop(
    socket: WebSocket,
    state: AppState,
    session: Arc<ControlSession>,
    request_id: String,
    mut events_rx: tokio::sync::mpsc::Receiver<WsEvent>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let mut to_peer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                WsEvent::Frame { opcode: op, payload } => {
                    let message = match op {
                        opcode::TEXT => match String::from_utf8(payload) {
                            Ok(text) => Message::Text(text.into()),
                            Err(e) => {
                                tracing::warn!("Invalid UTF-8 text frame: {}", e);
                                continue;
                            }
                        },
                        opcode::BINARY => Message::Binary(payload.into()),
                        opcode::PING => Message::Ping(payload.into()),
                        opcode::PONG => Message::Pong(payload.into()),
                        opcode::CLOSE => {
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                        // Continuations arrive pre-coalesced; nothing to write
                        _ => continue,
                    };
                    if ws_sender.send(message).await.is_err() {
                        break;
                    }
                }
                WsEvent::Close { code } => {
                    let frame = code.map(|code| CloseFrame {
                        code,
                        reason: "".into(),
                    });
                    let _ = ws_sender.send(Message::Close(frame)).await;
                    break;
                }
            }
        }
    });

    let tunnel_session = session.clone();
    let tunnel_request_id = request_id.clone();
    let mut to_tunnel = tokio::spawn(async move {
        let mut sent_close = false;
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let frame = ProtocolMessage::WebSocketFrame {
                        request_id: tunnel_request_id.clone(),
                        opcode: opcode::TEXT,
                        payload: text.as_bytes().to_vec(),
                    };
                    if tunnel_session.send(&frame).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Binary(data)) => {
                    let frame = ProtocolMessage::WebSocketFrame {
                        request_id: tunnel_request_id.clone(),
                        opcode: opcode::BINARY,
                        payload: data.to_vec(),
                    };
                    if tunnel_session.send(&frame).await.is_err() {
                        break;
                    }
                }
                // The WS layer answers pings on its own
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(Message::Close(frame)) => {
                    let close = ProtocolMessage::WebSocketClose {
                        request_id: tunnel_request_id.clone(),
                        code: frame.map(|f| f.code),
                    };
                    let _ = tunnel_session.send(&close).await;
                    sent_close = true;
                    break;
                }
                Err(e) => {
                    tracing::debug!("WebSocket receive error: {}", e);
                    let close = ProtocolMessage::WebSocketClose {
                        request_id: tunnel_request_id.clone(),
                        code: None,
                    };
                    let _ = tunnel_session.send(&close).await;
                    sent_close = true;
                    break;
                }
            }
        }

        if !sent_close {
            let close = ProtocolMessage::WebSocketClose {
                request_id: tunnel_request_id,
                code: None,
            };
            let _ = tunnel_session.send(&close).await;
        }
    });

    tokio::select! {
        _ = &mut to_peer => {
            to_tunnel.abort();
            // The tunnel side initiated this close; tell it the external
            // peer is gone too so both ends converge
            let close = ProtocolMessage::WebSocketClose {
                request_id: request_id.clone(),
                code: None,
            };
            let _ = session.send(&close).await;
        }
        _ = &mut to_tunnel => {
            to_peer.abort();
        }
    }

    state.pending_sockets.remove(&request_id);
}
