//! WebSocket tunnel client
//!
//! Connects out to the server's control endpoint, opens the configured
//! tunnels, then serves proxied HTTP exchanges and WebSocket streams
//! against local upstreams. Transport loss triggers linear-backoff
//! reconnection; a rejected credential ends the run for good.

use crate::inspector::{ExchangeRecord, InspectorStore};
use crate::tunnel::router::PathRouter;
use anyhow::{bail, Context, Result};
use burrow_common::{
    constants, headers, opcode, HeaderList, ProtocolMessage, TunnelProtocol,
};
use chrono::Utc;
use console::style;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};

const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type WsWrite = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, tungstenite::Message>;

/// One tunnel to expose, with its local routing table.
#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub subdomain: Option<String>,
    pub basic_auth: Option<String>,
    pub router: PathRouter,
}

/// Events pushed into an active local WebSocket proxy.
#[derive(Debug)]
enum PeerEvent {
    Frame { opcode: u8, payload: Vec<u8> },
    Close { code: Option<u16> },
}

type WsStreams = Arc<Mutex<HashMap<String, mpsc::Sender<PeerEvent>>>>;

enum SessionEnd {
    /// Transport lost after a working handshake
    Lost,
    /// Never got connected
    ConnectFailed(anyhow::Error),
}

pub struct TunnelClient {
    ws_url: String,
    api_key: Option<String>,
    tunnels: Arc<Vec<TunnelSpec>>,
    open_browser: bool,
    inspector: Option<Arc<InspectorStore>>,
}

impl TunnelClient {
    pub fn new(ws_url: String, api_key: Option<String>, tunnels: Vec<TunnelSpec>) -> Self {
        Self {
            ws_url,
            api_key,
            tunnels: Arc::new(tunnels),
            open_browser: false,
            inspector: None,
        }
    }

    pub fn set_open_browser(&mut self, open: bool) {
        self.open_browser = open;
    }

    pub fn set_inspector(&mut self, store: Arc<InspectorStore>) {
        self.inspector = Some(store);
    }

    /// Run until a fatal error. Reconnects on transport loss with linear
    /// backoff, giving up after ten consecutive failures; a rejected
    /// credential or refused tunnel never reconnects.
    pub async fn run(&self) -> Result<()> {
        let mut attempts: u32 = 0;
        let mut first = true;

        loop {
            match self.run_session(first).await? {
                SessionEnd::Lost => {
                    attempts = 0;
                    println!(
                        "{}  {}",
                        style("◇").yellow(),
                        style("Connection lost").dim()
                    );
                }
                SessionEnd::ConnectFailed(e) => {
                    tracing::debug!("Connect failed: {:#}", e);
                }
            }
            first = false;

            attempts += 1;
            if attempts >= MAX_RECONNECT_ATTEMPTS {
                bail!("Giving up after {} failed connection attempts", attempts);
            }
            let delay = Duration::from_secs((3 * u64::from(attempts)).min(30));
            println!(
                "{}  {}",
                style("◇").yellow(),
                style(format!(
                    "Reconnecting in {}s (attempt {}/{})",
                    delay.as_secs(),
                    attempts,
                    MAX_RECONNECT_ATTEMPTS
                ))
                .dim()
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One connection lifetime. Fatal conditions return `Err`.
    async fn run_session(&self, first: bool) -> Result<SessionEnd> {
        let (ws_stream, _) = match connect_async(&self.ws_url).await {
            Ok(conn) => conn,
            Err(e) => return Ok(SessionEnd::ConnectFailed(e.into())),
        };
        let (sink, mut read) = ws_stream.split();

        // All outbound frames funnel through one writer task so concurrent
        // request tasks never interleave partial writes
        let (out_tx, out_rx) = mpsc::channel::<ProtocolMessage>(256);
        let writer = tokio::spawn(run_writer(sink, out_rx));

        let handshake = self.handshake(&out_tx, &mut read, first).await;
        let ready = match handshake {
            Ok(ready) => ready,
            Err(e) => {
                writer.abort();
                return Err(e);
            }
        };

        let outcome = self.serve(&out_tx, &mut read, ready).await;
        writer.abort();
        outcome
    }

    /// Authenticate (when a key is configured) and open every tunnel.
    /// Returns `tunnel_id -> spec index`.
    async fn handshake(
        &self,
        out_tx: &mpsc::Sender<ProtocolMessage>,
        read: &mut WsRead,
        first: bool,
    ) -> Result<HashMap<String, usize>> {
        if let Some(api_key) = &self.api_key {
            send(out_tx, ProtocolMessage::Auth {
                api_key: api_key.clone(),
            })
            .await?;

            loop {
                match next_frame(read, out_tx).await? {
                    ProtocolMessage::AuthOk { account_id, .. } => {
                        tracing::debug!("Authenticated as {}", account_id);
                        break;
                    }
                    ProtocolMessage::AuthError { reason } => {
                        bail!("Authentication failed: {}", reason);
                    }
                    other => {
                        tracing::debug!("Ignoring frame during auth: {:?}", other);
                    }
                }
            }
        }

        let mut ready = HashMap::new();
        for (index, spec) in self.tunnels.iter().enumerate() {
            send(out_tx, ProtocolMessage::TunnelOpen {
                subdomain: spec.subdomain.clone(),
                protocol: TunnelProtocol::Http,
                basic_auth: spec.basic_auth.clone(),
            })
            .await?;

            loop {
                match next_frame(read, out_tx).await? {
                    ProtocolMessage::TunnelReady {
                        tunnel_id,
                        subdomain,
                        url,
                    } => {
                        let (host, port) = spec.router.target("/");
                        let target = format!("http://{}:{}", host, port);
                        let info = format!(
                            "{} {}\n{} {}",
                            style("Public URL:").dim(),
                            style(&url).green().bold(),
                            style("Forwarding:").dim(),
                            style(&target).cyan(),
                        );
                        let _ = cliclack::note(format!("Tunnel {}", subdomain), info);

                        if self.open_browser && first {
                            let _ = open::that(&url);
                        }
                        ready.insert(tunnel_id, index);
                        break;
                    }
                    ProtocolMessage::TunnelClose { reason, .. } => {
                        bail!("Tunnel rejected: {}", reason);
                    }
                    ProtocolMessage::AuthError { reason } => {
                        bail!("Authentication failed: {}", reason);
                    }
                    other => {
                        tracing::debug!("Ignoring frame during open: {:?}", other);
                    }
                }
            }
        }

        println!();
        println!(
            "{}  {}",
            style("◆").green(),
            style("Waiting for requests... (Ctrl+C to stop)").dim()
        );
        println!();
        Ok(ready)
    }

    /// The serving loop: buffer request bodies, spawn forwarders, pump
    /// WebSocket streams, answer heartbeats.
    async fn serve(
        &self,
        out_tx: &mpsc::Sender<ProtocolMessage>,
        read: &mut WsRead,
        ready: HashMap<String, usize>,
    ) -> Result<SessionEnd> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        // request_id -> partially buffered inbound request
        let mut inflight: HashMap<String, InflightRequest> = HashMap::new();
        // request_id -> live local WebSocket proxy
        let ws_streams: WsStreams = Arc::new(Mutex::new(HashMap::new()));

        let mut ping_interval =
            tokio::time::interval(Duration::from_secs(constants::HEARTBEAT_INTERVAL_SECS));
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_interval.reset();

        loop {
            tokio::select! {
                _ = ping_interval.tick() => {
                    let ping = ProtocolMessage::Ping {
                        timestamp: Utc::now().timestamp_millis() as u64,
                    };
                    if out_tx.send(ping).await.is_err() {
                        return Ok(SessionEnd::Lost);
                    }
                }

                msg = read.next() => {
                    let msg = match msg {
                        Some(Ok(tungstenite::Message::Binary(data))) => data,
                        Some(Ok(tungstenite::Message::Ping(_)))
                        | Some(Ok(tungstenite::Message::Pong(_))) => continue,
                        Some(Ok(tungstenite::Message::Close(_))) | None => {
                            return Ok(SessionEnd::Lost);
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            tracing::debug!("Control stream error: {}", e);
                            return Ok(SessionEnd::Lost);
                        }
                    };

                    let message = match ProtocolMessage::from_bytes(&msg) {
                        Ok(m) => m,
                        Err(e) => {
                            tracing::warn!("Malformed frame from server: {}", e);
                            return Ok(SessionEnd::Lost);
                        }
                    };

                    self.dispatch(
                        message,
                        &http_client,
                        out_tx,
                        &ready,
                        &mut inflight,
                        &ws_streams,
                    )
                    .await;
                }
            }
        }
    }

    async fn dispatch(
        &self,
        message: ProtocolMessage,
        http_client: &reqwest::Client,
        out_tx: &mpsc::Sender<ProtocolMessage>,
        ready: &HashMap<String, usize>,
        inflight: &mut HashMap<String, InflightRequest>,
        ws_streams: &WsStreams,
    ) {
        match message {
            ProtocolMessage::RequestStart {
                request_id,
                tunnel_id,
                method,
                path,
                headers,
            } => {
                let Some(&index) = ready.get(&tunnel_id) else {
                    tracing::warn!("Request for unknown tunnel {}", tunnel_id);
                    return;
                };
                inflight.insert(
                    request_id,
                    InflightRequest {
                        spec_index: index,
                        method,
                        path,
                        headers,
                        body: Vec::new(),
                    },
                );
            }

            ProtocolMessage::RequestBody {
                request_id,
                chunk,
                is_final,
            } => {
                let Some(entry) = inflight.get_mut(&request_id) else {
                    return;
                };
                entry.body.extend_from_slice(&chunk);
                if is_final {
                    let Some(request) = inflight.remove(&request_id) else {
                        return;
                    };
                    let spec = self.tunnels[request.spec_index].clone();
                    let client = http_client.clone();
                    let out_tx = out_tx.clone();
                    let inspector = self.inspector.clone();
                    tokio::spawn(async move {
                        forward_request(client, spec, out_tx, request_id, request, inspector)
                            .await;
                    });
                }
            }

            ProtocolMessage::WebSocketUpgrade {
                request_id,
                tunnel_id,
                path,
                headers,
            } => {
                let Some(&index) = ready.get(&tunnel_id) else {
                    let _ = out_tx
                        .send(ProtocolMessage::WebSocketUpgradeError {
                            request_id,
                            status: 502,
                            message: "Unknown tunnel".to_string(),
                        })
                        .await;
                    return;
                };
                let spec = self.tunnels[index].clone();
                let out_tx = out_tx.clone();
                let ws_streams = ws_streams.clone();
                tokio::spawn(async move {
                    proxy_websocket(spec, out_tx, request_id, path, headers, ws_streams).await;
                });
            }

            ProtocolMessage::WebSocketFrame {
                request_id,
                opcode,
                payload,
            } => {
                let sender = ws_streams.lock().unwrap().get(&request_id).cloned();
                if let Some(sender) = sender {
                    let _ = sender.send(PeerEvent::Frame { opcode, payload }).await;
                }
            }

            ProtocolMessage::WebSocketClose { request_id, code } => {
                let sender = ws_streams.lock().unwrap().remove(&request_id);
                if let Some(sender) = sender {
                    let _ = sender.send(PeerEvent::Close { code }).await;
                }
            }

            ProtocolMessage::Ping { timestamp } => {
                let _ = out_tx.send(ProtocolMessage::Pong { timestamp }).await;
            }

            ProtocolMessage::Pong { .. } => {}

            ProtocolMessage::TunnelClose { tunnel_id, reason } => {
                tracing::warn!("Server closed tunnel {}: {}", tunnel_id, reason);
            }

            other => {
                tracing::debug!("Unexpected frame: {:?}", other);
            }
        }
    }
}

#[derive(Debug)]
struct InflightRequest {
    spec_index: usize,
    method: String,
    path: String,
    headers: HeaderList,
    body: Vec<u8>,
}

async fn run_writer(mut sink: WsWrite, mut out_rx: mpsc::Receiver<ProtocolMessage>) {
    while let Some(message) = out_rx.recv().await {
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Failed to encode frame: {}", e);
                continue;
            }
        };
        if sink
            .send(tungstenite::Message::Binary(bytes.into()))
            .await
            .is_err()
        {
            break;
        }
    }
}

async fn send(out_tx: &mpsc::Sender<ProtocolMessage>, message: ProtocolMessage) -> Result<()> {
    out_tx
        .send(message)
        .await
        .map_err(|_| anyhow::anyhow!("Control connection closed"))
}

/// Read the next decoded control frame during the handshake, answering
/// heartbeats inline.
async fn next_frame(
    read: &mut WsRead,
    out_tx: &mpsc::Sender<ProtocolMessage>,
) -> Result<ProtocolMessage> {
    loop {
        let msg = tokio::time::timeout(HANDSHAKE_TIMEOUT, read.next())
            .await
            .context("Timeout waiting for server response")?
            .ok_or_else(|| anyhow::anyhow!("Connection closed before response"))?
            .context("Control stream error")?;

        match msg {
            tungstenite::Message::Binary(data) => {
                let message = ProtocolMessage::from_bytes(&data)
                    .context("Malformed frame from server")?;
                if let ProtocolMessage::Ping { timestamp } = message {
                    send(out_tx, ProtocolMessage::Pong { timestamp }).await?;
                    continue;
                }
                return Ok(message);
            }
            tungstenite::Message::Close(_) => {
                bail!("Server closed the connection");
            }
            _ => continue,
        }
    }
}

/// Forward one buffered request to the routed local upstream and stream
/// the response back in bounded chunks.
async fn forward_request(
    client: reqwest::Client,
    spec: TunnelSpec,
    out_tx: mpsc::Sender<ProtocolMessage>,
    request_id: String,
    request: InflightRequest,
    inspector: Option<Arc<InspectorStore>>,
) {
    let start_time = Instant::now();
    let (host, port) = spec.router.target(&request.path);
    let url = format!("http://{}:{}{}", host, port, request.path);

    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let mut builder = client.request(method, &url);

    // Hop-by-hop headers stop here; the origin gets end-to-end headers
    // only. Host is rebuilt from the target URL.
    for (name, values) in &request.headers {
        if headers::is_hop_by_hop(name) || name.eq_ignore_ascii_case("host") {
            continue;
        }
        for value in values {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }

    if !request.body.is_empty() {
        builder = builder.body(request.body);
    }

    match builder.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let response_headers =
                headers::strip_hop_by_hop(headers::to_header_list(response.headers()));

            if out_tx
                .send(ProtocolMessage::ResponseStart {
                    request_id: request_id.clone(),
                    status,
                    headers: response_headers,
                })
                .await
                .is_err()
            {
                return;
            }

            let mut total = 0usize;
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::debug!("Upstream body read failed: {}", e);
                        break;
                    }
                };
                total += chunk.len();
                for piece in chunk.chunks(constants::CHUNK_SIZE) {
                    let frame = ProtocolMessage::ResponseBody {
                        request_id: request_id.clone(),
                        chunk: piece.to_vec(),
                    };
                    if out_tx.send(frame).await.is_err() {
                        return;
                    }
                }
            }

            let _ = out_tx
                .send(ProtocolMessage::ResponseEnd {
                    request_id: request_id.clone(),
                })
                .await;

            let elapsed = start_time.elapsed();
            log_request(&request.method, &request.path, status, elapsed, total);
            if let Some(inspector) = inspector {
                inspector.record(ExchangeRecord {
                    at: Utc::now(),
                    method: request.method,
                    path: request.path,
                    status,
                    duration_ms: elapsed.as_millis(),
                    bytes: total,
                });
            }
        }
        Err(e) => {
            tracing::debug!("Local connect failed for {}: {}", url, e);
            let body = format!("Bad Gateway: {}", e).into_bytes();
            let _ = out_tx
                .send(ProtocolMessage::ResponseStart {
                    request_id: request_id.clone(),
                    status: 502,
                    headers: vec![(
                        "content-type".to_string(),
                        vec!["text/plain".to_string()],
                    )],
                })
                .await;
            let _ = out_tx
                .send(ProtocolMessage::ResponseBody {
                    request_id: request_id.clone(),
                    chunk: body,
                })
                .await;
            let _ = out_tx
                .send(ProtocolMessage::ResponseEnd { request_id })
                .await;

            let elapsed = start_time.elapsed();
            log_request(&request.method, &request.path, 502, elapsed, 0);
        }
    }
}

/// Dial the routed local upstream as a WebSocket and pump frames both
/// ways until either side closes.
async fn proxy_websocket(
    spec: TunnelSpec,
    out_tx: mpsc::Sender<ProtocolMessage>,
    request_id: String,
    path: String,
    request_headers: HeaderList,
    ws_streams: WsStreams,
) {
    let (host, port) = spec.router.target(&path);
    let url = format!("ws://{}:{}{}", host, port, path);

    let mut upgrade_request = match url.clone().into_client_request() {
        Ok(request) => request,
        Err(e) => {
            let _ = out_tx
                .send(ProtocolMessage::WebSocketUpgradeError {
                    request_id,
                    status: 502,
                    message: e.to_string(),
                })
                .await;
            return;
        }
    };
    // Pass the caller's subprotocol offer through to the upstream
    if let Some((_, values)) = request_headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("sec-websocket-protocol"))
    {
        if let Some(value) = values.first() {
            if let Ok(value) = value.parse() {
                upgrade_request
                    .headers_mut()
                    .insert("sec-websocket-protocol", value);
            }
        }
    }

    let (local_ws, response) = match connect_async(upgrade_request).await {
        Ok(ok) => ok,
        Err(e) => {
            let (status, message) = match &e {
                tungstenite::Error::Http(response) => (
                    response.status().as_u16(),
                    "Local upstream refused the upgrade".to_string(),
                ),
                other => (502, other.to_string()),
            };
            tracing::debug!("WS upgrade to {} failed: {}", url, e);
            let _ = out_tx
                .send(ProtocolMessage::WebSocketUpgradeError {
                    request_id,
                    status,
                    message,
                })
                .await;
            return;
        }
    };

    let upgrade_headers =
        headers::strip_hop_by_hop(headers::to_header_list(response.headers()));
    if out_tx
        .send(ProtocolMessage::WebSocketUpgradeOk {
            request_id: request_id.clone(),
            headers: upgrade_headers,
        })
        .await
        .is_err()
    {
        return;
    }

    let (peer_tx, mut peer_rx) = mpsc::channel::<PeerEvent>(64);
    ws_streams
        .lock()
        .unwrap()
        .insert(request_id.clone(), peer_tx);

    let (mut local_write, mut local_read) = local_ws.split();

    // Server -> local upstream
    let mut to_local = tokio::spawn(async move {
        while let Some(event) = peer_rx.recv().await {
            match event {
                PeerEvent::Frame { opcode: op, payload } => {
                    let message = match op {
                        opcode::TEXT => match String::from_utf8(payload) {
                            Ok(text) => tungstenite::Message::Text(text.into()),
                            Err(e) => {
                                tracing::warn!("Invalid UTF-8 text frame: {}", e);
                                continue;
                            }
                        },
                        opcode::BINARY => tungstenite::Message::Binary(payload.into()),
                        opcode::PING => tungstenite::Message::Ping(payload.into()),
                        opcode::PONG => tungstenite::Message::Pong(payload.into()),
                        opcode::CLOSE => {
                            let _ = local_write.send(tungstenite::Message::Close(None)).await;
                            break;
                        }
                        // A final continuation means the message is
                        // already whole; nothing separate to write
                        _ => continue,
                    };
                    if local_write.send(message).await.is_err() {
                        break;
                    }
                }
                PeerEvent::Close { code } => {
                    let frame = code.map(|code| CloseFrame {
                        code: CloseCode::from(code),
                        reason: "".into(),
                    });
                    let _ = local_write.send(tungstenite::Message::Close(frame)).await;
                    break;
                }
            }
        }
    });

    // Local upstream -> server
    let out_for_local = out_tx.clone();
    let id_for_local = request_id.clone();
    let mut from_local = tokio::spawn(async move {
        let mut sent_close = false;
        while let Some(message) = local_read.next().await {
            match message {
                Ok(tungstenite::Message::Text(text)) => {
                    let frame = ProtocolMessage::WebSocketFrame {
                        request_id: id_for_local.clone(),
                        opcode: opcode::TEXT,
                        payload: text.as_bytes().to_vec(),
                    };
                    if out_for_local.send(frame).await.is_err() {
                        break;
                    }
                }
                Ok(tungstenite::Message::Binary(data)) => {
                    let frame = ProtocolMessage::WebSocketFrame {
                        request_id: id_for_local.clone(),
                        opcode: opcode::BINARY,
                        payload: data.to_vec(),
                    };
                    if out_for_local.send(frame).await.is_err() {
                        break;
                    }
                }
                Ok(tungstenite::Message::Ping(_)) | Ok(tungstenite::Message::Pong(_)) => {}
                Ok(tungstenite::Message::Close(frame)) => {
                    let close = ProtocolMessage::WebSocketClose {
                        request_id: id_for_local.clone(),
                        code: frame.map(|f| u16::from(f.code)),
                    };
                    let _ = out_for_local.send(close).await;
                    sent_close = true;
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("Local WebSocket error: {}", e);
                    let close = ProtocolMessage::WebSocketClose {
                        request_id: id_for_local.clone(),
                        code: None,
                    };
                    let _ = out_for_local.send(close).await;
                    sent_close = true;
                    break;
                }
            }
        }
        if !sent_close {
            let close = ProtocolMessage::WebSocketClose {
                request_id: id_for_local,
                code: None,
            };
            let _ = out_for_local.send(close).await;
        }
    });

    tokio::select! {
        _ = &mut to_local => { from_local.abort(); }
        _ = &mut from_local => { to_local.abort(); }
    }

    ws_streams.lock().unwrap().remove(&request_id);
}

/// Pretty print a request log line
fn log_request(method: &str, path: &str, status: u16, elapsed: Duration, body_size: usize) {
    let timestamp = style(chrono::Local::now().format("%H:%M:%S").to_string()).dim();

    let method_styled = match method {
        "GET" => style(format!("{:>7}", method)).green(),
        "POST" => style(format!("{:>7}", method)).yellow(),
        "PUT" => style(format!("{:>7}", method)).blue(),
        "PATCH" => style(format!("{:>7}", method)).magenta(),
        "DELETE" => style(format!("{:>7}", method)).red(),
        _ => style(format!("{:>7}", method)).white(),
    };

    let status_styled = if status >= 500 {
        style(status.to_string()).red().bold()
    } else if status >= 400 {
        style(status.to_string()).yellow()
    } else if status >= 300 {
        style(status.to_string()).cyan()
    } else {
        style(status.to_string()).green()
    };

    let elapsed_ms = elapsed.as_millis();
    let duration_styled = if elapsed_ms > 1000 {
        style(format!("{:>6}ms", elapsed_ms)).red()
    } else if elapsed_ms > 100 {
        style(format!("{:>6}ms", elapsed_ms)).white()
    } else {
        style(format!("{:>6}ms", elapsed_ms)).green()
    };

    let size_str = if body_size >= 1_000_000 {
        format!("{:.1}MB", body_size as f64 / 1_000_000.0)
    } else if body_size >= 1_000 {
        format!("{:.1}KB", body_size as f64 / 1_000.0)
    } else {
        format!("{}B", body_size)
    };

    let max_path_len = 50;
    let path_display = if path.len() > max_path_len {
        format!("{}...", &path[..max_path_len - 3])
    } else {
        path.to_string()
    };

    println!(
        "  {} {} {} {} {} {}",
        timestamp,
        method_styled,
        style(path_display).white(),
        status_styled,
        duration_styled,
        style(format!("{:>8}", size_str)).dim(),
    );
}
