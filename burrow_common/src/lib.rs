//! Burrow Common - shared control-plane protocol for the tunneling service
//!
//! This crate contains the message definitions and the frame codec used by
//! both the server and the CLI. The codec is pure: one encode call yields
//! one atomic transport message, and splitting large bodies into chunks is
//! the caller's job.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to encode frame: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] rmp_serde::decode::Error),
}

/// Ordered header representation: name -> values in received order.
///
/// Multi-valued headers (repeated `Set-Cookie`, `Accept`, ...) keep every
/// value, in order, end-to-end.
pub type HeaderList = Vec<(String, Vec<String>)>;

/// Tunnel transport kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProtocol {
    /// HTTP/HTTPS tunnel
    Http,

    /// Raw TCP tunnel - reserved, not served by the current control plane
    Tcp,
}

impl TunnelProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelProtocol::Http => "http",
            TunnelProtocol::Tcp => "tcp",
        }
    }
}

/// Budgets reported to an authenticated client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionLimits {
    /// Token-bucket capacity for tunnel creations on this session
    pub max_tunnels: u32,

    /// Sustained request rate per tunnel (tokens per second)
    pub requests_per_second: u32,
}

/// WebSocket frame opcodes carried in [`ProtocolMessage::WebSocketFrame`].
pub mod opcode {
    pub const CONTINUATION: u8 = 0x0;
    pub const TEXT: u8 = 0x1;
    pub const BINARY: u8 = 0x2;
    pub const CLOSE: u8 = 0x8;
    pub const PING: u8 = 0x9;
    pub const PONG: u8 = 0xA;
}

/// Control message - every frame on the control stream is one of these.
///
/// The wire form is a MessagePack map with string field names and a
/// `"type"` discriminator. Body chunks and WebSocket payloads are raw
/// byte strings (msgpack bin), not arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProtocolMessage {
    /// Client credential presentation, first frame when auth is required
    Auth { api_key: String },

    /// Server accepts the credential
    AuthOk {
        account_id: String,
        limits: SessionLimits,
    },

    /// Server rejects the credential and closes the transport.
    /// The client must not reconnect.
    AuthError { reason: String },

    /// Client asks for a tunnel. `subdomain: None` requests a generated
    /// label.
    TunnelOpen {
        subdomain: Option<String>,
        protocol: TunnelProtocol,
        /// Optional `user:pass` guarding the public side of the tunnel
        basic_auth: Option<String>,
    },

    /// Server registered the tunnel
    TunnelReady {
        tunnel_id: String,
        subdomain: String,
        url: String,
    },

    /// Tunnel teardown or open rejection. An empty `tunnel_id` means no
    /// tunnel was actually created.
    TunnelClose { tunnel_id: String, reason: String },

    /// Server -> client: an inbound HTTP exchange begins
    RequestStart {
        request_id: String,
        tunnel_id: String,
        method: String,
        /// Raw resource including the query string
        path: String,
        headers: HeaderList,
    },

    /// Server -> client: request body chunk. The terminator is an empty
    /// chunk with `final = true`, sent even when the body is empty.
    RequestBody {
        request_id: String,
        #[serde(with = "serde_bytes")]
        chunk: Vec<u8>,
        #[serde(rename = "final")]
        is_final: bool,
    },

    /// Client -> server: response status and headers
    ResponseStart {
        request_id: String,
        status: u16,
        headers: HeaderList,
    },

    /// Client -> server: response body chunk
    ResponseBody {
        request_id: String,
        #[serde(with = "serde_bytes")]
        chunk: Vec<u8>,
    },

    /// Client -> server: response complete
    ResponseEnd { request_id: String },

    /// Keepalive probe; the peer echoes the timestamp back
    Ping { timestamp: u64 },

    /// Keepalive reply
    Pong { timestamp: u64 },

    /// Server -> client: an external caller wants a WebSocket through the
    /// tunnel
    WebSocketUpgrade {
        request_id: String,
        tunnel_id: String,
        path: String,
        headers: HeaderList,
    },

    /// Client -> server: local upstream accepted the upgrade
    WebSocketUpgradeOk {
        request_id: String,
        headers: HeaderList,
    },

    /// Client -> server: local upstream refused the upgrade
    WebSocketUpgradeError {
        request_id: String,
        status: u16,
        message: String,
    },

    /// A WebSocket data frame, either direction. See [`opcode`].
    WebSocketFrame {
        request_id: String,
        opcode: u8,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// WebSocket close, either direction
    WebSocketClose {
        request_id: String,
        code: Option<u16>,
    },
}

impl ProtocolMessage {
    /// Serialize the message to MessagePack bytes.
    ///
    /// Uses named (map) encoding so the discriminator and field names are
    /// strings on the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// Generate a fresh 128-bit hex request id
pub fn new_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Header conversions between the wire representation and `http` types.
pub mod headers {
    use super::HeaderList;
    use http::HeaderMap;

    /// Headers that apply to a single transport hop and must not reach
    /// the origin.
    const HOP_BY_HOP: [&str; 8] = [
        "connection",
        "keep-alive",
        "transfer-encoding",
        "te",
        "trailer",
        "upgrade",
        "proxy-authorization",
        "proxy-authenticate",
    ];

    pub fn is_hop_by_hop(name: &str) -> bool {
        HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
    }

    pub fn strip_hop_by_hop(headers: HeaderList) -> HeaderList {
        headers
            .into_iter()
            .filter(|(name, _)| !is_hop_by_hop(name))
            .collect()
    }

    /// Collect an `http::HeaderMap` into the wire form, keeping every
    /// value of a repeated name in order. Values that are not valid
    /// UTF-8 are skipped.
    pub fn to_header_list(map: &HeaderMap) -> HeaderList {
        let mut list: HeaderList = Vec::new();
        for name in map.keys() {
            let values: Vec<String> = map
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok().map(str::to_string))
                .collect();
            if !values.is_empty() {
                list.push((name.as_str().to_string(), values));
            }
        }
        list
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use http::header::{HeaderName, HeaderValue};

        #[test]
        fn test_hop_by_hop_detection() {
            assert!(is_hop_by_hop("Connection"));
            assert!(is_hop_by_hop("transfer-encoding"));
            assert!(is_hop_by_hop("Proxy-Authorization"));
            assert!(!is_hop_by_hop("content-type"));
            assert!(!is_hop_by_hop("set-cookie"));
        }

        #[test]
        fn test_to_header_list_keeps_repeated_values_in_order() {
            let mut map = HeaderMap::new();
            map.append(
                HeaderName::from_static("set-cookie"),
                HeaderValue::from_static("a=1"),
            );
            map.append(
                HeaderName::from_static("set-cookie"),
                HeaderValue::from_static("b=2"),
            );
            map.insert(
                HeaderName::from_static("content-type"),
                HeaderValue::from_static("text/plain"),
            );

            let list = to_header_list(&map);
            let cookies = list
                .iter()
                .find(|(name, _)| name == "set-cookie")
                .map(|(_, values)| values.clone())
                .unwrap();
            assert_eq!(cookies, vec!["a=1".to_string(), "b=2".to_string()]);
        }

        #[test]
        fn test_strip_hop_by_hop() {
            let list: HeaderList = vec![
                ("Connection".to_string(), vec!["keep-alive".to_string()]),
                ("X-App".to_string(), vec!["1".to_string()]),
                ("Upgrade".to_string(), vec!["websocket".to_string()]),
            ];
            let stripped = strip_hop_by_hop(list);
            assert_eq!(stripped.len(), 1);
            assert_eq!(stripped[0].0, "X-App");
        }
    }
}

/// Constants for the protocol
pub mod constants {
    /// Recommended body chunk size in bytes
    pub const CHUNK_SIZE: usize = 8 * 1024;

    /// Control endpoint path on the server
    pub const CONTROL_PATH: &str = "/ws";

    /// Server heartbeat cadence in seconds
    pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

    /// Sessions with no activity for this long are closed
    pub const SESSION_IDLE_TIMEOUT_SECS: u64 = 60;

    /// Default bound on a single proxied HTTP exchange
    pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

    /// Protocol version advertised in logs
    pub const PROTOCOL_VERSION: &str = "1.0.0";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: ProtocolMessage) -> ProtocolMessage {
        let bytes = msg.to_bytes().unwrap();
        ProtocolMessage::from_bytes(&bytes).unwrap()
    }

    #[test]
    fn test_auth_roundtrip() {
        let msg = ProtocolMessage::Auth {
            api_key: "sk-test".to_string(),
        };
        assert_eq!(roundtrip(msg.clone()), msg);

        let ok = ProtocolMessage::AuthOk {
            account_id: "master".to_string(),
            limits: SessionLimits {
                max_tunnels: 5,
                requests_per_second: 50,
            },
        };
        assert_eq!(roundtrip(ok.clone()), ok);
    }

    #[test]
    fn test_tunnel_open_roundtrip() {
        let msg = ProtocolMessage::TunnelOpen {
            subdomain: Some("my-app".to_string()),
            protocol: TunnelProtocol::Http,
            basic_auth: None,
        };
        assert_eq!(roundtrip(msg.clone()), msg);

        let close = ProtocolMessage::TunnelClose {
            tunnel_id: String::new(),
            reason: "Rate limit exceeded".to_string(),
        };
        assert_eq!(roundtrip(close.clone()), close);
    }

    #[test]
    fn test_request_roundtrip_with_multi_valued_headers() {
        let msg = ProtocolMessage::RequestStart {
            request_id: new_request_id(),
            tunnel_id: "t-1".to_string(),
            method: "GET".to_string(),
            path: "/api/data?foo=bar".to_string(),
            headers: vec![
                (
                    "accept".to_string(),
                    vec!["text/html".to_string(), "application/json".to_string()],
                ),
                ("cookie".to_string(), vec!["a=1".to_string()]),
            ],
        };
        let decoded = roundtrip(msg.clone());
        assert_eq!(decoded, msg);

        match decoded {
            ProtocolMessage::RequestStart { headers, .. } => {
                assert_eq!(headers[0].1.len(), 2);
                assert_eq!(headers[0].1[1], "application/json");
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_body_chunk_all_byte_values() {
        let chunk: Vec<u8> = (0u8..=255).collect();
        let msg = ProtocolMessage::ResponseBody {
            request_id: new_request_id(),
            chunk: chunk.clone(),
        };
        match roundtrip(msg) {
            ProtocolMessage::ResponseBody { chunk: decoded, .. } => {
                assert_eq!(decoded, chunk);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_final_flag_wire_name() {
        let msg = ProtocolMessage::RequestBody {
            request_id: "r".to_string(),
            chunk: Vec::new(),
            is_final: true,
        };
        let bytes = msg.to_bytes().unwrap();

        // The rename must hold on the wire, not just in Rust
        #[derive(Deserialize)]
        struct Probe {
            #[serde(rename = "type")]
            kind: String,
            #[serde(rename = "final")]
            done: bool,
        }
        let probe: Probe = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(probe.kind, "RequestBody");
        assert!(probe.done);
    }

    #[test]
    fn test_websocket_frame_roundtrip() {
        let msg = ProtocolMessage::WebSocketFrame {
            request_id: new_request_id(),
            opcode: opcode::BINARY,
            payload: vec![0x00, 0xFF, 0x80, 0x7F],
        };
        assert_eq!(roundtrip(msg.clone()), msg);

        let close = ProtocolMessage::WebSocketClose {
            request_id: new_request_id(),
            code: Some(1000),
        };
        assert_eq!(roundtrip(close.clone()), close);
    }

    #[test]
    fn test_ping_echoes_timestamp() {
        let msg = ProtocolMessage::Ping { timestamp: 1712345678901 };
        match roundtrip(msg) {
            ProtocolMessage::Ping { timestamp } => assert_eq!(timestamp, 1712345678901),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_unknown_discriminator_rejected() {
        #[derive(Serialize)]
        struct Bogus {
            #[serde(rename = "type")]
            kind: &'static str,
            request_id: &'static str,
        }
        let bytes = rmp_serde::to_vec_named(&Bogus {
            kind: "Vanish",
            request_id: "r",
        })
        .unwrap();
        assert!(matches!(
            ProtocolMessage::from_bytes(&bytes),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_missing_field_rejected() {
        #[derive(Serialize)]
        struct Partial {
            #[serde(rename = "type")]
            kind: &'static str,
        }
        let bytes = rmp_serde::to_vec_named(&Partial { kind: "ResponseEnd" }).unwrap();
        assert!(ProtocolMessage::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_request_id_is_128_bit_hex() {
        let id = new_request_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
