//! Control sessions and the connection manager
//!
//! A session owns the outbound half of one client's control stream. All
//! writes go through a per-session async mutex so each encoded frame hits
//! the transport as one atomic message, and a slow client only ever
//! throttles its own tunnels.

use axum::extract::ws::{Message, WebSocket};
use burrow_common::{constants, ProtocolError, ProtocolMessage};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

pub type ControlSink = SplitSink<WebSocket, Message>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Control transport write failed: {0}")]
    Transport(#[from] axum::Error),
}

/// One authenticated bidirectional control stream.
pub struct ControlSession {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    authenticated: AtomicBool,
    account_id: Mutex<Option<String>>,
    last_activity: Mutex<Instant>,
    outbound: tokio::sync::Mutex<ControlSink>,
    shutdown: watch::Sender<bool>,
}

impl ControlSession {
    /// Wrap the write half of a freshly accepted control stream. The
    /// returned receiver fires when the session is force-closed.
    pub fn new(sink: ControlSink) -> (Arc<Self>, watch::Receiver<bool>) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            authenticated: AtomicBool::new(false),
            account_id: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            outbound: tokio::sync::Mutex::new(sink),
            shutdown,
        });
        (session, shutdown_rx)
    }

    /// Encode and write one frame. Serialized per session; may block while
    /// a slow client drains.
    pub async fn send(&self, message: &ProtocolMessage) -> Result<(), SessionError> {
        let bytes = message.to_bytes()?;
        let mut sink = self.outbound.lock().await;
        sink.send(Message::Binary(bytes.into())).await?;
        Ok(())
    }

    /// Record activity. Any inbound frame counts.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    pub fn mark_authenticated(&self, account_id: Option<String>) {
        *self.account_id.lock().unwrap() = account_id;
        self.authenticated.store(true, Ordering::Release);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn account_id(&self) -> Option<String> {
        self.account_id.lock().unwrap().clone()
    }

    /// Ask the read loop to tear the session down.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl std::fmt::Debug for ControlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSession")
            .field("id", &self.id)
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

/// Live control sessions, keyed by session id.
///
/// Lookups hand out `Arc` clones; nobody does I/O while holding a map
/// guard.
#[derive(Default)]
pub struct ConnectionManager {
    sessions: DashMap<Uuid, Arc<ControlSession>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session: Arc<ControlSession>) {
        self.sessions.insert(session.id, session);
    }

    pub fn remove(&self, id: Uuid) -> Option<Arc<ControlSession>> {
        self.sessions.remove(&id).map(|(_, s)| s)
    }

    pub fn find(&self, id: Uuid) -> Option<Arc<ControlSession>> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of all sessions. Callers may then do I/O freely.
    pub fn list(&self) -> Vec<Arc<ControlSession>> {
        self.sessions.iter().map(|s| s.clone()).collect()
    }
}

/// Heartbeat: ping every live session on a fixed cadence and force-close
/// the ones idle past the timeout. Cleanup itself runs in each session's
/// read loop.
pub fn spawn_heartbeat(connections: Arc<ConnectionManager>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(constants::HEARTBEAT_INTERVAL_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let idle_timeout = Duration::from_secs(constants::SESSION_IDLE_TIMEOUT_SECS);

        loop {
            interval.tick().await;
            for session in connections.list() {
                if session.idle_for() > idle_timeout {
                    tracing::info!("Closing stale session {}", session.id);
                    session.close();
                    continue;
                }
                let ping = ProtocolMessage::Ping {
                    timestamp: Utc::now().timestamp_millis() as u64,
                };
                // Bounded: a wedged client must not stall the sweep
                let send = session.send(&ping);
                if tokio::time::timeout(Duration::from_secs(5), send)
                    .await
                    .map_or(true, |r| r.is_err())
                {
                    tracing::debug!("Heartbeat send failed for session {}", session.id);
                    session.close();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // ControlSession construction needs a live WebSocket, so manager tests
    // exercise the map behavior via the session-id key space only.
    #[test]
    fn test_manager_find_missing() {
        let manager = ConnectionManager::new();
        assert!(manager.find(Uuid::new_v4()).is_none());
        assert!(manager.is_empty());
        assert!(manager.list().is_empty());
    }
}
