//! Pending HTTP request correlation
//!
//! Every proxied exchange gets exactly one terminal event: a normal
//! completion, a 504 from the expiry sweep, a 502 when the owning tunnel
//! drops, or silence when the external caller already gave up. Whoever
//! removes the entry from the map sends the terminal event, so two
//! outcomes can never fire for one request id.

use burrow_common::HeaderList;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Sweep cadence for expired entries
const SWEEP_PERIOD: Duration = Duration::from_secs(10);

/// Grace added on top of the request timeout before the sweep reaps an
/// entry; the ingress waiter owns the timely 504
const SWEEP_GRACE: Duration = Duration::from_secs(5);

/// What the ingress waiter receives while the tunnel client responds.
#[derive(Debug)]
pub enum ResponseEvent {
    /// Status and headers, sent once
    Start { status: u16, headers: HeaderList },
    /// One body chunk
    Chunk(Bytes),
    /// Response complete
    End,
    /// Exchange failed before or during the response
    Failed { status: u16, message: String },
}

#[derive(Debug)]
pub struct PendingRequest {
    pub tunnel_id: String,
    sink: mpsc::Sender<ResponseEvent>,
    created_at: Instant,
    started: AtomicBool,
}

impl PendingRequest {
    /// Deliver an event to the waiting ingress task. Errors mean the
    /// caller went away; the exchange is then moot.
    pub async fn deliver(&self, event: ResponseEvent) -> bool {
        self.sink.send(event).await.is_ok()
    }

    /// Flip the response-started flag. Returns the previous value.
    pub fn mark_started(&self) -> bool {
        self.started.swap(true, Ordering::AcqRel)
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

/// Correlates request ids with their waiting ingress tasks.
#[derive(Default)]
pub struct PendingRequestStore {
    entries: DashMap<String, Arc<PendingRequest>>,
}

impl PendingRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self,
        request_id: String,
        tunnel_id: String,
        sink: mpsc::Sender<ResponseEvent>,
    ) -> Arc<PendingRequest> {
        let entry = Arc::new(PendingRequest {
            tunnel_id,
            sink,
            created_at: Instant::now(),
            started: AtomicBool::new(false),
        });
        self.entries.insert(request_id, entry.clone());
        entry
    }

    pub fn get(&self, request_id: &str) -> Option<Arc<PendingRequest>> {
        self.entries.get(request_id).map(|e| e.clone())
    }

    pub fn remove(&self, request_id: &str) -> Option<Arc<PendingRequest>> {
        self.entries.remove(request_id).map(|(_, e)| e)
    }

    /// Fail every exchange belonging to a lost tunnel with a 502.
    pub async fn remove_by_tunnel(&self, tunnel_id: &str) -> usize {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.tunnel_id == tunnel_id)
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for id in ids {
            if let Some(entry) = self.remove(&id) {
                removed += 1;
                let _ = entry
                    .deliver(ResponseEvent::Failed {
                        status: 502,
                        message: "Tunnel disconnected".to_string(),
                    })
                    .await;
            }
        }
        removed
    }

    /// Reap entries older than `timeout` plus grace. Requests that never
    /// produced headers become 504s; started streams are simply ended.
    pub async fn expire_older_than(&self, timeout: Duration) -> usize {
        self.expire_with_cutoff(timeout + SWEEP_GRACE).await
    }

    async fn expire_with_cutoff(&self, cutoff: Duration) -> usize {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.created_at.elapsed() > cutoff)
            .map(|e| e.key().clone())
            .collect();

        let mut expired = 0;
        for id in ids {
            if let Some(entry) = self.remove(&id) {
                expired += 1;
                let event = if entry.has_started() {
                    ResponseEvent::End
                } else {
                    ResponseEvent::Failed {
                        status: 504,
                        message: "Gateway timeout".to_string(),
                    }
                };
                let _ = entry.deliver(event).await;
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn spawn_sweeper(
        store: Arc<Self>,
        request_timeout: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_PERIOD);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let expired = store.expire_older_than(request_timeout).await;
                if expired > 0 {
                    tracing::debug!("Expired {} pending requests", expired);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_entry(id: &str, tunnel: &str) -> (PendingRequestStore, mpsc::Receiver<ResponseEvent>) {
        let store = PendingRequestStore::new();
        let (tx, rx) = mpsc::channel(8);
        store.add(id.to_string(), tunnel.to_string(), tx);
        (store, rx)
    }

    #[tokio::test]
    async fn test_remove_by_tunnel_fails_waiters_with_502() {
        let (store, mut rx) = store_with_entry("r1", "t1");
        let (other_tx, mut other_rx) = mpsc::channel(8);
        store.add("r2".to_string(), "t2".to_string(), other_tx);

        assert_eq!(store.remove_by_tunnel("t1").await, 1);
        match rx.recv().await.unwrap() {
            ResponseEvent::Failed { status, message } => {
                assert_eq!(status, 502);
                assert_eq!(message, "Tunnel disconnected");
            }
            other => panic!("expected Failed, got {:?}", other),
        }

        // The unrelated tunnel's exchange is untouched
        assert!(store.get("r2").is_some());
        assert!(other_rx.try_recv().is_err());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_expiry_sends_504_before_headers() {
        let (store, mut rx) = store_with_entry("r1", "t1");

        // Grace keeps fresh entries alive even with a zero timeout
        assert_eq!(store.expire_older_than(Duration::ZERO).await, 0);
        assert_eq!(store.len(), 1);

        assert_eq!(store.expire_with_cutoff(Duration::ZERO).await, 1);
        match rx.recv().await.unwrap() {
            ResponseEvent::Failed { status, message } => {
                assert_eq!(status, 504);
                assert_eq!(message, "Gateway timeout");
            }
            other => panic!("expected Failed, got {:?}", other),
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_expiry_ends_started_stream_without_504() {
        let (store, mut rx) = store_with_entry("r1", "t1");
        store.get("r1").unwrap().mark_started();

        assert_eq!(store.expire_with_cutoff(Duration::ZERO).await, 1);
        assert!(matches!(rx.recv().await.unwrap(), ResponseEvent::End));
    }

    #[tokio::test]
    async fn test_terminal_event_fires_exactly_once() {
        let (store, _rx) = store_with_entry("r1", "t1");

        // Two competing removers: only one wins the entry
        let first = store.remove("r1");
        let second = store.remove("r1");
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(store.remove_by_tunnel("t1").await, 0);
    }

    #[tokio::test]
    async fn test_started_flag_transitions_once() {
        let (store, _rx) = store_with_entry("r1", "t1");
        let entry = store.get("r1").unwrap();
        assert!(!entry.mark_started());
        assert!(entry.mark_started());
        assert!(entry.has_started());
    }

    #[tokio::test]
    async fn test_deliver_to_gone_caller_reports_false() {
        let (store, rx) = store_with_entry("r1", "t1");
        drop(rx);
        let entry = store.get("r1").unwrap();
        assert!(!entry.deliver(ResponseEvent::End).await);
    }
}
