//! Pending WebSocket upgrade correlation
//!
//! Each upgrade attempt walks a three-state machine: awaiting the tunnel
//! client's confirmation, active (frames flowing both ways), closed.
//! `fail_upgrade` is a no-op once the entry is active because the 101 has
//! already been written; close is idempotent because only the caller that
//! removes the entry emits the closing event.

use burrow_common::HeaderList;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

const SWEEP_PERIOD: Duration = Duration::from_secs(10);
const SWEEP_GRACE: Duration = Duration::from_secs(5);

/// Close code sent to external peers when the owning tunnel goes away
const GOING_AWAY: u16 = 1001;

/// Frame-stream events consumed by the ingress frame loop.
#[derive(Debug, PartialEq)]
pub enum WsEvent {
    Frame { opcode: u8, payload: Vec<u8> },
    Close { code: Option<u16> },
}

/// Resolution of the upgrade attempt, delivered once.
#[derive(Debug, PartialEq)]
pub enum UpgradeOutcome {
    /// Local upstream accepted; headers are already hop-by-hop-stripped
    Accepted { headers: HeaderList },
    /// Upstream refused, or the attempt expired
    Rejected { status: u16, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingUpgrade,
    Active,
    Closed,
}

#[derive(Debug)]
pub struct PendingWebSocket {
    pub tunnel_id: String,
    created_at: Instant,
    confirm: Mutex<Option<oneshot::Sender<UpgradeOutcome>>>,
    events: mpsc::Sender<WsEvent>,
    phase: Mutex<Phase>,
}

impl PendingWebSocket {
    fn phase(&self) -> Phase {
        *self.phase.lock().unwrap()
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock().unwrap() = phase;
    }

    fn take_confirm(&self) -> Option<oneshot::Sender<UpgradeOutcome>> {
        self.confirm.lock().unwrap().take()
    }
}

/// Correlates WebSocket upgrade ids with their ingress handlers.
#[derive(Default)]
pub struct PendingWebSocketStore {
    entries: DashMap<String, Arc<PendingWebSocket>>,
}

impl PendingWebSocketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an upgrade attempt. Returns the entry, the one-shot
    /// upgrade signal, and the frame stream the ingress loop will drain
    /// once active.
    pub fn add(
        &self,
        request_id: String,
        tunnel_id: String,
    ) -> (
        Arc<PendingWebSocket>,
        oneshot::Receiver<UpgradeOutcome>,
        mpsc::Receiver<WsEvent>,
    ) {
        let (confirm_tx, confirm_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::channel(64);
        let entry = Arc::new(PendingWebSocket {
            tunnel_id,
            created_at: Instant::now(),
            confirm: Mutex::new(Some(confirm_tx)),
            events: events_tx,
            phase: Mutex::new(Phase::AwaitingUpgrade),
        });
        self.entries.insert(request_id, entry.clone());
        (entry, confirm_rx, events_rx)
    }

    pub fn get(&self, request_id: &str) -> Option<Arc<PendingWebSocket>> {
        self.entries.get(request_id).map(|e| e.clone())
    }

    /// The tunnel client confirmed the local upgrade: flip to active and
    /// release the ingress handler.
    pub fn confirm_upgrade(&self, request_id: &str, headers: HeaderList) {
        let Some(entry) = self.get(request_id) else {
            return;
        };
        if entry.phase() != Phase::AwaitingUpgrade {
            return;
        }
        entry.set_phase(Phase::Active);
        if let Some(confirm) = entry.take_confirm() {
            let _ = confirm.send(UpgradeOutcome::Accepted { headers });
        }
    }

    /// The tunnel client could not upgrade locally. No-op once active:
    /// the 101 has been flushed and only a close can end the stream.
    pub fn fail_upgrade(&self, request_id: &str, status: u16, message: String) {
        let Some(entry) = self.get(request_id) else {
            return;
        };
        if entry.phase() != Phase::AwaitingUpgrade {
            return;
        }
        entry.set_phase(Phase::Closed);
        self.entries.remove(request_id);
        if let Some(confirm) = entry.take_confirm() {
            let _ = confirm.send(UpgradeOutcome::Rejected { status, message });
        }
    }

    /// Forward a frame from the tunnel client to the external peer.
    pub async fn frame(&self, request_id: &str, opcode: u8, payload: Vec<u8>) {
        let Some(entry) = self.get(request_id) else {
            return;
        };
        if entry.phase() != Phase::Active {
            return;
        }
        let _ = entry.events.send(WsEvent::Frame { opcode, payload }).await;
    }

    /// Propagate a close from the tunnel client. Idempotent: whoever
    /// removes the entry delivers the event.
    pub async fn close(&self, request_id: &str, code: Option<u16>) {
        let Some((_, entry)) = self.entries.remove(request_id) else {
            return;
        };
        let phase = entry.phase();
        entry.set_phase(Phase::Closed);
        match phase {
            Phase::Active => {
                let _ = entry.events.send(WsEvent::Close { code }).await;
            }
            Phase::AwaitingUpgrade => {
                if let Some(confirm) = entry.take_confirm() {
                    let _ = confirm.send(UpgradeOutcome::Rejected {
                        status: 502,
                        message: "Tunnel closed the stream".to_string(),
                    });
                }
            }
            Phase::Closed => {}
        }
    }

    /// Local side is done (frame loop exited). Drops the entry without
    /// emitting events.
    pub fn remove(&self, request_id: &str) -> Option<Arc<PendingWebSocket>> {
        self.entries.remove(request_id).map(|(_, e)| {
            e.set_phase(Phase::Closed);
            e
        })
    }

    /// Tear down every stream belonging to a lost tunnel.
    pub async fn remove_by_tunnel(&self, tunnel_id: &str) -> usize {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.tunnel_id == tunnel_id)
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for id in ids {
            let Some((_, entry)) = self.entries.remove(&id) else {
                continue;
            };
            removed += 1;
            let phase = entry.phase();
            entry.set_phase(Phase::Closed);
            match phase {
                Phase::AwaitingUpgrade => {
                    if let Some(confirm) = entry.take_confirm() {
                        let _ = confirm.send(UpgradeOutcome::Rejected {
                            status: 502,
                            message: "Tunnel disconnected".to_string(),
                        });
                    }
                }
                Phase::Active => {
                    let _ = entry
                        .events
                        .send(WsEvent::Close {
                            code: Some(GOING_AWAY),
                        })
                        .await;
                }
                Phase::Closed => {}
            }
        }
        removed
    }

    /// Reap upgrades that never confirmed. Active streams live until a
    /// close.
    pub fn expire_unconfirmed(&self, timeout: Duration) -> usize {
        self.expire_with_cutoff(timeout + SWEEP_GRACE)
    }

    fn expire_with_cutoff(&self, cutoff: Duration) -> usize {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|e| {
                e.phase() == Phase::AwaitingUpgrade && e.created_at.elapsed() > cutoff
            })
            .map(|e| e.key().clone())
            .collect();

        let mut expired = 0;
        for id in ids {
            expired += 1;
            self.fail_upgrade(&id, 504, "Upgrade timed out".to_string());
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
                let expired = store.expire_unconfirmed(request_timeout);
                if expired > 0 {
                    tracing::debug!("Expired {} unconfirmed upgrades", expired);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_common::opcode;

    #[tokio::test]
    async fn test_confirm_then_frames_flow() {
        let store = PendingWebSocketStore::new();
        let (_entry, confirm_rx, mut events_rx) = store.add("w1".into(), "t1".into());

        store.confirm_upgrade("w1", vec![("x-app".into(), vec!["1".into()])]);
        match confirm_rx.await.unwrap() {
            UpgradeOutcome::Accepted { headers } => assert_eq!(headers[0].0, "x-app"),
            other => panic!("expected Accepted, got {:?}", other),
        }

        store.frame("w1", opcode::TEXT, b"ping".to_vec()).await;
        assert_eq!(
            events_rx.recv().await.unwrap(),
            WsEvent::Frame {
                opcode: opcode::TEXT,
                payload: b"ping".to_vec()
            }
        );
    }

    #[tokio::test]
    async fn test_fail_upgrade_rejects_waiter() {
        let store = PendingWebSocketStore::new();
        let (_entry, confirm_rx, _events_rx) = store.add("w1".into(), "t1".into());

        store.fail_upgrade("w1", 503, "upstream refused".into());
        assert_eq!(
            confirm_rx.await.unwrap(),
            UpgradeOutcome::Rejected {
                status: 503,
                message: "upstream refused".into()
            }
        );
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_fail_upgrade_noop_once_active() {
        let store = PendingWebSocketStore::new();
        let (_entry, _confirm_rx, mut events_rx) = store.add("w1".into(), "t1".into());

        store.confirm_upgrade("w1", Vec::new());
        store.fail_upgrade("w1", 500, "late failure".into());

        // Entry survives and frames still flow
        store.frame("w1", opcode::BINARY, vec![1, 2]).await;
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            WsEvent::Frame { .. }
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let store = PendingWebSocketStore::new();
        let (entry, _confirm_rx, mut events_rx) = store.add("w1".into(), "t1".into());
        store.confirm_upgrade("w1", Vec::new());

        store.close("w1", Some(1000)).await;
        store.close("w1", Some(1000)).await;

        assert_eq!(
            events_rx.recv().await.unwrap(),
            WsEvent::Close { code: Some(1000) }
        );
        // Only the first close delivered an event; dropping the entry's
        // sender proves nothing else was queued
        drop(entry);
        assert!(events_rx.recv().await.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_close_before_confirm_rejects_with_502() {
        let store = PendingWebSocketStore::new();
        let (_entry, confirm_rx, _events_rx) = store.add("w1".into(), "t1".into());

        store.close("w1", None).await;
        match confirm_rx.await.unwrap() {
            UpgradeOutcome::Rejected { status, .. } => assert_eq!(status, 502),
            other => panic!("expected Rejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remove_by_tunnel_splits_by_phase() {
        let store = PendingWebSocketStore::new();
        let (_e1, confirm_waiting, _ev1) = store.add("waiting".into(), "t1".into());
        let (_e2, _confirm_active, mut ev2) = store.add("active".into(), "t1".into());
        let (_e3, _c3, _ev3) = store.add("other".into(), "t2".into());
        store.confirm_upgrade("active", Vec::new());

        assert_eq!(store.remove_by_tunnel("t1").await, 2);

        match confirm_waiting.await.unwrap() {
            UpgradeOutcome::Rejected { status, message } => {
                assert_eq!(status, 502);
                assert_eq!(message, "Tunnel disconnected");
            }
            other => panic!("expected Rejected, got {:?}", other),
        }
        assert_eq!(
            ev2.recv().await.unwrap(),
            WsEvent::Close {
                code: Some(GOING_AWAY)
            }
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_expire_unconfirmed_only_touches_waiting_entries() {
        let store = PendingWebSocketStore::new();
        let (_e1, confirm_rx, _ev1) = store.add("stale".into(), "t1".into());
        let (_e2, _c2, _ev2) = store.add("live".into(), "t1".into());
        store.confirm_upgrade("live", Vec::new());

        // Grace keeps fresh attempts alive
        assert_eq!(store.expire_unconfirmed(Duration::ZERO), 0);

        assert_eq!(store.expire_with_cutoff(Duration::ZERO), 1);
        match confirm_rx.await.unwrap() {
            UpgradeOutcome::Rejected { status, .. } => assert_eq!(status, 504),
            other => panic!("expected Rejected, got {:?}", other),
        }
        // The active stream survives the sweep
        assert_eq!(store.len(), 1);
        assert!(store.get("live").is_some());
    }
}
