//! Minimal local request inspector
//!
//! Keeps a ring buffer of recent exchanges and serves them as JSON on a
//! localhost port, so a developer can see what traffic the tunnel carried
//! without tailing logs.

use anyhow::Result;
use axum::{routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const CAPACITY: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct ExchangeRecord {
    pub at: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: u128,
    pub bytes: usize,
}

/// Bounded store of recent exchanges, newest first.
#[derive(Default)]
pub struct InspectorStore {
    entries: Mutex<VecDeque<ExchangeRecord>>,
}

impl InspectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: ExchangeRecord) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() == CAPACITY {
            entries.pop_back();
        }
        entries.push_front(record);
    }

    pub fn recent(&self) -> Vec<ExchangeRecord> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }
}

/// Serve the inspector on localhost. Binding failure is reported to the
/// caller, who treats the inspector as best-effort.
pub async fn serve(port: u16, store: Arc<InspectorStore>) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route(
            "/",
            get({
                let store = store.clone();
                move || {
                    let store = store.clone();
                    async move { Json(store.recent()) }
                }
            }),
        )
        .route(
            "/requests",
            get(move || {
                let store = store.clone();
                async move { Json(store.recent()) }
            }),
        );

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str) -> ExchangeRecord {
        ExchangeRecord {
            at: Utc::now(),
            method: "GET".to_string(),
            path: path.to_string(),
            status: 200,
            duration_ms: 5,
            bytes: 12,
        }
    }

    #[test]
    fn test_ring_buffer_caps_and_orders() {
        let store = InspectorStore::new();
        for i in 0..(CAPACITY + 10) {
            store.record(record(&format!("/req/{}", i)));
        }
        let recent = store.recent();
        assert_eq!(recent.len(), CAPACITY);
        // Newest first
        assert_eq!(recent[0].path, format!("/req/{}", CAPACITY + 9));
    }
}
