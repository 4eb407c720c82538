//! Push channel for per-test real-time events.
//!
//! Events are broadcast to live subscribers (WebSocket / SSE handlers filter by
//! test id) and kept in a bounded ring buffer so late subscribers can catch up.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::config::{EVENT_BUFFER_SIZE, EVENT_CHANNEL_CAPACITY};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    ProgressUpdate,
    TestComplete,
    TestError,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestEvent {
    pub timestamp: DateTime<Utc>,
    pub test_id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: serde_json::Value,
}

pub struct EventHub {
    buffer: Arc<RwLock<VecDeque<TestEvent>>>,
    sender: broadcast::Sender<TestEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            buffer: Arc::new(RwLock::new(VecDeque::with_capacity(EVENT_BUFFER_SIZE))),
            sender,
        }
    }

    pub async fn push(&self, event: TestEvent) {
        let mut buf = self.buffer.write().await;
        if buf.len() >= EVENT_BUFFER_SIZE {
            buf.pop_front();
        }
        buf.push_back(event.clone());
        drop(buf);

        let _ = self.sender.send(event);
    }

    pub async fn history(&self) -> Vec<TestEvent> {
        self.buffer.read().await.iter().cloned().collect()
    }

    pub async fn history_for(&self, test_id: &str) -> Vec<TestEvent> {
        self.buffer
            .read()
            .await
            .iter()
            .filter(|e| e.test_id == test_id)
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TestEvent> {
        self.sender.subscribe()
    }

    pub async fn emit(&self, test_id: &str, kind: EventKind, data: serde_json::Value) {
        let event = TestEvent {
            timestamp: Utc::now(),
            test_id: test_id.to_string(),
            kind,
            data,
        };
        self.push(event).await;
    }
}
