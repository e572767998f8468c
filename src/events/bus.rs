//! Event bus backends.
//!
//! The bus owns no state beyond its transient subscriber lists. `emit` never
//! surfaces an error to the caller: a backend outage must not propagate into
//! the action execution path, so failures are logged and swallowed.
//!
//! Backends:
//!   - [`InProcessBus`]  - synchronous best-effort fan-out to pattern
//!     subscribers; FIFO per subscriber, unordered across subscribers.
//!   - [`LogEventBus`]   - NDJSON append-only file.
//!   - [`NullEventBus`]  - discards everything.

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::mpsc;

use crate::events::models::UniversalEvent;
use crate::events::router::compile_pattern;

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event. Must not fail from the caller's perspective.
    async fn emit(&self, event: UniversalEvent);
}

// ---------------------------------------------------------------------------
// NullEventBus
// ---------------------------------------------------------------------------

/// Discards all events. Default when no streaming is configured, so callers
/// never need to check whether a bus is present.
pub struct NullEventBus;

#[async_trait]
impl EventBus for NullEventBus {
    async fn emit(&self, _event: UniversalEvent) {}
}

// ---------------------------------------------------------------------------
// InProcessBus
// ---------------------------------------------------------------------------

struct Subscriber {
    pattern: Regex,
    sender: mpsc::UnboundedSender<UniversalEvent>,
}

/// In-process fan-out bus.
///
/// Delivery to each subscriber preserves emission order (the channel is
/// FIFO); no ordering is guaranteed across subscribers. Closed receivers are
/// pruned lazily on the next emit.
pub struct InProcessBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe to all events whose topic matches `pattern`.
    pub fn subscribe(&self, pattern: &str) -> mpsc::UnboundedReceiver<UniversalEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let compiled = compile_pattern(pattern).unwrap_or_else(|_| {
            // An unparsable pattern matches nothing.
            Regex::new("$^").unwrap()
        });
        self.subscribers
            .write()
            .expect("subscriber list poisoned")
            .push(Subscriber {
                pattern: compiled,
                sender: tx,
            });
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .expect("subscriber list poisoned")
            .len()
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InProcessBus {
    async fn emit(&self, event: UniversalEvent) {
        let topic = event.topic.replace('/', ".");
        let mut dropped = false;
        {
            let subscribers = self.subscribers.read().expect("subscriber list poisoned");
            for sub in subscribers.iter() {
                if sub.pattern.is_match(&topic) && sub.sender.send(event.clone()).is_err() {
                    dropped = true;
                }
            }
        }
        if dropped {
            let mut subscribers = self.subscribers.write().expect("subscriber list poisoned");
            subscribers.retain(|s| !s.sender.is_closed());
        }
    }
}

// ---------------------------------------------------------------------------
// LogEventBus
// ---------------------------------------------------------------------------

/// Writes events as NDJSON, one line per event, append-only.
pub struct LogEventBus {
    path: PathBuf,
    lock: Mutex<()>,
}

impl LogEventBus {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl EventBus for LogEventBus {
    async fn emit(&self, event: UniversalEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                log::error!("[EventBus] failed to serialise event {}: {}", event.id, e);
                return;
            }
        };
        let _guard = self.lock.lock().expect("log bus lock poisoned");
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{}", line));
        if let Err(e) = result {
            log::error!(
                "[EventBus] failed to append event to {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

// ---------------------------------------------------------------------------
// FanoutBus
// ---------------------------------------------------------------------------

/// Broadcasts every event to multiple backends.
pub struct FanoutBus {
    backends: Vec<std::sync::Arc<dyn EventBus>>,
}

impl FanoutBus {
    pub fn new(backends: Vec<std::sync::Arc<dyn EventBus>>) -> Self {
        Self { backends }
    }
}

#[async_trait]
impl EventBus for FanoutBus {
    async fn emit(&self, event: UniversalEvent) {
        for backend in &self.backends {
            backend.emit(event.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::models::TOPIC_TRIGGERS;
    use serde_json::json;

    #[tokio::test]
    async fn in_process_bus_routes_by_pattern() {
        let bus = InProcessBus::new();
        let mut triggers = bus.subscribe("iml.triggers.#");
        let mut everything = bus.subscribe("#");

        bus.emit(UniversalEvent::new(
            "trigger.fired",
            TOPIC_TRIGGERS,
            "test",
            json!({}),
        ))
        .await;
        bus.emit(UniversalEvent::new("plan.done", "iml.plans", "test", json!({})))
            .await;

        let first = triggers.recv().await.unwrap();
        assert_eq!(first.event_type, "trigger.fired");
        assert!(triggers.try_recv().is_err());

        assert_eq!(everything.recv().await.unwrap().event_type, "trigger.fired");
        assert_eq!(everything.recv().await.unwrap().event_type, "plan.done");
    }

    #[tokio::test]
    async fn per_subscriber_delivery_is_fifo() {
        let bus = InProcessBus::new();
        let mut rx = bus.subscribe("iml.plans");
        for i in 0..10 {
            bus.emit(UniversalEvent::new(
                &format!("e{}", i),
                "iml.plans",
                "test",
                json!({}),
            ))
            .await;
        }
        for i in 0..10 {
            assert_eq!(rx.recv().await.unwrap().event_type, format!("e{}", i));
        }
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let bus = InProcessBus::new();
        let rx = bus.subscribe("#");
        drop(rx);
        bus.emit(UniversalEvent::new("e", "iml.plans", "test", json!({})))
            .await;
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn log_bus_appends_ndjson() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let bus = LogEventBus::new(path.clone());
        bus.emit(UniversalEvent::new("a", "iml.plans", "test", json!({"k": 1})))
            .await;
        bus.emit(UniversalEvent::new("b", "iml.plans", "test", json!({})))
            .await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: UniversalEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.event_type, "a");
    }
}
