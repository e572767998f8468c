//! Trigger watchers - long-lived tasks observing a trigger's condition.
//!
//! Each watcher runs as an independent tokio task carrying a stop token and
//! an async fire callback. Errors inside a watcher never take the daemon
//! down: the guarded runner catches the failure, records it on the handle,
//! and the daemon's health loop transitions the owning trigger to FAILED.

pub mod composite;
pub mod system;
pub mod temporal;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::triggers::models::TriggerCondition;

/// `(trigger_id, event_type, payload)` delivered on every condition match.
pub type FireCallback =
    Arc<dyn Fn(String, String, Value) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// A sub-trigger fire forwarded into a composite watcher.
#[derive(Debug, Clone)]
pub struct SubFire {
    pub sub_trigger_id: String,
    pub event_type: String,
    pub payload: Value,
}

/// Handle to one running watcher task.
pub struct WatcherHandle {
    trigger_id: String,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    error: Arc<Mutex<Option<String>>>,
    /// Present only for composite watchers.
    sub_fires: Option<mpsc::UnboundedSender<SubFire>>,
}

impl WatcherHandle {
    pub fn trigger_id(&self) -> &str {
        &self.trigger_id
    }

    /// Terminal error recorded by the watcher body, if any.
    pub fn error(&self) -> Option<String> {
        self.error.lock().expect("watcher error lock poisoned").clone()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .expect("watcher task lock poisoned")
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Forward a sub-trigger fire (composite watchers only).
    pub fn notify_sub_fire(&self, fire: SubFire) {
        if let Some(sender) = &self.sub_fires {
            let _ = sender.send(fire);
        }
    }

    /// Signal the watcher to stop and await its completion.
    pub async fn stop(&self) {
        self.stop.cancel();
        let task = self
            .task
            .lock()
            .expect("watcher task lock poisoned")
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Instantiate and start the watcher matching `condition`.
pub fn spawn_watcher(
    trigger_id: &str,
    condition: &TriggerCondition,
    callback: FireCallback,
) -> WatcherHandle {
    let stop = CancellationToken::new();
    let error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let mut sub_fires = None;

    let body: Pin<Box<dyn Future<Output = Result<(), String>> + Send>> = match condition {
        TriggerCondition::Temporal { spec } => {
            temporal::run(trigger_id.to_string(), spec.clone(), callback, stop.clone())
        }
        TriggerCondition::Filesystem {
            path,
            recursive,
            events,
            poll_interval_seconds,
        } => system::run_filesystem(
            trigger_id.to_string(),
            path.clone(),
            *recursive,
            events.clone(),
            *poll_interval_seconds,
            callback,
            stop.clone(),
        ),
        TriggerCondition::Process {
            name,
            event,
            poll_interval_seconds,
        } => system::run_process(
            trigger_id.to_string(),
            name.clone(),
            *event,
            *poll_interval_seconds,
            callback,
            stop.clone(),
        ),
        TriggerCondition::Resource {
            metric,
            threshold,
            duration_seconds,
            poll_interval_seconds,
        } => system::run_resource(
            trigger_id.to_string(),
            *metric,
            *threshold,
            *duration_seconds,
            *poll_interval_seconds,
            system::default_probe(),
            callback,
            stop.clone(),
        ),
        TriggerCondition::Composite { .. } => {
            let (tx, rx) = mpsc::unbounded_channel();
            sub_fires = Some(tx);
            composite::run(
                trigger_id.to_string(),
                condition.clone(),
                rx,
                callback,
                stop.clone(),
            )
        }
    };

    let error_slot = error.clone();
    let task_trigger_id = trigger_id.to_string();
    let task = tokio::spawn(async move {
        if let Err(message) = body.await {
            log::error!("[Watcher:{}] terminated: {}", task_trigger_id, message);
            *error_slot.lock().expect("watcher error lock poisoned") = Some(message);
        }
    });

    log::debug!("[Watcher:{}] started", trigger_id);
    WatcherHandle {
        trigger_id: trigger_id.to_string(),
        stop,
        task: Mutex::new(Some(task)),
        error,
        sub_fires,
    }
}
