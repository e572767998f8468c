//! Composite watcher - combines sub-trigger fires with a logic operator.
//!
//! The daemon forwards every sub-trigger fire into this watcher's queue via
//! `notify_sub_fire`; no nested watcher hierarchy exists. Operators:
//!
//!   AND     all sub-triggers fire within `timeout_seconds`
//!   OR      any sub-trigger fires
//!   NOT     every sub-trigger silent for `silence_seconds`
//!   SEQ     sub-triggers fire in declared order within `timeout_seconds`;
//!           an out-of-order fire resets the sequence
//!   WINDOW  one sub-trigger reaches `count` fires inside a sliding
//!           `window_seconds`; fires once, then the window clears (re-arm)

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::triggers::models::{CompositeOperator, TriggerCondition};
use crate::triggers::watchers::{FireCallback, SubFire};

struct CompositeState {
    operator: CompositeOperator,
    sub_ids: Vec<String>,
    timeout: Duration,
    window: Duration,
    count: usize,
    last_fires: HashMap<String, Instant>,
    seq_position: usize,
    seq_started: Option<Instant>,
    window_times: VecDeque<Instant>,
}

impl CompositeState {
    /// Feed one sub-fire; returns the composite payload when the condition
    /// is now satisfied.
    fn observe(&mut self, fire: &SubFire) -> Option<serde_json::Value> {
        if !self.sub_ids.iter().any(|id| id == &fire.sub_trigger_id) {
            return None;
        }
        let now = Instant::now();
        self.last_fires.insert(fire.sub_trigger_id.clone(), now);

        let base = json!({
            "operator": format!("{:?}", self.operator).to_uppercase(),
            "sub_trigger_id": fire.sub_trigger_id,
            "event_type": fire.event_type,
            "payload": fire.payload,
        });

        match self.operator {
            CompositeOperator::Or => Some(base),
            CompositeOperator::And => {
                let all_recent = self.sub_ids.iter().all(|id| {
                    self.last_fires
                        .get(id)
                        .is_some_and(|at| now.duration_since(*at) < self.timeout)
                });
                all_recent.then_some(base)
            }
            CompositeOperator::Seq => {
                let expected = self.sub_ids.get(self.seq_position);
                if expected.map(|e| e.as_str()) == Some(fire.sub_trigger_id.as_str()) {
                    if self.seq_position == 0 {
                        self.seq_started = Some(now);
                    }
                    // Sequence must complete inside the timeout window.
                    if self
                        .seq_started
                        .is_some_and(|start| now.duration_since(start) > self.timeout)
                    {
                        self.reset_seq();
                        return None;
                    }
                    self.seq_position += 1;
                    if self.seq_position >= self.sub_ids.len() {
                        self.reset_seq();
                        return Some(base);
                    }
                } else {
                    self.reset_seq();
                }
                None
            }
            CompositeOperator::Window => {
                self.window_times.push_back(now);
                while self
                    .window_times
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > self.window)
                {
                    self.window_times.pop_front();
                }
                if self.window_times.len() >= self.count {
                    let observed = self.window_times.len();
                    // Fire exactly once per crossing, then re-arm.
                    self.window_times.clear();
                    let mut payload = base;
                    payload["count"] = json!(observed);
                    payload["window_seconds"] = json!(self.window.as_secs_f64());
                    Some(payload)
                } else {
                    None
                }
            }
            CompositeOperator::Not => None,
        }
    }

    fn reset_seq(&mut self) {
        self.seq_position = 0;
        self.seq_started = None;
    }

    /// Drop stale fire records so AND cannot combine across its timeout.
    fn evict_stale(&mut self) {
        let now = Instant::now();
        let timeout = self.timeout;
        self.last_fires
            .retain(|_, at| now.duration_since(*at) < timeout);
    }
}

pub fn run(
    trigger_id: String,
    condition: TriggerCondition,
    mut sub_fires: mpsc::UnboundedReceiver<SubFire>,
    callback: FireCallback,
    stop: CancellationToken,
) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> {
    Box::pin(async move {
        let TriggerCondition::Composite {
            operator,
            trigger_ids,
            timeout_seconds,
            silence_seconds,
            count,
            window_seconds,
        } = condition
        else {
            return Err("composite watcher requires a composite condition".to_string());
        };
        if trigger_ids.is_empty() {
            return Err("composite trigger needs at least one sub-trigger".to_string());
        }

        let mut state = CompositeState {
            operator,
            sub_ids: trigger_ids,
            timeout: Duration::from_secs_f64(timeout_seconds.max(0.001)),
            window: Duration::from_secs_f64(window_seconds.max(0.001)),
            count: count.max(1),
            last_fires: HashMap::new(),
            seq_position: 0,
            seq_started: None,
            window_times: VecDeque::new(),
        };

        if operator == CompositeOperator::Not {
            return run_not(trigger_id, state, silence_seconds, sub_fires, callback, stop)
                .await;
        }

        loop {
            let fire = tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                fire = sub_fires.recv() => match fire {
                    Some(fire) => fire,
                    None => return Ok(()),
                },
                _ = tokio::time::sleep(Duration::from_millis(500)) => {
                    state.evict_stale();
                    continue;
                }
            };

            if let Some(payload) = state.observe(&fire) {
                callback(trigger_id.clone(), "composite.fired".to_string(), payload).await;
                state.last_fires.clear();
            }
        }
    })
}

/// NOT: fire when every sub-trigger has been silent for `silence_seconds`.
async fn run_not(
    trigger_id: String,
    mut state: CompositeState,
    silence_seconds: f64,
    mut sub_fires: mpsc::UnboundedReceiver<SubFire>,
    callback: FireCallback,
    stop: CancellationToken,
) -> Result<(), String> {
    let silence = Duration::from_secs_f64(silence_seconds.max(0.001));
    // Check at a fraction of the silence window so detection lag stays small.
    let check_interval = silence.div_f64(4.0).max(Duration::from_millis(10));
    let started = Instant::now();

    loop {
        tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            fire = sub_fires.recv() => {
                if let Some(fire) = fire {
                    state.last_fires.insert(fire.sub_trigger_id, Instant::now());
                }
                continue;
            }
            _ = tokio::time::sleep(check_interval) => {}
        }

        let now = Instant::now();
        let all_silent = state.sub_ids.iter().all(|id| {
            match state.last_fires.get(id) {
                Some(at) => now.duration_since(*at) >= silence,
                // Never fired: silent since the watcher started.
                None => now.duration_since(started) >= silence,
            }
        });
        if all_silent {
            callback(
                trigger_id.clone(),
                "composite.not_fired".to_string(),
                json!({"silence_seconds": silence.as_secs_f64()}),
            )
            .await;
            // Re-arm relative to now.
            for id in state.sub_ids.clone() {
                state.last_fires.insert(id, now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triggers::watchers::spawn_watcher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn fires(seen: &Arc<Mutex<Vec<serde_json::Value>>>) -> usize {
        seen.lock().unwrap().len()
    }

    fn recording() -> (FireCallback, Arc<Mutex<Vec<serde_json::Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let inner = seen.clone();
        let callback: FireCallback = Arc::new(move |_, _, payload| {
            let inner = inner.clone();
            Box::pin(async move {
                inner.lock().unwrap().push(payload);
            })
        });
        (callback, seen)
    }

    fn sub(id: &str) -> SubFire {
        SubFire {
            sub_trigger_id: id.to_string(),
            event_type: "test".to_string(),
            payload: json!({}),
        }
    }

    fn composite(operator: &str, ids: Vec<&str>, extra: serde_json::Value) -> TriggerCondition {
        let mut raw = json!({
            "type": "composite",
            "operator": operator,
            "trigger_ids": ids,
        });
        if let (Some(target), Some(source)) = (raw.as_object_mut(), extra.as_object()) {
            for (k, v) in source {
                target.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(raw).unwrap()
    }

    #[tokio::test]
    async fn or_fires_on_any_sub_trigger() {
        let (callback, seen) = recording();
        let handle = spawn_watcher("c-or", &composite("OR", vec!["t1", "t2"], json!({})), callback);
        handle.notify_sub_fire(sub("t2"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fires(&seen), 1);
        handle.stop().await;
    }

    #[tokio::test]
    async fn and_requires_all_within_timeout() {
        let (callback, seen) = recording();
        let handle = spawn_watcher(
            "c-and",
            &composite("AND", vec!["t1", "t2"], json!({"timeout_seconds": 5.0})),
            callback,
        );
        handle.notify_sub_fire(sub("t1"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(fires(&seen), 0);
        handle.notify_sub_fire(sub("t2"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(fires(&seen), 1);
        handle.stop().await;
    }

    #[tokio::test]
    async fn seq_requires_declared_order() {
        let (callback, seen) = recording();
        let handle = spawn_watcher(
            "c-seq",
            &composite("SEQ", vec!["t1", "t2"], json!({"timeout_seconds": 5.0})),
            callback,
        );
        // Out of order resets.
        handle.notify_sub_fire(sub("t2"));
        handle.notify_sub_fire(sub("t1"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(fires(&seen), 0);
        // Completing the order fires.
        handle.notify_sub_fire(sub("t2"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(fires(&seen), 1);
        handle.stop().await;
    }

    #[tokio::test]
    async fn window_fires_once_per_crossing_then_rearms() {
        let (callback, seen) = recording();
        let handle = spawn_watcher(
            "c-win",
            &composite(
                "WINDOW",
                vec!["t1"],
                json!({"count": 3, "window_seconds": 10.0}),
            ),
            callback,
        );
        for _ in 0..3 {
            handle.notify_sub_fire(sub("t1"));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fires(&seen), 1, "exactly one fire per threshold crossing");

        // Two more fires are below the threshold after the re-arm.
        handle.notify_sub_fire(sub("t1"));
        handle.notify_sub_fire(sub("t1"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fires(&seen), 1);

        // The third completes a fresh window.
        handle.notify_sub_fire(sub("t1"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fires(&seen), 2);
        handle.stop().await;
    }

    #[tokio::test]
    async fn not_fires_after_silence_and_resets_on_activity() {
        let fired = Arc::new(AtomicUsize::new(0));
        let inner = fired.clone();
        let callback: FireCallback = Arc::new(move |_, _, _| {
            let inner = inner.clone();
            Box::pin(async move {
                inner.fetch_add(1, Ordering::SeqCst);
            })
        });
        let handle = spawn_watcher(
            "c-not",
            &composite("NOT", vec!["t1"], json!({"silence_seconds": 0.1})),
            callback,
        );
        // Activity keeps it quiet.
        handle.notify_sub_fire(sub("t1"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        // Silence crosses the threshold.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(fired.load(Ordering::SeqCst) >= 1);
        handle.stop().await;
    }

    #[tokio::test]
    async fn unknown_sub_triggers_are_ignored() {
        let (callback, seen) = recording();
        let handle = spawn_watcher("c-or2", &composite("OR", vec!["t1"], json!({})), callback);
        handle.notify_sub_fire(sub("stranger"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(fires(&seen), 0);
        handle.stop().await;
    }
}
