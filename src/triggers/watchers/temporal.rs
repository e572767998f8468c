//! Temporal watchers - interval, cron and one-shot.
//!
//! Interval fires wait on the stop token with the interval as timeout, so
//! there is no drift accumulation across fires. Cron computes the next
//! occurrence after every fire and sleeps until then. Once sleeps to an
//! absolute timestamp, fires, and exits.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::Utc;
use croner::Cron;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::triggers::models::TemporalSpec;
use crate::triggers::watchers::FireCallback;

pub fn run(
    trigger_id: String,
    spec: TemporalSpec,
    callback: FireCallback,
    stop: CancellationToken,
) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> {
    match spec {
        TemporalSpec::Interval { interval_seconds } => {
            Box::pin(run_interval(trigger_id, interval_seconds, callback, stop))
        }
        TemporalSpec::Cron { schedule } => {
            Box::pin(run_cron(trigger_id, schedule, callback, stop))
        }
        TemporalSpec::Once { run_at } => {
            Box::pin(run_once(trigger_id, run_at, callback, stop))
        }
    }
}

async fn run_interval(
    trigger_id: String,
    interval_seconds: f64,
    callback: FireCallback,
    stop: CancellationToken,
) -> Result<(), String> {
    if interval_seconds <= 0.0 {
        return Err(format!(
            "interval_seconds must be positive, got {}",
            interval_seconds
        ));
    }
    let interval = Duration::from_secs_f64(interval_seconds);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            _ = tokio::time::sleep(interval) => {}
        }
        callback(
            trigger_id.clone(),
            "temporal.interval".to_string(),
            json!({"interval_seconds": interval_seconds, "fired_at": Utc::now()}),
        )
        .await;
    }
}

async fn run_cron(
    trigger_id: String,
    schedule: String,
    callback: FireCallback,
    stop: CancellationToken,
) -> Result<(), String> {
    let cron = Cron::new(&schedule)
        .with_seconds_optional()
        .parse()
        .map_err(|e| format!("invalid cron expression '{}': {}", schedule, e))?;

    loop {
        let now = Utc::now();
        let next = cron
            .find_next_occurrence(&now, false)
            .map_err(|e| format!("no next occurrence for '{}': {}", schedule, e))?;
        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
        callback(
            trigger_id.clone(),
            "temporal.cron".to_string(),
            json!({"schedule": schedule, "scheduled_at": next, "fired_at": Utc::now()}),
        )
        .await;
    }
}

async fn run_once(
    trigger_id: String,
    run_at: chrono::DateTime<Utc>,
    callback: FireCallback,
    stop: CancellationToken,
) -> Result<(), String> {
    let delay = (run_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    tokio::select! {
        _ = stop.cancelled() => return Ok(()),
        _ = tokio::time::sleep(delay) => {}
    }
    callback(
        trigger_id,
        "temporal.once".to_string(),
        json!({"run_at": run_at, "fired_at": Utc::now()}),
    )
    .await;
    // One fire only; the task exits cleanly.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triggers::watchers::{spawn_watcher, FireCallback};
    use crate::triggers::models::TriggerCondition;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_callback() -> (FireCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        let callback: FireCallback = Arc::new(move |_, _, _| {
            let inner = inner.clone();
            Box::pin(async move {
                inner.fetch_add(1, Ordering::SeqCst);
            })
        });
        (callback, count)
    }

    #[tokio::test]
    async fn interval_watcher_fires_repeatedly() {
        let (callback, count) = counting_callback();
        let condition = TriggerCondition::Temporal {
            spec: TemporalSpec::Interval {
                interval_seconds: 0.02,
            },
        };
        let handle = spawn_watcher("t-int", &condition, callback);
        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.stop().await;
        let fires = count.load(Ordering::SeqCst);
        assert!(fires >= 3, "expected several fires, got {}", fires);
    }

    #[tokio::test]
    async fn once_watcher_fires_exactly_once_then_exits() {
        let (callback, count) = counting_callback();
        let condition = TriggerCondition::Temporal {
            spec: TemporalSpec::Once {
                run_at: Utc::now() + chrono::Duration::milliseconds(20),
            },
        };
        let handle = spawn_watcher("t-once", &condition, callback);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!handle.is_running());
        handle.stop().await;
    }

    #[tokio::test]
    async fn past_timestamp_fires_immediately() {
        let (callback, count) = counting_callback();
        let condition = TriggerCondition::Temporal {
            spec: TemporalSpec::Once {
                run_at: Utc::now() - chrono::Duration::seconds(5),
            },
        };
        let handle = spawn_watcher("t-past", &condition, callback);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        handle.stop().await;
    }

    #[tokio::test]
    async fn bad_cron_expression_records_an_error() {
        let (callback, _count) = counting_callback();
        let condition = TriggerCondition::Temporal {
            spec: TemporalSpec::Cron {
                schedule: "not a cron".to_string(),
            },
        };
        let handle = spawn_watcher("t-cron-bad", &condition, callback);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.error().is_some());
        handle.stop().await;
    }

    #[tokio::test]
    async fn stop_interrupts_a_pending_interval() {
        let (callback, count) = counting_callback();
        let condition = TriggerCondition::Temporal {
            spec: TemporalSpec::Interval {
                interval_seconds: 30.0,
            },
        };
        let handle = spawn_watcher("t-long", &condition, callback);
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
