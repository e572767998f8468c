//! System watchers - filesystem, process and resource conditions.
//!
//! All three are poll-based: each iteration waits on the stop token with
//! the poll interval as timeout, samples, diffs against the previous
//! snapshot and fires on changes. Initial state is seeded without firing so
//! pre-existing files/processes do not produce phantom events.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::triggers::models::{FsEventKind, ProcessEventKind, ResourceMetric};
use crate::triggers::watchers::FireCallback;

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

type FsSnapshot = HashMap<PathBuf, SystemTime>;

fn snapshot(root: &Path, recursive: bool, out: &mut FsSnapshot) {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if recursive {
                snapshot(&path, recursive, out);
            }
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            out.insert(path, modified);
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub fn run_filesystem(
    trigger_id: String,
    path: String,
    recursive: bool,
    events: Vec<FsEventKind>,
    poll_interval_seconds: f64,
    callback: FireCallback,
    stop: CancellationToken,
) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> {
    Box::pin(async move {
        let root = PathBuf::from(&path);
        if !root.exists() {
            return Err(format!("watch path '{}' does not exist", path));
        }
        let wanted: HashSet<FsEventKind> = events.into_iter().collect();
        let poll = Duration::from_secs_f64(poll_interval_seconds.max(0.01));

        let mut previous = FsSnapshot::new();
        snapshot(&root, recursive, &mut previous);

        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = tokio::time::sleep(poll) => {}
            }

            let mut current = FsSnapshot::new();
            snapshot(&root, recursive, &mut current);

            for (file, modified) in &current {
                match previous.get(file) {
                    None if wanted.contains(&FsEventKind::Created) => {
                        fire_fs(&callback, &trigger_id, file, "created", &path).await;
                    }
                    Some(prev) if prev != modified
                        && wanted.contains(&FsEventKind::Modified) =>
                    {
                        fire_fs(&callback, &trigger_id, file, "modified", &path).await;
                    }
                    _ => {}
                }
            }
            if wanted.contains(&FsEventKind::Deleted) {
                for file in previous.keys() {
                    if !current.contains_key(file) {
                        fire_fs(&callback, &trigger_id, file, "deleted", &path).await;
                    }
                }
            }
            previous = current;
        }
    })
}

async fn fire_fs(
    callback: &FireCallback,
    trigger_id: &str,
    file: &Path,
    change: &str,
    watch_root: &str,
) {
    callback(
        trigger_id.to_string(),
        "filesystem.changed".to_string(),
        json!({
            "path": file.display().to_string(),
            "change": change,
            "watch_root": watch_root,
        }),
    )
    .await;
}

// ---------------------------------------------------------------------------
// Process
// ---------------------------------------------------------------------------

/// Name match with a single `*` treated as a glob star.
fn name_matches(pattern: &str, name: &str) -> bool {
    if let Some(star) = pattern.find('*') {
        let (prefix, suffix) = (&pattern[..star], &pattern[star + 1..]);
        name.starts_with(prefix) && name.ends_with(suffix) && name.len() >= prefix.len() + suffix.len()
    } else {
        pattern == name
    }
}

/// Current pids whose command name matches `pattern`, read from /proc.
fn matching_pids(pattern: &str) -> HashSet<u32> {
    let mut pids = HashSet::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return pids;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<u32>().ok())
        else {
            continue;
        };
        let comm_path = entry.path().join("comm");
        if let Ok(name) = std::fs::read_to_string(comm_path) {
            if name_matches(pattern, name.trim()) {
                pids.insert(pid);
            }
        }
    }
    pids
}

pub fn run_process(
    trigger_id: String,
    name: String,
    event: ProcessEventKind,
    poll_interval_seconds: f64,
    callback: FireCallback,
    stop: CancellationToken,
) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> {
    Box::pin(async move {
        let poll = Duration::from_secs_f64(poll_interval_seconds.max(0.01));
        // Seed without firing for processes that already exist.
        let mut known = matching_pids(&name);

        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = tokio::time::sleep(poll) => {}
            }

            let current = matching_pids(&name);
            if event == ProcessEventKind::Started {
                for pid in current.difference(&known) {
                    callback(
                        trigger_id.clone(),
                        "process.started".to_string(),
                        json!({"pid": pid, "name": name, "event": "started"}),
                    )
                    .await;
                }
            } else {
                for pid in known.difference(&current) {
                    callback(
                        trigger_id.clone(),
                        "process.stopped".to_string(),
                        json!({"pid": pid, "name": name, "event": "stopped"}),
                    )
                    .await;
                }
            }
            known = current;
        }
    })
}

// ---------------------------------------------------------------------------
// Resource
// ---------------------------------------------------------------------------

/// Metric sampling indirection so deployments (and tests) can supply their
/// own source. The default probe reads /proc.
#[async_trait]
pub trait MetricProbe: Send + Sync {
    async fn sample(&self, metric: ResourceMetric) -> Option<f64>;
}

pub struct ProcMetricProbe;

#[async_trait]
impl MetricProbe for ProcMetricProbe {
    async fn sample(&self, metric: ResourceMetric) -> Option<f64> {
        match metric {
            ResourceMetric::MemoryPercent => {
                let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
                let field = |key: &str| -> Option<f64> {
                    meminfo
                        .lines()
                        .find(|l| l.starts_with(key))?
                        .split_whitespace()
                        .nth(1)?
                        .parse()
                        .ok()
                };
                let total = field("MemTotal:")?;
                let available = field("MemAvailable:")?;
                if total <= 0.0 {
                    return None;
                }
                Some(((total - available) / total) * 100.0)
            }
            ResourceMetric::CpuPercent => {
                // Two /proc/stat reads a short interval apart.
                let first = read_cpu_totals()?;
                tokio::time::sleep(Duration::from_millis(100)).await;
                let second = read_cpu_totals()?;
                let total = second.0 - first.0;
                let idle = second.1 - first.1;
                if total <= 0.0 {
                    return None;
                }
                Some(((total - idle) / total) * 100.0)
            }
            // Disk usage needs statvfs; deployments supply a probe for it.
            ResourceMetric::DiskPercent => None,
        }
    }
}

fn read_cpu_totals() -> Option<(f64, f64)> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    let line = stat.lines().next()?;
    let fields: Vec<f64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let total: f64 = fields.iter().sum();
    let idle = fields[3];
    Some((total, idle))
}

pub fn default_probe() -> Arc<dyn MetricProbe> {
    Arc::new(ProcMetricProbe)
}

#[allow(clippy::too_many_arguments)]
pub fn run_resource(
    trigger_id: String,
    metric: ResourceMetric,
    threshold: f64,
    duration_seconds: f64,
    poll_interval_seconds: f64,
    probe: Arc<dyn MetricProbe>,
    callback: FireCallback,
    stop: CancellationToken,
) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> {
    Box::pin(async move {
        let poll = Duration::from_secs_f64(poll_interval_seconds.max(0.01));
        let mut above_since: Option<std::time::Instant> = None;

        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = tokio::time::sleep(poll) => {}
            }

            let Some(value) = probe.sample(metric).await else {
                continue;
            };

            if value > threshold {
                let since = *above_since.get_or_insert_with(std::time::Instant::now);
                let held = since.elapsed().as_secs_f64();
                if held >= duration_seconds {
                    callback(
                        trigger_id.clone(),
                        "resource.threshold_exceeded".to_string(),
                        json!({
                            "metric": metric,
                            "value": value,
                            "threshold": threshold,
                            "duration_seconds": held,
                            "fired_at": Utc::now(),
                        }),
                    )
                    .await;
                    // Re-arm: require a fresh continuous breach.
                    above_since = None;
                }
            } else {
                above_since = None;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triggers::models::TriggerCondition;
    use crate::triggers::watchers::spawn_watcher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn recording_callback() -> (FireCallback, Arc<Mutex<Vec<serde_json::Value>>>) {
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

    #[tokio::test]
    async fn filesystem_watcher_sees_create_modify_delete() {
        let dir = tempfile::tempdir().unwrap();
        let (callback, seen) = recording_callback();
        let condition = TriggerCondition::Filesystem {
            path: dir.path().display().to_string(),
            recursive: false,
            events: vec![FsEventKind::Created, FsEventKind::Modified, FsEventKind::Deleted],
            poll_interval_seconds: 0.02,
        };
        let handle = spawn_watcher("t-fs", &condition, callback);

        let file = dir.path().join("watched.txt");
        tokio::time::sleep(Duration::from_millis(60)).await;
        std::fs::write(&file, "one").unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        std::fs::remove_file(&file).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        handle.stop().await;

        let changes: Vec<String> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|p| p["change"].as_str().unwrap().to_string())
            .collect();
        assert!(changes.contains(&"created".to_string()), "saw {:?}", changes);
        assert!(changes.contains(&"deleted".to_string()), "saw {:?}", changes);
    }

    #[tokio::test]
    async fn filesystem_watcher_filters_unwanted_events() {
        let dir = tempfile::tempdir().unwrap();
        let (callback, seen) = recording_callback();
        let condition = TriggerCondition::Filesystem {
            path: dir.path().display().to_string(),
            recursive: false,
            events: vec![FsEventKind::Deleted],
            poll_interval_seconds: 0.02,
        };
        let handle = spawn_watcher("t-fs2", &condition, callback);

        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(dir.path().join("ignored.txt"), "x").unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        handle.stop().await;

        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_watch_path_records_an_error() {
        let (callback, _seen) = recording_callback();
        let condition = TriggerCondition::Filesystem {
            path: "/nonexistent/certainly/missing".to_string(),
            recursive: false,
            events: vec![FsEventKind::Created],
            poll_interval_seconds: 0.02,
        };
        let handle = spawn_watcher("t-fs3", &condition, callback);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.error().is_some());
        handle.stop().await;
    }

    #[test]
    fn name_pattern_star_matches() {
        assert!(name_matches("fire*", "firefox"));
        assert!(name_matches("*fox", "firefox"));
        assert!(name_matches("firefox", "firefox"));
        assert!(!name_matches("chrome", "firefox"));
    }

    struct ScriptedProbe {
        values: Mutex<Vec<f64>>,
    }

    #[async_trait]
    impl MetricProbe for ScriptedProbe {
        async fn sample(&self, _metric: ResourceMetric) -> Option<f64> {
            let mut values = self.values.lock().unwrap();
            if values.is_empty() {
                Some(0.0)
            } else {
                Some(values.remove(0))
            }
        }
    }

    fn counting_callback() -> (FireCallback, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let inner = fired.clone();
        let callback: FireCallback = Arc::new(move |_, _, _| {
            let inner = inner.clone();
            Box::pin(async move {
                inner.fetch_add(1, Ordering::SeqCst);
            })
        });
        (callback, fired)
    }

    #[tokio::test]
    async fn resource_watcher_fires_after_sustained_breach() {
        let (callback, fired) = counting_callback();
        let probe = Arc::new(ScriptedProbe {
            values: Mutex::new(vec![95.0; 40]),
        });
        let stop = CancellationToken::new();
        let task = run_resource(
            "t-res".to_string(),
            ResourceMetric::CpuPercent,
            90.0,
            0.05,
            0.02,
            probe,
            callback,
            stop.clone(),
        );
        let handle = tokio::spawn(task);
        tokio::time::sleep(Duration::from_millis(300)).await;
        stop.cancel();
        let _ = handle.await;
        assert!(fired.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn resource_watcher_resets_when_the_metric_dips() {
        let (callback, fired) = counting_callback();
        // One breach sample, then persistently low: the hold duration is
        // never reached, so no fire.
        let probe = Arc::new(ScriptedProbe {
            values: Mutex::new(vec![95.0]),
        });
        let stop = CancellationToken::new();
        let task = run_resource(
            "t-res2".to_string(),
            ResourceMetric::CpuPercent,
            90.0,
            1.0,
            0.02,
            probe,
            callback,
            stop.clone(),
        );
        let handle = tokio::spawn(task);
        tokio::time::sleep(Duration::from_millis(200)).await;
        stop.cancel();
        let _ = handle.await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
