//! Sliding-window action rate limiter.
//!
//! Windows are kept per `(identity, module.action)` key, where identity is
//! the session (or the trigger) on whose behalf a plan runs. Timestamps
//! older than one hour are pruned on every touch so the maps stay bounded.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::errors::{BridgeError, BridgeResult};

const PRUNE_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimits {
    pub per_minute: Option<u32>,
    pub per_hour: Option<u32>,
}

impl RateLimits {
    pub fn is_unlimited(&self) -> bool {
        self.per_minute.is_none() && self.per_hour.is_none()
    }
}

pub struct ActionRateLimiter {
    limits: RateLimits,
    timestamps: Mutex<HashMap<String, Vec<Instant>>>,
}

impl ActionRateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            timestamps: Mutex::new(HashMap::new()),
        }
    }

    fn window_key(identity: &str, action_key: &str) -> String {
        format!("{}:{}", identity, action_key)
    }

    /// Non-recording check, used at plan admission.
    pub fn check(&self, identity: &str, action_key: &str) -> bool {
        if self.limits.is_unlimited() {
            return true;
        }
        let key = Self::window_key(identity, action_key);
        let mut map = self.timestamps.lock().expect("rate limiter lock poisoned");
        let entries = map.entry(key).or_default();
        prune(entries);
        within_limits(entries, &self.limits)
    }

    /// Check and record one invocation; the recorded timestamp counts
    /// against subsequent calls.
    pub fn check_and_record(&self, identity: &str, action_key: &str) -> BridgeResult<()> {
        if self.limits.is_unlimited() {
            return Ok(());
        }
        let key = Self::window_key(identity, action_key);
        let mut map = self.timestamps.lock().expect("rate limiter lock poisoned");
        let entries = map.entry(key.clone()).or_default();
        prune(entries);

        let now = Instant::now();
        if let Some(limit) = self.limits.per_minute {
            let minute_ago = now - Duration::from_secs(60);
            let recent = entries.iter().filter(|t| **t > minute_ago).count() as u32;
            if recent >= limit {
                return Err(BridgeError::RateLimited {
                    key: action_key.to_string(),
                    limit,
                    window: "minute".to_string(),
                });
            }
        }
        if let Some(limit) = self.limits.per_hour {
            if entries.len() as u32 >= limit {
                return Err(BridgeError::RateLimited {
                    key: action_key.to_string(),
                    limit,
                    window: "hour".to_string(),
                });
            }
        }

        entries.push(now);
        Ok(())
    }

    pub fn reset(&self, identity: &str, action_key: &str) {
        self.timestamps
            .lock()
            .expect("rate limiter lock poisoned")
            .remove(&Self::window_key(identity, action_key));
    }
}

fn prune(entries: &mut Vec<Instant>) {
    let cutoff = Instant::now() - PRUNE_WINDOW;
    entries.retain(|t| *t > cutoff);
}

fn within_limits(entries: &[Instant], limits: &RateLimits) -> bool {
    let now = Instant::now();
    if let Some(limit) = limits.per_minute {
        let minute_ago = now - Duration::from_secs(60);
        if entries.iter().filter(|t| **t > minute_ago).count() as u32 >= limit {
            return false;
        }
    }
    if let Some(limit) = limits.per_hour {
        if entries.len() as u32 >= limit {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_limiter_never_trips() {
        let limiter = ActionRateLimiter::new(RateLimits::default());
        for _ in 0..1000 {
            limiter.check_and_record("s1", "filesystem.read_file").unwrap();
        }
    }

    #[test]
    fn per_minute_limit_trips_on_the_nth_call() {
        let limiter = ActionRateLimiter::new(RateLimits {
            per_minute: Some(3),
            per_hour: None,
        });
        for _ in 0..3 {
            limiter.check_and_record("s1", "os_exec.run_command").unwrap();
        }
        let err = limiter
            .check_and_record("s1", "os_exec.run_command")
            .unwrap_err();
        assert_eq!(err.kind(), "rate_limited");
        assert!(err.to_string().contains("minute"));
    }

    #[test]
    fn identities_have_separate_windows() {
        let limiter = ActionRateLimiter::new(RateLimits {
            per_minute: Some(1),
            per_hour: None,
        });
        limiter.check_and_record("s1", "m.a").unwrap();
        limiter.check_and_record("s2", "m.a").unwrap();
        assert!(!limiter.check("s1", "m.a"));
        assert!(!limiter.check("s2", "m.a"));
        limiter.reset("s1", "m.a");
        assert!(limiter.check("s1", "m.a"));
    }

    #[test]
    fn plain_check_does_not_record() {
        let limiter = ActionRateLimiter::new(RateLimits {
            per_minute: Some(1),
            per_hour: None,
        });
        assert!(limiter.check("s1", "m.a"));
        assert!(limiter.check("s1", "m.a"));
        limiter.check_and_record("s1", "m.a").unwrap();
        assert!(!limiter.check("s1", "m.a"));
    }
}
