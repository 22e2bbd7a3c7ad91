use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use time::OffsetDateTime;
use tracing::warn;

use crate::clock::elapsed_between;

#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Requests per window, keyed by provider id. Missing or zero means unlimited.
    pub request_limits: HashMap<String, u32>,
    pub rpm_warn_threshold: f64,
    pub rpm_sleep_threshold: f64,
    pub warn_cooldown: Duration,
    pub max_preemptive_sleep: Duration,
    pub request_window: Duration,
}

impl QuotaConfig {
    pub fn new(request_limits: HashMap<String, u32>) -> Self {
        Self {
            request_limits,
            rpm_warn_threshold: 0.8,
            rpm_sleep_threshold: 0.9,
            warn_cooldown: Duration::from_secs(10),
            max_preemptive_sleep: Duration::from_millis(500),
            request_window: Duration::from_secs(60),
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

#[derive(Default)]
struct QuotaState {
    request_windows: HashMap<String, VecDeque<OffsetDateTime>>,
    last_rpm_warn: HashMap<String, OffsetDateTime>,
}

/// Sliding-window request counter per provider. Shared by every worker of a
/// run so pooled requests see each other's traffic.
#[derive(Clone)]
pub struct QuotaMonitor {
    config: Arc<QuotaConfig>,
    state: Arc<Mutex<QuotaState>>,
}

impl Default for QuotaMonitor {
    fn default() -> Self {
        Self::new(QuotaConfig::default())
    }
}

impl QuotaMonitor {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(QuotaState::default())),
        }
    }

    pub fn limits(&self) -> &HashMap<String, u32> {
        &self.config.request_limits
    }

    /// Counts one request at `now` and returns how long to hold off before
    /// issuing it, if the provider is close to its limit.
    pub fn register_request(&self, provider: &str, now: OffsetDateTime) -> Option<Duration> {
        let per_window = match self.config.request_limits.get(provider) {
            Some(value) if *value > 0 => *value,
            _ => return None,
        };
        let mut state = self.state.lock().unwrap();
        let window = state
            .request_windows
            .entry(provider.to_string())
            .or_default();
        window.push_back(now);
        while let Some(front) = window.front() {
            if elapsed_between(*front, now) > self.config.request_window {
                window.pop_front();
            } else {
                break;
            }
        }
        let utilization = window.len() as f64 / per_window as f64;
        if utilization >= self.config.rpm_warn_threshold {
            let last = state.last_rpm_warn.get(provider).copied();
            let due = last.map_or(true, |at| elapsed_between(at, now) >= self.config.warn_cooldown);
            if due {
                warn!(
                    "provider {} request rate at {:.0}% of limit ({} per {})",
                    provider,
                    utilization * 100.0,
                    per_window,
                    humantime::format_duration(self.config.request_window)
                );
                state.last_rpm_warn.insert(provider.to_string(), now);
            }
        }
        if utilization >= self.config.rpm_sleep_threshold {
            let per_request = self.config.request_window.as_secs_f64() / per_window as f64;
            let sleep = self
                .config
                .max_preemptive_sleep
                .as_secs_f64()
                .min(per_request);
            if sleep > 0.0 {
                return Some(Duration::from_secs_f64(sleep));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(limit: u32) -> QuotaMonitor {
        QuotaMonitor::new(QuotaConfig::new(HashMap::from([("luma".to_string(), limit)])))
    }

    #[test]
    fn unlimited_providers_never_wait() {
        let quota = monitor(2);
        for _ in 0..10 {
            assert_eq!(quota.register_request("veo", OffsetDateTime::UNIX_EPOCH), None);
        }
    }

    #[test]
    fn delays_once_the_window_is_nearly_full() {
        let quota = monitor(10);
        let now = OffsetDateTime::UNIX_EPOCH;
        for _ in 0..8 {
            assert_eq!(quota.register_request("luma", now), None);
        }
        assert_eq!(
            quota.register_request("luma", now),
            Some(Duration::from_millis(500))
        );
    }

    #[test]
    fn old_requests_leave_the_window() {
        let quota = monitor(2);
        let start = OffsetDateTime::UNIX_EPOCH;
        assert_eq!(quota.register_request("luma", start), None);
        assert!(quota.register_request("luma", start).is_some());
        let later = start + Duration::from_secs(120);
        assert_eq!(quota.register_request("luma", later), None);
    }
}
