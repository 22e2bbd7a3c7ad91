use crate::core::Capability;
use crate::error::ErrorClass;
use crate::utils::ensure_dir;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

/// One outbound provider call.
#[derive(Debug, Clone, Serialize)]
pub struct RequestEvent {
    pub provider: String,
    pub capability: Capability,
    /// `submit`, `poll`, `fetch`, `download` or `upload`.
    pub phase: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub error: Option<ErrorClass>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RequestEvent {
    pub fn duration_seconds(&self) -> f64 {
        (self.finished_at - self.started_at)
            .as_seconds_f64()
            .max(0.0)
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Default, Serialize)]
pub struct RunSummary {
    pub total_requests: usize,
    pub failed_requests: usize,
    pub total_duration_seconds: f64,
    pub by_provider: HashMap<String, SummaryBucket>,
    pub by_capability: HashMap<String, SummaryBucket>,
}

#[derive(Debug, Default, Serialize)]
pub struct SummaryBucket {
    pub requests: usize,
    pub failures: usize,
    pub total_duration_seconds: f64,
}

/// Shared per-run record of provider calls and notable events (retries,
/// fallbacks, swallowed failures). Cheap to clone across workers.
#[derive(Clone)]
pub struct RunMonitor {
    inner: Arc<Mutex<RunState>>,
}

impl Default for RunMonitor {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RunState::default())),
        }
    }
}

#[derive(Default)]
struct RunState {
    events: Vec<RequestEvent>,
    notes: Vec<Note>,
    first_started: Option<OffsetDateTime>,
    last_finished: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Note {
    pub name: String,
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl RunMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: RequestEvent) {
        let mut state = self.inner.lock().unwrap();
        if state
            .first_started
            .map_or(true, |first| event.started_at < first)
        {
            state.first_started = Some(event.started_at);
        }
        if state
            .last_finished
            .map_or(true, |last| event.finished_at > last)
        {
            state.last_finished = Some(event.finished_at);
        }
        state.events.push(event);
    }

    pub fn note_event(&self, name: &str, payload: serde_json::Value) {
        let mut state = self.inner.lock().unwrap();
        state.notes.push(Note {
            name: name.to_string(),
            payload,
            timestamp: OffsetDateTime::now_utc(),
        });
    }

    pub fn events(&self) -> Vec<RequestEvent> {
        self.inner.lock().unwrap().events.clone()
    }

    pub fn notes(&self) -> Vec<Note> {
        self.inner.lock().unwrap().notes.clone()
    }

    pub fn notes_named(&self, name: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .notes
            .iter()
            .filter(|note| note.name == name)
            .count()
    }

    pub fn summarize(&self) -> RunSummary {
        let state = self.inner.lock().unwrap();
        let mut summary = RunSummary {
            total_requests: state.events.len(),
            ..RunSummary::default()
        };
        for event in &state.events {
            let failed = !event.succeeded();
            if failed {
                summary.failed_requests += 1;
            }
            summary.total_duration_seconds += event.duration_seconds();
            update_bucket(
                summary.by_provider.entry(event.provider.clone()).or_default(),
                failed,
                event.duration_seconds(),
            );
            update_bucket(
                summary
                    .by_capability
                    .entry(event.capability.to_string())
                    .or_default(),
                failed,
                event.duration_seconds(),
            );
        }
        summary
    }

    /// Writes the pretty JSON summary to `to` and, when asked, one NDJSON line
    /// per provider call.
    pub fn flush_summary(
        &self,
        to: &Path,
        label: &str,
        files: &[PathBuf],
        limits: &HashMap<String, u32>,
        ndjson: Option<&Path>,
    ) -> anyhow::Result<()> {
        if let Some(parent) = to.parent() {
            ensure_dir(parent)?;
        }
        let summary = self.summarize();
        let events = self.events();
        let state = self.inner.lock().unwrap();
        let start = state.first_started.and_then(|t| t.format(&Rfc3339).ok());
        let end = state.last_finished.and_then(|t| t.format(&Rfc3339).ok());
        let elapsed = match (state.first_started, state.last_finished) {
            (Some(s), Some(f)) => (f - s).max(Duration::ZERO).as_seconds_f64(),
            _ => 0.0,
        };

        let payload = json!({
            "run": label,
            "totals": {
                "requests": summary.total_requests,
                "failed": summary.failed_requests,
                "duration_sec": summary.total_duration_seconds,
            },
            "by_provider": summary.by_provider,
            "by_capability": summary.by_capability,
            "time": {
                "start": start,
                "end": end,
                "elapsed_sec": elapsed,
            },
            "limits": limits,
            "files": files.iter().map(|p| p.to_string_lossy().to_string()).collect::<Vec<_>>(),
            "notes": state.notes.clone(),
        });

        let mut file = File::create(to)?;
        file.write_all(serde_json::to_string_pretty(&payload)?.as_bytes())?;

        if let Some(ndjson_path) = ndjson {
            if let Some(parent) = ndjson_path.parent() {
                ensure_dir(parent)?;
            }
            let mut ndjson_file = File::create(ndjson_path)?;
            for event in events {
                let line = json!({
                    "provider": event.provider,
                    "capability": event.capability,
                    "phase": event.phase,
                    "start_utc": event.started_at.format(&Rfc3339).ok(),
                    "end_utc": event.finished_at.format(&Rfc3339).ok(),
                    "latency_ms": (event.duration_seconds() * 1000.0).round() as i64,
                    "error": event.error,
                    "status": event.metadata.get("status"),
                    "job_id": event.metadata.get("job_id"),
                });
                ndjson_file.write_all(serde_json::to_string(&line)?.as_bytes())?;
                ndjson_file.write_all(b"\n")?;
            }
        }
        Ok(())
    }
}

fn update_bucket(bucket: &mut SummaryBucket, failed: bool, duration: f64) {
    bucket.requests += 1;
    if failed {
        bucket.failures += 1;
    }
    bucket.total_duration_seconds += duration;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(provider: &str, capability: Capability, secs: i64, error: Option<ErrorClass>) -> RequestEvent {
        let start = OffsetDateTime::UNIX_EPOCH;
        RequestEvent {
            provider: provider.to_string(),
            capability,
            phase: "submit".to_string(),
            started_at: start,
            finished_at: start + Duration::seconds(secs),
            error,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn summary_groups_by_provider_and_capability() {
        let monitor = RunMonitor::new();
        monitor.record(event("luma", Capability::Video, 4, Some(ErrorClass::Transient)));
        monitor.record(event("luma", Capability::Video, 2, None));
        monitor.record(event("openrouter", Capability::Text, 1, None));
        let summary = monitor.summarize();
        assert_eq!(summary.total_requests, 3);
        assert_eq!(summary.failed_requests, 1);
        assert_eq!(summary.by_provider["luma"].requests, 2);
        assert_eq!(summary.by_provider["luma"].failures, 1);
        assert_eq!(summary.by_capability["text"].total_duration_seconds, 1.0);
    }

    #[test]
    fn flushes_json_and_ndjson() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = RunMonitor::new();
        monitor.record(event("fal-flux", Capability::Image, 3, None));
        monitor.note_event("fallback", json!({"from": "fal-flux"}));
        let summary_path = dir.path().join("run").join("summary.json");
        let events_path = dir.path().join("run").join("events.ndjson");
        monitor
            .flush_summary(&summary_path, "campaign", &[], &HashMap::new(), Some(&events_path))
            .unwrap();
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&summary_path).unwrap()).unwrap();
        assert_eq!(written["totals"]["requests"], 1);
        assert_eq!(written["notes"][0]["name"], "fallback");
        let lines = std::fs::read_to_string(&events_path).unwrap();
        assert_eq!(lines.lines().count(), 1);
        assert!(lines.contains("\"latency_ms\":3000"));
    }
}
