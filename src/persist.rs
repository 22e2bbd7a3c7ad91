use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::core::{Attempt, Capability, GenerationRequest, GenerationResult, Payload};
use crate::utils::ensure_dir;

/// Metadata kept for one successful generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub fingerprint: String,
    pub capability: Capability,
    pub prompt: String,
    pub provider_id: String,
    pub payload_kind: String,
    /// URI for URI payloads, the text itself for text, absent for bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_ref: Option<String>,
    pub payload_bytes: usize,
    pub attempts: Vec<Attempt>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl GenerationRecord {
    pub fn from_result(
        request: &GenerationRequest,
        result: &GenerationResult,
        created_at: OffsetDateTime,
    ) -> Self {
        let payload_ref = match &result.payload {
            Payload::Uri(uri) => Some(uri.clone()),
            Payload::Text(text) => Some(text.clone()),
            Payload::Structured(value) => Some(value.to_string()),
            Payload::Bytes { .. } => None,
        };
        Self {
            fingerprint: request.fingerprint(),
            capability: request.capability,
            prompt: request.prompt.clone(),
            provider_id: result.provider_id.clone(),
            payload_kind: result.payload.kind().to_string(),
            payload_ref,
            payload_bytes: result.payload.size_bytes(),
            attempts: result.attempts.clone(),
            created_at,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub capability: Option<Capability>,
    pub provider_id: Option<String>,
    pub fingerprint: Option<String>,
    pub limit: Option<usize>,
}

impl RecordQuery {
    pub fn matches(&self, record: &GenerationRecord) -> bool {
        self.capability.map_or(true, |cap| record.capability == cap)
            && self
                .provider_id
                .as_deref()
                .map_or(true, |id| record.provider_id == id)
            && self
                .fingerprint
                .as_deref()
                .map_or(true, |fp| record.fingerprint == fp)
    }
}

/// Insert/query store for completed generations.
pub trait Persistence: Send + Sync {
    fn insert(&self, record: &GenerationRecord) -> Result<()>;
    /// Newest first.
    fn query(&self, query: &RecordQuery) -> Result<Vec<GenerationRecord>>;
}

fn newest_first(mut records: Vec<GenerationRecord>, query: &RecordQuery) -> Vec<GenerationRecord> {
    records.retain(|record| query.matches(record));
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    if let Some(limit) = query.limit {
        records.truncate(limit);
    }
    records
}

/// Append-only JSON lines file.
pub struct JsonlStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Persistence for JsonlStore {
    fn insert(&self, record: &GenerationRecord) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                ensure_dir(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn query(&self, query: &RecordQuery) -> Result<Vec<GenerationRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file =
            File::open(&self.path).with_context(|| format!("reading {}", self.path.display()))?;
        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: GenerationRecord = serde_json::from_str(&line).with_context(|| {
                format!("parsing {} line {}", self.path.display(), index + 1)
            })?;
            records.push(record);
        }
        Ok(newest_first(records, query))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<GenerationRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Persistence for MemoryStore {
    fn insert(&self, record: &GenerationRecord) -> Result<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    fn query(&self, query: &RecordQuery) -> Result<Vec<GenerationRecord>> {
        Ok(newest_first(self.records.lock().unwrap().clone(), query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(capability: Capability, provider: &str, minutes: u64) -> GenerationRecord {
        let request = GenerationRequest::new(capability, format!("prompt {minutes}"));
        let result = GenerationResult {
            success: true,
            payload: Payload::Uri(format!("https://cdn.test/{minutes}.mp4")),
            provider_id: provider.to_string(),
            attempts: vec![Attempt::succeeded(provider, 1, None)],
        };
        GenerationRecord::from_result(
            &request,
            &result,
            OffsetDateTime::UNIX_EPOCH + Duration::from_secs(minutes * 60),
        )
    }

    #[test]
    fn jsonl_store_round_trips_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::new(dir.path().join("history").join("generations.jsonl"));
        assert!(store.query(&RecordQuery::default()).unwrap().is_empty());

        store.insert(&record(Capability::Video, "luma", 1)).unwrap();
        store.insert(&record(Capability::Image, "fal-flux", 2)).unwrap();
        store.insert(&record(Capability::Video, "veo", 3)).unwrap();

        let videos = store
            .query(&RecordQuery {
                capability: Some(Capability::Video),
                ..RecordQuery::default()
            })
            .unwrap();
        assert_eq!(
            videos.iter().map(|r| r.provider_id.as_str()).collect::<Vec<_>>(),
            vec!["veo", "luma"]
        );
        assert_eq!(videos[1].payload_ref.as_deref(), Some("https://cdn.test/1.mp4"));

        let latest = store
            .query(&RecordQuery {
                limit: Some(1),
                ..RecordQuery::default()
            })
            .unwrap();
        assert_eq!(latest[0].provider_id, "veo");
    }

    #[test]
    fn corrupt_lines_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{not json}\n").unwrap();
        let err = JsonlStore::new(&path)
            .query(&RecordQuery::default())
            .unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }
}
