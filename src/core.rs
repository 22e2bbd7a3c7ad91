use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{ErrorClass, ProviderError};

pub const ASPECT_RATIO: &str = "aspect_ratio";
pub const DURATION_SECONDS: &str = "duration_seconds";
pub const REFERENCE_IMAGE: &str = "reference_image";
pub const VOICE: &str = "voice";
pub const TEMPERATURE: &str = "temperature";
pub const MAX_TOKENS: &str = "max_tokens";
pub const SYSTEM: &str = "system";
pub const STRUCTURED: &str = "structured";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Text,
    Image,
    Video,
    Speech,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Text,
        Capability::Image,
        Capability::Video,
        Capability::Speech,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Text => "text",
            Capability::Image => "image",
            Capability::Video => "video",
            Capability::Speech => "speech",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" => Ok(Capability::Text),
            "image" => Ok(Capability::Image),
            "video" => Ok(Capability::Video),
            "speech" | "audio" | "voice" => Ok(Capability::Speech),
            other => Err(format!("unknown capability '{other}'")),
        }
    }
}

/// A single named request parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Text(String),
    Number(f64),
    Flag(bool),
    Image { data: Vec<u8>, mime: String },
}

/// Immutable description of the output a caller wants.
///
/// Constraints are keyed in a `BTreeMap` so iteration order, and therefore
/// every payload built from the request, is deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub capability: Capability,
    pub prompt: String,
    pub constraints: BTreeMap<String, Constraint>,
    pub preferred_providers: Vec<String>,
}

impl GenerationRequest {
    pub fn new(capability: Capability, prompt: impl Into<String>) -> Self {
        Self {
            capability,
            prompt: prompt.into(),
            constraints: BTreeMap::new(),
            preferred_providers: Vec::new(),
        }
    }

    pub fn with_constraint(mut self, key: impl Into<String>, value: Constraint) -> Self {
        self.constraints.insert(key.into(), value);
        self
    }

    pub fn with_aspect_ratio(self, ratio: impl Into<String>) -> Self {
        self.with_constraint(ASPECT_RATIO, Constraint::Text(ratio.into()))
    }

    pub fn with_duration(self, seconds: u32) -> Self {
        self.with_constraint(DURATION_SECONDS, Constraint::Number(seconds as f64))
    }

    pub fn with_reference_image(self, data: Vec<u8>, mime: impl Into<String>) -> Self {
        self.with_constraint(
            REFERENCE_IMAGE,
            Constraint::Image {
                data,
                mime: mime.into(),
            },
        )
    }

    pub fn with_voice(self, voice: impl Into<String>) -> Self {
        self.with_constraint(VOICE, Constraint::Text(voice.into()))
    }

    pub fn with_temperature(self, temperature: f64) -> Self {
        self.with_constraint(TEMPERATURE, Constraint::Number(temperature))
    }

    pub fn with_system(self, system: impl Into<String>) -> Self {
        self.with_constraint(SYSTEM, Constraint::Text(system.into()))
    }

    pub fn structured(self) -> Self {
        self.with_constraint(STRUCTURED, Constraint::Flag(true))
    }

    pub fn prefer<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preferred_providers = providers.into_iter().map(Into::into).collect();
        self
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.constraints.get(key)? {
            Constraint::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        match self.constraints.get(key)? {
            Constraint::Number(value) if value.is_finite() => Some(*value),
            Constraint::Text(value) => value.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn flag(&self, key: &str) -> bool {
        matches!(self.constraints.get(key), Some(Constraint::Flag(true)))
    }

    pub fn aspect_ratio(&self) -> Option<&str> {
        self.text(ASPECT_RATIO)
    }

    pub fn duration_seconds(&self) -> Option<u32> {
        self.number(DURATION_SECONDS)
            .filter(|value| *value > 0.0)
            .map(|value| value.round() as u32)
    }

    pub fn reference_image(&self) -> Option<(&[u8], &str)> {
        match self.constraints.get(REFERENCE_IMAGE)? {
            Constraint::Image { data, mime } if !data.is_empty() => {
                Some((data.as_slice(), mime.as_str()))
            }
            _ => None,
        }
    }

    pub fn voice(&self) -> Option<&str> {
        self.text(VOICE).filter(|voice| !voice.trim().is_empty())
    }

    pub fn temperature(&self) -> Option<f64> {
        self.number(TEMPERATURE)
    }

    pub fn system(&self) -> Option<&str> {
        self.text(SYSTEM).filter(|system| !system.trim().is_empty())
    }

    pub fn wants_structured(&self) -> bool {
        self.flag(STRUCTURED)
    }

    /// Stable SHA-256 over everything that identifies the request.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.capability.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.prompt.as_bytes());
        for (key, value) in &self.constraints {
            hasher.update([0]);
            hasher.update(key.as_bytes());
            hasher.update([0]);
            match value {
                Constraint::Text(text) => hasher.update(text.as_bytes()),
                Constraint::Number(number) => hasher.update(number.to_le_bytes()),
                Constraint::Flag(flag) => hasher.update([*flag as u8]),
                Constraint::Image { data, mime } => {
                    hasher.update(mime.as_bytes());
                    hasher.update(data);
                }
            }
        }
        for provider in &self.preferred_providers {
            hasher.update([1]);
            hasher.update(provider.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Provider-agnostic generated content.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Structured(serde_json::Value),
    Bytes { data: Vec<u8>, mime: String },
    Uri(String),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Text(_) => "text",
            Payload::Structured(_) => "structured",
            Payload::Bytes { .. } => "bytes",
            Payload::Uri(_) => "uri",
        }
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Structured(value) => value.to_string().len(),
            Payload::Bytes { data, .. } => data.len(),
            Payload::Uri(uri) => uri.len(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_uri(&self) -> Option<&str> {
        match self {
            Payload::Uri(uri) => Some(uri),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes { data, .. } => Some(data),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::TimedOut
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::TimedOut => "TIMED_OUT",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AttemptOutcome {
    Succeeded,
    Failed { class: ErrorClass, message: String },
}

/// One candidate provider tried during an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub provider_id: String,
    pub outcome: AttemptOutcome,
    /// Calls issued for this candidate including retries.
    pub tries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl Attempt {
    pub fn succeeded(provider_id: &str, tries: u32, job_id: Option<String>) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            outcome: AttemptOutcome::Succeeded,
            tries,
            job_id,
        }
    }

    pub fn failed(
        provider_id: &str,
        error: &ProviderError,
        tries: u32,
        job_id: Option<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            outcome: AttemptOutcome::Failed {
                class: error.class(),
                message: error.message().to_string(),
            },
            tries,
            job_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Succeeded)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub success: bool,
    pub payload: Payload,
    pub provider_id: String,
    pub attempts: Vec<Attempt>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_accessors_ignore_mismatched_types() {
        let request = GenerationRequest::new(Capability::Video, "bottle on marble")
            .with_aspect_ratio("9:16")
            .with_constraint(DURATION_SECONDS, Constraint::Text("9".into()))
            .with_constraint(VOICE, Constraint::Number(3.0));
        assert_eq!(request.aspect_ratio(), Some("9:16"));
        assert_eq!(request.duration_seconds(), Some(9));
        assert_eq!(request.voice(), None);
        assert!(request.reference_image().is_none());
        assert!(!request.wants_structured());
    }

    #[test]
    fn fingerprint_is_stable_and_sensitive() {
        let base = GenerationRequest::new(Capability::Image, "oud bottle").with_aspect_ratio("1:1");
        assert_eq!(base.fingerprint(), base.clone().fingerprint());
        assert_eq!(base.fingerprint().len(), 64);
        let other = base.clone().with_aspect_ratio("9:16");
        assert_ne!(base.fingerprint(), other.fingerprint());
        let preferred = base.clone().prefer(["fal-flux"]);
        assert_ne!(base.fingerprint(), preferred.fingerprint());
    }

    #[test]
    fn parses_capability_names() {
        assert_eq!("Image".parse::<Capability>().unwrap(), Capability::Image);
        assert_eq!("voice".parse::<Capability>().unwrap(), Capability::Speech);
        assert!("pdf".parse::<Capability>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::TimedOut.is_terminal());
    }
}
