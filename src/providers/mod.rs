//! Provider adapters. Each adapter is a pure rule set: it turns a
//! `GenerationRequest` into the exact HTTP payload a provider expects and maps
//! the provider's answers back into the canonical model. Adapters never
//! perform I/O themselves; the dispatcher owns the transport.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::core::{GenerationRequest, JobState, Payload};
use crate::error::ProviderError;
use crate::registry::ProviderDescriptor;
use crate::transport::{HttpResponse, ProviderPayload};

pub mod chat;
pub mod elevenlabs;
pub mod fal;
pub mod gemini;
pub mod luma;
pub mod runway;

/// Per-call inputs that are not part of the request itself.
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    pub credential: &'a str,
    /// Public URL of the request's reference image when an asset sink
    /// published it.
    pub reference_url: Option<&'a str>,
}

impl<'a> CallContext<'a> {
    pub fn new(credential: &'a str) -> Self {
        Self {
            credential,
            reference_url: None,
        }
    }

    pub fn with_reference_url(mut self, url: Option<&'a str>) -> Self {
        self.reference_url = url;
        self
    }
}

/// What a provider handed back for a submitted request.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Final content, already normalized.
    Ready(Payload),
    /// Content lives behind a download URL that still has to be fetched.
    Fetch {
        request: ProviderPayload,
        mime: String,
    },
    /// Long-running job to hand to the tracker.
    Job(String),
}

/// Where a completed job's output can be found.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutput {
    Uri(String),
    /// The status call does not carry the output; `resolve_payload` fetches it.
    Resolve,
}

/// One poll answer in the provider's own vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub struct PollReport {
    pub raw_status: String,
    pub output: Option<JobOutput>,
    pub failure: Option<String>,
}

impl PollReport {
    pub fn status(raw_status: impl Into<String>) -> Self {
        Self {
            raw_status: raw_status.into(),
            output: None,
            failure: None,
        }
    }

    pub fn with_output(mut self, output: JobOutput) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_failure(mut self, failure: impl Into<String>) -> Self {
        self.failure = Some(failure.into());
        self
    }
}

pub trait ProviderAdapter: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;

    /// Builds a fresh payload. Must be deterministic for the same inputs and
    /// must drop constraints the provider does not understand.
    fn build_payload(
        &self,
        request: &GenerationRequest,
        ctx: &CallContext<'_>,
    ) -> Result<ProviderPayload, ProviderError>;

    fn parse_response(
        &self,
        request: &GenerationRequest,
        response: &HttpResponse,
    ) -> Result<Submission, ProviderError>;

    /// Whether the provider can take a reference image by URL, which makes it
    /// worth publishing through the asset sink first.
    fn accepts_reference_url(&self) -> bool {
        false
    }

    fn status_table(&self) -> &'static [(&'static str, JobState)] {
        &[]
    }

    fn poll_payload(
        &self,
        job_id: &str,
        _ctx: &CallContext<'_>,
    ) -> Result<ProviderPayload, ProviderError> {
        Err(ProviderError::fatal(format!(
            "{} cannot poll job {job_id}",
            self.descriptor().id
        )))
    }

    fn parse_poll(&self, _response: &HttpResponse) -> Result<PollReport, ProviderError> {
        Err(ProviderError::fatal(format!(
            "{} does not run asynchronous jobs",
            self.descriptor().id
        )))
    }

    fn resolve_payload(
        &self,
        job_id: &str,
        _ctx: &CallContext<'_>,
    ) -> Result<ProviderPayload, ProviderError> {
        Err(ProviderError::fatal(format!(
            "{} cannot resolve the output of job {job_id}",
            self.descriptor().id
        )))
    }

    /// Extracts the output URI from the `resolve_payload` call.
    fn parse_resolved(&self, _response: &HttpResponse) -> Result<String, ProviderError> {
        Err(ProviderError::parse(format!(
            "{} does not resolve job outputs",
            self.descriptor().id
        )))
    }

    fn download_payload(&self, uri: &str, _ctx: &CallContext<'_>) -> ProviderPayload {
        ProviderPayload::get(uri)
    }
}

/// Maps a raw provider status into the canonical state. Exact matches win,
/// then case-insensitive ones; anything unknown is still running.
pub fn map_status(table: &[(&str, JobState)], raw: &str) -> JobState {
    let raw = raw.trim();
    table
        .iter()
        .find(|(key, _)| *key == raw)
        .or_else(|| table.iter().find(|(key, _)| key.eq_ignore_ascii_case(raw)))
        .map(|(_, state)| *state)
        .unwrap_or(JobState::Running)
}

/// Base URLs and model ids for the built-in adapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub openrouter_url: String,
    pub openrouter_model: String,
    pub openai_base_url: String,
    pub openai_model: String,
    pub gemini_base: String,
    pub gemini_text_model: String,
    pub gemini_imagen_model: String,
    pub gemini_flash_image_model: String,
    pub gemini_tts_model: String,
    pub veo_model: String,
    pub fal_run_base: String,
    pub fal_queue_base: String,
    pub fal_image_model: String,
    pub fal_video_model: String,
    pub luma_base: String,
    pub luma_model: String,
    pub runway_base: String,
    pub runway_model: String,
    pub elevenlabs_base: String,
    pub elevenlabs_model: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            openrouter_url: OPENROUTER_URL.into(),
            openrouter_model: OPENROUTER_MODEL.into(),
            openai_base_url: OPENAI_BASE_URL.into(),
            openai_model: OPENAI_MODEL.into(),
            gemini_base: GEMINI_BASE.into(),
            gemini_text_model: GEMINI_TEXT_MODEL.into(),
            gemini_imagen_model: GEMINI_IMAGEN_MODEL.into(),
            gemini_flash_image_model: GEMINI_FLASH_IMAGE_MODEL.into(),
            gemini_tts_model: GEMINI_TTS_MODEL.into(),
            veo_model: VEO_MODEL.into(),
            fal_run_base: FAL_RUN_BASE.into(),
            fal_queue_base: FAL_QUEUE_BASE.into(),
            fal_image_model: FAL_IMAGE_MODEL.into(),
            fal_video_model: FAL_VIDEO_MODEL.into(),
            luma_base: LUMA_BASE.into(),
            luma_model: LUMA_MODEL.into(),
            runway_base: RUNWAY_BASE.into(),
            runway_model: RUNWAY_MODEL.into(),
            elevenlabs_base: ELEVENLABS_BASE.into(),
            elevenlabs_model: ELEVENLABS_MODEL.into(),
        }
    }
}

/// Every built-in adapter, grouped by capability in default priority order.
pub fn builtin_adapters(endpoints: &Endpoints) -> Vec<Arc<dyn ProviderAdapter>> {
    vec![
        Arc::new(chat::ChatCompletions::openrouter(endpoints)),
        Arc::new(gemini::GeminiText::new(endpoints)),
        Arc::new(chat::ChatCompletions::openai(endpoints)),
        Arc::new(fal::FalImage::new(endpoints)),
        Arc::new(gemini::GeminiImagen::new(endpoints)),
        Arc::new(gemini::GeminiFlashImage::new(endpoints)),
        Arc::new(luma::Luma::new(endpoints)),
        Arc::new(runway::Runway::new(endpoints)),
        Arc::new(fal::FalVideo::new(endpoints)),
        Arc::new(gemini::Veo::new(endpoints)),
        Arc::new(elevenlabs::ElevenLabs::new(endpoints)),
        Arc::new(gemini::GeminiTts::new(endpoints)),
    ]
}
