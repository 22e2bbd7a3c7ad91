use std::time::Duration;

use serde_json::{json, Value};
use url::Url;

use crate::constants::{
    GEMINI_DEFAULT_VOICE, GEMINI_FLASH_IMAGE, GEMINI_IMAGEN, GEMINI_KEY, GEMINI_TEXT, GEMINI_TTS,
    VEO,
};
use crate::core::{Capability, GenerationRequest, JobState, Payload, MAX_TOKENS};
use crate::error::ProviderError;
use crate::normalize::{clamp_temperature, encode_inline, pick_duration, LookupTable};
use crate::registry::ProviderDescriptor;
use crate::response::{decode_base64, first_str, pcm_rate, pcm_to_wav, text_payload, DEFAULT_PCM_RATE};
use crate::transport::{HttpResponse, ProviderPayload};

use super::{CallContext, Endpoints, JobOutput, PollReport, ProviderAdapter, Submission};

const API_KEY_HEADER: &str = "x-goog-api-key";
const GENERATE_TIMEOUT: Duration = Duration::from_secs(60);
const MEDIA_TIMEOUT: Duration = Duration::from_secs(120);
const POLL_TIMEOUT: Duration = Duration::from_secs(20);

const IMAGEN_ASPECTS: LookupTable = LookupTable::new(
    &[
        ("1:1", "1:1"),
        ("9:16", "9:16"),
        ("16:9", "16:9"),
        ("2:3", "3:4"),
        ("3:4", "3:4"),
        ("4:3", "4:3"),
    ],
    "1:1",
);

const VEO_ASPECTS: LookupTable =
    LookupTable::new(&[("9:16", "9:16"), ("16:9", "16:9")], "9:16");
const VEO_DURATIONS: &[u32] = &[4, 6, 8];
const VEO_DEFAULT_DURATION: u32 = 8;

const VEO_STATUSES: &[(&str, JobState)] = &[
    ("processing", JobState::Running),
    ("done", JobState::Completed),
    ("failed", JobState::Failed),
];

fn model_url(base: &str, model: &str, method: &str) -> String {
    format!("{}/models/{model}:{method}", base.trim_end_matches('/'))
}

fn post(url: String, body: Value, key: &str, timeout: Duration) -> ProviderPayload {
    ProviderPayload::post_json(url, body)
        .header(API_KEY_HEADER, key)
        .timeout(timeout)
}

/// Gemini can answer 200 with an `error` object; that is never retryable.
fn reject_error_body(provider: &str, value: &Value) -> Result<(), ProviderError> {
    match value.get("error").filter(|e| !e.is_null()) {
        Some(error) => Err(ProviderError::fatal(format!(
            "{provider} reported error {}: {}",
            error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
        ))),
        None => Ok(()),
    }
}

fn candidate_parts(value: &Value) -> &[Value] {
    value
        .get("candidates")
        .and_then(|candidates| candidates.as_array())
        .and_then(|array| array.first())
        .and_then(|cand| cand.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(|parts| parts.as_array())
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// First inline blob whose MIME type starts with `prefix`.
fn inline_blob<'a>(value: &'a Value, prefix: &str) -> Option<(&'a str, &'a str)> {
    candidate_parts(value).iter().find_map(|part| {
        let inline = part.get("inlineData").or_else(|| part.get("inline_data"))?;
        let mime = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(Value::as_str)
            .unwrap_or("");
        let data = inline.get("data").and_then(Value::as_str)?;
        mime.starts_with(prefix).then_some((data, mime))
    })
}

pub struct GeminiText {
    descriptor: ProviderDescriptor,
    url: String,
}

impl GeminiText {
    pub fn new(endpoints: &Endpoints) -> Self {
        Self {
            descriptor: ProviderDescriptor::new(GEMINI_TEXT, Capability::Text, true, GEMINI_KEY),
            url: model_url(
                &endpoints.gemini_base,
                &endpoints.gemini_text_model,
                "generateContent",
            ),
        }
    }
}

impl ProviderAdapter for GeminiText {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn build_payload(
        &self,
        request: &GenerationRequest,
        ctx: &CallContext<'_>,
    ) -> Result<ProviderPayload, ProviderError> {
        let max_tokens = request
            .number(MAX_TOKENS)
            .filter(|n| *n >= 1.0)
            .map(|n| n as u32)
            .unwrap_or(8192);
        let mut generation = json!({
            "temperature": clamp_temperature(request.temperature(), 0.7),
            "maxOutputTokens": max_tokens,
        });
        if request.wants_structured() {
            generation["responseMimeType"] = json!("application/json");
        }
        let mut parts = Vec::new();
        if let Some((data, mime)) = request.reference_image() {
            parts.push(json!({
                "inline_data": {"mime_type": mime, "data": encode_inline(data)}
            }));
        }
        parts.push(json!({"text": request.prompt}));
        let mut body = json!({
            "contents": [{"role": "user", "parts": parts}],
            "generationConfig": generation,
        });
        if let Some(system) = request.system() {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        Ok(post(self.url.clone(), body, ctx.credential, GENERATE_TIMEOUT))
    }

    fn parse_response(
        &self,
        request: &GenerationRequest,
        response: &HttpResponse,
    ) -> Result<Submission, ProviderError> {
        let value = response.parse_json()?;
        reject_error_body(&self.descriptor.id, &value)?;
        let text = candidate_parts(&value)
            .iter()
            .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n");
        text_payload(request, &text).map(Submission::Ready)
    }
}

pub struct GeminiImagen {
    descriptor: ProviderDescriptor,
    url: String,
}

impl GeminiImagen {
    pub fn new(endpoints: &Endpoints) -> Self {
        Self {
            descriptor: ProviderDescriptor::new(GEMINI_IMAGEN, Capability::Image, true, GEMINI_KEY),
            url: model_url(&endpoints.gemini_base, &endpoints.gemini_imagen_model, "predict"),
        }
    }
}

impl ProviderAdapter for GeminiImagen {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn build_payload(
        &self,
        request: &GenerationRequest,
        ctx: &CallContext<'_>,
    ) -> Result<ProviderPayload, ProviderError> {
        let body = json!({
            "instances": [{"prompt": request.prompt}],
            "parameters": {
                "sampleCount": 1,
                "aspectRatio": IMAGEN_ASPECTS.translate(request.aspect_ratio()),
                "personGeneration": "allow_all",
                "safetyFilterLevel": "block_some",
            }
        });
        Ok(post(self.url.clone(), body, ctx.credential, MEDIA_TIMEOUT))
    }

    fn parse_response(
        &self,
        _request: &GenerationRequest,
        response: &HttpResponse,
    ) -> Result<Submission, ProviderError> {
        let value = response.parse_json()?;
        reject_error_body(&self.descriptor.id, &value)?;
        let encoded = first_str(&value, &["/predictions/0/bytesBase64Encoded"])
            .ok_or_else(|| ProviderError::parse("imagen returned no predictions"))?;
        let mime = first_str(&value, &["/predictions/0/mimeType"]).unwrap_or("image/png");
        Ok(Submission::Ready(Payload::Bytes {
            data: decode_base64(encoded)?,
            mime: mime.to_string(),
        }))
    }
}

pub struct GeminiFlashImage {
    descriptor: ProviderDescriptor,
    url: String,
}

impl GeminiFlashImage {
    pub fn new(endpoints: &Endpoints) -> Self {
        Self {
            descriptor: ProviderDescriptor::new(
                GEMINI_FLASH_IMAGE,
                Capability::Image,
                true,
                GEMINI_KEY,
            ),
            url: model_url(
                &endpoints.gemini_base,
                &endpoints.gemini_flash_image_model,
                "generateContent",
            ),
        }
    }
}

impl ProviderAdapter for GeminiFlashImage {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn build_payload(
        &self,
        request: &GenerationRequest,
        ctx: &CallContext<'_>,
    ) -> Result<ProviderPayload, ProviderError> {
        let mut parts = Vec::new();
        if let Some((data, mime)) = request.reference_image() {
            parts.push(json!({
                "inline_data": {"mime_type": mime, "data": encode_inline(data)}
            }));
        }
        let mut instruction = format!("Generate this image: {}", request.prompt);
        if let Some(aspect) = request.aspect_ratio() {
            instruction.push_str(&format!(" Aspect ratio {aspect}."));
        }
        parts.push(json!({"text": instruction}));
        let body = json!({
            "contents": [{"role": "user", "parts": parts}],
            "generationConfig": {"responseModalities": ["IMAGE", "TEXT"]},
        });
        Ok(post(self.url.clone(), body, ctx.credential, MEDIA_TIMEOUT))
    }

    fn parse_response(
        &self,
        _request: &GenerationRequest,
        response: &HttpResponse,
    ) -> Result<Submission, ProviderError> {
        let value = response.parse_json()?;
        reject_error_body(&self.descriptor.id, &value)?;
        let (data, mime) = inline_blob(&value, "image")
            .ok_or_else(|| ProviderError::parse("response carried no inline image"))?;
        Ok(Submission::Ready(Payload::Bytes {
            data: decode_base64(data)?,
            mime: mime.to_string(),
        }))
    }
}

pub struct GeminiTts {
    descriptor: ProviderDescriptor,
    url: String,
}

impl GeminiTts {
    pub fn new(endpoints: &Endpoints) -> Self {
        Self {
            descriptor: ProviderDescriptor::new(GEMINI_TTS, Capability::Speech, true, GEMINI_KEY),
            url: model_url(
                &endpoints.gemini_base,
                &endpoints.gemini_tts_model,
                "generateContent",
            ),
        }
    }
}

impl ProviderAdapter for GeminiTts {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn build_payload(
        &self,
        request: &GenerationRequest,
        ctx: &CallContext<'_>,
    ) -> Result<ProviderPayload, ProviderError> {
        // ElevenLabs voice ids are 20 alphanumerics; those mean nothing here.
        let voice = request
            .voice()
            .filter(|voice| voice.len() < 20)
            .unwrap_or(GEMINI_DEFAULT_VOICE);
        let body = json!({
            "contents": [{"parts": [{"text": request.prompt}]}],
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {"prebuiltVoiceConfig": {"voiceName": voice}}
                }
            }
        });
        Ok(post(self.url.clone(), body, ctx.credential, GENERATE_TIMEOUT))
    }

    fn parse_response(
        &self,
        _request: &GenerationRequest,
        response: &HttpResponse,
    ) -> Result<Submission, ProviderError> {
        let value = response.parse_json()?;
        reject_error_body(&self.descriptor.id, &value)?;
        let (data, mime) = inline_blob(&value, "audio")
            .or_else(|| inline_blob(&value, ""))
            .ok_or_else(|| ProviderError::parse("response carried no inline audio"))?;
        let audio = decode_base64(data)?;
        let lowered = mime.to_ascii_lowercase();
        if lowered.contains("l16") || lowered.contains("pcm") || lowered.is_empty() {
            let rate = pcm_rate(mime).unwrap_or(DEFAULT_PCM_RATE);
            return Ok(Submission::Ready(Payload::Bytes {
                data: pcm_to_wav(&audio, rate, 1, 16),
                mime: "audio/wav".to_string(),
            }));
        }
        Ok(Submission::Ready(Payload::Bytes {
            data: audio,
            mime: mime.to_string(),
        }))
    }
}

/// Veo long-running video operations.
pub struct Veo {
    descriptor: ProviderDescriptor,
    base: String,
    url: String,
}

impl Veo {
    pub fn new(endpoints: &Endpoints) -> Self {
        Self {
            descriptor: ProviderDescriptor::new(VEO, Capability::Video, false, GEMINI_KEY),
            base: endpoints.gemini_base.trim_end_matches('/').to_string(),
            url: model_url(
                &endpoints.gemini_base,
                &endpoints.veo_model,
                "predictLongRunning",
            ),
        }
    }
}

impl ProviderAdapter for Veo {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn build_payload(
        &self,
        request: &GenerationRequest,
        ctx: &CallContext<'_>,
    ) -> Result<ProviderPayload, ProviderError> {
        let mut instance = json!({"prompt": request.prompt});
        if let Some((data, mime)) = request.reference_image() {
            instance["image"] = json!({
                "bytesBase64Encoded": encode_inline(data),
                "mimeType": mime,
            });
        }
        let body = json!({
            "instances": [instance],
            "parameters": {
                "aspectRatio": VEO_ASPECTS.translate(request.aspect_ratio()),
                "durationSeconds": pick_duration(
                    request.duration_seconds(),
                    VEO_DURATIONS,
                    VEO_DEFAULT_DURATION,
                ),
                "generateAudio": true,
                "numberOfVideos": 1,
            }
        });
        Ok(post(self.url.clone(), body, ctx.credential, Duration::from_secs(30)))
    }

    fn parse_response(
        &self,
        _request: &GenerationRequest,
        response: &HttpResponse,
    ) -> Result<Submission, ProviderError> {
        let value = response.parse_json()?;
        reject_error_body(&self.descriptor.id, &value)?;
        first_str(&value, &["/name"])
            .map(|name| Submission::Job(name.to_string()))
            .ok_or_else(|| ProviderError::parse("operation name missing from response"))
    }

    fn status_table(&self) -> &'static [(&'static str, JobState)] {
        VEO_STATUSES
    }

    fn poll_payload(
        &self,
        job_id: &str,
        ctx: &CallContext<'_>,
    ) -> Result<ProviderPayload, ProviderError> {
        Ok(ProviderPayload::get(format!("{}/{}", self.base, job_id.trim_start_matches('/')))
            .header(API_KEY_HEADER, ctx.credential)
            .timeout(POLL_TIMEOUT))
    }

    /// Operations only expose `done`; the raw status is synthesized from it.
    fn parse_poll(&self, response: &HttpResponse) -> Result<PollReport, ProviderError> {
        let value = response.parse_json()?;
        if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("operation failed");
            return Ok(PollReport::status("failed").with_failure(message));
        }
        if !value.get("done").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(PollReport::status("processing"));
        }
        let uri = first_str(
            &value,
            &[
                "/response/generateVideoResponse/generatedSamples/0/video/uri",
                "/response/generatedSamples/0/video/uri",
                "/response/generatedVideos/0/video/uri",
                "/response/generatedSamples/0/videoUri",
                "/response/generatedSamples/0/uri",
            ],
        );
        Ok(match uri {
            Some(uri) => PollReport::status("done").with_output(JobOutput::Uri(uri.to_string())),
            None => PollReport::status("failed").with_failure("operation finished without a video"),
        })
    }

    fn download_payload(&self, uri: &str, ctx: &CallContext<'_>) -> ProviderPayload {
        ProviderPayload::get(authorized_file_url(uri, ctx.credential)).timeout(MEDIA_TIMEOUT)
    }
}

/// Generated Gemini files need the key and `alt=media` to stream content.
pub fn authorized_file_url(uri: &str, key: &str) -> String {
    if !uri.contains("generativelanguage.googleapis.com") {
        return uri.to_string();
    }
    match Url::parse(uri) {
        Ok(mut url) => {
            url.query_pairs_mut()
                .append_pair("key", key)
                .append_pair("alt", "media");
            url.to_string()
        }
        Err(_) => uri.to_string(),
    }
}
