use std::time::Duration;

use serde_json::json;

use crate::constants::{ELEVENLABS, ELEVENLABS_DEFAULT_VOICE, ELEVENLABS_KEY};
use crate::core::{Capability, GenerationRequest, Payload};
use crate::error::ProviderError;
use crate::registry::ProviderDescriptor;
use crate::transport::{HttpResponse, ProviderPayload};

use super::{CallContext, Endpoints, ProviderAdapter, Submission};

pub struct ElevenLabs {
    descriptor: ProviderDescriptor,
    base: String,
    model: String,
}

impl ElevenLabs {
    pub fn new(endpoints: &Endpoints) -> Self {
        Self {
            descriptor: ProviderDescriptor::new(
                ELEVENLABS,
                Capability::Speech,
                true,
                ELEVENLABS_KEY,
            ),
            base: endpoints.elevenlabs_base.trim_end_matches('/').to_string(),
            model: endpoints.elevenlabs_model.clone(),
        }
    }
}

/// Voice ids are 20 character alphanumeric tokens; prebuilt voice names used
/// by other providers ("Charon") are not.
fn voice_id(request: &GenerationRequest) -> &str {
    request
        .voice()
        .filter(|voice| voice.len() >= 20 && voice.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or(ELEVENLABS_DEFAULT_VOICE)
}

impl ProviderAdapter for ElevenLabs {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn build_payload(
        &self,
        request: &GenerationRequest,
        ctx: &CallContext<'_>,
    ) -> Result<ProviderPayload, ProviderError> {
        let body = json!({
            "text": request.prompt,
            "model_id": self.model,
            "voice_settings": {"stability": 0.5, "similarity_boost": 0.75},
        });
        let url = format!("{}/text-to-speech/{}", self.base, voice_id(request));
        Ok(ProviderPayload::post_json(url, body)
            .header("xi-api-key", ctx.credential)
            .header("Accept", "audio/mpeg")
            .timeout(Duration::from_secs(120)))
    }

    fn parse_response(
        &self,
        _request: &GenerationRequest,
        response: &HttpResponse,
    ) -> Result<Submission, ProviderError> {
        let mime = response.content_type.as_deref().unwrap_or("audio/mpeg");
        if mime.starts_with("application/json") || mime.starts_with("text/") {
            return Err(ProviderError::parse(format!(
                "expected audio, got {mime}: {}",
                response.text_excerpt()
            )));
        }
        if response.body.is_empty() {
            return Err(ProviderError::parse("empty audio body"));
        }
        Ok(Submission::Ready(Payload::Bytes {
            data: response.body.clone(),
            mime: mime.split(';').next().unwrap_or(mime).trim().to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_real_voice_ids_reach_the_url() {
        let adapter = ElevenLabs::new(&Endpoints::default());
        let named = GenerationRequest::new(Capability::Speech, "hi").with_voice("Charon");
        let payload = adapter.build_payload(&named, &CallContext::new("xi")).unwrap();
        assert!(payload.url.ends_with("/text-to-speech/21m00Tcm4TlvDq8ikWAM"));
        assert_eq!(payload.header_value("xi-api-key"), Some("xi"));

        let custom = GenerationRequest::new(Capability::Speech, "hi")
            .with_voice("AZnzlk1XvdvUeBnXmlld");
        let payload = adapter.build_payload(&custom, &CallContext::new("xi")).unwrap();
        assert!(payload.url.ends_with("/text-to-speech/AZnzlk1XvdvUeBnXmlld"));
    }

    #[test]
    fn audio_bodies_become_bytes() {
        let adapter = ElevenLabs::new(&Endpoints::default());
        let request = GenerationRequest::new(Capability::Speech, "hi");
        let audio = HttpResponse::new(200, vec![0xff, 0xfb]).with_content_type("audio/mpeg");
        assert_eq!(
            adapter.parse_response(&request, &audio).unwrap(),
            Submission::Ready(Payload::Bytes {
                data: vec![0xff, 0xfb],
                mime: "audio/mpeg".into()
            })
        );
        let json_body = HttpResponse::new(200, "{}").with_content_type("application/json");
        assert!(adapter.parse_response(&request, &json_body).is_err());
    }
}
