use std::time::Duration;

use serde_json::{json, Value};

use crate::constants::{OPENAI, OPENAI_KEY, OPENROUTER, OPENROUTER_KEY};
use crate::core::{Capability, GenerationRequest, MAX_TOKENS};
use crate::error::ProviderError;
use crate::normalize::clamp_temperature;
use crate::registry::ProviderDescriptor;
use crate::response::{require_str, text_payload};
use crate::transport::{HttpResponse, ProviderPayload};

use super::{CallContext, Endpoints, ProviderAdapter, Submission};

const DEFAULT_TEMPERATURE: f64 = 0.75;
const DEFAULT_MAX_TOKENS: u32 = 4096;
const TIMEOUT: Duration = Duration::from_secs(90);

/// OpenAI-style `chat/completions` endpoint (OpenRouter, OpenAI and any
/// compatible gateway).
pub struct ChatCompletions {
    descriptor: ProviderDescriptor,
    url: String,
    model: String,
    extra_headers: Vec<(&'static str, &'static str)>,
}

impl ChatCompletions {
    pub fn openrouter(endpoints: &Endpoints) -> Self {
        Self {
            descriptor: ProviderDescriptor::new(OPENROUTER, Capability::Text, true, OPENROUTER_KEY),
            url: endpoints.openrouter_url.clone(),
            model: endpoints.openrouter_model.clone(),
            extra_headers: vec![("X-Title", "studio-relay")],
        }
    }

    pub fn openai(endpoints: &Endpoints) -> Self {
        Self {
            descriptor: ProviderDescriptor::new(OPENAI, Capability::Text, true, OPENAI_KEY),
            url: format!(
                "{}/chat/completions",
                endpoints.openai_base_url.trim_end_matches('/')
            ),
            model: endpoints.openai_model.clone(),
            extra_headers: Vec::new(),
        }
    }
}

impl ProviderAdapter for ChatCompletions {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn build_payload(
        &self,
        request: &GenerationRequest,
        ctx: &CallContext<'_>,
    ) -> Result<ProviderPayload, ProviderError> {
        let mut messages = Vec::new();
        if let Some(system) = request.system() {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let max_tokens = request
            .number(MAX_TOKENS)
            .filter(|n| *n >= 1.0)
            .map(|n| n as u32)
            .unwrap_or(DEFAULT_MAX_TOKENS);
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": max_tokens,
            "temperature": clamp_temperature(request.temperature(), DEFAULT_TEMPERATURE),
        });
        if request.wants_structured() {
            body["response_format"] = json!({"type": "json_object"});
        }

        let mut payload = ProviderPayload::post_json(&self.url, body)
            .bearer(ctx.credential)
            .timeout(TIMEOUT);
        for (name, value) in &self.extra_headers {
            payload = payload.header(name, *value);
        }
        Ok(payload)
    }

    fn parse_response(
        &self,
        request: &GenerationRequest,
        response: &HttpResponse,
    ) -> Result<Submission, ProviderError> {
        let value = response.parse_json()?;
        if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
            return Err(ProviderError::fatal(format!(
                "{} reported an error: {}",
                self.descriptor.id,
                error_message(error)
            )));
        }
        let text = require_str(&value, &["/choices/0/message/content"], "choices[0].message.content")?;
        text_payload(request, text).map(Submission::Ready)
    }
}

fn error_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}
