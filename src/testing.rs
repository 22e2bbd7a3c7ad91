//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::{json, Value};

use crate::core::{Capability, GenerationRequest, JobState, Payload};
use crate::error::ProviderError;
use crate::providers::{CallContext, JobOutput, PollReport, ProviderAdapter, Submission};
use crate::normalize::reference_uri;
use crate::registry::ProviderDescriptor;
use crate::response::{decode_base64, first_str};
use crate::transport::{status_error, HttpResponse, ProviderPayload, Transport};

type Scripted = Result<HttpResponse, ProviderError>;

struct Route {
    prefix: String,
    queue: VecDeque<Scripted>,
}

/// Transport answering from per-URL-prefix queues. The longest matching
/// prefix wins and the last queued answer repeats forever.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<Vec<Route>>,
    log: Mutex<Vec<ProviderPayload>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, prefix: &str, answer: Scripted) -> Self {
        {
            let mut routes = self.routes.lock().unwrap();
            match routes.iter_mut().find(|route| route.prefix == prefix) {
                Some(route) => route.queue.push_back(answer),
                None => routes.push(Route {
                    prefix: prefix.to_string(),
                    queue: VecDeque::from([answer]),
                }),
            }
        }
        self
    }

    pub fn respond(self, prefix: &str, response: HttpResponse) -> Self {
        self.push(prefix, Ok(response))
    }

    pub fn respond_json(self, prefix: &str, value: Value) -> Self {
        self.respond(prefix, HttpResponse::json(200, &value))
    }

    pub fn fail(self, prefix: &str, error: ProviderError) -> Self {
        self.push(prefix, Err(error))
    }

    pub fn calls(&self) -> Vec<ProviderPayload> {
        self.log.lock().unwrap().clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.url).collect()
    }

    pub fn calls_to(&self, prefix: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.url.starts_with(prefix))
            .count()
    }
}

impl Transport for ScriptedTransport {
    fn call(&self, request: &ProviderPayload) -> Result<HttpResponse, ProviderError> {
        self.log.lock().unwrap().push(request.clone());
        let mut routes = self.routes.lock().unwrap();
        let route = routes
            .iter_mut()
            .filter(|route| request.url.starts_with(&route.prefix))
            .max_by_key(|route| route.prefix.len())
            .ok_or_else(|| ProviderError::fatal(format!("no scripted answer for {}", request.url)))?;
        let answer = if route.queue.len() > 1 {
            route.queue.pop_front()
        } else {
            route.queue.front().cloned()
        };
        let response =
            answer.unwrap_or_else(|| Err(ProviderError::fatal("scripted queue drained")))?;
        match status_error(&response, &request.url) {
            Some(err) => Err(err),
            None => Ok(response),
        }
    }
}

const FAKE_STATUSES: &[(&str, JobState)] = &[
    ("queued", JobState::Queued),
    ("running", JobState::Running),
    ("done", JobState::Completed),
    ("failed", JobState::Failed),
];

/// Adapter speaking a tiny JSON dialect at `https://fake/{id}`.
///
/// Submit answers: `{"text"}`, `{"bytes", "mime"}`, `{"fetch"}` or `{"job"}`.
/// Poll answers: `{"status", "uri", "reason"}`.
pub struct FakeProvider {
    descriptor: ProviderDescriptor,
    reference_urls: bool,
}

impl FakeProvider {
    fn build(id: &str, capability: Capability, synchronous: bool) -> Self {
        let credential = format!("{}_KEY", id.to_uppercase().replace('-', "_"));
        Self {
            descriptor: ProviderDescriptor::new(id, capability, synchronous, &credential),
            reference_urls: false,
        }
    }

    pub fn sync(id: &str, capability: Capability) -> Self {
        Self::build(id, capability, true)
    }

    pub fn job(id: &str, capability: Capability) -> Self {
        Self::build(id, capability, false)
    }

    pub fn credential(mut self, name: &str) -> Self {
        self.descriptor.credential_requirement = name.to_string();
        self
    }

    pub fn reference_urls(mut self) -> Self {
        self.reference_urls = true;
        self
    }

    pub fn submit_url(id: &str) -> String {
        format!("https://fake/{id}/generate")
    }

    fn base(&self) -> String {
        format!("https://fake/{}", self.descriptor.id)
    }
}

impl ProviderAdapter for FakeProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn build_payload(
        &self,
        request: &GenerationRequest,
        ctx: &CallContext<'_>,
    ) -> Result<ProviderPayload, ProviderError> {
        let body = json!({
            "prompt": request.prompt,
            "aspect": request.aspect_ratio(),
            "reference": reference_uri(request, ctx),
        });
        Ok(ProviderPayload::post_json(Self::submit_url(&self.descriptor.id), body)
            .bearer(ctx.credential))
    }

    fn parse_response(
        &self,
        _request: &GenerationRequest,
        response: &HttpResponse,
    ) -> Result<Submission, ProviderError> {
        let value = response.parse_json()?;
        if let Some(text) = first_str(&value, &["/text"]) {
            return Ok(Submission::Ready(Payload::Text(text.to_string())));
        }
        if let Some(bytes) = first_str(&value, &["/bytes"]) {
            return Ok(Submission::Ready(Payload::Bytes {
                data: decode_base64(bytes)?,
                mime: first_str(&value, &["/mime"]).unwrap_or("image/png").to_string(),
            }));
        }
        if let Some(url) = first_str(&value, &["/fetch"]) {
            return Ok(Submission::Fetch {
                request: ProviderPayload::get(url),
                mime: "image/png".to_string(),
            });
        }
        if let Some(job) = first_str(&value, &["/job"]) {
            return Ok(Submission::Job(job.to_string()));
        }
        Err(ProviderError::parse("fake response has no known field"))
    }

    fn accepts_reference_url(&self) -> bool {
        self.reference_urls
    }

    fn status_table(&self) -> &'static [(&'static str, JobState)] {
        FAKE_STATUSES
    }

    fn poll_payload(
        &self,
        job_id: &str,
        ctx: &CallContext<'_>,
    ) -> Result<ProviderPayload, ProviderError> {
        Ok(ProviderPayload::get(format!("{}/jobs/{job_id}", self.base())).bearer(ctx.credential))
    }

    fn parse_poll(&self, response: &HttpResponse) -> Result<PollReport, ProviderError> {
        let value = response.parse_json()?;
        let mut report = PollReport::status(first_str(&value, &["/status"]).unwrap_or(""));
        if let Some(uri) = first_str(&value, &["/uri"]) {
            report = report.with_output(JobOutput::Uri(uri.to_string()));
        }
        if let Some(reason) = first_str(&value, &["/reason"]) {
            report = report.with_failure(reason);
        }
        Ok(report)
    }
}
