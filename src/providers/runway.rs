use std::time::Duration;

use serde_json::json;

use crate::constants::{RUNWAY, RUNWAY_API_VERSION, RUNWAY_KEY};
use crate::core::{Capability, GenerationRequest, JobState};
use crate::error::ProviderError;
use crate::normalize::{data_uri, pick_duration, LookupTable};
use crate::registry::ProviderDescriptor;
use crate::response::{first_str, require_str};
use crate::transport::{HttpResponse, ProviderPayload};

use super::{CallContext, Endpoints, JobOutput, PollReport, ProviderAdapter, Submission};

const RATIOS: LookupTable = LookupTable::new(
    &[("9:16", "720:1280"), ("16:9", "1280:720"), ("1:1", "960:960")],
    "720:1280",
);
const DURATIONS: &[u32] = &[5, 10];

const STATUSES: &[(&str, JobState)] = &[
    ("PENDING", JobState::Queued),
    ("THROTTLED", JobState::Queued),
    ("RUNNING", JobState::Running),
    ("SUCCEEDED", JobState::Completed),
    ("FAILED", JobState::Failed),
    ("CANCELLED", JobState::Failed),
];

/// Runway image-to-video. Needs a reference image; without one the request
/// cannot be expressed and the candidate fails immediately.
pub struct Runway {
    descriptor: ProviderDescriptor,
    base: String,
    model: String,
}

impl Runway {
    pub fn new(endpoints: &Endpoints) -> Self {
        Self {
            descriptor: ProviderDescriptor::new(RUNWAY, Capability::Video, false, RUNWAY_KEY),
            base: endpoints.runway_base.trim_end_matches('/').to_string(),
            model: endpoints.runway_model.clone(),
        }
    }

    fn authorize(&self, payload: ProviderPayload, key: &str) -> ProviderPayload {
        payload
            .bearer(key)
            .header("X-Runway-Version", RUNWAY_API_VERSION)
    }
}

impl ProviderAdapter for Runway {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn build_payload(
        &self,
        request: &GenerationRequest,
        ctx: &CallContext<'_>,
    ) -> Result<ProviderPayload, ProviderError> {
        let (data, mime) = request
            .reference_image()
            .ok_or_else(|| ProviderError::fatal("runway image-to-video requires a reference image"))?;
        let body = json!({
            "promptText": request.prompt,
            "promptImage": data_uri(data, mime),
            "model": self.model,
            "ratio": RATIOS.translate(request.aspect_ratio()),
            "duration": pick_duration(request.duration_seconds(), DURATIONS, 5),
        });
        let payload = ProviderPayload::post_json(format!("{}/image_to_video", self.base), body);
        Ok(self
            .authorize(payload, ctx.credential)
            .timeout(Duration::from_secs(60)))
    }

    fn parse_response(
        &self,
        _request: &GenerationRequest,
        response: &HttpResponse,
    ) -> Result<Submission, ProviderError> {
        let value = response.parse_json()?;
        require_str(&value, &["/id"], "task id").map(|id| Submission::Job(id.to_string()))
    }

    fn status_table(&self) -> &'static [(&'static str, JobState)] {
        STATUSES
    }

    fn poll_payload(
        &self,
        job_id: &str,
        ctx: &CallContext<'_>,
    ) -> Result<ProviderPayload, ProviderError> {
        let payload = ProviderPayload::get(format!("{}/tasks/{job_id}", self.base));
        Ok(self
            .authorize(payload, ctx.credential)
            .timeout(Duration::from_secs(30)))
    }

    fn parse_poll(&self, response: &HttpResponse) -> Result<PollReport, ProviderError> {
        let value = response.parse_json()?;
        let mut report = PollReport::status(first_str(&value, &["/status"]).unwrap_or("PENDING"));
        if let Some(video) = first_str(&value, &["/output/0"]) {
            report = report.with_output(JobOutput::Uri(video.to_string()));
        }
        if let Some(failure) = first_str(&value, &["/failure", "/failureCode"]) {
            report = report.with_failure(failure);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_reference_is_fatal() {
        let adapter = Runway::new(&Endpoints::default());
        let request = GenerationRequest::new(Capability::Video, "spin");
        let err = adapter
            .build_payload(&request, &CallContext::new("k"))
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn payload_uses_ratio_literals_and_version_header() {
        let adapter = Runway::new(&Endpoints::default());
        let request = GenerationRequest::new(Capability::Video, "spin")
            .with_aspect_ratio("16:9")
            .with_duration(8)
            .with_reference_image(vec![1, 2, 3], "image/png");
        let payload = adapter.build_payload(&request, &CallContext::new("rw")).unwrap();
        let body = payload.json_body().unwrap();
        assert_eq!(body["ratio"], "1280:720");
        assert_eq!(body["duration"], 5);
        assert_eq!(body["promptImage"], "data:image/png;base64,AQID");
        assert_eq!(payload.header_value("X-Runway-Version"), Some("2024-11-06"));
        assert!(payload.url.ends_with("/v1/image_to_video"));
    }

    #[test]
    fn same_request_builds_identical_bytes() {
        let adapter = Runway::new(&Endpoints::default());
        let request = GenerationRequest::new(Capability::Video, "spin")
            .with_aspect_ratio("9:16")
            .with_reference_image(vec![4, 5, 6], "image/jpeg");
        let ctx = CallContext::new("rw");
        let first = adapter.build_payload(&request, &ctx).unwrap();
        let second = adapter.build_payload(&request, &ctx).unwrap();
        assert_eq!(first.body_bytes(), second.body_bytes());
        assert_eq!(first.headers, second.headers);
    }

    #[test]
    fn poll_output_comes_from_first_entry() {
        let adapter = Runway::new(&Endpoints::default());
        let report = adapter
            .parse_poll(&HttpResponse::json(
                200,
                &json!({"status": "SUCCEEDED", "output": ["https://cdn.runway/v.mp4"]}),
            ))
            .unwrap();
        assert_eq!(report.raw_status, "SUCCEEDED");
        assert_eq!(report.output, Some(JobOutput::Uri("https://cdn.runway/v.mp4".into())));
    }
}
