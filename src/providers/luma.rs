use std::time::Duration;

use serde_json::json;

use crate::constants::{LUMA, LUMA_KEY};
use crate::core::{Capability, GenerationRequest, JobState};
use crate::error::ProviderError;
use crate::normalize::{pick_duration, reference_uri, LookupTable};
use crate::registry::ProviderDescriptor;
use crate::response::{first_str, require_str};
use crate::transport::{HttpResponse, ProviderPayload};

use super::{CallContext, Endpoints, JobOutput, PollReport, ProviderAdapter, Submission};

const ASPECTS: LookupTable = LookupTable::new(
    &[("9:16", "9:16"), ("16:9", "16:9"), ("1:1", "1:1")],
    "9:16",
);
const DURATIONS: &[u32] = &[5, 9];

const STATUSES: &[(&str, JobState)] = &[
    ("queued", JobState::Queued),
    ("dreaming", JobState::Running),
    ("completed", JobState::Completed),
    ("failed", JobState::Failed),
    ("cancelled", JobState::Failed),
];

/// Luma Dream Machine generations.
pub struct Luma {
    descriptor: ProviderDescriptor,
    generations_url: String,
    model: String,
}

impl Luma {
    pub fn new(endpoints: &Endpoints) -> Self {
        Self {
            descriptor: ProviderDescriptor::new(LUMA, Capability::Video, false, LUMA_KEY),
            generations_url: format!("{}/generations", endpoints.luma_base.trim_end_matches('/')),
            model: endpoints.luma_model.clone(),
        }
    }
}

impl ProviderAdapter for Luma {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn build_payload(
        &self,
        request: &GenerationRequest,
        ctx: &CallContext<'_>,
    ) -> Result<ProviderPayload, ProviderError> {
        let duration = pick_duration(request.duration_seconds(), DURATIONS, 5);
        let mut body = json!({
            "model": self.model,
            "prompt": request.prompt,
            "aspect_ratio": ASPECTS.translate(request.aspect_ratio()),
            "duration": format!("{duration}s"),
            "loop": false,
        });
        if let Some(url) = reference_uri(request, ctx) {
            body["keyframes"] = json!({"frame0": {"type": "image", "url": url}});
        }
        Ok(ProviderPayload::post_json(&self.generations_url, body)
            .bearer(ctx.credential)
            .timeout(Duration::from_secs(60)))
    }

    fn parse_response(
        &self,
        _request: &GenerationRequest,
        response: &HttpResponse,
    ) -> Result<Submission, ProviderError> {
        let value = response.parse_json()?;
        require_str(&value, &["/id"], "generation id").map(|id| Submission::Job(id.to_string()))
    }

    fn accepts_reference_url(&self) -> bool {
        true
    }

    fn status_table(&self) -> &'static [(&'static str, JobState)] {
        STATUSES
    }

    fn poll_payload(
        &self,
        job_id: &str,
        ctx: &CallContext<'_>,
    ) -> Result<ProviderPayload, ProviderError> {
        Ok(
            ProviderPayload::get(format!("{}/{job_id}", self.generations_url))
                .bearer(ctx.credential)
                .timeout(Duration::from_secs(30)),
        )
    }

    fn parse_poll(&self, response: &HttpResponse) -> Result<PollReport, ProviderError> {
        let value = response.parse_json()?;
        let mut report = PollReport::status(first_str(&value, &["/state"]).unwrap_or("queued"));
        if let Some(video) = first_str(&value, &["/assets/video"]) {
            report = report.with_output(JobOutput::Uri(video.to_string()));
        }
        if let Some(reason) = first_str(&value, &["/failure_reason"]) {
            report = report.with_failure(reason);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::map_status;

    #[test]
    fn reference_image_becomes_first_keyframe() {
        let adapter = Luma::new(&Endpoints::default());
        let request = GenerationRequest::new(Capability::Video, "bottle turning")
            .with_aspect_ratio("4:5")
            .with_duration(9)
            .with_reference_image(vec![1, 2, 3], "image/jpeg");
        let payload = adapter.build_payload(&request, &CallContext::new("luma")).unwrap();
        let body = payload.json_body().unwrap();
        assert_eq!(body["aspect_ratio"], "9:16");
        assert_eq!(body["duration"], "9s");
        assert_eq!(body["keyframes"]["frame0"]["url"], "data:image/jpeg;base64,AQID");
        assert_eq!(payload.url, "https://api.lumalabs.ai/dream-machine/v1/generations");
    }

    #[test]
    fn same_request_builds_identical_bytes() {
        let adapter = Luma::new(&Endpoints::default());
        let request = GenerationRequest::new(Capability::Video, "bottle turning")
            .with_aspect_ratio("16:9")
            .with_reference_image(vec![1, 2, 3], "image/jpeg");
        let ctx = CallContext::new("luma");
        assert_eq!(
            adapter.build_payload(&request, &ctx).unwrap().body_bytes(),
            adapter.build_payload(&request, &ctx).unwrap().body_bytes()
        );
    }

    #[test]
    fn poll_reports_video_and_failures() {
        let adapter = Luma::new(&Endpoints::default());
        let done = adapter
            .parse_poll(&HttpResponse::json(
                200,
                &json!({"id": "g1", "state": "completed", "assets": {"video": "https://cdn.luma/v.mp4"}}),
            ))
            .unwrap();
        assert_eq!(map_status(adapter.status_table(), &done.raw_status), JobState::Completed);
        assert_eq!(done.output, Some(JobOutput::Uri("https://cdn.luma/v.mp4".into())));

        let failed = adapter
            .parse_poll(&HttpResponse::json(
                200,
                &json!({"state": "failed", "failure_reason": "nsfw"}),
            ))
            .unwrap();
        assert_eq!(map_status(adapter.status_table(), &failed.raw_status), JobState::Failed);
        assert_eq!(failed.failure.as_deref(), Some("nsfw"));
    }
}
