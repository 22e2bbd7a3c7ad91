use std::time::Duration;

use serde_json::{json, Value};

use crate::constants::{FAL_FLUX, FAL_KEY, FAL_VIDEO};
use crate::core::{Capability, GenerationRequest, JobState, Payload};
use crate::error::ProviderError;
use crate::normalize::{pick_duration, reference_uri, LookupTable};
use crate::registry::ProviderDescriptor;
use crate::response::{decode_base64, first_str, require_str};
use crate::transport::{HttpResponse, ProviderPayload};

use super::{CallContext, Endpoints, JobOutput, PollReport, ProviderAdapter, Submission};

const RUN_TIMEOUT: Duration = Duration::from_secs(120);
const QUEUE_TIMEOUT: Duration = Duration::from_secs(30);

const IMAGE_SIZES: LookupTable = LookupTable::new(
    &[
        ("1:1", "square"),
        ("9:16", "portrait_16_9"),
        ("16:9", "landscape_16_9"),
        ("2:3", "portrait_4_3"),
        ("3:4", "portrait_4_3"),
        ("4:3", "landscape_4_3"),
    ],
    "square",
);

const VIDEO_ASPECTS: LookupTable = LookupTable::new(
    &[("9:16", "9:16"), ("16:9", "16:9"), ("1:1", "1:1")],
    "9:16",
);
const VIDEO_DURATIONS: &[u32] = &[5, 10];

const QUEUE_STATUSES: &[(&str, JobState)] = &[
    ("IN_QUEUE", JobState::Queued),
    ("IN_PROGRESS", JobState::Running),
    ("COMPLETED", JobState::Completed),
    ("FAILED", JobState::Failed),
    ("CANCELLED", JobState::Failed),
];

fn authorize(payload: ProviderPayload, key: &str) -> ProviderPayload {
    payload.header("Authorization", format!("Key {key}"))
}

/// Request addressing on the fal queue, shared by every fal model.
struct Queue {
    base: String,
    model: String,
}

impl Queue {
    fn new(base: &str, model: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            model: model.trim_matches('/').to_string(),
        }
    }

    fn submit_url(&self) -> String {
        format!("{}/{}", self.base, self.model)
    }

    fn request_url(&self, request_id: &str) -> String {
        format!("{}/{}/requests/{request_id}", self.base, self.model)
    }

    fn status(&self, request_id: &str, key: &str) -> ProviderPayload {
        authorize(
            ProviderPayload::get(format!("{}/status", self.request_url(request_id))),
            key,
        )
        .timeout(QUEUE_TIMEOUT)
    }

    fn result(&self, request_id: &str, key: &str) -> ProviderPayload {
        authorize(ProviderPayload::get(self.request_url(request_id)), key).timeout(QUEUE_TIMEOUT)
    }
}

fn parse_queue_status(response: &HttpResponse) -> Result<PollReport, ProviderError> {
    let value = response.parse_json()?;
    let status = require_str(&value, &["/status"], "queue status")?;
    let mut report = PollReport::status(status);
    if status == "COMPLETED" {
        report = report.with_output(JobOutput::Resolve);
    }
    if let Some(error) = first_str(&value, &["/error", "/error/message", "/detail"]) {
        report = report.with_failure(error);
    }
    Ok(report)
}

fn request_id(value: &Value) -> Option<&str> {
    first_str(value, &["/request_id"])
}

/// Flux text-to-image on `fal.run`. Answers synchronously with an image URL,
/// or with a queue request id when the run was deferred.
pub struct FalImage {
    descriptor: ProviderDescriptor,
    run_url: String,
    queue: Queue,
}

impl FalImage {
    pub fn new(endpoints: &Endpoints) -> Self {
        Self {
            descriptor: ProviderDescriptor::new(FAL_FLUX, Capability::Image, true, FAL_KEY),
            run_url: format!(
                "{}/{}",
                endpoints.fal_run_base.trim_end_matches('/'),
                endpoints.fal_image_model.trim_matches('/')
            ),
            queue: Queue::new(&endpoints.fal_queue_base, &endpoints.fal_image_model),
        }
    }
}

impl ProviderAdapter for FalImage {
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
            "image_size": IMAGE_SIZES.translate(request.aspect_ratio()),
            "num_inference_steps": 28,
            "guidance_scale": 3.5,
            "num_images": 1,
            "enable_safety_checker": true,
            "output_format": "jpeg",
        });
        Ok(authorize(ProviderPayload::post_json(&self.run_url, body), ctx.credential)
            .timeout(RUN_TIMEOUT))
    }

    fn parse_response(
        &self,
        _request: &GenerationRequest,
        response: &HttpResponse,
    ) -> Result<Submission, ProviderError> {
        let value = response.parse_json()?;
        if response.status == 202 {
            return request_id(&value)
                .map(|id| Submission::Job(id.to_string()))
                .ok_or_else(|| ProviderError::parse("queued response without request_id"));
        }
        let url = require_str(&value, &["/images/0/url"], "images[0].url")?;
        if url.starts_with("data:") {
            let mime = first_str(&value, &["/images/0/content_type"]).unwrap_or("image/jpeg");
            let data = decode_base64(url)?;
            return Ok(Submission::Ready(Payload::Bytes {
                data,
                mime: mime.to_string(),
            }));
        }
        Ok(Submission::Fetch {
            request: ProviderPayload::get(url).timeout(Duration::from_secs(60)),
            mime: first_str(&value, &["/images/0/content_type"])
                .unwrap_or("image/jpeg")
                .to_string(),
        })
    }

    fn status_table(&self) -> &'static [(&'static str, JobState)] {
        QUEUE_STATUSES
    }

    fn poll_payload(
        &self,
        job_id: &str,
        ctx: &CallContext<'_>,
    ) -> Result<ProviderPayload, ProviderError> {
        Ok(self.queue.status(job_id, ctx.credential))
    }

    fn parse_poll(&self, response: &HttpResponse) -> Result<PollReport, ProviderError> {
        parse_queue_status(response)
    }

    fn resolve_payload(
        &self,
        job_id: &str,
        ctx: &CallContext<'_>,
    ) -> Result<ProviderPayload, ProviderError> {
        Ok(self.queue.result(job_id, ctx.credential))
    }

    fn parse_resolved(&self, response: &HttpResponse) -> Result<String, ProviderError> {
        let value = response.parse_json()?;
        require_str(&value, &["/images/0/url"], "images[0].url").map(str::to_string)
    }
}

/// Video models on the fal queue (Kling by default).
pub struct FalVideo {
    descriptor: ProviderDescriptor,
    queue: Queue,
}

impl FalVideo {
    pub fn new(endpoints: &Endpoints) -> Self {
        Self {
            descriptor: ProviderDescriptor::new(FAL_VIDEO, Capability::Video, false, FAL_KEY),
            queue: Queue::new(&endpoints.fal_queue_base, &endpoints.fal_video_model),
        }
    }
}

impl ProviderAdapter for FalVideo {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn build_payload(
        &self,
        request: &GenerationRequest,
        ctx: &CallContext<'_>,
    ) -> Result<ProviderPayload, ProviderError> {
        let mut body = json!({
            "prompt": request.prompt,
            "aspect_ratio": VIDEO_ASPECTS.translate(request.aspect_ratio()),
            "duration": pick_duration(request.duration_seconds(), VIDEO_DURATIONS, 5).to_string(),
        });
        if let Some(uri) = reference_uri(request, ctx) {
            body["image_url"] = json!(uri);
        }
        let payload = ProviderPayload::post_json(self.queue.submit_url(), body);
        Ok(authorize(payload, ctx.credential).timeout(Duration::from_secs(60)))
    }

    fn parse_response(
        &self,
        _request: &GenerationRequest,
        response: &HttpResponse,
    ) -> Result<Submission, ProviderError> {
        let value = response.parse_json()?;
        request_id(&value)
            .map(|id| Submission::Job(id.to_string()))
            .ok_or_else(|| ProviderError::parse("queue response without request_id"))
    }

    fn accepts_reference_url(&self) -> bool {
        true
    }

    fn status_table(&self) -> &'static [(&'static str, JobState)] {
        QUEUE_STATUSES
    }

    fn poll_payload(
        &self,
        job_id: &str,
        ctx: &CallContext<'_>,
    ) -> Result<ProviderPayload, ProviderError> {
        Ok(self.queue.status(job_id, ctx.credential))
    }

    fn parse_poll(&self, response: &HttpResponse) -> Result<PollReport, ProviderError> {
        parse_queue_status(response)
    }

    fn resolve_payload(
        &self,
        job_id: &str,
        ctx: &CallContext<'_>,
    ) -> Result<ProviderPayload, ProviderError> {
        Ok(self.queue.result(job_id, ctx.credential))
    }

    fn parse_resolved(&self, response: &HttpResponse) -> Result<String, ProviderError> {
        let value = response.parse_json()?;
        require_str(&value, &["/video/url", "/video_url"], "video url").map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::map_status;

    #[test]
    fn portrait_request_uses_fal_vocabulary() {
        let adapter = FalImage::new(&Endpoints::default());
        let request = GenerationRequest::new(Capability::Image, "oud").with_aspect_ratio("9:16");
        let payload = adapter
            .build_payload(&request, &CallContext::new("fal-secret"))
            .unwrap();
        assert_eq!(payload.url, "https://fal.run/fal-ai/flux/dev");
        assert_eq!(payload.json_body().unwrap()["image_size"], "portrait_16_9");
        assert_eq!(payload.header_value("Authorization"), Some("Key fal-secret"));
    }

    #[test]
    fn payloads_are_byte_identical_across_calls() {
        let adapter = FalImage::new(&Endpoints::default());
        let request = GenerationRequest::new(Capability::Image, "oud").with_aspect_ratio("16:9");
        let ctx = CallContext::new("k");
        let first = adapter.build_payload(&request, &ctx).unwrap();
        let second = adapter.build_payload(&request, &ctx).unwrap();
        assert_eq!(first.body_bytes(), second.body_bytes());
        assert_eq!(first, second);
    }

    #[test]
    fn image_response_is_fetched_or_tracked() {
        let adapter = FalImage::new(&Endpoints::default());
        let request = GenerationRequest::new(Capability::Image, "oud");
        let ok = HttpResponse::json(
            200,
            &json!({"images": [{"url": "https://cdn.fal/img.jpg", "content_type": "image/jpeg"}]}),
        );
        match adapter.parse_response(&request, &ok).unwrap() {
            Submission::Fetch { request, mime } => {
                assert_eq!(request.url, "https://cdn.fal/img.jpg");
                assert!(request.header_value("Authorization").is_none());
                assert_eq!(mime, "image/jpeg");
            }
            other => panic!("unexpected submission {other:?}"),
        }
        let queued = HttpResponse::json(202, &json!({"request_id": "req-9"}));
        assert_eq!(
            adapter.parse_response(&request, &queued).unwrap(),
            Submission::Job("req-9".into())
        );
        let poll = adapter.poll_payload("req-9", &CallContext::new("k")).unwrap();
        assert_eq!(
            poll.url,
            "https://queue.fal.run/fal-ai/flux/dev/requests/req-9/status"
        );
    }

    #[test]
    fn queue_status_maps_and_resolves() {
        let adapter = FalVideo::new(&Endpoints::default());
        let report = adapter
            .parse_poll(&HttpResponse::json(200, &json!({"status": "COMPLETED"})))
            .unwrap();
        assert_eq!(map_status(adapter.status_table(), &report.raw_status), JobState::Completed);
        assert_eq!(report.output, Some(JobOutput::Resolve));
        let report = adapter
            .parse_poll(&HttpResponse::json(200, &json!({"status": "IN_QUEUE"})))
            .unwrap();
        assert_eq!(map_status(adapter.status_table(), &report.raw_status), JobState::Queued);
        let resolved = adapter
            .parse_resolved(&HttpResponse::json(
                200,
                &json!({"video": {"url": "https://cdn.fal/v.mp4"}}),
            ))
            .unwrap();
        assert_eq!(resolved, "https://cdn.fal/v.mp4");
    }

    #[test]
    fn video_payload_carries_reference_and_duration() {
        let adapter = FalVideo::new(&Endpoints::default());
        let request = GenerationRequest::new(Capability::Video, "spin")
            .with_duration(10)
            .with_reference_image(vec![9], "image/jpeg");
        let ctx = CallContext::new("k").with_reference_url(Some("https://i.test/ref.jpg"));
        let body = adapter.build_payload(&request, &ctx).unwrap();
        let body = body.json_body().unwrap();
        assert_eq!(body["duration"], "10");
        assert_eq!(body["image_url"], "https://i.test/ref.jpg");
        assert_eq!(body["aspect_ratio"], "9:16");
    }
}
