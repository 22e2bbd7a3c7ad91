use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::constants::default_job_timeout;
use crate::core::{Attempt, Capability, GenerationRequest, GenerationResult, Payload};
use crate::error::{GenerationError, ProviderError};
use crate::jobs::{JobTracker, PollPolicy};
use crate::persist::{GenerationRecord, Persistence};
use crate::providers::{CallContext, ProviderAdapter, Submission};
use crate::quota::{QuotaConfig, QuotaMonitor};
use crate::registry::{Candidate, ProviderRegistry};
use crate::retry::RetryPolicy;
use crate::sink::AssetSink;
use crate::telemetry::{RequestEvent, RunMonitor};
use crate::transport::{HttpResponse, ProviderPayload, Transport};
use crate::utils::mime_from_url;

/// Immutable knobs for one dispatcher.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub retry: RetryPolicy,
    pub poll: PollPolicy,
    /// Job budgets per capability; missing entries use the built-in defaults.
    pub timeouts: HashMap<Capability, Duration>,
    pub quota: QuotaConfig,
}

impl OrchestratorConfig {
    pub fn job_timeout(&self, capability: Capability) -> Duration {
        self.timeouts
            .get(&capability)
            .copied()
            .unwrap_or_else(|| default_job_timeout(capability))
    }
}

/// Runs one request against its candidate chain: strictly sequential,
/// first success wins, every candidate leaves exactly one attempt entry.
pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    sink: Option<Arc<dyn AssetSink>>,
    persistence: Option<Arc<dyn Persistence>>,
    monitor: RunMonitor,
    quota: QuotaMonitor,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        let quota = QuotaMonitor::new(config.quota.clone());
        Self {
            registry,
            transport,
            clock,
            config,
            sink: None,
            persistence: None,
            monitor: RunMonitor::new(),
            quota,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AssetSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_monitor(mut self, monitor: RunMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn monitor(&self) -> &RunMonitor {
        &self.monitor
    }

    pub fn quota(&self) -> &QuotaMonitor {
        &self.quota
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn execute(&self, request: &GenerationRequest) -> Result<GenerationResult, GenerationError> {
        let capability = request.capability;
        let candidates = self
            .registry
            .resolve_candidates(capability, &request.preferred_providers)?;
        info!(
            %capability,
            candidates = candidates.len(),
            first = candidates.first().map(|c| c.id()).unwrap_or(""),
            "dispatching request"
        );

        let mut attempts = Vec::with_capacity(candidates.len());
        let mut published: Option<Option<String>> = None;
        for (index, candidate) in candidates.iter().enumerate() {
            let reference_url = if candidate.adapter.accepts_reference_url() {
                self.publish_reference(request, &mut published)
            } else {
                None
            };
            let ctx = CallContext::new(&candidate.credential)
                .with_reference_url(reference_url.as_deref());

            let (outcome, tries, job_id) = self.attempt(candidate, request, &ctx);
            match outcome {
                Ok(payload) => {
                    info!(provider = %candidate.id(), %capability, tries, "generation succeeded");
                    attempts.push(Attempt::succeeded(candidate.id(), tries, job_id));
                    let result = GenerationResult {
                        success: true,
                        payload,
                        provider_id: candidate.id().to_string(),
                        attempts,
                    };
                    self.persist(request, &result);
                    return Ok(result);
                }
                Err(err) => {
                    warn!(
                        provider = %candidate.id(),
                        %capability,
                        class = %err.class(),
                        error = %err.message(),
                        "candidate failed"
                    );
                    attempts.push(Attempt::failed(candidate.id(), &err, tries, job_id));
                    if let Some(next) = candidates.get(index + 1) {
                        self.monitor.note_event(
                            "fallback",
                            json!({
                                "capability": capability,
                                "from": candidate.id(),
                                "to": next.id(),
                                "class": err.class(),
                                "error": err.message(),
                            }),
                        );
                    }
                }
            }
        }

        Err(GenerationError::AllProvidersExhausted {
            capability,
            attempts,
        })
    }

    /// Picks up tracking of a job submitted earlier, e.g. by a previous run.
    pub fn resume(
        &self,
        provider_id: &str,
        job_id: &str,
        capability: Capability,
    ) -> Result<GenerationResult, GenerationError> {
        let not_eligible = |reason: String| GenerationError::NoEligibleProvider { capability, reason };
        let adapter = self
            .registry
            .adapter(provider_id)
            .ok_or_else(|| not_eligible(format!("provider '{provider_id}' is not registered")))?;
        if !adapter.descriptor().supports(capability) {
            return Err(not_eligible(format!(
                "provider '{provider_id}' does not generate {capability}"
            )));
        }
        let credential = self.registry.credential_for(provider_id).ok_or_else(|| {
            not_eligible(format!(
                "missing credentials ({})",
                adapter.descriptor().credential_requirement
            ))
        })?;
        let ctx = CallContext::new(&credential);
        match self.follow_job(adapter.as_ref(), &ctx, capability, job_id) {
            Ok(payload) => Ok(GenerationResult {
                success: true,
                payload,
                provider_id: provider_id.to_string(),
                attempts: vec![Attempt::succeeded(provider_id, 0, Some(job_id.to_string()))],
            }),
            Err(err) => Err(GenerationError::AllProvidersExhausted {
                capability,
                attempts: vec![Attempt::failed(
                    provider_id,
                    &err,
                    0,
                    Some(job_id.to_string()),
                )],
            }),
        }
    }

    /// Materializes a result as bytes. URI payloads are fetched with the
    /// producing provider's download rules when it is still registered.
    pub fn download(&self, result: &GenerationResult) -> Result<Payload, ProviderError> {
        let uri = match &result.payload {
            Payload::Uri(uri) => uri,
            other => return Ok(other.clone()),
        };
        let capability = self
            .registry
            .adapter(&result.provider_id)
            .and_then(|adapter| adapter.descriptor().capabilities.first().copied())
            .unwrap_or(Capability::Video);
        let fetcher = self.metered(&result.provider_id, capability, "download");
        let request = match (
            self.registry.adapter(&result.provider_id),
            self.registry.credential_for(&result.provider_id),
        ) {
            (Some(adapter), Some(credential)) => {
                adapter.download_payload(uri, &CallContext::new(&credential))
            }
            _ => ProviderPayload::get(uri.as_str()),
        };
        let response = fetcher.call(&request)?;
        bytes_payload(response, uri, None)
    }

    fn attempt(
        &self,
        candidate: &Candidate,
        request: &GenerationRequest,
        ctx: &CallContext<'_>,
    ) -> (Result<Payload, ProviderError>, u32, Option<String>) {
        let adapter = candidate.adapter.as_ref();
        let provider = candidate.id();
        let submitter = self.metered(provider, request.capability, "submit");
        let fetcher = self.metered(provider, request.capability, "fetch");

        let (submitted, tries) = self.config.retry.run(
            self.clock.as_ref(),
            |attempt| {
                debug!(provider, attempt, "submitting request");
                let payload = adapter.build_payload(request, ctx)?;
                let response = submitter.call(&payload)?;
                match adapter.parse_response(request, &response)? {
                    Submission::Ready(payload) => Ok(Submitted::Payload(payload)),
                    Submission::Fetch { request: fetch, mime } => {
                        let response = fetcher.call(&fetch)?;
                        Ok(Submitted::Payload(bytes_payload(response, &fetch.url, Some(&mime))?))
                    }
                    Submission::Job(job_id) => Ok(Submitted::Job(job_id)),
                }
            },
            |attempt, delay, err| {
                warn!(
                    provider,
                    attempt,
                    delay = %humantime::format_duration(delay),
                    error = %err.message(),
                    "transient failure, retrying"
                );
                self.monitor.note_event(
                    "retry",
                    json!({
                        "provider": provider,
                        "attempt": attempt,
                        "delay_ms": delay.as_millis() as u64,
                        "error": err.message(),
                    }),
                );
            },
        );

        match submitted {
            Ok(Submitted::Payload(payload)) => (Ok(payload), tries, None),
            Ok(Submitted::Job(job_id)) => {
                let outcome = self.follow_job(adapter, ctx, request.capability, &job_id);
                (outcome, tries, Some(job_id))
            }
            Err(err) => (Err(err), tries, None),
        }
    }

    fn follow_job(
        &self,
        adapter: &dyn ProviderAdapter,
        ctx: &CallContext<'_>,
        capability: Capability,
        job_id: &str,
    ) -> Result<Payload, ProviderError> {
        let provider = adapter.descriptor().id.as_str();
        let poller = self.metered(provider, capability, "poll");
        let tracker = JobTracker::new(&poller, self.clock.as_ref(), self.config.poll);
        let job = tracker.track(adapter, ctx, job_id, self.config.job_timeout(capability));
        debug!(
            provider,
            job = %job_id,
            state = %job.state(),
            polls = job.polls(),
            "job finished"
        );
        match job.into_outcome()? {
            Payload::Uri(uri) if matches!(capability, Capability::Image | Capability::Speech) => {
                let fetcher = self.metered(provider, capability, "download");
                let response = fetcher.call(&adapter.download_payload(&uri, ctx))?;
                bytes_payload(response, &uri, None)
            }
            payload => Ok(payload),
        }
    }

    /// Uploads the reference image at most once per execution. A failed or
    /// missing sink leaves providers to inline the bytes.
    fn publish_reference(
        &self,
        request: &GenerationRequest,
        published: &mut Option<Option<String>>,
    ) -> Option<String> {
        if let Some(url) = published {
            return url.clone();
        }
        let url = match (&self.sink, request.reference_image()) {
            (Some(sink), Some((data, mime))) => {
                let started_at = self.clock.now();
                let outcome = sink.publish(data, mime);
                self.monitor.record(RequestEvent {
                    provider: "asset-sink".to_string(),
                    capability: request.capability,
                    phase: "upload".to_string(),
                    started_at,
                    finished_at: self.clock.now(),
                    error: outcome.as_ref().err().map(ProviderError::class),
                    metadata: HashMap::new(),
                });
                match outcome {
                    Ok(url) => Some(url),
                    Err(err) => {
                        warn!(error = %err, "reference upload failed, sending it inline");
                        self.monitor.note_event(
                            "reference.inline_fallback",
                            json!({"error": err.message()}),
                        );
                        None
                    }
                }
            }
            _ => None,
        };
        *published = Some(url.clone());
        url
    }

    fn persist(&self, request: &GenerationRequest, result: &GenerationResult) {
        let Some(store) = &self.persistence else {
            return;
        };
        let record = GenerationRecord::from_result(request, result, self.clock.now());
        if let Err(err) = store.insert(&record) {
            warn!(error = %format!("{err:#}"), "could not persist generation record");
            self.monitor
                .note_event("persistence.failed", json!({"error": format!("{err:#}")}));
        }
    }

    fn metered<'a>(&'a self, provider: &'a str, capability: Capability, phase: &'static str) -> Metered<'a> {
        Metered {
            inner: self.transport.as_ref(),
            clock: self.clock.as_ref(),
            quota: &self.quota,
            monitor: &self.monitor,
            provider,
            capability,
            phase,
        }
    }
}

enum Submitted {
    Payload(Payload),
    Job(String),
}

/// Transport scoped to one provider and phase: applies the quota delay and
/// records every call in the run monitor.
struct Metered<'a> {
    inner: &'a dyn Transport,
    clock: &'a dyn Clock,
    quota: &'a QuotaMonitor,
    monitor: &'a RunMonitor,
    provider: &'a str,
    capability: Capability,
    phase: &'static str,
}

impl Transport for Metered<'_> {
    fn call(&self, request: &ProviderPayload) -> Result<HttpResponse, ProviderError> {
        if let Some(delay) = self.quota.register_request(self.provider, self.clock.now()) {
            debug!(
                provider = self.provider,
                delay = %humantime::format_duration(delay),
                "holding request for rate limit"
            );
            self.clock.sleep(delay);
        }
        let started_at = self.clock.now();
        let outcome = self.inner.call(request);
        let mut metadata = HashMap::new();
        if let Ok(response) = &outcome {
            metadata.insert("status".to_string(), json!(response.status));
        }
        self.monitor.record(RequestEvent {
            provider: self.provider.to_string(),
            capability: self.capability,
            phase: self.phase.to_string(),
            started_at,
            finished_at: self.clock.now(),
            error: outcome.as_ref().err().map(ProviderError::class),
            metadata,
        });
        outcome
    }
}

/// Downloaded body as bytes. The server's content type wins unless it is
/// generic, then the hint, then whatever the URL's extension implies.
fn bytes_payload(
    response: HttpResponse,
    url: &str,
    hint: Option<&str>,
) -> Result<Payload, ProviderError> {
    if response.body.is_empty() {
        return Err(ProviderError::parse(format!(
            "download from {} returned no content",
            crate::transport::redact(url)
        )));
    }
    let served = response
        .content_type
        .as_deref()
        .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
        .filter(|value| !value.is_empty() && value != "application/octet-stream");
    let mime = served
        .or_else(|| hint.map(str::to_string))
        .or_else(|| mime_from_url(url))
        .unwrap_or_else(|| "application/octet-stream".to_string());
    Ok(Payload::Bytes {
        data: response.body,
        mime,
    })
}
