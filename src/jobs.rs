//! Tracking of long-running provider jobs.
//!
//! Polling is an explicit state machine: `JobTracker::tick` performs one poll
//! and says how long to wait before the next one. `track` is the blocking
//! driver; a caller that stops ticking simply abandons the job locally.

use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::clock::{elapsed_between, Clock};
use crate::constants::{DEFAULT_POLL_INITIAL, DEFAULT_POLL_MAX, DEFAULT_POLL_STEP};
use crate::core::{JobState, Payload};
use crate::error::ProviderError;
use crate::providers::{map_status, CallContext, JobOutput, ProviderAdapter};
use crate::transport::Transport;

/// Tracking record of one in-flight asynchronous request.
///
/// Transitions only move forward, terminal states are final, and `result`
/// and `error` are never both set.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationJob {
    job_id: String,
    provider_id: String,
    state: JobState,
    created_at: OffsetDateTime,
    last_polled_at: Option<OffsetDateTime>,
    polls: u32,
    raw_status: Option<String>,
    result: Option<Payload>,
    error: Option<ProviderError>,
}

fn rank(state: JobState) -> u8 {
    match state {
        JobState::Queued => 0,
        JobState::Running => 1,
        JobState::Completed | JobState::Failed | JobState::TimedOut => 2,
    }
}

impl GenerationJob {
    pub fn new(job_id: &str, provider_id: &str, created_at: OffsetDateTime) -> Self {
        Self {
            job_id: job_id.to_string(),
            provider_id: provider_id.to_string(),
            state: JobState::Queued,
            created_at,
            last_polled_at: None,
            polls: 0,
            raw_status: None,
            result: None,
            error: None,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn last_polled_at(&self) -> Option<OffsetDateTime> {
        self.last_polled_at
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }

    pub fn raw_status(&self) -> Option<&str> {
        self.raw_status.as_deref()
    }

    pub fn result(&self) -> Option<&Payload> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&ProviderError> {
        self.error.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn into_outcome(self) -> Result<Payload, ProviderError> {
        match (self.result, self.error) {
            (Some(payload), _) => Ok(payload),
            (None, Some(err)) => Err(err),
            (None, None) => Err(ProviderError::fatal(format!(
                "job {} abandoned in state {}",
                self.job_id, self.state
            ))),
        }
    }

    /// Moves between non-terminal states. Never goes backwards.
    pub fn advance(&mut self, state: JobState) -> bool {
        if state.is_terminal() || self.is_terminal() || rank(state) < rank(self.state) {
            return false;
        }
        self.state = state;
        true
    }

    pub fn mark_polled(&mut self, at: OffsetDateTime, raw_status: Option<&str>) {
        self.last_polled_at = Some(at);
        self.polls += 1;
        if let Some(raw) = raw_status {
            self.raw_status = Some(raw.to_string());
        }
    }

    pub fn complete(&mut self, payload: Payload) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = JobState::Completed;
        self.result = Some(payload);
        true
    }

    pub fn fail(&mut self, error: ProviderError) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = JobState::Failed;
        self.error = Some(error);
        true
    }

    pub fn time_out(&mut self, budget: Duration) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = JobState::TimedOut;
        self.error = Some(ProviderError::TimedOut(format!(
            "{} job {} still {} after {}",
            self.provider_id,
            self.job_id,
            self.raw_status.as_deref().unwrap_or("pending"),
            humantime::format_duration(budget)
        )));
        true
    }

    /// Time between creation and the latest poll.
    pub fn elapsed(&self) -> Duration {
        self.last_polled_at
            .map(|polled| elapsed_between(self.created_at, polled))
            .unwrap_or(Duration::ZERO)
    }
}

/// Poll spacing: `initial + step * (n - 1)` before poll `n + 1`, capped at
/// `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub initial: Duration,
    pub step: Duration,
    pub max: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial: DEFAULT_POLL_INITIAL,
            step: DEFAULT_POLL_STEP,
            max: DEFAULT_POLL_MAX,
        }
    }
}

impl PollPolicy {
    pub fn interval(&self, polls_done: u32) -> Duration {
        let grown = self.initial + self.step * polls_done.saturating_sub(1);
        grown.min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Wait(Duration),
    Done,
}

pub struct JobTracker<'a> {
    transport: &'a dyn Transport,
    clock: &'a dyn Clock,
    policy: PollPolicy,
}

impl<'a> JobTracker<'a> {
    pub fn new(transport: &'a dyn Transport, clock: &'a dyn Clock, policy: PollPolicy) -> Self {
        Self {
            transport,
            clock,
            policy,
        }
    }

    pub fn start(&self, adapter: &dyn ProviderAdapter, job_id: &str) -> GenerationJob {
        GenerationJob::new(job_id, &adapter.descriptor().id, self.clock.now())
    }

    /// Polls `job` until it is terminal or `budget` has elapsed since it was
    /// created.
    pub fn track(
        &self,
        adapter: &dyn ProviderAdapter,
        ctx: &CallContext<'_>,
        job_id: &str,
        budget: Duration,
    ) -> GenerationJob {
        let mut job = self.start(adapter, job_id);
        info!(
            provider = %job.provider_id(),
            job = %job_id,
            budget = %humantime::format_duration(budget),
            "tracking job"
        );
        loop {
            match self.tick(adapter, ctx, &mut job, budget) {
                Tick::Done => return job,
                Tick::Wait(delay) => self.clock.sleep(delay),
            }
        }
    }

    /// One poll. Transient failures are swallowed; anything the provider
    /// reports as final ends the job.
    pub fn tick(
        &self,
        adapter: &dyn ProviderAdapter,
        ctx: &CallContext<'_>,
        job: &mut GenerationJob,
        budget: Duration,
    ) -> Tick {
        if job.is_terminal() {
            return Tick::Done;
        }

        match self.poll_once(adapter, ctx, job) {
            Ok(()) => {}
            Err(err) if err.is_transient() => {
                debug!(
                    provider = %job.provider_id(),
                    job = %job.job_id(),
                    error = %err,
                    "transient poll failure, will poll again"
                );
            }
            Err(err) => {
                warn!(
                    provider = %job.provider_id(),
                    job = %job.job_id(),
                    error = %err,
                    "poll failed"
                );
                job.fail(err);
            }
        }
        if job.is_terminal() {
            return Tick::Done;
        }

        let elapsed = job.elapsed();
        if elapsed >= budget {
            job.time_out(budget);
            warn!(
                provider = %job.provider_id(),
                job = %job.job_id(),
                polls = job.polls(),
                "job timed out"
            );
            return Tick::Done;
        }
        let remaining = budget - elapsed;
        Tick::Wait(self.policy.interval(job.polls()).min(remaining))
    }

    fn poll_once(
        &self,
        adapter: &dyn ProviderAdapter,
        ctx: &CallContext<'_>,
        job: &mut GenerationJob,
    ) -> Result<(), ProviderError> {
        let request = adapter.poll_payload(job.job_id(), ctx)?;
        let response = self.transport.call(&request);
        let polled_at = self.clock.now();
        let report = match response.and_then(|response| adapter.parse_poll(&response)) {
            Ok(report) => report,
            Err(err) => {
                job.mark_polled(polled_at, None);
                return Err(err);
            }
        };
        job.mark_polled(polled_at, Some(&report.raw_status));
        let state = map_status(adapter.status_table(), &report.raw_status);
        debug!(
            provider = %job.provider_id(),
            job = %job.job_id(),
            raw = %report.raw_status,
            %state,
            "polled job"
        );

        match state {
            JobState::Completed => {
                let uri = match report.output {
                    Some(JobOutput::Uri(uri)) => uri,
                    Some(JobOutput::Resolve) => {
                        let request = adapter.resolve_payload(job.job_id(), ctx)?;
                        let response = self.transport.call(&request)?;
                        adapter.parse_resolved(&response)?
                    }
                    None => {
                        return Err(ProviderError::parse(format!(
                            "job {} completed without an output location",
                            job.job_id()
                        )))
                    }
                };
                job.complete(Payload::Uri(uri));
            }
            JobState::Failed => {
                let reason = report
                    .failure
                    .unwrap_or_else(|| format!("provider reported {}", report.raw_status));
                job.fail(ProviderError::fatal(reason));
            }
            other => {
                job.advance(other);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::core::Capability;
    use crate::testing::{FakeProvider, ScriptedTransport};
    use crate::transport::HttpResponse;
    use serde_json::json;

    fn status(value: &str) -> HttpResponse {
        HttpResponse::json(200, &json!({"status": value}))
    }

    #[test]
    fn intervals_grow_and_cap() {
        let policy = PollPolicy::default();
        assert_eq!(policy.interval(1), Duration::from_secs(10));
        assert_eq!(policy.interval(2), Duration::from_secs(12));
        assert_eq!(policy.interval(6), Duration::from_secs(20));
        assert_eq!(policy.interval(50), Duration::from_secs(30));
    }

    #[test]
    fn completes_after_running_polls() {
        let clock = ManualClock::default();
        let transport = ScriptedTransport::new()
            .respond("https://fake/slow/jobs/j1", status("queued"))
            .respond("https://fake/slow/jobs/j1", status("running"))
            .respond(
                "https://fake/slow/jobs/j1",
                HttpResponse::json(200, &json!({"status": "done", "uri": "https://cdn/v.mp4"})),
            );
        let adapter = FakeProvider::job("slow", Capability::Video);
        let tracker = JobTracker::new(&transport, &clock, PollPolicy::default());
        let job = tracker.track(&adapter, &CallContext::new("k"), "j1", Duration::from_secs(300));
        assert_eq!(job.state(), JobState::Completed);
        assert_eq!(job.result(), Some(&Payload::Uri("https://cdn/v.mp4".into())));
        assert!(job.error().is_none());
        assert_eq!(job.polls(), 3);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(10), Duration::from_secs(12)]
        );
    }

    #[test]
    fn unmapped_statuses_keep_polling() {
        let clock = ManualClock::default();
        let transport = ScriptedTransport::new()
            .respond("https://fake/slow/jobs/j2", status("warming_up"))
            .respond(
                "https://fake/slow/jobs/j2",
                HttpResponse::json(200, &json!({"status": "done", "uri": "u"})),
            );
        let adapter = FakeProvider::job("slow", Capability::Video);
        let tracker = JobTracker::new(&transport, &clock, PollPolicy::default());
        let mut job = tracker.start(&adapter, "j2");
        let ctx = CallContext::new("k");
        let first = tracker.tick(&adapter, &ctx, &mut job, Duration::from_secs(60));
        assert_eq!(first, Tick::Wait(Duration::from_secs(10)));
        assert_eq!(job.state(), JobState::Running);
        assert_eq!(job.raw_status(), Some("warming_up"));
        clock.advance(Duration::from_secs(10));
        let second = tracker.tick(&adapter, &ctx, &mut job, Duration::from_secs(60));
        assert_eq!(second, Tick::Done);
        assert_eq!(job.state(), JobState::Completed);
    }

    #[test]
    fn times_out_at_budget_never_before() {
        let clock = ManualClock::default();
        let transport =
            ScriptedTransport::new().respond("https://fake/slow/jobs/j3", status("running"));
        let adapter = FakeProvider::job("slow", Capability::Video);
        let tracker = JobTracker::new(&transport, &clock, PollPolicy::default());
        let budget = Duration::from_secs(45);
        let job = tracker.track(&adapter, &CallContext::new("k"), "j3", budget);
        assert_eq!(job.state(), JobState::TimedOut);
        assert!(job.elapsed() >= budget);
        assert!(matches!(job.error(), Some(ProviderError::TimedOut(_))));
        assert!(job.result().is_none());
        // 10 + 12 + 14 then capped by the remaining 9 seconds.
        assert_eq!(clock.total_slept(), budget);
        assert_eq!(job.polls(), 5);
    }

    #[test]
    fn transient_poll_errors_are_swallowed() {
        let clock = ManualClock::default();
        let transport = ScriptedTransport::new()
            .fail("https://fake/slow/jobs/j4", ProviderError::transient("502"))
            .respond(
                "https://fake/slow/jobs/j4",
                HttpResponse::json(200, &json!({"status": "done", "uri": "u"})),
            );
        let adapter = FakeProvider::job("slow", Capability::Video);
        let tracker = JobTracker::new(&transport, &clock, PollPolicy::default());
        let job = tracker.track(&adapter, &CallContext::new("k"), "j4", Duration::from_secs(60));
        assert_eq!(job.state(), JobState::Completed);
        assert_eq!(transport.calls_to("https://fake/slow/jobs/j4"), 2);
    }

    #[test]
    fn provider_failures_end_the_job() {
        let clock = ManualClock::default();
        let transport = ScriptedTransport::new().respond(
            "https://fake/slow/jobs/j5",
            HttpResponse::json(200, &json!({"status": "failed", "reason": "moderated"})),
        );
        let adapter = FakeProvider::job("slow", Capability::Video);
        let tracker = JobTracker::new(&transport, &clock, PollPolicy::default());
        let job = tracker.track(&adapter, &CallContext::new("k"), "j5", Duration::from_secs(60));
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.error(), Some(&ProviderError::fatal("moderated")));
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn terminal_jobs_do_not_change() {
        let mut job = GenerationJob::new("j", "p", OffsetDateTime::UNIX_EPOCH);
        assert!(job.advance(JobState::Running));
        assert!(!job.advance(JobState::Queued));
        assert_eq!(job.state(), JobState::Running);
        assert!(job.complete(Payload::Uri("u".into())));
        assert!(!job.fail(ProviderError::fatal("late")));
        assert!(!job.time_out(Duration::from_secs(1)));
        assert_eq!(job.state(), JobState::Completed);
        assert!(job.error().is_none());
    }
}
