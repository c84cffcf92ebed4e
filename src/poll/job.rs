use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Backoff, ErrorStreak, FailureReason, PollOutcome, RecoveryAction};
use crate::api::types::{GenerationJob, JobStatus, VideoStatus};
use crate::auth::AuthedApi;
use crate::db::SharedDb;
use crate::error::ClientResult;

const TIMEOUT_MESSAGE: &str = "Generation is taking longer than expected. Please try again.";
const CONNECTIVITY_MESSAGE: &str =
    "Lost contact with the server while checking your song. It may still finish.";
const AUTH_MESSAGE: &str = "Your session has expired. Please sign in again.";
const GENERIC_FAILURE: &str = "Generation failed";

/// Where a job status snapshot comes from.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn fetch_job(&self, job_id: &str) -> ClientResult<GenerationJob>;
}

#[async_trait]
impl JobSource for AuthedApi {
    async fn fetch_job(&self, job_id: &str) -> ClientResult<GenerationJob> {
        let api = &self.api;
        self.call(|token| async move { api.get_job(job_id, &token).await })
            .await
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct JobPollPolicy {
    pub backoff: Backoff,
    pub max_attempts: u32,
    pub error_threshold: u32,
    /// Pause between terminal success and the navigation callback.
    pub navigate_after: Duration,
    pub progress_step: u8,
    pub progress_cap: u8,
}

impl Default for JobPollPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff {
                base: Duration::from_secs(3),
                factor: 1.15,
                max: Duration::from_secs(8),
            },
            max_attempts: 80,
            error_threshold: 5,
            navigate_after: Duration::from_secs(1),
            progress_step: 3,
            progress_cap: 90,
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum JobPhase {
    Generating,
    /// Audio is done; the backend is still rendering the video.
    VideoProcessing,
    Completed {
        project_id: Option<String>,
    },
    Failed(JobFailure),
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobFailure {
    pub reason: FailureReason,
    pub message: String,
    /// Last project id observed before giving up.
    pub project_id: Option<String>,
    pub recovery: Vec<RecoveryAction>,
}

/// Snapshot published to consumers after every classified attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub job_id: String,
    pub phase: JobPhase,
    /// Display-only estimate.
    pub progress: u8,
    pub attempts: u32,
    pub project_id: Option<String>,
}

/// What the driver should do after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Continue(Duration),
    Finished(JobPhase),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    Project(String),
    Dashboard,
}

/// Generation-job poller state. One instance per watched job; discard it
/// once terminal.
#[derive(Debug, Clone)]
pub struct JobPoller {
    job_id: String,
    policy: JobPollPolicy,
    attempts: u32,
    errors: ErrorStreak,
    delay: Duration,
    project_id: Option<String>,
    progress: u8,
    phase: JobPhase,
    last_status: Option<JobStatus>,
}

impl JobPoller {
    pub fn new(job_id: impl Into<String>, policy: JobPollPolicy) -> Self {
        Self {
            job_id: job_id.into(),
            errors: ErrorStreak::new(policy.error_threshold),
            delay: policy.backoff.base,
            attempts: 0,
            project_id: None,
            progress: 0,
            phase: JobPhase::Generating,
            last_status: None,
            policy,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.errors.count()
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    pub fn phase(&self) -> &JobPhase {
        &self.phase
    }

    pub fn view(&self) -> JobView {
        JobView {
            job_id: self.job_id.clone(),
            phase: self.phase.clone(),
            progress: self.progress,
            attempts: self.attempts,
            project_id: self.project_id.clone(),
        }
    }

    /// Count one attempt. Returns the terminal phase instead when the attempt
    /// ceiling is exceeded; no request must be issued in that case.
    pub fn begin_attempt(&mut self) -> Option<JobPhase> {
        if self.phase.is_terminal() {
            return Some(self.phase.clone());
        }
        self.attempts += 1;
        if self.attempts > self.policy.max_attempts {
            return Some(self.fail(FailureReason::Timeout, TIMEOUT_MESSAGE.to_string()));
        }
        None
    }

    /// Fold one classified attempt into the state.
    pub fn observe(&mut self, outcome: PollOutcome<GenerationJob>) -> Step {
        if self.phase.is_terminal() {
            return Step::Finished(self.phase.clone());
        }

        let wait = self.delay;
        self.delay = self.policy.backoff.next(self.delay);

        match outcome {
            PollOutcome::AuthMissing(msg) => {
                debug!(job_id = %self.job_id, "no credential: {msg}");
                Step::Finished(self.fail(FailureReason::Auth, AUTH_MESSAGE.to_string()))
            }
            PollOutcome::HttpError { .. } | PollOutcome::NetworkError(_) => {
                warn!(
                    job_id = %self.job_id,
                    attempt = self.attempts,
                    consecutive = self.errors.count() + 1,
                    "job status check failed: {outcome:?}"
                );
                if self.errors.record() {
                    Step::Finished(
                        self.fail(FailureReason::Connectivity, CONNECTIVITY_MESSAGE.to_string()),
                    )
                } else {
                    Step::Continue(wait)
                }
            }
            PollOutcome::Success(job) => {
                self.errors.reset();
                self.apply(job, wait)
            }
        }
    }

    fn apply(&mut self, job: GenerationJob, wait: Duration) -> Step {
        if let Some(pid) = job.project_id.as_ref().filter(|p| !p.is_empty()) {
            self.project_id = Some(pid.clone());
        }
        if self.last_status == Some(JobStatus::Completed) && job.status != JobStatus::Completed {
            warn!(
                job_id = %self.job_id,
                status = job.status.as_str(),
                "job moved backwards from completed; treating as backend anomaly"
            );
        }
        self.last_status = Some(job.status);

        match job.status {
            JobStatus::Failed => {
                let message = job
                    .error
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| GENERIC_FAILURE.to_string());
                Step::Finished(self.fail(FailureReason::Remote, message))
            }
            JobStatus::Completed if job.video_status == Some(VideoStatus::Processing) => {
                if self.phase != JobPhase::VideoProcessing {
                    info!(job_id = %self.job_id, "audio ready, waiting for video");
                }
                self.phase = JobPhase::VideoProcessing;
                Step::Continue(wait)
            }
            JobStatus::Completed => {
                if job.video_status == Some(VideoStatus::Failed) {
                    warn!(job_id = %self.job_id, "video rendering failed; audio is available");
                }
                self.progress = 100;
                self.phase = JobPhase::Completed {
                    project_id: self.project_id.clone(),
                };
                info!(job_id = %self.job_id, attempts = self.attempts, "generation completed");
                Step::Finished(self.phase.clone())
            }
            _ => {
                if self.phase == JobPhase::VideoProcessing {
                    warn!(
                        job_id = %self.job_id,
                        status = job.status.as_str(),
                        "job left the video phase without completing; treating as backend anomaly"
                    );
                }
                self.phase = JobPhase::Generating;
                self.progress = self
                    .progress
                    .saturating_add(self.policy.progress_step)
                    .min(self.policy.progress_cap.min(99));
                Step::Continue(wait)
            }
        }
    }

    fn fail(&mut self, reason: FailureReason, message: String) -> JobPhase {
        let mut recovery = Vec::new();
        match reason {
            FailureReason::Auth => recovery.push(RecoveryAction::SignIn),
            FailureReason::Connectivity => {
                if let Some(pid) = &self.project_id {
                    recovery.push(RecoveryAction::ViewProject(pid.clone()));
                }
                recovery.push(RecoveryAction::Retry);
                recovery.push(RecoveryAction::Dashboard);
            }
            FailureReason::Timeout | FailureReason::Remote => {
                recovery.push(RecoveryAction::Retry);
                recovery.push(RecoveryAction::Dashboard);
                if let Some(pid) = &self.project_id {
                    recovery.push(RecoveryAction::ViewProject(pid.clone()));
                }
            }
        }
        warn!(job_id = %self.job_id, reason = ?reason, attempts = self.attempts, "{message}");
        self.phase = JobPhase::Failed(JobFailure {
            reason,
            message,
            project_id: self.project_id.clone(),
            recovery,
        });
        self.phase.clone()
    }
}

// ---------------------------------------------------------------------------
// Watch: spawned driver owned by the consuming view
// ---------------------------------------------------------------------------

/// Callback fired once, after terminal success.
pub type NavigateCallback = Arc<dyn Fn(Navigation) + Send + Sync>;

#[derive(Default, Clone)]
pub struct JobWatchOptions {
    pub policy: JobPollPolicy,
    pub on_navigate: Option<NavigateCallback>,
    /// Snapshots are recorded here when set.
    pub store: Option<SharedDb>,
}

pub struct JobWatch {
    cancel: CancellationToken,
    state: watch::Receiver<JobView>,
    task: Option<JoinHandle<Option<JobPhase>>>,
}

impl JobWatch {
    /// Spawn the polling loop. The first request is issued immediately.
    pub fn start(
        source: Arc<dyn JobSource>,
        job_id: impl Into<String>,
        options: JobWatchOptions,
    ) -> Self {
        let poller = JobPoller::new(job_id, options.policy.clone());
        let (tx, rx) = watch::channel(poller.view());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            source,
            poller,
            tx,
            cancel.clone(),
            options.on_navigate,
            options.store,
        ));
        Self {
            cancel,
            state: rx,
            task: Some(task),
        }
    }

    pub fn state(&self) -> JobView {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobView> {
        self.state.clone()
    }

    /// Abort the in-flight request and the pending timer. No snapshot is
    /// published and no navigation fires afterwards.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Wait for the loop to end. `None` when it was cancelled.
    pub async fn join(mut self) -> Option<JobPhase> {
        let task = self.task.take()?;
        task.await.ok().flatten()
    }
}

impl Drop for JobWatch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    source: Arc<dyn JobSource>,
    mut poller: JobPoller,
    tx: watch::Sender<JobView>,
    cancel: CancellationToken,
    on_navigate: Option<NavigateCallback>,
    store: Option<SharedDb>,
) -> Option<JobPhase> {
    let publish = |poller: &JobPoller| {
        if !cancel.is_cancelled() {
            tx.send_replace(poller.view());
        }
    };

    loop {
        if let Some(terminal) = poller.begin_attempt() {
            publish(&poller);
            return Some(terminal);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(job_id = %poller.job_id(), "job watch cancelled mid-request");
                return None;
            }
            r = source.fetch_job(poller.job_id()) => r,
        };

        let outcome = PollOutcome::classify(result);
        if let (Some(db), PollOutcome::Success(job)) = (&store, &outcome) {
            record_snapshot(db, job);
        }
        let step = poller.observe(outcome);
        if cancel.is_cancelled() {
            return None;
        }
        publish(&poller);

        match step {
            Step::Continue(delay) => {
                debug!(
                    job_id = %poller.job_id(),
                    attempt = poller.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "next job status check scheduled"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Step::Finished(phase) => {
                if let (JobPhase::Completed { project_id }, Some(cb)) = (&phase, &on_navigate) {
                    let target = match project_id {
                        Some(id) => Navigation::Project(id.clone()),
                        None => Navigation::Dashboard,
                    };
                    let cancelled = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => true,
                        _ = tokio::time::sleep(poller.policy.navigate_after) => false,
                    };
                    if !cancelled {
                        cb(target);
                    }
                }
                return Some(phase);
            }
        }
    }
}

fn record_snapshot(db: &SharedDb, job: &GenerationJob) {
    let Ok(guard) = db.lock() else {
        warn!(job_id = %job.id, "db lock poisoned, job snapshot not recorded");
        return;
    };
    let video = match job.video_status {
        Some(VideoStatus::Processing) => Some("processing"),
        Some(VideoStatus::Completed) => Some("completed"),
        Some(VideoStatus::Failed) => Some("failed"),
        Some(VideoStatus::Unknown) | None => None,
    };
    if let Err(e) = guard.upsert_job(
        &job.id,
        job.project_id.as_deref(),
        job.status.as_str(),
        video,
        job.error.as_deref(),
    ) {
        warn!(job_id = %job.id, "failed to record job snapshot: {e:#}");
    }
}
