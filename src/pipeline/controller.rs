//! Pipeline controller: drives jobs from discovery to a terminal outcome.
//!
//! **Single-flight:** every operation that can touch an external collaborator
//! first claims the cursor. A user command that cannot claim it within a short
//! grace period fails with `PipelineError::Busy`; a `CONTINUE` is ignored.
//!
//! **No auto-advance past a decision:** a job that reaches `reviewing` stops
//! the loop (`is_processing = false`) until the user approves or declines.
//!
//! **Single attempt:** a failed extraction, analysis or submission skips the
//! job with `last_error` set. The same job is never retried.
//!
//! **No environment, no progress:** when the extraction environment is not
//! connected the current job is left untouched and processing stays on, so
//! the run picks up where it stopped once an environment connects.
//!
//! All job and state mutations go through the `SyncClient`; the controller
//! holds no authoritative state and can be dropped and recreated at any point.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, MutexGuard, RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{PipelineConfig, Profile};
use crate::error::{ExtractionError, JobError, PipelineError, PreflightError, SyncError};
use crate::jobs::{Job, JobChange, JobId, JobStatus, Stage};
use crate::ports::{Analyzer, PageExtractor, SubmissionStatus};
use crate::store::Database;
use crate::sync::{ApplicationState, Notification, StatePatch, SyncClient};

const EVENT_CAPACITY: usize = 64;

const CLAIM_GRACE: Duration = Duration::from_millis(250);

/// Something a UI should show.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A job is waiting for approve or decline.
    AwaitingDecision { job: Job },
    JobSkipped { job: Job },
    JobApplied { job: Job },
    /// No pending jobs remain.
    Drained,
    Paused,
    /// No extraction environment is connected; `job` waits for one.
    Stalled { job: Job },
    /// A background command failed before or during processing.
    Failed { command: String, reason: String },
}

/// The user-facing actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Start,
    Pause,
    Approve,
    Decline,
    Process { job_id: JobId },
}

impl Command {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Approve => "approve",
            Self::Decline => "decline",
            Self::Process { .. } => "process",
        }
    }
}

/// How driving one job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    AwaitingDecision,
    Skipped,
    Applied,
    /// Nothing to do; the job was already terminal.
    Settled,
    /// The job is untouched until an extraction environment connects.
    Stalled,
}

pub struct PipelineController {
    sync: Arc<SyncClient>,
    extractor: Arc<dyn PageExtractor>,
    analyzer: Arc<dyn Analyzer>,
    settings: Arc<dyn Database>,
    failure_delay: Duration,
    cursor: Mutex<()>,
    in_flight: RwLock<Option<(JobId, Stage)>>,
    events: broadcast::Sender<PipelineEvent>,
}

impl PipelineController {
    pub fn new(
        sync: Arc<SyncClient>,
        extractor: Arc<dyn PageExtractor>,
        analyzer: Arc<dyn Analyzer>,
        settings: Arc<dyn Database>,
        config: &PipelineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sync,
            extractor,
            analyzer,
            settings,
            failure_delay: config.failure_delay,
            cursor: Mutex::new(()),
            in_flight: RwLock::new(None),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// The job and stage currently being driven, if any.
    pub async fn in_flight(&self) -> Option<(JobId, Stage)> {
        self.in_flight.read().await.clone()
    }

    // ── User commands ───────────────────────────────────────────────

    pub async fn execute(&self, command: Command) -> Result<(), PipelineError> {
        match command {
            Command::Start => self.start().await.map(|_| ()),
            Command::Pause => self.pause().await,
            Command::Approve => self.approve_current().await,
            Command::Decline => self.decline_current().await,
            Command::Process { job_id } => self.process_specific(&job_id).await,
        }
    }

    /// Run `command` in the background. Failures are logged and broadcast.
    pub fn dispatch(self: &Arc<Self>, command: Command) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let label = command.label();
            if let Err(e) = controller.execute(command).await {
                warn!(command = label, error = %e, "Command failed");
                controller.emit(PipelineEvent::Failed {
                    command: label.to_string(),
                    reason: e.to_string(),
                });
            }
        })
    }

    /// Pre-flight, discover, then process until drained, paused, or a decision is due.
    ///
    /// Returns how many discovered listings were new. Pre-flight failures
    /// never touch a job.
    pub async fn start(&self) -> Result<usize, PipelineError> {
        let _cursor = self.claim().await?;
        let profile = self.load_profile().await?;

        let state = self.sync.get_state().await?;
        let current = self.current_job(&state).await?;
        if let Some(job) = &current
            && job.status == JobStatus::Reviewing
        {
            info!(job_id = %job.id, "Decision still pending, not starting");
            self.surface_decision(job.clone()).await?;
            return Ok(0);
        }

        let candidates = self
            .extractor
            .discover(&profile.keywords)
            .await
            .map_err(|e| match e {
                ExtractionError::NotOnTargetSite => PipelineError::Preflight(PreflightError::WrongSite),
                other => PipelineError::Extraction(other),
            })?;
        let found = candidates.len();
        let inserted = self.sync.append_jobs(candidates).await?;
        info!(found, inserted, keywords = %profile.search_terms(), "Pipeline started");

        // An interrupted job is finished before anything new is selected.
        let patch = StatePatch::default().paused(false);
        match current.filter(|j| !j.status.is_terminal()) {
            Some(job) => {
                info!(job_id = %job.id, status = %job.status, "Finishing interrupted job");
                self.sync
                    .update_state_lenient(patch.processing(true).current(Some(job.id.clone())))
                    .await?;
                let outcome = self.drive(job).await;
                if !self.proceed(outcome).await? {
                    return Ok(inserted);
                }
            }
            None => {
                self.sync.update_state_lenient(patch).await?;
            }
        }
        self.run_loop().await?;
        Ok(inserted)
    }

    /// Request a stop. Observed at the top of the loop; an in-flight call finishes first.
    pub async fn pause(&self) -> Result<(), PipelineError> {
        self.sync
            .update_state_lenient(StatePatch::default().paused(true))
            .await?;
        info!("Pause requested");
        if self.cursor.try_lock().is_ok() {
            self.emit(PipelineEvent::Paused);
        }
        Ok(())
    }

    /// Approve the job awaiting a decision, submit it, then keep processing.
    pub async fn approve_current(&self) -> Result<(), PipelineError> {
        let _cursor = self.claim().await?;
        let job = self.awaiting_decision().await?;

        let approved = self.sync.update_job(&job.id, JobChange::Approve).await?;
        info!(job_id = %approved.id, "Job approved");
        self.sync
            .update_state_lenient(
                StatePatch::default()
                    .processing(true)
                    .current(Some(approved.id.clone())),
            )
            .await?;

        let outcome = self.submit(approved).await;
        if self.proceed(outcome).await? {
            self.run_loop().await?;
        }
        Ok(())
    }

    /// Decline the job awaiting a decision without submitting, then keep processing.
    pub async fn decline_current(&self) -> Result<(), PipelineError> {
        let _cursor = self.claim().await?;
        let job = self.awaiting_decision().await?;

        let declined = self.sync.update_job(&job.id, JobChange::Decline).await?;
        info!(job_id = %declined.id, "Job declined");
        self.emit(PipelineEvent::JobSkipped { job: declined });
        self.run_loop().await
    }

    /// Process one chosen job now, then continue with the queue.
    ///
    /// A `reviewing` job has its decision re-surfaced; terminal jobs are rejected.
    pub async fn process_specific(&self, job_id: &str) -> Result<(), PipelineError> {
        let _cursor = self.claim().await?;
        let job = self
            .sync
            .job(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound {
                id: job_id.to_string(),
            })?;

        if job.status.is_terminal() {
            return Err(JobError::InvalidTransition {
                id: job.id,
                from: job.status,
                to: JobStatus::Reviewing,
            }
            .into());
        }
        if job.status == JobStatus::Reviewing {
            self.surface_decision(job).await?;
            return Ok(());
        }

        self.load_profile().await?;
        info!(job_id = %job.id, status = %job.status, "Processing specific job");
        self.sync
            .update_state_lenient(
                StatePatch::default()
                    .processing(true)
                    .paused(false)
                    .current(Some(job.id.clone())),
            )
            .await?;

        let outcome = self.drive(job).await;
        if self.proceed(outcome).await? {
            self.run_loop().await?;
        }
        Ok(())
    }

    pub async fn toggle_star(&self, job_id: &str) -> Result<Job, PipelineError> {
        Ok(self.sync.update_job(job_id, JobChange::ToggleStar).await?)
    }

    /// Destroy every job and reset state. Does not wait for an in-flight call.
    pub async fn clear_all(&self) -> Result<usize, PipelineError> {
        Ok(self.sync.clear_all().await?)
    }

    // ── Attachment ──────────────────────────────────────────────────

    /// Reconcile with the durable context after this context was (re)created.
    ///
    /// Re-enters the current job at the stage its persisted status implies,
    /// and re-surfaces a pending decision even when processing is off.
    pub async fn attach(&self) -> Result<(), PipelineError> {
        let state = self.sync.get_state().await?;
        info!(
            is_processing = state.is_processing,
            is_paused = state.is_paused,
            current_job = ?state.current_job_id,
            "Attached to durable context"
        );
        self.resume(true).await
    }

    /// Pick processing back up from canonical state. Ignored while another
    /// operation holds the cursor.
    pub async fn resume(&self, surface_review: bool) -> Result<(), PipelineError> {
        let Ok(_cursor) = self.cursor.try_lock() else {
            debug!("Cursor held, ignoring resume");
            return Ok(());
        };

        let state = self.sync.get_state().await?;
        match self.current_job(&state).await? {
            Some(job) if job.status == JobStatus::Reviewing => {
                if surface_review || state.is_processing {
                    self.surface_decision(job).await?;
                }
                return Ok(());
            }
            Some(job) if state.should_run() && !job.status.is_terminal() => {
                info!(job_id = %job.id, status = %job.status, "Resuming current job");
                let outcome = self.drive(job).await;
                if !self.proceed(outcome).await? {
                    return Ok(());
                }
            }
            _ => {}
        }

        if state.should_run() {
            self.run_loop().await
        } else {
            Ok(())
        }
    }

    /// Listen for `CONTINUE` from the durable context and resume on each.
    ///
    /// Holds only a weak reference; the task ends after the controller is dropped.
    pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut rx = self.sync.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(Notification::Continue { job }) => {
                        let Some(controller) = weak.upgrade() else {
                            break;
                        };
                        debug!(job_id = %job.id, "Continue received");
                        tokio::spawn(async move {
                            if let Err(e) = controller.resume(false).await {
                                warn!(error = %e, "Resume after continue failed");
                            }
                        });
                    }
                    Ok(Notification::PersistFailed { error }) => {
                        warn!(error = %error, "Durable context could not persist");
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "Continue listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Continue listener stopped");
        })
    }

    // ── Scheduling loop ─────────────────────────────────────────────

    /// Select and drive pending jobs until paused, drained, stalled, or a
    /// decision is due. The caller holds the cursor.
    async fn run_loop(&self) -> Result<(), PipelineError> {
        loop {
            if self.sync.get_state().await?.is_paused {
                info!("Pipeline paused");
                self.emit(PipelineEvent::Paused);
                return Ok(());
            }
            let Some(job) = self.select_next().await? else {
                return Ok(());
            };
            let outcome = self.drive(job).await;
            if !self.proceed(outcome).await? {
                return Ok(());
            }
        }
    }

    /// Make the first pending job current, or record that the queue is drained.
    ///
    /// `is_processing` and `current_job_id` change in one patch.
    async fn select_next(&self) -> Result<Option<Job>, PipelineError> {
        let Some(job) = self.sync.next_pending().await? else {
            self.sync
                .update_state_lenient(StatePatch::default().processing(false).current(None))
                .await?;
            info!("Queue drained");
            self.emit(PipelineEvent::Drained);
            return Ok(None);
        };
        self.sync
            .update_state_lenient(
                StatePatch::default()
                    .processing(true)
                    .current(Some(job.id.clone())),
            )
            .await?;
        Ok(Some(job))
    }

    /// Settle one job, then decide whether another may be selected.
    ///
    /// The durable side hands a finished current job over to the next pending
    /// one. Processing found off with work still pending was stopped elsewhere.
    async fn proceed(&self, result: Result<Outcome, PipelineError>) -> Result<bool, PipelineError> {
        if !self.settle(result).await? {
            return Ok(false);
        }
        if self.sync.get_state().await?.is_processing || self.sync.next_pending().await?.is_none() {
            return Ok(true);
        }
        info!("Processing stopped elsewhere");
        Ok(false)
    }

    /// Apply the failure policy to one job's outcome. `Ok(true)` means the
    /// loop may select the next job.
    async fn settle(&self, result: Result<Outcome, PipelineError>) -> Result<bool, PipelineError> {
        *self.in_flight.write().await = None;
        match result {
            Ok(Outcome::AwaitingDecision | Outcome::Stalled) => Ok(false),
            Ok(Outcome::Skipped) => {
                tokio::time::sleep(self.failure_delay).await;
                Ok(true)
            }
            Ok(Outcome::Applied | Outcome::Settled) => Ok(true),
            Err(PipelineError::Sync(SyncError::Rejected(e))) => {
                warn!(error = %e, "Job changed underneath the controller, moving on");
                Ok(true)
            }
            Err(e) => {
                error!(error = %e, "Pipeline stopped");
                if let Err(halt) = self
                    .sync
                    .update_state_lenient(StatePatch::default().processing(false))
                    .await
                {
                    warn!(error = %halt, "Could not record stop");
                }
                Err(e)
            }
        }
    }

    /// Enter `job` at the stage its persisted status implies.
    async fn drive(&self, job: Job) -> Result<Outcome, PipelineError> {
        match Stage::resume_point(job.status) {
            Some(Stage::ExtractingDescription | Stage::Analyzing) => {
                self.extract_and_analyze(job).await
            }
            Some(Stage::AwaitingDecision) => self.surface_decision(job).await,
            Some(Stage::Applying) => self.resume_submission(job).await,
            None => {
                debug!(job_id = %job.id, status = %job.status, "Job already finished");
                Ok(Outcome::Settled)
            }
        }
    }

    async fn extract_and_analyze(&self, job: Job) -> Result<Outcome, PipelineError> {
        let profile = self.load_profile().await?;

        self.enter(&job, Stage::ExtractingDescription).await;
        let description = match self.extractor.extract_description(&job).await {
            Ok(text) => text,
            Err(ExtractionError::Unavailable) => return Ok(self.stall(job)),
            Err(e) => return self.skip(&job, e.to_string()).await,
        };

        self.enter(&job, Stage::Analyzing).await;
        let mut subject = job.clone();
        subject.description = Some(description.clone());
        let analysis = match self.analyzer.analyze(&subject, &profile).await {
            Ok(analysis) => analysis,
            Err(e) => return self.skip(&job, e.to_string()).await,
        };

        let reviewed = self
            .sync
            .update_job(
                &job.id,
                JobChange::Review {
                    description,
                    score: analysis.score,
                    content: analysis.content,
                },
            )
            .await?;
        self.surface_decision(reviewed).await
    }

    /// Stop the loop and hand `job` to the user.
    async fn surface_decision(&self, job: Job) -> Result<Outcome, PipelineError> {
        self.enter(&job, Stage::AwaitingDecision).await;
        self.sync
            .update_state_lenient(
                StatePatch::default()
                    .processing(false)
                    .current(Some(job.id.clone())),
            )
            .await?;
        info!(job_id = %job.id, score = ?job.compatibility_score, "Awaiting decision");
        self.emit(PipelineEvent::AwaitingDecision { job });
        Ok(Outcome::AwaitingDecision)
    }

    async fn submit(&self, job: Job) -> Result<Outcome, PipelineError> {
        self.enter(&job, Stage::Applying).await;
        let content = job.generated_content.clone().unwrap_or_default();
        match self.extractor.submit(&job, &content).await {
            Ok(()) => self.mark_applied(&job).await,
            Err(ExtractionError::Unavailable) => Ok(self.stall(job)),
            Err(e @ ExtractionError::Timeout(_)) => self.verify_unanswered(job, e).await,
            Err(e) => self.skip(&job, e.to_string()).await,
        }
    }

    /// A submission whose result never arrived may still have gone through.
    async fn verify_unanswered(&self, job: Job, error: ExtractionError) -> Result<Outcome, PipelineError> {
        match self.extractor.submission_status(&job).await {
            Ok(SubmissionStatus::Submitted) => {
                info!(job_id = %job.id, "Unanswered submission went through");
                self.mark_applied(&job).await
            }
            Err(ExtractionError::Unavailable) => Ok(self.stall(job)),
            Ok(status) => {
                debug!(job_id = %job.id, status = ?status, "Unanswered submission not confirmed");
                self.skip(&job, error.to_string()).await
            }
            Err(check) => {
                warn!(job_id = %job.id, error = %check, "Could not verify unanswered submission");
                self.skip(&job, error.to_string()).await
            }
        }
    }

    /// Re-enter `applying` after a restart. The previous attempt may have
    /// gone through, so ask the site before submitting again.
    async fn resume_submission(&self, job: Job) -> Result<Outcome, PipelineError> {
        self.enter(&job, Stage::Applying).await;
        match self.extractor.submission_status(&job).await {
            Ok(SubmissionStatus::Submitted) => {
                info!(job_id = %job.id, "Earlier submission went through");
                self.mark_applied(&job).await
            }
            Ok(SubmissionStatus::NotSubmitted) => self.submit(job).await,
            Ok(SubmissionStatus::Unknown) => {
                warn!(job_id = %job.id, "Submission status unknown, submitting again");
                self.submit(job).await
            }
            Err(ExtractionError::Unavailable) => Ok(self.stall(job)),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Could not verify submission, submitting again");
                self.submit(job).await
            }
        }
    }

    async fn mark_applied(&self, job: &Job) -> Result<Outcome, PipelineError> {
        let applied = self.sync.update_job(&job.id, JobChange::Submitted).await?;
        info!(job_id = %applied.id, "Application submitted");
        self.emit(PipelineEvent::JobApplied { job: applied });
        Ok(Outcome::Applied)
    }

    /// Leave `job` and the processing flag as they are until an environment connects.
    fn stall(&self, job: Job) -> Outcome {
        warn!(job_id = %job.id, status = %job.status, "No extraction environment, pipeline stalled");
        self.emit(PipelineEvent::Stalled { job });
        Outcome::Stalled
    }

    async fn skip(&self, job: &Job, reason: String) -> Result<Outcome, PipelineError> {
        warn!(job_id = %job.id, reason = %reason, "Skipping job");
        let skipped = self
            .sync
            .update_job(&job.id, JobChange::Skip { error: reason })
            .await?;
        self.emit(PipelineEvent::JobSkipped { job: skipped });
        Ok(Outcome::Skipped)
    }

    // ── Helpers ─────────────────────────────────────────────────────

    /// Take the cursor for a user command. A command arriving while the
    /// previous one is wrapping up waits up to `CLAIM_GRACE`.
    async fn claim(&self) -> Result<MutexGuard<'_, ()>, PipelineError> {
        tokio::time::timeout(CLAIM_GRACE, self.cursor.lock())
            .await
            .map_err(|_| PipelineError::Busy)
    }

    async fn enter(&self, job: &Job, stage: Stage) {
        debug!(job_id = %job.id, stage = %stage, "Entering stage");
        *self.in_flight.write().await = Some((job.id.clone(), stage));
    }

    fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn load_profile(&self) -> Result<Profile, PipelineError> {
        let profile = Profile::load(self.settings.as_ref())
            .await?
            .ok_or(PreflightError::MissingProfile)?;
        profile.preflight()?;
        Ok(profile)
    }

    async fn current_job(&self, state: &ApplicationState) -> Result<Option<Job>, PipelineError> {
        match &state.current_job_id {
            Some(id) => Ok(self.sync.job(id).await?),
            None => Ok(None),
        }
    }

    async fn awaiting_decision(&self) -> Result<Job, PipelineError> {
        let state = self.sync.get_state().await?;
        match self.current_job(&state).await? {
            Some(job) if job.status == JobStatus::Reviewing => Ok(job),
            _ => Err(JobError::NoCurrentJob.into()),
        }
    }
}
