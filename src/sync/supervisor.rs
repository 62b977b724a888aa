//! Durable context: sole owner and writer of jobs and `ApplicationState`.
//!
//! Every request is applied and persisted here before the response is sent.
//! Attached ephemeral contexts receive best-effort notifications; a context
//! that is gone simply misses them and catches up with `GET_STATE` on attach.

use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info, warn};

use super::protocol::{Notification, Request, Response};
use super::state::{ApplicationState, StatePatch};
use crate::error::{DatabaseError, StateError};
use crate::jobs::{Candidate, Job, JobChange, JobStore};
use crate::store::{Database, Written, keys};

/// Buffered notifications per attached context.
const NOTIFICATION_CAPACITY: usize = 64;

pub struct Supervisor {
    jobs: JobStore,
    state: Mutex<ApplicationState>,
    db: Arc<dyn Database>,
    notify_tx: broadcast::Sender<Notification>,
}

impl Supervisor {
    /// Load jobs and the last persisted state.
    pub async fn load(db: Arc<dyn Database>) -> Result<Self, DatabaseError> {
        let jobs = JobStore::load(Arc::clone(&db)).await?;
        let state: ApplicationState = match db.get_value(keys::APPLICATION_STATE).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| DatabaseError::Serialization(format!("application_state: {e}")))?,
            None => ApplicationState::default(),
        };
        info!(
            is_processing = state.is_processing,
            is_paused = state.is_paused,
            current_job = ?state.current_job_id,
            "Application state loaded"
        );

        let (notify_tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Ok(Self {
            jobs,
            state: Mutex::new(state),
            db,
            notify_tx,
        })
    }

    /// Register an ephemeral context for notifications.
    pub fn attach(&self) -> broadcast::Receiver<Notification> {
        debug!(attached = self.notify_tx.receiver_count() + 1, "Context attached");
        self.notify_tx.subscribe()
    }

    pub async fn handle(&self, request: Request) -> Response {
        debug!(request = request.label(), "Handling request");
        match request {
            Request::GetState => Response::State {
                state: self.get_state().await,
            },
            Request::UpdateState { partial } => {
                let written = self.update_state(&partial).await;
                Response::Ack {
                    ack: written.persisted(),
                    state: written.value,
                }
            }
            Request::GetJobs => Response::Jobs {
                jobs: self.jobs.all().await.to_vec(),
                counts: self.jobs.counts().await,
            },
            Request::GetJob { job_id } => Response::Job {
                job: self.jobs.find(&job_id).await,
            },
            Request::NextPending => Response::Job {
                job: self.jobs.next_pending().await,
            },
            Request::AppendJobs { candidates } => {
                let written = self.append_jobs(candidates).await;
                Response::Appended {
                    inserted: written.value,
                    persisted: written.persisted(),
                }
            }
            Request::UpdateJob { job_id, change } => match self.update_job(&job_id, &change).await {
                Ok(written) => Response::JobUpdated {
                    persisted: written.persisted(),
                    job: written.value,
                },
                Err(error) => {
                    warn!(job_id = %job_id, change = change.label(), error = %error, "Job change rejected");
                    Response::Rejected { error }
                }
            },
            Request::ClearAll => {
                let written = self.clear_all().await;
                Response::Cleared {
                    removed: written.value,
                    persisted: written.persisted(),
                }
            }
        }
    }

    /// Canonical state with a dangling `current_job_id` reported as `None`.
    pub async fn get_state(&self) -> ApplicationState {
        let mut state = self.state.lock().await.clone();
        if let Some(id) = &state.current_job_id
            && self.jobs.find(id).await.is_none()
        {
            debug!(job_id = %id, "Current job no longer exists");
            state.current_job_id = None;
        }
        state
    }

    /// Merge, persist, and if processing is on, ask an attached context to continue.
    pub async fn update_state(&self, patch: &StatePatch) -> Written<ApplicationState> {
        let written = {
            let mut state = self.state.lock().await;
            state.merge(patch);
            let persist_error = self.persist_state(&state).await.err();
            Written {
                value: state.clone(),
                persist_error,
            }
        };
        debug!(
            is_processing = written.value.is_processing,
            is_paused = written.value.is_paused,
            current_job = ?written.value.current_job_id,
            "State updated"
        );

        self.announce_persist(&written);
        self.notify(Notification::StateChanged {
            state: written.value.clone(),
        });
        if written.value.is_processing {
            self.arm_continue(&written.value).await;
        }
        written
    }

    async fn append_jobs(&self, candidates: Vec<Candidate>) -> Written<usize> {
        let written = self.jobs.append_unique(candidates).await;
        self.announce_persist(&written);
        if written.value > 0 {
            self.notify_jobs_changed().await;
        }
        written
    }

    /// Apply `change`; a current job that reaches a terminal status is released.
    ///
    /// While processing, the next pending job becomes current in the same
    /// write. With nothing left, processing is switched off.
    async fn update_job(
        &self,
        job_id: &str,
        change: &JobChange,
    ) -> Result<Written<Job>, crate::error::JobError> {
        let mut written = self.jobs.apply(job_id, change).await?;

        let mut released = None;
        if written.value.status.is_terminal() {
            let mut state = self.state.lock().await;
            if state.current_job_id.as_deref() == Some(job_id) {
                let next = if state.is_processing {
                    self.jobs.next_pending().await
                } else {
                    None
                };
                state.is_processing = next.is_some();
                state.current_job_id = next.map(|job| job.id);
                if let Err(e) = self.persist_state(&state).await {
                    written.persist_error.get_or_insert(e);
                }
                debug!(
                    job_id = %job_id,
                    status = %written.value.status,
                    next = ?state.current_job_id,
                    "Released finished current job"
                );
                released = Some(state.clone());
            }
        }

        self.announce_persist(&written);
        if let Some(state) = released {
            self.notify(Notification::StateChanged { state });
        }
        self.notify_jobs_changed().await;
        Ok(written)
    }

    /// Destroy every job and reset state to its initial value.
    pub async fn clear_all(&self) -> Written<usize> {
        let mut written = self.jobs.clear().await;
        let state = {
            let mut state = self.state.lock().await;
            *state = ApplicationState::default();
            if let Err(e) = self.persist_state(&state).await {
                written.persist_error.get_or_insert(e);
            }
            state.clone()
        };
        info!(removed = written.value, "Cleared all jobs and state");

        self.announce_persist(&written);
        self.notify(Notification::StateChanged { state });
        self.notify_jobs_changed().await;
        written
    }

    /// Best-effort `CONTINUE` for the job processing should pick up.
    async fn arm_continue(&self, state: &ApplicationState) {
        let current = match &state.current_job_id {
            Some(id) => self.jobs.find(id).await.filter(|j| !j.status.is_terminal()),
            None => None,
        };
        let job = match current {
            Some(job) => Some(job),
            None => self.jobs.next_pending().await,
        };
        match job {
            Some(job) => self.notify_continue(job),
            None => debug!("Processing on but nothing to continue"),
        }
    }

    /// Tell attached contexts to continue with `job`. Never fails.
    pub fn notify_continue(&self, job: Job) {
        let job_id = job.id.clone();
        if self.notify_tx.send(Notification::Continue { job }).is_err() {
            info!(job_id = %job_id, "No context attached, processing waits for the next attach");
        }
    }

    fn notify(&self, notification: Notification) {
        // No receivers is normal between attachments.
        let _ = self.notify_tx.send(notification);
    }

    async fn notify_jobs_changed(&self) {
        self.notify(Notification::JobsChanged {
            counts: self.jobs.counts().await,
        });
    }

    fn announce_persist<T>(&self, written: &Written<T>) {
        if let Some(error) = &written.persist_error {
            self.notify(Notification::PersistFailed {
                error: error.clone(),
            });
        }
    }

    async fn persist_state(&self, state: &ApplicationState) -> Result<(), StateError> {
        let value =
            serde_json::to_value(state).map_err(|e| StateError::PersistFailed(e.to_string()))?;
        self.db
            .set_value(keys::APPLICATION_STATE, &value)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to persist application state, keeping in-memory copy");
                StateError::PersistFailed(e.to_string())
            })
    }
}
