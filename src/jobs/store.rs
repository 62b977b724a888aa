//! Ordered, de-duplicated, write-through job collection.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::model::{Candidate, Job, JobChange, JobStatus, StatusCounts};
use crate::error::{DatabaseError, JobError, StateError};
use crate::store::{Database, TransitionRecord, Written, keys};

/// Read-only, restartable view of the store at one point in time.
///
/// Later mutations are never visible through an existing snapshot.
#[derive(Debug, Clone, Default)]
pub struct JobSnapshot(Arc<Vec<Job>>);

impl JobSnapshot {
    pub fn iter(&self) -> std::slice::Iter<'_, Job> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Job> {
        self.0.as_ref().clone()
    }
}

impl<'a> IntoIterator for &'a JobSnapshot {
    type Item = &'a Job;
    type IntoIter = std::slice::Iter<'a, Job>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Persisted job collection in discovery order.
///
/// Every mutation holds the write lock across its durable write, so storage
/// sees mutations in the same order memory does.
pub struct JobStore {
    jobs: RwLock<Arc<Vec<Job>>>,
    db: Arc<dyn Database>,
}

impl JobStore {
    /// Load the job collection from storage. A missing key is an empty store.
    pub async fn load(db: Arc<dyn Database>) -> Result<Self, DatabaseError> {
        let jobs: Vec<Job> = match db.get_value(keys::JOBS).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| DatabaseError::Serialization(format!("jobs: {e}")))?,
            None => Vec::new(),
        };
        info!(count = jobs.len(), "Job store loaded");
        Ok(Self {
            jobs: RwLock::new(Arc::new(jobs)),
            db,
        })
    }

    /// Insert candidates whose ids are not already present. The only
    /// insertion path; duplicates within the batch are also dropped.
    pub async fn append_unique(&self, candidates: Vec<Candidate>) -> Written<usize> {
        let mut jobs = self.jobs.write().await;
        let mut seen: HashSet<String> = jobs.iter().map(|j| j.id.clone()).collect();

        let fresh: Vec<Job> = candidates
            .into_iter()
            .filter(|c| seen.insert(c.id.clone()))
            .map(Job::discovered)
            .collect();
        let inserted = fresh.len();

        if inserted == 0 {
            debug!("No new jobs in batch");
            return Written {
                value: 0,
                persist_error: None,
            };
        }

        Arc::make_mut(&mut *jobs).extend(fresh);
        info!(inserted, total = jobs.len(), "Appended new jobs");

        let persist_error = self.persist(&jobs).await.err();
        Written {
            value: inserted,
            persist_error,
        }
    }

    /// Look up a job by id.
    pub async fn find(&self, id: &str) -> Option<Job> {
        self.jobs.read().await.iter().find(|j| j.id == id).cloned()
    }

    /// First job in discovery order whose status is `pending`.
    pub async fn next_pending(&self) -> Option<Job> {
        self.jobs
            .read()
            .await
            .iter()
            .find(|j| j.status == JobStatus::Pending)
            .cloned()
    }

    /// Atomic read-modify-write of one job, persisted after the mutation.
    ///
    /// The mutator works on a copy; if it fails, the store is unchanged.
    pub async fn update<F>(&self, id: &str, mutator: F) -> Result<Written<Job>, JobError>
    where
        F: FnOnce(&mut Job) -> Result<(), JobError>,
    {
        let mut jobs = self.jobs.write().await;
        let index = jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or_else(|| JobError::NotFound { id: id.to_string() })?;

        let before = jobs[index].status;
        let mut updated = jobs[index].clone();
        mutator(&mut updated)?;
        Arc::make_mut(&mut *jobs)[index] = updated.clone();

        let persist_error = self.persist(&jobs).await.err();
        drop(jobs);

        if updated.status != before {
            info!(job_id = %id, from = %before, to = %updated.status, "Job transitioned");
            self.record_transition(&updated, before).await;
        }

        Ok(Written {
            value: updated,
            persist_error,
        })
    }

    /// Apply a typed change to one job.
    pub async fn apply(&self, id: &str, change: &JobChange) -> Result<Written<Job>, JobError> {
        debug!(job_id = %id, change = change.label(), "Applying job change");
        self.update(id, |job| job.apply(change)).await
    }

    /// Snapshot of every job in discovery order.
    pub async fn all(&self) -> JobSnapshot {
        JobSnapshot(Arc::clone(&*self.jobs.read().await))
    }

    /// Per-status counts.
    pub async fn counts(&self) -> StatusCounts {
        StatusCounts::tally(self.jobs.read().await.iter())
    }

    /// Destroy every job and the audit trail.
    pub async fn clear(&self) -> Written<usize> {
        let mut jobs = self.jobs.write().await;
        let removed = jobs.len();
        *jobs = Arc::new(Vec::new());

        let persist_error = match self.db.delete_value(keys::JOBS).await {
            Ok(_) => None,
            Err(e) => {
                error!(error = %e, "Failed to clear persisted jobs");
                Some(StateError::PersistFailed(e.to_string()))
            }
        };
        if let Err(e) = self.db.clear_transitions().await {
            warn!(error = %e, "Failed to clear job audit trail");
        }

        info!(removed, "Job store cleared");
        Written {
            value: removed,
            persist_error,
        }
    }

    async fn persist(&self, jobs: &[Job]) -> Result<(), StateError> {
        let value = serde_json::to_value(jobs)
            .map_err(|e| StateError::PersistFailed(e.to_string()))?;
        self.db.set_value(keys::JOBS, &value).await.map_err(|e| {
            error!(error = %e, "Failed to persist jobs, keeping in-memory copy");
            StateError::PersistFailed(e.to_string())
        })
    }

    async fn record_transition(&self, job: &Job, from: JobStatus) {
        let record = TransitionRecord {
            job_id: job.id.clone(),
            from,
            to: job.status,
            reason: if job.status == JobStatus::Skipped {
                job.last_error.clone()
            } else {
                None
            },
            at: Utc::now(),
        };
        if let Err(e) = self.db.record_transition(&record).await {
            warn!(job_id = %job.id, error = %e, "Failed to record job transition");
        }
    }
}
