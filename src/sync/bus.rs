//! Message bus between contexts, and the ephemeral side's client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{Notification, Request, Response};
use super::state::{ApplicationState, StatePatch};
use super::supervisor::Supervisor;
use crate::error::{StateError, SyncError};
use crate::jobs::{Candidate, Job, JobChange, StatusCounts};

const REQUEST_QUEUE: usize = 64;

/// Request/response plus fire-and-forget notifications.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn request(&self, request: Request) -> Result<Response, SyncError>;

    /// Start receiving notifications from the durable context.
    fn subscribe(&self) -> broadcast::Receiver<Notification>;
}

struct Envelope {
    request: Request,
    reply: oneshot::Sender<Response>,
}

/// In-process bus to a `Supervisor` served by a single task.
///
/// Requests are applied one at a time in arrival order.
#[derive(Clone)]
pub struct LocalBus {
    tx: mpsc::Sender<Envelope>,
    supervisor: Arc<Supervisor>,
}

impl LocalBus {
    /// Spawn the task serving `supervisor`. It stops when every bus clone is dropped.
    pub fn spawn(supervisor: Arc<Supervisor>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Envelope>(REQUEST_QUEUE);
        let serving = Arc::clone(&supervisor);
        let handle = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let label = envelope.request.label();
                let response = serving.handle(envelope.request).await;
                if envelope.reply.send(response).is_err() {
                    debug!(request = label, "Requester went away before the response");
                }
            }
            info!("Supervisor bus closed");
        });
        (Self { tx, supervisor }, handle)
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn request(&self, request: Request) -> Result<Response, SyncError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Envelope { request, reply })
            .await
            .map_err(|_| SyncError::Disconnected)?;
        response.await.map_err(|_| SyncError::Disconnected)
    }

    fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.supervisor.attach()
    }
}

/// Ephemeral side of the synchronizer.
///
/// Holds a read cache of `ApplicationState`, refreshed on attach and from
/// every state-bearing response. Never writes state itself.
pub struct SyncClient {
    bus: Arc<dyn MessageBus>,
    cache: RwLock<ApplicationState>,
    timeout: Duration,
}

impl SyncClient {
    pub fn new(bus: Arc<dyn MessageBus>, timeout: Duration) -> Self {
        Self {
            bus,
            cache: RwLock::new(ApplicationState::default()),
            timeout,
        }
    }

    async fn call(&self, request: Request) -> Result<Response, SyncError> {
        let label = request.label();
        match tokio::time::timeout(self.timeout, self.bus.request(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(request = label, "Durable context did not answer in time");
                Err(SyncError::Timeout(self.timeout))
            }
        }
    }

    /// Fetch canonical state and refresh the cache.
    pub async fn get_state(&self) -> Result<ApplicationState, SyncError> {
        let state = self.call(Request::GetState).await?.into_state()?;
        *self.cache.write().await = state.clone();
        Ok(state)
    }

    /// Last state seen from the durable context.
    pub async fn cached_state(&self) -> ApplicationState {
        self.cache.read().await.clone()
    }

    /// Send a partial update. The cache follows the durable copy even when
    /// persistence failed; the failure is reported as `SyncError::State`.
    pub async fn update_state(&self, partial: StatePatch) -> Result<ApplicationState, SyncError> {
        let (ack, state) = self
            .call(Request::UpdateState { partial })
            .await?
            .into_ack()?;
        *self.cache.write().await = state.clone();
        if !ack {
            return Err(SyncError::State(StateError::PersistFailed(
                "state update not persisted".into(),
            )));
        }
        Ok(state)
    }

    /// Like `update_state`, but a persistence failure is only logged.
    pub async fn update_state_lenient(
        &self,
        partial: StatePatch,
    ) -> Result<ApplicationState, SyncError> {
        match self.update_state(partial).await {
            Err(SyncError::State(e)) => {
                warn!(error = %e, "Continuing with unpersisted state");
                Ok(self.cached_state().await)
            }
            other => other,
        }
    }

    pub async fn jobs(&self) -> Result<(Vec<Job>, StatusCounts), SyncError> {
        self.call(Request::GetJobs).await?.into_jobs()
    }

    pub async fn job(&self, job_id: &str) -> Result<Option<Job>, SyncError> {
        self.call(Request::GetJob {
            job_id: job_id.to_string(),
        })
        .await?
        .into_job()
    }

    pub async fn next_pending(&self) -> Result<Option<Job>, SyncError> {
        self.call(Request::NextPending).await?.into_job()
    }

    /// Returns how many candidates were new.
    pub async fn append_jobs(&self, candidates: Vec<Candidate>) -> Result<usize, SyncError> {
        self.call(Request::AppendJobs { candidates })
            .await?
            .into_appended()
    }

    pub async fn update_job(&self, job_id: &str, change: JobChange) -> Result<Job, SyncError> {
        self.call(Request::UpdateJob {
            job_id: job_id.to_string(),
            change,
        })
        .await?
        .into_updated_job()
    }

    pub async fn clear_all(&self) -> Result<usize, SyncError> {
        let removed = self.call(Request::ClearAll).await?.into_cleared()?;
        *self.cache.write().await = ApplicationState::default();
        Ok(removed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.bus.subscribe()
    }
}
