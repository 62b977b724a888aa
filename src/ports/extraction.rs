//! Page extraction port: listing discovery, description extraction, submission.
//!
//! `MessagePageExtractor` drives a remote extraction environment over the
//! `ExtractionCommand` / `ExtractionEvent` protocol. Every exchange waits for
//! an explicit readiness event under a timeout. With no environment connected,
//! or once it disconnects mid-exchange, calls fail with
//! `ExtractionError::Unavailable`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::ExtractionError;
use crate::jobs::model::{Candidate, Job};
use crate::sync::protocol::{ExtractionCommand, ExtractionEvent};

/// Buffered commands/events per direction.
const LINK_CAPACITY: usize = 32;

/// Whether the target site already holds an application for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Submitted,
    NotSubmitted,
    Unknown,
}

#[async_trait]
pub trait PageExtractor: Send + Sync {
    /// Listings matching `keywords`. May be empty.
    async fn discover(&self, keywords: &[String]) -> Result<Vec<Candidate>, ExtractionError>;

    async fn extract_description(&self, job: &Job) -> Result<String, ExtractionError>;

    async fn submit(&self, job: &Job, content: &str) -> Result<(), ExtractionError>;

    /// Ask the site whether `job` was already submitted.
    async fn submission_status(&self, job: &Job) -> Result<SubmissionStatus, ExtractionError>;
}

/// A command queued for the extraction environment.
#[derive(Debug)]
pub struct Outbound {
    pub command: ExtractionCommand,
    expires_at: Instant,
}

impl Outbound {
    /// The adapter stopped waiting for an answer; the command must not run.
    pub fn is_abandoned(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// The extraction environment's end of a `MessagePageExtractor`.
pub struct ExtractionLink {
    pub commands: mpsc::Receiver<Outbound>,
    pub events: mpsc::Sender<ExtractionEvent>,
    connected: watch::Sender<bool>,
}

impl ExtractionLink {
    /// Mark whether an environment is serving this link.
    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }
}

pub struct MessagePageExtractor {
    commands: mpsc::Sender<Outbound>,
    /// Held for a whole exchange so answers are never stolen by another call.
    events: Mutex<mpsc::Receiver<ExtractionEvent>>,
    connected: watch::Receiver<bool>,
    extraction_timeout: Duration,
    submission_timeout: Duration,
}

impl MessagePageExtractor {
    /// Create an adapter and the link the extraction environment serves.
    pub fn channel(config: &PipelineConfig) -> (Self, ExtractionLink) {
        let (command_tx, command_rx) = mpsc::channel(LINK_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(LINK_CAPACITY);
        let (connected_tx, connected_rx) = watch::channel(false);
        let adapter = Self {
            commands: command_tx,
            events: Mutex::new(event_rx),
            connected: connected_rx,
            extraction_timeout: config.extraction_timeout,
            submission_timeout: config.submission_timeout,
        };
        let link = ExtractionLink {
            commands: command_rx,
            events: event_tx,
            connected: connected_tx,
        };
        (adapter, link)
    }

    /// Send `command` and wait for the first event `matcher` accepts.
    ///
    /// `None` means no answer arrived within `wait`. The command expires at
    /// the same moment, so an environment that picks it up later drops it.
    /// Events left over from an earlier exchange are discarded first.
    async fn exchange<T, F>(
        &self,
        command: ExtractionCommand,
        wait: Duration,
        mut matcher: F,
    ) -> Option<Result<T, ExtractionError>>
    where
        F: FnMut(ExtractionEvent) -> Option<Result<T, ExtractionError>> + Send,
        T: Send,
    {
        let mut connection = self.connected.clone();
        let up = *connection.borrow_and_update();
        if !up {
            debug!(command = command.label(), "No extraction environment connected");
            return Some(Err(ExtractionError::Unavailable));
        }

        let mut events = self.events.lock().await;
        while let Ok(stale) = events.try_recv() {
            debug!(event_job = ?stale.job_id(), "Discarding stale extraction event");
        }

        let outbound = Outbound {
            command,
            expires_at: Instant::now() + wait,
        };
        let waited = tokio::time::timeout(wait, async {
            if self.commands.send(outbound).await.is_err() {
                return Err(ExtractionError::Unavailable);
            }
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = disconnected(&mut connection) => None,
                };
                let Some(event) = event else {
                    warn!("Extraction environment went away mid-exchange");
                    return Err(ExtractionError::Unavailable);
                };
                let event_job = event.job_id().map(str::to_string);
                match matcher(event) {
                    Some(result) => return result,
                    None => debug!(event_job = ?event_job, "Ignoring unrelated extraction event"),
                }
            }
        })
        .await;

        waited.ok()
    }
}

/// Resolves once no environment serves the link.
async fn disconnected(connection: &mut watch::Receiver<bool>) {
    loop {
        let up = *connection.borrow_and_update();
        if !up || connection.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl PageExtractor for MessagePageExtractor {
    async fn discover(&self, keywords: &[String]) -> Result<Vec<Candidate>, ExtractionError> {
        let command = ExtractionCommand::Discover {
            keywords: keywords.to_vec(),
        };
        let result = self
            .exchange(command, self.extraction_timeout, |event| match event {
                ExtractionEvent::ListingsFound { error: Some(e), .. } => Some(Err(e)),
                ExtractionEvent::ListingsFound { candidates, .. } => Some(Ok(candidates)),
                _ => None,
            })
            .await
            .unwrap_or_else(|| Err(ExtractionError::Timeout("listings".into())))?;

        info!(found = result.len(), "Listings discovered");
        Ok(result)
    }

    async fn extract_description(&self, job: &Job) -> Result<String, ExtractionError> {
        let command = ExtractionCommand::ExtractDescription {
            job_id: job.id.clone(),
            source_url: job.source_url.clone(),
        };
        self.exchange(command, self.extraction_timeout, |event| match event {
            ExtractionEvent::DescriptionFound {
                job_id,
                text,
                error,
            } if job_id == job.id => Some(match (text, error) {
                (_, Some(e)) => Err(e),
                (Some(text), None) if !text.trim().is_empty() => Ok(text),
                _ => Err(ExtractionError::DescriptionNotFound),
            }),
            _ => None,
        })
        .await
        .unwrap_or_else(|| {
            warn!(job_id = %job.id, "No description before timeout");
            Err(ExtractionError::DescriptionNotFound)
        })
    }

    async fn submit(&self, job: &Job, content: &str) -> Result<(), ExtractionError> {
        let command = ExtractionCommand::Submit {
            job_id: job.id.clone(),
            source_url: job.source_url.clone(),
            content: content.to_string(),
        };
        self.exchange(command, self.submission_timeout, |event| match event {
            ExtractionEvent::SubmitResult {
                job_id,
                success,
                error,
            } if job_id == job.id => Some(match (success, error) {
                (true, _) => Ok(()),
                (false, Some(e)) => Err(e),
                (false, None) => Err(ExtractionError::SubmitFailed("no reason given".into())),
            }),
            _ => None,
        })
        .await
        .unwrap_or_else(|| {
            warn!(job_id = %job.id, "No submission result before timeout");
            Err(ExtractionError::Timeout("submission".into()))
        })
    }

    async fn submission_status(&self, job: &Job) -> Result<SubmissionStatus, ExtractionError> {
        let command = ExtractionCommand::CheckSubmission {
            job_id: job.id.clone(),
            source_url: job.source_url.clone(),
        };
        self.exchange(command, self.extraction_timeout, |event| match event {
            ExtractionEvent::SubmissionChecked { job_id, status } if job_id == job.id => {
                Some(Ok(status))
            }
            _ => None,
        })
        .await
        .unwrap_or_else(|| Err(ExtractionError::Timeout("submission status".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PipelineConfig {
        PipelineConfig {
            extraction_timeout: Duration::from_millis(200),
            submission_timeout: Duration::from_millis(200),
            ..PipelineConfig::default()
        }
    }

    fn job(id: &str) -> Job {
        Job::discovered(Candidate::new(id, "Backend Engineer", "Acme", format!("https://jobs.example/{id}")))
    }

    /// Answer each command with the event `respond` builds.
    fn serve<F>(link: ExtractionLink, mut respond: F) -> tokio::task::JoinHandle<Vec<ExtractionCommand>>
    where
        F: FnMut(&ExtractionCommand) -> Vec<ExtractionEvent> + Send + 'static,
    {
        link.set_connected(true);
        tokio::spawn(async move {
            let mut link = link;
            let mut seen = Vec::new();
            while let Some(Outbound { command, .. }) = link.commands.recv().await {
                for event in respond(&command) {
                    if link.events.send(event).await.is_err() {
                        return seen;
                    }
                }
                seen.push(command);
            }
            seen
        })
    }

    #[tokio::test]
    async fn discover_returns_candidates() {
        let (adapter, link) = MessagePageExtractor::channel(&config());
        serve(link, |_| {
            vec![ExtractionEvent::ListingsFound {
                candidates: vec![
                    Candidate::new("A", "t", "o", "u"),
                    Candidate::new("B", "t", "o", "u"),
                ],
                error: None,
            }]
        });

        let found = adapter.discover(&["backend engineer".into()]).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, "A");
    }

    #[tokio::test]
    async fn discover_off_site_is_error() {
        let (adapter, link) = MessagePageExtractor::channel(&config());
        serve(link, |_| {
            vec![ExtractionEvent::ListingsFound {
                candidates: vec![],
                error: Some(ExtractionError::NotOnTargetSite),
            }]
        });

        let err = adapter.discover(&["x".into()]).await.unwrap_err();
        assert_eq!(err, ExtractionError::NotOnTargetSite);
    }

    #[tokio::test]
    async fn description_ignores_events_for_other_jobs() {
        let (adapter, link) = MessagePageExtractor::channel(&config());
        serve(link, |_| {
            vec![
                ExtractionEvent::DescriptionFound {
                    job_id: "OTHER".into(),
                    text: Some("wrong".into()),
                    error: None,
                },
                ExtractionEvent::DescriptionFound {
                    job_id: "A".into(),
                    text: Some("Build APIs".into()),
                    error: None,
                },
            ]
        });

        let text = adapter.extract_description(&job("A")).await.unwrap();
        assert_eq!(text, "Build APIs");
    }

    #[tokio::test]
    async fn silent_environment_means_description_not_found() {
        let (adapter, link) = MessagePageExtractor::channel(&config());
        let _server = serve(link, |_| Vec::new());

        let err = adapter.extract_description(&job("A")).await.unwrap_err();
        assert_eq!(err, ExtractionError::DescriptionNotFound);
    }

    #[tokio::test]
    async fn blank_description_is_not_found() {
        let (adapter, link) = MessagePageExtractor::channel(&config());
        serve(link, |_| {
            vec![ExtractionEvent::DescriptionFound {
                job_id: "A".into(),
                text: Some("   ".into()),
                error: None,
            }]
        });
        let err = adapter.extract_description(&job("A")).await.unwrap_err();
        assert_eq!(err, ExtractionError::DescriptionNotFound);
    }

    #[tokio::test]
    async fn submit_reports_site_failure() {
        let (adapter, link) = MessagePageExtractor::channel(&config());
        serve(link, |_| {
            vec![ExtractionEvent::SubmitResult {
                job_id: "C".into(),
                success: false,
                error: Some(ExtractionError::SubmissionUnavailable),
            }]
        });
        let err = adapter.submit(&job("C"), "Dear Acme").await.unwrap_err();
        assert_eq!(err, ExtractionError::SubmissionUnavailable);
    }

    #[tokio::test]
    async fn submit_sends_content() {
        let (adapter, link) = MessagePageExtractor::channel(&config());
        let server = serve(link, |command| match command {
            ExtractionCommand::Submit { job_id, .. } => vec![ExtractionEvent::SubmitResult {
                job_id: job_id.clone(),
                success: true,
                error: None,
            }],
            _ => Vec::new(),
        });

        adapter.submit(&job("C"), "Dear Acme").await.unwrap();
        drop(adapter);

        let commands = server.await.unwrap();
        assert!(matches!(
            &commands[0],
            ExtractionCommand::Submit { content, .. } if content == "Dear Acme"
        ));
    }

    #[tokio::test]
    async fn stale_answer_from_timed_out_exchange_is_discarded() {
        let (adapter, mut link) = MessagePageExtractor::channel(&config());
        link.set_connected(true);

        // An answer for a previous, abandoned request is already queued.
        link.events
            .send(ExtractionEvent::DescriptionFound {
                job_id: "A".into(),
                text: Some("stale".into()),
                error: None,
            })
            .await
            .unwrap();

        let events = link.events.clone();
        tokio::spawn(async move {
            while let Some(outbound) = link.commands.recv().await {
                if let ExtractionCommand::ExtractDescription { job_id, .. } = outbound.command {
                    let _ = events
                        .send(ExtractionEvent::DescriptionFound {
                            job_id,
                            text: Some("fresh".into()),
                            error: None,
                        })
                        .await;
                }
            }
        });

        let text = adapter.extract_description(&job("A")).await.unwrap();
        assert_eq!(text, "fresh");
    }

    #[tokio::test]
    async fn dropped_link_is_unavailable() {
        let (adapter, link) = MessagePageExtractor::channel(&config());
        link.set_connected(true);
        drop(link);
        let err = adapter.discover(&["x".into()]).await.unwrap_err();
        assert_eq!(err, ExtractionError::Unavailable);
    }

    #[tokio::test]
    async fn nothing_is_queued_without_an_environment() {
        let (adapter, mut link) = MessagePageExtractor::channel(&config());

        let err = adapter.submit(&job("C"), "Dear Acme").await.unwrap_err();
        assert_eq!(err, ExtractionError::Unavailable);
        let err = adapter.extract_description(&job("C")).await.unwrap_err();
        assert_eq!(err, ExtractionError::Unavailable);
        assert!(link.commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_mid_exchange_is_unavailable() {
        let (adapter, mut link) = MessagePageExtractor::channel(&config());
        link.set_connected(true);
        let pending = tokio::spawn(async move { adapter.extract_description(&job("A")).await });

        link.commands.recv().await.unwrap();
        link.set_connected(false);

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err, ExtractionError::Unavailable);
    }

    #[tokio::test]
    async fn unanswered_submit_times_out_and_expires() {
        let (adapter, mut link) = MessagePageExtractor::channel(&config());
        // Connected, but the environment never reads its commands.
        link.set_connected(true);

        let err = adapter.submit(&job("C"), "Dear Acme").await.unwrap_err();
        assert!(matches!(err, ExtractionError::Timeout(_)));

        let queued = link.commands.try_recv().unwrap();
        assert!(matches!(queued.command, ExtractionCommand::Submit { .. }));
        assert!(queued.is_abandoned());
    }

    #[tokio::test]
    async fn fresh_command_is_not_abandoned() {
        let (adapter, mut link) = MessagePageExtractor::channel(&config());
        link.set_connected(true);
        let pending = tokio::spawn(async move { adapter.submission_status(&job("C")).await });

        let outbound = link.commands.recv().await.unwrap();
        assert!(!outbound.is_abandoned());
        pending.abort();
    }

    #[tokio::test]
    async fn submission_status_roundtrip() {
        let (adapter, link) = MessagePageExtractor::channel(&config());
        serve(link, |command| match command {
            ExtractionCommand::CheckSubmission { job_id, .. } => {
                vec![ExtractionEvent::SubmissionChecked {
                    job_id: job_id.clone(),
                    status: SubmissionStatus::Submitted,
                }]
            }
            _ => Vec::new(),
        });
        let status = adapter.submission_status(&job("C")).await.unwrap();
        assert_eq!(status, SubmissionStatus::Submitted);
    }
}
