//! Message protocol between contexts. Every family is a closed, tagged enum.
//!
//! Four message families:
//! - `Request` / `Response`: ephemeral → durable round-trips
//! - `Notification`: durable → ephemeral, fire-and-forget
//! - `ExtractionCommand` / `ExtractionEvent`: controller ↔ extraction environment

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{ApplicationState, StatePatch};
use crate::error::{ExtractionError, JobError, StateError, SyncError};
use crate::jobs::model::{Candidate, Job, JobChange, JobId, StatusCounts};
use crate::ports::extraction::SubmissionStatus;

/// Requests an ephemeral context sends to the durable context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    GetState,
    UpdateState { partial: StatePatch },
    GetJobs,
    GetJob { job_id: JobId },
    /// First pending job in discovery order.
    NextPending,
    AppendJobs { candidates: Vec<Candidate> },
    UpdateJob { job_id: JobId, change: JobChange },
    ClearAll,
}

impl Request {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::GetState => "GET_STATE",
            Self::UpdateState { .. } => "UPDATE_STATE",
            Self::GetJobs => "GET_JOBS",
            Self::GetJob { .. } => "GET_JOB",
            Self::NextPending => "NEXT_PENDING",
            Self::AppendJobs { .. } => "APPEND_JOBS",
            Self::UpdateJob { .. } => "UPDATE_JOB",
            Self::ClearAll => "CLEAR_ALL",
        }
    }
}

/// Durable-context answers, one per `Request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    State { state: ApplicationState },
    /// `ack` is false when the merge was applied in memory but not persisted.
    Ack { ack: bool, state: ApplicationState },
    Jobs { jobs: Vec<Job>, counts: StatusCounts },
    Job { job: Option<Job> },
    Appended { inserted: usize, persisted: bool },
    JobUpdated { job: Job, persisted: bool },
    Cleared { removed: usize, persisted: bool },
    Rejected { error: JobError },
}

impl Response {
    pub fn into_state(self) -> Result<ApplicationState, SyncError> {
        match self {
            Self::State { state } | Self::Ack { state, .. } => Ok(state),
            other => Err(other.unexpected("GET_STATE")),
        }
    }

    pub fn into_ack(self) -> Result<(bool, ApplicationState), SyncError> {
        match self {
            Self::Ack { ack, state } => Ok((ack, state)),
            other => Err(other.unexpected("UPDATE_STATE")),
        }
    }

    pub fn into_jobs(self) -> Result<(Vec<Job>, StatusCounts), SyncError> {
        match self {
            Self::Jobs { jobs, counts } => Ok((jobs, counts)),
            other => Err(other.unexpected("GET_JOBS")),
        }
    }

    pub fn into_job(self) -> Result<Option<Job>, SyncError> {
        match self {
            Self::Job { job } => Ok(job),
            other => Err(other.unexpected("GET_JOB")),
        }
    }

    pub fn into_appended(self) -> Result<usize, SyncError> {
        match self {
            Self::Appended { inserted, .. } => Ok(inserted),
            other => Err(other.unexpected("APPEND_JOBS")),
        }
    }

    pub fn into_updated_job(self) -> Result<Job, SyncError> {
        match self {
            Self::JobUpdated { job, .. } => Ok(job),
            other => Err(other.unexpected("UPDATE_JOB")),
        }
    }

    pub fn into_cleared(self) -> Result<usize, SyncError> {
        match self {
            Self::Cleared { removed, .. } => Ok(removed),
            other => Err(other.unexpected("CLEAR_ALL")),
        }
    }

    fn unexpected(self, request: &'static str) -> SyncError {
        match self {
            Self::Rejected { error } => SyncError::Rejected(error),
            _ => SyncError::UnexpectedResponse { request },
        }
    }
}

/// Pushed from the durable context to attached ephemeral contexts.
/// Delivery is best-effort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notification {
    /// Processing should continue for `job`.
    Continue { job: Job },
    StateChanged { state: ApplicationState },
    JobsChanged { counts: StatusCounts },
    PersistFailed { error: StateError },
}

/// Controller → extraction environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtractionCommand {
    Discover { keywords: Vec<String> },
    ExtractDescription { job_id: JobId, source_url: String },
    Submit {
        job_id: JobId,
        source_url: String,
        content: String,
    },
    CheckSubmission { job_id: JobId, source_url: String },
}

impl ExtractionCommand {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Discover { .. } => "DISCOVER",
            Self::ExtractDescription { .. } => "EXTRACT_DESCRIPTION",
            Self::Submit { .. } => "SUBMIT",
            Self::CheckSubmission { .. } => "CHECK_SUBMISSION",
        }
    }
}

/// Extraction environment → controller.
///
/// Each event signals readiness explicitly; absent content is reported as an
/// error rather than left to a timer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtractionEvent {
    ListingsFound {
        #[serde(default)]
        candidates: Vec<Candidate>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ExtractionError>,
    },
    DescriptionFound {
        job_id: JobId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ExtractionError>,
    },
    SubmitResult {
        job_id: JobId,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ExtractionError>,
    },
    SubmissionChecked {
        job_id: JobId,
        status: SubmissionStatus,
    },
}

impl ExtractionEvent {
    /// Job the event answers for, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::ListingsFound { .. } => None,
            Self::DescriptionFound { job_id, .. }
            | Self::SubmitResult { job_id, .. }
            | Self::SubmissionChecked { job_id, .. } => Some(job_id),
        }
    }
}

/// Client → server WebSocket frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub request_id: Uuid,
    pub request: Request,
}

/// Server → client WebSocket frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ServerFrame {
    Response {
        request_id: Uuid,
        response: Response,
    },
    Notification {
        notification: Notification,
    },
    /// The client sent something that is not a valid `ClientFrame`.
    Invalid {
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_tags_match_wire_names() {
        let json = serde_json::to_value(Request::GetState).unwrap();
        assert_eq!(json, serde_json::json!({"type": "GET_STATE"}));

        let json = serde_json::to_value(Request::UpdateState {
            partial: StatePatch::default().processing(true),
        })
        .unwrap();
        assert_eq!(json["type"], "UPDATE_STATE");
        assert_eq!(json["partial"]["is_processing"], true);
    }

    #[test]
    fn update_job_carries_tagged_change() {
        let raw = r#"{"type": "UPDATE_JOB", "job_id": "A", "change": {"change": "skip", "error": "boom"}}"#;
        let request: Request = serde_json::from_str(raw).unwrap();
        assert_eq!(
            request,
            Request::UpdateJob {
                job_id: "A".into(),
                change: JobChange::Skip { error: "boom".into() },
            }
        );
    }

    #[test]
    fn unknown_request_type_is_rejected() {
        let raw = r#"{"type": "DELETE_JOB", "job_id": "A"}"#;
        assert!(serde_json::from_str::<Request>(raw).is_err());
    }

    #[test]
    fn unknown_change_is_rejected() {
        let raw = r#"{"type": "UPDATE_JOB", "job_id": "A", "change": {"change": "reset"}}"#;
        assert!(serde_json::from_str::<Request>(raw).is_err());
    }

    #[test]
    fn rejected_response_maps_to_sync_error() {
        let response = Response::Rejected {
            error: JobError::NotFound { id: "A".into() },
        };
        assert_eq!(
            response.into_updated_job().unwrap_err(),
            SyncError::Rejected(JobError::NotFound { id: "A".into() })
        );
    }

    #[test]
    fn mismatched_response_is_unexpected() {
        let response = Response::Cleared {
            removed: 0,
            persisted: true,
        };
        assert_eq!(
            response.into_state().unwrap_err(),
            SyncError::UnexpectedResponse { request: "GET_STATE" }
        );
    }

    #[test]
    fn description_found_accepts_text_or_error() {
        let ok: ExtractionEvent =
            serde_json::from_str(r#"{"type": "DESCRIPTION_FOUND", "job_id": "A", "text": "Build APIs"}"#)
                .unwrap();
        assert_eq!(ok.job_id(), Some("A"));
        assert!(matches!(ok, ExtractionEvent::DescriptionFound { text: Some(_), error: None, .. }));

        let failed: ExtractionEvent = serde_json::from_str(
            r#"{"type": "DESCRIPTION_FOUND", "job_id": "A", "error": {"kind": "description_not_found"}}"#,
        )
        .unwrap();
        assert!(matches!(
            failed,
            ExtractionEvent::DescriptionFound {
                error: Some(ExtractionError::DescriptionNotFound),
                ..
            }
        ));
    }

    #[test]
    fn continue_notification_wire_name() {
        let job = Job::discovered(Candidate::new("A", "t", "o", "u"));
        let json = serde_json::to_value(Notification::Continue { job }).unwrap();
        assert_eq!(json["type"], "CONTINUE");
        assert_eq!(json["job"]["id"], "A");
    }

    #[test]
    fn server_frame_nests_response() {
        let request_id = Uuid::new_v4();
        let frame = ServerFrame::Response {
            request_id,
            response: Response::State {
                state: ApplicationState::default(),
            },
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"frame\":\"response\""));
        let parsed: ServerFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, frame);
    }
}
