//! Error types for Apply Pilot.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::jobs::model::{JobId, JobStatus};

/// Top-level error type for pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Pre-flight check failed: {0}")]
    Preflight(#[from] PreflightError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Pipeline is already processing a job")]
    Busy,
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Conditions that prevent the pipeline from starting. Never mutate a job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreflightError {
    #[error("No profile has been configured")]
    MissingProfile,

    #[error("Profile has no search keywords")]
    MissingKeywords,

    #[error("Profile has no analysis credential")]
    MissingCredential,

    #[error("Not on the target site")]
    WrongSite,
}

/// Failures raised by the page extraction environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ExtractionError {
    #[error("Not on the target site")]
    NotOnTargetSite,

    #[error("Job description not found")]
    DescriptionNotFound,

    #[error("Submission is not available for this job")]
    SubmissionUnavailable,

    #[error("Submission failed: {0}")]
    SubmitFailed(String),

    #[error("Extraction environment did not answer {0} in time")]
    Timeout(String),

    #[error("Extraction environment is not connected")]
    Unavailable,
}

/// Failures raised by the analysis provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalysisError {
    #[error("No analysis credential configured")]
    MissingCredential,

    #[error("Analysis request failed: {0}")]
    RequestFailed(String),

    #[error("Malformed analysis response: {0}")]
    MalformedResponse(String),
}

/// LLM provider errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Durable-state errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StateError {
    #[error("Failed to persist state: {0}")]
    PersistFailed(String),
}

/// Storage backend errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Job-related errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: JobId },

    #[error("Job {id} is {from}, cannot transition to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("No job is awaiting a decision")]
    NoCurrentJob,
}

/// Failures of a round-trip between the ephemeral and durable contexts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("Durable context disconnected")]
    Disconnected,

    #[error("Durable context did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Request rejected: {0}")]
    Rejected(#[from] JobError),

    #[error("Unexpected response to {request}")]
    UnexpectedResponse { request: &'static str },

    #[error("State error: {0}")]
    State(#[from] StateError),
}
