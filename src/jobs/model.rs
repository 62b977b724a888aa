//! Job data model: statuses, the transition table and typed mutations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Opaque identifier assigned by the target site. Unique within the store.
pub type JobId = String;

/// Externally visible status of a job.
///
/// Extraction and analysis both happen while a job is still `Pending`;
/// observers only ever see `pending → reviewing → applying → applied | skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Discovered, not yet processed.
    Pending,
    /// Description extracted and analyzed; waiting for a human decision.
    Reviewing,
    /// Approved; submission in progress.
    Applying,
    /// Submission succeeded.
    Applied,
    /// Declined by the user or abandoned after a failure.
    Skipped,
}

impl JobStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [JobStatus; 5] = [
        Self::Pending,
        Self::Reviewing,
        Self::Applying,
        Self::Applied,
        Self::Skipped,
    ];

    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Reviewing) | (Pending, Skipped) |
            (Reviewing, Applying) | (Reviewing, Skipped) |
            (Applying, Applied) | (Applying, Skipped)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Applied | Self::Skipped)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Reviewing => "reviewing",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// Fine-grained processing stage tracked by the controller.
///
/// `ExtractingDescription` and `Analyzing` are both persisted as `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ExtractingDescription,
    Analyzing,
    AwaitingDecision,
    Applying,
}

impl Stage {
    /// The persisted status a job shows while in this stage.
    pub fn visible_status(&self) -> JobStatus {
        match self {
            Self::ExtractingDescription | Self::Analyzing => JobStatus::Pending,
            Self::AwaitingDecision => JobStatus::Reviewing,
            Self::Applying => JobStatus::Applying,
        }
    }

    /// Where processing re-enters for a job last persisted with `status`.
    /// Terminal jobs are never resumed.
    pub fn resume_point(status: JobStatus) -> Option<Stage> {
        match status {
            JobStatus::Pending => Some(Self::ExtractingDescription),
            JobStatus::Reviewing => Some(Self::AwaitingDecision),
            JobStatus::Applying => Some(Self::Applying),
            JobStatus::Applied | JobStatus::Skipped => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ExtractingDescription => "extracting_description",
            Self::Analyzing => "analyzing",
            Self::AwaitingDecision => "awaiting_decision",
            Self::Applying => "applying",
        };
        write!(f, "{s}")
    }
}

/// A listing as returned by discovery, before it becomes a tracked job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: JobId,
    pub title: String,
    pub organization: String,
    pub source_url: String,
}

impl Candidate {
    pub fn new(
        id: impl Into<JobId>,
        title: impl Into<String>,
        organization: impl Into<String>,
        source_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            organization: organization.into(),
            source_url: source_url.into(),
        }
    }
}

/// One unit of work tracked from discovery to a terminal outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub title: String,
    pub organization: String,
    pub source_url: String,
    pub status: JobStatus,
    /// User-only metadata; never affects processing.
    #[serde(default)]
    pub starred: bool,
    pub discovered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Compatibility with the user's profile, 0–100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compatibility_score: Option<u8>,
    /// Generated cover letter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a pending job from a discovered candidate.
    pub fn discovered(candidate: Candidate) -> Self {
        Self {
            id: candidate.id,
            title: candidate.title,
            organization: candidate.organization,
            source_url: candidate.source_url,
            status: JobStatus::Pending,
            starred: false,
            discovered_at: Utc::now(),
            description: None,
            compatibility_score: None,
            generated_content: None,
            last_error: None,
            decided_at: None,
            submitted_at: None,
        }
    }

    /// Move to `target`, rejecting anything outside the transition table.
    pub fn transition_to(&mut self, target: JobStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(target) {
            return Err(JobError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: target,
            });
        }
        self.status = target;
        Ok(())
    }

    /// Apply a typed mutation. Status-changing mutations go through
    /// `transition_to`, so the job is left untouched on rejection.
    pub fn apply(&mut self, change: &JobChange) -> Result<(), JobError> {
        let now = Utc::now();
        match change {
            JobChange::Review {
                description,
                score,
                content,
            } => {
                self.transition_to(JobStatus::Reviewing)?;
                self.description = Some(description.clone());
                self.compatibility_score = Some((*score).min(100));
                self.generated_content = Some(content.clone());
                self.last_error = None;
            }
            JobChange::Approve => {
                self.transition_to(JobStatus::Applying)?;
                self.decided_at = Some(now);
            }
            JobChange::Decline => {
                if self.status != JobStatus::Reviewing {
                    return Err(JobError::InvalidTransition {
                        id: self.id.clone(),
                        from: self.status,
                        to: JobStatus::Skipped,
                    });
                }
                self.transition_to(JobStatus::Skipped)?;
                self.decided_at = Some(now);
            }
            JobChange::Submitted => {
                self.transition_to(JobStatus::Applied)?;
                self.submitted_at = Some(now);
                self.last_error = None;
            }
            JobChange::Skip { error } => {
                // A job awaiting a decision is only skipped by declining it.
                if self.status == JobStatus::Reviewing {
                    return Err(JobError::InvalidTransition {
                        id: self.id.clone(),
                        from: self.status,
                        to: JobStatus::Skipped,
                    });
                }
                self.transition_to(JobStatus::Skipped)?;
                self.last_error = Some(error.clone());
            }
            JobChange::ToggleStar => {
                self.starred = !self.starred;
            }
        }
        Ok(())
    }
}

/// Closed set of mutations a job can receive.
///
/// Each status-changing variant maps onto exactly one edge group of the
/// transition table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum JobChange {
    /// Extraction and analysis succeeded: `pending → reviewing`.
    Review {
        description: String,
        score: u8,
        content: String,
    },
    /// User approved: `reviewing → applying`.
    Approve,
    /// User declined: `reviewing → skipped`, no submission.
    Decline,
    /// Submission succeeded: `applying → applied`.
    Submitted,
    /// An external call failed: `pending | applying → skipped`. Rejected
    /// for a `reviewing` job, which only a decline can skip.
    Skip { error: String },
    /// Flip the user's star. Never changes status.
    ToggleStar,
}

impl JobChange {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Review { .. } => "review",
            Self::Approve => "approve",
            Self::Decline => "decline",
            Self::Submitted => "submitted",
            Self::Skip { .. } => "skip",
            Self::ToggleStar => "toggle_star",
        }
    }
}

/// Number of jobs per status, for display badges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub reviewing: usize,
    pub applying: usize,
    pub applied: usize,
    pub skipped: usize,
}

impl StatusCounts {
    pub fn tally<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let mut counts = Self::default();
        for job in jobs {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Reviewing => counts.reviewing += 1,
                JobStatus::Applying => counts.applying += 1,
                JobStatus::Applied => counts.applied += 1,
                JobStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.pending + self.reviewing + self.applying + self.applied + self.skipped
    }
}
