//! Canonical application state and field-level patches.

use serde::{Deserialize, Serialize};

use crate::jobs::model::JobId;

/// Pipeline-wide state owned by the durable context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationState {
    pub is_processing: bool,
    pub is_paused: bool,
    /// Weak reference into the job store. Treated as `None` when the job is gone.
    #[serde(default)]
    pub current_job_id: Option<JobId>,
}

impl ApplicationState {
    /// Merge `patch` field by field. Last write wins per field.
    pub fn merge(&mut self, patch: &StatePatch) {
        if let Some(is_processing) = patch.is_processing {
            self.is_processing = is_processing;
        }
        if let Some(is_paused) = patch.is_paused {
            self.is_paused = is_paused;
        }
        if let Some(current) = &patch.current_job_id {
            self.current_job_id = current.clone();
        }
    }

    /// Whether the scheduling loop should keep selecting jobs.
    pub fn should_run(&self) -> bool {
        self.is_processing && !self.is_paused
    }
}

/// Partial update of `ApplicationState`. Absent fields are left untouched.
///
/// `current_job_id` is doubly optional so a patch can clear the reference:
/// `None` leaves it, `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_processing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_paused: Option<bool>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "double_option"
    )]
    pub current_job_id: Option<Option<JobId>>,
}

impl StatePatch {
    pub fn processing(mut self, value: bool) -> Self {
        self.is_processing = Some(value);
        self
    }

    pub fn paused(mut self, value: bool) -> Self {
        self.is_paused = Some(value);
        self
    }

    pub fn current(mut self, job_id: Option<JobId>) -> Self {
        self.current_job_id = Some(job_id);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.is_processing.is_none() && self.is_paused.is_none() && self.current_job_id.is_none()
    }
}

/// Serde helper distinguishing an absent field from an explicit `null`.
mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T, S>(value: &Option<Option<T>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}
