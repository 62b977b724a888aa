//! Job tracking: the record model and the persisted job store.

pub mod model;
pub mod store;

pub use model::{Candidate, Job, JobChange, JobId, JobStatus, Stage, StatusCounts};
pub use store::{JobSnapshot, JobStore};
