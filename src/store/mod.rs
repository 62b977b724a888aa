//! Persistence layer: durable key-value storage for jobs, state and profile.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, TransitionRecord};

/// Stable storage keys.
pub mod keys {
    /// Job collection, a JSON array in discovery order.
    pub const JOBS: &str = "jobs";
    /// Canonical `ApplicationState` record.
    pub const APPLICATION_STATE: &str = "application_state";
    /// User profile (keywords, criteria, credential).
    pub const PROFILE: &str = "profile";
}

use crate::error::StateError;

/// Outcome of a write-through mutation.
///
/// The mutation is always applied in memory; `persist_error` is set when the
/// durable write failed. In-memory state stays authoritative and the next
/// successful write reconciles storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Written<T> {
    pub value: T,
    pub persist_error: Option<StateError>,
}

impl<T> Written<T> {
    pub fn persisted(&self) -> bool {
        self.persist_error.is_none()
    }
}
