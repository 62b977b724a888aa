//! Job processing pipeline.
//!
//! Every job flows through:
//! 1. `PageExtractor::discover()` adds new listings as `pending`
//! 2. `PageExtractor::extract_description()` then `Analyzer::analyze()`
//! 3. A human decision while the job is `reviewing`
//! 4. `PageExtractor::submit()` on approval
//!
//! **No submission without approval.** Declined jobs are never submitted.

pub mod controller;
pub mod routes;

pub use controller::{Command, PipelineController, PipelineEvent};
pub use routes::{PipelineRouteState, pipeline_routes};
