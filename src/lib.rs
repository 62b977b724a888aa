//! Apply Pilot: job discovery, analysis and human-approved submission.

pub mod config;
pub mod error;
pub mod jobs;
pub mod llm;
pub mod pipeline;
pub mod ports;
pub mod store;
pub mod sync;
