//! Contracts for the external collaborators the pipeline calls.

pub mod analysis;
pub mod extraction;

pub use analysis::{Analysis, Analyzer, LlmAnalyzer};
pub use extraction::{ExtractionLink, MessagePageExtractor, Outbound, PageExtractor, SubmissionStatus};
