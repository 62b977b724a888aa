//! Analysis port: compatibility scoring and cover-letter generation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::Profile;
use crate::error::AnalysisError;
use crate::jobs::model::Job;
use crate::llm::{ChatMessage, CompletionRequest, LlmConfig, LlmProvider, create_provider};

/// Max tokens for the analysis call. The cover letter dominates.
const ANALYSIS_MAX_TOKENS: u32 = 1200;

const ANALYSIS_TEMPERATURE: f32 = 0.3;

/// Description characters sent to the model.
const DESCRIPTION_PREVIEW_CHARS: usize = 6000;

/// Result of analyzing one job against the profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    /// 0 to 100.
    pub score: u8,
    pub content: String,
}

/// Computes a compatibility score and generated content for a job.
///
/// `job.description` is filled in before the call.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, job: &Job, profile: &Profile) -> Result<Analysis, AnalysisError>;
}

enum ProviderSource {
    Fixed(Arc<dyn LlmProvider>),
    /// Built per call from the profile's credential.
    Profile { model: String },
}

/// `Analyzer` backed by an LLM completion.
pub struct LlmAnalyzer {
    source: ProviderSource,
}

impl LlmAnalyzer {
    /// Use the profile's credential with `model` on every call.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            source: ProviderSource::Profile {
                model: model.into(),
            },
        }
    }

    pub fn with_provider(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            source: ProviderSource::Fixed(provider),
        }
    }

    fn provider(&self, profile: &Profile) -> Result<Arc<dyn LlmProvider>, AnalysisError> {
        match &self.source {
            ProviderSource::Fixed(provider) => Ok(Arc::clone(provider)),
            ProviderSource::Profile { model } => {
                let api_key = profile
                    .api_key
                    .clone()
                    .ok_or(AnalysisError::MissingCredential)?;
                create_provider(&LlmConfig {
                    api_key,
                    model: model.clone(),
                })
                .map_err(|e| AnalysisError::RequestFailed(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl Analyzer for LlmAnalyzer {
    async fn analyze(&self, job: &Job, profile: &Profile) -> Result<Analysis, AnalysisError> {
        let provider = self.provider(profile)?;
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_analysis_system_prompt()),
            ChatMessage::user(build_analysis_user_prompt(job, profile)),
        ])
        .with_temperature(ANALYSIS_TEMPERATURE)
        .with_max_tokens(ANALYSIS_MAX_TOKENS);

        let response = provider
            .complete(request)
            .await
            .map_err(|e| AnalysisError::RequestFailed(e.to_string()))?;

        let analysis = parse_analysis_response(&response.content).inspect_err(|e| {
            warn!(job_id = %job.id, error = %e, "Unusable analysis response");
        })?;
        info!(job_id = %job.id, score = analysis.score, "Job analyzed");
        Ok(analysis)
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_analysis_system_prompt() -> String {
    "You assess how well a job listing fits a candidate and write a cover letter.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"score\": 0, \"cover_letter\": \"...\"}\n\n\
     Rules:\n\
     - score is an integer from 0 (no fit) to 100 (ideal fit)\n\
     - Weigh the candidate's criteria above everything else\n\
     - The cover letter is plain text, under 250 words, addressed to the organization\n\
     - Never invent experience the resume does not mention"
        .to_string()
}

fn build_analysis_user_prompt(job: &Job, profile: &Profile) -> String {
    let mut prompt = String::with_capacity(1024);

    prompt.push_str(&format!("Job title: {}\n", job.title));
    prompt.push_str(&format!("Organization: {}\n", job.organization));

    let description: String = job
        .description
        .as_deref()
        .unwrap_or_default()
        .chars()
        .take(DESCRIPTION_PREVIEW_CHARS)
        .collect();
    prompt.push_str(&format!("\nDescription:\n{description}\n"));

    if !profile.criteria.trim().is_empty() {
        prompt.push_str(&format!("\nCandidate criteria:\n{}\n", profile.criteria));
    }
    if !profile.resume.trim().is_empty() {
        prompt.push_str(&format!("\nCandidate resume:\n{}\n", profile.resume));
    }
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Deserialize)]
struct AnalysisResponse {
    score: Option<f64>,
    #[serde(default)]
    cover_letter: String,
}

fn parse_analysis_response(raw: &str) -> Result<Analysis, AnalysisError> {
    let json = json_object(raw)
        .ok_or_else(|| AnalysisError::MalformedResponse("no JSON object in response".into()))?;
    let response: AnalysisResponse = serde_json::from_str(json)
        .map_err(|e| AnalysisError::MalformedResponse(format!("JSON parse error: {e}")))?;

    let score = response
        .score
        .filter(|s| s.is_finite())
        .ok_or_else(|| AnalysisError::MalformedResponse("missing score".into()))?;
    if response.cover_letter.trim().is_empty() {
        return Err(AnalysisError::MalformedResponse("missing cover_letter".into()));
    }

    debug!(raw_score = score, "Parsed analysis response");
    Ok(Analysis {
        score: score.round().clamp(0.0, 100.0) as u8,
        content: response.cover_letter.trim().to_string(),
    })
}

/// Locate the JSON object in a model reply: bare, fenced, or embedded in prose.
fn json_object(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed);
    }

    if let Some(start) = trimmed.find("```") {
        let fenced = &trimmed[start + 3..];
        let fenced = fenced.strip_prefix("json").unwrap_or(fenced);
        if let Some(end) = fenced.find("```") {
            let inner = fenced[..end].trim();
            if inner.starts_with('{') {
                return Some(inner);
            }
        }
    }

    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => Some(&trimmed[start..=end]),
        _ => None,
    }
}
