//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::error::{ConfigError, DatabaseError, PreflightError};
use crate::store::{Database, keys};

/// Runtime tuning for the pipeline and its service surface.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Pause before moving on after a job is skipped for a failure.
    pub failure_delay: Duration,
    /// How long to wait for listings or a description from the extraction environment.
    pub extraction_timeout: Duration,
    /// How long to wait for a submission result.
    pub submission_timeout: Duration,
    /// Round-trip limit for requests to the durable context.
    pub request_timeout: Duration,
    pub db_path: PathBuf,
    pub port: u16,
    /// Model used by the analyzer.
    pub model: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            failure_delay: Duration::from_millis(1500),
            extraction_timeout: Duration::from_secs(10),
            submission_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
            db_path: PathBuf::from("./data/apply-pilot.db"),
            port: 8080,
            model: "claude-sonnet-4-20250514".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Read overrides from `APPLY_PILOT_*` environment variables.
    ///
    /// Unset variables keep their defaults; unparsable ones are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            failure_delay: env_millis("APPLY_PILOT_FAILURE_DELAY_MS", defaults.failure_delay)?,
            extraction_timeout: env_millis(
                "APPLY_PILOT_EXTRACTION_TIMEOUT_MS",
                defaults.extraction_timeout,
            )?,
            submission_timeout: env_millis(
                "APPLY_PILOT_SUBMISSION_TIMEOUT_MS",
                defaults.submission_timeout,
            )?,
            request_timeout: env_millis("APPLY_PILOT_REQUEST_TIMEOUT_MS", defaults.request_timeout)?,
            db_path: std::env::var("APPLY_PILOT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            port: env_parse("APPLY_PILOT_PORT", defaults.port)?,
            model: std::env::var("APPLY_PILOT_MODEL").unwrap_or(defaults.model),
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let millis = env_parse(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

/// The user's search and analysis profile, persisted under `profile`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    /// Search keywords passed to discovery.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Free-text criteria the analyzer scores against.
    #[serde(default)]
    pub criteria: String,
    #[serde(default)]
    pub resume: String,
    /// Analysis provider credential.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "expose_secret",
        deserialize_with = "read_secret"
    )]
    pub api_key: Option<SecretString>,
}

fn expose_secret<S: Serializer>(secret: &Option<SecretString>, s: S) -> Result<S::Ok, S::Error> {
    match secret {
        Some(secret) => s.serialize_str(secret.expose_secret()),
        None => s.serialize_none(),
    }
}

fn read_secret<'de, D: Deserializer<'de>>(d: D) -> Result<Option<SecretString>, D::Error> {
    Ok(Option::<String>::deserialize(d)?.map(SecretString::from))
}

impl Profile {
    /// Load the stored profile, if any.
    pub async fn load(db: &dyn Database) -> Result<Option<Self>, DatabaseError> {
        match db.get_value(keys::PROFILE).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| DatabaseError::Serialization(format!("profile: {e}"))),
            None => Ok(None),
        }
    }

    pub async fn save(&self, db: &dyn Database) -> Result<(), DatabaseError> {
        let value = serde_json::to_value(self)
            .map_err(|e| DatabaseError::Serialization(format!("profile: {e}")))?;
        db.set_value(keys::PROFILE, &value).await?;
        debug!(keywords = self.keywords.len(), "Profile saved");
        Ok(())
    }

    /// Keywords joined for display and logging.
    pub fn search_terms(&self) -> String {
        self.keywords.join(", ")
    }

    /// Check the fields the pipeline needs before it may start.
    pub fn preflight(&self) -> Result<(), PreflightError> {
        if self.keywords.iter().all(|k| k.trim().is_empty()) {
            return Err(PreflightError::MissingKeywords);
        }
        match &self.api_key {
            Some(key) if !key.expose_secret().trim().is_empty() => Ok(()),
            _ => Err(PreflightError::MissingCredential),
        }
    }

    /// Profile view that is safe to hand to a UI.
    pub fn redacted(&self) -> serde_json::Value {
        serde_json::json!({
            "keywords": self.keywords,
            "criteria": self.criteria,
            "resume": self.resume,
            "has_credential": self.api_key.is_some(),
        })
    }
}
