//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};

/// Read and parse an env var, falling back to `default` when unset or unparsable.
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Thresholds and windows used when attributing an email to an application.
#[derive(Debug, Clone, PartialEq)]
pub struct MatcherConfig {
    /// Minimum weighted similarity for a fuzzy match.
    pub fuzzy_threshold: f64,
    /// Fuzzy matches at or above this are accepted without review.
    pub fuzzy_auto_accept: f64,
    pub company_weight: f64,
    pub title_weight: f64,
    /// Look-back window for fuzzy and company-only matching.
    pub time_window_days: i64,
    /// Confidence assigned to a single company-only match (always reviewed).
    pub domain_single_confidence: f64,
    /// Confidence assigned when several applications share the company.
    pub domain_ambiguous_confidence: f64,
    /// Look-back window for title-only matching.
    pub subject_window_days: i64,
    pub subject_threshold: f64,
    /// Multiplier applied to title-only similarity.
    pub subject_discount: f64,
    /// Extraction confidence required to open a new application unreviewed.
    pub new_application_floor: f64,
    /// Minimum score for a review candidate.
    pub candidate_floor: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.80,
            fuzzy_auto_accept: 0.90,
            company_weight: 0.6,
            title_weight: 0.4,
            time_window_days: 60,
            domain_single_confidence: 0.75,
            domain_ambiguous_confidence: 0.5,
            subject_window_days: 30,
            subject_threshold: 0.85,
            subject_discount: 0.7,
            new_application_floor: 0.6,
            candidate_floor: 0.5,
        }
    }
}

impl MatcherConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            fuzzy_threshold: env_or("JOB_TRACKER_FUZZY_THRESHOLD", d.fuzzy_threshold),
            fuzzy_auto_accept: env_or("JOB_TRACKER_FUZZY_AUTO_ACCEPT", d.fuzzy_auto_accept),
            time_window_days: env_or("JOB_TRACKER_MATCH_WINDOW_DAYS", d.time_window_days),
            new_application_floor: env_or("JOB_TRACKER_NEW_APP_FLOOR", d.new_application_floor),
            ..d
        }
    }
}

/// Extraction settings, mostly for the LLM fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractorConfig {
    /// Deterministic results below this overall confidence consult the fallback.
    pub fallback_threshold: f64,
    /// Body characters sent to the fallback.
    pub fallback_body_chars: usize,
    pub fallback_timeout: Duration,
    pub fallback_max_tokens: u32,
    pub fallback_temperature: f32,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            fallback_threshold: 0.85,
            fallback_body_chars: 3000,
            fallback_timeout: Duration::from_secs(30),
            fallback_max_tokens: 500,
            fallback_temperature: 0.1,
        }
    }
}

impl ExtractorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            fallback_threshold: env_or("JOB_TRACKER_FALLBACK_THRESHOLD", d.fallback_threshold),
            fallback_timeout: Duration::from_secs(env_or(
                "JOB_TRACKER_FALLBACK_TIMEOUT_SECS",
                d.fallback_timeout.as_secs(),
            )),
            ..d
        }
    }
}

/// Sync and retry scheduling.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub fetch_timeout: Duration,
    pub retry_interval: Duration,
    pub retry_batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(120),
            retry_interval: Duration::from_secs(900), // 15 minutes
            retry_batch_size: 50,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            fetch_timeout: Duration::from_secs(env_or(
                "JOB_TRACKER_FETCH_TIMEOUT_SECS",
                d.fetch_timeout.as_secs(),
            )),
            retry_interval: Duration::from_secs(env_or(
                "JOB_TRACKER_RETRY_INTERVAL_SECS",
                d.retry_interval.as_secs(),
            )),
            retry_batch_size: env_or("JOB_TRACKER_RETRY_BATCH", d.retry_batch_size),
        }
    }
}

/// Everything the binary needs to run a sync.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub user_id: String,
    pub inbox_dir: PathBuf,
    /// `None` runs extraction without the LLM fallback.
    pub llm: Option<LlmConfig>,
    pub matcher: MatcherConfig,
    pub extractor: ExtractorConfig,
    pub pipeline: PipelineConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let user_id = std::env::var("JOB_TRACKER_USER")
            .map_err(|_| ConfigError::MissingEnvVar("JOB_TRACKER_USER".into()))?;
        if user_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "JOB_TRACKER_USER".into(),
                message: "must not be empty".into(),
            });
        }

        let db_path = std::env::var("JOB_TRACKER_DB_PATH")
            .unwrap_or_else(|_| "./data/job-tracker.db".to_string());
        let inbox_dir =
            std::env::var("JOB_TRACKER_INBOX").unwrap_or_else(|_| "./inbox".to_string());

        Ok(Self {
            db_path: PathBuf::from(db_path),
            user_id,
            inbox_dir: PathBuf::from(inbox_dir),
            llm: llm_config_from_env(),
            matcher: MatcherConfig::from_env(),
            extractor: ExtractorConfig::from_env(),
            pipeline: PipelineConfig::from_env(),
        })
    }
}

/// Pick an LLM backend from whichever API key is present. Anthropic wins if both are set.
fn llm_config_from_env() -> Option<LlmConfig> {
    let (backend, api_key, default_model) = if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        (LlmBackend::Anthropic, key, "claude-3-5-haiku-latest")
    } else if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        (LlmBackend::OpenAi, key, "gpt-4o-mini")
    } else {
        return None;
    };

    let model = std::env::var("JOB_TRACKER_MODEL").unwrap_or_else(|_| default_model.to_string());
    Some(LlmConfig {
        backend,
        api_key: secrecy::SecretString::from(api_key),
        model,
    })
}
