//! Job-application field extraction.
//!
//! Two layers:
//! 1. Deterministic rules (classification, ordered pattern cascades, link scan)
//! 2. Optional fallback extractor, consulted only when the rules were not confident
//!
//! Both layers always produce a well-formed [`ExtractedFact`]; nothing here returns an error.

mod classify;
mod company;
mod details;
pub mod fallback;
mod links;
mod title;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::applications::model::{ActionType, ApplicationStatus, EmailType, LinkType};
use crate::config::ExtractorConfig;
use crate::error::DatabaseError;

pub use company::clean_company_name;
pub use fallback::LlmFallbackExtractor;

/// Version tag stored alongside every extraction blob.
pub const PARSER_VERSION: &str = "1.0.0";

/// Which layer produced a fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    RuleBased,
    LlmFallback,
    /// The fallback judged the email unrelated to a job application.
    LlmSkipped,
}

impl std::fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RuleBased => write!(f, "rule_based"),
            Self::LlmFallback => write!(f, "llm_fallback"),
            Self::LlmSkipped => write!(f, "llm_skipped"),
        }
    }
}

/// A URL found in the body, classified by destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedLink {
    pub url: String,
    #[serde(rename = "type")]
    pub link_type: LinkType,
    /// Surrounding text, for human review.
    #[serde(rename = "text")]
    pub link_text: Option<String>,
    #[serde(default)]
    pub confidence: f64,
}

/// Everything extracted from one email. Persisted verbatim as the audit blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFact {
    pub company_name: Option<String>,
    pub job_title: Option<String>,
    pub location: Option<String>,
    pub email_type: EmailType,
    pub status: ApplicationStatus,
    pub status_date: Option<DateTime<Utc>>,
    pub action_required: bool,
    pub action_type: Option<ActionType>,
    pub action_deadline: Option<DateTime<Utc>>,
    pub action_description: Option<String>,
    pub links: Vec<ExtractedLink>,
    pub company_confidence: f64,
    pub job_title_confidence: f64,
    pub overall_confidence: f64,
    pub extraction_method: ExtractionMethod,
    pub parser_version: String,
}

impl ExtractedFact {
    /// A fact with nothing extracted.
    pub fn empty(method: ExtractionMethod) -> Self {
        Self {
            company_name: None,
            job_title: None,
            location: None,
            email_type: EmailType::Unknown,
            status: ApplicationStatus::OtherUpdate,
            status_date: None,
            action_required: false,
            action_type: None,
            action_deadline: None,
            action_description: None,
            links: Vec::new(),
            company_confidence: 0.0,
            job_title_confidence: 0.0,
            overall_confidence: 0.0,
            extraction_method: method,
            parser_version: PARSER_VERSION.to_string(),
        }
    }

    /// Serialize for storage on the raw email record.
    pub fn to_audit_json(&self) -> Result<serde_json::Value, DatabaseError> {
        serde_json::to_value(self)
            .map_err(|e| DatabaseError::Serialization(format!("extracted fact: {e}")))
    }
}

/// Secondary extractor consulted when the rules are not confident.
///
/// Returns a best-effort guess or `None`. Failures of any kind are `None`.
#[async_trait]
pub trait FallbackExtractor: Send + Sync {
    async fn extract(&self, subject: &str, body: &str, sender: &str) -> Option<ExtractedFact>;
}

/// Rule-based extractor with an optional fallback.
pub struct Extractor {
    fallback: Option<Arc<dyn FallbackExtractor>>,
    config: ExtractorConfig,
}

impl Extractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self {
            fallback: None,
            config,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackExtractor>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// Extract a fact, consulting the fallback when the rules score below the threshold.
    ///
    /// The fallback result is adopted only when its overall confidence is strictly higher.
    pub async fn extract(
        &self,
        subject: &str,
        body: &str,
        from: &str,
        date: Option<DateTime<Utc>>,
    ) -> ExtractedFact {
        let rules = self.extract_rule_based(subject, body, from, date);

        let Some(ref fallback) = self.fallback else {
            return rules;
        };
        if rules.overall_confidence >= self.config.fallback_threshold {
            return rules;
        }

        debug!(
            confidence = rules.overall_confidence,
            threshold = self.config.fallback_threshold,
            "Rule-based extraction below threshold, consulting fallback"
        );

        match fallback.extract(subject, body, from).await {
            Some(guess) if guess.overall_confidence > rules.overall_confidence => {
                debug!(
                    rules = rules.overall_confidence,
                    fallback = guess.overall_confidence,
                    "Adopting fallback extraction"
                );
                adopt_fallback(guess, rules)
            }
            _ => rules,
        }
    }

    /// The deterministic path only.
    pub fn extract_rule_based(
        &self,
        subject: &str,
        body: &str,
        from: &str,
        date: Option<DateTime<Utc>>,
    ) -> ExtractedFact {
        let mut fact = ExtractedFact::empty(ExtractionMethod::RuleBased);
        fact.status_date = Some(date.unwrap_or_else(Utc::now));

        fact.email_type = classify::classify_email_type(subject, body);
        fact.status = fact.email_type.implied_status();

        if let Some((company, confidence)) = company::extract_company(subject, body, from) {
            fact.company_name = Some(company);
            fact.company_confidence = confidence;
        }
        if let Some((title, confidence)) = title::extract_job_title(subject, body) {
            fact.job_title = Some(title);
            fact.job_title_confidence = confidence;
        }

        fact.location = details::extract_location(body);

        let text = format!("{subject}\n{body}").to_lowercase();
        if let Some(action) = details::detect_action(&text, date) {
            fact.action_required = true;
            fact.action_type = Some(action.kind);
            fact.action_deadline = action.deadline;
            fact.action_description = Some(action.description.to_string());
        }

        fact.links = links::extract_links(body);
        fact.overall_confidence = overall_confidence(&fact);
        fact
    }
}

/// Carry over the deterministic enrichment the fallback does not produce.
fn adopt_fallback(mut guess: ExtractedFact, rules: ExtractedFact) -> ExtractedFact {
    guess.status_date = rules.status_date;
    if guess.links.is_empty() {
        guess.links = rules.links;
    }
    if guess.location.is_none() {
        guess.location = rules.location;
    }
    if guess.action_required && rules.action_required {
        guess.action_type = rules.action_type;
        guess.action_deadline = rules.action_deadline;
    }
    guess
}

fn compile_all(patterns: &[&str]) -> Vec<regex::Regex> {
    patterns
        .iter()
        .map(|p| regex::Regex::new(p).expect("valid regex"))
        .collect()
}

/// First capture group of the first pattern that matches, trimmed.
///
/// Later matches of the same pattern are not considered.
fn first_capture<'a>(pattern: &regex::Regex, text: &'a str) -> Option<&'a str> {
    pattern
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
}

/// Unweighted mean of whichever signals are present; 0.0 if none are.
fn overall_confidence(fact: &ExtractedFact) -> f64 {
    let mut scores = Vec::with_capacity(4);
    if fact.company_name.is_some() {
        scores.push(fact.company_confidence);
    }
    if fact.job_title.is_some() {
        scores.push(fact.job_title_confidence);
    }
    if fact.email_type != EmailType::Unknown {
        scores.push(0.7);
    }
    if fact.status != ApplicationStatus::OtherUpdate {
        scores.push(0.6);
    }
    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}
