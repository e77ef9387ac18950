//! Shared types for the email processing pipeline.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::applications::model::{EmailOutcome, RawInboundEmail};
use crate::error::PipelineError;

// ── Inbound email ───────────────────────────────────────────────────

/// One email as produced by a mail source.
///
/// `transport_id` is the provider's message id and is unique per user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEmail {
    pub transport_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub received_at: DateTime<Utc>,
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body_text: Option<String>,
    #[serde(default)]
    pub body_html: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl InboundEmail {
    /// Convert into a not-yet-processed stored record for `user_id`.
    pub fn into_raw(self, user_id: &str) -> RawInboundEmail {
        RawInboundEmail {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            transport_id: self.transport_id,
            conversation_id: self.conversation_id,
            received_at: self.received_at,
            envelope_from: self.from,
            envelope_to: self.to,
            envelope_subject: self.subject,
            body_text: self.body_text,
            body_html: self.body_html,
            raw_headers: serde_json::to_value(&self.headers).unwrap_or(serde_json::Value::Null),
            original_from: None,
            original_to: None,
            original_subject: None,
            original_date: None,
            clean_body_text: None,
            unwrap_confidence: None,
            unwrap_method: None,
            email_type: None,
            extracted: None,
            fingerprint: None,
            overall_confidence: None,
            parser_version: None,
            processed: false,
            outcome: None,
            application_id: None,
            processing_error: None,
            processed_at: None,
            created_at: Utc::now(),
        }
    }
}

// ── Results ─────────────────────────────────────────────────────────

/// What happened to one email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    /// `None` only when the email could not even be recorded.
    pub raw_email_id: Option<Uuid>,
    pub success: bool,
    pub outcome: Option<EmailOutcome>,
    pub application_id: Option<Uuid>,
    pub is_new_application: bool,
    pub needs_manual_review: bool,
    pub is_duplicate: bool,
    pub error: Option<String>,
    pub confidence: f64,
}

impl ProcessingResult {
    pub fn failed(raw_email_id: Option<Uuid>, error: impl Into<String>) -> Self {
        Self {
            raw_email_id,
            success: false,
            outcome: None,
            application_id: None,
            is_new_application: false,
            needs_manual_review: false,
            is_duplicate: false,
            error: Some(error.into()),
            confidence: 0.0,
        }
    }

    /// Result for an email that was already recorded, reflecting its stored state.
    pub fn from_recorded(raw: &RawInboundEmail) -> Self {
        Self {
            raw_email_id: Some(raw.id),
            success: raw.processed,
            outcome: raw.outcome,
            application_id: raw.application_id,
            is_new_application: raw.outcome == Some(EmailOutcome::Created),
            needs_manual_review: raw.outcome == Some(EmailOutcome::Reviewed),
            is_duplicate: raw.outcome == Some(EmailOutcome::Duplicate),
            error: raw.processing_error.clone().filter(|_| !raw.processed),
            confidence: raw.overall_confidence.unwrap_or(0.0),
        }
    }
}

/// Counters for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub fetched: usize,
    pub processed: usize,
    pub new_applications: usize,
    pub updated: usize,
    pub review: usize,
    pub duplicates: usize,
    pub errors: usize,
}

impl BatchStats {
    pub fn from_results(fetched: usize, results: &[ProcessingResult]) -> Self {
        let mut stats = Self {
            fetched,
            ..Self::default()
        };
        for result in results {
            if !result.success {
                stats.errors += 1;
                continue;
            }
            stats.processed += 1;
            match result.outcome {
                Some(EmailOutcome::Created) => stats.new_applications += 1,
                Some(EmailOutcome::Updated) => stats.updated += 1,
                Some(EmailOutcome::Reviewed) => stats.review += 1,
                Some(EmailOutcome::Duplicate) => stats.duplicates += 1,
                None => {}
            }
        }
        stats
    }
}

// ── Mail source trait ───────────────────────────────────────────────

/// Producer of raw emails for a user (IMAP, Gmail API, a directory of .eml files).
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Source name (for logging).
    fn name(&self) -> &str;

    /// Fetch the emails available for `user_id`. Already-seen emails may be
    /// returned again; the pipeline deduplicates by transport id.
    async fn fetch(&self, user_id: &str) -> Result<Vec<InboundEmail>, PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(outcome: EmailOutcome) -> ProcessingResult {
        ProcessingResult {
            raw_email_id: Some(Uuid::new_v4()),
            success: true,
            outcome: Some(outcome),
            application_id: None,
            is_new_application: outcome == EmailOutcome::Created,
            needs_manual_review: outcome == EmailOutcome::Reviewed,
            is_duplicate: outcome == EmailOutcome::Duplicate,
            error: None,
            confidence: 0.9,
        }
    }

    #[test]
    fn batch_stats_counts_each_outcome() {
        let results = vec![
            ok(EmailOutcome::Created),
            ok(EmailOutcome::Created),
            ok(EmailOutcome::Updated),
            ok(EmailOutcome::Reviewed),
            ok(EmailOutcome::Duplicate),
            ProcessingResult::failed(None, "boom"),
        ];
        let stats = BatchStats::from_results(7, &results);
        assert_eq!(stats.fetched, 7);
        assert_eq!(stats.processed, 5);
        assert_eq!(stats.new_applications, 2);
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.review, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn inbound_email_deserializes_with_defaults() {
        let json = r#"{
            "transport_id": "m-1",
            "received_at": "2024-01-15T10:30:00Z",
            "from": "jobs@acme.com"
        }"#;
        let email: InboundEmail = serde_json::from_str(json).unwrap();
        assert_eq!(email.transport_id, "m-1");
        assert!(email.body_text.is_none());
        assert!(email.headers.is_empty());

        let raw = email.into_raw("u1");
        assert_eq!(raw.user_id, "u1");
        assert!(!raw.processed);
        assert_eq!(raw.envelope_from, "jobs@acme.com");
    }

    #[test]
    fn failed_result_carries_error() {
        let result = ProcessingResult::failed(None, "db down");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("db down"));
        assert_eq!(result.confidence, 0.0);
    }
}
