//! LLM-backed fallback extractor.
//!
//! Asks the model for a fixed JSON shape and parses it strictly. Failures are
//! `LlmError`s internally and "no result" at the `FallbackExtractor` seam.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{ExtractedFact, ExtractionMethod, FallbackExtractor};
use crate::applications::model::{ActionType, ApplicationStatus, EmailType};
use crate::config::ExtractorConfig;
use crate::error::LlmError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};

/// Flat confidence assigned to whatever the model returns.
const FALLBACK_CONFIDENCE: f64 = 0.9;

pub struct LlmFallbackExtractor {
    llm: Arc<dyn LlmProvider>,
    config: ExtractorConfig,
}

impl LlmFallbackExtractor {
    pub fn new(llm: Arc<dyn LlmProvider>, config: ExtractorConfig) -> Self {
        Self { llm, config }
    }
}

impl LlmFallbackExtractor {
    /// One model call, bounded by the configured timeout.
    async fn request_fact(
        &self,
        subject: &str,
        body: &str,
        sender: &str,
    ) -> Result<ExtractedFact, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt()),
            ChatMessage::user(build_user_prompt(
                subject,
                sender,
                body,
                self.config.fallback_body_chars,
            )),
        ])
        .with_temperature(self.config.fallback_temperature)
        .with_max_tokens(self.config.fallback_max_tokens);

        let response = tokio::time::timeout(self.config.fallback_timeout, self.llm.complete(request))
            .await
            .map_err(|_| LlmError::Timeout {
                provider: self.llm.model_name().to_string(),
                timeout: self.config.fallback_timeout,
            })??;

        parse_fallback_response(self.llm.model_name(), &response.content)
    }
}

#[async_trait]
impl FallbackExtractor for LlmFallbackExtractor {
    async fn extract(&self, subject: &str, body: &str, sender: &str) -> Option<ExtractedFact> {
        match self.request_fact(subject, body, sender).await {
            Ok(fact) => {
                debug!(
                    method = %fact.extraction_method,
                    company = fact.company_name.as_deref().unwrap_or("-"),
                    "Fallback extraction parsed"
                );
                Some(fact)
            }
            Err(e) => {
                warn!(model = self.llm.model_name(), error = %e, "Fallback extraction discarded");
                None
            }
        }
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_system_prompt() -> String {
    "You extract job application information from emails. Return ONLY valid JSON with no other text.\n\n\
     Return JSON in this exact format:\n\
     {\"company_name\": \"Company Name or null\", \"job_title\": \"Job Title or null\", \
     \"status\": \"one of: applied, received, interview_scheduled, assessment, rejected, offer, other\", \
     \"action_required\": true or false, \"action_description\": \"action needed or null\", \
     \"is_job_related\": true or false}\n\n\
     Rules:\n\
     - Company names are often brand-like or made-up words (Waymo, Databricks, Palantir)\n\
     - Never return an email provider or ATS as the company (Gmail, Outlook, greenhouse.io, lever.co, workday.com)\n\
     - Job titles are positions such as Software Engineer, Data Analyst, Product Manager\n\
     - If the subject says \"Your [title] Application\" the title is between \"Your\" and \"Application\"\n\
     - The subject line usually holds both company and title\n\
     - Set is_job_related=false for security alerts, password resets, account notices, newsletters, promotions\n\
     - Use null for anything you cannot determine"
        .to_string()
}

fn build_user_prompt(subject: &str, sender: &str, body: &str, body_chars: usize) -> String {
    let body_preview: String = body.chars().take(body_chars).collect();
    format!("Email Subject: {subject}\nFrom: {sender}\nBody:\n{body_preview}")
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
struct FallbackResponse {
    #[serde(default)]
    company_name: Option<String>,
    #[serde(default)]
    job_title: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    action_required: Option<bool>,
    #[serde(default)]
    action_description: Option<String>,
    #[serde(default)]
    is_job_related: Option<bool>,
}

/// Parse the model output into a fact.
fn parse_fallback_response(provider: &str, raw: &str) -> Result<ExtractedFact, LlmError> {
    let json_str = extract_json_object(raw);
    if !json_str.starts_with('{') {
        return Err(LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: "no JSON object in reply".into(),
        });
    }
    let response: FallbackResponse = serde_json::from_str(&json_str)?;

    if response.is_job_related == Some(false) {
        return Ok(ExtractedFact::empty(ExtractionMethod::LlmSkipped));
    }

    let mut fact = ExtractedFact::empty(ExtractionMethod::LlmFallback);
    fact.company_name = non_null(response.company_name);
    fact.job_title = non_null(response.job_title);
    fact.status = map_status(response.status.as_deref().unwrap_or("other"));
    fact.email_type = email_type_for(fact.status);
    fact.action_required = response.action_required.unwrap_or(false);
    if fact.action_required {
        fact.action_type = Some(ActionType::Other);
        fact.action_description = non_null(response.action_description);
    }
    if fact.company_name.is_some() {
        fact.company_confidence = FALLBACK_CONFIDENCE;
    }
    if fact.job_title.is_some() {
        fact.job_title_confidence = FALLBACK_CONFIDENCE;
    }
    fact.overall_confidence = FALLBACK_CONFIDENCE;
    Ok(fact)
}

/// Models write "null", "" or "N/A" when they mean nothing.
fn non_null(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("null") && !v.eq_ignore_ascii_case("n/a"))
}

/// Map the model's status word onto the normalized vocabulary.
fn map_status(status: &str) -> ApplicationStatus {
    let lower = status.trim().to_lowercase();
    match lower.as_str() {
        "applied" | "received" => ApplicationStatus::AppliedReceived,
        "interview_scheduled" => ApplicationStatus::InterviewScheduled,
        "assessment" => ApplicationStatus::NextStepAssessment,
        "rejected" => ApplicationStatus::Rejected,
        "offer" => ApplicationStatus::OfferExtended,
        _ => lower
            .to_uppercase()
            .parse()
            .unwrap_or(ApplicationStatus::OtherUpdate),
    }
}

fn email_type_for(status: ApplicationStatus) -> EmailType {
    match status {
        ApplicationStatus::AppliedReceived => EmailType::ApplicationConfirmation,
        ApplicationStatus::Rejected => EmailType::Rejection,
        ApplicationStatus::NextStepAssessment => EmailType::AssessmentInvite,
        ApplicationStatus::NextStepScheduling => EmailType::InterviewRequest,
        ApplicationStatus::InterviewScheduled => EmailType::InterviewConfirmation,
        ApplicationStatus::OfferExtended => EmailType::Offer,
        _ => EmailType::GeneralUpdate,
    }
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::llm::provider::CompletionResponse;

    // ── Prompt construction tests ───────────────────────────────────

    #[test]
    fn user_prompt_truncates_body() {
        let body = "x".repeat(5000);
        let prompt = build_user_prompt("Hi", "a@b.com", &body, 3000);
        assert!(prompt.starts_with("Email Subject: Hi\nFrom: a@b.com\nBody:\n"));
        assert_eq!(prompt.matches('x').count(), 3000);
    }

    #[test]
    fn system_prompt_lists_json_shape() {
        let prompt = build_system_prompt();
        for field in ["company_name", "job_title", "status", "action_required", "is_job_related"] {
            assert!(prompt.contains(field), "missing {field}");
        }
    }

    // ── Response parsing tests ──────────────────────────────────────

    #[test]
    fn parse_full_response() {
        let fact = parse_fallback_response(
            "mock",
            r#"{"company_name": "Waymo", "job_title": "ML Engineer", "status": "interview_scheduled",
                "action_required": true, "action_description": "Join the call", "is_job_related": true}"#,
        )
        .unwrap();
        assert_eq!(fact.company_name.as_deref(), Some("Waymo"));
        assert_eq!(fact.job_title.as_deref(), Some("ML Engineer"));
        assert_eq!(fact.status, ApplicationStatus::InterviewScheduled);
        assert_eq!(fact.email_type, EmailType::InterviewConfirmation);
        assert!(fact.action_required);
        assert_eq!(fact.action_description.as_deref(), Some("Join the call"));
        assert_eq!(fact.company_confidence, 0.9);
        assert_eq!(fact.overall_confidence, 0.9);
        assert_eq!(fact.extraction_method, ExtractionMethod::LlmFallback);
    }

    #[test]
    fn parse_not_job_related_is_zero_confidence() {
        let fact = parse_fallback_response(
            "mock",
            r#"{"company_name": "Google", "is_job_related": false, "status": "other"}"#,
        )
        .unwrap();
        assert_eq!(fact.extraction_method, ExtractionMethod::LlmSkipped);
        assert!(fact.company_name.is_none());
        assert_eq!(fact.overall_confidence, 0.0);
    }

    #[test]
    fn parse_null_strings_become_none() {
        let fact = parse_fallback_response(
            "mock",
            r#"{"company_name": "null", "job_title": null, "status": "rejected"}"#,
        )
        .unwrap();
        assert!(fact.company_name.is_none());
        assert!(fact.job_title.is_none());
        assert_eq!(fact.company_confidence, 0.0);
        assert_eq!(fact.status, ApplicationStatus::Rejected);
    }

    #[test]
    fn status_mapping_accepts_enum_names() {
        assert_eq!(map_status("Applied"), ApplicationStatus::AppliedReceived);
        assert_eq!(map_status("offer"), ApplicationStatus::OfferExtended);
        assert_eq!(map_status("NEXT_STEP_SCHEDULING"), ApplicationStatus::NextStepScheduling);
        assert_eq!(map_status("ghosted"), ApplicationStatus::Ghosted);
        assert_eq!(map_status("who knows"), ApplicationStatus::OtherUpdate);
    }

    #[test]
    fn reply_without_json_is_invalid_response() {
        let err = parse_fallback_response("mock", "I could not find anything.").unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse { ref provider, .. } if provider == "mock"));
    }

    #[test]
    fn broken_json_is_json_error() {
        let err = parse_fallback_response("mock", r#"{"company_name": "Acme", "#).unwrap_err();
        assert!(matches!(err, LlmError::Json(_)));
    }

    #[test]
    fn extract_json_direct_object() {
        assert_eq!(extract_json_object(r#"{"a": 1}"#), r#"{"a": 1}"#);
    }

    #[test]
    fn extract_json_from_markdown_block() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```";
        assert_eq!(extract_json_object(text), r#"{"a": 1}"#);
    }

    #[test]
    fn extract_json_embedded_in_text() {
        let text = r#"Sure! {"a": {"b": 2}} Hope that helps."#;
        assert_eq!(extract_json_object(text), r#"{"a": {"b": 2}}"#);
    }

    // ── Extractor with mock LLM ─────────────────────────────────────

    /// Mock LLM that returns a fixed response, optionally after a delay.
    struct MockLlm {
        response: Result<String, ()>,
        delay: Duration,
    }

    #[async_trait]
    impl LlmProvider for MockLlm {
        fn model_name(&self) -> &str {
            "mock-extractor"
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            tokio::time::sleep(self.delay).await;
            match &self.response {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                }),
                Err(()) => Err(LlmError::RequestFailed {
                    provider: "mock".into(),
                    reason: "boom".into(),
                }),
            }
        }
    }

    fn extractor(response: Result<&str, ()>, delay: Duration) -> LlmFallbackExtractor {
        let llm: Arc<dyn LlmProvider> = Arc::new(MockLlm {
            response: response.map(str::to_string),
            delay,
        });
        LlmFallbackExtractor::new(
            llm,
            ExtractorConfig {
                fallback_timeout: Duration::from_millis(50),
                ..ExtractorConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn fenced_response_is_parsed() {
        let fallback = extractor(
            Ok("```json\n{\"company_name\": \"Databricks\", \"status\": \"applied\"}\n```"),
            Duration::ZERO,
        );
        let fact = fallback.extract("Thanks", "body", "x@y.com").await.unwrap();
        assert_eq!(fact.company_name.as_deref(), Some("Databricks"));
        assert_eq!(fact.status, ApplicationStatus::AppliedReceived);
    }

    #[tokio::test]
    async fn call_failure_is_none() {
        let fallback = extractor(Err(()), Duration::ZERO);
        assert!(fallback.extract("s", "b", "f").await.is_none());
    }

    #[tokio::test]
    async fn timeout_is_none() {
        let fallback = extractor(Ok("{}"), Duration::from_millis(500));
        assert!(fallback.extract("s", "b", "f").await.is_none());
    }

    #[tokio::test]
    async fn slow_model_reports_timeout() {
        let fallback = extractor(Ok("{}"), Duration::from_millis(500));
        let err = fallback.request_fact("s", "b", "f").await.unwrap_err();
        match err {
            LlmError::Timeout { provider, timeout } => {
                assert_eq!(provider, "mock-extractor");
                assert_eq!(timeout, Duration::from_millis(50));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn call_failure_is_passed_through() {
        let fallback = extractor(Err(()), Duration::ZERO);
        let err = fallback.request_fact("s", "b", "f").await.unwrap_err();
        assert!(matches!(err, LlmError::RequestFailed { .. }));
    }

    #[tokio::test]
    async fn malformed_response_is_none() {
        let fallback = extractor(Ok("no json here"), Duration::ZERO);
        assert!(fallback.extract("s", "b", "f").await.is_none());
    }
}
