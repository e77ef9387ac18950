//! Email pipeline: turns one received email into at most one change of
//! application state.
//!
//! Flow per email:
//! 1. Transport-id dedupe (an already-recorded email short-circuits to its stored state)
//! 2. Store the raw email
//! 3. Unwrap forwarded content
//! 4. Extract a fact (rules, then the optional fallback)
//! 5. Fingerprint dedupe against the user's earlier emails
//! 6. Match against the user's applications; a new fact lacking company or title
//!    goes to review instead
//! 7. Commit the outcome (duplicate / review / create / update) in one transaction.
//!    The commit re-checks the fingerprint, so a copy that raced past step 5 is
//!    recorded as a duplicate.
//!
//! Errors never escape: a failure is recorded on the email, which is left
//! unprocessed for a later retry, and reported as a failed `ProcessingResult`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::applications::model::{
    Application, ApplicationEvent, ApplicationLink, EmailOutcome, RawInboundEmail, ReviewItem,
};
use crate::error::{DatabaseError, PipelineError};
use crate::mail::html_to_text;
use crate::pipeline::extractor::{ExtractedFact, Extractor};
use crate::pipeline::fingerprint::fingerprint;
use crate::pipeline::matcher::{ApplicationMatcher, MatchResult};
use crate::pipeline::types::{InboundEmail, ProcessingResult};
use crate::pipeline::unwrapper::Unwrapper;
use crate::store::{
    ActionUpdate, ApplicationUpdate, ApplicationWrite, Database, EmailCommit, EmailDerivation,
    OutcomePlan,
};

/// Characters of cleaned body kept as an event description.
pub(crate) const EVENT_DESCRIPTION_CHARS: usize = 500;

/// Everything derived from an email before a terminal branch is chosen.
#[derive(Clone)]
struct Analysis {
    fact: ExtractedFact,
    derived: EmailDerivation,
    body: String,
    email_date: DateTime<Utc>,
}

/// The email pipeline. Cheap to share behind an `Arc`.
pub struct EmailPipeline {
    db: Arc<dyn Database>,
    unwrapper: Unwrapper,
    extractor: Extractor,
    matcher: ApplicationMatcher,
}

impl EmailPipeline {
    pub fn new(db: Arc<dyn Database>, extractor: Extractor, matcher: ApplicationMatcher) -> Self {
        Self {
            db,
            unwrapper: Unwrapper::new(),
            extractor,
            matcher,
        }
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn matcher(&self) -> &ApplicationMatcher {
        &self.matcher
    }

    /// Process one email for `user_id`. Never fails; see [`ProcessingResult::success`].
    pub async fn process_email(&self, user_id: &str, email: InboundEmail) -> ProcessingResult {
        match self
            .db
            .get_raw_email_by_transport_id(user_id, &email.transport_id)
            .await
        {
            Ok(Some(existing)) => {
                debug!(
                    email_id = %existing.id,
                    transport_id = %email.transport_id,
                    "Email already recorded, returning stored state"
                );
                return ProcessingResult::from_recorded(&existing);
            }
            Ok(None) => {}
            Err(e) => {
                error!(transport_id = %email.transport_id, error = %e, "Transport-id lookup failed");
                return ProcessingResult::failed(None, e.to_string());
            }
        }

        let raw = email.into_raw(user_id);
        match self.db.insert_raw_email(&raw).await {
            Ok(()) => {}
            Err(DatabaseError::Conflict { .. }) => {
                // A concurrent submission of the same transport id got there first.
                return match self
                    .db
                    .get_raw_email_by_transport_id(user_id, &raw.transport_id)
                    .await
                {
                    Ok(Some(existing)) => ProcessingResult::from_recorded(&existing),
                    Ok(None) => ProcessingResult::failed(None, "Email vanished after conflict"),
                    Err(e) => ProcessingResult::failed(None, e.to_string()),
                };
            }
            Err(e) => {
                error!(transport_id = %raw.transport_id, error = %e, "Failed to store raw email");
                return ProcessingResult::failed(None, e.to_string());
            }
        }

        self.run(&raw).await
    }

    /// Process emails in order. One failure never stops the batch.
    pub async fn process_batch(
        &self,
        user_id: &str,
        emails: Vec<InboundEmail>,
    ) -> Vec<ProcessingResult> {
        self.process_batch_until(user_id, emails, &AtomicBool::new(false))
            .await
    }

    /// As [`process_batch`](Self::process_batch), stopping between emails once `cancel` is set.
    ///
    /// Emails after the cancellation point are not touched and have no result.
    pub async fn process_batch_until(
        &self,
        user_id: &str,
        emails: Vec<InboundEmail>,
        cancel: &AtomicBool,
    ) -> Vec<ProcessingResult> {
        let total = emails.len();
        info!(user_id, count = total, "Processing email batch");

        let mut results = Vec::with_capacity(total);
        for email in emails {
            if cancel.load(Ordering::Relaxed) {
                warn!(user_id, processed = results.len(), total, "Batch cancelled");
                break;
            }
            results.push(self.process_email(user_id, email).await);
        }

        let failed = results.iter().filter(|r| !r.success).count();
        info!(user_id, processed = results.len(), failed, total, "Batch complete");
        results
    }

    /// Run the pipeline on an email that is already stored. Processed emails
    /// return their recorded state.
    pub async fn reprocess(&self, email_id: Uuid) -> ProcessingResult {
        match self.db.get_raw_email(email_id).await {
            Ok(Some(raw)) if raw.processed => ProcessingResult::from_recorded(&raw),
            Ok(Some(raw)) => self.run(&raw).await,
            Ok(None) => ProcessingResult::failed(None, format!("Raw email {email_id} not found")),
            Err(e) => ProcessingResult::failed(Some(email_id), e.to_string()),
        }
    }

    /// Retry up to `limit` failed emails of `user_id`, oldest first.
    pub async fn reprocess_failed(&self, user_id: &str, limit: usize) -> Vec<ProcessingResult> {
        let failed = match self.db.list_failed_emails(user_id, limit).await {
            Ok(emails) => emails,
            Err(e) => {
                error!(user_id, error = %e, "Failed to list failed emails");
                return Vec::new();
            }
        };
        if failed.is_empty() {
            return Vec::new();
        }

        info!(user_id, count = failed.len(), "Retrying failed emails");
        let mut results = Vec::with_capacity(failed.len());
        for raw in &failed {
            results.push(self.run(raw).await);
        }
        results
    }

    /// Catch-all boundary: record the error on the email and report it.
    async fn run(&self, raw: &RawInboundEmail) -> ProcessingResult {
        match self.process_stored(raw).await {
            Ok(result) => result,
            Err(e) => {
                error!(email_id = %raw.id, user_id = %raw.user_id, error = %e, "Email processing failed");
                if let Err(mark_err) = self.db.mark_email_error(raw.id, &e.to_string()).await {
                    warn!(email_id = %raw.id, error = %mark_err, "Failed to record processing error");
                }
                ProcessingResult::failed(Some(raw.id), e.to_string())
            }
        }
    }

    async fn process_stored(&self, raw: &RawInboundEmail) -> Result<ProcessingResult, PipelineError> {
        let analysis = self.analyze(raw).await?;

        if let Some(original) = self
            .db
            .find_raw_email_by_fingerprint(&raw.user_id, &analysis.derived.fingerprint, raw.id)
            .await?
        {
            return self.commit_duplicate(raw, analysis, original).await;
        }

        let retained = analysis.clone();
        match self.route(raw, analysis).await {
            // Same content committed by another task since the lookup above.
            Err(PipelineError::Storage(DatabaseError::DuplicateContent { original })) => {
                let original = self.db.get_raw_email(original).await?.ok_or_else(|| {
                    DatabaseError::NotFound {
                        entity: "raw_email".into(),
                        id: original.to_string(),
                    }
                })?;
                debug!(email_id = %raw.id, duplicate_of = %original.id, "Fingerprint claimed concurrently");
                self.commit_duplicate(raw, retained, original).await
            }
            other => other,
        }
    }

    /// Match against the user's applications and commit the chosen branch.
    async fn route(
        &self,
        raw: &RawInboundEmail,
        analysis: Analysis,
    ) -> Result<ProcessingResult, PipelineError> {
        let applications = self.db.list_applications(&raw.user_id).await?;
        let decision = self
            .matcher
            .match_fact(&analysis.fact, analysis.email_date, &applications);
        debug!(
            email_id = %raw.id,
            match_type = %decision.match_type,
            confidence = decision.confidence,
            "Match decision"
        );

        if decision.should_review {
            return self.commit_review(raw, analysis, decision).await;
        }

        if decision.is_new {
            let Some((company, title)) = identity(&analysis.fact) else {
                let decision = MatchResult {
                    is_new: false,
                    should_review: true,
                    reason: "No company or job title extracted - manual review required".into(),
                    ..decision
                };
                return self.commit_review(raw, analysis, decision).await;
            };
            let (company, title) = (company.to_string(), title.to_string());
            return self.commit_create(raw, analysis, &company, &title).await;
        }

        let application_id = decision
            .application_id
            .filter(|id| applications.iter().any(|a| a.id == *id))
            .ok_or_else(|| PipelineError::ApplicationNotFound {
                id: decision.application_id.unwrap_or_else(Uuid::nil),
            })?;
        self.commit_update(raw, analysis, application_id).await
    }

    /// Unwrap, extract and fingerprint.
    async fn analyze(&self, raw: &RawInboundEmail) -> Result<Analysis, PipelineError> {
        let unwrapped = self
            .unwrapper
            .unwrap(raw.body_text.as_deref(), raw.body_html.as_deref());

        let subject = unwrapped
            .original_subject
            .clone()
            .unwrap_or_else(|| raw.envelope_subject.clone());
        let from = unwrapped
            .original_from
            .clone()
            .unwrap_or_else(|| raw.envelope_from.clone());
        let email_date = unwrapped.original_date.unwrap_or(raw.received_at);
        let body = unwrapped
            .clean_body_text
            .clone()
            .or_else(|| raw.body_text.clone())
            .or_else(|| raw.body_html.as_deref().and_then(html_to_text))
            .unwrap_or_default();

        let fact = self
            .extractor
            .extract(&subject, &body, &from, Some(email_date))
            .await;
        let fingerprint = fingerprint(Some(&from), Some(&subject), unwrapped.original_date, &body);

        debug!(
            email_id = %raw.id,
            unwrap_method = %unwrapped.method,
            email_type = %fact.email_type,
            confidence = fact.overall_confidence,
            "Email analyzed"
        );

        let derived = EmailDerivation {
            original_from: unwrapped.original_from,
            original_to: unwrapped.original_to,
            original_subject: unwrapped.original_subject,
            original_date: unwrapped.original_date,
            clean_body_text: unwrapped.clean_body_text,
            unwrap_confidence: unwrapped.confidence,
            unwrap_method: unwrapped.method.to_string(),
            email_type: fact.email_type,
            extracted: fact.to_audit_json()?,
            fingerprint,
            overall_confidence: fact.overall_confidence,
            parser_version: fact.parser_version.clone(),
        };

        Ok(Analysis {
            fact,
            derived,
            body,
            email_date,
        })
    }

    // ── Terminal branches ───────────────────────────────────────────

    async fn commit_duplicate(
        &self,
        raw: &RawInboundEmail,
        mut analysis: Analysis,
        original: RawInboundEmail,
    ) -> Result<ProcessingResult, PipelineError> {
        let confidence = original
            .overall_confidence
            .unwrap_or(analysis.fact.overall_confidence);
        analysis.derived.overall_confidence = confidence;

        let plan = OutcomePlan::Duplicate {
            duplicate_of: original.id,
            application_id: original.application_id,
        };
        self.commit(raw, analysis.derived, plan).await?;

        info!(email_id = %raw.id, duplicate_of = %original.id, "Duplicate email (fingerprint match)");
        Ok(ProcessingResult {
            raw_email_id: Some(raw.id),
            success: true,
            outcome: Some(EmailOutcome::Duplicate),
            application_id: original.application_id,
            is_new_application: false,
            needs_manual_review: false,
            is_duplicate: true,
            error: None,
            confidence,
        })
    }

    async fn commit_review(
        &self,
        raw: &RawInboundEmail,
        analysis: Analysis,
        decision: MatchResult,
    ) -> Result<ProcessingResult, PipelineError> {
        let fact = &analysis.fact;
        let item = ReviewItem {
            id: Uuid::new_v4(),
            user_id: raw.user_id.clone(),
            raw_email_id: raw.id,
            application_id: decision.application_id,
            reason: decision.reason.clone(),
            match_type: decision.match_type.to_string(),
            suggested_company: fact.company_name.clone(),
            suggested_title: fact.job_title.clone(),
            suggested_status: Some(fact.status),
            confidence: decision.confidence,
            resolved: false,
            resolution: None,
            resolved_at: None,
            resolved_application_id: None,
            created_at: Utc::now(),
        };
        self.commit(raw, analysis.derived, OutcomePlan::Review(item))
            .await?;

        info!(email_id = %raw.id, reason = %decision.reason, "Email queued for review");
        Ok(ProcessingResult {
            raw_email_id: Some(raw.id),
            success: true,
            outcome: Some(EmailOutcome::Reviewed),
            application_id: decision.application_id,
            is_new_application: false,
            needs_manual_review: true,
            is_duplicate: false,
            error: None,
            confidence: decision.confidence,
        })
    }

    async fn commit_create(
        &self,
        raw: &RawInboundEmail,
        analysis: Analysis,
        company: &str,
        title: &str,
    ) -> Result<ProcessingResult, PipelineError> {
        let application =
            new_application(&raw.user_id, company, title, &analysis.fact, analysis.email_date);
        let write = ApplicationWrite::Create {
            event: build_event(application.id, raw.id, &analysis),
            links: build_links(application.id, raw.id, &analysis.fact),
            application: application.clone(),
        };

        match self
            .commit(raw, analysis.derived.clone(), OutcomePlan::Apply(write))
            .await
        {
            Ok(()) => {
                info!(
                    email_id = %raw.id,
                    application_id = %application.id,
                    company = %application.company_name,
                    title = %application.job_title,
                    "Created application"
                );
                Ok(applied(raw, &analysis, application.id, true))
            }
            Err(DatabaseError::Conflict { .. }) => {
                // Lost a race on (user, company, title): update the winner instead.
                let winner = self
                    .db
                    .find_application_by_identity(
                        &raw.user_id,
                        &application.company_name,
                        &application.job_title,
                    )
                    .await?
                    .ok_or_else(|| {
                        PipelineError::UnresolvedConflict(format!(
                            "{} - {}",
                            application.company_name, application.job_title
                        ))
                    })?;
                debug!(email_id = %raw.id, application_id = %winner.id, "Identity conflict, updating existing application");
                self.commit_update(raw, analysis, winner.id).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn commit_update(
        &self,
        raw: &RawInboundEmail,
        analysis: Analysis,
        application_id: Uuid,
    ) -> Result<ProcessingResult, PipelineError> {
        let write = ApplicationWrite::Update {
            update: application_update(application_id, &analysis.fact, analysis.email_date),
            event: build_event(application_id, raw.id, &analysis),
            links: build_links(application_id, raw.id, &analysis.fact),
        };
        self.commit(raw, analysis.derived.clone(), OutcomePlan::Apply(write))
            .await?;

        info!(email_id = %raw.id, application_id = %application_id, "Updated application");
        Ok(applied(raw, &analysis, application_id, false))
    }

    async fn commit(
        &self,
        raw: &RawInboundEmail,
        derived: EmailDerivation,
        plan: OutcomePlan,
    ) -> Result<(), DatabaseError> {
        self.db
            .commit_email_outcome(&EmailCommit {
                email_id: raw.id,
                derived,
                plan,
                processed_at: Utc::now(),
            })
            .await
    }
}

// ── Record builders ─────────────────────────────────────────────────

fn applied(
    raw: &RawInboundEmail,
    analysis: &Analysis,
    application_id: Uuid,
    is_new: bool,
) -> ProcessingResult {
    ProcessingResult {
        raw_email_id: Some(raw.id),
        success: true,
        outcome: Some(if is_new {
            EmailOutcome::Created
        } else {
            EmailOutcome::Updated
        }),
        application_id: Some(application_id),
        is_new_application: is_new,
        needs_manual_review: false,
        is_duplicate: false,
        error: None,
        confidence: analysis.fact.overall_confidence,
    }
}

/// Company and job title, when both were extracted.
fn identity(fact: &ExtractedFact) -> Option<(&str, &str)> {
    let company = fact.company_name.as_deref().map(str::trim).filter(|c| !c.is_empty())?;
    let title = fact.job_title.as_deref().map(str::trim).filter(|t| !t.is_empty())?;
    Some((company, title))
}

/// Fresh application seeded from `fact`, with its first event counted.
pub(crate) fn new_application(
    user_id: &str,
    company: &str,
    title: &str,
    fact: &ExtractedFact,
    email_date: DateTime<Utc>,
) -> Application {
    let mut app = Application::new(user_id, company, title, fact.status, email_date);
    app.location = fact.location.clone();
    app.action_required = fact.action_required;
    app.action_type = fact.action_type;
    app.action_deadline = fact.action_deadline;
    app.action_description = fact.action_description.clone();
    app.company_confidence = fact.company_confidence;
    app.job_title_confidence = fact.job_title_confidence;
    app.overall_confidence = fact.overall_confidence;
    app.event_count = 1;
    app.link_count = fact.links.len() as i64;
    app
}

pub(crate) fn application_update(
    application_id: Uuid,
    fact: &ExtractedFact,
    email_date: DateTime<Utc>,
) -> ApplicationUpdate {
    ApplicationUpdate {
        application_id,
        status: fact.status,
        email_date,
        action: fact.action_required.then(|| ActionUpdate {
            action_type: fact.action_type,
            deadline: fact.action_deadline,
            description: fact.action_description.clone(),
        }),
    }
}

fn build_event(application_id: Uuid, raw_email_id: Uuid, analysis: &Analysis) -> ApplicationEvent {
    let fact = &analysis.fact;
    let description: String = analysis.body.chars().take(EVENT_DESCRIPTION_CHARS).collect();
    ApplicationEvent {
        id: Uuid::new_v4(),
        application_id,
        raw_email_id,
        event_type: fact.email_type,
        status: fact.status,
        event_date: analysis.email_date,
        title: fact.email_type.event_title().to_string(),
        description: (!description.trim().is_empty()).then_some(description),
        confidence: fact.overall_confidence,
        created_at: Utc::now(),
    }
}

/// Links expire with the action deadline, when an action is required.
pub(crate) fn build_links(application_id: Uuid, raw_email_id: Uuid, fact: &ExtractedFact) -> Vec<ApplicationLink> {
    let expires_at = fact.action_deadline.filter(|_| fact.action_required);
    fact.links
        .iter()
        .map(|link| ApplicationLink {
            id: Uuid::new_v4(),
            application_id,
            raw_email_id,
            url: link.url.clone(),
            link_type: link.link_type,
            link_text: link.link_text.clone(),
            confidence: link.confidence,
            expires_at,
            created_at: Utc::now(),
        })
        .collect()
}
