//! Manual review queue resolution.
//!
//! An email the matcher could not attribute waits as a [`ReviewItem`] until a
//! person creates an application for it, links it to an existing one, or
//! ignores it. Each item is resolved exactly once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::applications::model::{
    ApplicationEvent, ApplicationStatus, RawInboundEmail, ReviewAction, ReviewItem,
};
use crate::error::{DatabaseError, PipelineError};
use crate::pipeline::extractor::{ExtractedFact, ExtractionMethod};
use crate::pipeline::matcher::{ApplicationMatcher, CandidateMatch};
use crate::pipeline::processor::{
    EVENT_DESCRIPTION_CHARS, application_update, build_links, new_application,
};
use crate::store::{ApplicationWrite, Database, ReviewClosure};

/// What the reviewer decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Start a new application. An existing one with the same identity is linked instead.
    CreateNew {
        company: String,
        title: String,
        #[serde(default)]
        location: Option<String>,
        #[serde(default)]
        status: Option<ApplicationStatus>,
    },
    LinkExisting {
        application_id: Uuid,
    },
    Ignore,
}

pub struct ReviewService {
    db: Arc<dyn Database>,
    matcher: ApplicationMatcher,
}

impl ReviewService {
    pub fn new(db: Arc<dyn Database>, matcher: ApplicationMatcher) -> Self {
        Self { db, matcher }
    }

    /// Open items of `user_id`, newest first.
    pub async fn open_items(&self, user_id: &str) -> Result<Vec<ReviewItem>, PipelineError> {
        Ok(self.db.list_open_reviews(user_id).await?)
    }

    /// Applications resembling the item's suggested company and title, best first.
    pub async fn candidates(
        &self,
        user_id: &str,
        review_id: Uuid,
        limit: usize,
    ) -> Result<Vec<CandidateMatch>, PipelineError> {
        let item = self.load_item(user_id, review_id).await?;
        let applications = self.db.list_applications(user_id).await?;
        Ok(self.matcher.find_candidates(
            item.suggested_company.as_deref(),
            item.suggested_title.as_deref(),
            limit,
            &applications,
        ))
    }

    /// Apply `decision` and return the resolved item.
    pub async fn resolve(
        &self,
        user_id: &str,
        review_id: Uuid,
        decision: ReviewDecision,
    ) -> Result<ReviewItem, PipelineError> {
        let item = self.load_item(user_id, review_id).await?;
        if item.resolved {
            return Err(PipelineError::ReviewAlreadyResolved { id: review_id });
        }

        let closure = match decision {
            ReviewDecision::Ignore => ReviewClosure {
                review_id,
                action: ReviewAction::Ignored,
                resolved_at: Utc::now(),
                write: None,
            },
            ReviewDecision::LinkExisting { application_id } => {
                let source = self.source_email(&item).await?;
                self.link_closure(&item, &source, application_id).await?
            }
            ReviewDecision::CreateNew {
                company,
                title,
                location,
                status,
            } => {
                let (company, title) = (company.trim(), title.trim());
                if company.is_empty() || title.is_empty() {
                    return Err(PipelineError::InvalidReview(
                        "company and title are required".into(),
                    ));
                }
                let source = self.source_email(&item).await?;
                match self
                    .db
                    .find_application_by_identity(user_id, company, title)
                    .await?
                {
                    Some(existing) => self.link_closure(&item, &source, existing.id).await?,
                    None => create_closure(&item, &source, company, title, location, status),
                }
            }
        };

        match self.db.resolve_review(&closure).await {
            Ok(()) => {}
            Err(DatabaseError::Conflict { detail, .. }) => {
                // Either another resolver won, or another email created the identity first.
                let current = self.load_item(user_id, review_id).await?;
                if current.resolved {
                    return Err(PipelineError::ReviewAlreadyResolved { id: review_id });
                }
                let Some(ApplicationWrite::Create { application, .. }) = &closure.write else {
                    return Err(PipelineError::UnresolvedConflict(detail));
                };
                let winner = self
                    .db
                    .find_application_by_identity(
                        user_id,
                        &application.company_name,
                        &application.job_title,
                    )
                    .await?
                    .ok_or_else(|| PipelineError::UnresolvedConflict(detail.clone()))?;
                warn!(review_id = %review_id, application_id = %winner.id, "Identity taken during review, linking instead");

                let source = self.source_email(&current).await?;
                let retry = self.link_closure(&current, &source, winner.id).await?;
                self.db.resolve_review(&retry).await?;
            }
            Err(e) => return Err(e.into()),
        }

        let resolved = self.load_item(user_id, review_id).await?;
        info!(
            review_id = %review_id,
            action = ?resolved.resolution,
            application_id = ?resolved.resolved_application_id,
            "Review resolved"
        );
        Ok(resolved)
    }

    /// The item, if it exists and belongs to `user_id`.
    async fn load_item(&self, user_id: &str, review_id: Uuid) -> Result<ReviewItem, PipelineError> {
        self.db
            .get_review_item(review_id)
            .await?
            .filter(|item| item.user_id == user_id)
            .ok_or(PipelineError::ReviewNotFound { id: review_id })
    }

    async fn source_email(&self, item: &ReviewItem) -> Result<RawInboundEmail, PipelineError> {
        self.db
            .get_raw_email(item.raw_email_id)
            .await?
            .ok_or_else(|| {
                PipelineError::InvalidReview(format!(
                    "source email {} of review {} is missing",
                    item.raw_email_id, item.id
                ))
            })
    }

    async fn link_closure(
        &self,
        item: &ReviewItem,
        source: &RawInboundEmail,
        application_id: Uuid,
    ) -> Result<ReviewClosure, PipelineError> {
        let application = self
            .db
            .get_application(application_id)
            .await?
            .filter(|app| app.user_id == item.user_id)
            .ok_or(PipelineError::ApplicationNotFound { id: application_id })?;

        let mut fact = stored_fact(source);
        if let Some(status) = item.suggested_status {
            fact.status = status;
        }
        let email_date = email_date(source);

        Ok(ReviewClosure {
            review_id: item.id,
            action: ReviewAction::LinkedExisting,
            resolved_at: Utc::now(),
            write: Some(ApplicationWrite::Update {
                update: application_update(application.id, &fact, email_date),
                event: event_from(application.id, source, &fact, email_date),
                links: build_links(application.id, source.id, &fact),
            }),
        })
    }
}

fn create_closure(
    item: &ReviewItem,
    source: &RawInboundEmail,
    company: &str,
    title: &str,
    location: Option<String>,
    status: Option<ApplicationStatus>,
) -> ReviewClosure {
    let mut fact = stored_fact(source);
    fact.company_name = Some(company.to_string());
    fact.job_title = Some(title.to_string());
    fact.location = location.or(fact.location);
    fact.status = status.or(item.suggested_status).unwrap_or(fact.status);
    // Reviewer-confirmed identity.
    fact.company_confidence = 1.0;
    fact.job_title_confidence = 1.0;
    fact.overall_confidence = 1.0;

    let email_date = email_date(source);
    let application = new_application(&item.user_id, company, title, &fact, email_date);
    let application_id = application.id;

    ReviewClosure {
        review_id: item.id,
        action: ReviewAction::CreatedNew,
        resolved_at: Utc::now(),
        write: Some(ApplicationWrite::Create {
            event: event_from(application_id, source, &fact, email_date),
            links: build_links(application_id, source.id, &fact),
            application,
        }),
    }
}

/// The fact recorded when the email was processed, or an empty one.
fn stored_fact(source: &RawInboundEmail) -> ExtractedFact {
    source
        .extracted
        .clone()
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_else(|| ExtractedFact::empty(ExtractionMethod::RuleBased))
}

fn email_date(source: &RawInboundEmail) -> DateTime<Utc> {
    source.original_date.unwrap_or(source.received_at)
}

fn event_from(
    application_id: Uuid,
    source: &RawInboundEmail,
    fact: &ExtractedFact,
    event_date: DateTime<Utc>,
) -> ApplicationEvent {
    let body = source
        .clean_body_text
        .as_deref()
        .or(source.body_text.as_deref())
        .unwrap_or_default();
    let description: String = body.chars().take(EVENT_DESCRIPTION_CHARS).collect();
    ApplicationEvent {
        id: Uuid::new_v4(),
        application_id,
        raw_email_id: source.id,
        event_type: fact.email_type,
        status: fact.status,
        event_date,
        title: fact.email_type.event_title().to_string(),
        description: (!description.trim().is_empty()).then_some(description),
        confidence: fact.overall_confidence,
        created_at: Utc::now(),
    }
}
