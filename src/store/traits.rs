//! `Database` trait, the single async interface for all persistence.
//!
//! Everything the pipeline writes for one email goes through
//! [`Database::commit_email_outcome`], which applies it as one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::applications::model::{
    ActionType, Application, ApplicationEvent, ApplicationLink, ApplicationStatus, EmailOutcome,
    EmailType, ProcessingStats, RawInboundEmail, ReviewAction, ReviewItem,
};
use crate::error::DatabaseError;

/// Fields the pipeline derived from an email, stored alongside it.
#[derive(Debug, Clone)]
pub struct EmailDerivation {
    pub original_from: Option<String>,
    pub original_to: Option<String>,
    pub original_subject: Option<String>,
    pub original_date: Option<DateTime<Utc>>,
    pub clean_body_text: Option<String>,
    pub unwrap_confidence: f64,
    pub unwrap_method: String,
    pub email_type: EmailType,
    pub extracted: serde_json::Value,
    pub fingerprint: String,
    pub overall_confidence: f64,
    pub parser_version: String,
}

/// Action fields copied onto an application when a new email requires one.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionUpdate {
    pub action_type: Option<ActionType>,
    pub deadline: Option<DateTime<Utc>>,
    pub description: Option<String>,
}

/// Merge of one new email into an existing application.
///
/// Status and its timestamp only move when `status` differs from the stored one;
/// `latest_email_date` only advances.
#[derive(Debug, Clone)]
pub struct ApplicationUpdate {
    pub application_id: Uuid,
    pub status: ApplicationStatus,
    pub email_date: DateTime<Utc>,
    pub action: Option<ActionUpdate>,
}

/// Application-side writes for one email.
#[derive(Debug, Clone)]
pub enum ApplicationWrite {
    Create {
        application: Application,
        event: ApplicationEvent,
        links: Vec<ApplicationLink>,
    },
    Update {
        update: ApplicationUpdate,
        event: ApplicationEvent,
        links: Vec<ApplicationLink>,
    },
}

impl ApplicationWrite {
    pub fn application_id(&self) -> Uuid {
        match self {
            Self::Create { application, .. } => application.id,
            Self::Update { update, .. } => update.application_id,
        }
    }
}

/// Terminal branch for one email.
#[derive(Debug, Clone)]
pub enum OutcomePlan {
    /// Same content as `duplicate_of`; no application-side writes.
    Duplicate {
        duplicate_of: Uuid,
        application_id: Option<Uuid>,
    },
    Review(ReviewItem),
    Apply(ApplicationWrite),
}

impl OutcomePlan {
    pub fn outcome(&self) -> EmailOutcome {
        match self {
            Self::Duplicate { .. } => EmailOutcome::Duplicate,
            Self::Review(_) => EmailOutcome::Reviewed,
            Self::Apply(ApplicationWrite::Create { .. }) => EmailOutcome::Created,
            Self::Apply(ApplicationWrite::Update { .. }) => EmailOutcome::Updated,
        }
    }

    pub fn application_id(&self) -> Option<Uuid> {
        match self {
            Self::Duplicate { application_id, .. } => *application_id,
            Self::Review(item) => item.application_id,
            Self::Apply(write) => Some(write.application_id()),
        }
    }
}

/// Everything committed for one email, atomically.
#[derive(Debug, Clone)]
pub struct EmailCommit {
    pub email_id: Uuid,
    pub derived: EmailDerivation,
    pub plan: OutcomePlan,
    pub processed_at: DateTime<Utc>,
}

/// Disposition of a review item, committed atomically with its writes.
#[derive(Debug, Clone)]
pub struct ReviewClosure {
    pub review_id: Uuid,
    pub action: ReviewAction,
    pub resolved_at: DateTime<Utc>,
    /// `None` for an ignored item.
    pub write: Option<ApplicationWrite>,
}

/// Backend-agnostic database trait covering emails, applications and reviews.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Raw emails ──────────────────────────────────────────────────

    /// Insert a received email. A second email with the same (user, transport id)
    /// is rejected with [`DatabaseError::Conflict`].
    async fn insert_raw_email(&self, email: &RawInboundEmail) -> Result<(), DatabaseError>;

    async fn get_raw_email(&self, id: Uuid) -> Result<Option<RawInboundEmail>, DatabaseError>;

    async fn get_raw_email_by_transport_id(
        &self,
        user_id: &str,
        transport_id: &str,
    ) -> Result<Option<RawInboundEmail>, DatabaseError>;

    /// Earliest original (not itself a duplicate) of `user_id` with this
    /// fingerprint, other than `exclude_id`.
    async fn find_raw_email_by_fingerprint(
        &self,
        user_id: &str,
        fingerprint: &str,
        exclude_id: Uuid,
    ) -> Result<Option<RawInboundEmail>, DatabaseError>;

    /// Unprocessed emails carrying an error note, oldest first.
    async fn list_failed_emails(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<RawInboundEmail>, DatabaseError>;

    /// Users that have at least one failed email.
    async fn list_users_with_failed_emails(&self) -> Result<Vec<String>, DatabaseError>;

    /// Leave the email unprocessed with an error note.
    async fn mark_email_error(&self, id: Uuid, error: &str) -> Result<(), DatabaseError>;

    // ── Applications ────────────────────────────────────────────────

    /// All applications of a user, most recently active first.
    async fn list_applications(&self, user_id: &str) -> Result<Vec<Application>, DatabaseError>;

    async fn get_application(&self, id: Uuid) -> Result<Option<Application>, DatabaseError>;

    /// Lookup by identity key (trimmed, case-insensitive company and title).
    async fn find_application_by_identity(
        &self,
        user_id: &str,
        company_name: &str,
        job_title: &str,
    ) -> Result<Option<Application>, DatabaseError>;

    /// Timeline of an application, oldest first.
    async fn list_events(&self, application_id: Uuid)
    -> Result<Vec<ApplicationEvent>, DatabaseError>;

    async fn list_links(&self, application_id: Uuid) -> Result<Vec<ApplicationLink>, DatabaseError>;

    // ── Pipeline commit ─────────────────────────────────────────────

    /// Apply every write for one email in a single transaction and mark it processed.
    ///
    /// On any failure nothing is persisted. A (user, company, title) collision on
    /// create is reported as [`DatabaseError::Conflict`]. A non-duplicate plan for an
    /// email whose fingerprint another original already holds is rejected with
    /// [`DatabaseError::DuplicateContent`].
    async fn commit_email_outcome(&self, commit: &EmailCommit) -> Result<(), DatabaseError>;

    // ── Review queue ────────────────────────────────────────────────

    async fn get_review_item(&self, id: Uuid) -> Result<Option<ReviewItem>, DatabaseError>;

    /// Unresolved review items of a user, newest first.
    async fn list_open_reviews(&self, user_id: &str) -> Result<Vec<ReviewItem>, DatabaseError>;

    /// Record a resolution. Fails with [`DatabaseError::Conflict`] if the item was
    /// already resolved or the write collides with an existing application.
    async fn resolve_review(&self, closure: &ReviewClosure) -> Result<(), DatabaseError>;

    // ── Stats ───────────────────────────────────────────────────────

    async fn processing_stats(&self, user_id: &str) -> Result<ProcessingStats, DatabaseError>;
}
