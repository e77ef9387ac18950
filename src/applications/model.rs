//! Application tracking data model: statuses, stored records and review items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Normalized lifecycle status of a job application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationStatus {
    AppliedReceived,
    InReview,
    NextStepAssessment,
    NextStepScheduling,
    InterviewScheduled,
    InterviewCompleted,
    OfferExtended,
    OfferAccepted,
    Rejected,
    Withdrawn,
    Ghosted,
    OtherUpdate,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AppliedReceived => "APPLIED_RECEIVED",
            Self::InReview => "IN_REVIEW",
            Self::NextStepAssessment => "NEXT_STEP_ASSESSMENT",
            Self::NextStepScheduling => "NEXT_STEP_SCHEDULING",
            Self::InterviewScheduled => "INTERVIEW_SCHEDULED",
            Self::InterviewCompleted => "INTERVIEW_COMPLETED",
            Self::OfferExtended => "OFFER_EXTENDED",
            Self::OfferAccepted => "OFFER_ACCEPTED",
            Self::Rejected => "REJECTED",
            Self::Withdrawn => "WITHDRAWN",
            Self::Ghosted => "GHOSTED",
            Self::OtherUpdate => "OTHER_UPDATE",
        }
    }
}

impl std::fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ApplicationStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "APPLIED_RECEIVED" => Ok(Self::AppliedReceived),
            "IN_REVIEW" => Ok(Self::InReview),
            "NEXT_STEP_ASSESSMENT" => Ok(Self::NextStepAssessment),
            "NEXT_STEP_SCHEDULING" => Ok(Self::NextStepScheduling),
            "INTERVIEW_SCHEDULED" => Ok(Self::InterviewScheduled),
            "INTERVIEW_COMPLETED" => Ok(Self::InterviewCompleted),
            "OFFER_EXTENDED" => Ok(Self::OfferExtended),
            "OFFER_ACCEPTED" => Ok(Self::OfferAccepted),
            "REJECTED" => Ok(Self::Rejected),
            "WITHDRAWN" => Ok(Self::Withdrawn),
            "GHOSTED" => Ok(Self::Ghosted),
            "OTHER_UPDATE" => Ok(Self::OtherUpdate),
            _ => Err(format!("Unknown application status: {}", s)),
        }
    }
}

/// Kind of follow-up the candidate has to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    CompleteAssessment,
    ScheduleInterview,
    RespondToEmail,
    SubmitDocuments,
    FollowUp,
    AcceptOffer,
    Other,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CompleteAssessment => "COMPLETE_ASSESSMENT",
            Self::ScheduleInterview => "SCHEDULE_INTERVIEW",
            Self::RespondToEmail => "RESPOND_TO_EMAIL",
            Self::SubmitDocuments => "SUBMIT_DOCUMENTS",
            Self::FollowUp => "FOLLOW_UP",
            Self::AcceptOffer => "ACCEPT_OFFER",
            Self::Other => "OTHER",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMPLETE_ASSESSMENT" => Ok(Self::CompleteAssessment),
            "SCHEDULE_INTERVIEW" => Ok(Self::ScheduleInterview),
            "RESPOND_TO_EMAIL" => Ok(Self::RespondToEmail),
            "SUBMIT_DOCUMENTS" => Ok(Self::SubmitDocuments),
            "FOLLOW_UP" => Ok(Self::FollowUp),
            "ACCEPT_OFFER" => Ok(Self::AcceptOffer),
            "OTHER" => Ok(Self::Other),
            _ => Err(format!("Unknown action type: {}", s)),
        }
    }
}

/// Classification of a URL found in an email body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkType {
    JobPosting,
    AssessmentPortal,
    SchedulingLink,
    VideoInterview,
    CompanyPortal,
    DocumentUpload,
    Other,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobPosting => "JOB_POSTING",
            Self::AssessmentPortal => "ASSESSMENT_PORTAL",
            Self::SchedulingLink => "SCHEDULING_LINK",
            Self::VideoInterview => "VIDEO_INTERVIEW",
            Self::CompanyPortal => "COMPANY_PORTAL",
            Self::DocumentUpload => "DOCUMENT_UPLOAD",
            Self::Other => "OTHER",
        }
    }
}

impl std::fmt::Display for LinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LinkType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "JOB_POSTING" => Ok(Self::JobPosting),
            "ASSESSMENT_PORTAL" => Ok(Self::AssessmentPortal),
            "SCHEDULING_LINK" => Ok(Self::SchedulingLink),
            "VIDEO_INTERVIEW" => Ok(Self::VideoInterview),
            "COMPANY_PORTAL" => Ok(Self::CompanyPortal),
            "DOCUMENT_UPLOAD" => Ok(Self::DocumentUpload),
            "OTHER" => Ok(Self::Other),
            _ => Err(format!("Unknown link type: {}", s)),
        }
    }
}

/// Intent classification of an email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmailType {
    ApplicationConfirmation,
    Rejection,
    AssessmentInvite,
    InterviewRequest,
    InterviewConfirmation,
    Offer,
    GeneralUpdate,
    Unknown,
}

impl EmailType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApplicationConfirmation => "APPLICATION_CONFIRMATION",
            Self::Rejection => "REJECTION",
            Self::AssessmentInvite => "ASSESSMENT_INVITE",
            Self::InterviewRequest => "INTERVIEW_REQUEST",
            Self::InterviewConfirmation => "INTERVIEW_CONFIRMATION",
            Self::Offer => "OFFER",
            Self::GeneralUpdate => "GENERAL_UPDATE",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Normalized status implied by this kind of email.
    pub fn implied_status(&self) -> ApplicationStatus {
        match self {
            Self::ApplicationConfirmation => ApplicationStatus::AppliedReceived,
            Self::Rejection => ApplicationStatus::Rejected,
            Self::AssessmentInvite => ApplicationStatus::NextStepAssessment,
            Self::InterviewRequest => ApplicationStatus::NextStepScheduling,
            Self::InterviewConfirmation => ApplicationStatus::InterviewScheduled,
            Self::Offer => ApplicationStatus::OfferExtended,
            Self::GeneralUpdate | Self::Unknown => ApplicationStatus::OtherUpdate,
        }
    }

    /// Timeline title for an event created from this kind of email.
    pub fn event_title(&self) -> &'static str {
        match self {
            Self::ApplicationConfirmation => "Application Received",
            Self::Rejection => "Application Rejected",
            Self::AssessmentInvite => "Assessment Invited",
            Self::InterviewRequest => "Interview Requested",
            Self::InterviewConfirmation => "Interview Scheduled",
            Self::Offer => "Offer Extended",
            Self::GeneralUpdate | Self::Unknown => "Update",
        }
    }
}

impl std::fmt::Display for EmailType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EmailType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "APPLICATION_CONFIRMATION" => Ok(Self::ApplicationConfirmation),
            "REJECTION" => Ok(Self::Rejection),
            "ASSESSMENT_INVITE" => Ok(Self::AssessmentInvite),
            "INTERVIEW_REQUEST" => Ok(Self::InterviewRequest),
            "INTERVIEW_CONFIRMATION" => Ok(Self::InterviewConfirmation),
            "OFFER" => Ok(Self::Offer),
            "GENERAL_UPDATE" => Ok(Self::GeneralUpdate),
            "UNKNOWN" => Ok(Self::Unknown),
            _ => Err(format!("Unknown email type: {}", s)),
        }
    }
}

/// Terminal state the pipeline recorded for an email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailOutcome {
    Created,
    Updated,
    Reviewed,
    Duplicate,
}

impl std::fmt::Display for EmailOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::Reviewed => write!(f, "reviewed"),
            Self::Duplicate => write!(f, "duplicate"),
        }
    }
}

impl std::str::FromStr for EmailOutcome {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "updated" => Ok(Self::Updated),
            "reviewed" => Ok(Self::Reviewed),
            "duplicate" => Ok(Self::Duplicate),
            _ => Err(format!("Unknown email outcome: {}", s)),
        }
    }
}

/// How a review item was disposed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    CreatedNew,
    LinkedExisting,
    Ignored,
}

impl std::fmt::Display for ReviewAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreatedNew => write!(f, "created_new"),
            Self::LinkedExisting => write!(f, "linked_existing"),
            Self::Ignored => write!(f, "ignored"),
        }
    }
}

impl std::str::FromStr for ReviewAction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created_new" => Ok(Self::CreatedNew),
            "linked_existing" => Ok(Self::LinkedExisting),
            "ignored" => Ok(Self::Ignored),
            _ => Err(format!("Unknown review action: {}", s)),
        }
    }
}

/// Normalize a company name or job title into its identity key.
///
/// Two applications with the same user and the same pair of keys are the same application.
pub fn identity_key(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

// ── Stored records ──────────────────────────────────────────────────

/// One physical email as received, plus everything derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawInboundEmail {
    pub id: Uuid,
    pub user_id: String,
    pub transport_id: String,
    pub conversation_id: Option<String>,
    pub received_at: DateTime<Utc>,
    pub envelope_from: String,
    pub envelope_to: String,
    pub envelope_subject: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    #[serde(default)]
    pub raw_headers: serde_json::Value,

    // Derived by the pipeline.
    pub original_from: Option<String>,
    pub original_to: Option<String>,
    pub original_subject: Option<String>,
    pub original_date: Option<DateTime<Utc>>,
    pub clean_body_text: Option<String>,
    pub unwrap_confidence: Option<f64>,
    pub unwrap_method: Option<String>,
    pub email_type: Option<EmailType>,
    pub extracted: Option<serde_json::Value>,
    pub fingerprint: Option<String>,
    pub overall_confidence: Option<f64>,
    pub parser_version: Option<String>,

    pub processed: bool,
    pub outcome: Option<EmailOutcome>,
    pub application_id: Option<Uuid>,
    pub processing_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Per-user aggregate for one (company, job title) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: Uuid,
    pub user_id: String,
    pub company_name: String,
    pub job_title: String,
    pub location: Option<String>,
    pub first_seen_date: DateTime<Utc>,
    pub application_date: Option<DateTime<Utc>>,
    pub current_status: ApplicationStatus,
    pub status_updated_at: DateTime<Utc>,
    pub action_required: bool,
    pub action_type: Option<ActionType>,
    pub action_deadline: Option<DateTime<Utc>>,
    pub action_description: Option<String>,
    pub company_confidence: f64,
    pub job_title_confidence: f64,
    pub overall_confidence: f64,
    pub event_count: i64,
    pub link_count: i64,
    pub latest_email_date: DateTime<Utc>,
    pub notes: Option<String>,
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Application {
    /// Build a fresh application for `user_id` seen first at `seen_at`.
    pub fn new(
        user_id: impl Into<String>,
        company_name: impl Into<String>,
        job_title: impl Into<String>,
        status: ApplicationStatus,
        seen_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            company_name: company_name.into(),
            job_title: job_title.into(),
            location: None,
            first_seen_date: seen_at,
            application_date: Some(seen_at),
            current_status: status,
            status_updated_at: seen_at,
            action_required: false,
            action_type: None,
            action_deadline: None,
            action_description: None,
            company_confidence: 0.0,
            job_title_confidence: 0.0,
            overall_confidence: 0.0,
            event_count: 0,
            link_count: 0,
            latest_email_date: seen_at,
            notes: None,
            is_archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn company_key(&self) -> String {
        identity_key(&self.company_name)
    }

    pub fn title_key(&self) -> String {
        identity_key(&self.job_title)
    }
}

/// Append-only timeline entry: one per email that affected an application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationEvent {
    pub id: Uuid,
    pub application_id: Uuid,
    pub raw_email_id: Uuid,
    pub event_type: EmailType,
    pub status: ApplicationStatus,
    pub event_date: DateTime<Utc>,
    pub title: String,
    pub description: Option<String>,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

/// A classified link attached to an application and the email it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationLink {
    pub id: Uuid,
    pub application_id: Uuid,
    pub raw_email_id: Uuid,
    pub url: String,
    pub link_type: LinkType,
    pub link_text: Option<String>,
    pub confidence: f64,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Queue entry for an email the pipeline could not attribute with confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewItem {
    pub id: Uuid,
    pub user_id: String,
    pub raw_email_id: Uuid,
    pub application_id: Option<Uuid>,
    pub reason: String,
    pub match_type: String,
    pub suggested_company: Option<String>,
    pub suggested_title: Option<String>,
    pub suggested_status: Option<ApplicationStatus>,
    pub confidence: f64,
    pub resolved: bool,
    pub resolution: Option<ReviewAction>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_application_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Aggregate counters for a user's processing state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub total_emails: i64,
    pub processed_emails: i64,
    pub pending_emails: i64,
    pub pending_review: i64,
    pub total_applications: i64,
    pub average_confidence: f64,
}
