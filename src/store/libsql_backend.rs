//! libSQL implementation of the async `Database` trait.
//!
//! Supports local file and in-memory databases. Every statement, read or write,
//! runs under one lock, so a transaction open on the shared connection is never
//! observed half-applied by another task.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::applications::model::{
    Application, ApplicationEvent, ApplicationLink, ProcessingStats, RawInboundEmail, ReviewItem, identity_key,
};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    ApplicationUpdate, ApplicationWrite, Database, EmailCommit, OutcomePlan, ReviewClosure,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    /// Held for the whole of every operation on `conn`.
    lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(ndt.and_utc());
    }
    Err(DatabaseError::Serialization(format!("invalid datetime {s:?}")))
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.map(|s| parse_datetime(&s)).transpose()
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("invalid id {s:?}: {e}")))
}

fn parse_optional_uuid(s: Option<String>) -> Result<Option<Uuid>, DatabaseError> {
    s.map(|s| parse_uuid(&s)).transpose()
}

fn parse_json(s: &str) -> Result<serde_json::Value, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(format!("invalid JSON: {e}")))
}

/// Required column read.
fn column<T>(value: Result<T, libsql::Error>) -> Result<T, DatabaseError> {
    value.map_err(|e| DatabaseError::Query(format!("row parse: {e}")))
}

/// Parse a stored enum name.
fn parse_enum<T: FromStr<Err = String>>(s: &str) -> Result<T, DatabaseError> {
    s.parse().map_err(DatabaseError::Serialization)
}

fn parse_optional<T: FromStr<Err = String>>(s: Option<String>) -> Result<Option<T>, DatabaseError> {
    s.map(|s| parse_enum(&s)).transpose()
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_real(v: Option<f64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Real(v),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    opt_text_owned(dt.map(|d| d.to_rfc3339()))
}

fn opt_uuid(id: Option<Uuid>) -> libsql::Value {
    opt_text_owned(id.map(|id| id.to_string()))
}

/// Map a write failure, surfacing unique-constraint violations as conflicts.
fn write_error(op: &str, entity: &str, e: libsql::Error) -> DatabaseError {
    let message = e.to_string();
    if message.contains("UNIQUE constraint failed") {
        DatabaseError::Conflict {
            entity: entity.to_string(),
            detail: message,
        }
    } else {
        DatabaseError::Query(format!("{op}: {message}"))
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

const RAW_EMAIL_COLUMNS: &str = "id, user_id, transport_id, conversation_id, received_at, \
    envelope_from, envelope_to, envelope_subject, body_text, body_html, raw_headers, \
    original_from, original_to, original_subject, original_date, clean_body_text, \
    unwrap_confidence, unwrap_method, email_type, extracted, fingerprint, \
    overall_confidence, parser_version, processed, outcome, application_id, \
    processing_error, processed_at, created_at";

fn row_to_raw_email(row: &libsql::Row) -> Result<RawInboundEmail, DatabaseError> {
    let id_str: String = column(row.get(0))?;
    let received_str: String = column(row.get(4))?;
    let created_str: String = column(row.get(28))?;

    Ok(RawInboundEmail {
        id: parse_uuid(&id_str)?,
        user_id: column(row.get(1))?,
        transport_id: column(row.get(2))?,
        conversation_id: row.get(3).ok(),
        received_at: parse_datetime(&received_str)?,
        envelope_from: column(row.get(5))?,
        envelope_to: column(row.get(6))?,
        envelope_subject: column(row.get(7))?,
        body_text: row.get(8).ok(),
        body_html: row.get(9).ok(),
        raw_headers: row
            .get::<String>(10)
            .ok()
            .map(|s| parse_json(&s))
            .transpose()?
            .unwrap_or(serde_json::Value::Null),
        original_from: row.get(11).ok(),
        original_to: row.get(12).ok(),
        original_subject: row.get(13).ok(),
        original_date: parse_optional_datetime(row.get(14).ok())?,
        clean_body_text: row.get(15).ok(),
        unwrap_confidence: row.get(16).ok(),
        unwrap_method: row.get(17).ok(),
        email_type: parse_optional(row.get(18).ok())?,
        extracted: row
            .get::<String>(19)
            .ok()
            .map(|s| parse_json(&s))
            .transpose()?,
        fingerprint: row.get(20).ok(),
        overall_confidence: row.get(21).ok(),
        parser_version: row.get(22).ok(),
        processed: column(row.get::<i64>(23))? != 0,
        outcome: parse_optional(row.get(24).ok())?,
        application_id: parse_optional_uuid(row.get(25).ok())?,
        processing_error: row.get(26).ok(),
        processed_at: parse_optional_datetime(row.get(27).ok())?,
        created_at: parse_datetime(&created_str)?,
    })
}

const APPLICATION_COLUMNS: &str = "id, user_id, company_name, job_title, location, \
    first_seen_date, application_date, current_status, status_updated_at, action_required, \
    action_type, action_deadline, action_description, company_confidence, \
    job_title_confidence, overall_confidence, event_count, link_count, latest_email_date, \
    notes, is_archived, created_at, updated_at";

fn row_to_application(row: &libsql::Row) -> Result<Application, DatabaseError> {
    let id_str: String = column(row.get(0))?;
    let first_seen_str: String = column(row.get(5))?;
    let status_str: String = column(row.get(7))?;
    let status_updated_str: String = column(row.get(8))?;
    let latest_str: String = column(row.get(18))?;
    let created_str: String = column(row.get(21))?;
    let updated_str: String = column(row.get(22))?;

    Ok(Application {
        id: parse_uuid(&id_str)?,
        user_id: column(row.get(1))?,
        company_name: column(row.get(2))?,
        job_title: column(row.get(3))?,
        location: row.get(4).ok(),
        first_seen_date: parse_datetime(&first_seen_str)?,
        application_date: parse_optional_datetime(row.get(6).ok())?,
        current_status: parse_enum(&status_str)?,
        status_updated_at: parse_datetime(&status_updated_str)?,
        action_required: column(row.get::<i64>(9))? != 0,
        action_type: parse_optional(row.get(10).ok())?,
        action_deadline: parse_optional_datetime(row.get(11).ok())?,
        action_description: row.get(12).ok(),
        company_confidence: column(row.get(13))?,
        job_title_confidence: column(row.get(14))?,
        overall_confidence: column(row.get(15))?,
        event_count: column(row.get(16))?,
        link_count: column(row.get(17))?,
        latest_email_date: parse_datetime(&latest_str)?,
        notes: row.get(19).ok(),
        is_archived: column(row.get::<i64>(20))? != 0,
        created_at: parse_datetime(&created_str)?,
        updated_at: parse_datetime(&updated_str)?,
    })
}

const EVENT_COLUMNS: &str = "id, application_id, raw_email_id, event_type, status, event_date, \
    title, description, confidence, created_at";

fn row_to_event(row: &libsql::Row) -> Result<ApplicationEvent, DatabaseError> {
    let id_str: String = column(row.get(0))?;
    let app_str: String = column(row.get(1))?;
    let email_str: String = column(row.get(2))?;
    let type_str: String = column(row.get(3))?;
    let status_str: String = column(row.get(4))?;
    let date_str: String = column(row.get(5))?;
    let created_str: String = column(row.get(9))?;

    Ok(ApplicationEvent {
        id: parse_uuid(&id_str)?,
        application_id: parse_uuid(&app_str)?,
        raw_email_id: parse_uuid(&email_str)?,
        event_type: parse_enum(&type_str)?,
        status: parse_enum(&status_str)?,
        event_date: parse_datetime(&date_str)?,
        title: column(row.get(6))?,
        description: row.get(7).ok(),
        confidence: column(row.get(8))?,
        created_at: parse_datetime(&created_str)?,
    })
}

const LINK_COLUMNS: &str =
    "id, application_id, raw_email_id, url, link_type, link_text, confidence, expires_at, created_at";

fn row_to_link(row: &libsql::Row) -> Result<ApplicationLink, DatabaseError> {
    let id_str: String = column(row.get(0))?;
    let app_str: String = column(row.get(1))?;
    let email_str: String = column(row.get(2))?;
    let type_str: String = column(row.get(4))?;
    let created_str: String = column(row.get(8))?;

    Ok(ApplicationLink {
        id: parse_uuid(&id_str)?,
        application_id: parse_uuid(&app_str)?,
        raw_email_id: parse_uuid(&email_str)?,
        url: column(row.get(3))?,
        link_type: parse_enum(&type_str)?,
        link_text: row.get(5).ok(),
        confidence: column(row.get(6))?,
        expires_at: parse_optional_datetime(row.get(7).ok())?,
        created_at: parse_datetime(&created_str)?,
    })
}

const REVIEW_COLUMNS: &str = "id, user_id, raw_email_id, application_id, reason, match_type, \
    suggested_company, suggested_title, suggested_status, confidence, resolved, resolution, \
    resolved_at, resolved_application_id, created_at";

fn row_to_review(row: &libsql::Row) -> Result<ReviewItem, DatabaseError> {
    let id_str: String = column(row.get(0))?;
    let email_str: String = column(row.get(2))?;
    let created_str: String = column(row.get(14))?;

    Ok(ReviewItem {
        id: parse_uuid(&id_str)?,
        user_id: column(row.get(1))?,
        raw_email_id: parse_uuid(&email_str)?,
        application_id: parse_optional_uuid(row.get(3).ok())?,
        reason: column(row.get(4))?,
        match_type: column(row.get(5))?,
        suggested_company: row.get(6).ok(),
        suggested_title: row.get(7).ok(),
        suggested_status: parse_optional(row.get(8).ok())?,
        confidence: column(row.get(9))?,
        resolved: column(row.get::<i64>(10))? != 0,
        resolution: parse_optional(row.get(11).ok())?,
        resolved_at: parse_optional_datetime(row.get(12).ok())?,
        resolved_application_id: parse_optional_uuid(row.get(13).ok())?,
        created_at: parse_datetime(&created_str)?,
    })
}

// ── Transactional writes ────────────────────────────────────────────

async fn insert_application(conn: &Connection, app: &Application) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO applications (id, user_id, company_name, job_title, company_key, title_key, location, first_seen_date, application_date, current_status, status_updated_at, action_required, action_type, action_deadline, action_description, company_confidence, job_title_confidence, overall_confidence, event_count, link_count, latest_email_date, notes, is_archived, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
        params![
            app.id.to_string(),
            app.user_id.clone(),
            app.company_name.clone(),
            app.job_title.clone(),
            app.company_key(),
            app.title_key(),
            opt_text(app.location.as_deref()),
            app.first_seen_date.to_rfc3339(),
            opt_datetime(app.application_date),
            app.current_status.as_str(),
            app.status_updated_at.to_rfc3339(),
            app.action_required as i64,
            opt_text(app.action_type.map(|t| t.as_str())),
            opt_datetime(app.action_deadline),
            opt_text(app.action_description.as_deref()),
            app.company_confidence,
            app.job_title_confidence,
            app.overall_confidence,
            app.event_count,
            app.link_count,
            app.latest_email_date.to_rfc3339(),
            opt_text(app.notes.as_deref()),
            app.is_archived as i64,
            app.created_at.to_rfc3339(),
            app.updated_at.to_rfc3339(),
        ],
    )
    .await
    .map_err(|e| write_error("insert_application", "application", e))?;
    Ok(())
}

async fn update_application(
    conn: &Connection,
    update: &ApplicationUpdate,
    new_links: usize,
) -> Result<(), DatabaseError> {
    let now = Utc::now().to_rfc3339();
    let email_date = update.email_date.to_rfc3339();

    let affected = conn
        .execute(
            "UPDATE applications SET
                status_updated_at = CASE WHEN current_status <> ?2 THEN ?3 ELSE status_updated_at END,
                current_status = ?2,
                latest_email_date = CASE WHEN latest_email_date < ?3 THEN ?3 ELSE latest_email_date END,
                event_count = event_count + 1,
                link_count = link_count + ?4,
                updated_at = ?5
             WHERE id = ?1",
            params![
                update.application_id.to_string(),
                update.status.as_str(),
                email_date,
                new_links as i64,
                now.clone(),
            ],
        )
        .await
        .map_err(|e| write_error("update_application", "application", e))?;

    if affected == 0 {
        return Err(DatabaseError::NotFound {
            entity: "application".into(),
            id: update.application_id.to_string(),
        });
    }

    if let Some(action) = &update.action {
        conn.execute(
            "UPDATE applications SET action_required = 1, action_type = ?2, action_deadline = ?3, action_description = ?4, updated_at = ?5 WHERE id = ?1",
            params![
                update.application_id.to_string(),
                opt_text(action.action_type.map(|t| t.as_str())),
                opt_datetime(action.deadline),
                opt_text(action.description.as_deref()),
                now,
            ],
        )
        .await
        .map_err(|e| write_error("update_application action", "application", e))?;
    }
    Ok(())
}

async fn insert_event(conn: &Connection, event: &ApplicationEvent) -> Result<(), DatabaseError> {
    conn.execute(
        &format!("INSERT INTO application_events ({EVENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
        params![
            event.id.to_string(),
            event.application_id.to_string(),
            event.raw_email_id.to_string(),
            event.event_type.as_str(),
            event.status.as_str(),
            event.event_date.to_rfc3339(),
            event.title.clone(),
            opt_text(event.description.as_deref()),
            event.confidence,
            event.created_at.to_rfc3339(),
        ],
    )
    .await
    .map_err(|e| write_error("insert_event", "application_event", e))?;
    Ok(())
}

async fn insert_link(conn: &Connection, link: &ApplicationLink) -> Result<(), DatabaseError> {
    conn.execute(
        &format!("INSERT INTO application_links ({LINK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
        params![
            link.id.to_string(),
            link.application_id.to_string(),
            link.raw_email_id.to_string(),
            link.url.clone(),
            link.link_type.as_str(),
            opt_text(link.link_text.as_deref()),
            link.confidence,
            opt_datetime(link.expires_at),
            link.created_at.to_rfc3339(),
        ],
    )
    .await
    .map_err(|e| write_error("insert_link", "application_link", e))?;
    Ok(())
}

async fn insert_review(conn: &Connection, item: &ReviewItem) -> Result<(), DatabaseError> {
    conn.execute(
        &format!("INSERT INTO review_items ({REVIEW_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"),
        params![
            item.id.to_string(),
            item.user_id.clone(),
            item.raw_email_id.to_string(),
            opt_uuid(item.application_id),
            item.reason.clone(),
            item.match_type.clone(),
            opt_text(item.suggested_company.as_deref()),
            opt_text(item.suggested_title.as_deref()),
            opt_text(item.suggested_status.map(|s| s.as_str())),
            item.confidence,
            item.resolved as i64,
            opt_text_owned(item.resolution.map(|r| r.to_string())),
            opt_datetime(item.resolved_at),
            opt_uuid(item.resolved_application_id),
            item.created_at.to_rfc3339(),
        ],
    )
    .await
    .map_err(|e| write_error("insert_review", "review_item", e))?;
    Ok(())
}

async fn apply_application_write(
    conn: &Connection,
    write: &ApplicationWrite,
) -> Result<(), DatabaseError> {
    let (event, links) = match write {
        ApplicationWrite::Create {
            application,
            event,
            links,
        } => {
            insert_application(conn, application).await?;
            (event, links)
        }
        ApplicationWrite::Update {
            update,
            event,
            links,
        } => {
            update_application(conn, update, links.len()).await?;
            (event, links)
        }
    };

    insert_event(conn, event).await?;
    for link in links {
        insert_link(conn, link).await?;
    }
    Ok(())
}

/// Earliest other original (not itself a duplicate) of the same user with this fingerprint.
async fn fingerprint_owner(
    conn: &Connection,
    email_id: Uuid,
    fingerprint: &str,
) -> Result<Option<Uuid>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT id FROM raw_emails WHERE user_id = (SELECT user_id FROM raw_emails WHERE id = ?1) AND fingerprint = ?2 AND id <> ?1 AND duplicate_of IS NULL ORDER BY created_at ASC LIMIT 1",
            params![email_id.to_string(), fingerprint],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("fingerprint_owner: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => {
            let id: String = column(row.get(0))?;
            Ok(Some(parse_uuid(&id)?))
        }
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("fingerprint_owner: {e}"))),
    }
}

async fn apply_email_commit(conn: &Connection, commit: &EmailCommit) -> Result<(), DatabaseError> {
    if !matches!(commit.plan, OutcomePlan::Duplicate { .. })
        && let Some(original) =
            fingerprint_owner(conn, commit.email_id, &commit.derived.fingerprint).await?
    {
        return Err(DatabaseError::DuplicateContent { original });
    }

    let duplicate_of = match &commit.plan {
        OutcomePlan::Duplicate { duplicate_of, .. } => Some(*duplicate_of),
        OutcomePlan::Review(item) => {
            insert_review(conn, item).await?;
            None
        }
        OutcomePlan::Apply(write) => {
            apply_application_write(conn, write).await?;
            None
        }
    };

    let d = &commit.derived;
    let affected = conn
        .execute(
            "UPDATE raw_emails SET original_from = ?2, original_to = ?3, original_subject = ?4, original_date = ?5, clean_body_text = ?6, unwrap_confidence = ?7, unwrap_method = ?8, email_type = ?9, extracted = ?10, fingerprint = ?11, overall_confidence = ?12, parser_version = ?13, processed = 1, outcome = ?14, application_id = ?15, duplicate_of = ?16, processing_error = NULL, processed_at = ?17 WHERE id = ?1",
            params![
                commit.email_id.to_string(),
                opt_text(d.original_from.as_deref()),
                opt_text(d.original_to.as_deref()),
                opt_text(d.original_subject.as_deref()),
                opt_datetime(d.original_date),
                opt_text(d.clean_body_text.as_deref()),
                d.unwrap_confidence,
                d.unwrap_method.clone(),
                d.email_type.as_str(),
                d.extracted.to_string(),
                d.fingerprint.clone(),
                d.overall_confidence,
                d.parser_version.clone(),
                commit.plan.outcome().to_string(),
                opt_uuid(commit.plan.application_id()),
                opt_uuid(duplicate_of),
                commit.processed_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| write_error("commit_email_outcome", "raw_email", e))?;

    if affected == 0 {
        return Err(DatabaseError::NotFound {
            entity: "raw_email".into(),
            id: commit.email_id.to_string(),
        });
    }
    Ok(())
}

async fn apply_review_closure(
    conn: &Connection,
    closure: &ReviewClosure,
) -> Result<(), DatabaseError> {
    let application_id = closure.write.as_ref().map(|w| w.application_id());

    let affected = conn
        .execute(
            "UPDATE review_items SET resolved = 1, resolution = ?2, resolved_at = ?3, resolved_application_id = ?4 WHERE id = ?1 AND resolved = 0",
            params![
                closure.review_id.to_string(),
                closure.action.to_string(),
                closure.resolved_at.to_rfc3339(),
                opt_uuid(application_id),
            ],
        )
        .await
        .map_err(|e| write_error("resolve_review", "review_item", e))?;

    if affected == 0 {
        return Err(DatabaseError::Conflict {
            entity: "review_item".into(),
            detail: format!("{} is missing or already resolved", closure.review_id),
        });
    }

    if let Some(write) = &closure.write {
        apply_application_write(conn, write).await?;
        conn.execute(
            "UPDATE raw_emails SET application_id = ?2 WHERE id = (SELECT raw_email_id FROM review_items WHERE id = ?1)",
            params![closure.review_id.to_string(), write.application_id().to_string()],
        )
        .await
        .map_err(|e| write_error("resolve_review email", "raw_email", e))?;
    }
    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

impl LibSqlBackend {
    async fn query_raw_emails(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<RawInboundEmail>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut emails = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            emails.push(row_to_raw_email(&row)?);
        }
        Ok(emails)
    }

    async fn query_applications(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Application>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut apps = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            apps.push(row_to_application(&row)?);
        }
        Ok(apps)
    }

    /// Single-value count. The caller holds the lock.
    async fn count(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0)),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        migrations::run_migrations(self.conn()).await
    }

    // ── Raw emails ──────────────────────────────────────────────────

    async fn insert_raw_email(&self, email: &RawInboundEmail) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        self.conn()
            .execute(
                &format!("INSERT INTO raw_emails ({RAW_EMAIL_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29)"),
                params![
                    email.id.to_string(),
                    email.user_id.clone(),
                    email.transport_id.clone(),
                    opt_text(email.conversation_id.as_deref()),
                    email.received_at.to_rfc3339(),
                    email.envelope_from.clone(),
                    email.envelope_to.clone(),
                    email.envelope_subject.clone(),
                    opt_text(email.body_text.as_deref()),
                    opt_text(email.body_html.as_deref()),
                    email.raw_headers.to_string(),
                    opt_text(email.original_from.as_deref()),
                    opt_text(email.original_to.as_deref()),
                    opt_text(email.original_subject.as_deref()),
                    opt_datetime(email.original_date),
                    opt_text(email.clean_body_text.as_deref()),
                    opt_real(email.unwrap_confidence),
                    opt_text(email.unwrap_method.as_deref()),
                    opt_text(email.email_type.map(|t| t.as_str())),
                    opt_text_owned(email.extracted.as_ref().map(|v| v.to_string())),
                    opt_text(email.fingerprint.as_deref()),
                    opt_real(email.overall_confidence),
                    opt_text(email.parser_version.as_deref()),
                    email.processed as i64,
                    opt_text_owned(email.outcome.map(|o| o.to_string())),
                    opt_uuid(email.application_id),
                    opt_text(email.processing_error.as_deref()),
                    opt_datetime(email.processed_at),
                    email.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| write_error("insert_raw_email", "raw_email", e))?;

        debug!(email_id = %email.id, user_id = %email.user_id, transport_id = %email.transport_id, "Raw email stored");
        Ok(())
    }

    async fn get_raw_email(&self, id: Uuid) -> Result<Option<RawInboundEmail>, DatabaseError> {
        let emails = self
            .query_raw_emails(
                "get_raw_email",
                &format!("SELECT {RAW_EMAIL_COLUMNS} FROM raw_emails WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(emails.into_iter().next())
    }

    async fn get_raw_email_by_transport_id(
        &self,
        user_id: &str,
        transport_id: &str,
    ) -> Result<Option<RawInboundEmail>, DatabaseError> {
        let emails = self
            .query_raw_emails(
                "get_raw_email_by_transport_id",
                &format!(
                    "SELECT {RAW_EMAIL_COLUMNS} FROM raw_emails WHERE user_id = ?1 AND transport_id = ?2"
                ),
                params![user_id, transport_id],
            )
            .await?;
        Ok(emails.into_iter().next())
    }

    async fn find_raw_email_by_fingerprint(
        &self,
        user_id: &str,
        fingerprint: &str,
        exclude_id: Uuid,
    ) -> Result<Option<RawInboundEmail>, DatabaseError> {
        let emails = self
            .query_raw_emails(
                "find_raw_email_by_fingerprint",
                &format!(
                    "SELECT {RAW_EMAIL_COLUMNS} FROM raw_emails WHERE user_id = ?1 AND fingerprint = ?2 AND id <> ?3 AND duplicate_of IS NULL ORDER BY created_at ASC LIMIT 1"
                ),
                params![user_id, fingerprint, exclude_id.to_string()],
            )
            .await?;
        Ok(emails.into_iter().next())
    }

    async fn list_failed_emails(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<RawInboundEmail>, DatabaseError> {
        self.query_raw_emails(
            "list_failed_emails",
            &format!(
                "SELECT {RAW_EMAIL_COLUMNS} FROM raw_emails WHERE user_id = ?1 AND processed = 0 AND processing_error IS NOT NULL ORDER BY received_at ASC LIMIT ?2"
            ),
            params![user_id, limit as i64],
        )
        .await
    }

    async fn list_users_with_failed_emails(&self) -> Result<Vec<String>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                "SELECT DISTINCT user_id FROM raw_emails WHERE processed = 0 AND processing_error IS NOT NULL ORDER BY user_id",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_users_with_failed_emails: {e}")))?;

        let mut users = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(user) = row.get::<String>(0) {
                users.push(user);
            }
        }
        Ok(users)
    }

    async fn mark_email_error(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        self.conn()
            .execute(
                "UPDATE raw_emails SET processed = 0, processing_error = ?2 WHERE id = ?1",
                params![id.to_string(), error],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_email_error: {e}")))?;

        debug!(email_id = %id, "Email marked as failed");
        Ok(())
    }

    // ── Applications ────────────────────────────────────────────────

    async fn list_applications(&self, user_id: &str) -> Result<Vec<Application>, DatabaseError> {
        self.query_applications(
            "list_applications",
            &format!(
                "SELECT {APPLICATION_COLUMNS} FROM applications WHERE user_id = ?1 ORDER BY latest_email_date DESC"
            ),
            params![user_id],
        )
        .await
    }

    async fn get_application(&self, id: Uuid) -> Result<Option<Application>, DatabaseError> {
        let apps = self
            .query_applications(
                "get_application",
                &format!("SELECT {APPLICATION_COLUMNS} FROM applications WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(apps.into_iter().next())
    }

    async fn find_application_by_identity(
        &self,
        user_id: &str,
        company_name: &str,
        job_title: &str,
    ) -> Result<Option<Application>, DatabaseError> {
        let apps = self
            .query_applications(
                "find_application_by_identity",
                &format!(
                    "SELECT {APPLICATION_COLUMNS} FROM applications WHERE user_id = ?1 AND company_key = ?2 AND title_key = ?3"
                ),
                params![user_id, identity_key(company_name), identity_key(job_title)],
            )
            .await?;
        Ok(apps.into_iter().next())
    }

    async fn list_events(
        &self,
        application_id: Uuid,
    ) -> Result<Vec<ApplicationEvent>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM application_events WHERE application_id = ?1 ORDER BY event_date ASC, created_at ASC"
                ),
                params![application_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_events: {e}")))?;

        let mut events = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_events: {e}")))?
        {
            events.push(row_to_event(&row)?);
        }
        Ok(events)
    }

    async fn list_links(&self, application_id: Uuid) -> Result<Vec<ApplicationLink>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LINK_COLUMNS} FROM application_links WHERE application_id = ?1 ORDER BY created_at ASC"
                ),
                params![application_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_links: {e}")))?;

        let mut links = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_links: {e}")))?
        {
            links.push(row_to_link(&row)?);
        }
        Ok(links)
    }

    // ── Pipeline commit ─────────────────────────────────────────────

    async fn commit_email_outcome(&self, commit: &EmailCommit) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit_email_outcome begin: {e}")))?;

        match apply_email_commit(&tx, commit).await {
            Ok(()) => {
                tx.commit().await.map_err(|e| {
                    DatabaseError::Query(format!("commit_email_outcome commit: {e}"))
                })?;
                debug!(
                    email_id = %commit.email_id,
                    outcome = %commit.plan.outcome(),
                    "Email outcome committed"
                );
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(email_id = %commit.email_id, error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    // ── Review queue ────────────────────────────────────────────────

    async fn get_review_item(&self, id: Uuid) -> Result<Option<ReviewItem>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {REVIEW_COLUMNS} FROM review_items WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_review_item: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let item = row_to_review(&row)?;
                Ok(Some(item))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_review_item: {e}"))),
        }
    }

    async fn list_open_reviews(&self, user_id: &str) -> Result<Vec<ReviewItem>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {REVIEW_COLUMNS} FROM review_items WHERE user_id = ?1 AND resolved = 0 ORDER BY created_at DESC"
                ),
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_open_reviews: {e}")))?;

        let mut items = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_open_reviews: {e}")))?
        {
            items.push(row_to_review(&row)?);
        }
        Ok(items)
    }

    async fn resolve_review(&self, closure: &ReviewClosure) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("resolve_review begin: {e}")))?;

        match apply_review_closure(&tx, closure).await {
            Ok(()) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("resolve_review commit: {e}")))?;
                debug!(review_id = %closure.review_id, action = %closure.action, "Review resolved");
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(review_id = %closure.review_id, error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    // ── Stats ───────────────────────────────────────────────────────

    async fn processing_stats(&self, user_id: &str) -> Result<ProcessingStats, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*), COALESCE(SUM(processed), 0), AVG(CASE WHEN processed = 1 THEN overall_confidence END) FROM raw_emails WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("processing_stats: {e}")))?;

        let (total_emails, processed_emails, average_confidence) = match rows.next().await {
            Ok(Some(row)) => (
                row.get::<i64>(0).unwrap_or(0),
                row.get::<i64>(1).unwrap_or(0),
                row.get::<f64>(2).unwrap_or(0.0),
            ),
            Ok(None) => (0, 0, 0.0),
            Err(e) => return Err(DatabaseError::Query(format!("processing_stats: {e}"))),
        };

        let pending_review = self
            .count(
                "processing_stats reviews",
                "SELECT COUNT(*) FROM review_items WHERE user_id = ?1 AND resolved = 0",
                params![user_id],
            )
            .await?;
        let total_applications = self
            .count(
                "processing_stats applications",
                "SELECT COUNT(*) FROM applications WHERE user_id = ?1",
                params![user_id],
            )
            .await?;

        Ok(ProcessingStats {
            total_emails,
            processed_emails,
            pending_emails: total_emails - processed_emails,
            pending_review,
            total_applications,
            average_confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applications::model::{
        ActionType, ApplicationStatus, EmailOutcome, EmailType, LinkType, ReviewAction,
    };
    use crate::pipeline::types::InboundEmail;
    use crate::store::traits::{ActionUpdate, EmailDerivation};
    use chrono::{Duration, TimeZone};

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 9, 0, 0).unwrap()
    }

    fn make_email(user: &str, transport_id: &str) -> RawInboundEmail {
        InboundEmail {
            transport_id: transport_id.to_string(),
            conversation_id: Some("conv-1".into()),
            received_at: day(10),
            from: "jobs@acme.com".into(),
            to: "me@example.com".into(),
            subject: "Thank you for applying".into(),
            body_text: Some("Thanks for applying".into()),
            body_html: None,
            headers: Default::default(),
        }
        .into_raw(user)
    }

    fn derivation(fingerprint: &str) -> EmailDerivation {
        EmailDerivation {
            original_from: None,
            original_to: None,
            original_subject: None,
            original_date: None,
            clean_body_text: Some("Thanks for applying".into()),
            unwrap_confidence: 1.0,
            unwrap_method: "no_forwarding_detected".into(),
            email_type: EmailType::ApplicationConfirmation,
            extracted: serde_json::json!({"company_name": "Acme"}),
            fingerprint: fingerprint.to_string(),
            overall_confidence: 0.8,
            parser_version: "1.0.0".into(),
        }
    }

    fn event_for(app_id: Uuid, email_id: Uuid, date: DateTime<Utc>) -> ApplicationEvent {
        ApplicationEvent {
            id: Uuid::new_v4(),
            application_id: app_id,
            raw_email_id: email_id,
            event_type: EmailType::ApplicationConfirmation,
            status: ApplicationStatus::AppliedReceived,
            event_date: date,
            title: "Application Received".into(),
            description: None,
            confidence: 0.8,
            created_at: Utc::now(),
        }
    }

    fn link_for(app_id: Uuid, email_id: Uuid, url: &str) -> ApplicationLink {
        ApplicationLink {
            id: Uuid::new_v4(),
            application_id: app_id,
            raw_email_id: email_id,
            url: url.to_string(),
            link_type: LinkType::AssessmentPortal,
            link_text: Some("take the test".into()),
            confidence: 0.9,
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    /// Store an email and commit a new application for it.
    async fn create_app(db: &LibSqlBackend, user: &str, tid: &str, company: &str) -> Application {
        let email = make_email(user, tid);
        db.insert_raw_email(&email).await.unwrap();
        let mut app = Application::new(user, company, "Engineer", ApplicationStatus::AppliedReceived, day(10));
        app.event_count = 1;
        let commit = EmailCommit {
            email_id: email.id,
            derived: derivation(&format!("fp-{tid}")),
            plan: OutcomePlan::Apply(ApplicationWrite::Create {
                event: event_for(app.id, email.id, day(10)),
                links: vec![],
                application: app.clone(),
            }),
            processed_at: Utc::now(),
        };
        db.commit_email_outcome(&commit).await.unwrap();
        app
    }

    // ── Raw email tests ─────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_get_raw_email() {
        let db = test_db().await;
        let email = make_email("u1", "m-1");
        db.insert_raw_email(&email).await.unwrap();

        let fetched = db.get_raw_email(email.id).await.unwrap().unwrap();
        assert_eq!(fetched.transport_id, "m-1");
        assert_eq!(fetched.conversation_id.as_deref(), Some("conv-1"));
        assert_eq!(fetched.received_at, day(10));
        assert!(!fetched.processed);
        assert!(fetched.fingerprint.is_none());

        let by_tid = db.get_raw_email_by_transport_id("u1", "m-1").await.unwrap();
        assert_eq!(by_tid.unwrap().id, email.id);
        assert!(db.get_raw_email_by_transport_id("u2", "m-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_transport_id_is_conflict() {
        let db = test_db().await;
        db.insert_raw_email(&make_email("u1", "m-1")).await.unwrap();

        let err = db.insert_raw_email(&make_email("u1", "m-1")).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict { .. }));

        // Same transport id for another user is a different email.
        db.insert_raw_email(&make_email("u2", "m-1")).await.unwrap();
    }

    #[tokio::test]
    async fn fingerprint_lookup_is_user_scoped_and_excludes_self() {
        let db = test_db().await;
        let first = make_email("u1", "m-1");
        db.insert_raw_email(&first).await.unwrap();
        db.commit_email_outcome(&EmailCommit {
            email_id: first.id,
            derived: derivation("same"),
            plan: OutcomePlan::Review(review_for("u1", first.id)),
            processed_at: Utc::now(),
        })
        .await
        .unwrap();

        assert!(
            db.find_raw_email_by_fingerprint("u1", "same", first.id)
                .await
                .unwrap()
                .is_none()
        );
        let other = Uuid::new_v4();
        let found = db.find_raw_email_by_fingerprint("u1", "same", other).await.unwrap();
        assert_eq!(found.unwrap().id, first.id);
        assert!(
            db.find_raw_email_by_fingerprint("u2", "same", other)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn failed_emails_are_listed_for_retry() {
        let db = test_db().await;
        let email = make_email("u1", "m-1");
        db.insert_raw_email(&email).await.unwrap();
        db.insert_raw_email(&make_email("u1", "m-2")).await.unwrap();

        db.mark_email_error(email.id, "boom").await.unwrap();

        let failed = db.list_failed_emails("u1", 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].processing_error.as_deref(), Some("boom"));
        assert_eq!(db.list_users_with_failed_emails().await.unwrap(), vec!["u1"]);
    }

    #[tokio::test]
    async fn claimed_fingerprint_only_commits_as_duplicate() {
        let db = test_db().await;
        let app = create_app(&db, "u1", "m-1", "Acme").await;
        let original = db.get_raw_email_by_transport_id("u1", "m-1").await.unwrap().unwrap();

        let copy = make_email("u1", "m-2");
        db.insert_raw_email(&copy).await.unwrap();
        let err = db
            .commit_email_outcome(&EmailCommit {
                email_id: copy.id,
                derived: derivation("fp-m-1"),
                plan: OutcomePlan::Apply(ApplicationWrite::Update {
                    update: ApplicationUpdate {
                        application_id: app.id,
                        status: ApplicationStatus::AppliedReceived,
                        email_date: day(10),
                        action: None,
                    },
                    event: event_for(app.id, copy.id, day(10)),
                    links: vec![],
                }),
                processed_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::DuplicateContent { original: id } if id == original.id));
        assert_eq!(db.get_application(app.id).await.unwrap().unwrap().event_count, 1);
        assert!(!db.get_raw_email(copy.id).await.unwrap().unwrap().processed);

        db.commit_email_outcome(&EmailCommit {
            email_id: copy.id,
            derived: derivation("fp-m-1"),
            plan: OutcomePlan::Duplicate {
                duplicate_of: original.id,
                application_id: Some(app.id),
            },
            processed_at: Utc::now(),
        })
        .await
        .unwrap();

        // A recorded duplicate never stands in as an original.
        assert!(
            db.find_raw_email_by_fingerprint("u1", "fp-m-1", original.id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn corrupt_stored_values_are_serialization_errors() {
        let db = test_db().await;
        let app = create_app(&db, "u1", "m-1", "Acme").await;

        db.conn()
            .execute(
                "UPDATE application_events SET raw_email_id = 'not-a-uuid' WHERE application_id = ?1",
                params![app.id.to_string()],
            )
            .await
            .unwrap();
        let err = db.list_events(app.id).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Serialization(_)), "{err:?}");

        db.conn()
            .execute(
                "UPDATE applications SET first_seen_date = 'last tuesday' WHERE id = ?1",
                params![app.id.to_string()],
            )
            .await
            .unwrap();
        let err = db.get_application(app.id).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Serialization(_)), "{err:?}");
        let err = db.list_applications("u1").await.unwrap_err();
        assert!(matches!(err, DatabaseError::Serialization(_)), "{err:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_never_see_rolled_back_writes() {
        let db = Arc::new(test_db().await);

        let writer = {
            let db = Arc::clone(&db);
            tokio::spawn(async move {
                for i in 0..25 {
                    let email = make_email("u1", &format!("m-{i}"));
                    db.insert_raw_email(&email).await.unwrap();
                    let app = Application::new(
                        "u1",
                        &format!("Company {i}"),
                        "Engineer",
                        ApplicationStatus::AppliedReceived,
                        day(10),
                    );
                    // Two links sharing an id: the second insert fails after the
                    // application row is already written.
                    let link = link_for(app.id, email.id, "https://example.com/test");
                    let err = db
                        .commit_email_outcome(&EmailCommit {
                            email_id: email.id,
                            derived: derivation(&format!("fp-{i}")),
                            plan: OutcomePlan::Apply(ApplicationWrite::Create {
                                event: event_for(app.id, email.id, day(10)),
                                links: vec![link.clone(), link],
                                application: app,
                            }),
                            processed_at: Utc::now(),
                        })
                        .await
                        .unwrap_err();
                    assert!(matches!(err, DatabaseError::Conflict { .. }));
                }
            })
        };

        let reader = {
            let db = Arc::clone(&db);
            tokio::spawn(async move {
                let mut seen = 0;
                for _ in 0..200 {
                    seen += db.list_applications("u1").await.unwrap().len();
                    seen += db.processing_stats("u1").await.unwrap().processed_emails as usize;
                    tokio::task::yield_now().await;
                }
                seen
            })
        };

        writer.await.unwrap();
        assert_eq!(reader.await.unwrap(), 0);
        assert!(db.list_applications("u1").await.unwrap().is_empty());
    }

    // ── Commit tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn create_commit_persists_everything() {
        let db = test_db().await;
        let app = create_app(&db, "u1", "m-1", "Acme").await;

        let stored = db.get_application(app.id).await.unwrap().unwrap();
        assert_eq!(stored.company_name, "Acme");
        assert_eq!(stored.current_status, ApplicationStatus::AppliedReceived);
        assert_eq!(stored.event_count, 1);
        assert_eq!(db.list_events(app.id).await.unwrap().len(), 1);

        let email = db.get_raw_email_by_transport_id("u1", "m-1").await.unwrap().unwrap();
        assert!(email.processed);
        assert_eq!(email.outcome, Some(EmailOutcome::Created));
        assert_eq!(email.application_id, Some(app.id));
        assert_eq!(email.email_type, Some(EmailType::ApplicationConfirmation));
        assert_eq!(email.extracted.unwrap()["company_name"], "Acme");
        assert!(email.processing_error.is_none());

        let by_identity = db
            .find_application_by_identity("u1", "  ACME ", "engineer")
            .await
            .unwrap();
        assert_eq!(by_identity.unwrap().id, app.id);
    }

    #[tokio::test]
    async fn update_merges_status_counters_and_actions() {
        let db = test_db().await;
        let app = create_app(&db, "u1", "m-1", "Acme").await;

        let email = make_email("u1", "m-2");
        db.insert_raw_email(&email).await.unwrap();
        let commit = EmailCommit {
            email_id: email.id,
            derived: derivation("fp-2"),
            plan: OutcomePlan::Apply(ApplicationWrite::Update {
                update: ApplicationUpdate {
                    application_id: app.id,
                    status: ApplicationStatus::NextStepAssessment,
                    email_date: day(12),
                    action: Some(ActionUpdate {
                        action_type: Some(ActionType::CompleteAssessment),
                        deadline: Some(day(19)),
                        description: Some("Complete technical assessment".into()),
                    }),
                },
                event: event_for(app.id, email.id, day(12)),
                links: vec![
                    link_for(app.id, email.id, "https://hackerrank.com/a"),
                    link_for(app.id, email.id, "https://hackerrank.com/b"),
                ],
            }),
            processed_at: Utc::now(),
        };
        db.commit_email_outcome(&commit).await.unwrap();

        let stored = db.get_application(app.id).await.unwrap().unwrap();
        assert_eq!(stored.current_status, ApplicationStatus::NextStepAssessment);
        assert_eq!(stored.status_updated_at, day(12));
        assert_eq!(stored.latest_email_date, day(12));
        assert_eq!(stored.event_count, 2);
        assert_eq!(stored.link_count, 2);
        assert!(stored.action_required);
        assert_eq!(stored.action_type, Some(ActionType::CompleteAssessment));
        assert_eq!(stored.action_deadline, Some(day(19)));
        assert_eq!(db.list_links(app.id).await.unwrap().len(), 2);

        // An older email with the same status moves neither the status timestamp
        // nor the latest activity, and leaves the action alone.
        let older = make_email("u1", "m-3");
        db.insert_raw_email(&older).await.unwrap();
        db.commit_email_outcome(&EmailCommit {
            email_id: older.id,
            derived: derivation("fp-3"),
            plan: OutcomePlan::Apply(ApplicationWrite::Update {
                update: ApplicationUpdate {
                    application_id: app.id,
                    status: ApplicationStatus::NextStepAssessment,
                    email_date: day(11),
                    action: None,
                },
                event: event_for(app.id, older.id, day(11)),
                links: vec![],
            }),
            processed_at: Utc::now(),
        })
        .await
        .unwrap();

        let stored = db.get_application(app.id).await.unwrap().unwrap();
        assert_eq!(stored.status_updated_at, day(12));
        assert_eq!(stored.latest_email_date, day(12));
        assert_eq!(stored.event_count, 3);
        assert_eq!(stored.action_deadline, Some(day(19)));
    }

    #[tokio::test]
    async fn identity_collision_rolls_back_whole_commit() {
        let db = test_db().await;
        let original = create_app(&db, "u1", "m-1", "Acme").await;

        let email = make_email("u1", "m-2");
        db.insert_raw_email(&email).await.unwrap();
        let dup = Application::new("u1", "ACME", "engineer", ApplicationStatus::Rejected, day(11));
        let err = db
            .commit_email_outcome(&EmailCommit {
                email_id: email.id,
                derived: derivation("fp-2"),
                plan: OutcomePlan::Apply(ApplicationWrite::Create {
                    event: event_for(dup.id, email.id, day(11)),
                    links: vec![],
                    application: dup,
                }),
                processed_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict { .. }));

        let apps = db.list_applications("u1").await.unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].id, original.id);
        let email = db.get_raw_email(email.id).await.unwrap().unwrap();
        assert!(!email.processed);
        assert!(email.fingerprint.is_none());
    }

    #[tokio::test]
    async fn update_of_missing_application_persists_nothing() {
        let db = test_db().await;
        let email = make_email("u1", "m-1");
        db.insert_raw_email(&email).await.unwrap();
        let missing = Uuid::new_v4();

        let err = db
            .commit_email_outcome(&EmailCommit {
                email_id: email.id,
                derived: derivation("fp-1"),
                plan: OutcomePlan::Apply(ApplicationWrite::Update {
                    update: ApplicationUpdate {
                        application_id: missing,
                        status: ApplicationStatus::Rejected,
                        email_date: day(11),
                        action: None,
                    },
                    event: event_for(missing, email.id, day(11)),
                    links: vec![],
                }),
                processed_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
        assert!(db.list_events(missing).await.unwrap().is_empty());
        assert!(!db.get_raw_email(email.id).await.unwrap().unwrap().processed);
    }

    // ── Review tests ────────────────────────────────────────────────

    fn review_for(user: &str, email_id: Uuid) -> ReviewItem {
        ReviewItem {
            id: Uuid::new_v4(),
            user_id: user.to_string(),
            raw_email_id: email_id,
            application_id: None,
            reason: "Low extraction confidence".into(),
            match_type: "no_match_low_confidence".into(),
            suggested_company: Some("Acme".into()),
            suggested_title: None,
            suggested_status: Some(ApplicationStatus::OtherUpdate),
            confidence: 0.4,
            resolved: false,
            resolution: None,
            resolved_at: None,
            resolved_application_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn review_is_resolved_once() {
        let db = test_db().await;
        let email = make_email("u1", "m-1");
        db.insert_raw_email(&email).await.unwrap();
        let item = review_for("u1", email.id);
        db.commit_email_outcome(&EmailCommit {
            email_id: email.id,
            derived: derivation("fp-1"),
            plan: OutcomePlan::Review(item.clone()),
            processed_at: Utc::now(),
        })
        .await
        .unwrap();

        let open = db.list_open_reviews("u1").await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].suggested_status, Some(ApplicationStatus::OtherUpdate));
        let stored = db.get_raw_email(email.id).await.unwrap().unwrap();
        assert_eq!(stored.outcome, Some(EmailOutcome::Reviewed));

        let closure = ReviewClosure {
            review_id: item.id,
            action: ReviewAction::Ignored,
            resolved_at: Utc::now(),
            write: None,
        };
        db.resolve_review(&closure).await.unwrap();
        let err = db.resolve_review(&closure).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict { .. }));

        let resolved = db.get_review_item(item.id).await.unwrap().unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.resolution, Some(ReviewAction::Ignored));
        assert!(db.list_open_reviews("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn review_resolution_creates_application() {
        let db = test_db().await;
        let email = make_email("u1", "m-1");
        db.insert_raw_email(&email).await.unwrap();
        let item = review_for("u1", email.id);
        db.commit_email_outcome(&EmailCommit {
            email_id: email.id,
            derived: derivation("fp-1"),
            plan: OutcomePlan::Review(item.clone()),
            processed_at: Utc::now(),
        })
        .await
        .unwrap();

        let mut app = Application::new("u1", "Acme", "Engineer", ApplicationStatus::AppliedReceived, day(10));
        app.event_count = 1;
        db.resolve_review(&ReviewClosure {
            review_id: item.id,
            action: ReviewAction::CreatedNew,
            resolved_at: Utc::now(),
            write: Some(ApplicationWrite::Create {
                event: event_for(app.id, email.id, day(10)),
                links: vec![],
                application: app.clone(),
            }),
        })
        .await
        .unwrap();

        let resolved = db.get_review_item(item.id).await.unwrap().unwrap();
        assert_eq!(resolved.resolved_application_id, Some(app.id));
        let email = db.get_raw_email(email.id).await.unwrap().unwrap();
        assert_eq!(email.application_id, Some(app.id));
        assert_eq!(db.list_events(app.id).await.unwrap().len(), 1);
    }

    // ── Stats and persistence ───────────────────────────────────────

    #[tokio::test]
    async fn processing_stats_counts_per_user() {
        let db = test_db().await;
        create_app(&db, "u1", "m-1", "Acme").await;
        create_app(&db, "u1", "m-2", "Globex").await;
        db.insert_raw_email(&make_email("u1", "m-3")).await.unwrap();
        create_app(&db, "u2", "m-1", "Initech").await;

        let stats = db.processing_stats("u1").await.unwrap();
        assert_eq!(stats.total_emails, 3);
        assert_eq!(stats.processed_emails, 2);
        assert_eq!(stats.pending_emails, 1);
        assert_eq!(stats.total_applications, 2);
        assert_eq!(stats.pending_review, 0);
        assert!((stats.average_confidence - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn applications_listed_by_latest_activity() {
        let db = test_db().await;
        let acme = create_app(&db, "u1", "m-1", "Acme").await;
        let globex = create_app(&db, "u1", "m-2", "Globex").await;

        let email = make_email("u1", "m-3");
        db.insert_raw_email(&email).await.unwrap();
        db.commit_email_outcome(&EmailCommit {
            email_id: email.id,
            derived: derivation("fp-3"),
            plan: OutcomePlan::Apply(ApplicationWrite::Update {
                update: ApplicationUpdate {
                    application_id: acme.id,
                    status: ApplicationStatus::AppliedReceived,
                    email_date: day(10) + Duration::days(3),
                    action: None,
                },
                event: event_for(acme.id, email.id, day(13)),
                links: vec![],
            }),
            processed_at: Utc::now(),
        })
        .await
        .unwrap();

        let apps = db.list_applications("u1").await.unwrap();
        assert_eq!(apps[0].id, acme.id);
        assert_eq!(apps[1].id, globex.id);
    }

    #[tokio::test]
    async fn local_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tracker.db");

        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            create_app(&db, "u1", "m-1", "Acme").await;
        }

        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert_eq!(db.list_applications("u1").await.unwrap().len(), 1);
    }
}
