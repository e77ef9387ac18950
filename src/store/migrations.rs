//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS raw_emails (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                transport_id TEXT NOT NULL,
                conversation_id TEXT,
                received_at TEXT NOT NULL,
                envelope_from TEXT NOT NULL,
                envelope_to TEXT NOT NULL,
                envelope_subject TEXT NOT NULL,
                body_text TEXT,
                body_html TEXT,
                raw_headers TEXT NOT NULL DEFAULT '{}',
                original_from TEXT,
                original_to TEXT,
                original_subject TEXT,
                original_date TEXT,
                clean_body_text TEXT,
                unwrap_confidence REAL,
                unwrap_method TEXT,
                email_type TEXT,
                extracted TEXT,
                fingerprint TEXT,
                overall_confidence REAL,
                parser_version TEXT,
                processed INTEGER NOT NULL DEFAULT 0,
                outcome TEXT,
                application_id TEXT,
                duplicate_of TEXT,
                processing_error TEXT,
                processed_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_raw_emails_transport
                ON raw_emails(user_id, transport_id);
            CREATE INDEX IF NOT EXISTS idx_raw_emails_fingerprint
                ON raw_emails(user_id, fingerprint);
            CREATE INDEX IF NOT EXISTS idx_raw_emails_processed
                ON raw_emails(processed);

            CREATE TABLE IF NOT EXISTS applications (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                company_name TEXT NOT NULL,
                job_title TEXT NOT NULL,
                company_key TEXT NOT NULL,
                title_key TEXT NOT NULL,
                location TEXT,
                first_seen_date TEXT NOT NULL,
                application_date TEXT,
                current_status TEXT NOT NULL,
                status_updated_at TEXT NOT NULL,
                action_required INTEGER NOT NULL DEFAULT 0,
                action_type TEXT,
                action_deadline TEXT,
                action_description TEXT,
                company_confidence REAL NOT NULL DEFAULT 0,
                job_title_confidence REAL NOT NULL DEFAULT 0,
                overall_confidence REAL NOT NULL DEFAULT 0,
                event_count INTEGER NOT NULL DEFAULT 0,
                link_count INTEGER NOT NULL DEFAULT 0,
                latest_email_date TEXT NOT NULL,
                notes TEXT,
                is_archived INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_applications_identity
                ON applications(user_id, company_key, title_key);
            CREATE INDEX IF NOT EXISTS idx_applications_user
                ON applications(user_id, latest_email_date);

            CREATE TABLE IF NOT EXISTS application_events (
                id TEXT PRIMARY KEY,
                application_id TEXT NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
                raw_email_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                status TEXT NOT NULL,
                event_date TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                confidence REAL NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_application
                ON application_events(application_id, event_date);

            CREATE TABLE IF NOT EXISTS application_links (
                id TEXT PRIMARY KEY,
                application_id TEXT NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
                raw_email_id TEXT NOT NULL,
                url TEXT NOT NULL,
                link_type TEXT NOT NULL,
                link_text TEXT,
                confidence REAL NOT NULL,
                expires_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_links_application
                ON application_links(application_id);
        "#,
    },
    Migration {
        version: 2,
        name: "review_queue",
        sql: r#"
            CREATE TABLE IF NOT EXISTS review_items (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                raw_email_id TEXT NOT NULL,
                application_id TEXT,
                reason TEXT NOT NULL,
                match_type TEXT NOT NULL,
                suggested_company TEXT,
                suggested_title TEXT,
                suggested_status TEXT,
                confidence REAL NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0,
                resolution TEXT,
                resolved_at TEXT,
                resolved_application_id TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_review_items_open
                ON review_items(user_id, resolved);
        "#,
    },
];

/// Apply all pending migrations.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    if tracing::enabled!(tracing::Level::DEBUG) {
        let version = get_current_version(conn).await?;
        tracing::debug!(version, "Database migrations complete");
    }
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
