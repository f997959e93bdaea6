//! Database schema definitions using SurrealQL.

use crate::{Database, DbError};

/// Initialize the database schema.
///
/// This creates the job body table and the four index tables.
pub async fn init_schema(db: &Database) -> Result<(), DbError> {
    tracing::info!("Initializing database schema...");

    db.query(JOB_SCHEMA).await?.check()?;
    db.query(INDEX_SCHEMA).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Job body table schema.
const JOB_SCHEMA: &str = r#"
-- Job bodies keyed by job id
DEFINE TABLE IF NOT EXISTS job SCHEMALESS;

DEFINE INDEX IF NOT EXISTS job_state ON job FIELDS state;
DEFINE INDEX IF NOT EXISTS job_type ON job FIELDS job_type;
DEFINE INDEX IF NOT EXISTS job_created ON job FIELDS created_at_ms;
"#;

/// Ordered collections. Every row is `{ job_id, score }` keyed by job id.
///
/// - waiting: score is an arrival sequence number, strictly increasing per
///   store handle and seeded from the clock in epoch microseconds
/// - scheduled: score is `not_before` in epoch milliseconds
/// - inflight: score is `lease_expires_at` in epoch milliseconds
/// - dead_letter: score is an arrival sequence number, as for waiting
const INDEX_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS waiting SCHEMALESS;
DEFINE INDEX IF NOT EXISTS waiting_score ON waiting FIELDS score;

DEFINE TABLE IF NOT EXISTS scheduled SCHEMALESS;
DEFINE INDEX IF NOT EXISTS scheduled_score ON scheduled FIELDS score;

DEFINE TABLE IF NOT EXISTS inflight SCHEMALESS;
DEFINE INDEX IF NOT EXISTS inflight_score ON inflight FIELDS score;

DEFINE TABLE IF NOT EXISTS dead_letter SCHEMALESS;
DEFINE INDEX IF NOT EXISTS dead_letter_score ON dead_letter FIELDS score;
"#;
