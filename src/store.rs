// Shared pieces of the store contracts used by both workers.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Result of a terminal write.
///
/// `AlreadyFinal` means the order had already reached a terminal state, so
/// nothing was written. Workers treat it as success: a duplicate attempt must
/// never produce a second result or a second ledger credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied,
    AlreadyFinal,
}

impl CommitOutcome {
    pub fn from_rows_affected(rows: u64) -> Self {
        if rows == 0 {
            CommitOutcome::AlreadyFinal
        } else {
            CommitOutcome::Applied
        }
    }
}

/// Deadline after which a claimed order may be claimed again.
pub fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(60));
    now + lease
}

/// Pool for tests that need real Postgres. `None` when DATABASE_URL is unset,
/// so those tests pass trivially on machines without a database.
#[cfg(test)]
pub async fn test_pool() -> Option<sqlx::PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("DATABASE_URL is set but unreachable");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");
    Some(pool)
}
