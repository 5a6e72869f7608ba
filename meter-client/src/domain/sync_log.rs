use serde::Serialize;
use time::OffsetDateTime;

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct SyncLog {
    pub id: i64,
    pub batch_size: i32,
    pub success: bool,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub synced_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewSyncLog {
    pub batch_size: i32,
    pub success: bool,
    pub error_message: Option<String>,
    pub synced_at: OffsetDateTime,
}

/// Aggregate over the sync log for a trailing window.
#[derive(Debug, Clone, Default, PartialEq, sqlx::FromRow, Serialize)]
pub struct SyncLogSummary {
    pub attempts: i64,
    pub successes: i64,
    pub failures: i64,
    pub rows_synced: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success_at: Option<OffsetDateTime>,
}
