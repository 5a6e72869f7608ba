use anyhow::Result;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::domain::{NewSyncLog, SyncLog, SyncLogSummary};

pub async fn insert_sync_log(pool: &PgPool, entry: &NewSyncLog) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_logs (batch_size, success, error_message, synced_at)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(entry.batch_size)
    .bind(entry.success)
    .bind(&entry.error_message)
    .bind(entry.synced_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn recent_sync_logs(pool: &PgPool, since: OffsetDateTime) -> Result<Vec<SyncLog>> {
    let rows = sqlx::query_as::<_, SyncLog>(
        r#"
        SELECT id, batch_size, success, error_message, synced_at
        FROM sync_logs
        WHERE synced_at >= $1
        ORDER BY synced_at DESC, id DESC
        "#,
    )
    .bind(since)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Attempt/success/failure counts over the sync log since `since`.
pub async fn summarize_since(pool: &PgPool, since: OffsetDateTime) -> Result<SyncLogSummary> {
    let row = sqlx::query_as::<_, SyncLogSummary>(
        r#"
        SELECT
            COUNT(*)                                                        AS attempts,
            COUNT(*) FILTER (WHERE success)                                 AS successes,
            COUNT(*) FILTER (WHERE NOT success)                             AS failures,
            COALESCE(SUM(batch_size) FILTER (WHERE success), 0)::BIGINT     AS rows_synced,
            MAX(synced_at) FILTER (WHERE success)                           AS last_success_at
        FROM sync_logs
        WHERE synced_at >= $1
        "#,
    )
    .bind(since)
    .fetch_one(pool)
    .await?;

    Ok(row)
}
