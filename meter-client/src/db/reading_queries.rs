use anyhow::Result;
use sqlx::{PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;

use crate::domain::{NewReading, PendingReading};

/// Insert a batch of readings in one statement.
///
/// Rows whose `event_id` already exists are ignored, so replaying a batch is
/// harmless. Returns the number of rows actually inserted.
pub async fn insert_readings(pool: &PgPool, batch: &[NewReading]) -> Result<u64> {
    if batch.is_empty() {
        return Ok(0);
    }

    let mut builder = QueryBuilder::<Postgres>::new(
        "INSERT INTO pending_readings (event_id, meter_id, meter_element_id, field_name, value, created_at, is_synchronized, retry_count) ",
    );

    builder.push_values(batch, |mut b, r| {
        b.push_bind(r.event_id())
            .push_bind(r.meter_id)
            .push_bind(r.meter_element_id)
            .push_bind(&r.field_name)
            .push_bind(r.value)
            .push_bind(r.created_at)
            .push_bind(false)
            .push_bind(0_i32);
    });
    builder.push(" ON CONFLICT (event_id) DO NOTHING");

    let res = builder.build().execute(pool).await?;
    Ok(res.rows_affected())
}

/// Oldest unsynchronized rows still under the retry ceiling.
pub async fn select_unsynchronized(
    pool: &PgPool,
    limit: i64,
    max_retry_count: i32,
) -> Result<Vec<PendingReading>> {
    let rows = sqlx::query_as::<_, PendingReading>(
        r#"
        SELECT id, event_id, meter_id, meter_element_id, field_name, value, created_at,
               is_synchronized, retry_count
        FROM pending_readings
        WHERE is_synchronized = FALSE
          AND retry_count < $2
        ORDER BY created_at, id
        LIMIT $1
        "#,
    )
    .bind(limit)
    .bind(max_retry_count)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn mark_synchronized(pool: &PgPool, ids: &[i64]) -> Result<u64> {
    let res = sqlx::query("UPDATE pending_readings SET is_synchronized = TRUE WHERE id = ANY($1)")
        .bind(ids)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

pub async fn delete_readings(pool: &PgPool, ids: &[i64]) -> Result<u64> {
    let res = sqlx::query("DELETE FROM pending_readings WHERE id = ANY($1)")
        .bind(ids)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

pub async fn increment_retry_count(pool: &PgPool, ids: &[i64]) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE pending_readings SET retry_count = retry_count + 1 WHERE id = ANY($1)",
    )
    .bind(ids)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Remove synchronized rows created before `cutoff`.
pub async fn delete_synchronized_before(pool: &PgPool, cutoff: OffsetDateTime) -> Result<u64> {
    let res = sqlx::query(
        "DELETE FROM pending_readings WHERE is_synchronized = TRUE AND created_at < $1",
    )
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

pub async fn count_unsynchronized(pool: &PgPool) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pending_readings WHERE is_synchronized = FALSE")
            .fetch_one(pool)
            .await?;
    Ok(count)
}

/// Rows that exhausted their retries and wait for an operator.
pub async fn count_stuck(pool: &PgPool, max_retry_count: i32) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pending_readings WHERE is_synchronized = FALSE AND retry_count >= $1",
    )
    .bind(max_retry_count)
    .fetch_one(pool)
    .await?;
    Ok(count)
}
