use std::{fmt, sync::Arc};

use meter_client::domain::NewReading;
use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    governor::{retry_async, RetryPolicy},
    store::Store,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRule {
    MeterIdPositive,
    TimestampNotInFuture,
    ValueFinite,
    FieldNameNonEmpty,
}

impl ValidationRule {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MeterIdPositive => "meter_id_positive",
            Self::TimestampNotInFuture => "timestamp_not_in_future",
            Self::ValueFinite => "value_finite",
            Self::FieldNameNonEmpty => "field_name_non_empty",
        }
    }
}

impl fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pure validation of a reading.
///
/// Rules:
/// - meter_id must be positive.
/// - created_at must not be after `now`.
/// - value must be finite.
/// - field_name must be non-empty after trimming.
pub fn validate_reading(reading: &NewReading, now: OffsetDateTime) -> Result<(), ValidationRule> {
    if reading.meter_id <= 0 {
        return Err(ValidationRule::MeterIdPositive);
    }
    if reading.created_at > now {
        return Err(ValidationRule::TimestampNotInFuture);
    }
    if !reading.value.is_finite() {
        return Err(ValidationRule::ValueFinite);
    }
    if reading.field_name.trim().is_empty() {
        return Err(ValidationRule::FieldNameNonEmpty);
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub index: usize,
    pub size: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub accepted: usize,
    pub rejected: usize,
    pub persisted: u64,
    pub batches: usize,
    pub failed_batches: Vec<BatchFailure>,
}

/// Validates readings and writes them to the edge store in bounded batches.
pub struct ReadingBatcher {
    store: Arc<dyn Store>,
    max_batch_size: usize,
    retry: RetryPolicy,
}

impl ReadingBatcher {
    pub fn new(store: Arc<dyn Store>, max_batch_size: usize, retry: RetryPolicy) -> Self {
        Self {
            store,
            max_batch_size: max_batch_size.max(1),
            retry,
        }
    }

    /// Split readings into valid and rejected. Rejections are logged one by one.
    pub fn partition(
        &self,
        readings: Vec<NewReading>,
        now: OffsetDateTime,
    ) -> (Vec<NewReading>, usize) {
        let mut valid = Vec::with_capacity(readings.len());
        let mut rejected = 0;
        for reading in readings {
            match validate_reading(&reading, now) {
                Ok(()) => valid.push(reading),
                Err(rule) => {
                    rejected += 1;
                    metrics::counter!("readings_rejected_total", "rule" => rule.as_str()).increment(1);
                    tracing::warn!(
                        rule = %rule,
                        meter_id = reading.meter_id,
                        meter_element_id = reading.meter_element_id,
                        field = %reading.field_name,
                        value = reading.value,
                        created_at = %reading.created_at,
                        "reading rejected"
                    );
                }
            }
        }
        (valid, rejected)
    }

    /// Validate and persist. A failed batch is reported and the remaining batches still run.
    pub async fn persist(&self, readings: Vec<NewReading>) -> BatchReport {
        let (valid, rejected) = self.partition(readings, OffsetDateTime::now_utc());
        let mut report = BatchReport {
            accepted: valid.len(),
            rejected,
            ..BatchReport::default()
        };

        for (index, chunk) in valid.chunks(self.max_batch_size).enumerate() {
            report.batches += 1;
            let result = retry_async(&self.retry, "insert_readings", || {
                self.store.insert_readings(chunk)
            })
            .await;
            match result {
                Ok(inserted) => {
                    report.persisted += inserted;
                    metrics::counter!("readings_persisted_total").increment(inserted);
                }
                Err(e) => {
                    tracing::error!(
                        batch = index,
                        size = chunk.len(),
                        error = %e,
                        "reading batch insert failed"
                    );
                    metrics::counter!("reading_batches_failed_total").increment(1);
                    report.failed_batches.push(BatchFailure {
                        index,
                        size: chunk.len(),
                        error: e.to_string(),
                    });
                }
            }
        }

        report
    }
}
