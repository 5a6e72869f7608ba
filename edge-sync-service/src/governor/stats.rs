use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::ErrorCategory;

pub const RECENT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct RecordedError {
    pub device_id: i64,
    pub category: ErrorCategory,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

#[derive(Debug, Default)]
pub struct ErrorStats {
    total: u64,
    by_category: BTreeMap<ErrorCategory, u64>,
    by_device: BTreeMap<i64, u64>,
    recent: VecDeque<RecordedError>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorStatsSnapshot {
    pub total: u64,
    pub by_category: BTreeMap<ErrorCategory, u64>,
    pub by_device: BTreeMap<i64, u64>,
    pub recent: Vec<RecordedError>,
}

impl ErrorStats {
    pub fn record(&mut self, device_id: i64, category: ErrorCategory, message: String) {
        self.total += 1;
        *self.by_category.entry(category).or_default() += 1;
        *self.by_device.entry(device_id).or_default() += 1;

        if self.recent.len() == RECENT_CAPACITY {
            self.recent.pop_front();
        }
        self.recent.push_back(RecordedError {
            device_id,
            category,
            message,
            at: OffsetDateTime::now_utc(),
        });
    }

    pub fn snapshot(&self) -> ErrorStatsSnapshot {
        ErrorStatsSnapshot {
            total: self.total,
            by_category: self.by_category.clone(),
            by_device: self.by_device.clone(),
            recent: self.recent.iter().cloned().collect(),
        }
    }
}
