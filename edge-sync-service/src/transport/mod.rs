//! Upstream transports for readings and configuration.

pub mod central;
pub mod http;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use meter_client::domain::{NewReading, PendingReading};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::store::StoreError;

pub use central::CentralStoreTransport;
pub use http::{HttpConfigSource, HttpUploadTransport};

/// All fields read from one meter element at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterRecord {
    pub meter_id: i64,
    pub meter_element_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(flatten)]
    pub fields: BTreeMap<String, f64>,
}

impl MeterRecord {
    pub fn to_readings(&self) -> impl Iterator<Item = NewReading> + '_ {
        self.fields.iter().map(move |(field, value)| NewReading {
            meter_id: self.meter_id,
            meter_element_id: self.meter_element_id,
            field_name: field.clone(),
            value: *value,
            created_at: self.timestamp,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadBatch {
    /// Stable across retries of the same rows.
    pub batch_id: String,
    pub records: Vec<MeterRecord>,
    #[serde(skip)]
    pub reading_count: usize,
}

impl UploadBatch {
    /// Group queue rows into per-meter records, one per meter element and timestamp.
    ///
    /// A field seen twice for the same key starts a new record so no value is lost.
    pub fn from_readings(rows: &[PendingReading]) -> Self {
        let mut records: Vec<MeterRecord> = Vec::new();
        let mut open: HashMap<(i64, i64, OffsetDateTime), usize> = HashMap::new();

        for row in rows {
            let key = (row.meter_id, row.meter_element_id, row.created_at);
            let slot = open
                .get(&key)
                .copied()
                .filter(|idx| !records[*idx].fields.contains_key(&row.field_name));
            let idx = match slot {
                Some(idx) => idx,
                None => {
                    records.push(MeterRecord {
                        meter_id: row.meter_id,
                        meter_element_id: row.meter_element_id,
                        timestamp: row.created_at,
                        fields: BTreeMap::new(),
                    });
                    open.insert(key, records.len() - 1);
                    records.len() - 1
                }
            };
            records[idx].fields.insert(row.field_name.clone(), row.value);
        }

        let mut hasher = blake3::Hasher::new();
        for row in rows {
            hasher.update(row.event_id.as_bytes());
        }

        Self {
            batch_id: hasher.finalize().to_hex()[..32].to_string(),
            records,
            reading_count: rows.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadAck {
    pub processed: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("upstream rejected batch: {0}")]
    Rejected(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn submit(&self, batch: &UploadBatch, api_key: &str) -> Result<UploadAck, TransportError>;
}
