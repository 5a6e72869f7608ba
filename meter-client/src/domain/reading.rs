use serde::Serialize;
use time::OffsetDateTime;

fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    let len = s.len() as u32;
    hasher.update(&len.to_le_bytes());
    hasher.update(s.as_bytes());
}

/// A validated measurement ready to be inserted into a store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewReading {
    pub meter_id: i64,
    pub meter_element_id: i64,
    pub field_name: String,
    pub value: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl NewReading {
    /// Deterministic identity of the measurement.
    ///
    /// Two inserts of the same measurement yield the same id, which lets the
    /// central store drop replays of a batch whose acknowledgement was lost.
    pub fn event_id(&self) -> String {
        event_id(
            self.meter_id,
            self.meter_element_id,
            &self.field_name,
            self.value,
            self.created_at,
        )
    }
}

pub fn event_id(
    meter_id: i64,
    meter_element_id: i64,
    field_name: &str,
    value: f64,
    created_at: OffsetDateTime,
) -> String {
    let mut h = blake3::Hasher::new();
    h.update(&meter_id.to_le_bytes());
    h.update(&meter_element_id.to_le_bytes());
    hash_str(&mut h, field_name);
    h.update(&value.to_bits().to_le_bytes());
    h.update(&created_at.unix_timestamp_nanos().to_le_bytes());
    h.finalize().to_hex().to_string()
}

/// A reading row in the edge store queue.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize)]
pub struct PendingReading {
    pub id: i64,
    pub event_id: String,
    pub meter_id: i64,
    pub meter_element_id: i64,
    pub field_name: String,
    pub value: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub is_synchronized: bool,
    pub retry_count: i32,
}

impl PendingReading {
    pub fn to_new_reading(&self) -> NewReading {
        NewReading {
            meter_id: self.meter_id,
            meter_element_id: self.meter_element_id,
            field_name: self.field_name.clone(),
            value: self.value,
            created_at: self.created_at,
        }
    }
}
