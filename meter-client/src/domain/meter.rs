use std::fmt;

use serde::{Deserialize, Serialize};

use super::de;

/// Composite identity of a meter element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeterKey {
    pub meter_id: i64,
    pub meter_element_id: i64,
}

impl MeterKey {
    pub fn new(meter_id: i64, meter_element_id: i64) -> Self {
        Self {
            meter_id,
            meter_element_id,
        }
    }
}

impl fmt::Display for MeterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.meter_id, self.meter_element_id)
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct Meter {
    #[serde(deserialize_with = "de::i64_lenient")]
    pub meter_id: i64,
    #[serde(deserialize_with = "de::i64_lenient")]
    pub meter_element_id: i64,
    #[serde(deserialize_with = "de::i64_lenient")]
    pub device_id: i64,
    pub name: String,
    pub active: bool,
    pub ip: Option<String>,
    #[serde(default, deserialize_with = "de::opt_i32_lenient")]
    pub port: Option<i32>,
    pub element: Option<String>,
}

impl Meter {
    pub fn key(&self) -> MeterKey {
        MeterKey::new(self.meter_id, self.meter_element_id)
    }

    /// Returns `(ip, port)` when the meter carries a usable network address.
    pub fn endpoint(&self) -> Option<(&str, u16)> {
        let ip = self.ip.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let port = self.port.and_then(|p| u16::try_from(p).ok()).filter(|p| *p > 0)?;
        Some((ip, port))
    }
}
