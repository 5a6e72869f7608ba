use serde::{Deserialize, Serialize};

use super::de;

fn default_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct Register {
    #[serde(deserialize_with = "de::i64_lenient")]
    pub register_id: i64,
    pub name: String,
    /// Protocol address (Modbus holding register offset or BACnet object instance).
    #[serde(deserialize_with = "de::i32_lenient")]
    pub register: i32,
    pub unit: Option<String>,
    pub field_name: String,
    /// Multiplier applied to the raw value before it is stored.
    #[serde(default = "default_scale")]
    pub scale: f64,
}
