use serde::{Deserialize, Serialize};

use super::de;

/// "Device `device_id` exposes register `register_id`."
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize, Deserialize)]
pub struct DeviceRegister {
    #[serde(deserialize_with = "de::i64_lenient")]
    pub device_register_id: i64,
    #[serde(deserialize_with = "de::i64_lenient")]
    pub device_id: i64,
    #[serde(deserialize_with = "de::i64_lenient")]
    pub register_id: i64,
}
