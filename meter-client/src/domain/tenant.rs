use serde::{Deserialize, Serialize};

use super::de;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize, Deserialize)]
pub struct Tenant {
    #[serde(deserialize_with = "de::i64_lenient")]
    pub tenant_id: i64,
    pub api_key: String,
    #[serde(deserialize_with = "de::i32_lenient")]
    pub download_batch_size: i32,
    #[serde(deserialize_with = "de::i32_lenient")]
    pub upload_batch_size: i32,
}
