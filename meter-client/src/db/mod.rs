pub mod config_queries;
pub mod reading_queries;
pub mod sync_log_queries;
