pub mod batcher;
pub mod cache;
pub mod collector;
pub mod config;
pub mod error;
pub mod governor;
pub mod metrics_server;
pub mod observability;
pub mod pool;
pub mod protocol;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod sync;
pub mod transport;

#[cfg(test)]
mod scenario_tests;
#[cfg(test)]
mod test_support;

pub use collector::{CollectionManager, CycleResult};
pub use sync::{ConfigSyncManager, UploadSyncManager};
