//! Edge to central synchronization in both directions.

pub mod diff;
pub mod download;
pub mod upload;

pub use diff::{diff_by_key, Diff};
pub use download::{
    ConfigSyncManager, DownloadError, DownloadReport, DownloadSettings, EntityReport,
};
pub use upload::{
    RetentionPolicy, SyncOutcome, UploadError, UploadSettings, UploadStatistics, UploadSyncManager,
};
