mod de;
pub mod device_register;
pub mod meter;
pub mod reading;
pub mod register;
pub mod sync_log;
pub mod tenant;

pub use device_register::DeviceRegister;
pub use meter::{Meter, MeterKey};
pub use reading::{NewReading, PendingReading};
pub use register::Register;
pub use sync_log::{NewSyncLog, SyncLog, SyncLogSummary};
pub use tenant::Tenant;
