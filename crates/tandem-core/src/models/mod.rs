//! Data models for Tandem

mod change;
mod conflict;
mod device;
mod payload;
mod record;

pub use change::{ChangeOperation, PendingChange};
pub use conflict::{
    ConflictRecord, ConflictStatus, ConflictVersion, ResolutionKind, ResolutionStrategy, Severity,
};
pub use device::{DeviceSyncStatus, SyncMetric};
pub use payload::Payload;
pub use record::{Platform, RecordKey, SyncRecord, RESOLUTION_DEVICE_ID};
