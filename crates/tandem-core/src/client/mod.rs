//! Client side of the sync engine: local cache, change queue and sync driver

mod config;
mod driver;
mod events;
mod queue;
mod scheduler;
mod store;
#[cfg(test)]
mod testing;
mod transport;

pub use config::{ClientConfig, ClientConfigError};
pub use driver::{SyncDriver, SyncError, SyncStatus};
pub use events::{Listener, ListenerId, SyncEvent, SyncReport};
pub use queue::{ChangeQueue, QueuedChange};
pub use scheduler::SchedulerHandle;
pub use store::{FileStore, KeyValueStore, LocalEntry, MemoryStore, WATERMARK_KEY};
pub use transport::{HttpTransport, SyncTransport, TransportError, TransportResult};
