//! One CLI invocation's view of the local store and sync driver.
//!
//! The driver keeps its queue in memory, so unsent changes and the conflicts
//! seen during a run are written back to the store before the process exits.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tandem_core::client::{
    ClientConfig, FileStore, HttpTransport, KeyValueStore, SyncDriver, SyncEvent, SyncTransport,
};
use tandem_core::models::{ConflictRecord, PendingChange};
use uuid::Uuid;

use crate::error::CliError;

pub const DEVICE_ID_KEY: &str = "cli_device_id";
pub const OUTBOX_KEY: &str = "cli_outbox";
pub const CONFLICTS_KEY: &str = "cli_conflicts";

pub fn resolve_store_path(explicit: Option<PathBuf>) -> Result<PathBuf, CliError> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    dirs::data_dir()
        .map(|dir| dir.join("tandem").join("store.json"))
        .ok_or(CliError::NoDataDir)
}

/// Device id stored alongside the cache, created on first use
pub fn ensure_device_id(store: &FileStore) -> Result<String, CliError> {
    if let Some(device_id) = store.get_as::<String>(DEVICE_ID_KEY)? {
        return Ok(device_id);
    }
    let device_id = format!("cli-{}", Uuid::now_v7());
    store.set_as(DEVICE_ID_KEY, &device_id)?;
    tracing::info!(%device_id, "Registered new device id");
    Ok(device_id)
}

pub struct Session<T> {
    driver: SyncDriver<T, FileStore>,
    detected: Arc<Mutex<Vec<ConflictRecord>>>,
}

impl Session<HttpTransport> {
    pub fn open(store_path: &Path) -> Result<Self, CliError> {
        let store = FileStore::open(store_path)?;
        let device_id = ensure_device_id(&store)?;
        let config = ClientConfig::from_env(Some(device_id))?;
        let transport = HttpTransport::new(&config)?;
        Self::start(config, transport, store)
    }
}

impl<T: SyncTransport> Session<T> {
    pub fn start(config: ClientConfig, transport: T, store: FileStore) -> Result<Self, CliError> {
        let outbox: Vec<PendingChange> = store.get_as(OUTBOX_KEY)?.unwrap_or_default();
        let driver = SyncDriver::new(config, transport, store);
        if !outbox.is_empty() {
            tracing::debug!(changes = outbox.len(), "Restored unsent changes");
            driver.requeue(outbox);
        }

        let detected: Arc<Mutex<Vec<ConflictRecord>>> = Arc::default();
        let sink = Arc::clone(&detected);
        driver.add_listener(move |event| {
            if let SyncEvent::ConflictDetected(conflict) = event {
                lock(&sink).push(conflict.clone());
            }
        });

        Ok(Self { driver, detected })
    }

    pub const fn driver(&self) -> &SyncDriver<T, FileStore> {
        &self.driver
    }

    /// Write unsent changes and newly seen conflicts back to the store
    pub fn save(&self) -> Result<(), CliError> {
        let store = self.driver.store();
        let outbox = self.driver.unsent_changes();
        if outbox.is_empty() {
            store.remove(OUTBOX_KEY)?;
        } else {
            store.set_as(OUTBOX_KEY, &outbox)?;
        }

        let detected = std::mem::take(&mut *lock(&self.detected));
        if !detected.is_empty() {
            let mut known = self.conflicts()?;
            for conflict in detected {
                known.retain(|existing| existing.id != conflict.id);
                known.push(conflict);
            }
            store.set_as(CONFLICTS_KEY, &known)?;
        }
        Ok(())
    }

    /// Conflicts seen by this device and not yet resolved here, oldest first
    pub fn conflicts(&self) -> Result<Vec<ConflictRecord>, CliError> {
        let mut conflicts: Vec<ConflictRecord> = self
            .driver
            .store()
            .get_as(CONFLICTS_KEY)?
            .unwrap_or_default();
        conflicts.sort_by_key(|conflict| conflict.created_at);
        Ok(conflicts)
    }

    pub fn forget_conflict(&self, conflict_id: &str) -> Result<bool, CliError> {
        let mut conflicts = self.conflicts()?;
        let before = conflicts.len();
        conflicts.retain(|conflict| conflict.id != conflict_id);
        if conflicts.len() == before {
            return Ok(false);
        }
        self.driver.store().set_as(CONFLICTS_KEY, &conflicts)?;
        Ok(true)
    }

    /// Clear everything except the device id
    pub fn reset(&self) -> Result<(), CliError> {
        self.driver.clear_local_data()?;
        lock(&self.detected).clear();
        let store = self.driver.store();
        store.remove(OUTBOX_KEY)?;
        store.remove(CONFLICTS_KEY)?;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
