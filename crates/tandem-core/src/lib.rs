//! tandem-core - Core library for Tandem
//!
//! This crate contains the shared sync models, the conflict detector, the wire
//! protocol, the libSQL record store and the client sync driver used by the
//! API server and the CLI.

pub mod client;
pub mod conflict;
pub mod db;
pub mod error;
pub mod models;
pub mod protocol;
pub mod state;
pub mod util;

pub use error::{Error, Result};
pub use models::{Payload, PendingChange, RecordKey, SyncRecord};
