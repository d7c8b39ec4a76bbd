//! Record store for Tandem

mod connection;
mod migrations;
mod record_repository;

pub use connection::{Database, DatabaseTarget};
pub use record_repository::{LibSqlRecordRepository, RecordRepository};
