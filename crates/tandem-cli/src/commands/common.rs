use chrono::{DateTime, SecondsFormat};
use tandem_core::client::{LocalEntry, SyncEvent, SyncReport, SyncStatus};
use tandem_core::models::ConflictRecord;
use tandem_core::Payload;

use crate::error::CliError;

pub fn parse_payload(json: &str) -> Result<Payload, CliError> {
    serde_json::from_str(json.trim())
        .map(Payload::new)
        .map_err(|error| CliError::InvalidJson(error.to_string()))
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    if timestamp_ms <= 0 {
        return "never".to_string();
    }
    DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |time| time.to_rfc3339_opts(SecondsFormat::Millis, true),
    )
}

pub fn format_report(report: &SyncReport) -> String {
    format!(
        "Pulled {}, pushed {}, failed {}, conflicts {}",
        report.pulled, report.pushed, report.failed, report.conflicts
    )
}

pub fn format_status_lines(status: &SyncStatus) -> Vec<String> {
    vec![
        format!("State:        {}", status.state.label()),
        format!("Last sync:    {}", format_timestamp(status.last_sync_timestamp)),
        format!("Pending:      {}", status.pending_changes),
        format!("Retry queue:  {}", status.retry_queue_size),
    ]
}

pub fn format_entry(data_type: &str, id: &str, entry: &LocalEntry) -> Vec<String> {
    let version = entry
        .version
        .map_or_else(|| "unsynced".to_string(), |version| format!("v{version}"));
    let state = if entry.synced { "synced" } else { "pending" };
    vec![
        format!("{data_type}/{id} ({version}, {state})"),
        entry.data.as_value().to_string(),
    ]
}

pub fn format_conflict_lines(conflicts: &[ConflictRecord]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let versions = conflict
                .versions
                .iter()
                .map(|version| format!("v{}@{}", version.version, version.device_id))
                .collect::<Vec<_>>()
                .join(" vs ");
            format!(
                "{}  {}/{}  {} {}  {}  {}",
                conflict.id,
                conflict.data_type,
                conflict.data_id,
                conflict.severity.as_str(),
                conflict.suggested_strategy.as_str(),
                versions,
                format_timestamp(conflict.created_at),
            )
        })
        .collect()
}

pub fn format_event(event: &SyncEvent) -> String {
    match event {
        SyncEvent::SyncStarted => "sync started".to_string(),
        SyncEvent::ConflictDetected(conflict) => format!(
            "conflict {} on {}/{} ({})",
            conflict.id,
            conflict.data_type,
            conflict.data_id,
            conflict.severity.as_str()
        ),
        SyncEvent::DataUpdated {
            data_type,
            record_id,
            version,
            deleted,
            ..
        } => {
            if *deleted {
                format!("deleted {data_type}/{record_id} (v{version})")
            } else {
                format!("updated {data_type}/{record_id} (v{version})")
            }
        }
        SyncEvent::SyncCompleted(report) => format!("sync complete: {}", format_report(report)),
        SyncEvent::SyncFailed { message, .. } => format!("sync failed: {message}"),
    }
}
