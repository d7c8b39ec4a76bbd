use tandem_core::client::SyncTransport;
use tandem_core::models::ResolutionKind;

use crate::commands::common::{format_conflict_lines, parse_payload};
use crate::error::CliError;
use crate::session::Session;

pub fn run_conflicts<T: SyncTransport>(
    session: &Session<T>,
    as_json: bool,
) -> Result<(), CliError> {
    let conflicts = session.conflicts()?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_resolve<T: SyncTransport>(
    session: &Session<T>,
    conflict_id: &str,
    resolution: ResolutionKind,
    data: Option<&str>,
) -> Result<(), CliError> {
    let resolved_data = data.map(parse_payload).transpose()?;
    if resolution == ResolutionKind::Manual && resolved_data.is_none() {
        return Err(CliError::MissingResolvedData);
    }

    let result = session
        .driver()
        .resolve_conflict(conflict_id, resolution, resolved_data)
        .await?;
    session.forget_conflict(conflict_id)?;

    for record in &result.records {
        println!(
            "Resolved {conflict_id}: {}/{} is now v{}",
            record.data_type, record.id, record.version
        );
    }
    Ok(())
}
