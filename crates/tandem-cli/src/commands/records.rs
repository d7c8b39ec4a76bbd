use tandem_core::client::SyncTransport;
use tandem_core::models::ChangeOperation;
use tandem_core::Payload;

use crate::commands::common::{format_entry, parse_payload};
use crate::commands::sync::run_sync;
use crate::error::CliError;
use crate::session::Session;

pub async fn run_put<T: SyncTransport>(
    session: &Session<T>,
    data_type: &str,
    id: &str,
    json: &str,
    base_version: Option<u64>,
    sync_now: bool,
) -> Result<(), CliError> {
    let payload = parse_payload(json)?;
    let driver = session.driver();
    let operation = if driver.get_local_data(data_type, id)?.is_some() {
        ChangeOperation::Update
    } else {
        ChangeOperation::Create
    };

    let change = match base_version {
        Some(base) => {
            driver.queue_change_with_base(data_type, id, payload, operation, Some(base))?
        }
        None => driver.queue_change(data_type, id, payload, operation)?,
    };
    println!("Queued {} {}", change.operation.as_str(), change.id);

    if sync_now {
        run_sync(session, false).await?;
    }
    Ok(())
}

pub async fn run_delete<T: SyncTransport>(
    session: &Session<T>,
    data_type: &str,
    id: &str,
    sync_now: bool,
) -> Result<(), CliError> {
    let change = session.driver().queue_change(
        data_type,
        id,
        Payload::null(),
        ChangeOperation::Delete,
    )?;
    println!("Queued delete {}", change.id);

    if sync_now {
        run_sync(session, false).await?;
    }
    Ok(())
}

pub fn run_get<T: SyncTransport>(
    session: &Session<T>,
    data_type: &str,
    id: &str,
    as_json: bool,
) -> Result<(), CliError> {
    let entry = session
        .driver()
        .get_local_data(data_type, id)?
        .ok_or_else(|| CliError::NotFound(format!("{data_type}/{id}")))?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entry)?);
    } else {
        for line in format_entry(data_type, id, &entry) {
            println!("{line}");
        }
    }
    Ok(())
}
