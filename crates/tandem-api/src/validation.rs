//! Request body validation for the sync endpoint.
//!
//! Bodies are accepted as loose JSON so that each missing or malformed field maps
//! to its own client-facing message instead of a generic decode error.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tandem_core::models::{PendingChange, Platform};
use tandem_core::protocol::{
    ConflictResolution, PullCursor, PushData, ResolutionData, SyncData, SyncOperation,
    SyncRequest, MAX_ITEMS_PER_REQUEST,
};

use crate::error::AppError;

pub fn parse_sync_request(body: &Value) -> Result<SyncRequest, AppError> {
    let fields = body
        .as_object()
        .ok_or_else(|| AppError::bad_request("Request body must be a JSON object"))?;

    let user_id = non_empty_str(fields, "userId")
        .ok_or_else(|| AppError::bad_request("User ID is required"))?;
    let platform = fields
        .get("platform")
        .and_then(Value::as_str)
        .and_then(|value| value.parse::<Platform>().ok())
        .filter(|platform| platform.is_client())
        .ok_or_else(|| AppError::bad_request("Valid platform is required"))?;
    let device_id = non_empty_str(fields, "deviceId")
        .ok_or_else(|| AppError::bad_request("Device ID is required"))?;
    let operation = fields
        .get("operation")
        .and_then(Value::as_str)
        .and_then(SyncOperation::parse)
        .ok_or_else(|| AppError::bad_request("Valid operation is required"))?;

    let last_sync_timestamp = match fields.get("lastSyncTimestamp") {
        Some(value) => value
            .as_i64()
            .filter(|timestamp| *timestamp >= 0)
            .ok_or_else(|| AppError::bad_request("Valid last sync timestamp is required"))?,
        None if operation == SyncOperation::Pull => {
            return Err(AppError::bad_request(
                "Valid last sync timestamp is required",
            ));
        }
        None => 0,
    };

    let cursor = match fields.get("cursor") {
        Some(value) if operation == SyncOperation::Pull && !value.is_null() => Some(
            serde_json::from_value::<PullCursor>(value.clone())
                .map_err(|error| AppError::bad_request(format!("Invalid pull cursor: {error}")))?,
        ),
        _ => None,
    };

    let data = match operation {
        SyncOperation::Pull => None,
        SyncOperation::Push => Some(SyncData::Push(PushData {
            changes: parse_items::<PendingChange>(fields, "changes")?,
        })),
        SyncOperation::ConflictResolution => Some(SyncData::Resolutions(ResolutionData {
            resolutions: parse_items::<ConflictResolution>(fields, "resolutions")?,
        })),
    };

    Ok(SyncRequest {
        user_id,
        platform,
        device_id,
        operation,
        last_sync_timestamp,
        cursor,
        data,
    })
}

fn non_empty_str(fields: &Map<String, Value>, name: &str) -> Option<String> {
    fields
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn parse_items<T: DeserializeOwned>(
    fields: &Map<String, Value>,
    name: &str,
) -> Result<Vec<T>, AppError> {
    let items = fields
        .get("data")
        .and_then(|data| data.get(name))
        .and_then(Value::as_array)
        .ok_or_else(|| AppError::InvalidOperation(format!("data.{name} must be an array")))?;

    if items.len() > MAX_ITEMS_PER_REQUEST {
        return Err(AppError::bad_request(format!(
            "Too many {name} in one request (max {MAX_ITEMS_PER_REQUEST})"
        )));
    }

    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            serde_json::from_value(item.clone()).map_err(|error| {
                AppError::bad_request(format!("Invalid {name}[{index}]: {error}"))
            })
        })
        .collect()
}
