//! Conflict detection and classification.
//!
//! Everything here is a pure function over payloads and conflict versions; the
//! coordinator decides when to call it and persists the outcome.

use chrono::DateTime;
use serde_json::Value;

use crate::models::{ConflictVersion, Payload, ResolutionStrategy, Severity};

/// Writes closer together than this are flagged for manual review
pub const NEAR_SIMULTANEOUS_WINDOW_MS: u64 = 60_000;

const LOW_SEVERITY_MAX_DIFFS: usize = 2;
const MEDIUM_SEVERITY_MAX_DIFFS: usize = 5;

/// Outcome of comparing two competing versions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictAnalysis {
    pub diff_count: usize,
    pub severity: Severity,
    pub suggested_strategy: ResolutionStrategy,
}

/// Count differing leaf fields between two payloads.
///
/// Objects are compared key by key and nested objects contribute their own leaf
/// count. A key present on one side only contributes every leaf beneath it.
/// Arrays and scalars compare as a single leaf.
pub fn diff_count(left: &Value, right: &Value) -> usize {
    match (left, right) {
        (Value::Object(left_map), Value::Object(right_map)) => {
            let shared_and_left: usize = left_map
                .iter()
                .map(|(key, left_value)| {
                    right_map
                        .get(key)
                        .map_or_else(|| leaf_count(left_value), |right_value| {
                            diff_count(left_value, right_value)
                        })
                })
                .sum();
            let right_only: usize = right_map
                .iter()
                .filter(|(key, _)| !left_map.contains_key(*key))
                .map(|(_, value)| leaf_count(value))
                .sum();
            shared_and_left + right_only
        }
        _ => usize::from(left != right),
    }
}

fn leaf_count(value: &Value) -> usize {
    match value {
        Value::Object(map) if !map.is_empty() => map.values().map(leaf_count).sum(),
        _ => 1,
    }
}

pub const fn classify_severity(diff_count: usize) -> Severity {
    if diff_count <= LOW_SEVERITY_MAX_DIFFS {
        Severity::Low
    } else if diff_count <= MEDIUM_SEVERITY_MAX_DIFFS {
        Severity::Medium
    } else {
        Severity::High
    }
}

/// Edit time embedded in a payload (`lastModified`, then `timestamp`), in Unix ms.
///
/// Accepts integer or float milliseconds and RFC 3339 strings.
pub fn embedded_timestamp(data: &Value) -> Option<i64> {
    ["lastModified", "timestamp"]
        .iter()
        .filter_map(|field| data.get(*field))
        .find_map(parse_timestamp)
}

#[allow(clippy::cast_possible_truncation)] // fractional milliseconds are truncated
fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64)),
        Value::String(text) => DateTime::parse_from_rfc3339(text.trim())
            .ok()
            .map(|parsed| parsed.timestamp_millis()),
        _ => None,
    }
}

/// Pick a resolution strategy for two competing versions.
///
/// Near-simultaneous edits always go to manual review; otherwise low severity
/// merges automatically and everything else keeps the newest write.
pub fn suggest_strategy(
    severity: Severity,
    left: &ConflictVersion,
    right: &ConflictVersion,
) -> ResolutionStrategy {
    let left_at = embedded_timestamp(left.data.as_value()).unwrap_or(left.timestamp);
    let right_at = embedded_timestamp(right.data.as_value()).unwrap_or(right.timestamp);

    if left_at.abs_diff(right_at) < NEAR_SIMULTANEOUS_WINDOW_MS {
        ResolutionStrategy::ManualReview
    } else if severity == Severity::Low {
        ResolutionStrategy::AutoMerge
    } else {
        ResolutionStrategy::LatestWins
    }
}

pub fn analyze(existing: &ConflictVersion, incoming: &ConflictVersion) -> ConflictAnalysis {
    let diff_count = diff_count(existing.data.as_value(), incoming.data.as_value());
    let severity = classify_severity(diff_count);
    ConflictAnalysis {
        diff_count,
        severity,
        suggested_strategy: suggest_strategy(severity, existing, incoming),
    }
}

/// Overlay `overlay` onto `base`, recursing into objects present on both sides.
/// Non-object values from `overlay` replace whatever `base` held.
pub fn merge_payloads(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in overlay_map {
                let next = merged
                    .get(key)
                    .map_or_else(|| value.clone(), |existing| merge_payloads(existing, value));
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        _ => overlay.clone(),
    }
}

/// Newest competing version by write time, then by version
pub fn latest_version(versions: &[ConflictVersion]) -> Option<&ConflictVersion> {
    versions
        .iter()
        .max_by_key(|version| (version.timestamp, version.version))
}

/// Merge every competing payload oldest first, so newer writes win on shared keys
pub fn merge_versions(versions: &[ConflictVersion]) -> Payload {
    let mut ordered: Vec<&ConflictVersion> = versions.iter().collect();
    ordered.sort_by_key(|version| (version.timestamp, version.version));
    let merged = ordered
        .into_iter()
        .fold(Value::Null, |acc, version| {
            if acc.is_null() {
                version.data.as_value().clone()
            } else {
                merge_payloads(&acc, version.data.as_value())
            }
        });
    Payload::new(merged)
}
