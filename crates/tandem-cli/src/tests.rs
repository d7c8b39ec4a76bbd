use std::path::{Path, PathBuf};

use clap::Parser;
use pretty_assertions::assert_eq;
use serde_json::json;
use tandem_core::client::{
    ClientConfig, FileStore, KeyValueStore, SyncReport, SyncTransport, TransportError,
    TransportResult,
};
use tandem_core::models::{
    ConflictRecord, ConflictStatus, ConflictVersion, Payload, Platform, ResolutionKind,
    ResolutionStrategy, Severity,
};
use tandem_core::protocol::{
    AppliedChange, DeviceIdentity, PullResult, PushResult, ResolutionResult, SyncRequest,
};

use crate::cli::{Cli, Commands, CompletionShell, ResolutionArg};
use crate::commands::common::{
    format_conflict_lines, format_report, format_timestamp, parse_payload,
};
use crate::commands::completions::{render_completions, run_completions};
use crate::commands::conflicts::run_resolve;
use crate::commands::records::{run_delete, run_get, run_put};
use crate::commands::sync::{run_reset, run_sync};
use crate::error::CliError;
use crate::session::{
    ensure_device_id, resolve_store_path, Session, CONFLICTS_KEY, DEVICE_ID_KEY, OUTBOX_KEY,
};

/// Accepts every change unless offline or told to report a conflict
#[derive(Default)]
struct FakeTransport {
    offline: bool,
    conflict: Option<ConflictRecord>,
}

impl SyncTransport for FakeTransport {
    async fn pull(&self, request: SyncRequest) -> TransportResult<PullResult> {
        if self.offline {
            return Err(TransportError::Network("connection refused".to_string()));
        }
        Ok(PullResult {
            last_sync_timestamp: request.last_sync_timestamp,
            ..PullResult::default()
        })
    }

    async fn push(&self, request: SyncRequest) -> TransportResult<PushResult> {
        let changes = request.changes();
        if let Some(conflict) = &self.conflict {
            return Ok(PushResult {
                conflicts: changes.len(),
                conflict_records: vec![conflict.clone()],
                ..PushResult::default()
            });
        }
        Ok(PushResult {
            successful: changes.len(),
            applied: changes
                .iter()
                .map(|change| AppliedChange {
                    change_id: change.id.clone(),
                    data_type: change.data_type.clone(),
                    record_id: change.record_id.clone(),
                    version: change.base_version.unwrap_or(0) + 1,
                    checksum: change.data.checksum(),
                    deleted: change.is_delete(),
                })
                .collect(),
            ..PushResult::default()
        })
    }

    async fn resolve(&self, _request: SyncRequest) -> TransportResult<ResolutionResult> {
        Ok(ResolutionResult::default())
    }
}

fn store_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("tandem").join("store.json")
}

fn session_at(path: &Path, transport: FakeTransport) -> Session<FakeTransport> {
    let store = FileStore::open(path).unwrap();
    let device_id = ensure_device_id(&store).unwrap();
    let config = ClientConfig::new(
        "http://127.0.0.1:9",
        DeviceIdentity::new("user-1", device_id, Platform::Web),
    );
    Session::start(config, transport, store).unwrap()
}

fn conflict() -> ConflictRecord {
    let version = |version: u64, theme: &str, device_id: &str| ConflictVersion {
        version,
        data: Payload::new(json!({ "theme": theme })),
        timestamp: 1_700_000_000_000,
        platform: Platform::Web,
        device_id: device_id.to_string(),
    };
    ConflictRecord {
        id: "conflict_1".to_string(),
        user_id: "user-1".to_string(),
        data_type: "user_preferences".to_string(),
        data_id: "u1".to_string(),
        versions: vec![version(2, "dark", "device-a"), version(1, "light", "device-b")],
        severity: Severity::Low,
        suggested_strategy: ResolutionStrategy::ManualReview,
        status: ConflictStatus::Pending,
        created_at: 1_700_000_000_000,
        expires_at: 1_700_000_300_000,
        resolved_at: None,
        resolution: None,
    }
}

#[test]
fn put_arguments_parse() {
    let cli = Cli::try_parse_from([
        "tandem",
        "--store",
        "/tmp/store.json",
        "put",
        "notes",
        "n1",
        r#"{"body":"hi"}"#,
        "--base-version",
        "3",
        "--now",
    ])
    .unwrap();

    assert_eq!(cli.store, Some(PathBuf::from("/tmp/store.json")));
    match cli.command {
        Commands::Put {
            data_type,
            id,
            base_version,
            now,
            ..
        } => {
            assert_eq!((data_type.as_str(), id.as_str()), ("notes", "n1"));
            assert_eq!(base_version, Some(3));
            assert!(now);
        }
        _ => panic!("expected put"),
    }
}

#[test]
fn resolve_arguments_parse() {
    let cli = Cli::try_parse_from(["tandem", "resolve", "conflict_1", "override"]).unwrap();
    match cli.command {
        Commands::Resolve {
            resolution, data, ..
        } => {
            assert_eq!(resolution, ResolutionArg::Override);
            assert_eq!(ResolutionKind::from(resolution), ResolutionKind::Override);
            assert!(data.is_none());
        }
        _ => panic!("expected resolve"),
    }
    assert!(Cli::try_parse_from(["tandem", "resolve", "conflict_1", "ignore"]).is_err());
}

#[test]
fn explicit_store_path_wins() {
    let path = PathBuf::from("/tmp/custom.json");
    assert_eq!(resolve_store_path(Some(path.clone())).unwrap(), path);
}

#[test]
fn device_id_is_created_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);

    let first = ensure_device_id(&FileStore::open(&path).unwrap()).unwrap();
    let second = ensure_device_id(&FileStore::open(&path).unwrap()).unwrap();
    assert!(first.starts_with("cli-"));
    assert_eq!(first, second);
}

#[test]
fn invalid_json_payload_is_rejected() {
    assert!(matches!(
        parse_payload("{not json"),
        Err(CliError::InvalidJson(_))
    ));
    assert_eq!(
        parse_payload(r#" {"a": 1} "#).unwrap().into_value(),
        json!({"a": 1})
    );
}

#[tokio::test(flavor = "current_thread")]
async fn unsent_changes_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);

    let session = session_at(&path, FakeTransport::default());
    run_put(&session, "notes", "n1", r#"{"body":"hi"}"#, None, false)
        .await
        .unwrap();
    run_delete(&session, "notes", "n2", false).await.unwrap();
    session.save().unwrap();
    drop(session);

    let reopened = session_at(&path, FakeTransport::default());
    let unsent = reopened.driver().unsent_changes();
    assert_eq!(unsent.len(), 2);
    assert_eq!(reopened.driver().status().unwrap().pending_changes, 2);
    run_get(&reopened, "notes", "n1", true).unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn successful_sync_empties_outbox() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);

    let session = session_at(&path, FakeTransport::default());
    run_put(&session, "notes", "n1", r#"{"body":"hi"}"#, None, false)
        .await
        .unwrap();
    let report = run_sync(&session, false).await.unwrap();
    session.save().unwrap();

    assert_eq!(report.pushed, 1);
    let store = FileStore::open(&path).unwrap();
    assert!(store.get(OUTBOX_KEY).unwrap().is_none());
    let entry = session.driver().get_local_data("notes", "n1").unwrap().unwrap();
    assert!(entry.synced);
    assert_eq!(entry.version, Some(1));
}

#[tokio::test(flavor = "current_thread")]
async fn failed_sync_keeps_outbox() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);

    let session = session_at(
        &path,
        FakeTransport {
            offline: true,
            ..FakeTransport::default()
        },
    );
    run_put(&session, "notes", "n1", r#"{"body":"hi"}"#, None, true)
        .await
        .unwrap_err();
    session.save().unwrap();

    let store = FileStore::open(&path).unwrap();
    let outbox: Vec<serde_json::Value> = store.get_as(OUTBOX_KEY).unwrap().unwrap();
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0]["id"], "notes_n1");
}

#[tokio::test(flavor = "current_thread")]
async fn conflicts_are_remembered_until_reset() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);

    let session = session_at(
        &path,
        FakeTransport {
            conflict: Some(conflict()),
            ..FakeTransport::default()
        },
    );
    run_put(&session, "user_preferences", "u1", r#"{"theme":"light"}"#, Some(1), false)
        .await
        .unwrap();
    let report: SyncReport = run_sync(&session, false).await.unwrap();
    assert_eq!(report.conflicts, 1);
    session.save().unwrap();

    let conflicts = session.conflicts().unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].id, "conflict_1");

    run_reset(&session).unwrap();
    assert!(session.conflicts().unwrap().is_empty());
    let store = FileStore::open(&path).unwrap();
    assert!(store.get(CONFLICTS_KEY).unwrap().is_none());
    assert!(store.get(DEVICE_ID_KEY).unwrap().is_some());
}

#[tokio::test(flavor = "current_thread")]
async fn manual_resolution_requires_data() {
    let dir = tempfile::tempdir().unwrap();
    let session = session_at(&store_path(&dir), FakeTransport::default());

    let err = run_resolve(&session, "conflict_1", ResolutionKind::Manual, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CliError::MissingResolvedData));
}

#[test]
fn conflict_lines_include_key_fields() {
    let lines = format_conflict_lines(&[conflict()]);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("conflict_1  user_preferences/u1  low manual_review"));
    assert!(lines[0].contains("v2@device-a vs v1@device-b"));
    assert!(lines[0].ends_with("2023-11-14T22:13:20.000Z"));
}

#[test]
fn timestamps_and_reports_format() {
    assert_eq!(format_timestamp(0), "never");
    assert_eq!(format_timestamp(1_000), "1970-01-01T00:00:01.000Z");
    let report = SyncReport {
        pulled: 2,
        pushed: 1,
        ..SyncReport::default()
    };
    assert_eq!(
        format_report(&report),
        "Pulled 2, pushed 1, failed 0, conflicts 0"
    );
}

#[test]
fn completions_name_the_binary() {
    let script = String::from_utf8(render_completions(CompletionShell::Bash)).unwrap();
    assert!(script.contains("tandem"));

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("completions").join("tandem.fish");
    run_completions(CompletionShell::Fish, Some(&output)).unwrap();
    assert!(std::fs::read_to_string(&output).unwrap().contains("tandem"));
}
