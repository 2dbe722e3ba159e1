//! End-to-end CLI tests for chanharvest.
//!
//! These tests run the actual binary against a desktop export in a temp
//! directory and verify:
//! - Command-line interface behavior
//! - Files, database and ledger written by a harvest
//! - Error messages and exit codes
//!
//! Every command runs with a private HOME and working directory so user
//! config and `.env` files on the machine do not leak in.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

// =============================================================================
// Test Utilities
// =============================================================================

const SAMPLE_EXPORT: &str = r#"{
  "chats": { "list": [
    {
      "id": 100,
      "name": "Test",
      "type": "public_channel",
      "messages": [
        { "id": 1, "type": "message", "date_unixtime": "1709294400",
          "from": "alice", "from_id": "user77", "text": "first" },
        { "id": 2, "type": "message", "date_unixtime": "1709294500",
          "from": "alice", "from_id": "user77",
          "text": ["code ", { "type": "pre", "text": "abc123" }],
          "file": "files/notes.txt", "file_name": "notes.txt" }
      ]
    },
    { "id": 300, "name": "Family", "type": "private_group", "messages": [] }
  ]}
}"#;

/// Temp workspace holding an export and all harvest output.
struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let export = dir.path().join("export");
        fs::create_dir_all(export.join("files")).expect("Failed to create export");
        fs::write(export.join("result.json"), SAMPLE_EXPORT).expect("Failed to write export");
        fs::write(export.join("files/notes.txt"), "remember the milk")
            .expect("Failed to write attachment");
        fs::create_dir_all(dir.path().join("home")).expect("Failed to create home");
        Self { dir }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn export(&self) -> PathBuf {
        self.path().join("export")
    }

    fn cmd(&self) -> Command {
        let home = self.path().join("home");
        let mut cmd = cargo_bin_cmd!("chanharvest");
        cmd.current_dir(self.path())
            .env("HOME", &home)
            .env("XDG_CONFIG_HOME", home.join(".config"))
            .env("XDG_DATA_HOME", home.join(".local/share"))
            .env("CLICOLOR", "0")
            .env("NO_COLOR", "1")
            .env_remove("RUST_LOG");
        for key in [
            "HARVEST_CHANNEL",
            "HARVEST_DOWNLOAD_DIR",
            "HARVEST_LIMIT",
            "HARVEST_INCLUDE_GROUPS",
            "HARVEST_MAX_CONCURRENT",
            "HARVEST_SINK",
            "HARVEST_DB",
            "HARVEST_CSV",
            "HARVEST_EXPORT",
            "HARVEST_LOG_FILE",
            "HARVEST_LOG_LEVEL",
        ] {
            cmd.env_remove(key);
        }
        cmd
    }

    fn harvest(&self) -> Command {
        let mut cmd = self.cmd();
        cmd.arg("harvest")
            .arg("--export")
            .arg(self.export())
            .arg("--download-dir")
            .arg(self.path().join("downloads"))
            .arg("--db")
            .arg(self.path().join("harvest.db"));
        cmd
    }
}

// =============================================================================
// General CLI
// =============================================================================

#[test]
fn test_cli_help() {
    let ws = Workspace::new();
    ws.cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("harvest"))
        .stdout(predicate::str::contains("rebuild-ledger"));
}

#[test]
fn test_cli_no_args() {
    let ws = Workspace::new();
    ws.cmd().assert().failure();
}

#[test]
fn test_completions() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("chanharvest"));
}

// =============================================================================
// Config
// =============================================================================

#[test]
fn test_config_show_defaults() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["config", "--show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[transfer]"))
        .stdout(predicate::str::contains("max_concurrent = 3"));
}

#[test]
fn test_config_env_override() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["config", "--show"])
        .env("HARVEST_MAX_CONCURRENT", "7")
        .assert()
        .success()
        .stdout(predicate::str::contains("max_concurrent = 7"));
}

#[test]
fn test_config_file_is_used() {
    let ws = Workspace::new();
    let path = ws.path().join("custom.toml");
    fs::write(&path, "[harvest]\nchannel = \"Test\"\n").unwrap();
    ws.cmd()
        .arg("--config")
        .arg(&path)
        .args(["config", "--show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("channel = \"Test\""));
}

#[test]
fn test_config_bad_env_value() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["config", "--show"])
        .env("HARVEST_LIMIT", "many")
        .assert()
        .failure()
        .stderr(predicate::str::contains("HARVEST_LIMIT"));
}

// =============================================================================
// Dialogs
// =============================================================================

#[test]
fn test_dialogs_lists_export_chats() {
    let ws = Workspace::new();
    ws.cmd()
        .arg("dialogs")
        .arg("--export")
        .arg(ws.export())
        .assert()
        .success()
        .stdout(predicate::str::contains("Test"))
        .stdout(predicate::str::contains("Family"));
}

#[test]
fn test_dialogs_channels_only_json() {
    let ws = Workspace::new();
    let output = ws
        .cmd()
        .arg("dialogs")
        .arg("--export")
        .arg(ws.export())
        .args(["--channels-only", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let dialogs: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let dialogs = dialogs.as_array().unwrap();
    assert_eq!(dialogs.len(), 1);
    assert_eq!(dialogs[0]["title"], "Test");
    assert_eq!(dialogs[0]["kind"], "broadcast");
}

#[test]
fn test_dialogs_without_source() {
    let ws = Workspace::new();
    ws.cmd()
        .arg("dialogs")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--export"));
}

// =============================================================================
// Harvest
// =============================================================================

#[test]
fn test_harvest_writes_files_db_and_ledger() {
    let ws = Workspace::new();
    ws.harvest()
        .args(["--channel", "Test"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Harvested 'Test'"));

    let notes = ws.path().join("downloads/Test/notes.txt");
    assert_eq!(fs::read_to_string(notes).unwrap(), "remember the milk");
    assert!(ws.path().join("harvest.db").exists());

    let ledger = fs::read_to_string(ws.path().join("downloads/.ledger/100.ids")).unwrap();
    let mut ids: Vec<&str> = ledger.lines().collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["1", "2"]);
}

#[test]
fn test_harvest_json_summary_and_resume() {
    let ws = Workspace::new();
    let first = ws
        .harvest()
        .args(["--channel", "Test", "--json"])
        .output()
        .unwrap();
    assert!(first.status.success());
    let summary: serde_json::Value = serde_json::from_slice(&first.stdout).unwrap();
    assert_eq!(summary["records_persisted"], 2);
    assert_eq!(summary["files_transferred"], 1);

    let second = ws
        .harvest()
        .args(["--channel", "Test", "--json"])
        .output()
        .unwrap();
    assert!(second.status.success());
    let summary: serde_json::Value = serde_json::from_slice(&second.stdout).unwrap();
    assert_eq!(summary["messages_skipped"], 2);
    assert_eq!(summary["records_persisted"], 0);
}

#[test]
fn test_harvest_csv_sink() {
    let ws = Workspace::new();
    let csv = ws.path().join("out/messages.csv");
    ws.harvest()
        .args(["--channel", "100", "--sink", "csv", "--csv"])
        .arg(&csv)
        .assert()
        .success();

    let content = fs::read_to_string(&csv).unwrap();
    assert!(content.starts_with("channel_id,"));
    assert!(content.contains("abc123"));
}

#[test]
fn test_harvest_unknown_channel() {
    let ws = Workspace::new();
    ws.harvest()
        .args(["--channel", "Tset"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not found"))
        .stderr(predicate::str::contains("did you mean 'Test'"))
        .stderr(predicate::str::contains("Hint:"));
}

#[test]
fn test_harvest_requires_channel() {
    let ws = Workspace::new();
    ws.harvest()
        .assert()
        .failure()
        .stderr(predicate::str::contains("--channel"));
}

#[test]
fn test_harvest_all_skips_groups() {
    let ws = Workspace::new();
    ws.harvest()
        .arg("--all")
        .assert()
        .success()
        .stdout(predicate::str::contains("1 channels harvested, 0 failed"));
}

// =============================================================================
// Rebuild ledger
// =============================================================================

#[test]
fn test_rebuild_ledger_after_loss() {
    let ws = Workspace::new();
    ws.harvest().args(["--channel", "Test"]).assert().success();
    fs::remove_dir_all(ws.path().join("downloads/.ledger")).unwrap();

    ws.cmd()
        .arg("rebuild-ledger")
        .args(["--channel", "Test", "--export"])
        .arg(ws.export())
        .env("HARVEST_DOWNLOAD_DIR", ws.path().join("downloads"))
        .env("HARVEST_DB", ws.path().join("harvest.db"))
        .assert()
        .success()
        .stdout(predicate::str::contains("with 2 message ids"));

    assert!(ws.path().join("downloads/.ledger/100.ids").exists());
}

#[test]
fn test_log_file_receives_events() {
    let ws = Workspace::new();
    let log = ws.path().join("logs/run.log");
    ws.harvest()
        .args(["--channel", "Test", "-v", "--log-file"])
        .arg(&log)
        .assert()
        .success();

    let content = fs::read_to_string(log).unwrap();
    assert!(content.contains("Harvest finished"));
}
