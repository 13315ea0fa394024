//! Basic CLI E2E tests.
//!
//! Tests invoke CLI commands via cargo run against a throwaway alarm
//! database and verify outputs.

use std::path::Path;
use std::process::Command;

/// Run a CLI command and return (exit code, stdout, stderr).
fn run_cli(db: &Path, args: &[&str]) -> (i32, String, String) {
    let output = Command::new("cargo")
        .args(["run", "-q", "-p", "chime-cli", "--"])
        .arg("--db")
        .arg(db)
        .args(args)
        .env("CHIME_ENV", "dev")
        .output()
        .expect("Failed to execute CLI command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);

    (code, stdout, stderr)
}

fn list_json(db: &Path) -> Vec<serde_json::Value> {
    let (code, stdout, stderr) = run_cli(db, &["list", "--json"]);
    assert_eq!(code, 0, "list failed: {stderr}");
    serde_json::from_str::<serde_json::Value>(&stdout)
        .expect("list output is JSON")
        .as_array()
        .cloned()
        .unwrap_or_default()
}

#[test]
fn test_add_list_cancel() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("alarms.db");

    let (code, stdout, stderr) = run_cli(&db, &["add", "Stretch", "--at", "+90m", "--repeat", "daily"]);
    assert_eq!(code, 0, "add failed: {stderr}");
    assert!(stdout.contains("scheduled"), "unexpected output: {stdout}");

    let alarms = list_json(&db);
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0]["summary"], "Stretch");
    assert_eq!(alarms[0]["recurring"], true);
    let id = alarms[0]["id"].as_str().unwrap().to_string();

    let (code, stdout, _) = run_cli(&db, &["cancel", &id[..8]]);
    assert_eq!(code, 0, "cancel failed");
    assert!(stdout.contains("cancelled"));
    assert!(list_json(&db).is_empty());
}

#[test]
fn test_trigger_shows_message() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("alarms.db");
    let (code, _, _) = run_cli(&db, &["add", "Drink water", "--at", "+3h"]);
    assert_eq!(code, 0);
    let id = list_json(&db)[0]["id"].as_str().unwrap().to_string();

    let (code, stdout, stderr) = run_cli(&db, &["trigger", &id]);
    assert_eq!(code, 0, "trigger failed: {stderr}");
    assert!(stdout.contains("Drink water"), "unexpected output: {stdout}");
    // A forced firing doesn't consume the alarm.
    assert_eq!(list_json(&db).len(), 1);
}

#[test]
fn test_defer_moves_next_trigger() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("alarms.db");
    run_cli(&db, &["add", "Review", "--at", "+5h"]);
    let before = list_json(&db)[0]["next_trigger"].as_str().unwrap().to_string();
    let id = list_json(&db)[0]["id"].as_str().unwrap().to_string();

    let (code, stdout, _) = run_cli(&db, &["defer", &id, "+1h"]);
    assert_eq!(code, 0, "defer failed");
    assert!(stdout.contains("deferred"));
    let after = list_json(&db)[0]["next_trigger"].as_str().unwrap().to_string();
    assert_ne!(before, after);
}

#[test]
fn test_unknown_alarm_fails() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("alarms.db");
    let (code, _, stderr) = run_cli(&db, &["trigger", "no-such-alarm"]);
    assert_ne!(code, 0);
    assert!(stderr.contains("not found"), "unexpected error: {stderr}");
}

#[test]
fn test_add_requires_time() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("alarms.db");
    let (code, _, stderr) = run_cli(&db, &["add", "No time given"]);
    assert_ne!(code, 0);
    assert!(stderr.contains("--at"));
}

#[test]
fn test_config_get() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, _) = run_cli(&dir.path().join("a.db"), &["config", "get", "work_time.start"]);
    assert_eq!(code, 0, "Config get failed");
    assert!(!stdout.trim().is_empty());
}

#[test]
fn test_config_list() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, _) = run_cli(&dir.path().join("a.db"), &["config", "list"]);
    assert_eq!(code, 0, "Config list failed");
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert!(parsed.get("alarms").is_some());
}

#[test]
fn test_config_set_rejects_bad_time() {
    let dir = tempfile::tempdir().unwrap();
    let (code, _, _) = run_cli(
        &dir.path().join("a.db"),
        &["config", "set", "work_time.start", "25:99"],
    );
    assert_ne!(code, 0);
}
