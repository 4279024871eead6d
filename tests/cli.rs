//! Integration tests for CLI commands

#![allow(deprecated)]

use assert_cmd::{assert::OutputAssertExt, cargo::CommandCargoExt};
use predicates::prelude::*;
use std::process::Command;
use tempfile::TempDir;

/// Command bound to a throwaway store and config
fn ledger(tmp: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("chat-ledger").unwrap();
    cmd.arg("--store")
        .arg(tmp.path().join("store"))
        .arg("--config")
        .arg(tmp.path().join("config.toml"))
        .arg("--approximate")
        .env_remove("CLIENT_GLOBAL_SETTINGS")
        .env_remove("CLIENT_SESSION_SETTINGS")
        .env_remove("CLIENT_DEFAULT_MESSAGE")
        .env_remove("CLIENT_MAX_INPUT_TOKENS")
        .env("NO_COLOR", "1");
    cmd
}

fn new_session(tmp: &TempDir, title: &str) -> String {
    let output = ledger(tmp)
        .arg("new")
        .arg("--title")
        .arg(title)
        .output()
        .unwrap();
    assert!(output.status.success());
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

fn add(tmp: &TempDir, id: &str, role: &str, content: &str) {
    ledger(tmp)
        .args(["add", id, role, content])
        .assert()
        .success();
}

#[test]
fn test_help_lists_commands() {
    let mut cmd = Command::cargo_bin("chat-ledger").unwrap();
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("budget"))
        .stdout(predicate::str::contains("search"))
        .stdout(predicate::str::contains("export"));
}

#[test]
fn test_new_session_is_listed() {
    let tmp = TempDir::new().unwrap();
    let id = new_session(&tmp, "Borrow checker notes");
    assert_eq!(id.len(), 8);

    ledger(&tmp)
        .args(["list", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(id.as_str()))
        .stdout(predicate::str::contains("Borrow checker notes"));
}

#[test]
fn test_show_reports_valid_context() {
    let tmp = TempDir::new().unwrap();
    add(&tmp, "s1", "user", "hi");
    add(&tmp, "s1", "assistant", "hello");
    add(&tmp, "s1", "user", "bye");

    let output = ledger(&tmp)
        .args(["show", "s1", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let snapshot: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(snapshot["messages"].as_array().unwrap().len(), 3);
    let context = snapshot["validContext"].as_array().unwrap();
    assert_eq!(context.len(), 2);
    assert_eq!(context[0]["content"], "hi");
    assert_eq!(context[1]["content"], "hello");
}

#[test]
fn test_empty_session_shows_greeting() {
    let tmp = TempDir::new().unwrap();
    ledger(&tmp)
        .env("CLIENT_DEFAULT_MESSAGE", "Welcome aboard")
        .arg("show")
        .assert()
        .success()
        .stdout(predicate::str::contains("Welcome aboard"));
}

#[test]
fn test_budget_json() {
    let tmp = TempDir::new().unwrap();
    add(&tmp, "s1", "user", "hi");
    add(&tmp, "s1", "assistant", "hello");

    // "hi\nhello" is 8 bytes, 2 tokens; "abcd" is 1 token
    ledger(&tmp)
        .args(["budget", "s1", "--input", "abcd", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"remainingToken\": 127997"))
        .stdout(predicate::str::contains("\"model\": \"gpt-4o-mini\""));
}

#[test]
fn test_budget_uses_configured_table_with_api_key() {
    let tmp = TempDir::new().unwrap();
    ledger(&tmp)
        .args(["global", "--api-key", "sk-test-1234"])
        .assert()
        .success()
        .stdout(predicate::str::contains("…1234"));

    ledger(&tmp)
        .env("CLIENT_MAX_INPUT_TOKENS", "1000")
        .args(["budget", "--input", "abcdefgh", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"remainingToken\": 998"));
}

#[test]
fn test_clear_keeps_locked_messages() {
    let tmp = TempDir::new().unwrap();
    ledger(&tmp)
        .args(["add", "s1", "user", "pinned", "--locked"])
        .assert()
        .success();
    add(&tmp, "s1", "assistant", "loose");

    ledger(&tmp)
        .args(["clear", "s1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 locked messages kept"));
}

#[test]
fn test_delete_home_is_refused() {
    let tmp = TempDir::new().unwrap();
    ledger(&tmp)
        .args(["delete", "index"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("home session cannot be deleted"));
}

#[test]
fn test_delete_removes_session() {
    let tmp = TempDir::new().unwrap();
    let id = new_session(&tmp, "Doomed");

    ledger(&tmp).args(["delete", &id]).assert().success();
    ledger(&tmp)
        .args(["list", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Doomed").not());
}

#[test]
fn test_search_ranks_matching_sessions() {
    let tmp = TempDir::new().unwrap();
    let rust = new_session(&tmp, "Rust lifetimes");
    let _python = new_session(&tmp, "Python packaging");

    ledger(&tmp)
        .args(["search", "lifetimes", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(rust.as_str()))
        .stdout(predicate::str::contains("Python packaging").not());
}

#[test]
fn test_blank_id_targets_home_session() {
    let tmp = TempDir::new().unwrap();
    add(&tmp, "", "user", "lands at home");

    ledger(&tmp)
        .args(["show", "index", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("lands at home"));
    ledger(&tmp)
        .args(["list", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"id\": \"\"").not());
}

#[test]
fn test_set_rejects_unknown_model() {
    let tmp = TempDir::new().unwrap();
    ledger(&tmp)
        .args(["set", "s1", "--model", "gpt-3.5"])
        .assert()
        .failure();
}

#[test]
fn test_export_import_roundtrip() {
    let source = TempDir::new().unwrap();
    add(&source, "s1", "user", "carried over");
    let dump = source.path().join("dump.json");

    ledger(&source)
        .arg("export")
        .arg("--output")
        .arg(&dump)
        .assert()
        .success();

    let target = TempDir::new().unwrap();
    add(&target, "stale", "user", "gone after import");
    ledger(&target)
        .arg("import")
        .arg(&dump)
        .assert()
        .success()
        .stdout(predicate::str::contains("Imported 1 keys"));

    ledger(&target)
        .args(["list", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("s1"))
        .stdout(predicate::str::contains("stale").not());
}
