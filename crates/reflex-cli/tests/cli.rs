//! Drives the `reflex` binary against a temporary database.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use serde_json::Value;

struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn db(&self) -> PathBuf {
        self.dir.path().join("reflex.db")
    }

    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_reflex"));
        cmd.arg("--db")
            .arg(self.db())
            .args(["--project", "prj_cli", "--json"])
            .args(args)
            .env_remove("REFLEX_CONFIG")
            .env_remove("REFLEX_PROJECT")
            .env("RUST_LOG", "warn");
        cmd
    }

    fn run(&self, args: &[&str]) -> Output {
        self.command(args).output().unwrap()
    }

    fn json(&self, args: &[&str]) -> Value {
        let output = self.run(args);
        assert!(
            output.status.success(),
            "reflex {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).unwrap()
    }

    fn ingest_file(&self, path: &Path) -> Value {
        self.json(&["ingest", "--file", path.to_str().unwrap()])
    }
}

const NIL_REPORT: &str = r#"{
    "error_class": "NoMethodError",
    "message": "undefined method 'foo' for nil",
    "backtrace": ["app/models/user.rb:42:in `full_name'"],
    "environment": "production"
}"#;

#[test]
fn ingest_groups_repeated_reports() {
    let ws = Workspace::new();
    let report = ws.write("report.json", NIL_REPORT);

    let first = ws.ingest_file(&report);
    let second = ws.ingest_file(&report);
    assert_eq!(first["created"], true);
    assert_eq!(second["created"], false);
    assert_eq!(first["group_id"], second["group_id"]);
    assert_eq!(second["event_count"], 2);

    let list = ws.json(&["errors", "list"]);
    assert_eq!(list["count"], 1);
    let location = list["groups"][0]["location"].as_str().unwrap();
    assert!(location.starts_with("app/models/user.rb:42"));
}

#[test]
fn ingest_reads_stdin() {
    let ws = Workspace::new();
    let mut child = ws
        .command(&["ingest", "--message"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(br#"{"message": "cache warmed"}"#)
        .unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());

    let result: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["error_class"], "Message");
}

#[test]
fn batch_ingest_and_search() {
    let ws = Workspace::new();
    let batch = ws.write(
        "batch.json",
        r#"[
            {"error_class": "Timeout", "message": "upstream timed out"},
            {"error_class": "KeyError", "message": "key not found: user_id"},
            {"error_class": "Timeout", "message": "upstream timed out"}
        ]"#,
    );

    let result = ws.json(&["ingest", "--batch", "--file", batch.to_str().unwrap()]);
    assert_eq!(result["processed"], 3);

    let found = ws.json(&["search", "user"]);
    assert_eq!(found["count"], 1);
    assert_eq!(found["groups"][0]["error_class"], "KeyError");

    let frequent = ws.json(&["errors", "list", "--sort", "frequent"]);
    assert_eq!(frequent["groups"][0]["error_class"], "Timeout");
}

#[test]
fn resolve_then_filter_by_status() {
    let ws = Workspace::new();
    let report = ws.write("report.json", NIL_REPORT);
    let group_id = ws.ingest_file(&report)["group_id"]
        .as_str()
        .unwrap()
        .to_string();

    let resolved = ws.json(&["errors", "resolve", &group_id, "--by", "dev"]);
    assert_eq!(resolved["status"], "resolved");

    let open = ws.json(&["errors", "list", "--status", "unresolved"]);
    assert_eq!(open["count"], 0);

    let events = ws.json(&["errors", "events", &group_id]);
    assert_eq!(events["total_count"], 1);

    let missing = ws.run(&["errors", "show", "eg-missing"]);
    assert!(!missing.status.success());
}

#[test]
fn stats_and_signals() {
    let ws = Workspace::new();
    let report = ws.write("report.json", NIL_REPORT);
    ws.ingest_file(&report);
    ws.ingest_file(&report);

    let stats = ws.json(&["stats", "--since", "1d"]);
    assert_eq!(stats["groups"]["total"], 1);
    assert_eq!(stats["events_in_period"], 2);

    let rate = ws.json(&["signal", "rate", "NoMethodError", "--window", "1h"]);
    assert_eq!(rate["value"], 2.0);

    let last = ws.json(&["signal", "last", "--environment", "production"]);
    assert_eq!(last["value"], 1);

    let bad = ws.run(&["stats", "--since", "tomorrow"]);
    assert!(!bad.status.success());
}

#[test]
fn notify_drain_empties_outbox() {
    let ws = Workspace::new();
    let report = ws.write("report.json", NIL_REPORT);
    ws.ingest_file(&report);

    let pending = ws.json(&["notify", "pending"]);
    assert_eq!(pending["count"], 1);

    let report = ws.json(&["notify", "drain"]);
    assert_eq!(report["delivered"], 1);
    assert_eq!(ws.json(&["notify", "pending"])["count"], 0);
}

#[test]
fn project_ensure_and_delete() {
    let ws = Workspace::new();
    let identity = ws.write(
        "identity.json",
        r#"{"valid": true, "project_id": "prj_cli", "project_name": "CLI", "features": {"reflex": true}}"#,
    );
    let project = ws.json(&["project", "ensure", "--file", identity.to_str().unwrap()]);
    assert_eq!(project["platform_project_id"], "prj_cli");
    assert_eq!(project["name"], "CLI");

    let denied = ws.write("denied.json", r#"{"valid": true, "project_id": "prj_cli"}"#);
    assert!(!ws
        .run(&["project", "ensure", "--file", denied.to_str().unwrap()])
        .status
        .success());

    assert!(!ws.run(&["project", "delete"]).status.success());
    let deleted = ws.json(&["project", "delete", "--force"]);
    assert_eq!(deleted["deleted"], true);
}

#[test]
fn missing_project_is_an_error() {
    let ws = Workspace::new();
    let output = Command::new(env!("CARGO_BIN_EXE_reflex"))
        .arg("--db")
        .arg(ws.db())
        .args(["errors", "list"])
        .env_remove("REFLEX_PROJECT")
        .env_remove("REFLEX_CONFIG")
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("REFLEX_PROJECT"));
}
