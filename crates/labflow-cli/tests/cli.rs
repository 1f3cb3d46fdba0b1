//! Runs the built `labflow` binary against experiments in a temp directory.

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tempfile::TempDir;

const ROUTED: &str = r#"
experiment:
  name: demo
  initial_values:
    demo.x: 5
parts:
  start:
    type_name: step.set
    config_values: { values: { ready: true } }
    output_names: { ready: demo.ready }
    next_part: decide
  decide:
    type_name: decision.conditional
    input_names: { demo.x: x }
    config_values: { statements: ["go if {x} > 3", "else stop"] }
    next_part: { go: finish, stop: quit }
  finish:
    type_name: step.set
    config_values: { values: { ok: true } }
    output_names: { ok: demo.finished }
    next_part: quit
"#;

fn labflow(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_labflow"))
        .current_dir(dir)
        .arg("--color")
        .arg("never")
        .args(args)
        .stdin(Stdio::null())
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn write_config(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_run_creates_numbered_run_directory() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "demo.yml", ROUTED);

    let first = labflow(dir.path(), &["run", "demo.yml", "--out-dir", "out"]);
    assert_eq!(first.status.code(), Some(0), "{}", stdout(&first));
    assert!(stdout(&first).contains("Run stopped: Experiment completed"));

    let run = dir.path().join("out/demo/run_1");
    assert!(run.join("trace.jsonl").exists());
    assert_eq!(fs::read_to_string(run.join("config.yml")).unwrap(), ROUTED);

    let second = labflow(dir.path(), &["run", "demo.yml", "--out-dir", "out"]);
    assert_eq!(second.status.code(), Some(0));
    assert!(dir.path().join("out/demo/run_2/trace.jsonl").exists());
}

#[test]
fn test_events_and_retrace_read_the_trace() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "demo.yml", ROUTED);
    let run = labflow(dir.path(), &["run", "demo.yml", "--out-dir", "out"]);
    assert_eq!(run.status.code(), Some(0));
    let trace = "out/demo/run_1/trace.jsonl";

    let events = labflow(dir.path(), &["events", trace, "--format", "json"]);
    assert_eq!(events.status.code(), Some(0));
    let parsed: Vec<Value> = serde_json::from_str(&stdout(&events)).unwrap();
    assert_eq!(parsed[0]["part_id"], "start");
    assert_eq!(parsed[0]["event_kind"], "part_started");
    let last = parsed.last().unwrap();
    assert_eq!(last["part_id"], "finish");
    assert_eq!(last["payload"]["next"], "quit");

    let decisions = labflow(
        dir.path(),
        &["events", trace, "--kind", "decision_taken", "--format", "json"],
    );
    let parsed: Vec<Value> = serde_json::from_str(&stdout(&decisions)).unwrap();
    assert_eq!(parsed.len(), 1);
    assert_eq!(parsed[0]["payload"]["route"], "go");

    let retrace = labflow(dir.path(), &["retrace", "demo.yml", trace, "--format", "json"]);
    assert_eq!(retrace.status.code(), Some(0));
    let report: Value = serde_json::from_str(&stdout(&retrace)).unwrap();
    assert_eq!(report["finished"], true);
    assert_eq!(report["store"]["demo.finished"], true);
    assert_eq!(report["store"]["demo.x"], 5);
    assert_eq!(report["malformed_lines"], 0);
}

#[test]
fn test_unknown_event_kind_is_an_error() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "demo.yml", ROUTED);
    labflow(dir.path(), &["run", "demo.yml", "--out-dir", "out"]);

    let output = labflow(
        dir.path(),
        &["events", "out/demo/run_1/trace.jsonl", "--kind", "bogus"],
    );
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_unresolvable_route_suspends_and_resumes() {
    let dir = TempDir::new().unwrap();
    // x = 1 takes the "stop" route, which has no target
    let config = ROUTED
        .replace("demo.x: 5", "demo.x: 1")
        .replace("{ go: finish, stop: quit }", "{ go: finish }");
    write_config(&dir, "demo.yml", &config);

    let run = labflow(dir.path(), &["run", "demo.yml", "--out-dir", "out", "--no-prompt"]);
    assert_eq!(run.status.code(), Some(3), "{}", stdout(&run));
    let text = stdout(&run);
    assert!(text.contains("Suspended awaiting a decision"));
    assert!(text.contains("UnresolvedNextPart"));

    let trace = "out/demo/run_1/trace.jsonl";
    let retrace = labflow(dir.path(), &["retrace", "demo.yml", trace, "--format", "json"]);
    let report: Value = serde_json::from_str(&stdout(&retrace)).unwrap();
    assert_eq!(report["finished"], false);
    assert!(report["status"].as_str().unwrap().starts_with("suspended"));

    // Closed stdin defers again; the trace grows but stays suspended
    let before = fs::read_to_string(dir.path().join(trace)).unwrap().lines().count();
    let resumed = labflow(dir.path(), &["resume", "demo.yml", trace]);
    assert_eq!(resumed.status.code(), Some(3));
    let after = fs::read_to_string(dir.path().join(trace)).unwrap().lines().count();
    assert_eq!(before, after);
}

#[test]
fn test_rerun_reports_same_path() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "demo.yml", ROUTED);
    labflow(dir.path(), &["run", "demo.yml", "--out-dir", "out"]);

    let rerun = labflow(
        dir.path(),
        &[
            "rerun",
            "demo.yml",
            "out/demo/run_1/trace.jsonl",
            "--out-dir",
            "out",
            "--no-prompt",
        ],
    );
    assert_eq!(rerun.status.code(), Some(0), "{}", stdout(&rerun));
    assert!(stdout(&rerun).contains("Same path as the earlier run"));
    assert!(dir.path().join("out/demo/run_2/trace.jsonl").exists());
}

#[test]
fn test_invalid_config_exits_with_error() {
    let dir = TempDir::new().unwrap();
    write_config(
        &dir,
        "bad.yml",
        "experiment:\n  name: bad\nparts:\n  a:\n    type_name: step.nonexistent\n",
    );

    let output = labflow(dir.path(), &["run", "bad.yml", "--out-dir", "out"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(!dir.path().join("out").exists());
}
