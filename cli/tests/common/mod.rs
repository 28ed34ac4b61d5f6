/// Shared helpers for driving the `quire` binary in a scratch directory
use assert_cmd::Command;
use serde_json::Value;
use std::fs;
use tempfile::TempDir;

pub const REVIEW_LOOP: &str = r#"
type = "review_loop"
name = "Review loop"
initial_step = "draft"

[conditions.draft_saved]
kind = "data_present"
key = "draftPath"
error = "Draft not saved"

[[steps]]
name = "draft"
command = "quire-draft"
postconditions = ["draft_saved"]
next = "review"

[[steps]]
name = "review"
command = "quire-review"
preconditions = ["draft_saved"]
next = { condition = "result.approved == true", on_true = "gate", on_false = "draft", max_iterations = 1 }

[[steps]]
name = "gate"
command = "quire-gate"

[steps.human_gate]
prompt = "Ship it?"
context = ["draftPath"]
options = [
  { label = "Ship", next_step = "publish" },
  { label = "Drop", end = true },
  { label = "Redo", next_step = "draft", requires_input = true },
]

[[steps]]
name = "publish"
command = "quire-publish"
next = { end = true }
"#;

/// A scratch project with `review_loop` installed in its workflow directory.
pub fn project() -> TempDir {
    let dir = tempfile::tempdir().expect("Failed to create temp directory");
    let workflows = dir.path().join("workflows");
    fs::create_dir_all(&workflows).expect("Failed to create workflows directory");
    fs::write(workflows.join("review_loop.toml"), REVIEW_LOOP).expect("Failed to write workflow");
    dir
}

/// `quire` pointed at the project's database, with no ambient overrides.
pub fn quire(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("quire").expect("quire binary");
    cmd.current_dir(dir.path())
        .env_remove("RUST_LOG")
        .env_remove("QUIRE_DATABASE")
        .env_remove("QUIRE_LOG_LEVEL")
        .env("NO_COLOR", "1")
        .env("QUIRE_WORKFLOW_DIRS", dir.path().join("workflows"))
        .arg("--config")
        .arg(dir.path().join("config.toml"))
        .arg("--db")
        .arg(dir.path().join("quire.db"));
    cmd
}

/// Run `quire --json <args>`, expect success and parse stdout.
pub fn quire_json(dir: &TempDir, args: &[&str]) -> Value {
    let output = quire(dir).arg("--json").args(args).output().expect("run quire");
    assert!(
        output.status.success(),
        "quire {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

/// Start a `review_loop` run and return its id.
#[allow(dead_code)]
pub fn start_review_loop(dir: &TempDir, subject: &str) -> String {
    let report = quire_json(dir, &["start", "review_loop", subject]);
    assert_eq!(report["currentStep"], "draft");
    report["runId"].as_str().expect("runId").to_string()
}
