/// Integration tests driving a run through the CLI from start to finish
mod common;

use common::{project, quire, quire_json, start_review_loop};
use predicates::prelude::*;

#[test]
fn test_start_reports_first_step() {
    let dir = project();
    let report = quire_json(&dir, &["start", "review_loop", "book-1"]);

    assert_eq!(report["status"], "running");
    assert_eq!(report["outcome"], "ready");
    assert_eq!(report["step"], "draft");
    assert_eq!(report["command"], "quire-draft");
}

#[test]
fn test_unknown_workflow_fails() {
    let dir = project();
    quire(&dir)
        .args(["start", "no_such_flow", "book-1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Unknown workflow type: no_such_flow"));
}

#[test]
fn test_second_active_run_rejected() {
    let dir = project();
    start_review_loop(&dir, "book-1");

    quire(&dir)
        .args(["start", "review_loop", "book-1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("already has an active run"));
}

#[test]
fn test_full_run_through_gate() {
    let dir = project();
    let run_id = start_review_loop(&dir, "book-1");

    // Claiming completion without the draft fails verification.
    quire(&dir)
        .args(["step", run_id.as_str(), "--complete", "draft"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Draft not saved"));

    let report = quire_json(
        &dir,
        &["step", run_id.as_str(), "--complete", "draft", "--data", "draftPath=drafts/1.md"],
    );
    assert_eq!(report["currentStep"], "review");

    let gated = quire_json(
        &dir,
        &["step", run_id.as_str(), "--complete", "review", "--result", r#"{"approved": true}"#],
    );
    assert_eq!(gated["outcome"], "awaiting_human");
    assert_eq!(gated["status"], "paused");
    assert_eq!(gated["context"]["draftPath"], "drafts/1.md");

    // Status shows the pending gate.
    let summary = quire_json(&dir, &["status", run_id.as_str()]);
    assert_eq!(summary["gate"]["step"], "gate");
    assert_eq!(summary["resume"]["completedSteps"][1], "review");

    quire(&dir)
        .args(["gate", run_id.as_str(), "Redo"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("requires input"));

    quire(&dir)
        .args(["gate", run_id.as_str(), "Maybe"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("valid: Ship, Drop, Redo"));

    let shipped = quire_json(&dir, &["gate", run_id.as_str(), "Ship"]);
    assert_eq!(shipped["currentStep"], "publish");
    assert_eq!(shipped["status"], "running");

    let done = quire_json(&dir, &["step", run_id.as_str(), "--complete", "publish"]);
    assert_eq!(done["outcome"], "completed");
    assert_eq!(done["status"], "completed");

    let events = quire_json(&dir, &["events", run_id.as_str()]);
    let kinds: Vec<&str> = events
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event_type"].as_str().unwrap())
        .collect();
    assert_eq!(kinds.first(), Some(&"started"));
    assert_eq!(kinds.last(), Some(&"completed"));
    assert!(kinds.contains(&"rejected"));
}

#[test]
fn test_rereport_is_harmless() {
    let dir = project();
    let run_id = start_review_loop(&dir, "book-1");
    quire_json(
        &dir,
        &["step", run_id.as_str(), "--complete", "draft", "--data", "draftPath=d.md"],
    );

    let again = quire_json(
        &dir,
        &["step", run_id.as_str(), "--complete", "draft", "--data", "draftPath=d.md"],
    );
    assert_eq!(again["outcome"], "already_advanced");
    assert_eq!(again["currentStep"], "review");
}

#[test]
fn test_loop_escalates_past_bound() {
    let dir = project();
    let run_id = start_review_loop(&dir, "book-1");
    let draft = ["step", run_id.as_str(), "--complete", "draft", "--data", "draftPath=d.md"];
    let reject = ["step", run_id.as_str(), "--complete", "review", "--result", r#"{"approved": false}"#];

    quire_json(&dir, &draft);
    let looped = quire_json(&dir, &reject);
    assert_eq!(looped["currentStep"], "draft");

    quire_json(&dir, &draft);
    quire(&dir)
        .args(reject)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("1 of 1 iterations used"));

    let latest = quire_json(&dir, &["events", run_id.as_str(), "--latest"]);
    assert_eq!(latest[0]["event_type"], "escalated");

    let pending = quire_json(&dir, &["list", "--pending-retries"]);
    assert_eq!(pending[0]["runId"], run_id.as_str());
    assert_eq!(pending[0]["pendingRetry"]["step"], "review");
}

#[test]
fn test_pause_resume_cancel() {
    let dir = project();
    let run_id = start_review_loop(&dir, "book-1");

    let paused = quire_json(&dir, &["pause", run_id.as_str()]);
    assert_eq!(paused["status"], "paused");

    let resumed = quire_json(&dir, &["resume", run_id.as_str()]);
    assert_eq!(resumed["status"], "running");
    assert_eq!(resumed["step"], "draft");

    let cancelled = quire_json(&dir, &["cancel", run_id.as_str()]);
    assert_eq!(cancelled["status"], "failed");

    // A new run may start once the old one is finished.
    start_review_loop(&dir, "book-1");
}

#[test]
fn test_invalid_transition_exit_code() {
    let dir = project();
    let run_id = start_review_loop(&dir, "book-1");
    quire_json(&dir, &["cancel", run_id.as_str()]);

    quire(&dir)
        .args(["resume", run_id.as_str()])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Invalid status transition"))
        .stderr(predicate::str::contains("from 'failed' to 'running'"));

    quire(&dir)
        .args(["cancel", run_id.as_str()])
        .assert()
        .code(2);
}

#[test]
fn test_unknown_run() {
    let dir = project();
    quire(&dir)
        .args(["status", "wfrun_missing"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("wfrun_missing"));
}

#[test]
fn test_list_filters() {
    let dir = project();
    let first = start_review_loop(&dir, "book-1");
    start_review_loop(&dir, "book-2");
    quire_json(&dir, &["pause", first.as_str()]);

    let all = quire_json(&dir, &["list"]);
    assert_eq!(all.as_array().unwrap().len(), 2);

    let paused = quire_json(&dir, &["list", "--status", "paused"]);
    assert_eq!(paused.as_array().unwrap().len(), 1);
    assert_eq!(paused[0]["id"], first.as_str());

    let by_subject = quire_json(&dir, &["list", "--subject", "book-2"]);
    assert_eq!(by_subject[0]["subject_id"], "book-2");

    quire(&dir)
        .args(["list", "--status", "sleeping"])
        .assert()
        .code(1);
}

#[test]
fn test_artifact_registration() {
    let dir = project();
    let run_id = start_review_loop(&dir, "book-1");

    let artifact = quire_json(
        &dir,
        &[
            "register-artifact",
            run_id.as_str(),
            "pdf_draft",
            "out/draft.pdf",
            "--metadata",
            r#"{"pages": 12}"#,
        ],
    );
    assert_eq!(artifact["artifact_type"], "pdf_draft");

    let listed = quire_json(&dir, &["artifacts", run_id.as_str(), "--type", "pdf_draft"]);
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["metadata"]["pages"], 12);

    quire(&dir)
        .args(["register-artifact", run_id.as_str(), "pdf_draft", "  "])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Invalid artifact path"));

    quire(&dir)
        .args(["register-artifact", run_id.as_str(), "poster", "out/poster.png"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("expected one of"));
}

#[test]
fn test_escalation_review_flow() {
    let dir = project();
    let run_id = start_review_loop(&dir, "book-1");
    let draft = ["step", run_id.as_str(), "--complete", "draft", "--data", "draftPath=d.md"];
    let reject = ["step", run_id.as_str(), "--complete", "review", "--result", r#"{"approved": false}"#];

    quire_json(&dir, &draft);
    quire_json(&dir, &reject);
    quire_json(&dir, &draft);
    quire(&dir).args(reject).assert().code(1);

    let pending = quire_json(&dir, &["escalations", "list"]);
    assert_eq!(pending.as_array().unwrap().len(), 1);
    assert_eq!(pending[0]["run_id"], run_id.as_str());
    assert_eq!(pending[0]["step"], "review");
    assert_eq!(pending[0]["kind"], "max_iterations");
    assert_eq!(pending[0]["status"], "pending");
    assert_eq!(pending[0]["escalated_to"], "human-reviewer");
    let escalation_id = pending[0]["id"].as_str().unwrap().to_string();

    let acked = quire_json(&dir, &["escalations", "ack", escalation_id.as_str()]);
    assert_eq!(acked["status"], "acknowledged");
    let none_pending = quire_json(&dir, &["escalations", "list"]);
    assert!(none_pending.as_array().unwrap().is_empty());

    let resolved = quire_json(
        &dir,
        &["escalations", "resolve", escalation_id.as_str(), "Accepted the draft"],
    );
    assert_eq!(resolved["status"], "resolved");
    assert_eq!(resolved["resolution"], "Accepted the draft");

    quire(&dir)
        .args(["escalations", "ack", escalation_id.as_str()])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("cannot become acknowledged"));

    let for_run = quire_json(&dir, &["escalations", "list", "--run", run_id.as_str()]);
    assert_eq!(for_run[0]["status"], "resolved");

    let summary = quire_json(&dir, &["status", run_id.as_str()]);
    assert_eq!(summary["escalations"][0]["id"], escalation_id.as_str());

    quire(&dir)
        .args(["escalations", "resolve", "esc_missing", "n/a"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Escalation not found"));
}
