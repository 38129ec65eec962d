//! Metrics Integration Tests
//!
//! Extraction must always produce a well-formed record, whatever the run
//! left behind.

use std::path::PathBuf;
use std::time::Duration;

use act::domain::{RunOutcome, RunStatus, Termination};
use act::metrics::{
    collect_run_metrics, load_backend_metrics, load_metrics, save_metrics, usage_from_session,
    GitDiffStats, PlanMetrics,
};
use serde_json::json;
use tempfile::TempDir;

fn write_session(dir: &TempDir, session: serde_json::Value) {
    std::fs::write(
        dir.path().join("opencode_session.json"),
        serde_json::to_string(&session).unwrap(),
    )
    .unwrap();
}

fn outcome(workspace: PathBuf, output: &str) -> RunOutcome {
    RunOutcome {
        run_id: "test-1".to_string(),
        exit_code: 0,
        output: output.to_string(),
        workspace,
        error: None,
        termination: Termination::Exited,
        duration: Duration::from_secs(7),
    }
}

#[test]
fn test_session_tokens_summed_across_messages() {
    let dir = TempDir::new().unwrap();
    write_session(
        &dir,
        json!({
            "info": {},
            "messages": [
                {"info": {"tokens": {"total": 100, "input": 10, "output": 50, "reasoning": 0,
                                     "cache": {"read": 30, "write": 10}}}},
                {"info": {"tokens": {"total": 200, "input": 20, "output": 100, "reasoning": 5,
                                     "cache": {"read": 60, "write": 15}}}}
            ]
        }),
    );

    let usage = usage_from_session(dir.path()).unwrap();
    assert_eq!(usage["total"], 300);
    assert_eq!(usage["input"], 30);
    assert_eq!(usage["output"], 150);
    assert_eq!(usage["reasoning"], 5);
    assert_eq!(usage["cache_read"], 90);
    assert_eq!(usage["cache_write"], 25);
}

#[test]
fn test_messages_without_tokens_are_skipped() {
    let dir = TempDir::new().unwrap();
    write_session(
        &dir,
        json!({
            "messages": [
                {"info": {}},
                {"info": {"tokens": {"total": 50, "input": 10, "output": 40}}},
                {"other": "data"}
            ]
        }),
    );

    let usage = usage_from_session(dir.path()).unwrap();
    assert_eq!(usage["total"], 50);
    assert_eq!(usage["input"], 10);
    assert_eq!(usage["output"], 40);
    assert_eq!(usage["reasoning"], 0);
    assert_eq!(usage["cache_read"], 0);
    assert_eq!(usage["cache_write"], 0);
}

#[test]
fn test_empty_message_list_gives_zeroes() {
    let dir = TempDir::new().unwrap();
    write_session(&dir, json!({"info": {}, "messages": []}));

    let usage = usage_from_session(dir.path()).unwrap();
    assert_eq!(usage.len(), 6);
    assert!(usage.values().all(|&count| count == 0));
}

#[test]
fn test_missing_or_malformed_inputs_are_empty() {
    let dir = TempDir::new().unwrap();
    assert!(usage_from_session(dir.path()).is_none());
    assert!(load_backend_metrics(dir.path()).is_empty());

    std::fs::write(dir.path().join("opencode_session.json"), "broken").unwrap();
    std::fs::write(dir.path().join("metrics.json"), "not json{{{").unwrap();
    assert!(usage_from_session(dir.path()).is_none());
    assert!(load_backend_metrics(dir.path()).is_empty());
}

#[test]
fn test_backend_metrics_fallback_location() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join(".benchmark")).unwrap();
    std::fs::write(
        dir.path().join(".benchmark/metrics.json"),
        r#"{"duration_seconds": 12}"#,
    )
    .unwrap();

    let metrics = load_backend_metrics(dir.path());
    assert_eq!(metrics["duration_seconds"], 12);
}

#[tokio::test]
async fn test_collect_reads_duration_and_session() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("metrics.json"), r#"{"duration_seconds": 120}"#).unwrap();
    write_session(
        &dir,
        json!({"messages": [{"info": {"tokens": {"total": 500, "input": 100, "output": 300,
                                                  "reasoning": 10, "cache": {"read": 70, "write": 20}}}}]}),
    );

    let metrics = collect_run_metrics(
        "agent-a",
        &outcome(dir.path().to_path_buf(), "input_tokens: 1"),
        RunStatus::Completed,
    )
    .await;

    assert_eq!(metrics.agent_id, "agent-a");
    assert_eq!(metrics.duration_seconds, 120.0);
    assert_eq!(metrics.token_usage["total"], 500);
    assert_eq!(metrics.token_usage["cache_read"], 70);
    assert!(!metrics.token_usage.contains_key("input_tokens"));
}

#[tokio::test]
async fn test_collect_on_broken_workspace_is_well_formed() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("metrics.json"), "[1, 2").unwrap();
    std::fs::write(dir.path().join("opencode_session.json"), "{").unwrap();

    let mut failed = outcome(dir.path().to_path_buf(), "");
    failed.exit_code = 1;
    failed.error = Some("timeout".to_string());
    failed.termination = Termination::TimedOut;

    let metrics = collect_run_metrics("agent-a", &failed, RunStatus::Failed).await;

    assert_eq!(metrics.duration_seconds, 7.0);
    assert!(metrics.token_usage.is_empty());
    assert!(!metrics.has_commits);
    assert_eq!(metrics.git_diff, GitDiffStats::default());
    assert_eq!(metrics.plan, PlanMetrics::default());
    assert_eq!(metrics.error.as_deref(), Some("timeout"));
    assert_eq!(metrics.termination, Termination::TimedOut);
}

#[tokio::test]
async fn test_collect_on_deleted_workspace() {
    let dir = TempDir::new().unwrap();
    let gone = dir.path().join("never-created");

    let metrics = collect_run_metrics("agent-a", &outcome(gone, ""), RunStatus::Cancelled).await;
    assert_eq!(metrics.status, RunStatus::Cancelled);
    assert!(metrics.token_usage.is_empty());
}

#[tokio::test]
async fn test_saved_metrics_schema() {
    let dir = TempDir::new().unwrap();
    let metrics = collect_run_metrics(
        "agent-a",
        &outcome(dir.path().to_path_buf(), "total_tokens: 9"),
        RunStatus::Completed,
    )
    .await;

    let path = dir.path().join("out/test-1/metrics.json");
    save_metrics(&metrics, &path).unwrap();

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    for key in [
        "run_id",
        "agent_id",
        "status",
        "exit_code",
        "duration_seconds",
        "has_commits",
        "git_diff",
        "plan",
        "token_usage",
        "error",
    ] {
        assert!(raw.get(key).is_some(), "missing {}", key);
    }
    assert_eq!(raw["status"], "completed");
    assert_eq!(raw["token_usage"]["total_tokens"], 9);
    assert_eq!(load_metrics(&path).unwrap(), metrics);
}
