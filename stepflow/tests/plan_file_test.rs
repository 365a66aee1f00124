//! Loading plans from YAML/JSON files and running them

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use stepflow::action::builtin::builtin_registry;
use stepflow::{
    DependencyGraph, EngineConfig, ExecutionStatus, NoopRecorder, Plan, StepState, TaskRegistry,
};
use tempfile::TempDir;

const REPORT_PLAN: &str = r#"
id: weekly-report
task: Build the weekly report
context:
  team: platform
steps:
  - id: fetch
    action: passthrough
    params:
      rows: 42
    estimated_duration: 2.5
  - id: clean
    action: json.pick
    dependencies: [fetch]
    params:
      input: { rows: 42, junk: true }
      keys: [rows]
    retry:
      max_attempts: 1
      base_delay_seconds: 0
  - id: render
    action: json.merge
    depends_on: [clean, fetch]
    timeout_seconds: 5
"#;

#[test]
fn test_load_yaml_plan() -> Result<()> {
    let temp = TempDir::new()?;
    let path = temp.path().join("report.yaml");
    std::fs::write(&path, REPORT_PLAN)?;

    let plan = Plan::from_file(&path)?;
    assert_eq!(plan.id, "weekly-report");
    assert_eq!(plan.len(), 3);
    assert_eq!(plan.context["team"], json!("platform"));

    let clean = plan.step("clean").unwrap();
    assert!(clean.depends_on.contains("fetch"));
    assert_eq!(clean.retry.max_attempts, 1);

    let render = plan.step("render").unwrap();
    assert_eq!(render.timeout().unwrap().as_secs(), 5);
    assert_eq!(plan.step("fetch").unwrap().retry.max_attempts, 3);

    plan.validate_shape()?;
    let graph = DependencyGraph::from_plan(&plan)?;
    assert_eq!(
        graph.levels()?,
        vec![
            vec!["fetch".to_string()],
            vec!["clean".to_string()],
            vec!["render".to_string()]
        ]
    );
    Ok(())
}

#[test]
fn test_load_json_plan_with_generated_id() -> Result<()> {
    let temp = TempDir::new()?;
    let path = temp.path().join("plan.json");
    std::fs::write(
        &path,
        r#"{"task": "json", "steps": [{"id": "a", "action": "passthrough"}]}"#,
    )?;

    let plan = Plan::from_file(&path)?;
    assert!(plan.id.starts_with("plan-"));
    assert_eq!(plan.steps[0].retry.base_delay_seconds, 1.0);
    Ok(())
}

#[test]
fn test_malformed_plan_file() -> Result<()> {
    let temp = TempDir::new()?;
    let path = temp.path().join("broken.yaml");
    std::fs::write(&path, "steps: [ { id: a ")?;

    assert!(Plan::from_file(&path).is_err());
    assert!(Plan::from_file(&temp.path().join("missing.yaml")).is_err());
    Ok(())
}

#[test]
fn test_shape_validation_rejects_bad_retry() -> Result<()> {
    let plan = Plan::from_yaml_str(
        "steps:\n  - id: a\n    action: passthrough\n    retry: { max_attempts: 0, base_delay_seconds: 1 }\n",
    )?;
    let err = plan.validate_shape().unwrap_err();
    assert!(err.is_invalid_plan());
    Ok(())
}

#[tokio::test]
async fn test_run_loaded_plan() -> Result<()> {
    let plan = Plan::from_yaml_str(REPORT_PLAN)?;
    let engine = TaskRegistry::new(
        EngineConfig::default(),
        Arc::new(builtin_registry()),
        Arc::new(NoopRecorder),
    )?;

    let id = engine.submit(plan).await?;
    let snapshot = engine.wait(&id).await?;
    assert_eq!(snapshot.status, ExecutionStatus::Completed);

    let summary = snapshot.summary();
    assert_eq!(summary.plan_id, "weekly-report");
    assert!(summary.steps.iter().all(|s| s.state == StepState::Completed));
    assert_eq!(summary.results["clean"], json!({"rows": 42}).as_object().unwrap().clone());
    assert_eq!(summary.results["render"]["rows"], json!(42));
    assert!(summary.failed.is_empty());

    engine.shutdown().await;
    Ok(())
}
