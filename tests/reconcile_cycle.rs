//! End-to-end plan/apply/re-plan cycles against the simulated provider.

use std::sync::Arc;
use std::time::Duration;

use converge::config::ConfigParser;
use converge::error::ProviderError;
use converge::planner::{ActionStatus, ActionType};
use converge::provider::{Provider, SimulatedProvider};
use converge::reconciler::{ApplyOptions, ReconcileContext};
use converge::state::{AppliedState, LocalStateStore, StateStore};
use serde_json::json;
use tempfile::TempDir;

const TWO_NODES: &str = r#"
project:
  name: pair
execution:
  base_delay_ms: 1
  max_delay_ms: 4
resources:
  a:
    type: cluster
    properties:
      name: pair
      version: "1.30"
  b:
    type: addon
    depends_on: [a]
    properties:
      cluster_name: "${a.name}"
      addon_name: snapshot-controller
"#;

fn context(yaml: &str, provider: &Arc<SimulatedProvider>, dir: &TempDir) -> ReconcileContext {
    let spec = ConfigParser::new().parse_yaml(yaml, None).expect("parse");
    let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(dir.path()));
    ReconcileContext::new(spec, Arc::clone(provider) as Arc<dyn Provider>, store).expect("context")
}

fn comparable(state: &AppliedState) -> Vec<(String, serde_json::Value, serde_json::Value)> {
    state
        .resources
        .values()
        .map(|r| {
            (
                r.name.clone(),
                serde_json::to_value(&r.resolved).expect("resolved"),
                serde_json::to_value(&r.properties).expect("properties"),
            )
        })
        .collect()
}

#[tokio::test]
async fn initial_plan_creates_in_order_and_second_plan_is_noop() {
    let dir = TempDir::new().expect("temp dir");
    let provider = Arc::new(SimulatedProvider::new());
    let ctx = context(TWO_NODES, &provider, &dir);

    let plan = ctx.plan(None).await.expect("plan");
    let steps: Vec<(ActionType, &str)> = plan
        .actions
        .iter()
        .map(|a| (a.action_type, a.resource_name.as_str()))
        .collect();
    assert_eq!(steps, vec![(ActionType::Create, "a"), (ActionType::Create, "b")]);

    let report = ctx.apply(&ApplyOptions::default(), |_| true).await.expect("apply");
    assert!(report.failure().is_none());

    let state = ctx.load_state().await.expect("state");
    assert!(state.get("a").is_some());
    assert!(state.get("b").is_some());
    assert_eq!(state.get("b").map(|r| r.resolved["cluster_name"].clone()), Some(json!("pair")));

    let replan = ctx.plan(None).await.expect("replan");
    let kinds: Vec<ActionType> = replan.actions.iter().map(|a| a.action_type).collect();
    assert_eq!(kinds, vec![ActionType::Noop, ActionType::Noop]);

    let again = ctx.apply(&ApplyOptions::default(), |_| true).await.expect("second apply");
    assert!(again.is_noop());
    assert!(again.execution.is_none());
    assert_eq!(provider.call_count("a").await, 1);
}

#[tokio::test]
async fn transient_failures_leave_the_same_state_as_a_clean_run() {
    let clean_dir = TempDir::new().expect("temp dir");
    let clean_provider = Arc::new(SimulatedProvider::new());
    let clean = context(TWO_NODES, &clean_provider, &clean_dir);
    clean.apply(&ApplyOptions::default(), |_| true).await.expect("clean apply");

    let flaky_dir = TempDir::new().expect("temp dir");
    let flaky_provider = Arc::new(SimulatedProvider::new());
    for _ in 0..3 {
        flaky_provider
            .fail_next("b", ProviderError::transient("b", "addon API eventually consistent"))
            .await;
    }
    flaky_provider
        .fail_next(
            "a",
            ProviderError::RateLimited {
                resource: String::from("a"),
                retry_after_secs: Some(0),
            },
        )
        .await;
    let flaky = context(TWO_NODES, &flaky_provider, &flaky_dir);
    let report = flaky.apply(&ApplyOptions::default(), |_| true).await.expect("flaky apply");
    assert!(report.failure().is_none());

    let execution = report.execution.as_ref().expect("executed");
    let attempts = |name: &str| execution.results.iter().find(|r| r.resource_name == name).map(|r| r.attempts);
    assert_eq!(attempts("a"), Some(2));
    assert_eq!(attempts("b"), Some(4));

    let clean_state = clean.load_state().await.expect("clean state");
    let flaky_state = flaky.load_state().await.expect("flaky state");
    assert_eq!(comparable(&clean_state), comparable(&flaky_state));
    assert_eq!(clean_state.spec_hash, flaky_state.spec_hash);
}

#[tokio::test]
async fn permanent_failure_skips_dependents_only() {
    let yaml = format!(
        "{TWO_NODES}  c:\n    type: iam_role\n    properties:\n      assumed_by: \"arn:aws:iam::111122223333:root\"\n"
    );
    let dir = TempDir::new().expect("temp dir");
    let provider = Arc::new(SimulatedProvider::new());
    provider
        .fail_next("a", ProviderError::permanent("a", "unsupported Kubernetes version"))
        .await;
    let ctx = context(&yaml, &provider, &dir);

    let report = ctx.apply(&ApplyOptions::default(), |_| true).await.expect("apply");
    let err = report.failure().expect("partial failure");
    assert_eq!(err.exit_code(), 1);
    assert!(err.to_string().contains("unsupported Kubernetes version"));

    let execution = report.execution.as_ref().expect("executed");
    let status = |name: &str| execution.results.iter().find(|r| r.resource_name == name).map(|r| r.status);
    assert_eq!(status("a"), Some(ActionStatus::Failed));
    assert_eq!(status("b"), Some(ActionStatus::Skipped));
    assert_eq!(status("c"), Some(ActionStatus::Succeeded));

    let retry = ctx.plan(None).await.expect("plan after failure");
    let pending: Vec<&str> = retry
        .actions
        .iter()
        .filter(|a| a.action_type == ActionType::Create)
        .map(|a| a.resource_name.as_str())
        .collect();
    assert_eq!(pending, vec!["a", "b"]);
}

#[tokio::test]
async fn independent_branches_run_concurrently_within_the_bound() {
    let mut yaml = String::from("project:\n  name: wide\nexecution:\n  parallelism: 2\nresources:\n");
    for i in 0..6 {
        yaml.push_str(&format!(
            "  role-{i}:\n    type: iam_role\n    properties:\n      assumed_by: eks.amazonaws.com\n"
        ));
    }
    let dir = TempDir::new().expect("temp dir");
    let provider = Arc::new(SimulatedProvider::new().with_latency(Duration::from_millis(25)));
    let ctx = context(&yaml, &provider, &dir);

    let report = ctx.apply(&ApplyOptions::default(), |_| true).await.expect("apply");
    assert!(report.failure().is_none());
    assert_eq!(provider.peak_concurrency(), 2);
    assert_eq!(provider.resource_count().await, 6);
}

#[tokio::test]
async fn init_template_is_a_valid_stack() {
    let dir = TempDir::new().expect("temp dir");
    let provider = Arc::new(SimulatedProvider::new());
    let ctx = context(include_str!("../templates/converge.yaml"), &provider, &dir);

    let plan = ctx.plan(None).await.expect("plan");
    assert_eq!(plan.count(ActionType::Create), ctx.graph().len());
    assert!(plan.passes_guardrails);

    let report = ctx.apply(&ApplyOptions::default(), |_| true).await.expect("apply");
    assert!(report.failure().is_none(), "{:?}", report.failure());
    assert!(!ctx.plan(None).await.expect("replan").has_changes());
}
