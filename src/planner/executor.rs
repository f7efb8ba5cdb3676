//! Plan executor.
//!
//! Actions run on a bounded pool of tokio tasks. An action is dispatched once
//! every action it waits on has succeeded; if one of them failed, it is
//! skipped instead. Each successful action is committed to state before its
//! dependents can start.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, ExecutionConfig, Properties};
use crate::error::{ApplyError, ConvergeError, PlanError, Result, StateError};
use crate::graph::{resolve_properties, Reference};
use crate::provider::{Provider, ProvisionedResource, ResourceRequest};
use crate::resource::Handler;
use crate::state::{AppliedResource, StateHandle};

use super::plan::{ActionType, Plan, PlannedAction};
use super::retry::RetryPolicy;

/// Executor for change plans.
pub struct PlanExecutor {
    provider: Arc<dyn Provider>,
    retry: RetryPolicy,
    parallelism: usize,
    timeout: Option<Duration>,
    cancel: CancellationToken,
    ignore_guardrails: bool,
}

/// Final status of one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Applied and committed to state.
    Succeeded,
    /// Failed permanently or ran out of retries.
    Failed,
    /// Not attempted because something it waits on did not succeed.
    Skipped,
    /// Not dispatched before the run was cancelled.
    Cancelled,
}

/// Result of executing a single action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    /// Index of the action in the plan.
    pub index: usize,
    /// Logical name.
    pub resource_name: String,
    /// Action type.
    pub action_type: ActionType,
    /// Final status.
    pub status: ActionStatus,
    /// Provider calls made, retries included.
    pub attempts: u32,
    /// Physical id after the action, if the resource exists.
    pub physical_id: Option<String>,
    /// Error or skip reason.
    pub error: Option<String>,
}

/// Result of executing the entire plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Per-action results in plan order.
    pub results: Vec<ActionResult>,
    /// Number of successful actions.
    pub succeeded: usize,
    /// Number of failed actions.
    pub failed: usize,
    /// Number of skipped actions.
    pub skipped: usize,
    /// Number of cancelled actions.
    pub cancelled: usize,
    /// Why the run was cancelled, if it was.
    pub cancel_reason: Option<String>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

/// Everything a spawned action needs.
#[derive(Clone)]
struct ActionContext {
    provider: Arc<dyn Provider>,
    state: StateHandle,
    retry: RetryPolicy,
    hasher: ConfigHasher,
}

impl PlanExecutor {
    /// Creates an executor with default settings.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self::with_config(provider, &ExecutionConfig::default())
    }

    /// Creates an executor from execution settings.
    #[must_use]
    pub fn with_config(provider: Arc<dyn Provider>, config: &ExecutionConfig) -> Self {
        Self {
            provider,
            retry: RetryPolicy::from(config),
            parallelism: config.parallelism.max(1),
            timeout: config.timeout_secs.map(Duration::from_secs),
            cancel: CancellationToken::new(),
            ignore_guardrails: false,
        }
    }

    /// Uses an external cancellation token (e.g. wired to Ctrl-C).
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Applies plans that violate guardrails instead of refusing them.
    #[must_use]
    pub const fn with_guardrail_override(mut self, ignore: bool) -> Self {
        self.ignore_guardrails = ignore;
        self
    }

    /// Executes a plan, committing each successful action to `state`.
    ///
    /// Action failures do not make this return an error; inspect the result.
    ///
    /// # Errors
    ///
    /// Returns `GuardrailViolation` if the plan breaks a guardrail and no
    /// override was given. Nothing is executed in that case.
    pub async fn execute(&self, plan: &Plan, state: &StateHandle) -> Result<ExecutionResult> {
        if !plan.passes_guardrails {
            if !self.ignore_guardrails {
                error!("Plan does not pass guardrails");
                return Err(PlanError::GuardrailViolation {
                    violations: plan.guardrail_violations.clone(),
                }
                .into());
            }
            for violation in &plan.guardrail_violations {
                warn!("Ignoring guardrail violation: {violation}");
            }
        }

        let started = Instant::now();
        info!("Executing plan with {} actions (parallelism {})", plan.actions.len(), self.parallelism);

        let cancel = self.cancel.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));
        let timer = self.timeout.map(|timeout| {
            let cancel = cancel.clone();
            let timed_out = Arc::clone(&timed_out);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                timed_out.store(true, Ordering::SeqCst);
                cancel.cancel();
            })
        });

        let ctx = ActionContext {
            provider: Arc::clone(&self.provider),
            state: state.clone(),
            retry: self.retry,
            hasher: ConfigHasher::new(),
        };
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut tasks: JoinSet<ActionResult> = JoinSet::new();
        let mut task_index: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut results: Vec<Option<ActionResult>> = plan.actions.iter().map(|_| None).collect();
        let mut dispatched = vec![false; plan.actions.len()];

        loop {
            settle(plan, &mut results, &dispatched);

            if !cancel.is_cancelled() {
                for (index, action) in plan.actions.iter().enumerate() {
                    if dispatched[index] || results[index].is_some() || !dependencies_succeeded(action, &results) {
                        continue;
                    }
                    dispatched[index] = true;
                    debug!("Dispatching {}", action.description());
                    let handle = tasks.spawn(ctx.clone().run(
                        index,
                        action.clone(),
                        Arc::clone(&semaphore),
                        cancel.clone(),
                    ));
                    task_index.insert(handle.id(), index);
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok(result) => {
                    log_result(&result);
                    let index = result.index;
                    results[index] = Some(result);
                }
                Err(join_err) => {
                    error!("Action task failed to complete: {join_err}");
                    if let Some(&index) = task_index.get(&join_err.id()) {
                        results[index] = Some(ActionResult::finished(
                            index,
                            &plan.actions[index],
                            ActionStatus::Failed,
                            0,
                            Some(format!("task aborted: {join_err}")),
                        ));
                    }
                }
            }
        }

        if let Some(timer) = timer {
            timer.abort();
        }

        let cancel_reason = if timed_out.load(Ordering::SeqCst) {
            self.timeout.map(|t| format!("timed out after {}s", t.as_secs()))
        } else if cancel.is_cancelled() {
            Some(String::from("interrupted"))
        } else {
            None
        };

        let results: Vec<ActionResult> = results
            .into_iter()
            .enumerate()
            .map(|(index, result)| {
                result.unwrap_or_else(|| {
                    ActionResult::finished(
                        index,
                        &plan.actions[index],
                        ActionStatus::Cancelled,
                        0,
                        Some(cancel_reason.clone().unwrap_or_else(|| String::from("not dispatched"))),
                    )
                })
            })
            .collect();

        let count = |status: ActionStatus| results.iter().filter(|r| r.status == status).count();
        let result = ExecutionResult {
            succeeded: count(ActionStatus::Succeeded),
            failed: count(ActionStatus::Failed),
            skipped: count(ActionStatus::Skipped),
            cancelled: count(ActionStatus::Cancelled),
            cancel_reason,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            results,
        };

        info!(
            "Plan executed: {} succeeded, {} failed, {} skipped, {} cancelled",
            result.succeeded, result.failed, result.skipped, result.cancelled
        );

        Ok(result)
    }
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("provider", &self.provider.provider_name())
            .field("retry", &self.retry)
            .field("parallelism", &self.parallelism)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Resolves noops and skips until nothing changes.
fn settle(plan: &Plan, results: &mut [Option<ActionResult>], dispatched: &[bool]) {
    loop {
        let mut changed = false;
        for (index, action) in plan.actions.iter().enumerate() {
            if dispatched[index] || results[index].is_some() {
                continue;
            }

            let blocked_by = action.dependencies.iter().find_map(|&dep| {
                results
                    .get(dep)
                    .and_then(Option::as_ref)
                    .filter(|r| r.status != ActionStatus::Succeeded)
                    .map(|r| r.resource_name.clone())
            });

            if let Some(blocker) = blocked_by {
                warn!("Skipping {} because {blocker} did not succeed", action.resource_name);
                results[index] = Some(ActionResult::finished(
                    index,
                    action,
                    ActionStatus::Skipped,
                    0,
                    Some(format!("dependency '{blocker}' did not succeed")),
                ));
                changed = true;
            } else if action.action_type == ActionType::Noop && dependencies_succeeded(action, results) {
                results[index] = Some(ActionResult::finished(index, action, ActionStatus::Succeeded, 0, None));
                changed = true;
            }
        }
        if !changed {
            return;
        }
    }
}

fn dependencies_succeeded(action: &PlannedAction, results: &[Option<ActionResult>]) -> bool {
    action.dependencies.iter().all(|&dep| {
        results
            .get(dep)
            .and_then(Option::as_ref)
            .is_some_and(|r| r.status == ActionStatus::Succeeded)
    })
}

fn log_result(result: &ActionResult) {
    match (result.status, &result.error) {
        (ActionStatus::Succeeded, _) => info!(
            "{} {} succeeded after {} attempt(s)",
            result.action_type, result.resource_name, result.attempts
        ),
        (ActionStatus::Failed, Some(message)) => error!("{} {} failed: {message}", result.action_type, result.resource_name),
        (status, _) => debug!("{} {}: {status:?}", result.action_type, result.resource_name),
    }
}

impl ActionContext {
    /// Waits for a worker slot, then applies the action.
    async fn run(
        self,
        index: usize,
        action: PlannedAction,
        semaphore: Arc<Semaphore>,
        cancel: CancellationToken,
    ) -> ActionResult {
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return ActionResult::finished(index, &action, ActionStatus::Cancelled, 0, Some(String::from("cancelled before start")));
            }
            permit = semaphore.acquire_owned() => permit,
        };
        let Ok(_permit) = permit else {
            return ActionResult::finished(index, &action, ActionStatus::Failed, 0, Some(String::from("worker pool closed")));
        };

        let mut attempts = 0;
        match self.apply(&action, &mut attempts).await {
            Ok(physical_id) => ActionResult {
                physical_id,
                ..ActionResult::finished(index, &action, ActionStatus::Succeeded, attempts, None)
            },
            Err(e) => ActionResult::finished(index, &action, ActionStatus::Failed, attempts, Some(e.to_string())),
        }
    }

    async fn apply(&self, action: &PlannedAction, attempts: &mut u32) -> Result<Option<String>> {
        match action.action_type {
            ActionType::Noop => Ok(action.physical_id.clone()),
            ActionType::Create | ActionType::Update => {
                let resolved = self.resolve(action).await?;
                self.provision(action, resolved, action.physical_id.as_deref(), attempts).await.map(Some)
            }
            ActionType::Replace => {
                let resolved = self.resolve(action).await?;
                self.provision(action, resolved, None, attempts).await.map(Some)
            }
            ActionType::Delete | ActionType::Teardown => {
                self.delete(action, attempts).await?;
                Ok(None)
            }
            ActionType::Relink => self.relink(action).await.map(Some),
        }
    }

    /// Records new dependency edges for a resource the provider need not see.
    async fn relink(&self, action: &PlannedAction) -> Result<String> {
        let name = action.resource_name.as_str();
        let physical_id = self
            .state
            .commit(|state| {
                let mut resource = state.get(name).cloned()?;
                resource.dependencies.clone_from(&action.depends_on);
                resource.updated_at = Utc::now();
                let physical_id = resource.physical_id.clone();
                state.record(resource);
                Some(physical_id)
            })
            .await?;

        physical_id.ok_or_else(|| {
            StateError::ResourceNotTracked {
                name: name.to_string(),
            }
            .into()
        })
    }

    /// Substitutes references with the outputs applied so far.
    async fn resolve(&self, action: &PlannedAction) -> Result<Properties> {
        let resolved = self
            .state
            .read(|state| {
                resolve_properties(&action.properties, &|reference: &Reference| {
                    state.lookup_output(&reference.target, &reference.attribute)
                })
            })
            .await;

        resolved.map_err(|reference| {
            PlanError::DependencyResolutionFailed {
                resource: action.resource_name.clone(),
                message: format!("{reference} has no applied value"),
            }
            .into()
        })
    }

    /// Creates (no `existing` id) or updates the resource, then records it.
    async fn provision(
        &self,
        action: &PlannedAction,
        resolved: Properties,
        existing: Option<&str>,
        attempts: &mut u32,
    ) -> Result<String> {
        let provisioned = if action.resource_type.ops().handler == Handler::Local {
            local_outputs(action, &resolved)
        } else {
            let request = ResourceRequest {
                name: action.resource_name.clone(),
                resource_type: action.resource_type,
                properties: resolved.clone(),
            };
            let provider = self.provider.as_ref();
            let request = &request;
            let (result, calls) = match existing {
                Some(physical_id) => self.retry.run(&action.resource_name, move || provider.update(physical_id, request)).await,
                None => self.retry.run(&action.resource_name, move || provider.create(request)).await,
            };
            *attempts += calls;
            result?
        };

        let properties_hash = action
            .new_hash
            .clone()
            .unwrap_or_else(|| self.hasher.hash_properties(&action.properties));
        let physical_id = provisioned.id.clone();

        self.state
            .commit(|state| {
                let now = Utc::now();
                let created_at = state.get(&action.resource_name).map_or(now, |r| r.created_at);
                state.record(AppliedResource {
                    name: action.resource_name.clone(),
                    resource_type: action.resource_type,
                    physical_id: provisioned.id,
                    properties: action.properties.clone(),
                    resolved,
                    outputs: provisioned.outputs,
                    dependencies: action.depends_on.clone(),
                    properties_hash,
                    created_at,
                    updated_at: now,
                });
            })
            .await?;

        Ok(physical_id)
    }

    /// Deletes the resource; one that is already gone counts as deleted.
    async fn delete(&self, action: &PlannedAction, attempts: &mut u32) -> Result<()> {
        let name = action.resource_name.as_str();

        if let (Some(physical_id), Handler::Remote) = (action.physical_id.as_deref(), action.resource_type.ops().handler) {
            let provider = self.provider.as_ref();
            let resource_type = action.resource_type;
            let (result, calls) = self
                .retry
                .run(name, move || async move {
                    match provider.delete(resource_type, name, physical_id).await {
                        Err(e) if e.is_not_found() => {
                            debug!("{name} ({physical_id}) already gone");
                            Ok(())
                        }
                        other => other,
                    }
                })
                .await;
            *attempts += calls;
            result?;
        }

        self.state
            .commit(|state| {
                state.remove(name);
            })
            .await
    }
}

/// Outputs of a resource materialised without a provider call.
fn local_outputs(action: &PlannedAction, resolved: &Properties) -> ProvisionedResource {
    let outputs = action
        .resource_type
        .ops()
        .exports
        .iter()
        .filter_map(|attribute| resolved.get(*attribute).map(|v| ((*attribute).to_string(), v.clone())))
        .collect();

    ProvisionedResource {
        id: action
            .physical_id
            .clone()
            .unwrap_or_else(|| format!("local-{}", action.resource_name)),
        outputs,
    }
}

impl ActionResult {
    fn finished(index: usize, action: &PlannedAction, status: ActionStatus, attempts: u32, error: Option<String>) -> Self {
        Self {
            index,
            resource_name: action.resource_name.clone(),
            action_type: action.action_type,
            status,
            attempts,
            physical_id: action.physical_id.clone(),
            error,
        }
    }
}

impl ExecutionResult {
    /// Returns true if every action succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0 && self.cancelled == 0
    }

    /// Names of resources whose action changed something.
    #[must_use]
    pub fn changed_resources(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for result in &self.results {
            if result.status == ActionStatus::Succeeded
                && result.action_type != ActionType::Noop
                && !names.contains(&result.resource_name)
            {
                names.push(result.resource_name.clone());
            }
        }
        names
    }

    /// Converts an unsuccessful run into an error.
    #[must_use]
    pub fn failure(&self) -> Option<ConvergeError> {
        if self.failed > 0 || self.skipped > 0 {
            let first_failure = self
                .results
                .iter()
                .find(|r| r.status == ActionStatus::Failed)
                .map_or_else(
                    || String::from("none"),
                    |r| format!("{}: {}", r.resource_name, r.error.as_deref().unwrap_or("unknown error")),
                );
            return Some(
                ApplyError::ActionsFailed {
                    failed: self.failed,
                    skipped: self.skipped,
                    first_failure,
                }
                .into(),
            );
        }
        if self.cancelled > 0 {
            return Some(
                ApplyError::Cancelled {
                    reason: self.cancel_reason.clone().unwrap_or_else(|| String::from("cancelled")),
                }
                .into(),
            );
        }
        None
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} succeeded, {} failed, {} skipped, {} cancelled in {}ms",
            self.succeeded, self.failed, self.skipped, self.cancelled, self.duration_ms
        )?;
        for result in self.results.iter().filter(|r| r.action_type != ActionType::Noop) {
            write!(f, "  {} {}: {}", result.action_type, result.resource_name, result.status)?;
            if let Some(error) = &result.error {
                write!(f, " ({error})")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::error::ProviderError;
    use crate::graph::{GraphBuilder, ResourceGraph};
    use crate::planner::DiffEngine;
    use crate::provider::SimulatedProvider;
    use crate::state::{AppliedState, LocalStateStore, StateStore};
    use serde_json::json;
    use tempfile::TempDir;

    const STACK: &str = r#"
project:
  name: eks-sandbox
resources:
  cluster:
    type: cluster
    properties:
      name: eks-sandbox
      version: "1.30"
  ebs-role:
    type: iam_role
    properties:
      assumed_by: "${cluster.oidc_provider_arn}"
  ebs-driver:
    type: addon
    properties:
      cluster_name: "${cluster.name}"
      addon_name: aws-ebs-csi-driver
      service_account_role_arn: "${ebs-role.arn}"
  endpoint:
    type: output
    properties:
      value: "${cluster.endpoint}"
"#;

    struct Harness {
        provider: Arc<SimulatedProvider>,
        state: StateHandle,
        _temp: TempDir,
    }

    fn harness(provider: SimulatedProvider) -> Harness {
        let temp = TempDir::new().expect("temp dir");
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(temp.path()));
        Harness {
            provider: Arc::new(provider),
            state: StateHandle::new(AppliedState::new("eks-sandbox", "dev"), store),
            _temp: temp,
        }
    }

    fn graph(yaml: &str) -> ResourceGraph {
        let spec = ConfigParser::new().parse_yaml(yaml, None).expect("parse");
        GraphBuilder::new().build(&spec).expect("graph")
    }

    async fn plan_for(graph: &ResourceGraph, state: &StateHandle) -> Plan {
        let snapshot = state.snapshot().await;
        let diff = DiffEngine::new().compute_diff(graph, &snapshot);
        Plan::from_diff(&diff, graph, &snapshot, None, "hash")
    }

    fn executor(provider: &Arc<SimulatedProvider>) -> PlanExecutor {
        let config = ExecutionConfig {
            base_delay_ms: 1,
            max_delay_ms: 2,
            ..ExecutionConfig::default()
        };
        PlanExecutor::with_config(Arc::clone(provider) as Arc<dyn Provider>, &config)
    }

    #[tokio::test]
    async fn test_apply_resolves_references_and_commits_state() {
        let h = harness(SimulatedProvider::new());
        let graph = graph(STACK);
        let plan = plan_for(&graph, &h.state).await;

        let result = executor(&h.provider).execute(&plan, &h.state).await.expect("execute");
        assert!(result.is_success(), "{result}");
        assert_eq!(result.succeeded, 4);

        let state = h.state.snapshot().await;
        let driver = state.get("ebs-driver").expect("driver applied");
        assert_eq!(driver.resolved["cluster_name"], json!("eks-sandbox"));
        assert_eq!(driver.properties["cluster_name"], json!("${cluster.name}"));
        assert_eq!(
            driver.resolved["service_account_role_arn"],
            state.lookup_output("ebs-role", "arn").expect("role arn")
        );

        let endpoint = state.get("endpoint").expect("output applied");
        assert_eq!(endpoint.outputs["value"], state.lookup_output("cluster", "endpoint").expect("endpoint"));
        assert_eq!(h.provider.resource_count().await, 3);

        let replan = plan_for(&graph, &h.state).await;
        assert!(!replan.has_changes());
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_and_keeps_independent_branches() {
        let h = harness(SimulatedProvider::new());
        h.provider
            .fail_next("ebs-role", ProviderError::permanent("ebs-role", "trust policy rejected"))
            .await;
        let graph = graph(STACK);
        let plan = plan_for(&graph, &h.state).await;

        let result = executor(&h.provider).execute(&plan, &h.state).await.expect("execute");
        let status = |name: &str| {
            result
                .results
                .iter()
                .find(|r| r.resource_name == name)
                .map(|r| r.status)
                .expect("result")
        };
        assert_eq!(status("cluster"), ActionStatus::Succeeded);
        assert_eq!(status("ebs-role"), ActionStatus::Failed);
        assert_eq!(status("ebs-driver"), ActionStatus::Skipped);
        assert_eq!(status("endpoint"), ActionStatus::Succeeded);
        assert!(matches!(result.failure(), Some(ConvergeError::Apply(ApplyError::ActionsFailed { failed: 1, skipped: 1, .. }))));

        let state = h.state.snapshot().await;
        assert!(state.get("ebs-role").is_none());
        assert!(state.get("cluster").is_some());
        assert_eq!(h.provider.call_count("ebs-driver").await, 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let h = harness(SimulatedProvider::new());
        for _ in 0..2 {
            h.provider.fail_next("cluster", ProviderError::transient("cluster", "throttled")).await;
        }
        let graph = graph(STACK);
        let plan = plan_for(&graph, &h.state).await;

        let result = executor(&h.provider).execute(&plan, &h.state).await.expect("execute");
        assert!(result.is_success());
        assert_eq!(result.results[0].attempts, 3);
        assert_eq!(h.provider.call_count("cluster").await, 3);
    }

    #[tokio::test]
    async fn test_replace_deletes_then_creates() {
        let h = harness(SimulatedProvider::new());
        let before = graph(STACK);
        let plan = plan_for(&before, &h.state).await;
        executor(&h.provider).execute(&plan, &h.state).await.expect("first apply");
        let old_id = h.state.snapshot().await.get("ebs-driver").map(|r| r.physical_id.clone()).expect("id");

        let after = graph(&STACK.replace("addon_name: aws-ebs-csi-driver", "addon_name: aws-efs-csi-driver"));
        let plan = plan_for(&after, &h.state).await;
        assert_eq!(plan.count(ActionType::Replace), 1);
        assert_eq!(plan.count(ActionType::Teardown), 1);

        let result = executor(&h.provider).execute(&plan, &h.state).await.expect("replace");
        assert!(result.is_success(), "{result}");
        let new_id = h.state.snapshot().await.get("ebs-driver").map(|r| r.physical_id.clone()).expect("id");
        assert_ne!(old_id, new_id);
        assert_eq!(h.provider.resource_count().await, 3);
    }

    #[tokio::test]
    async fn test_replacement_tears_down_dependents_first() {
        let h = harness(SimulatedProvider::new());
        let plan = plan_for(&graph(STACK), &h.state).await;
        executor(&h.provider).execute(&plan, &h.state).await.expect("first apply");
        let old_cluster = h.provider.find("cluster").await.map(|r| r.id).expect("cluster");

        let renamed = graph(&STACK.replace("name: eks-sandbox\n      version", "name: eks-renamed\n      version"));
        let plan = plan_for(&renamed, &h.state).await;
        assert_eq!(plan.count(ActionType::Teardown), 2);
        h.provider
            .fail_next("ebs-driver", ProviderError::permanent("ebs-driver", "delete refused"))
            .await;

        let result = executor(&h.provider).execute(&plan, &h.state).await.expect("execute");
        let status = |kind: ActionType, name: &str| {
            result
                .results
                .iter()
                .find(|r| r.action_type == kind && r.resource_name == name)
                .map(|r| r.status)
                .expect("result")
        };
        assert_eq!(status(ActionType::Teardown, "ebs-driver"), ActionStatus::Failed);
        assert_eq!(status(ActionType::Teardown, "cluster"), ActionStatus::Skipped);
        assert_eq!(status(ActionType::Replace, "cluster"), ActionStatus::Skipped);
        assert_eq!(h.provider.find("cluster").await.map(|r| r.id), Some(old_cluster.clone()));
        let state = h.state.snapshot().await;
        assert_eq!(state.get("cluster").map(|r| r.physical_id.clone()), Some(old_cluster.clone()));
        assert!(state.get("ebs-driver").is_some());

        let plan = plan_for(&renamed, &h.state).await;
        let result = executor(&h.provider).execute(&plan, &h.state).await.expect("retry");
        assert!(result.is_success(), "{result}");
        let driver = h.provider.find("ebs-driver").await.expect("driver");
        assert_eq!(driver.properties.get("cluster_name"), Some(&json!("eks-renamed")));
        assert_ne!(h.provider.find("cluster").await.map(|r| r.id), Some(old_cluster));
        assert_eq!(h.provider.resource_count().await, 3);
        assert_eq!(result.changed_resources().len(), 4);
    }

    #[tokio::test]
    async fn test_guardrails_block_execution() {
        let h = harness(SimulatedProvider::new());
        let mut plan = plan_for(&graph(STACK), &h.state).await;
        plan.passes_guardrails = false;
        plan.guardrail_violations = vec![String::from("too many deletes")];

        let err = executor(&h.provider).execute(&plan, &h.state).await.expect_err("blocked");
        assert_eq!(err.exit_code(), 2);
        assert_eq!(h.provider.resource_count().await, 0);

        let result = executor(&h.provider)
            .with_guardrail_override(true)
            .execute(&plan, &h.state)
            .await
            .expect("override");
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_cancelled_run_dispatches_nothing() {
        let h = harness(SimulatedProvider::new());
        let plan = plan_for(&graph(STACK), &h.state).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = executor(&h.provider)
            .with_cancellation(cancel)
            .execute(&plan, &h.state)
            .await
            .expect("execute");
        assert_eq!(result.cancelled, 4);
        assert!(matches!(result.failure(), Some(ConvergeError::Apply(ApplyError::Cancelled { .. }))));
        assert_eq!(h.provider.resource_count().await, 0);
    }

    fn statuses(result: &ExecutionResult) -> HashMap<&str, ActionStatus> {
        result.results.iter().map(|r| (r.resource_name.as_str(), r.status)).collect()
    }

    #[tokio::test]
    async fn test_interrupt_lets_in_flight_actions_finish() {
        let h = harness(SimulatedProvider::new().with_latency(Duration::from_millis(150)));
        let plan = plan_for(&graph(STACK), &h.state).await;
        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            interrupt.cancel();
        });

        let result = executor(&h.provider)
            .with_cancellation(cancel)
            .execute(&plan, &h.state)
            .await
            .expect("execute");

        let status = statuses(&result);
        assert_eq!(status["cluster"], ActionStatus::Succeeded);
        assert_eq!(status["ebs-role"], ActionStatus::Cancelled);
        assert_eq!(status["ebs-driver"], ActionStatus::Cancelled);
        assert_eq!(status["endpoint"], ActionStatus::Cancelled);
        assert_eq!(result.cancel_reason.as_deref(), Some("interrupted"));
        assert!(matches!(result.failure(), Some(ConvergeError::Apply(ApplyError::Cancelled { .. }))));

        let state = h.state.snapshot().await;
        assert_eq!(state.resource_names(), vec!["cluster"]);
        assert_eq!(h.provider.call_count("ebs-role").await, 0);
    }

    #[tokio::test]
    async fn test_timeout_stops_dispatch_after_first_wave() {
        let h = harness(SimulatedProvider::new().with_latency(Duration::from_millis(1300)));
        let plan = plan_for(&graph(STACK), &h.state).await;
        let config = ExecutionConfig {
            timeout_secs: Some(1),
            ..ExecutionConfig::default()
        };

        let result = PlanExecutor::with_config(Arc::clone(&h.provider) as Arc<dyn Provider>, &config)
            .execute(&plan, &h.state)
            .await
            .expect("execute");

        let status = statuses(&result);
        assert_eq!(status["cluster"], ActionStatus::Succeeded);
        assert_eq!(result.cancelled, 3);
        assert_eq!(result.cancel_reason.as_deref(), Some("timed out after 1s"));
        assert!(h.state.snapshot().await.get("cluster").is_some());
        assert_eq!(h.provider.resource_count().await, 1);
    }

    #[tokio::test]
    async fn test_relink_updates_state_without_provider_calls() {
        let h = harness(SimulatedProvider::new());
        let graph = graph(STACK);
        let plan = plan_for(&graph, &h.state).await;
        executor(&h.provider).execute(&plan, &h.state).await.expect("apply");
        h.state
            .commit(|state| {
                if let Some(driver) = state.resources.get_mut("ebs-driver") {
                    driver.dependencies = vec![String::from("cluster")];
                }
            })
            .await
            .expect("age dependencies");

        let plan = plan_for(&graph, &h.state).await;
        assert_eq!(plan.action_types().iter().filter(|t| **t == ActionType::Relink).count(), 1);
        let result = executor(&h.provider).execute(&plan, &h.state).await.expect("relink");
        assert!(result.is_success(), "{result}");

        assert_eq!(h.provider.call_count("ebs-driver").await, 1);
        let state = h.state.snapshot().await;
        let driver = state.get("ebs-driver").expect("driver");
        assert_eq!(driver.dependencies, vec![String::from("cluster"), String::from("ebs-role")]);
        assert!(!plan_for(&graph, &h.state).await.has_changes());
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let h = harness(SimulatedProvider::new().with_latency(Duration::from_millis(20)));
        let yaml = (0..8).fold(String::from("project:\n  name: wide\nresources:\n"), |mut acc, i| {
            acc.push_str(&format!("  role-{i}:\n    type: iam_role\n    properties:\n      assumed_by: eks.amazonaws.com\n"));
            acc
        });
        let plan = plan_for(&graph(&yaml), &h.state).await;

        let config = ExecutionConfig {
            parallelism: 3,
            ..ExecutionConfig::default()
        };
        let result = PlanExecutor::with_config(Arc::clone(&h.provider) as Arc<dyn Provider>, &config)
            .execute(&plan, &h.state)
            .await
            .expect("execute");

        assert_eq!(result.succeeded, 8);
        assert!(h.provider.peak_concurrency() <= 3);
        assert!(h.provider.peak_concurrency() >= 2);
    }
}
