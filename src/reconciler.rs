//! Reconciliation loop.
//!
//! [`ReconcileContext`] threads the spec, its resource graph, the provider
//! and the state store through every stage. Nothing here is global: tests
//! build a context around a simulated provider and a temporary state
//! directory, the CLI builds one from the spec file.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{
    ConfigHasher, ConfigParser, ConfigValidator, Properties, ProviderConfig, ProviderKind, StackSpec, StateBackend,
    StateConfig,
};
use crate::error::{ConfigError, ConvergeError, Result, StateError};
use crate::graph::{GraphBuilder, ResourceGraph};
use crate::planner::{DiffEngine, ExecutionResult, Plan, PlanExecutor};
use crate::provider::{HttpProvider, Provider, SimulatedProvider};
use crate::resource::{Handler, ResourceType};
use crate::state::{
    generate_holder_id, load_or_new, with_session, AppliedResource, AppliedState, HistoryEntry, LocalStateStore,
    Operation, S3StateStore, StateStore, STATE_DIR,
};

/// File backing the simulated provider when none is configured.
const SIMULATED_PROVIDER_FILE: &str = "provider.json";

/// Everything a plan-apply cycle needs.
pub struct ReconcileContext {
    spec: StackSpec,
    graph: ResourceGraph,
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    cancel: CancellationToken,
    hasher: ConfigHasher,
    holder: String,
}

/// Options for `apply` and `destroy`.
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Restrict the plan to one resource and what it depends on.
    pub target: Option<String>,
    /// Run plans that break a guardrail.
    pub ignore_guardrails: bool,
}

/// Outcome of an apply or destroy run.
#[derive(Debug, Serialize)]
pub struct ApplyReport {
    /// The plan computed under the state lock.
    pub plan: Plan,
    /// Execution results, absent when nothing ran.
    pub execution: Option<ExecutionResult>,
    /// False if the confirmation callback declined the plan.
    pub confirmed: bool,
}

impl ApplyReport {
    /// Returns true if the plan had nothing to do.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        !self.plan.has_changes()
    }

    /// Converts failed, skipped or cancelled actions into an error.
    #[must_use]
    pub fn failure(&self) -> Option<ConvergeError> {
        self.execution.as_ref().and_then(ExecutionResult::failure)
    }
}

impl ReconcileContext {
    /// Validates the spec and builds its resource graph.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the spec is invalid or its graph is
    /// malformed. No provider or state call is made in that case.
    pub fn new(spec: StackSpec, provider: Arc<dyn Provider>, store: Arc<dyn StateStore>) -> Result<Self> {
        let validation = ConfigValidator::new().validate(&spec)?;
        for warning in &validation.warnings {
            warn!("{warning}");
        }

        let graph = GraphBuilder::new().build(&spec)?;
        debug!("Built graph with {} resources", graph.len());

        Ok(Self {
            spec,
            graph,
            provider,
            store,
            cancel: CancellationToken::new(),
            hasher: ConfigHasher::new(),
            holder: generate_holder_id(),
        })
    }

    /// Builds a context whose provider and state store come from the spec.
    ///
    /// Relative paths in the spec are resolved against `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the spec is invalid or a backend cannot be set up.
    pub async fn from_spec(spec: StackSpec, base_dir: &Path) -> Result<Self> {
        let provider = provider_from_config(&spec.provider, base_dir).await?;
        let store = store_from_config(&spec.state, base_dir).await?;
        Self::new(spec, provider, store)
    }

    /// Uses an external cancellation token (e.g. wired to Ctrl-C).
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Overrides the lock holder identifier.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// The spec this context reconciles.
    #[must_use]
    pub const fn spec(&self) -> &StackSpec {
        &self.spec
    }

    /// The desired resource graph.
    #[must_use]
    pub const fn graph(&self) -> &ResourceGraph {
        &self.graph
    }

    /// The state store.
    #[must_use]
    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.store)
    }

    /// Hash of the whole spec.
    #[must_use]
    pub fn spec_hash(&self) -> String {
        self.hasher.hash_spec(&self.spec)
    }

    /// Reads the applied state without locking it.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded.
    pub async fn load_state(&self) -> Result<AppliedState> {
        load_or_new(self.store.as_ref(), &self.spec.project.name, &self.spec.project.environment).await
    }

    /// Computes the plan against the current state without locking it.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded or `target` is unknown.
    pub async fn plan(&self, target: Option<&str>) -> Result<Plan> {
        let state = self.load_state().await?;
        self.plan_against(&self.graph, &state, target)
    }

    fn plan_against(&self, graph: &ResourceGraph, state: &AppliedState, target: Option<&str>) -> Result<Plan> {
        let diff = DiffEngine::new().compute_diff(graph, state);
        info!(
            "Diff: {} creates, {} updates, {} replaces, {} deletes, {} relinks, {} unchanged",
            diff.creates, diff.updates, diff.replaces, diff.deletes, diff.relinks, diff.unchanged
        );

        let guardrails = self.spec.guardrails.as_ref();
        let plan = Plan::from_diff(&diff, graph, state, guardrails, &self.spec_hash());

        match target {
            Some(target) => {
                let mut filtered = plan.filter_target(target)?;
                filtered.recheck_guardrails(guardrails);
                Ok(filtered)
            }
            None => Ok(plan),
        }
    }

    /// Plans and applies the spec under the state lock.
    ///
    /// `confirm` sees the plan computed under the lock and may decline it.
    /// Action failures are reported in the returned report, not as an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken, the state cannot be
    /// loaded or saved, the target is unknown or the plan breaks a guardrail.
    pub async fn apply<F>(&self, options: &ApplyOptions, confirm: F) -> Result<ApplyReport>
    where
        F: FnOnce(&Plan) -> bool,
    {
        self.run_cycle(Operation::Apply, &self.graph, options, confirm).await
    }

    /// Deletes every tracked resource, dependents first.
    ///
    /// # Errors
    ///
    /// Same as [`ReconcileContext::apply`].
    pub async fn destroy<F>(&self, options: &ApplyOptions, confirm: F) -> Result<ApplyReport>
    where
        F: FnOnce(&Plan) -> bool,
    {
        self.run_cycle(Operation::Destroy, &ResourceGraph::empty(), options, confirm).await
    }

    async fn run_cycle<F>(
        &self,
        operation: Operation,
        graph: &ResourceGraph,
        options: &ApplyOptions,
        confirm: F,
    ) -> Result<ApplyReport>
    where
        F: FnOnce(&Plan) -> bool,
    {
        let project = &self.spec.project;
        info!("Starting {operation} for {}", self.spec.qualified_name());

        with_session(self.store(), &project.name, &project.environment, &self.holder, |state| async move {
            let snapshot = state.snapshot().await;
            let plan = self.plan_against(graph, &snapshot, options.target.as_deref())?;

            if !plan.has_changes() {
                info!("No changes required, state is converged");
                return Ok(ApplyReport {
                    plan,
                    execution: None,
                    confirmed: true,
                });
            }

            if !confirm(&plan) {
                info!("{operation} declined");
                return Ok(ApplyReport {
                    plan,
                    execution: None,
                    confirmed: false,
                });
            }

            let executor = PlanExecutor::with_config(Arc::clone(&self.provider), &self.spec.execution)
                .with_cancellation(self.cancel.clone())
                .with_guardrail_override(options.ignore_guardrails);
            let result = executor.execute(&plan, &state).await?;

            let changed = result.changed_resources();
            let entry = match result.failure() {
                None => HistoryEntry::new(operation, &plan.spec_hash, changed),
                Some(err) => HistoryEntry::failed(operation, &plan.spec_hash, changed, &err.to_string()),
            };
            let whole_spec = operation == Operation::Apply && options.target.is_none() && result.is_success();
            state
                .commit(|s| {
                    if whole_spec {
                        s.spec_hash.clone_from(&plan.spec_hash);
                    }
                    s.add_history(entry);
                })
                .await?;

            info!("{operation} finished: {result}");
            Ok(ApplyReport {
                plan,
                execution: Some(result),
                confirmed: true,
            })
        })
        .await
    }

    /// Compares tracked resources with what the provider reports.
    ///
    /// Read-only: neither state nor provider is modified.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded or a provider read fails.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        info!("Checking for drift in {}", self.spec.qualified_name());

        let state = self.load_state().await?;
        let mut entries = Vec::with_capacity(state.resources.len());

        for resource in state.resources.values() {
            if resource.resource_type.ops().handler == Handler::Local {
                continue;
            }

            let observed = self
                .provider
                .read(resource.resource_type, &resource.name, &resource.physical_id)
                .await?;

            let (status, details) = match observed {
                None => (DriftStatus::Missing, vec![format!("physical id {} not found", resource.physical_id)]),
                Some(observed) => {
                    let details = drifted_fields(resource, &observed.properties);
                    if details.is_empty() {
                        (DriftStatus::InSync, details)
                    } else {
                        (DriftStatus::Modified, details)
                    }
                }
            };

            if status != DriftStatus::InSync {
                warn!("{} has drifted ({status})", resource.name);
            }

            entries.push(DriftEntry {
                name: resource.name.clone(),
                resource_type: resource.resource_type,
                status,
                details,
            });
        }

        let unapplied = self
            .graph
            .nodes()
            .filter(|node| state.get(&node.name).is_none())
            .map(|node| node.name.clone())
            .collect();

        Ok(DriftReport { entries, unapplied })
    }

    /// Drops a resource from state without touching the provider.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotTracked` if the name is not in state, or an error if
    /// the lock cannot be taken.
    pub async fn forget(&self, name: &str) -> Result<AppliedResource> {
        let project = &self.spec.project;
        with_session(self.store(), &project.name, &project.environment, &self.holder, |state| async move {
            let spec_hash = self.spec_hash();
            let removed = state
                .commit(|s| {
                    let removed = s.remove(name);
                    if removed.is_some() {
                        s.add_history(HistoryEntry::new(Operation::Forget, &spec_hash, vec![name.to_string()]));
                    }
                    removed
                })
                .await?;

            removed.ok_or_else(|| {
                ConvergeError::State(StateError::ResourceNotTracked {
                    name: name.to_string(),
                })
            })
        })
        .await
    }
}

impl std::fmt::Debug for ReconcileContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcileContext")
            .field("project", &self.spec.qualified_name())
            .field("resources", &self.graph.len())
            .field("provider", &self.provider.provider_name())
            .field("backend", &self.store.backend_type())
            .finish_non_exhaustive()
    }
}

fn drifted_fields(resource: &AppliedResource, observed: &Properties) -> Vec<String> {
    resource
        .resolved
        .iter()
        .filter_map(|(field, expected)| match observed.get(field) {
            Some(actual) if actual == expected => None,
            Some(actual) => Some(format!("{field}: expected {expected}, found {actual}")),
            None => Some(format!("{field}: expected {expected}, found nothing")),
        })
        .collect()
}

/// Creates the provider described by the spec.
///
/// # Errors
///
/// Returns an error if the http provider has no endpoint or the simulated
/// provider's file cannot be read.
pub async fn provider_from_config(config: &ProviderConfig, base_dir: &Path) -> Result<Arc<dyn Provider>> {
    match config.kind {
        ProviderKind::Simulated => {
            let path = config.path.as_ref().map_or_else(
                || base_dir.join(STATE_DIR).join(SIMULATED_PROVIDER_FILE),
                |path| base_dir.join(path),
            );
            debug!("Using simulated provider at {}", path.display());
            Ok(Arc::new(SimulatedProvider::open(path).await?))
        }
        ProviderKind::Http => {
            let endpoint = config
                .endpoint
                .as_deref()
                .ok_or_else(|| ConfigError::validation("An endpoint is required for the http provider", "provider.endpoint"))?;
            debug!("Using http provider at {endpoint}");
            let provider = HttpProvider::with_timeout(endpoint, ConfigParser::provider_token(), config.request_timeout_secs)?;
            Ok(Arc::new(provider))
        }
    }
}

/// Creates the state store described by the spec.
///
/// # Errors
///
/// Returns an error if the s3 backend has no bucket.
pub async fn store_from_config(config: &StateConfig, base_dir: &Path) -> Result<Arc<dyn StateStore>> {
    match config.backend {
        StateBackend::Local => {
            let dir = config
                .path
                .as_ref()
                .map_or_else(|| base_dir.join(STATE_DIR), |path| base_dir.join(path));
            Ok(Arc::new(LocalStateStore::with_base_dir(dir)))
        }
        StateBackend::S3 => {
            let bucket = config
                .bucket
                .as_deref()
                .ok_or_else(|| ConfigError::validation("A bucket is required for the s3 backend", "state.bucket"))?;
            let store = S3StateStore::new(bucket, config.prefix.as_deref(), config.region.as_deref()).await;
            Ok(Arc::new(store))
        }
    }
}

/// Drift status of one tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    /// Provider matches the applied properties.
    InSync,
    /// At least one applied property differs.
    Modified,
    /// The provider no longer has the resource.
    Missing,
}

impl std::fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InSync => "in sync",
            Self::Modified => "modified",
            Self::Missing => "missing",
        };
        write!(f, "{s}")
    }
}

/// Drift of one tracked resource.
#[derive(Debug, Clone, Serialize)]
pub struct DriftEntry {
    /// Logical name.
    pub name: String,
    /// Resource type.
    pub resource_type: ResourceType,
    /// Whether and how it drifted.
    pub status: DriftStatus,
    /// Differing fields.
    pub details: Vec<String>,
}

/// Report of drift detection.
#[derive(Debug, Serialize)]
pub struct DriftReport {
    /// One entry per tracked remote resource.
    pub entries: Vec<DriftEntry>,
    /// Declared resources that were never applied.
    pub unapplied: Vec<String>,
}

impl DriftReport {
    /// Returns true if every tracked resource matches the provider.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.entries.iter().all(|e| e.status == DriftStatus::InSync)
    }

    /// Entries that are not in sync.
    #[must_use]
    pub fn drifted(&self) -> Vec<&DriftEntry> {
        self.entries.iter().filter(|e| e.status != DriftStatus::InSync).collect()
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_converged() {
            writeln!(f, "No drift detected, state is converged")?;
        } else {
            writeln!(f, "Drift detected:")?;
            for entry in self.drifted() {
                writeln!(f, "  - {} ({})", entry.name, entry.status)?;
                for detail in &entry.details {
                    writeln!(f, "      {detail}")?;
                }
            }
        }
        if !self.unapplied.is_empty() {
            writeln!(f, "Not yet applied: {}", self.unapplied.join(", "))?;
        }
        Ok(())
    }
}
