//! Change plan types and construction.
//!
//! A [`Plan`] turns a diff into ordered actions. Each action records the
//! indices of the actions that must finish before it may start, which is all
//! the executor needs to schedule it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

use crate::config::{GuardrailsConfig, Properties};
use crate::error::{PlanError, Result};
use crate::graph::{stable_topological_order, ResourceGraph};
use crate::resource::{FieldChange, ResourceType};
use crate::state::AppliedState;

use super::diff::{DiffResult, DiffType};

/// An ordered change plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Spec hash this plan is based on.
    pub spec_hash: String,
    /// Planned actions in execution order.
    pub actions: Vec<PlannedAction>,
    /// Whether the plan passes guardrails.
    pub passes_guardrails: bool,
    /// Guardrail violations (if any).
    pub guardrail_violations: Vec<String>,
}

/// A single planned action.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedAction {
    /// Action type.
    pub action_type: ActionType,
    /// Logical name.
    pub resource_name: String,
    /// Resource type.
    pub resource_type: ResourceType,
    /// Desired properties, references unresolved. Empty for deletes.
    pub properties: Properties,
    /// Provider-assigned identifier of the existing resource.
    pub physical_id: Option<String>,
    /// Logical names this resource depends on.
    pub depends_on: Vec<String>,
    /// Indices of actions that must complete first.
    pub dependencies: Vec<usize>,
    /// Field-level changes behind the action.
    pub details: Vec<FieldChange>,
    /// Reason for this action.
    pub reason: String,
    /// Hash of the desired properties.
    pub new_hash: Option<String>,
}

/// Operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a new resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Create the new instance of a resource whose old instance was torn down.
    Replace,
    /// Delete the old instance of a resource being replaced.
    Teardown,
    /// Delete a resource.
    Delete,
    /// Record new dependency edges without a provider call.
    Relink,
    /// Nothing to do.
    Noop,
}

impl Plan {
    /// Builds a plan from a diff.
    ///
    /// Desired-node actions wait for the actions of their graph dependencies.
    /// A delete waits for the deletes of resources that depended on it, and
    /// for any surviving resource that referenced it when last applied.
    ///
    /// Each replacement is split in two. The teardown of the old instance
    /// comes first and waits for the teardowns of replaced resources that
    /// depended on it. The create of the new instance waits for its own
    /// teardown as well as its graph dependencies.
    #[must_use]
    pub fn from_diff(
        diff: &DiffResult,
        graph: &ResourceGraph,
        state: &AppliedState,
        guardrails: Option<&GuardrailsConfig>,
        spec_hash: &str,
    ) -> Self {
        let replaced: BTreeSet<String> = diff
            .diffs
            .iter()
            .filter(|d| d.diff_type == DiffType::Replace)
            .map(|d| d.name.clone())
            .collect();
        let recorded_edges: Vec<(String, String)> = state
            .resources
            .values()
            .flat_map(|r| r.dependencies.iter().map(|dep| (r.name.clone(), dep.clone())))
            .collect();
        // Dependents first: reverse of the last-applied order.
        let teardown_order = stable_topological_order(&replaced, &recorded_edges);

        let teardown_index: HashMap<&str, usize> = teardown_order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();
        let offset = teardown_order.len();
        let index: HashMap<&str, usize> = diff
            .diffs
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name.as_str(), offset + i))
            .collect();

        let mut actions: Vec<PlannedAction> = teardown_order
            .iter()
            .filter_map(|name| diff.diffs.iter().find(|d| d.name == *name))
            .map(|resource_diff| {
                let name = resource_diff.name.as_str();
                let old = state.get(name);
                let dependencies: BTreeSet<usize> = state
                    .resources
                    .values()
                    .filter(|other| other.dependencies.iter().any(|dep| dep == name))
                    .filter_map(|other| teardown_index.get(other.name.as_str()).copied())
                    .collect();

                PlannedAction {
                    action_type: ActionType::Teardown,
                    resource_name: resource_diff.name.clone(),
                    resource_type: old.map_or(resource_diff.resource_type, |r| r.resource_type),
                    properties: Properties::new(),
                    physical_id: resource_diff.physical_id.clone(),
                    depends_on: old.map(|r| r.dependencies.clone()).unwrap_or_default(),
                    dependencies: dependencies.into_iter().collect(),
                    details: Vec::new(),
                    reason: String::from("old instance of a replacement"),
                    new_hash: None,
                }
            })
            .collect();

        actions.extend(diff.diffs.iter().map(|resource_diff| {
            let name = resource_diff.name.as_str();
            let (depends_on, dependencies, properties) = if resource_diff.diff_type == DiffType::Delete {
                let waits_for: BTreeSet<usize> = state
                    .resources
                    .values()
                    .filter(|other| other.dependencies.iter().any(|dep| dep == name))
                    .filter_map(|other| index.get(other.name.as_str()).copied())
                    .collect();
                let depends_on = state.get(name).map(|r| r.dependencies.clone()).unwrap_or_default();
                (depends_on, waits_for.into_iter().collect::<Vec<_>>(), Properties::new())
            } else {
                let depends_on: Vec<String> = graph.dependencies(name).into_iter().map(String::from).collect();
                let mut dependencies: Vec<usize> =
                    depends_on.iter().filter_map(|dep| index.get(dep.as_str()).copied()).collect();
                dependencies.extend(teardown_index.get(name).copied());
                let properties = graph.node(name).map(|n| n.properties.clone()).unwrap_or_default();
                (depends_on, dependencies, properties)
            };

            PlannedAction {
                action_type: ActionType::from(resource_diff.diff_type),
                resource_name: resource_diff.name.clone(),
                resource_type: resource_diff.resource_type,
                properties,
                physical_id: resource_diff.physical_id.clone(),
                depends_on,
                dependencies,
                reason: reason(resource_diff.diff_type, &resource_diff.details),
                details: resource_diff.details.clone(),
                new_hash: resource_diff.new_hash.clone(),
            }
        }));

        let guardrail_violations = guardrails.map(|g| check_guardrails(g, &actions)).unwrap_or_default();

        Self {
            created_at: Utc::now(),
            spec_hash: spec_hash.to_string(),
            actions,
            passes_guardrails: guardrail_violations.is_empty(),
            guardrail_violations,
        }
    }

    /// Creates an empty plan.
    #[must_use]
    pub fn empty(spec_hash: &str) -> Self {
        Self {
            created_at: Utc::now(),
            spec_hash: spec_hash.to_string(),
            actions: Vec::new(),
            passes_guardrails: true,
            guardrail_violations: Vec::new(),
        }
    }

    /// Restricts the plan to `target` and everything it transitively waits for.
    ///
    /// A kept teardown always brings the create of its replacement along.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTarget` if no action names `target`.
    pub fn filter_target(&self, target: &str) -> Result<Self> {
        let Some(start) = self
            .actions
            .iter()
            .position(|a| a.resource_name == target && a.action_type != ActionType::Teardown)
        else {
            return Err(PlanError::UnknownTarget {
                target: target.to_string(),
            }
            .into());
        };

        let mut keep = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(i) = stack.pop() {
            if keep.insert(i) {
                let action = &self.actions[i];
                stack.extend(action.dependencies.iter().copied());
                if action.action_type == ActionType::Teardown {
                    stack.extend(self.actions.iter().position(|a| {
                        a.resource_name == action.resource_name && a.action_type == ActionType::Replace
                    }));
                }
            }
        }

        let remap: HashMap<usize, usize> = keep.iter().enumerate().map(|(new, &old)| (old, new)).collect();
        let actions: Vec<PlannedAction> = keep
            .iter()
            .map(|&old| {
                let mut action = self.actions[old].clone();
                action.dependencies = action.dependencies.iter().filter_map(|d| remap.get(d).copied()).collect();
                action
            })
            .collect();

        Ok(Self {
            created_at: self.created_at,
            spec_hash: self.spec_hash.clone(),
            actions,
            passes_guardrails: self.passes_guardrails,
            guardrail_violations: self.guardrail_violations.clone(),
        })
    }

    /// Re-evaluates guardrails after the action list changed.
    pub fn recheck_guardrails(&mut self, guardrails: Option<&GuardrailsConfig>) {
        self.guardrail_violations = guardrails.map(|g| check_guardrails(g, &self.actions)).unwrap_or_default();
        self.passes_guardrails = self.guardrail_violations.is_empty();
    }

    /// Returns true if the plan has no actions at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Returns true if any action is not a noop.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.actions.iter().any(|a| a.action_type != ActionType::Noop)
    }

    /// Returns the number of actions of the given kind.
    #[must_use]
    pub fn count(&self, action_type: ActionType) -> usize {
        self.actions.iter().filter(|a| a.action_type == action_type).count()
    }

    /// Returns the action kinds in plan order.
    #[must_use]
    pub fn action_types(&self) -> Vec<ActionType> {
        self.actions.iter().map(|a| a.action_type).collect()
    }

    /// Actions that can start immediately.
    #[must_use]
    pub fn ready_actions(&self) -> Vec<&PlannedAction> {
        self.actions.iter().filter(|a| a.dependencies.is_empty()).collect()
    }

    /// Actions that wait on `action_idx`.
    #[must_use]
    pub fn dependent_actions(&self, action_idx: usize) -> Vec<(usize, &PlannedAction)> {
        self.actions
            .iter()
            .enumerate()
            .filter(|(_, a)| a.dependencies.contains(&action_idx))
            .collect()
    }
}

fn reason(diff_type: DiffType, details: &[FieldChange]) -> String {
    let fields = || details.iter().map(|d| d.field.as_str()).collect::<Vec<_>>().join(", ");
    match diff_type {
        DiffType::Create => String::from("not yet created"),
        DiffType::Update => format!("changed: {}", fields()),
        DiffType::Replace => {
            let forcing: Vec<&str> = details
                .iter()
                .filter(|d| d.forces_replacement)
                .map(|d| d.field.as_str())
                .collect();
            format!("forces replacement: {}", forcing.join(", "))
        }
        DiffType::Delete => String::from("removed from spec"),
        DiffType::Relink => String::from("dependencies changed"),
        DiffType::NoChange => String::new(),
    }
}

fn check_guardrails(guardrails: &GuardrailsConfig, actions: &[PlannedAction]) -> Vec<String> {
    let mut violations = Vec::new();

    let destructive: Vec<&PlannedAction> = actions
        .iter()
        .filter(|a| matches!(a.action_type, ActionType::Delete | ActionType::Replace))
        .collect();

    if let Some(max_deletes) = guardrails.max_deletes {
        if destructive.len() > max_deletes {
            violations.push(format!(
                "Plan deletes or replaces {} resources but max_deletes is {max_deletes}",
                destructive.len()
            ));
        }
    }

    for action in destructive {
        if guardrails.protected.iter().any(|p| *p == action.resource_name) {
            violations.push(format!("Plan would {} protected resource '{}'", action.action_type, action.resource_name));
        }
    }

    violations
}

impl From<DiffType> for ActionType {
    fn from(diff_type: DiffType) -> Self {
        match diff_type {
            DiffType::Create => Self::Create,
            DiffType::Update => Self::Update,
            DiffType::Replace => Self::Replace,
            DiffType::Delete => Self::Delete,
            DiffType::Relink => Self::Relink,
            DiffType::NoChange => Self::Noop,
        }
    }
}

impl PlannedAction {
    /// Returns a human-readable description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        match self.action_type {
            ActionType::Create => format!("Create {} '{}'", self.resource_type, self.resource_name),
            ActionType::Update => format!("Update {} '{}'", self.resource_type, self.resource_name),
            ActionType::Replace => format!("Replace {} '{}'", self.resource_type, self.resource_name),
            ActionType::Delete => format!("Delete {} '{}'", self.resource_type, self.resource_name),
            ActionType::Teardown => format!("Tear down old {} '{}'", self.resource_type, self.resource_name),
            ActionType::Relink => format!("Relink {} '{}'", self.resource_type, self.resource_name),
            ActionType::Noop => format!("No change for '{}'", self.resource_name),
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::Teardown => "teardown",
            Self::Relink => "relink",
            Self::Noop => "noop",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} ({})", self.action_type, self.resource_name, self.resource_type)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.has_changes() {
            return write!(f, "No changes required");
        }

        let changes = self.actions.len() - self.count(ActionType::Noop);
        writeln!(f, "Plan ({changes} changes):")?;
        for (i, action) in self.actions.iter().enumerate() {
            if action.action_type != ActionType::Noop {
                writeln!(f, "  {i}. {action}")?;
            }
        }

        if !self.guardrail_violations.is_empty() {
            writeln!(f, "\nGuardrail violations:")?;
            for violation in &self.guardrail_violations {
                writeln!(f, "  - {violation}")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigHasher, ConfigParser};
    use crate::graph::GraphBuilder;
    use crate::planner::DiffEngine;
    use crate::state::AppliedResource;

    const STACK: &str = r#"
project:
  name: eks-sandbox
resources:
  a:
    type: output
    properties: {value: 1}
  b:
    type: output
    depends_on: [a]
    properties: {value: 2}
  c:
    type: output
    properties: {value: "${a.value}"}
"#;

    const CLUSTER_STACK: &str = r#"
project:
  name: eks-sandbox
resources:
  cluster:
    type: cluster
    properties:
      name: eks-sandbox
      version: "1.30"
  ebs-driver:
    type: addon
    properties:
      cluster_name: "${cluster.name}"
      addon_name: aws-ebs-csi-driver
  endpoint:
    type: output
    properties:
      value: "${cluster.endpoint}"
"#;

    fn graph(yaml: &str) -> ResourceGraph {
        let spec = ConfigParser::new().parse_yaml(yaml, None).expect("parse");
        GraphBuilder::new().build(&spec).expect("graph")
    }

    fn plan(graph: &ResourceGraph, state: &AppliedState, guardrails: Option<&GuardrailsConfig>) -> Plan {
        let diff = DiffEngine::new().compute_diff(graph, state);
        Plan::from_diff(&diff, graph, state, guardrails, "hash")
    }

    fn applied(graph: &ResourceGraph) -> AppliedState {
        let hasher = ConfigHasher::new();
        let mut state = AppliedState::new("eks-sandbox", "dev");
        for node in graph.nodes() {
            state.record(AppliedResource {
                name: node.name.clone(),
                resource_type: node.resource_type,
                physical_id: node.name.clone(),
                properties: node.properties.clone(),
                resolved: node.properties.clone(),
                outputs: Properties::new(),
                dependencies: node.dependencies.iter().cloned().collect(),
                properties_hash: hasher.hash_properties(&node.properties),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            });
        }
        state
    }

    #[test]
    fn test_dependencies_precede_dependents() {
        let graph = graph(STACK);
        let plan = plan(&graph, &AppliedState::new("eks-sandbox", "dev"), None);

        let names: Vec<&str> = plan.actions.iter().map(|a| a.resource_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(plan.action_types(), vec![ActionType::Create; 3]);
        for (i, action) in plan.actions.iter().enumerate() {
            assert!(action.dependencies.iter().all(|&d| d < i));
        }
        assert_eq!(plan.actions[1].dependencies, vec![0]);
        assert_eq!(plan.actions[2].depends_on, vec![String::from("a")]);
        assert_eq!(plan.ready_actions().len(), 1);
        assert_eq!(plan.dependent_actions(0).len(), 2);
    }

    #[test]
    fn test_unchanged_plan_is_all_noop() {
        let graph = graph(STACK);
        let plan = plan(&graph, &applied(&graph), None);

        assert_eq!(plan.action_types(), vec![ActionType::Noop; 3]);
        assert!(!plan.has_changes());
        assert_eq!(plan.to_string(), "No changes required");
    }

    #[test]
    fn test_deletes_wait_for_dependents() {
        let full = graph(STACK);
        let state = applied(&full);
        let empty = ResourceGraph::empty();

        let plan = plan(&empty, &state, None);
        let names: Vec<&str> = plan.actions.iter().map(|a| a.resource_name.as_str()).collect();
        assert_eq!(names, vec!["b", "c", "a"]);
        assert_eq!(plan.actions[2].dependencies, vec![0, 1]);
        assert!(plan.actions[0].dependencies.is_empty());
    }

    #[test]
    fn test_guardrails() {
        let full = graph(STACK);
        let state = applied(&full);
        let guardrails = GuardrailsConfig {
            max_deletes: Some(1),
            protected: vec![String::from("a")],
        };

        let plan = plan(&ResourceGraph::empty(), &state, Some(&guardrails));
        assert!(!plan.passes_guardrails);
        assert_eq!(plan.guardrail_violations.len(), 2);
        assert!(plan.guardrail_violations[0].contains("max_deletes is 1"));
        assert!(plan.guardrail_violations[1].contains("'a'"));
    }

    #[test]
    fn test_filter_target_keeps_dependencies() {
        let graph = graph(STACK);
        let plan = plan(&graph, &AppliedState::new("eks-sandbox", "dev"), None);

        let filtered = plan.filter_target("b").expect("target");
        let names: Vec<&str> = filtered.actions.iter().map(|a| a.resource_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(filtered.actions[1].dependencies, vec![0]);

        assert!(plan.filter_target("missing").is_err());
    }

    #[test]
    fn test_replacements_tear_down_dependents_first() {
        let before = graph(CLUSTER_STACK);
        let state = applied(&before);
        let after = graph(&CLUSTER_STACK.replace("name: eks-sandbox\n      version", "name: eks-renamed\n      version"));
        let plan = plan(&after, &state, None);

        let steps: Vec<(ActionType, &str)> = plan
            .actions
            .iter()
            .map(|a| (a.action_type, a.resource_name.as_str()))
            .collect();
        assert_eq!(
            steps,
            vec![
                (ActionType::Teardown, "ebs-driver"),
                (ActionType::Teardown, "cluster"),
                (ActionType::Replace, "cluster"),
                (ActionType::Replace, "ebs-driver"),
                (ActionType::Update, "endpoint"),
            ]
        );
        assert!(plan.actions[0].dependencies.is_empty());
        assert_eq!(plan.actions[1].dependencies, vec![0]);
        assert_eq!(plan.actions[2].dependencies, vec![1]);
        assert_eq!(plan.actions[3].dependencies, vec![2, 0]);
        assert_eq!(plan.actions[4].dependencies, vec![2]);
        assert_eq!(plan.actions[1].physical_id.as_deref(), Some("cluster"));
        assert!(plan.actions[1].properties.is_empty());
    }

    #[test]
    fn test_filter_target_keeps_recreation_of_torn_down_dependents() {
        let state = applied(&graph(CLUSTER_STACK));
        let after = graph(&CLUSTER_STACK.replace("name: eks-sandbox\n      version", "name: eks-renamed\n      version"));
        let plan = plan(&after, &state, None);

        let filtered = plan.filter_target("cluster").expect("target");
        assert_eq!(filtered.count(ActionType::Teardown), 2);
        assert_eq!(filtered.count(ActionType::Replace), 2);
        assert_eq!(filtered.count(ActionType::Update), 0);
        for (i, action) in filtered.actions.iter().enumerate() {
            assert!(action.dependencies.iter().all(|&d| d < filtered.actions.len() && d != i));
        }
    }

    #[test]
    fn test_replacement_counts_once_against_guardrails() {
        let state = applied(&graph(CLUSTER_STACK));
        let after = graph(&CLUSTER_STACK.replace("addon_name: aws-ebs-csi-driver", "addon_name: aws-efs-csi-driver"));
        let guardrails = GuardrailsConfig {
            max_deletes: Some(1),
            protected: Vec::new(),
        };

        let plan = plan(&after, &state, Some(&guardrails));
        assert_eq!(plan.count(ActionType::Teardown), 1);
        assert!(plan.passes_guardrails, "{:?}", plan.guardrail_violations);
    }
}
