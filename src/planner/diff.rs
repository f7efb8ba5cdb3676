//! Diff engine for comparing the desired graph against applied state.
//!
//! Desired nodes are visited in dependency order so that a replacement can
//! propagate to the resources referencing it before they are classified.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

use crate::config::ConfigHasher;
use crate::graph::{field_references, stable_topological_order, ResourceGraph, ResourceNode};
use crate::resource::{FieldChange, ResourceType};
use crate::state::{AppliedResource, AppliedState};

/// Pseudo-field reported when only dependency edges change.
pub const DEPENDS_ON_FIELD: &str = "depends_on";

/// Engine for computing diffs between desired and applied states.
#[derive(Debug, Default)]
pub struct DiffEngine {
    hasher: ConfigHasher,
}

/// Difference for a single resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceDiff {
    /// Logical name.
    pub name: String,
    /// Resource type (the desired one, or the applied one for deletes).
    pub resource_type: ResourceType,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Field-level changes.
    pub details: Vec<FieldChange>,
    /// Provider-assigned identifier, if the resource exists.
    pub physical_id: Option<String>,
    /// Previous property hash.
    pub old_hash: Option<String>,
    /// New property hash.
    pub new_hash: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Mutable properties changed.
    Update,
    /// An immutable property (or the type) changed.
    Replace,
    /// Resource was removed from the spec.
    Delete,
    /// Properties unchanged but dependency edges differ; state-only.
    Relink,
    /// Resource is unchanged.
    NoChange,
}

/// Complete diff result.
#[derive(Debug, Clone, Serialize)]
pub struct DiffResult {
    /// Desired nodes in dependency order, then deletes in reverse dependency order.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update.
    pub updates: usize,
    /// Number of resources to replace.
    pub replaces: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of resources whose recorded dependencies change.
    pub relinks: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Computes the diff between the desired graph and applied state.
    #[must_use]
    pub fn compute_diff(&self, graph: &ResourceGraph, state: &AppliedState) -> DiffResult {
        let mut diffs = Vec::with_capacity(graph.len());
        let mut replaced: HashSet<String> = HashSet::new();

        for name in graph.topological_order() {
            let Some(node) = graph.node(&name) else {
                continue;
            };
            let diff = self.diff_node(node, state.get(&name), &replaced);
            if diff.diff_type == DiffType::Replace {
                replaced.insert(name);
            }
            diffs.push(diff);
        }

        diffs.extend(self.deletes(graph, state));

        let count = |kind: DiffType| diffs.iter().filter(|d| d.diff_type == kind).count();
        DiffResult {
            creates: count(DiffType::Create),
            updates: count(DiffType::Update),
            replaces: count(DiffType::Replace),
            deletes: count(DiffType::Delete),
            relinks: count(DiffType::Relink),
            unchanged: count(DiffType::NoChange),
            diffs,
        }
    }

    fn diff_node(&self, node: &ResourceNode, applied: Option<&AppliedResource>, replaced: &HashSet<String>) -> ResourceDiff {
        let new_hash = self.hasher.hash_properties(&node.properties);

        let Some(applied) = applied else {
            debug!("{} needs to be created", node.name);
            return ResourceDiff {
                name: node.name.clone(),
                resource_type: node.resource_type,
                diff_type: DiffType::Create,
                details: Vec::new(),
                physical_id: None,
                old_hash: None,
                new_hash: Some(new_hash),
            };
        };

        let mut details = if applied.resource_type == node.resource_type {
            let mut details = node.ops().diff(&applied.properties, &node.properties);
            details.extend(propagated_changes(node, applied, replaced, &details));
            details
        } else {
            vec![FieldChange {
                field: String::from("type"),
                old_value: Some(Value::String(applied.resource_type.to_string())),
                new_value: Some(Value::String(node.resource_type.to_string())),
                forces_replacement: true,
            }]
        };

        let recorded: BTreeSet<&str> = applied.dependencies.iter().map(String::as_str).collect();
        let desired: BTreeSet<&str> = node.dependencies.iter().map(String::as_str).collect();

        let diff_type = if details.is_empty() && recorded == desired {
            DiffType::NoChange
        } else if details.is_empty() {
            details.push(FieldChange {
                field: String::from(DEPENDS_ON_FIELD),
                old_value: Some(Value::from(recorded.into_iter().collect::<Vec<_>>())),
                new_value: Some(Value::from(desired.into_iter().collect::<Vec<_>>())),
                forces_replacement: false,
            });
            DiffType::Relink
        } else if details.iter().any(|d| d.forces_replacement) {
            DiffType::Replace
        } else {
            DiffType::Update
        };
        debug!("{}: {diff_type}", node.name);

        ResourceDiff {
            name: node.name.clone(),
            resource_type: node.resource_type,
            diff_type,
            details,
            physical_id: Some(applied.physical_id.clone()),
            old_hash: Some(applied.properties_hash.clone()),
            new_hash: Some(new_hash),
        }
    }

    /// Tracked resources missing from the graph, dependents first.
    fn deletes(&self, graph: &ResourceGraph, state: &AppliedState) -> Vec<ResourceDiff> {
        let removed: BTreeSet<String> = state
            .resources
            .keys()
            .filter(|name| !graph.contains(name))
            .cloned()
            .collect();

        let edges: Vec<(String, String)> = removed
            .iter()
            .filter_map(|name| state.get(name))
            .flat_map(|resource| {
                resource
                    .dependencies
                    .iter()
                    .map(move |dep| (resource.name.clone(), dep.clone()))
            })
            .collect();

        stable_topological_order(&removed, &edges)
            .into_iter()
            .filter_map(|name| state.get(&name))
            .map(|resource| {
                debug!("{} removed from spec", resource.name);
                ResourceDiff {
                    name: resource.name.clone(),
                    resource_type: resource.resource_type,
                    diff_type: DiffType::Delete,
                    details: Vec::new(),
                    physical_id: Some(resource.physical_id.clone()),
                    old_hash: Some(resource.properties_hash.clone()),
                    new_hash: None,
                }
            })
            .collect()
    }
}

/// Fields whose references point at a resource being replaced.
///
/// The referenced attributes get new values once the replacement lands, so
/// these fields change even though their declared text does not.
fn propagated_changes(
    node: &ResourceNode,
    applied: &AppliedResource,
    replaced: &HashSet<String>,
    existing: &[FieldChange],
) -> Vec<FieldChange> {
    let ops = node.ops();
    let mut seen: BTreeSet<String> = existing.iter().map(|d| d.field.clone()).collect();

    field_references(&node.properties)
        .into_iter()
        .filter(|(_, reference)| replaced.contains(&reference.target))
        .filter_map(|(field, reference)| {
            if !seen.insert(field.clone()) {
                return None;
            }
            debug!("{}.{field} follows replacement of {}", node.name, reference.target);
            Some(FieldChange {
                old_value: applied.resolved.get(&field).cloned(),
                new_value: node.properties.get(&field).cloned(),
                forces_replacement: ops.is_immutable(&field),
                field,
            })
        })
        .collect()
}

impl DiffResult {
    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.total_changes() > 0
    }

    /// Returns the total number of changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.creates + self.updates + self.replaces + self.deletes + self.relinks
    }

    /// Diffs that require action.
    #[must_use]
    pub fn actionable_diffs(&self) -> Vec<&ResourceDiff> {
        self.diffs.iter().filter(|d| d.diff_type != DiffType::NoChange).collect()
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::Relink => "relink",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.diff_type)?;
        if !self.details.is_empty() {
            let fields: Vec<&str> = self.details.iter().map(|d| d.field.as_str()).collect();
            write!(f, " ({})", fields.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigParser, Properties};
    use crate::graph::GraphBuilder;
    use chrono::Utc;
    use serde_json::json;

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
"#;

    fn graph(yaml: &str) -> ResourceGraph {
        let spec = ConfigParser::new().parse_yaml(yaml, None).expect("parse");
        GraphBuilder::new().build(&spec).expect("graph")
    }

    /// State as if every node of `graph` had been applied as declared.
    fn applied(graph: &ResourceGraph) -> AppliedState {
        let hasher = ConfigHasher::new();
        let mut state = AppliedState::new("eks-sandbox", "dev");
        for node in graph.nodes() {
            state.record(AppliedResource {
                name: node.name.clone(),
                resource_type: node.resource_type,
                physical_id: format!("{}-id", node.name),
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

    fn kinds(result: &DiffResult) -> Vec<(&str, DiffType)> {
        result.diffs.iter().map(|d| (d.name.as_str(), d.diff_type)).collect()
    }

    #[test]
    fn test_empty_state_creates_in_dependency_order() {
        let graph = graph(STACK);
        let result = DiffEngine::new().compute_diff(&graph, &AppliedState::new("eks-sandbox", "dev"));

        assert_eq!(
            kinds(&result),
            vec![
                ("cluster", DiffType::Create),
                ("ebs-role", DiffType::Create),
                ("ebs-driver", DiffType::Create),
            ]
        );
        assert_eq!(result.creates, 3);
        assert!(result.has_changes());
    }

    #[test]
    fn test_applied_graph_is_unchanged() {
        let graph = graph(STACK);
        let result = DiffEngine::new().compute_diff(&graph, &applied(&graph));

        assert_eq!(result.unchanged, 3);
        assert!(!result.has_changes());
        assert!(result.actionable_diffs().is_empty());
    }

    #[test]
    fn test_mutable_change_is_update() {
        let graph_before = graph(STACK);
        let state = applied(&graph_before);
        let graph_after = graph(&STACK.replace("\"1.30\"", "\"1.31\""));

        let result = DiffEngine::new().compute_diff(&graph_after, &state);
        let cluster = &result.diffs[0];
        assert_eq!(cluster.diff_type, DiffType::Update);
        assert_eq!(cluster.details[0].field, "version");
        assert_eq!(cluster.details[0].new_value, Some(json!("1.31")));
        assert_eq!(result.unchanged, 2);
    }

    #[test]
    fn test_replacement_propagates_to_referencing_fields() {
        let graph_before = graph(STACK);
        let state = applied(&graph_before);
        let graph_after = graph(&STACK.replace("name: eks-sandbox\n      version", "name: eks-renamed\n      version"));

        let result = DiffEngine::new().compute_diff(&graph_after, &state);
        assert_eq!(
            kinds(&result),
            vec![
                ("cluster", DiffType::Replace),
                ("ebs-role", DiffType::Update),
                ("ebs-driver", DiffType::Replace),
            ]
        );

        let driver = &result.diffs[2];
        assert_eq!(driver.details.len(), 1);
        assert_eq!(driver.details[0].field, "cluster_name");
        assert!(driver.details[0].forces_replacement);
    }

    #[test]
    fn test_dependency_change_alone_is_relink() {
        let graph_before = graph(STACK);
        let mut state = applied(&graph_before);
        if let Some(driver) = state.resources.get_mut("ebs-driver") {
            driver.dependencies = vec![String::from("cluster")];
        }

        let result = DiffEngine::new().compute_diff(&graph_before, &state);
        let driver = result.diffs.iter().find(|d| d.name == "ebs-driver").expect("driver diff");
        assert_eq!(driver.diff_type, DiffType::Relink);
        assert_eq!(driver.details[0].field, DEPENDS_ON_FIELD);
        assert_eq!(driver.details[0].new_value, Some(json!(["cluster", "ebs-role"])));
        assert!(!driver.details[0].forces_replacement);
        assert_eq!(result.relinks, 1);
        assert!(result.has_changes());
    }

    #[test]
    fn test_type_change_is_replace() {
        let graph_before = graph(STACK);
        let mut state = applied(&graph_before);
        if let Some(role) = state.resources.get_mut("ebs-role") {
            role.resource_type = ResourceType::AccessEntry;
        }

        let result = DiffEngine::new().compute_diff(&graph_before, &state);
        let role = result.diffs.iter().find(|d| d.name == "ebs-role").expect("role diff");
        assert_eq!(role.diff_type, DiffType::Replace);
        assert_eq!(role.details[0].field, "type");
    }

    #[test]
    fn test_removed_resources_delete_dependents_first() {
        let full = graph(STACK);
        let state = applied(&full);
        let only_cluster = graph(
            "project:\n  name: eks-sandbox\nresources:\n  other:\n    type: output\n    properties: {value: 1}\n",
        );

        let result = DiffEngine::new().compute_diff(&only_cluster, &state);
        assert_eq!(
            kinds(&result),
            vec![
                ("other", DiffType::Create),
                ("ebs-driver", DiffType::Delete),
                ("ebs-role", DiffType::Delete),
                ("cluster", DiffType::Delete),
            ]
        );
        assert_eq!(result.deletes, 3);
        assert_eq!(result.diffs[1].physical_id.as_deref(), Some("ebs-driver-id"));
    }
}
