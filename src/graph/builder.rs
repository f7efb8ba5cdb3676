//! Builds a [`ResourceGraph`] from a parsed spec.

use tracing::debug;

use crate::config::StackSpec;
use crate::error::{ConfigError, ConvergeError, Result};
use crate::resource::ResourceType;

use super::dag::ResourceGraph;
use super::node::ResourceNode;
use super::reference::{extract_references, malformed_references};

/// Turns resource declarations into a validated graph.
#[derive(Debug, Default)]
pub struct GraphBuilder;

impl GraphBuilder {
    /// Creates a new graph builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds the graph, inferring an edge for every `${name.attr}` reference.
    ///
    /// # Errors
    ///
    /// Returns an error if a type is unknown, a reference is malformed, targets
    /// itself, targets an undefined resource or an attribute the target does
    /// not export, or if the dependencies form a cycle.
    pub fn build(&self, spec: &StackSpec) -> Result<ResourceGraph> {
        let mut nodes = Vec::with_capacity(spec.resources.len());

        for (name, declared) in &spec.resources {
            let resource_type = ResourceType::parse(&declared.resource_type).ok_or_else(|| {
                ConvergeError::Config(ConfigError::UnknownResourceType {
                    resource: name.clone(),
                    type_name: declared.resource_type.clone(),
                })
            })?;

            let mut node = ResourceNode::new(name.clone(), resource_type, declared.properties.clone());
            node.dependencies.extend(declared.depends_on.iter().cloned());

            for value in declared.properties.values() {
                if let Some(bad) = malformed_references(value).into_iter().next() {
                    return Err(invalid_reference(name, &bad, "expected ${name.attribute}"));
                }

                for reference in extract_references(value) {
                    if reference.target == *name {
                        return Err(invalid_reference(name, &reference.to_string(), "a resource cannot reference itself"));
                    }

                    let target = spec.get_resource(&reference.target).ok_or_else(|| {
                        ConvergeError::Config(ConfigError::DanglingReference {
                            resource: name.clone(),
                            target: reference.target.clone(),
                        })
                    })?;

                    if let Some(target_type) = ResourceType::parse(&target.resource_type) {
                        if !target_type.ops().exports_attribute(&reference.attribute) {
                            return Err(invalid_reference(
                                name,
                                &reference.to_string(),
                                &format!("{target_type} does not export '{}'", reference.attribute),
                            ));
                        }
                    }

                    node.dependencies.insert(reference.target);
                }
            }

            debug!(
                "Resource {name} ({resource_type}) depends on [{}]",
                node.dependencies.iter().cloned().collect::<Vec<_>>().join(", ")
            );
            nodes.push(node);
        }

        let graph = ResourceGraph::from_nodes(nodes)?;
        debug!("Built resource graph with {} nodes", graph.len());
        Ok(graph)
    }
}

fn invalid_reference(resource: &str, reference: &str, reason: &str) -> ConvergeError {
    ConvergeError::Config(ConfigError::InvalidReference {
        resource: resource.to_string(),
        reference: reference.to_string(),
        reason: reason.to_string(),
    })
}
