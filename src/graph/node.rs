//! Resource nodes.

use std::collections::BTreeSet;

use crate::config::Properties;
use crate::resource::{ResourceType, TypeOps};

/// A desired resource in the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    /// Logical name, unique within the stack.
    pub name: String,
    /// Resource type.
    pub resource_type: ResourceType,
    /// Desired properties, references left unresolved.
    pub properties: Properties,
    /// Logical names this node depends on, explicit and inferred.
    pub dependencies: BTreeSet<String>,
    /// Provider-assigned identifier, once the resource exists.
    pub physical_id: Option<String>,
}

impl ResourceNode {
    /// Creates a node with no dependencies.
    #[must_use]
    pub fn new(name: impl Into<String>, resource_type: ResourceType, properties: Properties) -> Self {
        Self {
            name: name.into(),
            resource_type,
            properties,
            dependencies: BTreeSet::new(),
            physical_id: None,
        }
    }

    /// Adds a dependency edge.
    #[must_use]
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.insert(name.into());
        self
    }

    /// Returns the operation table for this node's type.
    #[must_use]
    pub fn ops(&self) -> &'static TypeOps {
        self.resource_type.ops()
    }
}
