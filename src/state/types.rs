//! Applied-state types.
//!
//! `AppliedState` is the last-known truth about what exists at the provider.
//! It is only mutated by successful executor steps and read by the planner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::Properties;
use crate::error::{Result, StateError};
use crate::resource::ResourceType;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1";

/// Number of history entries kept.
const MAX_HISTORY: usize = 100;

/// The persisted state of a stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedState {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Incremented on every mutation.
    #[serde(default)]
    pub serial: u64,
    /// Hash of the last spec applied.
    #[serde(default)]
    pub spec_hash: String,
    /// Applied resources keyed by logical name.
    #[serde(default)]
    pub resources: BTreeMap<String, AppliedResource>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Operation history (recent entries).
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// Snapshot of one resource as last applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedResource {
    /// Logical name.
    pub name: String,
    /// Resource type.
    pub resource_type: ResourceType,
    /// Provider-assigned identifier.
    pub physical_id: String,
    /// Properties as declared, references unresolved.
    pub properties: Properties,
    /// Properties as sent to the provider.
    #[serde(default)]
    pub resolved: Properties,
    /// Attributes exported by the provider.
    #[serde(default)]
    pub outputs: Properties,
    /// Logical names this resource depended on when applied.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Hash of `properties`.
    pub properties_hash: String,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A single entry in the operation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the operation finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: Operation,
    /// Spec hash at the time of the operation.
    pub spec_hash: String,
    /// Resources touched.
    pub resources: Vec<String>,
    /// Whether every action succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of recorded operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Plan applied.
    Apply,
    /// Every tracked resource destroyed.
    Destroy,
    /// Resource dropped from state without touching the provider.
    Forget,
}

impl AppliedState {
    /// Creates a new empty state.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            serial: 0,
            spec_hash: String::new(),
            resources: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Checks the format version.
    ///
    /// # Errors
    ///
    /// Returns `VersionMismatch` if the state was written by an incompatible format.
    pub fn check_version(&self) -> Result<()> {
        if self.version == STATE_VERSION {
            Ok(())
        } else {
            Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: self.version.clone(),
            }
            .into())
        }
    }

    /// Gets a resource by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AppliedResource> {
        self.resources.get(name)
    }

    /// Returns true if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Adds or replaces a resource.
    pub fn record(&mut self, resource: AppliedResource) {
        self.resources.insert(resource.name.clone(), resource);
        self.touch();
    }

    /// Removes a resource by name.
    pub fn remove(&mut self, name: &str) -> Option<AppliedResource> {
        let removed = self.resources.remove(name);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    /// Looks up an exported attribute; `id` yields the physical id.
    #[must_use]
    pub fn lookup_output(&self, name: &str, attribute: &str) -> Option<Value> {
        let resource = self.resources.get(name)?;
        if attribute == "id" {
            return Some(Value::String(resource.physical_id.clone()));
        }
        resource.outputs.get(attribute).cloned()
    }

    /// Adds a history entry.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
        self.touch();
    }

    /// Returns all resource names.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    fn touch(&mut self) {
        self.serial += 1;
        self.last_updated = Utc::now();
    }
}

impl HistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(operation: Operation, spec_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            spec_hash: spec_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(operation: Operation, spec_hash: &str, resources: Vec<String>, error: &str) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::new(operation, spec_hash, resources)
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Forget => "forget",
        };
        write!(f, "{op}")
    }
}
