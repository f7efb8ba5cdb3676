//! Spec document types.
//!
//! This module defines the structs that map to `converge.yaml`. A spec is a
//! flat map of logical resource names to typed property bags, plus the
//! project, state, provider and execution settings used to reconcile it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Property bag of a resource. Ordered so hashing and diffs are deterministic.
pub type Properties = BTreeMap<String, serde_json::Value>;

/// The root of a converge spec file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackSpec {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider control-plane configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Executor tuning.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Optional guardrails applied to every plan.
    #[serde(default)]
    pub guardrails: Option<GuardrailsConfig>,
    /// Desired resources keyed by logical name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceSpec>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Provider control-plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Which provider implementation to use.
    #[serde(default)]
    pub kind: ProviderKind,
    /// Base URL of the control-plane API (http only).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Backing file for the simulated control plane.
    #[serde(default)]
    pub path: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Provider implementations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// In-process control plane, optionally persisted to a JSON file.
    #[default]
    Simulated,
    /// Remote control plane spoken to over HTTP.
    Http,
}

/// Executor tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Maximum number of actions in flight.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Attempts per provider call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Initial retry delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on a single retry delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Stop dispatching new actions after this many seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Plan guardrails.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct GuardrailsConfig {
    /// Refuse plans that delete or replace more than this many resources.
    #[serde(default)]
    pub max_deletes: Option<usize>,
    /// Resources that must never be deleted or replaced.
    #[serde(default)]
    pub protected: Vec<String>,
}

/// Declaration of a single resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    /// Resource type name (e.g. `cluster`, `addon`).
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Explicit dependencies by logical name.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Desired properties. String values may contain `${name.attr}` references.
    #[serde(default)]
    pub properties: Properties,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            endpoint: None,
            path: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            timeout_secs: None,
        }
    }
}

// Default value functions

fn default_environment() -> String {
    String::from("dev")
}

const fn default_request_timeout() -> u64 {
    30
}

const fn default_parallelism() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_delay_ms() -> u64 {
    500
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

impl StackSpec {
    /// Returns the fully qualified project name (project-environment).
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Gets a resource declaration by logical name.
    #[must_use]
    pub fn get_resource(&self, name: &str) -> Option<&ResourceSpec> {
        self.resources.get(name)
    }

    /// Returns true if the resource is listed as protected.
    #[must_use]
    pub fn is_protected(&self, name: &str) -> bool {
        self.guardrails
            .as_ref()
            .is_some_and(|g| g.protected.iter().any(|p| p == name))
    }
}

impl std::fmt::Display for StateBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::S3 => write!(f, "s3"),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simulated => write!(f, "simulated"),
            Self::Http => write!(f, "http"),
        }
    }
}
