//! Spec validation.
//!
//! Structural problems (unknown types, dangling references, cycles) are the
//! graph builder's job. This module checks values: names, backend settings,
//! executor tuning and per-type property rules.

use crate::error::{ConfigError, ConvergeError, Result};
use crate::resource::ResourceType;
use std::collections::HashSet;
use tracing::debug;

use super::spec::{ExecutionConfig, ProjectConfig, ProviderConfig, ProviderKind, StackSpec, StateBackend, StateConfig};

/// Validator for stack specs.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all problems found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a spec, failing on the first error.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` naming the first offending field.
    pub fn validate(&self, spec: &StackSpec) -> Result<ValidationResult> {
        let result = self.check(spec);

        if let Some(first_error) = result.errors.first() {
            let message = if result.errors.len() > 1 {
                format!("{} (and {} more)", first_error.message, result.errors.len() - 1)
            } else {
                first_error.message.clone()
            };
            return Err(ConvergeError::Config(ConfigError::ValidationError {
                message,
                field: Some(first_error.field.clone()),
            }));
        }

        debug!("Spec validation passed with {} warnings", result.warnings.len());
        Ok(result)
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, spec: &StackSpec) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&spec.project, &mut result);
        Self::validate_state(&spec.state, &mut result);
        Self::validate_provider(&spec.provider, &mut result);
        Self::validate_execution(&spec.execution, &mut result);
        Self::validate_resources(spec, &mut result);
        Self::validate_guardrails(spec, &mut result);

        result
    }

    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error("state.bucket", "S3 bucket name is required when using S3 backend");
                }
                if state.path.is_some() {
                    result.warn("state.path is ignored by the S3 backend");
                }
            }
            StateBackend::Local => {
                if state.path.as_ref().is_some_and(String::is_empty) {
                    result.error("state.path", "Local state path cannot be empty");
                }
                if state.bucket.is_some() {
                    result.warn("state.bucket is ignored by the local backend");
                }
            }
        }
    }

    fn validate_provider(provider: &ProviderConfig, result: &mut ValidationResult) {
        match provider.kind {
            ProviderKind::Http => match provider.endpoint.as_deref() {
                None | Some("") => {
                    result.error("provider.endpoint", "An endpoint is required for the http provider");
                }
                Some(endpoint) if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") => {
                    result.error(
                        "provider.endpoint",
                        format!("Endpoint '{endpoint}' must start with http:// or https://"),
                    );
                }
                Some(_) => {}
            },
            ProviderKind::Simulated => {
                if provider.endpoint.is_some() {
                    result.warn("provider.endpoint is ignored by the simulated provider");
                }
            }
        }

        if provider.request_timeout_secs == 0 {
            result.error("provider.request_timeout_secs", "Request timeout must be at least 1 second");
        }
    }

    fn validate_execution(execution: &ExecutionConfig, result: &mut ValidationResult) {
        if execution.parallelism == 0 {
            result.error("execution.parallelism", "Parallelism must be at least 1");
        }
        if execution.max_attempts == 0 {
            result.error("execution.max_attempts", "max_attempts must be at least 1");
        }
        if execution.base_delay_ms > execution.max_delay_ms {
            result.error(
                "execution.base_delay_ms",
                format!(
                    "base_delay_ms ({}) cannot exceed max_delay_ms ({})",
                    execution.base_delay_ms, execution.max_delay_ms
                ),
            );
        }
        if execution.timeout_secs == Some(0) {
            result.error("execution.timeout_secs", "Timeout must be at least 1 second when set");
        }
    }

    fn validate_resources(spec: &StackSpec, result: &mut ValidationResult) {
        if spec.resources.is_empty() {
            result.warn("No resources defined; apply will only delete tracked resources");
        }

        for (name, declared) in &spec.resources {
            let prefix = format!("resources.{name}");

            if !is_valid_name(name) {
                result.error(
                    &prefix,
                    format!("Resource name '{name}' is invalid. Must be lowercase alphanumeric with hyphens."),
                );
            }

            // Unknown types are reported by the graph builder.
            let Some(resource_type) = ResourceType::parse(&declared.resource_type) else {
                continue;
            };
            let ops = resource_type.ops();

            for missing in ops.missing_required(&declared.properties) {
                result.error(
                    format!("{prefix}.properties.{missing}"),
                    format!("Resource '{name}' ({resource_type}) is missing required property '{missing}'"),
                );
            }

            for problem in ops.validate(&declared.properties) {
                result.error(
                    format!("{prefix}.properties"),
                    format!("Resource '{name}' ({resource_type}): {problem}"),
                );
            }

            let mut seen = HashSet::new();
            for dep in &declared.depends_on {
                if !seen.insert(dep.as_str()) {
                    result.warn(format!("Resource '{name}' lists '{dep}' in depends_on more than once"));
                }
            }
        }
    }

    fn validate_guardrails(spec: &StackSpec, result: &mut ValidationResult) {
        let Some(guardrails) = &spec.guardrails else {
            return;
        };

        for protected in &guardrails.protected {
            if !spec.resources.contains_key(protected) {
                result.warn(format!("Protected resource '{protected}' is not defined in the spec"));
            }
        }

        if guardrails.max_deletes == Some(0) {
            result.warn("guardrails.max_deletes is 0; any delete or replace will be refused");
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() {
        return false;
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
