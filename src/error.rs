//! Error types for the converge reconciler.
//!
//! Every failure that can surface while loading a stack, building its graph,
//! planning, applying or persisting state maps into [`ConvergeError`]. Errors
//! that concern a single resource carry its logical name.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The main error type for converge.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Spec loading, validation and graph construction errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider control-plane errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Apply errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Spec loading, validation and graph construction errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The spec file was not found.
    #[error("Spec file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The spec file could not be parsed.
    #[error("Failed to parse spec: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Spec validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// A resource declares a type that has no operation table.
    #[error("Resource '{resource}' has unknown type '{type_name}'")]
    UnknownResourceType {
        /// Logical name of the resource.
        resource: String,
        /// The unrecognised type string.
        type_name: String,
    },

    /// Dependency edges form a cycle.
    #[error("Circular dependency detected: {cycle}")]
    CircularDependency {
        /// Members of the cycle, joined with arrows.
        cycle: String,
    },

    /// A dependency or reference targets an undefined resource.
    #[error("Resource '{resource}' references undefined resource '{target}'")]
    DanglingReference {
        /// Logical name of the referencing resource.
        resource: String,
        /// The missing target.
        target: String,
    },

    /// A reference is malformed or points at an attribute that is not exported.
    #[error("Resource '{resource}' has invalid reference '{reference}': {reason}")]
    InvalidReference {
        /// Logical name of the referencing resource.
        resource: String,
        /// The reference as written.
        reference: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is unreadable. Requires manual recovery.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// The session lock was released or taken over while still in use.
    #[error("State lock {lock_id} is no longer held by this process")]
    LockLost {
        /// Identifier of the lost lock.
        lock_id: String,
    },

    /// Writing state to the local backend failed.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the write failure.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },

    /// The named resource is not tracked in state.
    #[error("Resource '{name}' is not tracked in state")]
    ResourceNotTracked {
        /// Logical name of the resource.
        name: String,
    },
}

/// Provider control-plane errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The control plane asked us to slow down.
    #[error("Rate limited while handling '{resource}'")]
    RateLimited {
        /// Logical name of the resource.
        resource: String,
        /// Seconds to wait before retrying, when the provider said so.
        retry_after_secs: Option<u64>,
    },

    /// Eventual-consistency lag, upstream unavailability or a network failure.
    #[error("Transient failure for '{resource}': {message}")]
    Transient {
        /// Logical name of the resource.
        resource: String,
        /// Description of the failure.
        message: String,
    },

    /// The request was rejected and will not succeed on retry.
    #[error("Provider rejected '{resource}': {message}")]
    Permanent {
        /// Logical name of the resource.
        resource: String,
        /// Description of the rejection.
        message: String,
        /// HTTP status, when one was returned.
        status: Option<u16>,
    },

    /// The physical resource does not exist.
    #[error("Resource '{resource}' not found (physical id {physical_id})")]
    NotFound {
        /// Logical name of the resource.
        resource: String,
        /// Provider-assigned identifier that was looked up.
        physical_id: String,
    },

    /// Credentials were rejected.
    #[error("Provider authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// The provider answered with something we could not decode.
    #[error("Invalid provider response for '{resource}': {message}")]
    InvalidResponse {
        /// Logical name of the resource.
        resource: String,
        /// Description of the response issue.
        message: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The plan breaks a configured guardrail.
    #[error("Plan violates guardrails: {}", .violations.join("; "))]
    GuardrailViolation {
        /// Human-readable violations.
        violations: Vec<String>,
    },

    /// `--target` named a resource that is neither desired nor tracked.
    #[error("Target resource '{target}' is not defined in the spec or state")]
    UnknownTarget {
        /// The requested target.
        target: String,
    },

    /// A reference could not be resolved from applied outputs.
    #[error("Failed to resolve dependencies of '{resource}': {message}")]
    DependencyResolutionFailed {
        /// Logical name of the resource.
        resource: String,
        /// Description of the dependency issue.
        message: String,
    },
}

/// Apply errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Retries were exhausted on a transient failure.
    #[error("Maximum retry attempts ({attempts}) exceeded for '{resource}': {last_error}")]
    MaxRetriesExceeded {
        /// Logical name of the resource.
        resource: String,
        /// Number of attempts made.
        attempts: u32,
        /// The final transient error.
        last_error: String,
    },

    /// One or more actions failed; dependents were skipped.
    #[error("{failed} action(s) failed and {skipped} were skipped (first failure: {first_failure})")]
    ActionsFailed {
        /// Number of failed actions.
        failed: usize,
        /// Number of skipped actions.
        skipped: usize,
        /// Message of the first failure in plan order.
        first_failure: String,
    },

    /// The run was cancelled before every action was dispatched.
    #[error("Apply cancelled: {reason}")]
    Cancelled {
        /// Why the run was cancelled.
        reason: String,
    },
}

/// Result type alias for converge operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(ProviderError::RateLimited { .. } | ProviderError::Transient { .. })
                | Self::State(StateError::LockFailed { .. })
        )
    }

    /// Returns the delay the provider asked for, if any.
    #[must_use]
    pub const fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::Provider(ProviderError::RateLimited {
                retry_after_secs: Some(secs),
                ..
            }) => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }

    /// Returns true if the error is a provider not-found.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Provider(ProviderError::NotFound { .. }))
    }

    /// Maps the error onto the process exit status.
    ///
    /// Malformed specs and plans refused before any side effect exit with 2,
    /// everything else with 1.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::Plan(PlanError::GuardrailViolation { .. } | PlanError::UnknownTarget { .. }) => 2,
            _ => 1,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a local write error with the given message.
    #[must_use]
    pub fn write_failed(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a transient error for a resource.
    #[must_use]
    pub fn transient(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Creates a permanent error for a resource.
    #[must_use]
    pub fn permanent(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            resource: resource.into(),
            message: message.into(),
            status: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        let err = ConvergeError::from(ProviderError::transient("cluster", "eventual consistency"));
        assert!(err.is_retryable());

        let err = ConvergeError::from(ProviderError::RateLimited {
            resource: String::from("cluster"),
            retry_after_secs: Some(3),
        });
        assert!(err.is_retryable());
        assert_eq!(err.retry_delay(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_permanent_errors_are_not_retryable() {
        let err = ConvergeError::from(ProviderError::permanent("addon", "invalid addon name"));
        assert!(!err.is_retryable());
        assert_eq!(err.retry_delay(), None);
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_exit_codes() {
        let err = ConvergeError::from(ConfigError::CircularDependency {
            cycle: String::from("a -> b -> a"),
        });
        assert_eq!(err.exit_code(), 2);

        let err = ConvergeError::from(StateError::corrupted("truncated"));
        assert_eq!(err.exit_code(), 1);

        let err = ConvergeError::from(PlanError::GuardrailViolation {
            violations: vec![String::from("too many deletes")],
        });
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_errors_name_the_resource() {
        let err = ConvergeError::from(ConfigError::DanglingReference {
            resource: String::from("ebs-csi-driver"),
            target: String::from("missing-role"),
        });
        let message = err.to_string();
        assert!(message.contains("ebs-csi-driver"));
        assert!(message.contains("missing-role"));
    }
}
