//! Configuration module for converge.
//!
//! This module handles all spec-related functionality:
//! - Parsing and deserializing `converge.yaml`
//! - Validation of configuration values
//! - Computing spec and property hashes for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{find_config_file, ConfigParser, DEFAULT_CONFIG_FILES, PROVIDER_TOKEN_VAR};
pub use spec::{
    ExecutionConfig, GuardrailsConfig, ProjectConfig, Properties, ProviderConfig, ProviderKind, ResourceSpec,
    StackSpec, StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
