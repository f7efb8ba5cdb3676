//! Spec parser for loading stack files.
//!
//! This module handles loading specs from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, ConvergeError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::StackSpec;

/// Environment variable holding the provider bearer token.
pub const PROVIDER_TOKEN_VAR: &str = "CONVERGE_PROVIDER_TOKEN";

/// Parser for loading stack specs.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new spec parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Resolves a path from the spec against the base path.
    #[must_use]
    pub fn resolve_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        match &self.base_path {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Loads a spec from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackSpec> {
        let path = path.as_ref();
        info!("Loading spec from: {}", path.display());

        if !path.exists() {
            return Err(ConvergeError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a spec from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackSpec> {
        debug!("Parsing YAML spec");

        let spec: StackSpec = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed spec for project {} with {} resources",
            spec.project.name,
            spec.resources.len()
        );
        Ok(spec)
    }

    /// Loads a spec and applies environment variable overrides.
    ///
    /// Environment variables are checked in the format
    /// `CONVERGE_<SECTION>_<KEY>` (e.g., `CONVERGE_PROJECT_NAME`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackSpec> {
        let mut spec = self.load_file(path)?;
        Self::apply_env_overrides(&mut spec);
        Ok(spec)
    }

    /// Applies environment variable overrides to the spec.
    fn apply_env_overrides(spec: &mut StackSpec) {
        if let Ok(name) = std::env::var("CONVERGE_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            spec.project.name = name;
        }

        if let Ok(env) = std::env::var("CONVERGE_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            spec.project.environment = env;
        }

        if let Ok(bucket) = std::env::var("CONVERGE_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            spec.state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var("CONVERGE_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            spec.state.prefix = Some(prefix);
        }

        if let Ok(endpoint) = std::env::var("CONVERGE_PROVIDER_ENDPOINT") {
            debug!("Overriding provider.endpoint from environment");
            spec.provider.endpoint = Some(endpoint);
        }
    }

    /// Loads the .env file next to the spec, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self.resolve_path(".env");

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ConvergeError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Gets the provider bearer token from the environment (optional).
    #[must_use]
    pub fn provider_token() -> Option<String> {
        std::env::var(PROVIDER_TOKEN_VAR).ok().filter(|t| !t.is_empty())
    }
}

/// Default spec file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["converge.yaml", "converge.yml", "stack.yaml", "stack.yml"];

/// Finds the spec file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no spec file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found spec file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConvergeError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_minimal_spec() {
        let yaml = r"
project:
  name: test-project
";
        let spec = ConfigParser::new().parse_yaml(yaml, None).expect("parse");
        assert_eq!(spec.project.name, "test-project");
        assert_eq!(spec.project.environment, "dev");
        assert!(spec.resources.is_empty());
    }

    #[test]
    fn test_parse_error_is_config_error() {
        let err = ConfigParser::new()
            .parse_yaml("project: [unterminated", None)
            .expect_err("invalid yaml");
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_find_config_file_searches_parents() {
        let temp = TempDir::new().expect("temp dir");
        let nested = temp.path().join("a/b");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(temp.path().join("stack.yml"), "project:\n  name: x\n").expect("write");

        let found = find_config_file(&nested).expect("found");
        assert_eq!(found, temp.path().join("stack.yml"));
    }

    #[test]
    fn test_load_missing_file() {
        let temp = TempDir::new().expect("temp dir");
        let err = ConfigParser::new()
            .load_file(temp.path().join("converge.yaml"))
            .expect_err("missing");
        assert!(matches!(err, ConvergeError::Config(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_resolve_path() {
        let parser = ConfigParser::new().with_base_path("/srv/stack");
        assert_eq!(parser.resolve_path(".converge"), PathBuf::from("/srv/stack/.converge"));
        assert_eq!(parser.resolve_path("/var/state"), PathBuf::from("/var/state"));
    }
}
