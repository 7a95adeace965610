//! Stack file parsing and validation.
//!
//! Parses stack.yaml and validates structural constraints:
//! - Version must be "1.0"
//! - Stack name must not be empty
//! - Cluster name must be a valid DNS-style label
//! - Node group bounds: min_size <= node_count <= max_size
//! - At least one availability zone
//! - Tag templates must resolve

use super::error::{EngineError, Result};
use super::template::resolve_template;
use super::types::*;
use regex::Regex;
use std::path::Path;

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

fn invalid(message: impl Into<String>) -> ValidationError {
    ValidationError {
        message: message.into(),
    }
}

/// Parse a stack.yaml file from disk.
pub fn parse_config_file(path: &Path) -> Result<StackConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        EngineError::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    parse_config(&content)
}

/// Parse a stack.yaml from a string.
pub fn parse_config(yaml: &str) -> Result<StackConfig> {
    Ok(serde_yaml_ng::from_str(yaml)?)
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &StackConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(invalid(format!(
            "version must be \"1.0\", got \"{}\"",
            config.version
        )));
    }

    if config.name.trim().is_empty() {
        errors.push(invalid("name must not be empty"));
    }

    let s = &config.settings;
    let cluster_name = Regex::new(r"^[a-z][a-z0-9-]{0,62}$");
    if let Ok(re) = cluster_name {
        if !re.is_match(&s.cluster_name) {
            errors.push(invalid(format!(
                "settings.cluster_name '{}' must match ^[a-z][a-z0-9-]{{0,62}}$",
                s.cluster_name
            )));
        }
    }

    if s.min_size > s.node_count {
        errors.push(invalid(format!(
            "settings.min_size ({}) exceeds settings.node_count ({})",
            s.min_size, s.node_count
        )));
    }
    if s.node_count > s.max_size {
        errors.push(invalid(format!(
            "settings.node_count ({}) exceeds settings.max_size ({})",
            s.node_count, s.max_size
        )));
    }

    if s.availability_zones.is_empty() {
        errors.push(invalid("settings.availability_zones must not be empty"));
    }
    if s.region.trim().is_empty() {
        errors.push(invalid("settings.region must not be empty"));
    }

    if config.policy.retry.max_attempts == 0 {
        errors.push(invalid("policy.retry.max_attempts must be at least 1"));
    }

    for (key, value) in &config.tags {
        if let Err(e) = resolve_template(value, &config.settings, &config.params) {
            errors.push(invalid(format!("tag '{}': {}", key, e)));
        }
    }

    errors
}

/// Parse and validate; all validation errors are reported together.
pub fn load_config(path: &Path) -> Result<StackConfig> {
    let config = parse_config_file(path)?;
    let errors = validate_config(&config);
    if !errors.is_empty() {
        return Err(EngineError::Validation(
            errors.into_iter().map(|e| e.message).collect(),
        ));
    }
    tracing::debug!(stack = %config.name, path = %path.display(), "stack config loaded");
    Ok(config)
}
