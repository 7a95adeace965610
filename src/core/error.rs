//! Engine error kinds.
//!
//! Structural errors (duplicate ids, cycles, unknown dependencies, invalid
//! properties) are raised before any provider call. Provider errors are
//! resource-local and end up in the apply report; `ApplyFailed` is the
//! aggregate raised once a run finishes with failed or skipped resources.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("duplicate resource id: {0}")]
    DuplicateId(String),

    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("resource '{resource}' depends on unknown resource '{dependency}'")]
    UnknownDependency { resource: String, dependency: String },

    #[error("output of '{0}' already resolved")]
    AlreadyResolved(String),

    #[error("resource '{resource}' references unresolved output of '{dependency}'")]
    Unresolved { resource: String, dependency: String },

    #[error("projection on '{resource}' failed: {message}")]
    Projection { resource: String, message: String },

    #[error("transient provider error on '{resource}': {message}")]
    ProviderTransient { resource: String, message: String },

    #[error("provider error on '{resource}': {message}")]
    ProviderPermanent { resource: String, message: String },

    #[error("resource '{resource}' skipped: dependency '{upstream}' failed")]
    DependencyFailed { resource: String, upstream: String },

    #[error("invalid properties on '{resource}': {}", .errors.join("; "))]
    InvalidProperties {
        resource: String,
        errors: Vec<String>,
    },

    #[error("{} validation error(s): {}", .0.len(), .0.join("; "))]
    Validation(Vec<String>),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("state error: {0}")]
    State(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("apply finished with {failed} failed and {skipped} skipped resource(s)")]
    ApplyFailed { failed: usize, skipped: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether the error is a structural error raised before any provider call.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::DuplicateId(_)
                | Self::CycleDetected(_)
                | Self::UnknownDependency { .. }
                | Self::InvalidProperties { .. }
                | Self::Validation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display_names_every_node() {
        let err = EngineError::CycleDetected(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_structural_classification() {
        assert!(EngineError::DuplicateId("x".into()).is_structural());
        assert!(EngineError::CycleDetected(vec![]).is_structural());
        assert!(!EngineError::Cancelled.is_structural());
        assert!(!EngineError::ProviderTransient {
            resource: "x".into(),
            message: "throttled".into()
        }
        .is_structural());
    }

    #[test]
    fn test_invalid_properties_display() {
        let err = EngineError::InvalidProperties {
            resource: "vpc".into(),
            errors: vec!["missing 'cidr_block'".into(), "unknown key 'x'".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("vpc"));
        assert!(msg.contains("missing 'cidr_block'; unknown key 'x'"));
    }
}
