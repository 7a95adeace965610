//! Provider SDK contract.
//!
//! One call per lifecycle step. Implementations must be safe to retry or
//! report `AlreadyExists`/`NotFound` so the executor can tell a repeated call
//! from a real failure.

pub mod local;

use crate::core::error::EngineError;
use crate::core::types::ResourceKind;
use async_trait::async_trait;
use thiserror::Error;

pub use local::LocalProvider;

/// Provider-side failure of a single call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Throttling, timeouts, eventual-consistency races; worth retrying
    #[error("transient: {0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Attribute the failure to a resource.
    pub fn into_engine(self, resource: &str) -> EngineError {
        match self {
            Self::Transient(message) => EngineError::ProviderTransient {
                resource: resource.to_string(),
                message,
            },
            other => EngineError::ProviderPermanent {
                resource: resource.to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    pub provider_id: String,
    /// Result properties other resources may project from
    pub outputs: serde_json::Value,
}

/// A cloud (or simulation of one) the executor drives.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Returns the provider name (e.g., "local")
    fn name(&self) -> &str;

    async fn create(
        &self,
        kind: ResourceKind,
        name: &str,
        properties: &serde_json::Value,
    ) -> Result<Created, ProviderError>;

    async fn update(
        &self,
        kind: ResourceKind,
        provider_id: &str,
        properties: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError>;

    async fn delete(&self, kind: ResourceKind, provider_id: &str) -> Result<(), ProviderError>;

    /// Current provider-side properties; `None` when the object is gone.
    async fn read(
        &self,
        kind: ResourceKind,
        provider_id: &str,
    ) -> Result<Option<serde_json::Value>, ProviderError> {
        let _ = provider_id;
        Err(ProviderError::Unsupported(format!("read {}", kind)))
    }
}
