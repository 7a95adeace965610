//! Drift detection: compare provider-side properties to recorded hashes.

use crate::core::state::StateMap;
use crate::core::types::{ProvenanceEvent, ResourceKind};
use crate::provider::{Provider, ProviderError};
use crate::tripwire::eventlog::EventLog;
use crate::tripwire::hasher;
use tracing::{debug, warn};

/// Actual hash recorded when the provider no longer has the object.
pub const MISSING: &str = "MISSING";

/// A single drift finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftFinding {
    pub resource_id: String,
    pub kind: ResourceKind,
    pub expected_hash: String,
    pub actual_hash: String,
    pub detail: String,
}

/// Outcome of one drift pass.
#[derive(Debug, Clone, Default)]
pub struct DriftReport {
    pub findings: Vec<DriftFinding>,
    /// Provisioned resources that were compared
    pub checked: usize,
    /// Resources the provider cannot read back
    pub unsupported: Vec<String>,
    /// Resources whose read failed
    pub errors: Vec<(String, String)>,
}

impl DriftReport {
    pub fn has_drift(&self) -> bool {
        !self.findings.is_empty()
    }
}

/// Read every provisioned resource back and compare its property hash.
///
/// When `events` is given, every finding is appended as a `drift_detected` event.
pub async fn detect_drift(
    provider: &dyn Provider,
    states: &StateMap,
    events: Option<&EventLog>,
) -> DriftReport {
    let mut report = DriftReport::default();

    for (id, state) in states {
        if !state.is_provisioned() {
            continue;
        }
        let Some(provider_id) = state.provider_id.as_deref() else {
            continue;
        };
        report.checked += 1;

        let finding = match provider.read(state.kind, provider_id).await {
            Ok(None) => Some(DriftFinding {
                resource_id: id.clone(),
                kind: state.kind,
                expected_hash: state.properties_hash.clone(),
                actual_hash: MISSING.to_string(),
                detail: format!("{} {} no longer exists", state.kind, provider_id),
            }),
            Ok(Some(actual)) => {
                let actual_hash = hasher::hash_properties(state.kind, &actual);
                if actual_hash == state.properties_hash {
                    debug!(resource = %id, "no drift");
                    None
                } else {
                    Some(DriftFinding {
                        resource_id: id.clone(),
                        kind: state.kind,
                        expected_hash: state.properties_hash.clone(),
                        actual_hash,
                        detail: changed_keys(&state.last_applied, &actual),
                    })
                }
            }
            Err(ProviderError::Unsupported(_)) => {
                report.unsupported.push(id.clone());
                None
            }
            Err(e) => {
                warn!(resource = %id, error = %e, "drift read failed");
                report.errors.push((id.clone(), e.to_string()));
                None
            }
        };

        if let Some(finding) = finding {
            warn!(resource = %finding.resource_id, detail = %finding.detail, "drift detected");
            if let Some(log) = events {
                log.record(ProvenanceEvent::DriftDetected {
                    stack: log.stack().to_string(),
                    resource: finding.resource_id.clone(),
                    expected_hash: finding.expected_hash.clone(),
                    actual_hash: finding.actual_hash.clone(),
                });
            }
            report.findings.push(finding);
        }
    }

    report
}

/// Top-level keys whose values differ between two property objects.
fn changed_keys(expected: &serde_json::Value, actual: &serde_json::Value) -> String {
    let empty = serde_json::Map::new();
    let expected = expected.as_object().unwrap_or(&empty);
    let actual = actual.as_object().unwrap_or(&empty);

    let mut keys: Vec<&str> = expected
        .iter()
        .filter(|(k, v)| actual.get(*k) != Some(*v))
        .map(|(k, _)| k.as_str())
        .chain(
            actual
                .keys()
                .filter(|k| !expected.contains_key(*k))
                .map(String::as_str),
        )
        .collect();
    keys.sort_unstable();
    keys.dedup();

    if keys.is_empty() {
        "properties changed".to_string()
    } else {
        format!("changed: {}", keys.join(", "))
    }
}
