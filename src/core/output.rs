//! Deferred output propagation.
//!
//! Every resource owns one publish slot. Consumers obtain an [`OutputHandle`]
//! via `defer` and read it without blocking or await it; the executor is the
//! only writer and publishes each resource's result exactly once. Property
//! bags are resolved against an [`OutputSnapshot`] taken once per batch.

use super::error::{EngineError, Result};
use super::types::{OutputRef, Projection, Value};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::sync::watch;

type Slot = watch::Sender<Option<Arc<serde_json::Value>>>;

/// Single-writer registry of resource results.
#[derive(Debug, Default)]
pub struct OutputResolver {
    slots: FxHashMap<String, Slot>,
}

impl OutputResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, resource_id: &str) -> &Slot {
        self.slots
            .entry(resource_id.to_string())
            .or_insert_with(|| watch::channel(None).0)
    }

    /// Create a placeholder for a projection of `resource_id`'s result.
    pub fn defer(&mut self, resource_id: &str, projection: Projection) -> OutputHandle {
        let rx = self.slot(resource_id).subscribe();
        OutputHandle {
            resource_id: resource_id.to_string(),
            projection,
            rx,
        }
    }

    /// Publish the result of `resource_id`. Fails on a second call and keeps
    /// the first value.
    pub fn resolve(&mut self, resource_id: &str, value: serde_json::Value) -> Result<()> {
        let slot = self.slot(resource_id);
        if slot.borrow().is_some() {
            return Err(EngineError::AlreadyResolved(resource_id.to_string()));
        }
        slot.send_replace(Some(Arc::new(value)));
        tracing::trace!(resource = resource_id, "output resolved");
        Ok(())
    }

    pub fn is_resolved(&self, resource_id: &str) -> bool {
        self.get(resource_id).is_some()
    }

    pub fn get(&self, resource_id: &str) -> Option<Arc<serde_json::Value>> {
        self.slots
            .get(resource_id)
            .and_then(|slot| slot.borrow().clone())
    }

    pub fn resolved_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| slot.borrow().is_some())
            .count()
    }

    /// A consistent view of every resolved result.
    pub fn snapshot(&self) -> OutputSnapshot {
        let values = self
            .slots
            .iter()
            .filter_map(|(id, slot)| slot.borrow().clone().map(|v| (id.clone(), v)))
            .collect();
        OutputSnapshot { values }
    }
}

/// Placeholder for a projected output.
#[derive(Debug)]
pub struct OutputHandle {
    resource_id: String,
    projection: Projection,
    rx: watch::Receiver<Option<Arc<serde_json::Value>>>,
}

impl OutputHandle {
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// The projected value if the producer has resolved.
    pub fn get(&self) -> Option<Result<serde_json::Value>> {
        let current = self.rx.borrow().clone();
        current.map(|v| self.apply(&v))
    }

    /// Wait until the producer resolves, then project.
    pub async fn wait(&mut self) -> Result<serde_json::Value> {
        let value = {
            let guard = self
                .rx
                .wait_for(Option::is_some)
                .await
                .map_err(|_| EngineError::Unresolved {
                    resource: "<handle>".to_string(),
                    dependency: self.resource_id.clone(),
                })?;
            (*guard).clone()
        };
        match value {
            Some(v) => self.apply(&v),
            None => Err(EngineError::Unresolved {
                resource: "<handle>".to_string(),
                dependency: self.resource_id.clone(),
            }),
        }
    }

    fn apply(&self, value: &serde_json::Value) -> Result<serde_json::Value> {
        self.projection
            .apply(value)
            .map_err(|message| EngineError::Projection {
                resource: self.resource_id.clone(),
                message,
            })
    }
}

/// Immutable copy of the resolved results at one point in a run.
#[derive(Debug, Clone, Default)]
pub struct OutputSnapshot {
    values: FxHashMap<String, Arc<serde_json::Value>>,
}

impl OutputSnapshot {
    pub fn get(&self, resource_id: &str) -> Option<&serde_json::Value> {
        self.values.get(resource_id).map(|v| v.as_ref())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Project one output reference on behalf of `consumer`.
    pub fn project(&self, output: &OutputRef, consumer: &str) -> Result<serde_json::Value> {
        let value = self
            .values
            .get(&output.resource_id)
            .ok_or_else(|| EngineError::Unresolved {
                resource: consumer.to_string(),
                dependency: output.resource_id.clone(),
            })?;
        output
            .projection
            .apply(value)
            .map_err(|message| EngineError::Projection {
                resource: output.resource_id.clone(),
                message,
            })
    }

    /// Turn a value tree into concrete JSON.
    pub fn resolve_value(&self, value: &Value, consumer: &str) -> Result<serde_json::Value> {
        match value {
            Value::Literal(v) => Ok(v.clone()),
            Value::Output(r) => self.project(r, consumer),
            Value::List(items) => items
                .iter()
                .map(|item| self.resolve_value(item, consumer))
                .collect::<Result<Vec<_>>>()
                .map(serde_json::Value::Array),
            Value::Map(entries) => {
                let mut map = serde_json::Map::with_capacity(entries.len());
                for (k, v) in entries {
                    map.insert(k.clone(), self.resolve_value(v, consumer)?);
                }
                Ok(serde_json::Value::Object(map))
            }
            Value::Concat(parts) => {
                let mut joined = String::new();
                for part in parts {
                    match self.resolve_value(part, consumer)? {
                        serde_json::Value::String(s) => joined.push_str(&s),
                        serde_json::Value::Null => {}
                        other => joined.push_str(&other.to_string()),
                    }
                }
                Ok(serde_json::Value::String(joined))
            }
        }
    }

    /// Resolve a whole property bag into a JSON object.
    pub fn resolve_properties(
        &self,
        properties: &IndexMap<String, Value>,
        consumer: &str,
    ) -> Result<serde_json::Value> {
        let mut map = serde_json::Map::with_capacity(properties.len());
        for (k, v) in properties {
            map.insert(k.clone(), self.resolve_value(v, consumer)?);
        }
        Ok(serde_json::Value::Object(map))
    }
}
