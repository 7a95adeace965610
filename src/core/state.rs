//! State store: last-known resource state per stack.
//!
//! The executor is the only writer. [`FileStateStore`] keeps a YAML lock file
//! per stack and writes it atomically; [`MemoryStateStore`] keeps everything
//! in process.

use super::error::{EngineError, Result};
use super::types::{ExportValue, ResourceState, StateLock};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Resource states keyed by id, in apply order.
pub type StateMap = IndexMap<String, ResourceState>;

/// Resolved stack exports keyed by name.
pub type ExportMap = IndexMap<String, ExportValue>;

/// Key/value contract the executor persists through.
pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<StateMap>;

    fn save(&self, states: &StateMap) -> Result<()>;

    fn load_outputs(&self) -> Result<ExportMap> {
        Ok(ExportMap::new())
    }

    fn save_outputs(&self, _outputs: &ExportMap) -> Result<()> {
        Ok(())
    }
}

/// Derive the lock file path for a stack within the state directory.
pub fn lock_file_path(state_dir: &Path, stack: &str) -> PathBuf {
    state_dir.join(stack).join("state.lock.yaml")
}

/// Load a stack's lock file. Returns None if the file doesn't exist.
pub fn load_lock(state_dir: &Path, stack: &str) -> Result<Option<StateLock>> {
    let path = lock_file_path(state_dir, stack);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    let lock: StateLock = serde_yaml_ng::from_str(&content)
        .map_err(|e| EngineError::State(format!("invalid lock file {}: {}", path.display(), e)))?;
    if lock.stack != stack {
        return Err(EngineError::State(format!(
            "lock file {} belongs to stack '{}'",
            path.display(),
            lock.stack
        )));
    }
    Ok(Some(lock))
}

/// Save a lock file atomically (write to temp, then rename).
pub fn save_lock(state_dir: &Path, lock: &StateLock) -> Result<()> {
    let path = lock_file_path(state_dir, &lock.stack);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let yaml = serde_yaml_ng::to_string(lock)?;

    let tmp_path = path.with_extension("lock.yaml.tmp");
    std::fs::write(&tmp_path, &yaml)?;
    std::fs::rename(&tmp_path, &path).map_err(|e| {
        EngineError::State(format!(
            "cannot rename {} -> {}: {}",
            tmp_path.display(),
            path.display(),
            e
        ))
    })?;

    Ok(())
}

/// Create a new empty StateLock for a stack.
pub fn new_lock(stack: &str) -> StateLock {
    use crate::tripwire::eventlog::now_iso8601;
    StateLock {
        schema: "1.0".to_string(),
        stack: stack.to_string(),
        generated_at: now_iso8601(),
        generator: format!("infragraph {}", env!("CARGO_PKG_VERSION")),
        blake3_version: "1.8".to_string(),
        resources: IndexMap::new(),
        outputs: IndexMap::new(),
    }
}

/// YAML lock file under `<state_dir>/<stack>/state.lock.yaml`.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    state_dir: PathBuf,
    stack: String,
}

impl FileStateStore {
    pub fn new(state_dir: impl Into<PathBuf>, stack: impl Into<String>) -> Self {
        Self {
            state_dir: state_dir.into(),
            stack: stack.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        lock_file_path(&self.state_dir, &self.stack)
    }

    fn current(&self) -> Result<StateLock> {
        Ok(load_lock(&self.state_dir, &self.stack)?.unwrap_or_else(|| new_lock(&self.stack)))
    }

    fn write(&self, mut lock: StateLock) -> Result<()> {
        lock.generated_at = crate::tripwire::eventlog::now_iso8601();
        save_lock(&self.state_dir, &lock)
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<StateMap> {
        Ok(load_lock(&self.state_dir, &self.stack)?
            .map(|lock| lock.resources)
            .unwrap_or_default())
    }

    fn save(&self, states: &StateMap) -> Result<()> {
        let mut lock = self.current()?;
        lock.resources = states.clone();
        self.write(lock)
    }

    fn load_outputs(&self) -> Result<ExportMap> {
        Ok(load_lock(&self.state_dir, &self.stack)?
            .map(|lock| lock.outputs)
            .unwrap_or_default())
    }

    fn save_outputs(&self, outputs: &ExportMap) -> Result<()> {
        let mut lock = self.current()?;
        lock.outputs = outputs.clone();
        self.write(lock)
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    states: StateMap,
    outputs: ExportMap,
    saves: usize,
}

/// In-process store; clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save` calls so far.
    pub fn save_count(&self) -> usize {
        self.inner.lock().map(|i| i.saves).unwrap_or_default()
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| EngineError::State("memory store poisoned".to_string()))
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<StateMap> {
        Ok(self.locked()?.states.clone())
    }

    fn save(&self, states: &StateMap) -> Result<()> {
        let mut inner = self.locked()?;
        inner.states = states.clone();
        inner.saves += 1;
        Ok(())
    }

    fn load_outputs(&self) -> Result<ExportMap> {
        Ok(self.locked()?.outputs.clone())
    }

    fn save_outputs(&self, outputs: &ExportMap) -> Result<()> {
        self.locked()?.outputs = outputs.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ResourceKind, ResourceStatus};
    use serde_json::json;

    fn created(id: &str, kind: ResourceKind) -> ResourceState {
        let mut s = ResourceState::new(id, kind);
        s.provider_id = Some(format!("{}-0001", id));
        s.status = ResourceStatus::Created;
        s.properties_hash = "blake3:abc123".to_string();
        s.outputs = json!({"id": format!("{}-0001", id)});
        s
    }

    fn states() -> StateMap {
        let mut m = StateMap::new();
        m.insert("vpc".to_string(), created("vpc", ResourceKind::Vpc));
        m.insert(
            "igw".to_string(),
            created("igw", ResourceKind::InternetGateway),
        );
        m
    }

    #[test]
    fn test_lock_file_path() {
        let p = lock_file_path(Path::new("/state"), "prod");
        assert_eq!(p, PathBuf::from("/state/prod/state.lock.yaml"));
    }

    #[test]
    fn test_file_store_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path(), "dev");
        store.save(&states()).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["vpc"].status, ResourceStatus::Created);
        assert_eq!(loaded["igw"].provider_id.as_deref(), Some("igw-0001"));
    }

    #[test]
    fn test_file_store_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path(), "ghost");
        assert!(store.load().unwrap().is_empty());
        assert!(store.load_outputs().unwrap().is_empty());
    }

    #[test]
    fn test_atomic_write_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path(), "dev");
        store.save(&states()).unwrap();
        assert!(!dir.path().join("dev").join("state.lock.yaml.tmp").exists());
        assert!(store.path().exists());
    }

    #[test]
    fn test_outputs_survive_state_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path(), "dev");
        let mut outputs = ExportMap::new();
        outputs.insert(
            "vpcId".to_string(),
            ExportValue {
                value: json!("vpc-0001"),
                secret: false,
            },
        );
        store.save_outputs(&outputs).unwrap();
        store.save(&states()).unwrap();
        assert_eq!(store.load_outputs().unwrap()["vpcId"].value, json!("vpc-0001"));
        assert_eq!(store.load().unwrap().len(), 2);
    }

    #[test]
    fn test_roundtrip_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path(), "dev");
        let mut m = states();
        m.insert("aaa-first".to_string(), created("aaa-first", ResourceKind::Subnet));
        store.save(&m).unwrap();
        let keys: Vec<_> = store.load().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["vpc", "igw", "aaa-first"]);
    }

    #[test]
    fn test_lock_for_other_stack_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = new_lock("prod");
        lock.resources = states();
        save_lock(dir.path(), &lock).unwrap();
        std::fs::create_dir_all(dir.path().join("dev")).unwrap();
        std::fs::copy(
            lock_file_path(dir.path(), "prod"),
            lock_file_path(dir.path(), "dev"),
        )
        .unwrap();
        assert!(matches!(
            load_lock(dir.path(), "dev"),
            Err(EngineError::State(_))
        ));
    }

    #[test]
    fn test_new_lock() {
        let lock = new_lock("dev");
        assert_eq!(lock.stack, "dev");
        assert!(lock.generated_at.contains('T'));
        assert!(lock.generator.starts_with("infragraph "));
        assert!(lock.resources.is_empty());
    }

    #[test]
    fn test_memory_store_shared_between_clones() {
        let store = MemoryStateStore::new();
        let other = store.clone();
        store.save(&states()).unwrap();
        assert_eq!(other.load().unwrap().len(), 2);
        assert_eq!(other.save_count(), 1);
    }
}
