use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::debug;
use serde::{Deserialize, Serialize};

pub const ARTIFACT_NAME_KEY: &str = "artifact-name";
pub const ARTIFACT_GROUP_KEY: &str = "artifact-group";
pub const ARTIFACT_PROVIDES_KEY: &str = "artifact-provides";
pub const STATE_DATA_KEY: &str = "state";
pub const STANDALONE_STATE_KEY: &str = "standalone-state";
pub const STATE_DATA_UNCOMMITTED_KEY: &str = "state-uncommitted";
pub const UPDATE_CONTROL_MAPS_KEY: &str = "update-control-maps";

pub const STATE_DATA_VERSION: u32 = 1;

const STORE_FILE: &str = "mender-store.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Absent keys are not a fault; callers treat this as "no such record".
    #[error("key not found in the store: {0}")]
    KeyError(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt store content: {0}")]
    Parse(String),
}

type StoreResult<T> = std::result::Result<T, StoreError>;

pub trait Transaction {
    fn read(&self, key: &str) -> StoreResult<Vec<u8>>;
    fn write(&mut self, key: &str, value: &[u8]) -> StoreResult<()>;
    fn remove(&mut self, key: &str) -> StoreResult<()>;
}

/// Keyed byte store with closure-scoped transactions. A write transaction
/// whose closure errors leaves the store untouched.
pub trait KeyValueStore: Send + Sync {
    fn read(&self, key: &str) -> StoreResult<Vec<u8>>;
    fn write(&self, key: &str, value: &[u8]) -> StoreResult<()>;
    fn remove(&self, key: &str) -> StoreResult<()>;

    fn read_transaction(
        &self,
        func: &mut dyn FnMut(&dyn Transaction) -> StoreResult<()>,
    ) -> StoreResult<()>;

    fn write_transaction(
        &self,
        func: &mut dyn FnMut(&mut dyn Transaction) -> StoreResult<()>,
    ) -> StoreResult<()>;
}

struct MapTransaction {
    map: BTreeMap<String, Vec<u8>>,
}

impl Transaction for MapTransaction {
    fn read(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.map
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::KeyError(key.to_string()))
    }

    fn write(&mut self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.map.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> StoreResult<()> {
        self.map.remove(key);
        Ok(())
    }
}

/// In-memory engine; used by tests, mirrors the durable engine's semantics.
#[derive(Default)]
pub struct MemStore {
    map: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_map(map: &Mutex<BTreeMap<String, Vec<u8>>>) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
    // A poisoned store mutex means a panic already tore down an invariant;
    // propagating the panic is the only safe answer.
    map.lock().unwrap_or_else(|err| err.into_inner())
}

impl KeyValueStore for MemStore {
    fn read(&self, key: &str) -> StoreResult<Vec<u8>> {
        lock_map(&self.map)
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::KeyError(key.to_string()))
    }

    fn write(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        lock_map(&self.map).insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        lock_map(&self.map).remove(key);
        Ok(())
    }

    fn read_transaction(
        &self,
        func: &mut dyn FnMut(&dyn Transaction) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let snapshot = MapTransaction {
            map: lock_map(&self.map).clone(),
        };
        func(&snapshot)
    }

    fn write_transaction(
        &self,
        func: &mut dyn FnMut(&mut dyn Transaction) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let mut guard = lock_map(&self.map);
        let mut staged = MapTransaction {
            map: guard.clone(),
        };
        func(&mut staged)?;
        *guard = staged.map;
        Ok(())
    }
}

/// Durable single-file engine standing behind the same trait as the real
/// key-value database. Values are hex-encoded into one JSON document; every
/// committed transaction is written to a temporary file and renamed over the
/// old one.
pub struct FileStore {
    path: PathBuf,
    map: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl FileStore {
    pub fn open(path: PathBuf) -> StoreResult<Self> {
        let map = if path.exists() {
            let content = fs::read_to_string(&path)?;
            let encoded: BTreeMap<String, String> = serde_json::from_str(&content)
                .map_err(|err| StoreError::Parse(format!("{}: {err}", path.display())))?;
            let mut map = BTreeMap::new();
            for (key, value) in encoded {
                let bytes = hex::decode(&value)
                    .map_err(|err| StoreError::Parse(format!("key {key}: {err}")))?;
                map.insert(key, bytes);
            }
            map
        } else {
            BTreeMap::new()
        };
        debug!("opened store at {} with {} key(s)", path.display(), map.len());
        Ok(Self {
            path,
            map: Mutex::new(map),
        })
    }

    fn persist(&self, map: &BTreeMap<String, Vec<u8>>) -> StoreResult<()> {
        let encoded: BTreeMap<String, String> =
            map.iter().map(|(k, v)| (k.clone(), hex::encode(v))).collect();
        let content = serde_json::to_string_pretty(&encoded)
            .map_err(|err| StoreError::Parse(err.to_string()))?;

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn read(&self, key: &str) -> StoreResult<Vec<u8>> {
        lock_map(&self.map)
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::KeyError(key.to_string()))
    }

    fn write(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let mut guard = lock_map(&self.map);
        let mut staged = guard.clone();
        staged.insert(key.to_string(), value.to_vec());
        self.persist(&staged)?;
        *guard = staged;
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        let mut guard = lock_map(&self.map);
        let mut staged = guard.clone();
        staged.remove(key);
        self.persist(&staged)?;
        *guard = staged;
        Ok(())
    }

    fn read_transaction(
        &self,
        func: &mut dyn FnMut(&dyn Transaction) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let snapshot = MapTransaction {
            map: lock_map(&self.map).clone(),
        };
        func(&snapshot)
    }

    fn write_transaction(
        &self,
        func: &mut dyn FnMut(&mut dyn Transaction) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let mut guard = lock_map(&self.map);
        let mut staged = MapTransaction {
            map: guard.clone(),
        };
        func(&mut staged)?;
        self.persist(&staged.map)?;
        *guard = staged.map;
        Ok(())
    }
}

/// The state record persisted across reboots so an interrupted update can be
/// resumed (or reconciled) by the next run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateData {
    pub version: u32,
    pub artifact_name: String,
    pub artifact_group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_provides: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_clears_provides: Option<Vec<String>>,
    pub payload_types: Vec<String>,
    /// Name of the last durably-entered state.
    pub in_state: String,
    pub failed: bool,
    pub rolled_back: bool,
}

/// Simple `*` wildcard match, for `clears_artifact_provides` patterns like
/// `rootfs-image.*`.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    if let Some(rest) = pattern.strip_prefix('*') {
        (0..=value.len())
            .any(|i| value.is_char_boundary(i) && wildcard_match(rest, &value[i..]))
    } else {
        match (pattern.chars().next(), value.chars().next()) {
            (None, None) => true,
            (Some(pc), Some(vc)) if pc == vc => {
                wildcard_match(&pattern[pc.len_utf8()..], &value[vc.len_utf8()..])
            }
            _ => false,
        }
    }
}

/// Typed view over the raw byte store for everything the updater persists.
#[derive(Clone)]
pub struct MenderStore {
    inner: Arc<dyn KeyValueStore>,
}

impl MenderStore {
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(MemStore::new()),
        }
    }

    pub fn open(datastore_dir: &Path) -> StoreResult<Self> {
        fs::create_dir_all(datastore_dir)?;
        let store = FileStore::open(datastore_dir.join(STORE_FILE))?;
        Ok(Self {
            inner: Arc::new(store),
        })
    }

    fn read_opt(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        match self.inner.read(key) {
            Ok(value) => Ok(Some(value)),
            Err(StoreError::KeyError(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn read_opt_string(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.read_opt(key)?.map(|bytes| {
            String::from_utf8_lossy(&bytes).into_owned()
        }))
    }

    pub fn artifact_name(&self) -> StoreResult<Option<String>> {
        self.read_opt_string(ARTIFACT_NAME_KEY)
    }

    pub fn artifact_group(&self) -> StoreResult<Option<String>> {
        self.read_opt_string(ARTIFACT_GROUP_KEY)
    }

    /// The stored free-form provides, excluding artifact name and group.
    pub fn artifact_provides(&self) -> StoreResult<BTreeMap<String, String>> {
        match self.read_opt(ARTIFACT_PROVIDES_KEY)? {
            None => Ok(BTreeMap::new()),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|err| StoreError::Parse(format!("{ARTIFACT_PROVIDES_KEY}: {err}"))),
        }
    }

    /// Everything the device currently provides, the form dependency checks
    /// match against.
    pub fn full_provides(&self) -> StoreResult<BTreeMap<String, String>> {
        let mut provides = self.artifact_provides()?;
        if let Some(name) = self.artifact_name()? {
            provides.insert("artifact_name".to_string(), name);
        }
        if let Some(group) = self.artifact_group()? {
            provides.insert("artifact_group".to_string(), group);
        }
        Ok(provides)
    }

    pub fn load_state_data(&self, key: &str) -> StoreResult<Option<StateData>> {
        match self.read_opt(key)? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|err| StoreError::Parse(format!("{key}: {err}"))),
        }
    }

    pub fn save_state_data(&self, key: &str, data: &StateData) -> StoreResult<()> {
        let bytes = serde_json::to_vec(data)
            .map_err(|err| StoreError::Parse(err.to_string()))?;
        self.inner.write(key, &bytes)
    }

    pub fn remove_state_data(&self, key: &str) -> StoreResult<()> {
        self.inner.remove(key)
    }

    /// Commits the artifact data of a successful install in one transaction:
    /// name, group, the provides map after `clears_artifact_provides`
    /// patterns wiped the stale entries, and the state record itself, so a
    /// crash can never separate them.
    pub fn commit_artifact_data(&self, state_key: &str, data: &StateData) -> StoreResult<()> {
        let mut provides = self.artifact_provides()?;
        if let Some(clears) = &data.artifact_clears_provides {
            provides.retain(|key, _| !clears.iter().any(|pattern| wildcard_match(pattern, key)));
        }
        if let Some(new_provides) = &data.artifact_provides {
            for (key, value) in new_provides {
                provides.insert(key.clone(), value.clone());
            }
        }

        let name = data.artifact_name.clone();
        let group = data.artifact_group.clone();
        let provides_bytes = serde_json::to_vec(&provides)
            .map_err(|err| StoreError::Parse(err.to_string()))?;
        let record_bytes = serde_json::to_vec(data)
            .map_err(|err| StoreError::Parse(err.to_string()))?;

        self.inner.write_transaction(&mut |txn| {
            txn.write(ARTIFACT_NAME_KEY, name.as_bytes())?;
            if group.is_empty() {
                txn.remove(ARTIFACT_GROUP_KEY)?;
            } else {
                txn.write(ARTIFACT_GROUP_KEY, group.as_bytes())?;
            }
            txn.write(ARTIFACT_PROVIDES_KEY, &provides_bytes)?;
            txn.write(state_key, &record_bytes)?;
            Ok(())
        })
    }

    /// Drops the deployment bookkeeping once an update fully completed or
    /// fully unwound.
    pub fn clear_deployment_data(&self, state_key: &str) -> StoreResult<()> {
        self.inner.write_transaction(&mut |txn| {
            txn.remove(state_key)?;
            txn.remove(STATE_DATA_UNCOMMITTED_KEY)?;
            txn.remove(UPDATE_CONTROL_MAPS_KEY)?;
            Ok(())
        })
    }

    pub fn raw(&self) -> &dyn KeyValueStore {
        self.inner.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_data(in_state: &str) -> StateData {
        StateData {
            version: STATE_DATA_VERSION,
            artifact_name: "release-1".to_string(),
            artifact_group: String::new(),
            artifact_provides: Some(BTreeMap::from([(
                "rootfs-image.version".to_string(),
                "release-1".to_string(),
            )])),
            artifact_clears_provides: Some(vec!["rootfs-image.*".to_string()]),
            payload_types: vec!["rootfs-image".to_string()],
            in_state: in_state.to_string(),
            failed: false,
            rolled_back: false,
        }
    }

    #[test]
    fn test_missing_key_is_key_error() {
        let store = MemStore::new();
        assert!(matches!(store.read("nope"), Err(StoreError::KeyError(_))));
    }

    #[test]
    fn test_write_transaction_rolls_back_on_error() {
        let store = MemStore::new();
        store.write("keep", b"old").unwrap();

        let result = store.write_transaction(&mut |txn| {
            txn.write("keep", b"new")?;
            txn.write("other", b"value")?;
            Err(StoreError::Parse("abort".to_string()))
        });
        assert!(result.is_err());

        assert_eq!(store.read("keep").unwrap(), b"old");
        assert!(store.read("other").is_err());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("store.json");

        {
            let store = FileStore::open(path.clone()).unwrap();
            store.write("artifact-name", b"release-1").unwrap();
        }

        let store = FileStore::open(path).unwrap();
        assert_eq!(store.read("artifact-name").unwrap(), b"release-1");
    }

    #[test]
    fn test_state_data_round_trip() {
        let store = MenderStore::in_memory();
        assert!(store.load_state_data(STATE_DATA_KEY).unwrap().is_none());

        let data = state_data("update-install");
        store.save_state_data(STATE_DATA_KEY, &data).unwrap();
        assert_eq!(store.load_state_data(STATE_DATA_KEY).unwrap(), Some(data));

        store.remove_state_data(STATE_DATA_KEY).unwrap();
        assert!(store.load_state_data(STATE_DATA_KEY).unwrap().is_none());
    }

    #[test]
    fn test_commit_artifact_data_applies_clears() {
        let store = MenderStore::in_memory();
        store
            .raw()
            .write(
                ARTIFACT_PROVIDES_KEY,
                br#"{"rootfs-image.checksum":"old","other.key":"stays"}"#,
            )
            .unwrap();

        store
            .commit_artifact_data(STATE_DATA_KEY, &state_data("update-save-provides"))
            .unwrap();

        let provides = store.artifact_provides().unwrap();
        assert_eq!(provides.get("other.key").map(String::as_str), Some("stays"));
        assert!(provides.get("rootfs-image.checksum").is_none());
        assert_eq!(
            provides.get("rootfs-image.version").map(String::as_str),
            Some("release-1")
        );
        assert_eq!(store.artifact_name().unwrap().as_deref(), Some("release-1"));
        // The record travels in the same transaction.
        assert_eq!(
            store.load_state_data(STATE_DATA_KEY).unwrap().unwrap().in_state,
            "update-save-provides"
        );
    }

    #[test]
    fn test_full_provides_includes_name_and_group() {
        let store = MenderStore::in_memory();
        store.raw().write(ARTIFACT_NAME_KEY, b"release-1").unwrap();
        store.raw().write(ARTIFACT_GROUP_KEY, b"group-a").unwrap();

        let provides = store.full_provides().unwrap();
        assert_eq!(provides.get("artifact_name").map(String::as_str), Some("release-1"));
        assert_eq!(provides.get("artifact_group").map(String::as_str), Some("group-a"));
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("rootfs-image.*", "rootfs-image.checksum"));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("exact", "exact"));
        assert!(!wildcard_match("exact", "exactly"));
        assert!(!wildcard_match("rootfs-image.*", "data-image.checksum"));
        assert!(wildcard_match("a*c", "abc"));
        assert!(wildcard_match("a*c", "acdc"));
        assert!(!wildcard_match("a*c", "abd"));
    }
}
