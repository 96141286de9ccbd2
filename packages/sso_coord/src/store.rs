//! Shared coordination store.
//!
//! A synchronous key/value store visible to every tab. Writes are
//! last-write-wins and there is no compare-and-swap: two tabs may both read
//! "no owner" before either writes. Every record is organization-scoped and
//! safe to overwrite, so the worst case is a short duplicate-prompt window.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StoreError;
use crate::tab::TabId;

/// String-valued storage, the way browser session storage is.
pub trait CoordinationStore: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: String) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

// --- Back-ends ---

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl CoordinationStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// A JSON document on disk, re-read on every access so separate processes
/// observe each other's writes.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process only.
    lock: Mutex<()>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Self {
            path,
            lock: Mutex::new(()),
        };
        if !store.path.exists() {
            store.write_all(&BTreeMap::new())?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>, StoreError> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        std::fs::write(&self.path, bytes)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }
}

impl CoordinationStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock();
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut entries = self.read_all()?;
        entries.insert(key.to_string(), value);
        self.write_all(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut entries = self.read_all()?;
        if entries.remove(key).is_some() {
            self.write_all(&entries)?;
        }
        Ok(())
    }
}

// --- Records ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Modal,
    Polling,
    Cooldown,
    PendingRequest,
}

impl RecordKind {
    pub const ALL: [RecordKind; 4] = [
        Self::Modal,
        Self::Polling,
        Self::Cooldown,
        Self::PendingRequest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Modal => "modal",
            Self::Polling => "polling",
            Self::Cooldown => "cooldown",
            Self::PendingRequest => "pending_request",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn storage_key(kind: RecordKind, organization: &str) -> String {
    format!("sso:{kind}:{organization}")
}

/// A value stored under one [`RecordKind`] per organization.
pub trait Record: Serialize + DeserializeOwned {
    const KIND: RecordKind;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModalOwnership {
    pub owner_tab_id: TabId,
    pub claimed_at: i64,
}

impl Record for ModalOwnership {
    const KIND: RecordKind = RecordKind::Modal;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingState {
    pub active: bool,
    pub started_at: i64,
    pub owner_tab_id: TabId,
}

impl Record for PollingState {
    const KIND: RecordKind = RecordKind::Polling;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cooldown {
    pub expires_at: i64,
}

impl Cooldown {
    pub fn is_active(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at
    }
}

impl Record for Cooldown {
    const KIND: RecordKind = RecordKind::Cooldown;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAuthorizationRequest {
    pub organization: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    pub error_message: String,
    pub has_retry_callback: bool,
    pub created_at: i64,
}

impl Record for PendingAuthorizationRequest {
    const KIND: RecordKind = RecordKind::PendingRequest;
}

// --- Typed view ---

/// Typed, failure-tolerant access to a [`CoordinationStore`].
///
/// Reads of missing, unreadable or corrupt entries yield `None`; failed
/// writes are logged. The coordinator never blocks or fails on the store.
#[derive(Debug, Clone)]
pub struct SharedState {
    store: Arc<dyn CoordinationStore>,
}

impl SharedState {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn get<R: Record>(&self, organization: &str) -> Option<R> {
        let key = storage_key(R::KIND, organization);
        let raw = match self.store.get(&key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key, error = %e, "coordination store read failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(key, error = %e, "corrupt coordination record ignored");
                None
            }
        }
    }

    pub fn put<R: Record>(&self, organization: &str, record: &R) {
        let key = storage_key(R::KIND, organization);
        let value = match serde_json::to_string(record) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "coordination record not serializable");
                return;
            }
        };
        if let Err(e) = self.store.set(&key, value) {
            warn!(key, error = %e, "coordination store write failed");
        }
    }

    pub fn clear<R: Record>(&self, organization: &str) {
        self.remove_kind(R::KIND, organization);
    }

    /// Remove every record kind for `organization`.
    pub fn clear_organization(&self, organization: &str) {
        for kind in RecordKind::ALL {
            self.remove_kind(kind, organization);
        }
    }

    pub fn cooldown_active(&self, organization: &str, now_ms: i64) -> bool {
        self.get::<Cooldown>(organization)
            .is_some_and(|cooldown| cooldown.is_active(now_ms))
    }

    fn remove_kind(&self, kind: RecordKind, organization: &str) {
        let key = storage_key(kind, organization);
        if let Err(e) = self.store.remove(&key) {
            warn!(key, error = %e, "coordination store remove failed");
        }
    }
}
