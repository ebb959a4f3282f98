//! Explicit registry of storages and namespaces.
//!
//! Populated once at startup and passed to whatever needs to resolve a
//! storage or namespace by name.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::capture::CaptureRegistry;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::namespace::{Namespace, NamespaceHandle, TaskKind};
use crate::storage::{Storage, SyncReport};

struct Registered {
    storage: String,
    handle: Arc<dyn NamespaceHandle>,
}

pub struct Context {
    capture: CaptureRegistry,
    storages: BTreeMap<String, Arc<Storage>>,
    namespaces: BTreeMap<String, Registered>,
}

impl Context {
    pub fn new(capture: CaptureRegistry) -> Self {
        Self {
            capture,
            storages: BTreeMap::new(),
            namespaces: BTreeMap::new(),
        }
    }

    /// Shared capture registry; install its layer to record tracing events.
    pub fn capture(&self) -> &CaptureRegistry {
        &self.capture
    }

    /// Open the storage at `root` (reading its `.sak.toml`) and register it.
    pub fn open_storage(&mut self, name: &str, root: impl Into<PathBuf>) -> Result<Arc<Storage>> {
        let storage = Storage::open(name, root, self.capture.clone())?;
        self.add_storage(storage)
    }

    /// Like [`open_storage`](Self::open_storage) with an explicit config.
    pub fn open_storage_with(
        &mut self,
        name: &str,
        root: impl Into<PathBuf>,
        config: Config,
    ) -> Result<Arc<Storage>> {
        config.validate()?;
        let storage = Storage::with_config(name, root, config, self.capture.clone());
        self.add_storage(storage)
    }

    pub fn add_storage(&mut self, storage: Storage) -> Result<Arc<Storage>> {
        let name = storage.name().to_string();
        if self.storages.contains_key(&name) {
            return Err(Error::InvalidArgument(format!(
                "storage '{name}' already registered"
            )));
        }
        let storage = Arc::new(storage);
        self.storages.insert(name, Arc::clone(&storage));
        Ok(storage)
    }

    pub fn storage(&self, name: &str) -> Result<Arc<Storage>> {
        self.storages
            .get(name)
            .cloned()
            .ok_or_else(|| Error::StorageNotFound(name.to_string()))
    }

    pub fn storages(&self) -> impl Iterator<Item = &Arc<Storage>> {
        self.storages.values()
    }

    /// Create `kind`'s namespace on storage `storage` and register it.
    pub fn register_namespace<K: TaskKind>(
        &mut self,
        storage: &str,
        kind: K,
    ) -> Result<Arc<Namespace<K>>> {
        let name = kind.name().to_string();
        if self.namespaces.contains_key(&name) {
            return Err(Error::InvalidArgument(format!(
                "namespace '{name}' already registered"
            )));
        }
        let namespace = Namespace::new(kind, self.storage(storage)?)?;
        let handle: Arc<dyn NamespaceHandle> = namespace.clone();
        self.namespaces.insert(
            name,
            Registered {
                storage: storage.to_string(),
                handle,
            },
        );
        Ok(namespace)
    }

    pub fn namespace(&self, name: &str) -> Result<Arc<dyn NamespaceHandle>> {
        self.namespaces
            .get(name)
            .map(|registered| Arc::clone(&registered.handle))
            .ok_or_else(|| Error::NamespaceNotFound(name.to_string()))
    }

    /// Typed namespace; fails if `name` was registered with another kind.
    pub fn namespace_as<K: TaskKind>(&self, name: &str) -> Result<Arc<Namespace<K>>> {
        self.namespace(name)?
            .as_any()
            .downcast::<Namespace<K>>()
            .map_err(|_| {
                Error::InvalidArgument(format!("namespace '{name}' has a different task kind"))
            })
    }

    /// Namespaces registered on storage `storage`.
    pub fn namespaces_of(&self, storage: &str) -> Vec<Arc<dyn NamespaceHandle>> {
        self.namespaces
            .values()
            .filter(|registered| registered.storage == storage)
            .map(|registered| Arc::clone(&registered.handle))
            .collect()
    }

    pub fn sync(&self, storage: &str) -> Result<SyncReport> {
        self.storage(storage)?.sync(&self.namespaces_of(storage))
    }

    pub fn sync_all(&self) -> Result<BTreeMap<String, SyncReport>> {
        let mut reports = BTreeMap::new();
        for name in self.storages.keys() {
            reports.insert(name.clone(), self.sync(name)?);
        }
        Ok(reports)
    }

    /// Close every storage's log backend.
    pub fn close(&self) -> Result<()> {
        for storage in self.storages.values() {
            storage.close()?;
        }
        Ok(())
    }
}
