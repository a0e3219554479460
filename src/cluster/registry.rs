//! Service Registry
//!
//! Workers publish their address as an ephemeral sequential node under the
//! registry path. Every participant keeps a cached address list that is
//! rebuilt in full whenever the registry's children change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::with_retry;
use crate::coord::{ensure_path, join_path, sequence_of, Coordinator, CreateMode, EventKind, Watch, WatchedEvent};
use crate::error::{Error, Result};

/// Name prefix of registry entries
pub const ENTRY_PREFIX: &str = "n_";

/// A published worker address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    /// Full path of the entry node
    pub path: String,
    /// Address stored in the node
    pub metadata: String,
}

/// Child names that look like entries, in registration order
pub(crate) fn ordered_entries(children: Vec<String>) -> Vec<String> {
    let mut entries: Vec<(u64, String)> = children
        .into_iter()
        .filter_map(|name| sequence_of(&name).map(|sequence| (sequence, name)))
        .collect();
    entries.sort();
    entries.into_iter().map(|(_, name)| name).collect()
}

/// Registry membership and the cached worker address list
pub struct ServiceRegistry {
    coordinator: Arc<dyn Coordinator>,
    registry_path: String,
    /// Our own registration; the lock also serialises register/deregister
    current: Mutex<Option<RegistryEntry>>,
    /// Latest address snapshot, replaced whole on refresh
    addresses: RwLock<Arc<Vec<String>>>,
    /// Whether `addresses` has been filled at least once
    primed: AtomicBool,
    /// Serialises refreshes
    refresh_gate: Mutex<()>,
    /// Children watcher on the registry path
    watch: Watch,
    /// Receiving end of `watch`, taken by the watch loop
    events: Mutex<Option<mpsc::UnboundedReceiver<WatchedEvent>>>,
}

impl ServiceRegistry {
    /// Create a registry bound to one coordinator session
    pub fn new(coordinator: Arc<dyn Coordinator>, registry_path: impl Into<String>) -> Self {
        let (watch, events) = Watch::channel();
        Self {
            coordinator,
            registry_path: registry_path.into(),
            current: Mutex::new(None),
            addresses: RwLock::new(Arc::new(Vec::new())),
            primed: AtomicBool::new(false),
            refresh_gate: Mutex::new(()),
            watch,
            events: Mutex::new(Some(events)),
        }
    }

    pub fn registry_path(&self) -> &str {
        &self.registry_path
    }

    /// Create the registry path if it is missing
    pub async fn ensure_namespace(&self) -> Result<()> {
        ensure_path(self.coordinator.as_ref(), &self.registry_path).await
    }

    /// Our current registration
    pub async fn current(&self) -> Option<RegistryEntry> {
        self.current.lock().await.clone()
    }

    /// Publish `metadata` as this process's worker address.
    ///
    /// Registering the same metadata again while the entry still exists
    /// returns the existing entry. A changed address, or an entry that
    /// vanished, is replaced with a fresh node.
    pub async fn register_worker(&self, metadata: &str) -> Result<RegistryEntry> {
        let mut current = self.current.lock().await;

        if let Some(entry) = current.take() {
            if entry.metadata == metadata && self.coordinator.exists(&entry.path, None).await?.is_some() {
                tracing::debug!("Already registered at {}", entry.path);
                *current = Some(entry.clone());
                return Ok(entry);
            }
            if self.coordinator.delete(&entry.path, None).await? {
                tracing::debug!("Replaced registration {}", entry.path);
            }
        }

        let prefix = join_path(&self.registry_path, ENTRY_PREFIX);
        let path = match self
            .coordinator
            .create(&prefix, metadata.as_bytes(), CreateMode::EphemeralSequential)
            .await
        {
            Ok(path) => path,
            Err(Error::NoNode(_)) => {
                self.ensure_namespace().await?;
                self.coordinator
                    .create(&prefix, metadata.as_bytes(), CreateMode::EphemeralSequential)
                    .await?
            }
            Err(e) => return Err(e),
        };

        tracing::info!("Registered worker {} at {}", metadata, path);
        let entry = RegistryEntry {
            path,
            metadata: metadata.to_string(),
        };
        *current = Some(entry.clone());
        Ok(entry)
    }

    /// Withdraw this process's registration; false when there was none
    pub async fn deregister(&self) -> Result<bool> {
        let mut current = self.current.lock().await;

        let Some(entry) = current.take() else {
            tracing::debug!("Deregister with no registration");
            return Ok(false);
        };

        match self.coordinator.delete(&entry.path, None).await {
            Ok(true) => tracing::info!("Deregistered {}", entry.path),
            Ok(false) => tracing::debug!("Registration {} was already gone", entry.path),
            Err(e) => {
                *current = Some(entry);
                return Err(e);
            }
        }
        Ok(true)
    }

    /// Start following registry changes with an immediate refresh
    pub async fn register_for_updates(&self) -> Result<Arc<Vec<String>>> {
        self.refresh().await
    }

    /// Cached worker addresses, filled on first use
    pub async fn addresses(&self) -> Result<Arc<Vec<String>>> {
        if !self.primed.load(Ordering::Acquire) {
            return self.refresh().await;
        }
        Ok(Arc::clone(&*self.addresses.read().await))
    }

    /// Rebuild the address list and re-arm the children watch
    pub async fn refresh(&self) -> Result<Arc<Vec<String>>> {
        let _gate = self.refresh_gate.lock().await;

        let children = self
            .coordinator
            .get_children(&self.registry_path, Some(&self.watch))
            .await?;

        let mut addresses = Vec::with_capacity(children.len());
        for name in ordered_entries(children) {
            let path = join_path(&self.registry_path, &name);
            match self.read_entry(&path).await {
                Ok(address) => addresses.push(address),
                Err(Error::StaleReference(path)) => {
                    tracing::trace!("Registry entry {} vanished during refresh", path);
                }
                Err(Error::Protocol(reason)) => {
                    tracing::warn!("Skipping registry entry {}: {}", path, reason);
                }
                Err(e) => return Err(e),
            }
        }

        let snapshot = Arc::new(addresses);
        *self.addresses.write().await = Arc::clone(&snapshot);
        self.primed.store(true, Ordering::Release);
        tracing::debug!("Registry refreshed: {} workers", snapshot.len());

        Ok(snapshot)
    }

    async fn read_entry(&self, path: &str) -> Result<String> {
        match self.coordinator.get_data(path).await? {
            Some((data, _)) => String::from_utf8(data)
                .map_err(|_| Error::Protocol("address is not valid UTF-8".into())),
            None => Err(Error::StaleReference(path.to_string())),
        }
    }

    /// Refresh whenever the registry's children change.
    ///
    /// A refresh that keeps failing ends the loop with its error; the
    /// children watch is not re-armed after that.
    pub async fn spawn_watch_loop(self: &Arc<Self>) -> Result<JoinHandle<Result<()>>> {
        let mut events = self
            .events
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal("registry watch loop already running".into()))?;
        let registry = Arc::clone(self);

        Ok(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if event.kind != EventKind::ChildrenChanged {
                    tracing::trace!("Registry watch: ignoring {}", event.kind);
                    continue;
                }

                if let Err(e) = with_retry("Registry refresh", || registry.refresh()).await {
                    tracing::warn!("Registry watch loop ending: {}", e);
                    return Err(e);
                }
            }
            Ok(())
        }))
    }
}
