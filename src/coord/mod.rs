//! Coordinator Facade
//!
//! The minimal contract this crate needs from a hierarchical coordination
//! service: ordered node creation, session-scoped ephemeral nodes and
//! one-shot watches. Two backends implement it: an in-process
//! [`MemoryEnsemble`] and a TCP client ([`RemoteCoordinator`]) for the
//! development [`CoordinatorServer`].

pub mod memory;
pub mod protocol;
pub mod server;
pub mod remote;
#[cfg(test)]
pub(crate) mod flaky;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

pub use memory::{MemoryEnsemble, MemorySession};
pub use remote::{RemoteConnector, RemoteCoordinator};
pub use server::CoordinatorServer;

/// Identifier of a coordinator session
pub type SessionId = u64;

/// Width of the zero-padded suffix appended to sequential nodes
pub const SEQUENCE_WIDTH: usize = 10;

/// How a node is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateMode {
    /// Survives the creating session
    Persistent,
    /// Persistent, with a sequence suffix appended to the name
    PersistentSequential,
    /// Removed when the creating session ends
    Ephemeral,
    /// Ephemeral, with a sequence suffix appended to the name
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(self, CreateMode::PersistentSequential | CreateMode::EphemeralSequential)
    }
}

/// Node metadata returned by `exists` and `get_data`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStat {
    /// Data version, bumped on every write
    pub version: u32,
    /// Owning session for ephemeral nodes
    pub ephemeral_owner: Option<SessionId>,
    /// Number of direct children
    pub num_children: usize,
    /// Creation time
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Kind of a watch or session notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    NodeDeleted,
    ChildrenChanged,
    SessionConnected,
    SessionLost,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::NodeDeleted => write!(f, "NODE_DELETED"),
            EventKind::ChildrenChanged => write!(f, "CHILDREN_CHANGED"),
            EventKind::SessionConnected => write!(f, "SESSION_CONNECTED"),
            EventKind::SessionLost => write!(f, "SESSION_LOST"),
        }
    }
}

/// A notification delivered by the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedEvent {
    pub kind: EventKind,
    /// Node the watch was set on (`None` for session events)
    pub path: Option<String>,
}

impl WatchedEvent {
    pub fn node(kind: EventKind, path: &str) -> Self {
        Self { kind, path: Some(path.to_string()) }
    }

    pub fn session(kind: EventKind) -> Self {
        Self { kind, path: None }
    }
}

static NEXT_WATCH_ID: AtomicU64 = AtomicU64::new(1);

/// A watcher identity.
///
/// Passing a `Watch` to `exists` or `get_children` registers it once on that
/// path; the registration fires at most one event and must be re-armed to
/// see the next change. Registering the same watcher twice on the same path
/// before it fires yields a single notification.
#[derive(Debug, Clone)]
pub struct Watch {
    id: u64,
    tx: mpsc::UnboundedSender<WatchedEvent>,
}

impl Watch {
    /// Create a watcher and the receiving end its notifications arrive on
    pub fn channel() -> (Watch, mpsc::UnboundedReceiver<WatchedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::from_sender(tx), rx)
    }

    /// Wrap an existing sender as a new watcher identity
    pub fn from_sender(tx: mpsc::UnboundedSender<WatchedEvent>) -> Watch {
        Watch {
            id: NEXT_WATCH_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Deliver an event; returns false once the receiver is gone
    pub fn fire(&self, event: WatchedEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Session-level notifications (`SessionConnected`, `SessionLost`)
pub type SessionEvents = mpsc::UnboundedReceiver<WatchedEvent>;

/// The operations the election and registry need from a coordinator session
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Session this handle is bound to
    fn session_id(&self) -> SessionId;

    /// Create a node; returns the full path (including any sequence suffix)
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String>;

    /// Stat a node, optionally arming a one-shot deletion watch.
    ///
    /// The watch is only armed when the node exists; a missing node
    /// returns `None` and leaves nothing registered.
    async fn exists(&self, path: &str, watch: Option<&Watch>) -> Result<Option<NodeStat>>;

    /// List child names, optionally arming a one-shot children watch
    async fn get_children(&self, path: &str, watch: Option<&Watch>) -> Result<Vec<String>>;

    /// Read a node; `None` when it does not exist
    async fn get_data(&self, path: &str) -> Result<Option<(Vec<u8>, NodeStat)>>;

    /// Delete a node; returns false when it was already gone
    async fn delete(&self, path: &str, expected_version: Option<u32>) -> Result<bool>;

    /// Close the session, removing its ephemeral nodes
    async fn close(&self) -> Result<()>;
}

/// A live session: the coordinator handle and its session notifications
pub struct Session {
    pub coordinator: Arc<dyn Coordinator>,
    pub events: SessionEvents,
}

/// Opens new coordinator sessions; one per epoch
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Session>;
}

/// Create every missing persistent node along `path`.
///
/// Peers racing on the same path are fine: the coordinator lets exactly one
/// creation through and the others see `NodeExists`.
pub async fn ensure_path(coordinator: &dyn Coordinator, path: &str) -> Result<()> {
    validate_path(path)?;
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        if coordinator.exists(&current, None).await?.is_some() {
            continue;
        }
        match coordinator.create(&current, &[], CreateMode::Persistent).await {
            Ok(_) | Err(Error::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Check that a path is absolute, has no empty segments and no trailing slash
pub fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::InvalidPath(format!("{} is not absolute", path)));
    }
    if path.len() > 1 && (path.ends_with('/') || path.contains("//")) {
        return Err(Error::InvalidPath(format!("{} has an empty segment", path)));
    }
    Ok(())
}

/// Join a parent path and a child name
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Parent of a path (`/` for top-level nodes)
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Last segment of a path
pub fn node_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Sequence number carried by a sequential node name.
///
/// Parsed as an integer so that `c_10` sorts after `c_9` even when a
/// coordinator does not zero-pad.
pub fn sequence_of(name: &str) -> Option<u64> {
    let digits = name.len() - name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    name[name.len() - digits..].parse().ok()
}

/// Format a sequence suffix the way the bundled coordinators assign it
pub fn format_sequence(prefix: &str, sequence: u64) -> String {
    format!("{}{:0width$}", prefix, sequence, width = SEQUENCE_WIDTH)
}
