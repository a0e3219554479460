//! In-Process Coordinator
//!
//! A single-process implementation of the coordinator contract. It backs
//! the development server, the `simulate` command and the test suite.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{
    format_sequence, node_name, parent_path, validate_path, Connector, Coordinator, CreateMode,
    EventKind, NodeStat, Session, SessionId, Watch, WatchedEvent,
};
use crate::error::{Error, Result};

/// A stored node
struct ZNode {
    data: Vec<u8>,
    version: u32,
    ephemeral_owner: Option<SessionId>,
    children: BTreeSet<String>,
    /// Next suffix handed to a sequential child
    next_sequence: u64,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl ZNode {
    fn new(data: Vec<u8>, ephemeral_owner: Option<SessionId>) -> Self {
        Self {
            data,
            version: 0,
            ephemeral_owner,
            children: BTreeSet::new(),
            next_sequence: 1,
            created_at: chrono::Utc::now(),
        }
    }

    fn stat(&self) -> NodeStat {
        NodeStat {
            version: self.version,
            ephemeral_owner: self.ephemeral_owner,
            num_children: self.children.len(),
            created_at: self.created_at,
        }
    }
}

struct Registration {
    session: SessionId,
    watch: Watch,
}

/// One-shot watch registrations keyed by path
#[derive(Default)]
struct WatchTable {
    by_path: HashMap<String, Vec<Registration>>,
}

impl WatchTable {
    fn add(&mut self, path: &str, session: SessionId, watch: &Watch) {
        let regs = self.by_path.entry(path.to_string()).or_default();
        if !regs.iter().any(|r| r.watch.id() == watch.id()) {
            regs.push(Registration { session, watch: watch.clone() });
        }
    }

    /// Fire and forget every registration on `path`
    fn fire(&mut self, path: &str, kind: EventKind) {
        if let Some(regs) = self.by_path.remove(path) {
            for reg in regs {
                if !reg.watch.fire(WatchedEvent::node(kind, path)) {
                    tracing::trace!("Watcher {} on {} is gone", reg.watch.id(), path);
                }
            }
        }
    }

    fn drop_session(&mut self, session: SessionId) {
        for regs in self.by_path.values_mut() {
            regs.retain(|r| r.session != session);
        }
        self.by_path.retain(|_, regs| !regs.is_empty());
    }

    fn len(&self) -> usize {
        self.by_path.values().map(Vec::len).sum()
    }
}

struct SessionEntry {
    ephemerals: HashSet<String>,
    events: mpsc::UnboundedSender<WatchedEvent>,
}

/// The whole coordinator state, guarded by one lock
struct Tree {
    nodes: HashMap<String, ZNode>,
    exists_watches: WatchTable,
    child_watches: WatchTable,
    sessions: HashMap<SessionId, SessionEntry>,
    next_session: SessionId,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), ZNode::new(Vec::new(), None));
        Self {
            nodes,
            exists_watches: WatchTable::default(),
            child_watches: WatchTable::default(),
            sessions: HashMap::new(),
            next_session: 0x1000,
        }
    }

    fn check_session(&self, session: SessionId) -> Result<()> {
        if self.sessions.contains_key(&session) {
            Ok(())
        } else {
            Err(Error::SessionExpired(session))
        }
    }

    fn create(
        &mut self,
        session: SessionId,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String> {
        validate_path(path)?;
        if path == "/" {
            return Err(Error::NodeExists(path.to_string()));
        }

        let parent = parent_path(path).to_string();
        let (sequence, parent_ephemeral) = match self.nodes.get(&parent) {
            Some(node) => (node.next_sequence, node.ephemeral_owner.is_some()),
            None => return Err(Error::NoNode(parent)),
        };
        if parent_ephemeral {
            return Err(Error::InvalidPath(format!(
                "{} is ephemeral and cannot have children",
                parent
            )));
        }

        let full_path = if mode.is_sequential() {
            format_sequence(path, sequence)
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&full_path) {
            return Err(Error::NodeExists(full_path));
        }

        if let Some(node) = self.nodes.get_mut(&parent) {
            if mode.is_sequential() {
                node.next_sequence += 1;
            }
            node.children.insert(node_name(&full_path).to_string());
        }

        let owner = if mode.is_ephemeral() {
            if let Some(entry) = self.sessions.get_mut(&session) {
                entry.ephemerals.insert(full_path.clone());
            }
            Some(session)
        } else {
            None
        };
        self.nodes.insert(full_path.clone(), ZNode::new(data.to_vec(), owner));

        self.child_watches.fire(&parent, EventKind::ChildrenChanged);

        tracing::debug!("Created {} ({:?}) for session {:#x}", full_path, mode, session);
        Ok(full_path)
    }

    fn delete(&mut self, path: &str, expected_version: Option<u32>) -> Result<bool> {
        validate_path(path)?;
        if path == "/" {
            return Err(Error::InvalidPath("cannot delete the root".into()));
        }

        let node = match self.nodes.get(path) {
            Some(node) => node,
            None => return Ok(false),
        };
        if let Some(expected) = expected_version {
            if expected != node.version {
                return Err(Error::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
        }
        if !node.children.is_empty() {
            return Err(Error::NotEmpty(path.to_string()));
        }

        self.remove_node(path);
        Ok(true)
    }

    fn remove_node(&mut self, path: &str) {
        let node = match self.nodes.remove(path) {
            Some(node) => node,
            None => return,
        };
        if let Some(owner) = node.ephemeral_owner {
            if let Some(entry) = self.sessions.get_mut(&owner) {
                entry.ephemerals.remove(path);
            }
        }

        let parent = parent_path(path).to_string();
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.remove(node_name(path));
        }

        self.exists_watches.fire(path, EventKind::NodeDeleted);
        self.child_watches.fire(path, EventKind::NodeDeleted);
        self.child_watches.fire(&parent, EventKind::ChildrenChanged);

        tracing::debug!("Removed {}", path);
    }

    fn expire(&mut self, session: SessionId) -> bool {
        let entry = match self.sessions.remove(&session) {
            Some(entry) => entry,
            None => return false,
        };

        // The dead session's own watches must not fire on its own cleanup
        self.exists_watches.drop_session(session);
        self.child_watches.drop_session(session);

        let mut ephemerals: Vec<String> = entry.ephemerals.into_iter().collect();
        ephemerals.sort();
        for path in &ephemerals {
            self.remove_node(path);
        }

        let _ = entry.events.send(WatchedEvent::session(EventKind::SessionLost));
        tracing::info!(
            "Session {:#x} expired, removed {} ephemeral node(s)",
            session,
            ephemerals.len()
        );
        true
    }
}

/// In-process coordinator shared by any number of sessions
#[derive(Clone)]
pub struct MemoryEnsemble {
    tree: Arc<Mutex<Tree>>,
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEnsemble {
    /// Create an empty ensemble holding only the root node
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
        }
    }

    /// Open a new session
    pub async fn open_session(&self) -> (MemorySession, mpsc::UnboundedReceiver<WatchedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut tree = self.tree.lock().await;
            let id = tree.next_session;
            tree.next_session += 1;
            tree.sessions.insert(id, SessionEntry {
                ephemerals: HashSet::new(),
                events: tx.clone(),
            });
            id
        };
        let _ = tx.send(WatchedEvent::session(EventKind::SessionConnected));
        tracing::debug!("Opened session {:#x}", id);

        (
            MemorySession {
                id,
                ensemble: self.clone(),
            },
            rx,
        )
    }

    /// Expire a session as if its keep-alive had stopped.
    /// Returns false if the session was already gone.
    pub async fn expire_session(&self, session: SessionId) -> bool {
        self.tree.lock().await.expire(session)
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.tree.lock().await.sessions.len()
    }

    /// Number of pending watch registrations
    pub async fn watch_count(&self) -> usize {
        let tree = self.tree.lock().await;
        tree.exists_watches.len() + tree.child_watches.len()
    }
}

#[async_trait]
impl Connector for MemoryEnsemble {
    async fn connect(&self) -> Result<Session> {
        let (session, events) = self.open_session().await;
        Ok(Session {
            coordinator: Arc::new(session),
            events,
        })
    }
}

/// One session on a [`MemoryEnsemble`]
pub struct MemorySession {
    id: SessionId,
    ensemble: MemoryEnsemble,
}

#[async_trait]
impl Coordinator for MemorySession {
    fn session_id(&self) -> SessionId {
        self.id
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        let mut tree = self.ensemble.tree.lock().await;
        tree.check_session(self.id)?;
        tree.create(self.id, path, data, mode)
    }

    async fn exists(&self, path: &str, watch: Option<&Watch>) -> Result<Option<NodeStat>> {
        validate_path(path)?;
        let mut tree = self.ensemble.tree.lock().await;
        tree.check_session(self.id)?;
        let stat = tree.nodes.get(path).map(ZNode::stat);
        if let (Some(watch), Some(_)) = (watch, &stat) {
            tree.exists_watches.add(path, self.id, watch);
        }
        Ok(stat)
    }

    async fn get_children(&self, path: &str, watch: Option<&Watch>) -> Result<Vec<String>> {
        validate_path(path)?;
        let mut tree = self.ensemble.tree.lock().await;
        tree.check_session(self.id)?;
        let children: Vec<String> = match tree.nodes.get(path) {
            Some(node) => node.children.iter().cloned().collect(),
            None => return Err(Error::NoNode(path.to_string())),
        };
        if let Some(watch) = watch {
            tree.child_watches.add(path, self.id, watch);
        }
        Ok(children)
    }

    async fn get_data(&self, path: &str) -> Result<Option<(Vec<u8>, NodeStat)>> {
        validate_path(path)?;
        let tree = self.ensemble.tree.lock().await;
        tree.check_session(self.id)?;
        Ok(tree.nodes.get(path).map(|node| (node.data.clone(), node.stat())))
    }

    async fn delete(&self, path: &str, expected_version: Option<u32>) -> Result<bool> {
        let mut tree = self.ensemble.tree.lock().await;
        tree.check_session(self.id)?;
        tree.delete(path, expected_version)
    }

    async fn close(&self) -> Result<()> {
        self.ensemble.expire_session(self.id).await;
        Ok(())
    }
}
