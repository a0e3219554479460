//! Cluster Node
//!
//! Hosts one election participant for the life of the process. Each
//! coordinator session is an epoch: nominate, elect, follow the registry,
//! and start over with a fresh session when the old one is lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::cluster::{
    with_retry, ElectionState, LeaderElection, NodeRole, RegistryRoleCallback, RoleDispatcher, ServiceRegistry,
};
use crate::config::WolfKeeperConfig;
use crate::coord::{Connector, Coordinator, EventKind, SessionEvents, SessionId};
use crate::error::{Error, Result};

/// Why an epoch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EpochEnd {
    SessionLost,
    Shutdown,
}

/// A participant that keeps rejoining the election until shut down
pub struct ClusterNode {
    /// Node identifier (logging only)
    node_id: String,
    /// Address published while a worker
    address: String,
    election_path: String,
    registry_path: String,
    reconnect_delay: Duration,
    /// Opens one session per epoch
    connector: Arc<dyn Connector>,
    /// Current role, shared with every epoch's dispatcher
    role: Arc<watch::Sender<NodeRole>>,
    /// Registry of the running epoch
    registry: RwLock<Option<Arc<ServiceRegistry>>>,
    /// Election of the running epoch
    election: RwLock<Option<Arc<LeaderElection>>>,
    /// Session of the running epoch (0 when none)
    session_id: AtomicU64,
    /// Number of epochs started
    epochs: AtomicU64,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl ClusterNode {
    /// Create a node from configuration
    pub fn new(config: &WolfKeeperConfig, connector: Arc<dyn Connector>) -> Self {
        let (role_tx, _) = watch::channel(NodeRole::Unassigned);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            node_id: config.node.id.clone(),
            address: config.advertise_address(),
            election_path: config.election.election_path.clone(),
            registry_path: config.election.registry_path.clone(),
            reconnect_delay: config.reconnect_delay(),
            connector,
            role: Arc::new(role_tx),
            registry: RwLock::new(None),
            election: RwLock::new(None),
            session_id: AtomicU64::new(0),
            epochs: AtomicU64::new(0),
            shutdown: shutdown_tx,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Address this node publishes as a worker
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Subscribe to role changes
    pub fn roles(&self) -> watch::Receiver<NodeRole> {
        self.role.subscribe()
    }

    /// Current role
    pub fn role(&self) -> NodeRole {
        *self.role.borrow()
    }

    /// Session of the running epoch
    pub fn session_id(&self) -> Option<SessionId> {
        match self.session_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Number of epochs started so far
    pub fn epochs(&self) -> u64 {
        self.epochs.load(Ordering::Relaxed)
    }

    /// Election state of the running epoch
    pub async fn election_state(&self) -> ElectionState {
        match self.election.read().await.as_ref() {
            Some(election) => election.state().await,
            None => ElectionState::Unnominated,
        }
    }

    /// Worker addresses known to the running epoch
    pub async fn addresses(&self) -> Result<Arc<Vec<String>>> {
        let registry = self.registry.read().await.clone();
        match registry {
            Some(registry) => registry.addresses().await,
            None => Err(Error::CoordinationUnavailable("no active session".into())),
        }
    }

    /// Ask `run` to close its session and return
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Run epochs until shutdown
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        tracing::info!("Node {} joining as {}", self.node_id, self.address);

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
            let end = self.run_epoch(epoch, &mut shutdown_rx).await;
            self.clear_epoch().await;

            match end {
                Ok(EpochEnd::Shutdown) => break,
                Ok(EpochEnd::SessionLost) => {
                    tracing::warn!("Node {}: session lost in epoch {}", self.node_id, epoch);
                }
                Err(e) if e.ends_epoch() || e.is_retryable() => {
                    tracing::warn!("Node {}: epoch {} ended: {}", self.node_id, epoch, e);
                }
                Err(e) => {
                    tracing::error!("Node {}: epoch {} failed: {}", self.node_id, epoch, e);
                    return Err(e);
                }
            }

            let delay = jittered(self.reconnect_delay);
            tracing::info!("Node {}: rejoining in {:?}", self.node_id, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        tracing::info!("Node {} stopped", self.node_id);
        Ok(())
    }

    /// One session from connect to close
    async fn run_epoch(&self, epoch: u64, shutdown_rx: &mut watch::Receiver<bool>) -> Result<EpochEnd> {
        let session = self.connector.connect().await?;
        let coordinator = session.coordinator;
        let mut events = session.events;

        self.session_id.store(coordinator.session_id(), Ordering::Release);
        tracing::info!(
            "Node {}: epoch {} on session {:#x}",
            self.node_id,
            epoch,
            coordinator.session_id()
        );

        let registry = Arc::new(ServiceRegistry::new(Arc::clone(&coordinator), self.registry_path.clone()));
        let election = Arc::new(LeaderElection::new(Arc::clone(&coordinator), self.election_path.clone()));
        *self.registry.write().await = Some(Arc::clone(&registry));
        *self.election.write().await = Some(Arc::clone(&election));

        let mut tasks = Vec::new();
        let result = self
            .drive_epoch(&registry, &election, &mut events, shutdown_rx, &mut tasks)
            .await;

        for task in &tasks {
            task.abort();
        }

        // Removes our ephemeral nodes right away instead of at session expiry
        if let Err(e) = coordinator.close().await {
            tracing::debug!("Node {}: closing session: {}", self.node_id, e);
        }

        result
    }

    async fn drive_epoch(
        &self,
        registry: &Arc<ServiceRegistry>,
        election: &Arc<LeaderElection>,
        events: &mut SessionEvents,
        shutdown_rx: &mut watch::Receiver<bool>,
        tasks: &mut Vec<JoinHandle<Result<()>>>,
    ) -> Result<EpochEnd> {
        registry.ensure_namespace().await?;

        let callback = Arc::new(RegistryRoleCallback::new(Arc::clone(registry)));
        let dispatcher = Arc::new(RoleDispatcher::new(callback, self.address.clone(), Arc::clone(&self.role)));

        tasks.push(registry.spawn_watch_loop().await?);
        tasks.push(election.spawn_watch_loop(Arc::clone(&dispatcher)).await?);

        election.self_nominate().await?;
        with_retry("Election", || election.run_and_dispatch(&dispatcher)).await?;

        // Workers follow the registry too
        with_retry("Registry read", || registry.addresses()).await?;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) if event.kind == EventKind::SessionLost => {
                        return Ok(EpochEnd::SessionLost);
                    }
                    Some(event) => {
                        tracing::trace!("Node {}: session event {}", self.node_id, event.kind);
                    }
                    None => return Ok(EpochEnd::SessionLost),
                },
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Ok(EpochEnd::Shutdown);
                    }
                }
                // A stopped watch loop leaves this epoch without a watch
                (finished, _, _) = futures::future::select_all(tasks.iter_mut()) => {
                    return Err(match finished {
                        Ok(Err(e)) if e.ends_epoch() => e,
                        Ok(Err(e)) => Error::CoordinationUnavailable(format!("watch loop failed: {}", e)),
                        Ok(Ok(())) => Error::CoordinationUnavailable("watch loop stopped".into()),
                        Err(e) => Error::CoordinationUnavailable(format!("watch loop aborted: {}", e)),
                    });
                }
            }
        }
    }

    async fn clear_epoch(&self) {
        self.session_id.store(0, Ordering::Release);
        *self.registry.write().await = None;
        *self.election.write().await = None;

        let previous = self.role.send_replace(NodeRole::Unassigned);
        if previous != NodeRole::Unassigned {
            tracing::info!("Node {}: role {} released", self.node_id, previous);
        }
    }
}

/// Spread reconnects of a fleet that lost its sessions together
fn jittered(base: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    if base_ms == 0 {
        return base;
    }
    let extra = rand::thread_rng().gen_range(0..=base_ms / 2);
    Duration::from_millis(base_ms + extra)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::flaky::{Fault, FaultOp, FlakyConnector};
    use crate::coord::MemoryEnsemble;

    fn config(id: &str) -> WolfKeeperConfig {
        let mut config = WolfKeeperConfig::for_node(id);
        config.node.advertise_address = Some(format!("http://{}:8081", id));
        config.coordinator.reconnect_delay_ms = 20;
        config
    }

    fn spawn_node(ensemble: &MemoryEnsemble, id: &str) -> (Arc<ClusterNode>, JoinHandle<Result<()>>) {
        spawn_with(Arc::new(ensemble.clone()), id)
    }

    fn spawn_with(connector: Arc<dyn Connector>, id: &str) -> (Arc<ClusterNode>, JoinHandle<Result<()>>) {
        let node = Arc::new(ClusterNode::new(&config(id), connector));
        let running = Arc::clone(&node);
        let handle = tokio::spawn(async move { running.run().await });
        (node, handle)
    }

    async fn wait_for_role(node: &ClusterNode, role: NodeRole) {
        let mut roles = node.roles();
        let reached = tokio::time::timeout(Duration::from_secs(5), roles.wait_for(|r| *r == role))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false);
        assert!(reached, "{} never became {}", node.node_id(), role);
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(100);
        for _ in 0..50 {
            let delay = jittered(base);
            assert!(delay >= base && delay <= Duration::from_millis(150));
        }
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_addresses_without_session() {
        let node = ClusterNode::new(&config("idle"), Arc::new(MemoryEnsemble::new()));
        assert!(matches!(node.addresses().await, Err(Error::CoordinationUnavailable(_))));
        assert_eq!(node.role(), NodeRole::Unassigned);
        assert_eq!(node.election_state().await, ElectionState::Unnominated);
    }

    #[tokio::test]
    async fn test_fleet_elects_and_registers() {
        let ensemble = MemoryEnsemble::new();
        let (a, a_run) = spawn_node(&ensemble, "node-a");
        wait_for_role(&a, NodeRole::Leader).await;

        let (b, b_run) = spawn_node(&ensemble, "node-b");
        let (c, c_run) = spawn_node(&ensemble, "node-c");
        wait_for_role(&b, NodeRole::Worker).await;
        wait_for_role(&c, NodeRole::Worker).await;

        let mut addresses = Vec::new();
        for _ in 0..100 {
            addresses = a.addresses().await.unwrap().to_vec();
            if addresses.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        addresses.sort();
        assert_eq!(addresses, vec!["http://node-b:8081".to_string(), "http://node-c:8081".to_string()]);

        for node in [&a, &b, &c] {
            node.shutdown();
        }
        for run in [a_run, b_run, c_run] {
            run.await.unwrap().unwrap();
        }
        assert_eq!(ensemble.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_leader_loss_fails_over_and_rejoins() {
        let ensemble = MemoryEnsemble::new();
        let (a, a_run) = spawn_node(&ensemble, "node-a");
        wait_for_role(&a, NodeRole::Leader).await;
        let (b, b_run) = spawn_node(&ensemble, "node-b");
        wait_for_role(&b, NodeRole::Worker).await;

        let session = a.session_id().unwrap();
        assert!(ensemble.expire_session(session).await);

        wait_for_role(&b, NodeRole::Leader).await;
        // a comes back in a new epoch, behind b
        wait_for_role(&a, NodeRole::Worker).await;
        assert!(a.epochs() >= 2);

        let mut addresses = Vec::new();
        for _ in 0..100 {
            addresses = b.addresses().await.unwrap().to_vec();
            if addresses == ["http://node-a:8081".to_string()] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(addresses, vec!["http://node-a:8081".to_string()]);

        a.shutdown();
        b.shutdown();
        a_run.await.unwrap().unwrap();
        b_run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reelection_survives_listing_timeout() {
        let ensemble = MemoryEnsemble::new();
        let (a, a_run) = spawn_node(&ensemble, "node-a");
        wait_for_role(&a, NodeRole::Leader).await;

        // b's first listing is its initial run; the second, after a leaves, times out
        let connector = FlakyConnector::new(ensemble.clone(), Fault::once(FaultOp::GetChildren, "/election", 2));
        let (b, b_run) = spawn_with(Arc::new(connector), "node-b");
        wait_for_role(&b, NodeRole::Worker).await;

        a.shutdown();
        a_run.await.unwrap().unwrap();

        wait_for_role(&b, NodeRole::Leader).await;
        assert_eq!(b.epochs(), 1);

        b.shutdown();
        b_run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_watch_loop_starts_new_epoch() {
        let ensemble = MemoryEnsemble::new();
        let (a, a_run) = spawn_node(&ensemble, "node-a");
        wait_for_role(&a, NodeRole::Leader).await;

        // Every listing after the first times out in b's first session
        let connector = FlakyConnector::new(ensemble.clone(), Fault::from(FaultOp::GetChildren, "/election", 2));
        let (b, b_run) = spawn_with(Arc::new(connector), "node-b");
        wait_for_role(&b, NodeRole::Worker).await;

        a.shutdown();
        a_run.await.unwrap().unwrap();

        wait_for_role(&b, NodeRole::Leader).await;
        assert!(b.epochs() >= 2);

        b.shutdown();
        b_run.await.unwrap().unwrap();
        assert_eq!(ensemble.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_timed_out_registration_is_retried() {
        let ensemble = MemoryEnsemble::new();
        let (a, a_run) = spawn_node(&ensemble, "node-a");
        wait_for_role(&a, NodeRole::Leader).await;

        let connector = FlakyConnector::new(ensemble.clone(), Fault::once(FaultOp::Create, "/service_registry/n_", 1));
        let (b, b_run) = spawn_with(Arc::new(connector), "node-b");
        wait_for_role(&b, NodeRole::Worker).await;

        let mut addresses = Vec::new();
        for _ in 0..100 {
            addresses = a.addresses().await.unwrap().to_vec();
            if !addresses.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(addresses, vec!["http://node-b:8081".to_string()]);
        assert_eq!(b.epochs(), 1);

        a.shutdown();
        b.shutdown();
        a_run.await.unwrap().unwrap();
        b_run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_before_run() {
        let ensemble = MemoryEnsemble::new();
        let node = ClusterNode::new(&config("early"), Arc::new(ensemble.clone()));
        node.shutdown();
        node.run().await.unwrap();
        assert_eq!(node.epochs(), 0);
        assert_eq!(ensemble.session_count().await, 0);
    }
}
