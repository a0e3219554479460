//! Role Callback
//!
//! Election outcomes are turned into application actions through a
//! [`RoleCallback`]. The stock implementation keeps the service registry in
//! step with the role: workers publish their address, the leader withdraws
//! its own and follows everyone else's.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;

use super::election::ElectionOutcome;
use super::registry::ServiceRegistry;
use crate::error::Result;

/// Hooks invoked after every election run
#[async_trait]
pub trait RoleCallback: Send + Sync {
    /// This process now holds the smallest candidate node
    async fn become_leader(&self) -> Result<()>;

    /// This process is a worker reachable at `address`
    async fn become_worker(&self, address: &str) -> Result<()>;
}

/// Role of a node as last dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeRole {
    /// No election has completed in the current session
    Unassigned,
    Leader,
    Worker,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Unassigned => write!(f, "UNASSIGNED"),
            NodeRole::Leader => write!(f, "LEADER"),
            NodeRole::Worker => write!(f, "WORKER"),
        }
    }
}

/// Keeps the service registry in step with the election
pub struct RegistryRoleCallback {
    registry: Arc<ServiceRegistry>,
}

impl RegistryRoleCallback {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl RoleCallback for RegistryRoleCallback {
    async fn become_leader(&self) -> Result<()> {
        if self.registry.deregister().await? {
            tracing::info!("Withdrew worker registration after winning the election");
        }
        let workers = self.registry.register_for_updates().await?;
        tracing::info!("Leading {} registered workers", workers.len());
        Ok(())
    }

    async fn become_worker(&self, address: &str) -> Result<()> {
        let entry = self.registry.register_worker(address).await?;
        tracing::debug!("Worker registration at {}", entry.path);
        Ok(())
    }
}

/// Routes election outcomes to a callback and publishes the resulting role
pub struct RoleDispatcher {
    callback: Arc<dyn RoleCallback>,
    /// Address this process advertises as a worker
    address: String,
    role: Arc<watch::Sender<NodeRole>>,
}

impl RoleDispatcher {
    pub fn new(
        callback: Arc<dyn RoleCallback>,
        address: impl Into<String>,
        role: Arc<watch::Sender<NodeRole>>,
    ) -> Self {
        Self {
            callback,
            address: address.into(),
            role,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Last published role
    pub fn role(&self) -> NodeRole {
        *self.role.borrow()
    }

    /// Invoke the hook matching `outcome` and publish the role.
    ///
    /// The role is only published once the hook succeeded; a failing hook
    /// leaves the previous role in place and returns its error.
    pub async fn dispatch(&self, outcome: &ElectionOutcome) -> Result<()> {
        let (role, result) = match outcome {
            ElectionOutcome::Leader => (NodeRole::Leader, self.callback.become_leader().await),
            ElectionOutcome::Worker { .. } => {
                (NodeRole::Worker, self.callback.become_worker(&self.address).await)
            }
        };

        if let Err(e) = result {
            tracing::warn!("{} callback failed: {}", role, e);
            return Err(e);
        }

        let previous = self.role.send_replace(role);
        if previous != role {
            tracing::info!("Role changed: {} -> {}", previous, role);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryEnsemble;
    use crate::error::Error;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingCallback {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl RoleCallback for RecordingCallback {
        async fn become_leader(&self) -> Result<()> {
            self.calls.lock().await.push("leader".into());
            if self.fail {
                return Err(Error::Internal("boom".into()));
            }
            Ok(())
        }

        async fn become_worker(&self, address: &str) -> Result<()> {
            self.calls.lock().await.push(format!("worker {}", address));
            Ok(())
        }
    }

    #[test]
    fn test_role_display() {
        assert_eq!(NodeRole::Leader.to_string(), "LEADER");
        assert_eq!(NodeRole::Worker.to_string(), "WORKER");
        assert_eq!(NodeRole::Unassigned.to_string(), "UNASSIGNED");
    }

    #[tokio::test]
    async fn test_dispatch_routes_and_publishes() {
        let callback = Arc::new(RecordingCallback::default());
        let (role_tx, mut role_rx) = watch::channel(NodeRole::Unassigned);
        let dispatcher = RoleDispatcher::new(callback.clone(), "http://node-2:8081", Arc::new(role_tx));

        dispatcher
            .dispatch(&ElectionOutcome::Worker {
                leader: "c_0000000001".into(),
                predecessor: "c_0000000001".into(),
            })
            .await
            .unwrap();
        assert_eq!(*role_rx.borrow_and_update(), NodeRole::Worker);

        dispatcher.dispatch(&ElectionOutcome::Leader).await.unwrap();
        assert_eq!(*role_rx.borrow_and_update(), NodeRole::Leader);
        assert_eq!(dispatcher.role(), NodeRole::Leader);

        let calls = callback.calls.lock().await.clone();
        assert_eq!(calls, vec!["worker http://node-2:8081".to_string(), "leader".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_callback_keeps_previous_role() {
        let callback = Arc::new(RecordingCallback { fail: true, ..Default::default() });
        let (role_tx, role_rx) = watch::channel(NodeRole::Unassigned);
        let dispatcher = RoleDispatcher::new(callback.clone(), "http://node-1:8081", Arc::new(role_tx));

        let result = dispatcher.dispatch(&ElectionOutcome::Leader).await;
        assert!(matches!(result, Err(Error::Internal(_))));
        assert_eq!(*role_rx.borrow(), NodeRole::Unassigned);
        assert!(!role_rx.has_changed().unwrap());
        assert_eq!(callback.calls.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_registry_callback() {
        let ensemble = MemoryEnsemble::new();
        let (session, _events) = ensemble.open_session().await;
        let registry = Arc::new(ServiceRegistry::new(Arc::new(session), "/service_registry"));
        registry.ensure_namespace().await.unwrap();

        let callback = RegistryRoleCallback::new(registry.clone());
        callback.become_worker("http://node-3:8081").await.unwrap();
        assert_eq!(registry.refresh().await.unwrap().as_slice(), ["http://node-3:8081".to_string()]);

        // Promotion withdraws our own address
        callback.become_leader().await.unwrap();
        assert!(registry.addresses().await.unwrap().is_empty());
        assert!(registry.current().await.is_none());
    }
}
