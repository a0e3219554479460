//! Cluster Coordination
//!
//! Leader election over ordered ephemeral nodes, the worker service
//! registry, and the role callback that ties the two together.

pub mod election;
pub mod registry;
pub mod callback;

use std::future::Future;
use std::time::Duration;

use serde::Serialize;

use crate::coord::{join_path, Coordinator};
use crate::error::{Error, Result};

pub use election::{ElectionNode, ElectionOutcome, ElectionSnapshot, ElectionState, LeaderElection};
pub use registry::{RegistryEntry, ServiceRegistry};
pub use callback::{NodeRole, RegistryRoleCallback, RoleCallback, RoleDispatcher};

/// Default parent of the election candidate nodes
pub const DEFAULT_ELECTION_PATH: &str = "/election";

/// Default parent of the worker registry entries
pub const DEFAULT_REGISTRY_PATH: &str = "/service_registry";

/// Attempts made for an operation that keeps failing with retryable errors
const RETRY_ATTEMPTS: u32 = 5;

/// Delay before the first retry; doubled after every further attempt
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Run `op` until it succeeds, retrying retryable failures with backoff.
///
/// Non-retryable errors, and the last retryable one, are returned as is.
pub(crate) async fn with_retry<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = RETRY_BACKOFF;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < RETRY_ATTEMPTS => {
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what,
                    attempt,
                    RETRY_ATTEMPTS,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Point-in-time view of a cluster, as seen from outside the election
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    /// Candidate names in election order; the first one leads
    pub candidates: Vec<String>,
    /// Current leader candidate, if any
    pub leader: Option<String>,
    /// Registered worker addresses in registration order
    pub workers: Vec<String>,
}

impl ClusterStatus {
    /// Read the election and registry namespaces without arming any watch
    pub async fn read(
        coordinator: &dyn Coordinator,
        election_path: &str,
        registry_path: &str,
    ) -> Result<Self> {
        let candidates = match coordinator.get_children(election_path, None).await {
            Ok(children) => ElectionSnapshot::from_children(children),
            Err(Error::NoNode(_)) => ElectionSnapshot::default(),
            Err(e) => return Err(e),
        };

        let mut workers = Vec::new();
        let children = match coordinator.get_children(registry_path, None).await {
            Ok(children) => registry::ordered_entries(children),
            Err(Error::NoNode(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        for name in children {
            if let Some((data, _)) = coordinator.get_data(&join_path(registry_path, &name)).await? {
                if let Ok(address) = String::from_utf8(data) {
                    workers.push(address);
                }
            }
        }

        Ok(Self {
            leader: candidates.leader().map(str::to_string),
            candidates: candidates.names().map(str::to_string).collect(),
            workers,
        })
    }
}
