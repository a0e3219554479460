//! WolfKeeper - Leader Election and Service Discovery
//!
//! A coordination client that lets a fleet of identical processes agree on
//! a single leader and keep a live list of reachable workers, built on a
//! hierarchical coordination service with ordered ephemeral nodes and
//! one-shot watches.
//!
//! # Architecture
//!
//! Every process creates an ephemeral sequential candidate node. The
//! smallest sequence number leads; each other process watches only the
//! candidate directly ahead of it, so a departure wakes a single peer.
//! Workers publish their address in a service registry that every process
//! caches and refreshes on change.
//!
//! # Features
//!
//! - Predecessor-chained leader election without herd effects
//! - Worker registry with snapshot-swapped address cache
//! - Automatic rejoin with a fresh session after session loss
//! - In-process coordinator for tests and simulation
//! - Development coordinator server and TCP client

pub mod config;
pub mod error;
pub mod coord;
pub mod cluster;
pub mod node;

pub use config::WolfKeeperConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfKeeperConfig;
    pub use crate::error::{Error, Result};
    pub use crate::coord::{Connector, Coordinator, MemoryEnsemble, RemoteConnector};
    pub use crate::cluster::{ElectionOutcome, LeaderElection, NodeRole, RoleCallback, ServiceRegistry};
    pub use crate::node::ClusterNode;
}
