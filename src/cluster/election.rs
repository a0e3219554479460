//! Leader Election
//!
//! Every participant creates one ephemeral sequential node under the
//! election path. The participant holding the smallest sequence number is
//! the leader; every other participant watches only its immediate
//! predecessor, so a departure wakes exactly one peer.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::callback::RoleDispatcher;
use super::with_retry;
use crate::coord::{
    ensure_path, join_path, node_name, sequence_of, Coordinator, CreateMode, EventKind, Watch,
    WatchedEvent,
};
use crate::error::{Error, Result};

/// Name prefix of election candidate nodes
pub const CANDIDATE_PREFIX: &str = "c_";

/// This process's candidate node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionNode {
    /// Node name without the parent path (e.g. `c_0000000003`)
    pub name: String,
    /// Sequence number assigned by the coordinator
    pub sequence: u64,
    /// Full path of the node
    pub full_path: String,
}

impl ElectionNode {
    fn from_path(full_path: String) -> Result<Self> {
        let name = node_name(&full_path).to_string();
        let sequence = sequence_of(&name)
            .ok_or_else(|| Error::Protocol(format!("{} carries no sequence number", full_path)))?;
        Ok(Self { name, sequence, full_path })
    }
}

/// Candidate names read at one instant, in election order
#[derive(Debug, Clone, Default)]
pub struct ElectionSnapshot {
    candidates: Vec<(u64, String)>,
}

impl ElectionSnapshot {
    /// Order children by their numeric sequence suffix
    pub fn from_children(children: Vec<String>) -> Self {
        let mut candidates: Vec<(u64, String)> = children
            .into_iter()
            .filter_map(|name| match sequence_of(&name) {
                Some(sequence) => Some((sequence, name)),
                None => {
                    tracing::warn!("Ignoring election child without sequence: {}", name);
                    None
                }
            })
            .collect();
        candidates.sort();
        Self { candidates }
    }

    /// The leading candidate
    pub fn leader(&self) -> Option<&str> {
        self.candidates.first().map(|(_, name)| name.as_str())
    }

    /// Index of a candidate in election order
    pub fn position(&self, name: &str) -> Option<usize> {
        self.candidates.iter().position(|(_, n)| n == name)
    }

    /// The candidate immediately ahead of `name`
    pub fn predecessor_of(&self, name: &str) -> Option<&str> {
        match self.position(name)? {
            0 => None,
            idx => Some(self.candidates[idx - 1].1.as_str()),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.candidates.iter().map(|(_, name)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Election progress of this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    /// No candidate node yet
    Unnominated,
    /// Candidate node created, no election run yet
    Nominated,
    /// Holds the smallest sequence number
    Leader,
    /// Waiting on a predecessor
    Watching,
}

/// Result of one election run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    Leader,
    Worker {
        /// Name of the current leader candidate
        leader: String,
        /// Name of the candidate being watched
        predecessor: String,
    },
}

impl ElectionOutcome {
    pub fn is_leader(&self) -> bool {
        matches!(self, ElectionOutcome::Leader)
    }
}

/// One participant's view of the election
pub struct LeaderElection {
    /// Coordinator session this candidate lives in
    coordinator: Arc<dyn Coordinator>,
    /// Parent of all candidate nodes
    election_path: String,
    /// Our candidate node once nominated
    node: RwLock<Option<ElectionNode>>,
    /// Current election state
    state: RwLock<ElectionState>,
    /// Full path of the predecessor being watched
    watching: RwLock<Option<String>>,
    /// Serialises election runs
    gate: Mutex<()>,
    /// Serialises a run together with the dispatch of its outcome
    turn: Mutex<()>,
    /// Watcher armed on the predecessor
    watch: Watch,
    /// Receiving end of `watch`, taken by the watch loop
    events: Mutex<Option<mpsc::UnboundedReceiver<WatchedEvent>>>,
}

impl LeaderElection {
    /// Create an election participant bound to one coordinator session
    pub fn new(coordinator: Arc<dyn Coordinator>, election_path: impl Into<String>) -> Self {
        let (watch, events) = Watch::channel();
        Self {
            coordinator,
            election_path: election_path.into(),
            node: RwLock::new(None),
            state: RwLock::new(ElectionState::Unnominated),
            watching: RwLock::new(None),
            gate: Mutex::new(()),
            turn: Mutex::new(()),
            watch,
            events: Mutex::new(Some(events)),
        }
    }

    pub fn election_path(&self) -> &str {
        &self.election_path
    }

    /// Get current state
    pub async fn state(&self) -> ElectionState {
        *self.state.read().await
    }

    /// Our candidate node, if nominated
    pub async fn node(&self) -> Option<ElectionNode> {
        self.node.read().await.clone()
    }

    /// Full path of the predecessor currently watched
    pub async fn watching(&self) -> Option<String> {
        self.watching.read().await.clone()
    }

    /// Create this process's candidate node
    pub async fn self_nominate(&self) -> Result<ElectionNode> {
        let _gate = self.gate.lock().await;

        if let Some(node) = self.node.read().await.as_ref() {
            return Err(Error::AlreadyNominated(node.full_path.clone()));
        }

        ensure_path(self.coordinator.as_ref(), &self.election_path).await?;
        let prefix = join_path(&self.election_path, CANDIDATE_PREFIX);
        let full_path = self
            .coordinator
            .create(&prefix, &[], CreateMode::EphemeralSequential)
            .await?;
        let node = ElectionNode::from_path(full_path)?;

        tracing::info!("Nominated as {}", node.full_path);
        *self.node.write().await = Some(node.clone());
        *self.state.write().await = ElectionState::Nominated;

        Ok(node)
    }

    /// Decide whether this process leads, arming a predecessor watch if not
    pub async fn run_election(&self) -> Result<ElectionOutcome> {
        let _gate = self.gate.lock().await;

        let node = self.node.read().await.clone().ok_or(Error::NotNominated)?;

        // A vanished predecessor means the order changed under us: re-read
        loop {
            let children = self.coordinator.get_children(&self.election_path, None).await?;
            let snapshot = ElectionSnapshot::from_children(children);

            let position = match snapshot.position(&node.name) {
                Some(position) => position,
                None => {
                    *self.watching.write().await = None;
                    return Err(Error::CoordinationUnavailable(format!(
                        "candidate {} is gone; session lost",
                        node.full_path
                    )));
                }
            };

            if position == 0 {
                *self.watching.write().await = None;
                *self.state.write().await = ElectionState::Leader;
                tracing::info!("{} is the leader ({} candidates)", node.name, snapshot.len());
                return Ok(ElectionOutcome::Leader);
            }

            let predecessor = snapshot
                .predecessor_of(&node.name)
                .map(str::to_string)
                .ok_or_else(|| Error::Internal("candidate has no predecessor".into()))?;
            let leader = snapshot.leader().map(str::to_string).unwrap_or_default();
            let predecessor_path = join_path(&self.election_path, &predecessor);

            // Record the target before arming so an immediate event is not taken as stale
            *self.watching.write().await = Some(predecessor_path.clone());

            match self.watch_predecessor(&predecessor_path).await {
                Ok(()) => {
                    *self.state.write().await = ElectionState::Watching;
                    tracing::info!(
                        "{} is a worker: watching {}, leader is {}",
                        node.name,
                        predecessor,
                        leader
                    );
                    return Ok(ElectionOutcome::Worker { leader, predecessor });
                }
                Err(Error::StaleReference(path)) => {
                    tracing::debug!("Predecessor {} vanished before the watch was set; retrying", path);
                }
                Err(e) => {
                    *self.watching.write().await = None;
                    return Err(e);
                }
            }
        }
    }

    /// Run the election and hand the outcome to `dispatcher`.
    ///
    /// Outcomes reach the dispatcher in the order the runs happened. A
    /// failing role hook fails the whole call so it can be run again.
    pub async fn run_and_dispatch(&self, dispatcher: &RoleDispatcher) -> Result<ElectionOutcome> {
        let _turn = self.turn.lock().await;
        let outcome = self.run_election().await?;
        dispatcher.dispatch(&outcome).await?;
        Ok(outcome)
    }

    /// Arm the one-shot deletion watch on the predecessor
    async fn watch_predecessor(&self, path: &str) -> Result<()> {
        match self.coordinator.exists(path, Some(&self.watch)).await? {
            Some(_) => Ok(()),
            None => Err(Error::StaleReference(path.to_string())),
        }
    }

    /// Re-run the election whenever the watched predecessor goes away.
    ///
    /// Transient failures are retried with backoff. Any other failure ends
    /// the loop with that error, since no watch is armed after it.
    pub async fn spawn_watch_loop(
        self: &Arc<Self>,
        dispatcher: Arc<RoleDispatcher>,
    ) -> Result<JoinHandle<Result<()>>> {
        let mut events = self
            .events
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal("election watch loop already running".into()))?;
        let election = Arc::clone(self);

        Ok(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if event.kind != EventKind::NodeDeleted {
                    tracing::trace!("Election watch: ignoring {}", event.kind);
                    continue;
                }

                let target = election.watching.read().await.clone();
                if event.path.is_none() || event.path != target {
                    tracing::debug!("Election watch: stale deletion of {:?}", event.path);
                    continue;
                }

                tracing::info!("Predecessor {:?} left; re-running election", event.path);
                match with_retry("Re-election", || election.run_and_dispatch(&dispatcher)).await {
                    Ok(outcome) => tracing::debug!("Re-election outcome: {:?}", outcome),
                    Err(e) => {
                        tracing::warn!("Election watch loop ending: {}", e);
                        return Err(e);
                    }
                }
            }
            Ok(())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::callback::{NodeRole, RoleCallback};
    use crate::coord::{MemoryEnsemble, MemorySession, SessionId};
    use async_trait::async_trait;
    use std::time::Duration;

    const PATH: &str = "/election";

    async fn participant(ensemble: &MemoryEnsemble) -> (Arc<LeaderElection>, SessionId) {
        let (session, _events) = ensemble.open_session().await;
        let id = session.session_id();
        let election = Arc::new(LeaderElection::new(Arc::new(session), PATH));
        election.self_nominate().await.unwrap();
        (election, id)
    }

    struct NoopCallback;

    #[async_trait]
    impl RoleCallback for NoopCallback {
        async fn become_leader(&self) -> Result<()> {
            Ok(())
        }

        async fn become_worker(&self, _address: &str) -> Result<()> {
            Ok(())
        }
    }

    fn dispatcher() -> Arc<RoleDispatcher> {
        let (role_tx, _) = tokio::sync::watch::channel(NodeRole::Unassigned);
        Arc::new(RoleDispatcher::new(Arc::new(NoopCallback), "http://test:8081", Arc::new(role_tx)))
    }

    async fn wait_for_state(election: &LeaderElection, state: ElectionState) {
        for _ in 0..100 {
            if election.state().await == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("election never reached {:?}", state);
    }

    #[test]
    fn test_snapshot_orders_numerically() {
        let snapshot = ElectionSnapshot::from_children(vec![
            "c_10".to_string(),
            "c_9".to_string(),
            "junk".to_string(),
            "c_100".to_string(),
        ]);
        assert_eq!(snapshot.names().collect::<Vec<_>>(), vec!["c_9", "c_10", "c_100"]);
        assert_eq!(snapshot.leader(), Some("c_9"));
        assert_eq!(snapshot.predecessor_of("c_100"), Some("c_10"));
        assert_eq!(snapshot.predecessor_of("c_9"), None);
        assert_eq!(snapshot.position("junk"), None);
    }

    #[tokio::test]
    async fn test_misuse_errors() {
        let ensemble = MemoryEnsemble::new();
        let (session, _events) = ensemble.open_session().await;
        let election = LeaderElection::new(Arc::new(session), PATH);

        assert!(matches!(election.run_election().await, Err(Error::NotNominated)));
        assert_eq!(election.state().await, ElectionState::Unnominated);

        election.self_nominate().await.unwrap();
        assert_eq!(election.state().await, ElectionState::Nominated);
        assert!(matches!(election.self_nominate().await, Err(Error::AlreadyNominated(_))));
    }

    #[tokio::test]
    async fn test_three_participants() {
        let ensemble = MemoryEnsemble::new();
        let (a, _) = participant(&ensemble).await;
        let (b, _) = participant(&ensemble).await;
        let (c, _) = participant(&ensemble).await;

        assert_eq!(a.run_election().await.unwrap(), ElectionOutcome::Leader);
        assert_eq!(
            b.run_election().await.unwrap(),
            ElectionOutcome::Worker {
                leader: "c_0000000001".into(),
                predecessor: "c_0000000001".into(),
            }
        );
        assert_eq!(
            c.run_election().await.unwrap(),
            ElectionOutcome::Worker {
                leader: "c_0000000001".into(),
                predecessor: "c_0000000002".into(),
            }
        );

        assert_eq!(a.watching().await, None);
        assert_eq!(b.watching().await.as_deref(), Some("/election/c_0000000001"));
        assert_eq!(c.watching().await.as_deref(), Some("/election/c_0000000002"));
    }

    #[tokio::test]
    async fn test_single_leader_and_chain() {
        let ensemble = MemoryEnsemble::new();
        let mut participants = Vec::new();
        for _ in 0..6 {
            participants.push(participant(&ensemble).await.0);
        }

        let mut leaders = 0;
        let mut smallest = u64::MAX;
        for election in &participants {
            let node = election.node().await.unwrap();
            smallest = smallest.min(node.sequence);
            match election.run_election().await.unwrap() {
                ElectionOutcome::Leader => {
                    leaders += 1;
                    assert_eq!(node.sequence, 1);
                }
                ElectionOutcome::Worker { predecessor, .. } => {
                    // Each worker watches the next smaller sequence
                    assert_eq!(sequence_of(&predecessor), Some(node.sequence - 1));
                }
            }
        }
        assert_eq!(leaders, 1);
        assert_eq!(smallest, 1);
    }

    #[tokio::test]
    async fn test_leader_kill_promotes_next() {
        let ensemble = MemoryEnsemble::new();
        let (a, a_session) = participant(&ensemble).await;
        let (b, _) = participant(&ensemble).await;
        let (c, _) = participant(&ensemble).await;

        a.run_election().await.unwrap();
        b.run_election().await.unwrap();
        c.run_election().await.unwrap();

        let b_loop = b.spawn_watch_loop(dispatcher()).await.unwrap();
        let c_loop = c.spawn_watch_loop(dispatcher()).await.unwrap();

        assert!(ensemble.expire_session(a_session).await);
        wait_for_state(&b, ElectionState::Leader).await;

        // c's predecessor is untouched, so it keeps watching b
        assert_eq!(c.state().await, ElectionState::Watching);
        assert_eq!(c.watching().await.as_deref(), Some("/election/c_0000000002"));

        b_loop.abort();
        c_loop.abort();
    }

    #[tokio::test]
    async fn test_middle_departure_rewires_watch() {
        let ensemble = MemoryEnsemble::new();
        let (a, _) = participant(&ensemble).await;
        let (b, b_session) = participant(&ensemble).await;
        let (c, _) = participant(&ensemble).await;

        a.run_election().await.unwrap();
        b.run_election().await.unwrap();
        c.run_election().await.unwrap();
        let c_loop = c.spawn_watch_loop(dispatcher()).await.unwrap();

        ensemble.expire_session(b_session).await;

        for _ in 0..100 {
            if c.watching().await.as_deref() == Some("/election/c_0000000001") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(c.watching().await.as_deref(), Some("/election/c_0000000001"));
        assert_eq!(a.state().await, ElectionState::Leader);
        c_loop.abort();
    }

    /// Session wrapper that expires another session right before the
    /// first watch is armed, so the predecessor vanishes mid-election
    struct VanishingPredecessor {
        inner: MemorySession,
        ensemble: MemoryEnsemble,
        victim: Mutex<Option<SessionId>>,
    }

    #[async_trait]
    impl Coordinator for VanishingPredecessor {
        fn session_id(&self) -> SessionId {
            self.inner.session_id()
        }

        async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
            self.inner.create(path, data, mode).await
        }

        async fn exists(&self, path: &str, watch: Option<&Watch>) -> Result<Option<crate::coord::NodeStat>> {
            if watch.is_some() {
                if let Some(victim) = self.victim.lock().await.take() {
                    self.ensemble.expire_session(victim).await;
                }
            }
            self.inner.exists(path, watch).await
        }

        async fn get_children(&self, path: &str, watch: Option<&Watch>) -> Result<Vec<String>> {
            self.inner.get_children(path, watch).await
        }

        async fn get_data(&self, path: &str) -> Result<Option<(Vec<u8>, crate::coord::NodeStat)>> {
            self.inner.get_data(path).await
        }

        async fn delete(&self, path: &str, expected_version: Option<u32>) -> Result<bool> {
            self.inner.delete(path, expected_version).await
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_vanished_predecessor_retries() {
        let ensemble = MemoryEnsemble::new();
        let (a, _) = participant(&ensemble).await;
        let (_b, b_session) = participant(&ensemble).await;

        let (session, _events) = ensemble.open_session().await;
        let racing = VanishingPredecessor {
            inner: session,
            ensemble: ensemble.clone(),
            victim: Mutex::new(Some(b_session)),
        };
        let c = LeaderElection::new(Arc::new(racing), PATH);
        c.self_nominate().await.unwrap();

        a.run_election().await.unwrap();

        // c first targets b, finds it gone, and settles on a
        match c.run_election().await.unwrap() {
            ElectionOutcome::Worker { leader, predecessor } => {
                assert_eq!(leader, "c_0000000001");
                assert_eq!(predecessor, "c_0000000001");
            }
            ElectionOutcome::Leader => panic!("c must not lead while a is alive"),
        }
        assert_eq!(c.watching().await.as_deref(), Some("/election/c_0000000001"));
        assert_eq!(c.state().await, ElectionState::Watching);

        // The attempt on b left no watch behind; only the one on a remains
        assert_eq!(ensemble.watch_count().await, 1);
    }

    #[tokio::test]
    async fn test_watch_loop_reports_lost_candidate() {
        let ensemble = MemoryEnsemble::new();
        let (a, a_session) = participant(&ensemble).await;
        let (b, _) = participant(&ensemble).await;
        a.run_election().await.unwrap();
        b.run_election().await.unwrap();
        let b_loop = b.spawn_watch_loop(dispatcher()).await.unwrap();

        // b's own candidate disappears, then its predecessor leaves
        let (admin, _events) = ensemble.open_session().await;
        admin.delete("/election/c_0000000002", None).await.unwrap();
        ensemble.expire_session(a_session).await;

        let result = tokio::time::timeout(Duration::from_secs(2), b_loop)
            .await
            .expect("watch loop should stop")
            .unwrap();
        assert!(matches!(result, Err(Error::CoordinationUnavailable(_))));
    }

    #[tokio::test]
    async fn test_lost_session_is_unavailable() {
        let ensemble = MemoryEnsemble::new();
        let (observer, _events) = ensemble.open_session().await;
        let (a, a_session) = participant(&ensemble).await;
        a.run_election().await.unwrap();

        ensemble.expire_session(a_session).await;
        let err = a.run_election().await.unwrap_err();
        assert!(err.ends_epoch());
        assert!(observer.get_children(PATH, None).await.unwrap().is_empty());
    }
}
