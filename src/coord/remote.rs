//! Remote Coordinator Client
//!
//! TCP client for [`CoordinatorServer`](super::CoordinatorServer). Requests
//! are pipelined by transaction id, pushed watch events are routed to the
//! registered watchers, and a background ping keeps the session alive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::protocol::{read_frame, write_frame, Frame, Reply, Request};
use super::{
    Connector, Coordinator, CreateMode, EventKind, NodeStat, Session, SessionEvents, SessionId,
    Watch, WatchedEvent,
};
use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// Opens [`RemoteCoordinator`] sessions against one server address
#[derive(Debug, Clone)]
pub struct RemoteConnector {
    address: String,
    session_timeout: Duration,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl RemoteConnector {
    /// Create a connector
    pub fn new(
        address: String,
        session_timeout: Duration,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            address,
            session_timeout,
            connect_timeout,
            request_timeout,
        }
    }

    /// Create a connector from the `[coordinator]` config section
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self::new(
            config.address.clone(),
            Duration::from_millis(config.session_timeout_ms),
            Duration::from_millis(config.connect_timeout_ms),
            Duration::from_millis(config.request_timeout_ms),
        )
    }
}

#[async_trait]
impl Connector for RemoteConnector {
    async fn connect(&self) -> Result<Session> {
        let (coordinator, events) = RemoteCoordinator::connect(
            &self.address,
            self.session_timeout,
            self.connect_timeout,
            self.request_timeout,
        ).await?;

        Ok(Session {
            coordinator: Arc::new(coordinator),
            events,
        })
    }
}

/// One session on a remote coordinator
pub struct RemoteCoordinator {
    /// Server address
    address: String,
    /// Session assigned by the server
    session_id: SessionId,
    /// Per-request timeout
    request_timeout: Duration,
    /// Frames to the writer task
    outbound: mpsc::UnboundedSender<Frame>,
    /// Callers waiting for a reply, by xid
    pending: PendingReplies,
    /// Registered watchers, by watcher id
    watchers: Arc<RwLock<HashMap<u64, Watch>>>,
    /// Next transaction id
    next_xid: Arc<AtomicU64>,
    /// Cleared when the connection drops
    alive: Arc<AtomicBool>,
    /// Reader, writer and ping tasks
    tasks: Vec<JoinHandle<()>>,
}

impl RemoteCoordinator {
    /// Connect and open a session
    pub async fn connect(
        address: &str,
        session_timeout: Duration,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<(Self, SessionEvents)> {
        let stream = match timeout(connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::ConnectionFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => return Err(Error::ConnectionTimeout(address.to_string())),
        };
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        write_frame(&mut writer, &Frame::Hello {
            session_timeout_ms: session_timeout.as_millis() as u64,
        }).await?;

        let (session_id, negotiated) = match timeout(connect_timeout, read_frame(&mut reader)).await {
            Ok(Ok(Frame::Welcome { session_id, session_timeout_ms })) => {
                (session_id, Duration::from_millis(session_timeout_ms))
            }
            Ok(Ok(other)) => {
                return Err(Error::Protocol(format!("Expected Welcome, got {}", other.type_name())));
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::ConnectionTimeout(address.to_string())),
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(WatchedEvent::session(EventKind::SessionConnected));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let watchers: Arc<RwLock<HashMap<u64, Watch>>> = Arc::new(RwLock::new(HashMap::new()));
        let next_xid = Arc::new(AtomicU64::new(1));
        let alive = Arc::new(AtomicBool::new(true));

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    tracing::debug!("Write to coordinator failed: {}", e);
                    break;
                }
            }
        });

        let reader_task = {
            let pending = Arc::clone(&pending);
            let watchers = Arc::clone(&watchers);
            let alive = Arc::clone(&alive);
            let address = address.to_string();
            tokio::spawn(async move {
                loop {
                    match read_frame(&mut reader).await {
                        Ok(Frame::Reply { xid, reply }) => {
                            if let Some(tx) = pending.lock().await.remove(&xid) {
                                let _ = tx.send(reply);
                            }
                        }
                        Ok(Frame::Event { watch_id, event }) => {
                            let watch = watchers.read().await.get(&watch_id).cloned();
                            match watch {
                                Some(watch) => {
                                    watch.fire(event);
                                }
                                None => tracing::trace!("Event for unknown watcher {}", watch_id),
                            }
                        }
                        Ok(other) => {
                            tracing::warn!("Unexpected {} frame from {}", other.type_name(), address);
                        }
                        Err(e) => {
                            tracing::debug!("Coordinator connection to {} closed: {}", address, e);
                            break;
                        }
                    }
                }

                alive.store(false, Ordering::SeqCst);
                // Dropping the senders fails every waiting call
                pending.lock().await.clear();
                let _ = events_tx.send(WatchedEvent::session(EventKind::SessionLost));
            })
        };

        let ping_task = {
            let out_tx = out_tx.clone();
            let next_xid = Arc::clone(&next_xid);
            let alive = Arc::clone(&alive);
            let interval = (negotiated / 3).max(Duration::from_millis(50));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if !alive.load(Ordering::SeqCst) {
                        break;
                    }
                    let xid = next_xid.fetch_add(1, Ordering::Relaxed);
                    if out_tx.send(Frame::Request { xid, request: Request::Ping }).is_err() {
                        break;
                    }
                }
            })
        };

        let coordinator = Self {
            address: address.to_string(),
            session_id,
            request_timeout,
            outbound: out_tx,
            pending,
            watchers,
            next_xid,
            alive,
            tasks: vec![writer_task, reader_task, ping_task],
        };

        tracing::info!(
            "Connected to coordinator at {} (session {:#x}, timeout {}ms)",
            address,
            session_id,
            negotiated.as_millis()
        );

        Ok((coordinator, events_rx))
    }

    /// Whether the connection is still up
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn lost(&self) -> Error {
        Error::CoordinationUnavailable(format!("connection to {} lost", self.address))
    }

    /// Send a request and wait for its reply
    async fn call(&self, request: Request) -> Result<Reply> {
        if !self.is_alive() {
            return Err(self.lost());
        }

        let xid = self.next_xid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(xid, tx);

        // The reader may have drained `pending` between the check and the insert
        if !self.is_alive() || self.outbound.send(Frame::Request { xid, request }).is_err() {
            self.pending.lock().await.remove(&xid);
            return Err(self.lost());
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(Reply::Error { code, message })) => Err(code.into_error(message, self.session_id)),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(self.lost()),
            Err(_) => {
                self.pending.lock().await.remove(&xid);
                Err(Error::ConnectionTimeout(self.address.clone()))
            }
        }
    }

    /// Remember a watcher so pushed events can reach it
    async fn register_watch(&self, watch: Option<&Watch>) -> Option<u64> {
        let watch = watch?;
        let mut watchers = self.watchers.write().await;
        watchers.retain(|_, w| !w.is_closed());
        watchers.entry(watch.id()).or_insert_with(|| watch.clone());
        Some(watch.id())
    }
}

fn unexpected(reply: Reply) -> Error {
    Error::Protocol(format!("Unexpected {} reply", reply.type_name()))
}

#[async_trait]
impl Coordinator for RemoteCoordinator {
    fn session_id(&self) -> SessionId {
        self.session_id
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        let request = Request::Create {
            path: path.to_string(),
            data: data.to_vec(),
            mode,
        };
        match self.call(request).await? {
            Reply::Created(full_path) => Ok(full_path),
            other => Err(unexpected(other)),
        }
    }

    async fn exists(&self, path: &str, watch: Option<&Watch>) -> Result<Option<NodeStat>> {
        let watch = self.register_watch(watch).await;
        match self.call(Request::Exists { path: path.to_string(), watch }).await? {
            Reply::Stat(stat) => Ok(stat),
            other => Err(unexpected(other)),
        }
    }

    async fn get_children(&self, path: &str, watch: Option<&Watch>) -> Result<Vec<String>> {
        let watch = self.register_watch(watch).await;
        match self.call(Request::GetChildren { path: path.to_string(), watch }).await? {
            Reply::Children(children) => Ok(children),
            other => Err(unexpected(other)),
        }
    }

    async fn get_data(&self, path: &str) -> Result<Option<(Vec<u8>, NodeStat)>> {
        match self.call(Request::GetData { path: path.to_string() }).await? {
            Reply::Data(data) => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    async fn delete(&self, path: &str, expected_version: Option<u32>) -> Result<bool> {
        let request = Request::Delete {
            path: path.to_string(),
            version: expected_version,
        };
        match self.call(request).await? {
            Reply::Deleted(deleted) => Ok(deleted),
            other => Err(unexpected(other)),
        }
    }

    async fn close(&self) -> Result<()> {
        let result = match self.call(Request::Close).await {
            Ok(Reply::Closed) => Ok(()),
            Ok(other) => Err(unexpected(other)),
            // Already gone; the server expires the session on its own
            Err(e) if e.ends_epoch() => Ok(()),
            Err(e) => Err(e),
        };
        self.alive.store(false, Ordering::SeqCst);
        tracing::info!("Closed coordinator session {:#x}", self.session_id);
        result
    }
}

impl Drop for RemoteCoordinator {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::{ensure_path, CoordinatorServer, MemoryEnsemble};
    use tokio::net::TcpListener;

    async fn start_server() -> (Arc<CoordinatorServer>, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = Arc::new(CoordinatorServer::new(
            address.clone(),
            MemoryEnsemble::new(),
            Duration::from_secs(5),
        ));
        let running = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = running.serve(listener).await;
        });
        (server, address)
    }

    fn connector(address: &str) -> RemoteConnector {
        RemoteConnector::new(
            address.to_string(),
            Duration::from_secs(3),
            Duration::from_secs(1),
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn test_remote_round_trip() {
        let (server, address) = start_server().await;
        let Session { coordinator, mut events } = connector(&address).connect().await.unwrap();
        assert_eq!(server.ensemble().session_count().await, 1);

        ensure_path(coordinator.as_ref(), "/wolfkeeper/election").await.unwrap();
        let path = coordinator
            .create("/wolfkeeper/election/c_", b"", CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert_eq!(path, "/wolfkeeper/election/c_0000000001");

        let children = coordinator.get_children("/wolfkeeper/election", None).await.unwrap();
        assert_eq!(children, vec!["c_0000000001"]);

        let dup = coordinator.create("/wolfkeeper", &[], CreateMode::Persistent).await;
        assert!(matches!(dup, Err(Error::NodeExists(_))));

        let missing = coordinator.get_data("/wolfkeeper/election/c_0000000009").await.unwrap();
        assert!(missing.is_none());

        coordinator.close().await.unwrap();
        let lost = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(event) = events.recv().await {
                if event.kind == EventKind::SessionLost {
                    return true;
                }
            }
            false
        }).await;
        assert_eq!(lost.ok(), Some(true));
    }

    #[tokio::test]
    async fn test_watch_fires_across_connections() {
        let (_server, address) = start_server().await;
        let owner = connector(&address).connect().await.unwrap().coordinator;
        let observer = connector(&address).connect().await.unwrap().coordinator;

        ensure_path(owner.as_ref(), "/service_registry").await.unwrap();
        let entry = owner
            .create("/service_registry/n_", b"http://10.0.0.5:8081", CreateMode::EphemeralSequential)
            .await
            .unwrap();

        let (watch, mut rx) = Watch::channel();
        assert!(observer.exists(&entry, Some(&watch)).await.unwrap().is_some());

        let (data, stat) = observer.get_data(&entry).await.unwrap().unwrap();
        assert_eq!(data, b"http://10.0.0.5:8081");
        assert_eq!(stat.ephemeral_owner, Some(owner.session_id()));

        owner.close().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(event, WatchedEvent::node(EventKind::NodeDeleted, &entry));
        assert!(observer.exists(&entry, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connection_failure() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = connector(&address).connect().await;
        assert!(matches!(
            result,
            Err(Error::ConnectionFailed { .. }) | Err(Error::ConnectionTimeout(_))
        ));
    }
}
