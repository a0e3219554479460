//! Development Coordinator Server
//!
//! Serves a [`MemoryEnsemble`] over TCP. Every connection is one session;
//! a connection that stays silent past its session timeout, or closes, has
//! its session expired and its ephemeral nodes removed.

use std::collections::HashMap;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::protocol::{read_frame, write_frame, Frame, Reply, Request};
use super::{Coordinator, MemoryEnsemble, MemorySession, Watch};
use crate::error::{Error, Result};

/// Lower bound for negotiated session timeouts
const MIN_SESSION_TIMEOUT: Duration = Duration::from_millis(500);

/// TCP front end for a [`MemoryEnsemble`]
pub struct CoordinatorServer {
    /// Bind address
    bind_address: String,
    /// Backing store shared by all connections
    ensemble: MemoryEnsemble,
    /// Largest session timeout a client may negotiate
    max_session_timeout: Duration,
    /// Shutdown signal
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl CoordinatorServer {
    /// Create a new coordinator server
    pub fn new(bind_address: String, ensemble: MemoryEnsemble, max_session_timeout: Duration) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);

        Self {
            bind_address,
            ensemble,
            max_session_timeout: max_session_timeout.max(MIN_SESSION_TIMEOUT),
            shutdown: shutdown_tx,
        }
    }

    /// The store behind this server
    pub fn ensemble(&self) -> &MemoryEnsemble {
        &self.ensemble
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("Coordinator listening on {}", self.bind_address);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let ensemble = self.ensemble.clone();
                            let max_timeout = self.max_session_timeout;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, peer_addr.clone(), ensemble, max_timeout).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Coordinator server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Run one client session to completion
async fn handle_connection(
    socket: TcpStream,
    peer_addr: String,
    ensemble: MemoryEnsemble,
    max_timeout: Duration,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    let requested = match tokio::time::timeout(max_timeout, read_frame(&mut reader)).await {
        Ok(Ok(Frame::Hello { session_timeout_ms })) => Duration::from_millis(session_timeout_ms),
        Ok(Ok(other)) => {
            return Err(Error::Protocol(format!("Expected Hello, got {}", other.type_name())));
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(Error::ConnectionTimeout(peer_addr)),
    };
    let session_timeout = requested.clamp(MIN_SESSION_TIMEOUT, max_timeout);

    let (session, _session_events) = ensemble.open_session().await;
    let session_id = session.session_id();

    let welcome = Frame::Welcome {
        session_id,
        session_timeout_ms: session_timeout.as_millis() as u64,
    };
    if let Err(e) = write_frame(&mut writer, &welcome).await {
        ensemble.expire_session(session_id).await;
        return Err(e);
    }
    tracing::info!(
        "Session {:#x} opened for {} (timeout {}ms)",
        session_id,
        peer_addr,
        session_timeout.as_millis()
    );

    // Replies and pushed events share one writer
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                tracing::debug!("Write to client failed: {}", e);
                break;
            }
        }
    });

    let mut watchers: HashMap<u64, Watch> = HashMap::new();

    let result = loop {
        let frame = match tokio::time::timeout(session_timeout, read_frame(&mut reader)).await {
            Err(_) => {
                tracing::warn!("Session {:#x} from {} timed out", session_id, peer_addr);
                break Ok(());
            }
            Ok(Err(Error::Io(ref e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break Ok(());
            }
            Ok(Err(e)) => break Err(e),
            Ok(Ok(frame)) => frame,
        };

        let (xid, request) = match frame {
            Frame::Request { xid, request } => (xid, request),
            other => {
                break Err(Error::Protocol(format!("Unexpected {} frame", other.type_name())));
            }
        };
        tracing::trace!("Session {:#x}: {} (xid {})", session_id, request.type_name(), xid);

        let closing = matches!(request, Request::Close);
        let reply = execute(&session, request, &mut watchers, &out_tx).await;
        if out_tx.send(Frame::Reply { xid, reply }).is_err() {
            break Ok(());
        }
        if closing {
            break Ok(());
        }
    };

    ensemble.expire_session(session_id).await;
    tracing::info!("Session {:#x} for {} ended", session_id, peer_addr);

    // Forwarders exit once their watches are dropped, then the writer drains
    drop(watchers);
    drop(out_tx);
    let _ = writer_task.await;

    result
}

/// Apply one request to the session
async fn execute(
    session: &MemorySession,
    request: Request,
    watchers: &mut HashMap<u64, Watch>,
    out_tx: &mpsc::UnboundedSender<Frame>,
) -> Reply {
    let result = match request {
        Request::Create { path, data, mode } => {
            session.create(&path, &data, mode).await.map(Reply::Created)
        }
        Request::Exists { path, watch } => {
            let watch = watch.map(|id| forwarder(watchers, id, out_tx));
            session.exists(&path, watch.as_ref()).await.map(Reply::Stat)
        }
        Request::GetChildren { path, watch } => {
            let watch = watch.map(|id| forwarder(watchers, id, out_tx));
            session.get_children(&path, watch.as_ref()).await.map(Reply::Children)
        }
        Request::GetData { path } => session.get_data(&path).await.map(Reply::Data),
        Request::Delete { path, version } => session.delete(&path, version).await.map(Reply::Deleted),
        Request::Ping => Ok(Reply::Pong),
        Request::Close => session.close().await.map(|_| Reply::Closed),
    };

    result.unwrap_or_else(|e| Reply::from_error(&e))
}

/// Server-side stand-in for a client watcher: events are tagged with the
/// client's watcher id and pushed down the connection
fn forwarder(
    watchers: &mut HashMap<u64, Watch>,
    watch_id: u64,
    out_tx: &mpsc::UnboundedSender<Frame>,
) -> Watch {
    watchers
        .entry(watch_id)
        .or_insert_with(|| {
            let (watch, mut rx) = Watch::channel();
            let out = out_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if out.send(Frame::Event { watch_id, event }).is_err() {
                        break;
                    }
                }
            });
            watch
        })
        .clone()
}
