//! Fault injection for tests: a memory session that times out chosen calls
//! while the session itself stays alive.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::{Connector, Coordinator, CreateMode, MemoryEnsemble, MemorySession, NodeStat, Session, SessionId, Watch};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultOp {
    Create,
    GetChildren,
}

/// Which calls time out
#[derive(Debug, Clone, Copy)]
pub(crate) struct Fault {
    op: FaultOp,
    path: &'static str,
    /// 1-based index of the first failing call on `path`
    nth: usize,
    /// Keep failing every matching call after the first
    persistent: bool,
}

impl Fault {
    /// Fail only the `nth` `op` on `path`
    pub(crate) fn once(op: FaultOp, path: &'static str, nth: usize) -> Self {
        Self { op, path, nth, persistent: false }
    }

    /// Fail the `nth` `op` on `path` and every one after it
    pub(crate) fn from(op: FaultOp, path: &'static str, nth: usize) -> Self {
        Self { op, path, nth, persistent: true }
    }
}

pub(crate) struct FlakySession {
    inner: MemorySession,
    fault: Fault,
    calls: AtomicUsize,
}

impl FlakySession {
    pub(crate) fn new(inner: MemorySession, fault: Fault) -> Self {
        Self {
            inner,
            fault,
            calls: AtomicUsize::new(0),
        }
    }

    fn check(&self, op: FaultOp, path: &str) -> Result<()> {
        if op != self.fault.op || path != self.fault.path {
            return Ok(());
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fault.nth || (self.fault.persistent && call > self.fault.nth) {
            tracing::debug!("Injected timeout on {:?} {} (call {})", op, path, call);
            return Err(Error::ConnectionTimeout(format!("{} timed out", path)));
        }
        Ok(())
    }
}

#[async_trait]
impl Coordinator for FlakySession {
    fn session_id(&self) -> SessionId {
        self.inner.session_id()
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.check(FaultOp::Create, path)?;
        self.inner.create(path, data, mode).await
    }

    async fn exists(&self, path: &str, watch: Option<&Watch>) -> Result<Option<NodeStat>> {
        self.inner.exists(path, watch).await
    }

    async fn get_children(&self, path: &str, watch: Option<&Watch>) -> Result<Vec<String>> {
        self.check(FaultOp::GetChildren, path)?;
        self.inner.get_children(path, watch).await
    }

    async fn get_data(&self, path: &str) -> Result<Option<(Vec<u8>, NodeStat)>> {
        self.inner.get_data(path).await
    }

    async fn delete(&self, path: &str, expected_version: Option<u32>) -> Result<bool> {
        self.inner.delete(path, expected_version).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Hands out one flaky session, then clean ones
pub(crate) struct FlakyConnector {
    ensemble: MemoryEnsemble,
    fault: std::sync::Mutex<Option<Fault>>,
}

impl FlakyConnector {
    pub(crate) fn new(ensemble: MemoryEnsemble, fault: Fault) -> Self {
        Self {
            ensemble,
            fault: std::sync::Mutex::new(Some(fault)),
        }
    }
}

#[async_trait]
impl Connector for FlakyConnector {
    async fn connect(&self) -> Result<Session> {
        let (session, events) = self.ensemble.open_session().await;
        let fault = self
            .fault
            .lock()
            .map_err(|_| Error::Internal("fault lock poisoned".into()))?
            .take();
        let coordinator: Arc<dyn Coordinator> = match fault {
            Some(fault) => Arc::new(FlakySession::new(session, fault)),
            None => Arc::new(session),
        };
        Ok(Session { coordinator, events })
    }
}
