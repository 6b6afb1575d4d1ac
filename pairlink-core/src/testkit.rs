//! In-memory collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::capability::{Capability, CapabilityCheck};
use crate::device::TransportAddress;
use crate::session::ConnectionSession;
use crate::transport::{BoxedStream, Connector, Scanner};

const PIPE_SIZE: usize = 4096;

/// Hands out pre-registered duplex pipes, one per connect, in registration order.
#[derive(Default)]
pub(crate) struct MemoryConnector {
    peers: Mutex<HashMap<TransportAddress, VecDeque<DuplexStream>>>,
    attempts: AtomicUsize,
    last_service: Mutex<Option<Uuid>>,
}

impl MemoryConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register one connectable peer at `addr`; returns the peer's end of the pipe.
    pub(crate) fn add_peer(&self, addr: &str) -> DuplexStream {
        let (ours, theirs) = tokio::io::duplex(PIPE_SIZE);
        self.peers
            .lock()
            .unwrap()
            .entry(TransportAddress::from(addr))
            .or_default()
            .push_back(ours);
        theirs
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn last_service_id(&self) -> Option<Uuid> {
        *self.last_service.lock().unwrap()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        addr: &TransportAddress,
        service_id: Uuid,
    ) -> std::io::Result<BoxedStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        *self.last_service.lock().unwrap() = Some(service_id);
        let stream = self
            .peers
            .lock()
            .unwrap()
            .get_mut(addr)
            .and_then(|q| q.pop_front());
        match stream {
            Some(s) => Ok(Box::new(s)),
            None => Err(std::io::ErrorKind::ConnectionRefused.into()),
        }
    }
}

/// Never completes a connect.
pub(crate) struct PendingConnector;

impl PendingConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(PendingConnector)
    }
}

#[async_trait]
impl Connector for PendingConnector {
    async fn connect(&self, _: &TransportAddress, _: Uuid) -> std::io::Result<BoxedStream> {
        std::future::pending().await
    }
}

/// Holds every connect until `release` is called, then hands out a fresh pipe.
#[derive(Default)]
pub(crate) struct GatedConnector {
    gate: Notify,
    attempts: AtomicUsize,
    peers: Mutex<Vec<DuplexStream>>,
}

impl GatedConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn release(&self) {
        self.gate.notify_one();
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for GatedConnector {
    async fn connect(&self, _: &TransportAddress, _: Uuid) -> std::io::Result<BoxedStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.gate.notified().await;
        let (ours, theirs) = tokio::io::duplex(PIPE_SIZE);
        self.peers.lock().unwrap().push(theirs);
        Ok(Box::new(ours))
    }
}

#[derive(Default)]
pub(crate) struct RecordingScanner {
    starts: AtomicUsize,
    cancels: AtomicUsize,
}

impl RecordingScanner {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

impl Scanner for RecordingScanner {
    fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

/// Capabilities that tests can revoke and restore between calls.
pub(crate) struct ToggleCaps {
    scan: AtomicBool,
    connect: AtomicBool,
    transfer: AtomicBool,
}

impl ToggleCaps {
    pub(crate) fn all() -> Arc<Self> {
        Arc::new(Self {
            scan: AtomicBool::new(true),
            connect: AtomicBool::new(true),
            transfer: AtomicBool::new(true),
        })
    }

    pub(crate) fn set(&self, capability: Capability, granted: bool) {
        self.flag(capability).store(granted, Ordering::SeqCst);
    }

    fn flag(&self, capability: Capability) -> &AtomicBool {
        match capability {
            Capability::Scan => &self.scan,
            Capability::Connect => &self.connect,
            Capability::Transfer => &self.transfer,
        }
    }
}

impl CapabilityCheck for ToggleCaps {
    fn is_granted(&self, capability: Capability) -> bool {
        self.flag(capability).load(Ordering::SeqCst)
    }
}

pub(crate) fn session_with(
    connector: Arc<dyn Connector>,
    capabilities: Arc<dyn CapabilityCheck>,
) -> ConnectionSession {
    ConnectionSession::new(connector, capabilities)
}

/// Peer that answers `PING` with `PONG` and echoes anything else.
pub(crate) fn spawn_ping_peer(mut peer: DuplexStream) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            let n = match peer.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            let reply: &[u8] = if &buf[..n] == b"PING" { b"PONG" } else { &buf[..n] };
            if peer.write_all(reply).await.is_err() {
                return;
            }
        }
    })
}
