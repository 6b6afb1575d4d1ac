//! The single-connection session: connect, send, receive, disconnect over one exclusively owned handle.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::capability::{Capability, CapabilityCheck};
use crate::config::SessionConfig;
use crate::device::{DeviceRecord, LastDeviceAddress, PairedDevices, TransportAddress};
use crate::error::SessionError;
use crate::events::{Notice, SessionEvents, SessionState};
use crate::transport::{BoxedStream, Connector, NoScanner, Scanner};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// The live connection. Read and write halves are locked separately so a blocked
/// read never holds up a send or a close.
struct ConnectionHandle {
    address: TransportAddress,
    reader: Mutex<ReadHalf<BoxedStream>>,
    writer: Mutex<WriteHalf<BoxedStream>>,
    /// Set once by `close`; pending writes bail out with `BrokenPipe`.
    closed: watch::Sender<bool>,
    /// Consecutive failed transfers on this handle.
    failures: AtomicU32,
}

impl ConnectionHandle {
    fn new(address: TransportAddress, stream: BoxedStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            address,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: watch::channel(false).0,
            failures: AtomicU32::new(0),
        }
    }

    /// Write and flush, unless the handle is closed first.
    async fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut closed = self.closed.subscribe();
        let closing = async move {
            let _ = closed.wait_for(|c| *c).await;
        };
        let write = async {
            let mut w = self.writer.lock().await;
            w.write_all(bytes).await?;
            w.flush().await
        };
        tokio::select! {
            biased;
            () = closing => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "connection closed",
            )),
            r = write => r,
        }
    }

    /// Abort pending writes, then shut down the write side. A read still in flight
    /// finishes on its own.
    async fn close(&self) {
        self.closed.send_replace(true);
        let shutdown = async { self.writer.lock().await.shutdown().await };
        match timeout(CLOSE_TIMEOUT, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(address = %self.address, error = %e, "close failed"),
            Err(_) => debug!(address = %self.address, "close timed out"),
        }
    }
}

/// Owns at most one connection. All methods take `&self`; share it behind an `Arc`.
pub struct ConnectionSession {
    connector: Arc<dyn Connector>,
    scanner: Arc<dyn Scanner>,
    capabilities: Arc<dyn CapabilityCheck>,
    paired: PairedDevices,
    last_address: LastDeviceAddress,
    events: SessionEvents,
    config: SessionConfig,
    handle: Mutex<Option<Arc<ConnectionHandle>>>,
}

impl ConnectionSession {
    pub fn new(connector: Arc<dyn Connector>, capabilities: Arc<dyn CapabilityCheck>) -> Self {
        Self {
            connector,
            scanner: Arc::new(NoScanner),
            capabilities,
            paired: PairedDevices::new(),
            last_address: LastDeviceAddress::new(),
            events: SessionEvents::new(),
            config: SessionConfig::default(),
            handle: Mutex::new(None),
        }
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn Scanner>) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn with_paired_devices(mut self, paired: PairedDevices) -> Self {
        self.paired = paired;
        self
    }

    pub fn with_last_address(mut self, last: LastDeviceAddress) -> Self {
        self.last_address = last;
        self
    }

    pub fn with_events(mut self, events: SessionEvents) -> Self {
        self.events = events;
        self
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn events(&self) -> &SessionEvents {
        &self.events
    }

    pub fn paired_devices(&self) -> &PairedDevices {
        &self.paired
    }

    pub fn last_device_address(&self) -> &LastDeviceAddress {
        &self.last_address
    }

    pub fn state(&self) -> SessionState {
        self.events.state()
    }

    /// True while a handle is live. State only reads Connected with a handle stored.
    pub fn is_connected(&self) -> bool {
        self.events.state().is_connected()
    }

    pub fn is_granted(&self, capability: Capability) -> bool {
        self.capabilities.is_granted(capability)
    }

    pub async fn connected_address(&self) -> Option<TransportAddress> {
        self.handle.lock().await.as_ref().map(|h| h.address.clone())
    }

    /// Ask the scanner for a scan. Results arrive as discovery events.
    pub fn start_discovery(&self) -> Result<(), SessionError> {
        if !self.is_granted(Capability::Scan) {
            return Err(self.denied(Capability::Scan));
        }
        info!("starting discovery");
        self.scanner.start();
        Ok(())
    }

    /// Exact-name lookup in the paired set; first match wins.
    pub fn resolve_device_by_name(&self, name: &str) -> Option<DeviceRecord> {
        if !self.is_granted(Capability::Connect) {
            debug!(device = name, "connect permission not granted; skipping lookup");
            return None;
        }
        let found = self.paired.find_by_name(name);
        debug!(device = name, found = found.is_some(), "resolve device");
        found
    }

    /// Open the connection. Rejects with [`SessionError::AlreadyConnected`] while a handle is live;
    /// the live handle is not touched. No retry on failure.
    pub async fn connect(&self, address: &TransportAddress) -> Result<(), SessionError> {
        if !self.is_granted(Capability::Connect) {
            return Err(self.denied(Capability::Connect));
        }
        let mut slot = self.handle.lock().await;
        if let Some(live) = slot.as_ref() {
            warn!(address = %address, live = %live.address, "connect rejected: already connected");
            return Err(SessionError::AlreadyConnected(live.address.to_string()));
        }

        // Scanning slows connection setup.
        self.scanner.cancel();
        self.events.set_state(SessionState::Connecting);
        info!(address = %address, service = %self.config.service_id, "connecting");

        let attempt = self.connector.connect(address, self.config.service_id);
        let result = match timeout(self.config.connect_timeout, attempt).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(SessionError::Io(e)),
            Err(_) => Err(SessionError::Timeout),
        };

        match result {
            Ok(stream) => {
                *slot = Some(Arc::new(ConnectionHandle::new(address.clone(), stream)));
                self.last_address.set(address.clone());
                self.events.set_state(SessionState::Connected);
                self.events.notify(Notice::Connected(address.clone()));
                info!(address = %address, "connected");
                Ok(())
            }
            Err(e) => {
                warn!(address = %address, error = %e, "connect failed");
                self.events.set_state(SessionState::Failed(e.to_string()));
                self.events.notify(Notice::ConnectionFailed {
                    address: address.clone(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Write all of `bytes` and flush. A failure is returned but does not close the
    /// connection unless the failure limit is reached. A write blocked on a peer that
    /// stopped reading fails with `BrokenPipe` once `disconnect` runs.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), SessionError> {
        if !self.is_granted(Capability::Transfer) {
            return Err(self.denied(Capability::Transfer));
        }
        let handle = self.live_handle().await.ok_or(SessionError::NotConnected)?;
        match handle.write(bytes).await {
            Ok(()) => {
                handle.failures.store(0, Ordering::Release);
                debug!(len = bytes.len(), "sent");
                Ok(())
            }
            Err(e) => {
                warn!(address = %handle.address, error = %e, "send failed");
                self.record_failure(&handle).await;
                Err(SessionError::Io(e))
            }
        }
    }

    /// One bounded read. `None` without the transfer capability, when not connected, or on an
    /// I/O error. `Some(empty)` when the read timed out or hit end of stream.
    pub async fn receive_once(&self) -> Option<Vec<u8>> {
        if !self.is_granted(Capability::Transfer) {
            debug!("transfer permission not granted; skipping receive");
            return None;
        }
        let handle = self.live_handle().await?;
        let mut buf = vec![0u8; self.config.read_buffer_size];
        let read = {
            let mut r = handle.reader.lock().await;
            timeout(self.config.read_timeout, r.read(&mut buf)).await
        };
        match read {
            Err(_) => Some(Vec::new()),
            Ok(Ok(0)) => {
                debug!(address = %handle.address, "end of stream");
                self.record_failure(&handle).await;
                Some(Vec::new())
            }
            Ok(Ok(n)) => {
                handle.failures.store(0, Ordering::Release);
                buf.truncate(n);
                Some(buf)
            }
            Ok(Err(e)) => {
                debug!(address = %handle.address, error = %e, "receive failed");
                self.record_failure(&handle).await;
                None
            }
        }
    }

    /// Close the handle if there is one. Idempotent; close errors are only logged.
    pub async fn disconnect(&self) {
        let mut slot = self.handle.lock().await;
        if let Some(handle) = slot.take() {
            info!(address = %handle.address, "disconnecting");
            handle.close().await;
            self.events.set_state(SessionState::Disconnected);
        }
    }

    async fn live_handle(&self) -> Option<Arc<ConnectionHandle>> {
        self.handle.lock().await.clone()
    }

    async fn record_failure(&self, failed: &Arc<ConnectionHandle>) {
        let limit = self.config.io_failure_limit;
        let count = failed.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if limit == 0 || count < limit {
            return;
        }
        let mut slot = self.handle.lock().await;
        // The failing handle may already have been replaced by a fresh connect.
        if !slot.as_ref().is_some_and(|h| Arc::ptr_eq(h, failed)) {
            return;
        }
        if let Some(handle) = slot.take() {
            warn!(address = %handle.address, failures = count, "i/o failure limit reached; dropping connection");
            handle.close().await;
            let reason = String::from("i/o failure limit reached");
            self.events.set_state(SessionState::Failed(reason.clone()));
            self.events.notify(Notice::ConnectionLost(reason));
        }
    }

    fn denied(&self, capability: Capability) -> SessionError {
        warn!(%capability, "permission denied");
        self.events.notify(Notice::PermissionDenied(capability));
        SessionError::PermissionDenied(capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{
        session_with, spawn_ping_peer, GatedConnector, MemoryConnector, PendingConnector,
        RecordingScanner, ToggleCaps,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const TRACKER_A: &str = "00:11:22:33:44:55";

    #[tokio::test]
    async fn ping_pong_then_disconnect() {
        let connector = MemoryConnector::new();
        let peer = connector.add_peer(TRACKER_A);
        spawn_ping_peer(peer);
        let session = session_with(connector.clone(), ToggleCaps::all())
            .with_paired_devices(PairedDevices::from_records([DeviceRecord::new(
                "Tracker-A", TRACKER_A,
            )]));

        let record = session.resolve_device_by_name("Tracker-A").unwrap();
        session.connect(&record.address).await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(connector.last_service_id(), Some(crate::SERVICE_ID));

        session.send(b"PING").await.unwrap();
        assert_eq!(session.receive_once().await.unwrap(), b"PONG");

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.receive_once().await.is_none());
        assert!(matches!(
            session.send(b"PING").await,
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn second_connect_rejected_and_original_kept() {
        let connector = MemoryConnector::new();
        let mut first = connector.add_peer(TRACKER_A);
        let _second = connector.add_peer(TRACKER_A);
        let session = session_with(connector.clone(), ToggleCaps::all());
        let addr = TransportAddress::from(TRACKER_A);

        session.connect(&addr).await.unwrap();
        for _ in 0..3 {
            assert!(matches!(
                session.connect(&addr).await,
                Err(SessionError::AlreadyConnected(_))
            ));
        }
        assert_eq!(connector.attempts(), 1);
        assert!(session.is_connected());

        session.send(b"still here").await.unwrap();
        let mut buf = [0u8; 32];
        let n = first.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"still here");
    }

    #[tokio::test]
    async fn concurrent_connects_are_serialized() {
        let connector = GatedConnector::new();
        let session = session_with(connector.clone(), ToggleCaps::all());
        let addr = TransportAddress::from(TRACKER_A);
        let release = async {
            while connector.attempts() == 0 {
                tokio::task::yield_now().await;
            }
            tokio::task::yield_now().await;
            connector.release();
        };

        let (a, b, ()) = tokio::join!(session.connect(&addr), session.connect(&addr), release);
        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(SessionError::AlreadyConnected(_))))
                .count(),
            1
        );
        assert_eq!(connector.attempts(), 1);
        assert!(session.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_fails_a_blocked_send() {
        let connector = MemoryConnector::new();
        // Never read, so the pipe fills and the write stalls.
        let _peer = connector.add_peer(TRACKER_A);
        let session = Arc::new(session_with(connector, ToggleCaps::all()));
        session.connect(&TRACKER_A.into()).await.unwrap();

        let sender = session.clone();
        let send = tokio::spawn(async move {
            let data = vec![0u8; 64 * 1024];
            sender.send(&data).await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!send.is_finished());

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        let result = tokio::time::timeout(Duration::from_secs(5), send)
            .await
            .expect("send still blocked after disconnect")
            .unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe
        ));
    }

    #[tokio::test]
    async fn stale_handle_failures_do_not_count_against_reconnect() {
        let connector = MemoryConnector::new();
        let _first = connector.add_peer(TRACKER_A);
        let _second = connector.add_peer(TRACKER_A);
        let session = session_with(connector, ToggleCaps::all());
        let addr = TransportAddress::from(TRACKER_A);

        session.connect(&addr).await.unwrap();
        let stale = session.live_handle().await.unwrap();
        session.disconnect().await;
        session.connect(&addr).await.unwrap();

        for _ in 0..5 {
            session.record_failure(&stale).await;
        }
        assert!(session.is_connected());
        let live = session.live_handle().await.unwrap();
        assert_eq!(live.failures.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn transfer_denied_regardless_of_state() {
        let connector = MemoryConnector::new();
        let _peer = connector.add_peer(TRACKER_A);
        let caps = ToggleCaps::all();
        caps.set(Capability::Transfer, false);
        let session = session_with(connector, caps.clone());

        assert!(matches!(
            session.send(b"x").await,
            Err(SessionError::PermissionDenied(Capability::Transfer))
        ));
        assert!(session.receive_once().await.is_none());

        session.connect(&TRACKER_A.into()).await.unwrap();
        assert!(matches!(
            session.send(b"x").await,
            Err(SessionError::PermissionDenied(Capability::Transfer))
        ));
        assert!(session.receive_once().await.is_none());
    }

    #[tokio::test]
    async fn capability_checked_on_every_call() {
        let connector = MemoryConnector::new();
        let _peer = connector.add_peer(TRACKER_A);
        let caps = ToggleCaps::all();
        let session = session_with(connector, caps.clone());
        session.connect(&TRACKER_A.into()).await.unwrap();

        session.send(b"ok").await.unwrap();
        caps.set(Capability::Transfer, false);
        assert!(session.send(b"revoked").await.is_err());
        caps.set(Capability::Transfer, true);
        session.send(b"restored").await.unwrap();
    }

    #[tokio::test]
    async fn connect_denied_without_attempt() {
        let connector = MemoryConnector::new();
        let caps = ToggleCaps::all();
        caps.set(Capability::Connect, false);
        let session = session_with(connector.clone(), caps);
        let mut notices = session.events().subscribe_notices();

        let err = session.connect(&TRACKER_A.into()).await.unwrap_err();
        assert!(err.is_permission_denied());
        assert_eq!(connector.attempts(), 0);
        assert_eq!(
            notices.recv().await.unwrap(),
            Notice::PermissionDenied(Capability::Connect)
        );
        assert!(session.resolve_device_by_name("Tracker-A").is_none());
    }

    #[tokio::test]
    async fn connect_cancels_discovery() {
        let connector = MemoryConnector::new();
        let _peer = connector.add_peer(TRACKER_A);
        let scanner = RecordingScanner::new();
        let session = ConnectionSession::new(connector, ToggleCaps::all())
            .with_scanner(scanner.clone());

        session.start_discovery().unwrap();
        session.connect(&TRACKER_A.into()).await.unwrap();
        assert_eq!(scanner.starts(), 1);
        assert_eq!(scanner.cancels(), 1);
    }

    #[tokio::test]
    async fn discovery_denied_emits_notice() {
        let caps = ToggleCaps::all();
        caps.set(Capability::Scan, false);
        let scanner = RecordingScanner::new();
        let session = ConnectionSession::new(MemoryConnector::new(), caps)
            .with_scanner(scanner.clone());
        let mut notices = session.events().subscribe_notices();

        assert!(session.start_discovery().is_err());
        assert_eq!(scanner.starts(), 0);
        assert_eq!(
            notices.recv().await.unwrap(),
            Notice::PermissionDenied(Capability::Scan)
        );
    }

    #[tokio::test]
    async fn failed_connect_is_not_retried() {
        let connector = MemoryConnector::new();
        let session = session_with(connector.clone(), ToggleCaps::all());
        let mut notices = session.events().subscribe_notices();

        let err = session.connect(&TRACKER_A.into()).await.unwrap_err();
        assert!(matches!(err, SessionError::Io(_)));
        assert!(matches!(session.state(), SessionState::Failed(_)));
        assert!(matches!(
            notices.recv().await.unwrap(),
            Notice::ConnectionFailed { .. }
        ));
        assert_eq!(connector.attempts(), 1);
        assert!(session.last_device_address().get().is_none());

        let _peer = connector.add_peer(TRACKER_A);
        session.connect(&TRACKER_A.into()).await.unwrap();
        assert_eq!(connector.attempts(), 2);
        assert_eq!(
            session.last_device_address().get(),
            Some(TransportAddress::from(TRACKER_A))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out() {
        let session = session_with(PendingConnector::new(), ToggleCaps::all());
        let err = session.connect(&TRACKER_A.into()).await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout));
        assert!(matches!(session.state(), SessionState::Failed(_)));
        assert!(session.connected_address().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_read_times_out_with_empty_payload() {
        let connector = MemoryConnector::new();
        let _peer = connector.add_peer(TRACKER_A);
        let session = session_with(connector, ToggleCaps::all());
        session.connect(&TRACKER_A.into()).await.unwrap();

        for _ in 0..5 {
            assert_eq!(session.receive_once().await, Some(Vec::new()));
        }
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn read_bounded_by_buffer_size() {
        let connector = MemoryConnector::new();
        let mut peer = connector.add_peer(TRACKER_A);
        let session = session_with(connector, ToggleCaps::all())
            .with_config(SessionConfig::default().with_read_buffer_size(4));
        session.connect(&TRACKER_A.into()).await.unwrap();

        peer.write_all(b"abcdefgh").await.unwrap();
        assert_eq!(session.receive_once().await.unwrap(), b"abcd");
        assert_eq!(session.receive_once().await.unwrap(), b"efgh");
    }

    #[tokio::test]
    async fn peer_close_reaches_failure_limit() {
        let connector = MemoryConnector::new();
        let peer = connector.add_peer(TRACKER_A);
        let session = session_with(connector, ToggleCaps::all());
        let mut notices = session.events().subscribe_notices();
        session.connect(&TRACKER_A.into()).await.unwrap();
        drop(peer);

        for _ in 0..3 {
            assert_eq!(session.receive_once().await, Some(Vec::new()));
        }
        assert_eq!(
            session.state(),
            SessionState::Failed("i/o failure limit reached".into())
        );
        assert!(session.receive_once().await.is_none());
        assert!(matches!(notices.recv().await.unwrap(), Notice::Connected(_)));
        assert!(matches!(
            notices.recv().await.unwrap(),
            Notice::ConnectionLost(_)
        ));
    }

    #[tokio::test]
    async fn single_send_failure_keeps_connection() {
        let connector = MemoryConnector::new();
        let peer = connector.add_peer(TRACKER_A);
        let session = session_with(connector, ToggleCaps::all());
        session.connect(&TRACKER_A.into()).await.unwrap();
        drop(peer);

        assert!(matches!(session.send(b"x").await, Err(SessionError::Io(_))));
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn disabled_failure_limit_never_drops() {
        let connector = MemoryConnector::new();
        let peer = connector.add_peer(TRACKER_A);
        let session = session_with(connector, ToggleCaps::all())
            .with_config(SessionConfig::default().with_io_failure_limit(0));
        session.connect(&TRACKER_A.into()).await.unwrap();
        drop(peer);

        for _ in 0..10 {
            let _ = session.send(b"x").await;
        }
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let connector = MemoryConnector::new();
        let mut peer = connector.add_peer(TRACKER_A);
        let session = session_with(connector, ToggleCaps::all());

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Idle);

        session.connect(&TRACKER_A.into()).await.unwrap();
        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);

        let mut buf = [0u8; 4];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    }
}
