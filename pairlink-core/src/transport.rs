//! Host-supplied collaborators: the stream connector and the discovery scanner.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::device::{DeviceRecord, TransportAddress};

/// Bidirectional byte stream returned by a connector.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens a stream to `addr` on the logical channel selected by `service_id`.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: &TransportAddress, service_id: Uuid)
        -> std::io::Result<BoxedStream>;
}

/// Device scanner. Results are delivered out of band as [`DiscoveryEvent`]s.
pub trait Scanner: Send + Sync {
    fn start(&self);
    /// Stop an in-flight scan. No-op when idle.
    fn cancel(&self);
}

/// Scanner output. Unordered; the same device may be reported more than once.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DiscoveryEvent {
    DeviceFound(DeviceRecord),
    Finished,
}

/// Scanner for hosts that only connect to already-paired devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoScanner;

impl Scanner for NoScanner {
    fn start(&self) {}
    fn cancel(&self) {}
}
