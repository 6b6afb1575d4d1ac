//! pairlink core: one connection to one peer, a polling receive loop, and observable session state.
//! Host-driven: no sockets here; hosts inject the transport, scanner and capability checks.

pub mod capability;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod link;
pub mod protocol;
pub mod receive;
pub mod session;
pub mod timed;
pub mod transport;
pub mod wire;

pub use capability::{AllowAll, Capability, CapabilityCheck};
pub use config::{SessionConfig, SERVICE_ID};
pub use device::{DeviceRecord, LastDeviceAddress, PairedDevices, TransportAddress};
pub use error::SessionError;
pub use events::{Notice, SessionEvents, SessionState};
pub use protocol::{Message, PROTOCOL_VERSION};
pub use transport::{AsyncStream, BoxedStream, Connector, DiscoveryEvent, Scanner};
pub use wire::{decode_datagram, encode_datagram, WireError, MAX_DATAGRAM_LEN};
pub use link::DeviceLink;
pub use receive::ReceiveLoop;
pub use session::ConnectionSession;
pub use timed::{run_timed_fetch, FetchSchedule};

#[cfg(test)]
pub(crate) mod testkit;
