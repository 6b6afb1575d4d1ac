//! LAN discovery: UDP multicast beacons. The scanner turns beacons into discovery events;
//! the advertiser announces this host when serving.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pairlink_core::{
    decode_datagram, encode_datagram, DeviceRecord, DiscoveryEvent, Message, Scanner,
    MAX_DATAGRAM_LEN, PROTOCOL_VERSION,
};
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(2);

/// Listens for beacons for a bounded duration per scan, then reports `Finished`.
pub struct UdpScanner {
    runtime: Handle,
    discovery_port: u16,
    service_id: Uuid,
    scan_duration: Duration,
    events: UnboundedSender<DiscoveryEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpScanner {
    /// Must be called from within a tokio runtime; scans are spawned onto it.
    pub fn new(
        discovery_port: u16,
        service_id: Uuid,
        scan_duration: Duration,
        events: UnboundedSender<DiscoveryEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            runtime: Handle::current(),
            discovery_port,
            service_id,
            scan_duration,
            events,
            task: Mutex::new(None),
        })
    }
}

impl Scanner for UdpScanner {
    fn start(&self) {
        self.cancel();
        let port = self.discovery_port;
        let service_id = self.service_id;
        let duration = self.scan_duration;
        let events = self.events.clone();
        let task = self.runtime.spawn(async move {
            if let Err(e) = scan(port, service_id, duration, &events).await {
                warn!(error = %e, "discovery scan failed");
            }
            let _ = events.send(DiscoveryEvent::Finished);
        });
        if let Ok(mut slot) = self.task.lock() {
            *slot = Some(task);
        }
    }

    fn cancel(&self) {
        let running = self.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = running {
            if !task.is_finished() {
                debug!("cancelling discovery scan");
            }
            task.abort();
        }
    }
}

async fn scan(
    discovery_port: u16,
    service_id: Uuid,
    duration: Duration,
    events: &UnboundedSender<DiscoveryEvent>,
) -> std::io::Result<()> {
    let socket = make_multicast_socket(discovery_port)?;
    info!(port = discovery_port, "scanning for devices");
    let deadline = tokio::time::Instant::now() + duration;
    // Spare byte: an oversized datagram must fail decode, not arrive truncated.
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN + 1];
    loop {
        let (n, from) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(r) => r?,
            Err(_) => return Ok(()),
        };
        if let Some(record) = parse_beacon(&buf[..n], from, service_id) {
            if events.send(DiscoveryEvent::DeviceFound(record)).is_err() {
                return Ok(());
            }
        }
    }
}

/// Decode a beacon datagram into a device record. Foreign versions and services are ignored.
pub fn parse_beacon(bytes: &[u8], from: SocketAddr, service_id: Uuid) -> Option<DeviceRecord> {
    let msg = decode_datagram(bytes).ok()?;
    let Message::Beacon {
        protocol_version,
        device_name,
        service_id: offered,
        listen_port,
    } = msg;
    if protocol_version != PROTOCOL_VERSION || offered != service_id {
        return None;
    }
    let addr = SocketAddr::new(from.ip(), listen_port);
    Some(DeviceRecord::new(device_name, addr.to_string().as_str()))
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// Announce `device_name` until the task is dropped.
pub async fn run_advertiser(
    device_name: String,
    service_id: Uuid,
    discovery_port: u16,
    transport_port: u16,
) -> std::io::Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_multicast_ttl_v4(1)?;
    let datagram = encode_datagram(&Message::beacon(device_name.as_str(), service_id, transport_port))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let dest = SocketAddrV4::new(MULTICAST_GROUP, discovery_port);
    info!(device = %device_name, port = discovery_port, "advertising");
    loop {
        if let Err(e) = socket.send_to(&datagram, dest).await {
            debug!(error = %e, "beacon send failed");
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}
