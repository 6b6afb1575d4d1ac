//! Controller facade for UI collaborators: feeds discovery into the name list and turns a
//! selected name into a connected session with a running receive loop.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::capability::Capability;
use crate::device::TransportAddress;
use crate::error::SessionError;
use crate::events::SessionEvents;
use crate::receive::ReceiveLoop;
use crate::session::ConnectionSession;
use crate::transport::DiscoveryEvent;

pub struct DeviceLink {
    session: Arc<ConnectionSession>,
    receiver: Mutex<Option<ReceiveLoop>>,
    tap: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl DeviceLink {
    pub fn new(session: Arc<ConnectionSession>) -> Self {
        Self {
            session,
            receiver: Mutex::new(None),
            tap: None,
        }
    }

    /// Also forward every received chunk, in order, to `tx`. The payload stream only keeps
    /// the latest value; consumers that need each chunk read this channel instead.
    pub fn with_payload_channel(mut self, tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        self.tap = Some(tx);
        self
    }

    pub fn session(&self) -> &Arc<ConnectionSession> {
        &self.session
    }

    pub fn events(&self) -> &SessionEvents {
        self.session.events()
    }

    pub fn start_discovery(&self) -> Result<(), SessionError> {
        self.session.start_discovery()
    }

    /// Record a found device in the paired cache and the presented name list.
    /// Dropped when the scan capability is not granted.
    pub fn on_discovery_event(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::DeviceFound(record) => {
                if !self.session.is_granted(Capability::Scan) {
                    debug!("scan permission not granted; ignoring discovered device");
                    return;
                }
                let label = record.label().to_owned();
                let address = record.address.clone();
                self.session.paired_devices().insert(record);
                if self.events().add_device_name(&label) {
                    info!(device = %label, address = %address, "device discovered");
                }
            }
            DiscoveryEvent::Finished => {
                info!(
                    devices = self.session.paired_devices().len(),
                    "discovery finished"
                );
            }
        }
    }

    /// Resolve `name`, connect, and start publishing received payloads to the event sink.
    pub async fn connect_to_device(&self, name: &str) -> Result<(), SessionError> {
        let record = self
            .session
            .resolve_device_by_name(name)
            .ok_or_else(|| SessionError::NotFound(name.to_owned()))?;
        self.connect_address(&record.address).await
    }

    pub async fn connect_address(&self, address: &TransportAddress) -> Result<(), SessionError> {
        let mut receiver = self.receiver.lock().await;
        if let Some(old) = receiver.take() {
            if self.session.is_connected() {
                // Keep the live loop; connect below reports AlreadyConnected.
                *receiver = Some(old);
            } else {
                old.stop();
                old.join().await;
            }
        }
        self.session.connect(address).await?;
        let events = self.session.events().clone();
        let tap = self.tap.clone();
        let lp = ReceiveLoop::start(self.session.clone(), move |data| {
            events.publish_payload(&data);
            if let Some(tx) = &tap {
                let _ = tx.send(data);
            }
        })?;
        *receiver = Some(lp);
        Ok(())
    }

    pub async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        self.session.send(text.as_bytes()).await
    }

    /// Stop the receive loop, close the connection, then wait for the loop to end.
    pub async fn disconnect(&self) {
        let lp = self.receiver.lock().await.take();
        if let Some(lp) = &lp {
            lp.stop();
        }
        self.session.disconnect().await;
        if let Some(lp) = lp {
            lp.join().await;
        }
    }

    pub async fn is_receiving(&self) -> bool {
        self.receiver
            .lock()
            .await
            .as_ref()
            .is_some_and(ReceiveLoop::is_running)
    }
}
