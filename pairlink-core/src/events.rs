//! Observable session boundary: last-value-wins state streams plus transient notices.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::capability::Capability;
use crate::device::TransportAddress;

const NOTICE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Failed(String),
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::Connecting => f.write_str("connecting"),
            SessionState::Connected => f.write_str("connected"),
            SessionState::Disconnected => f.write_str("disconnected"),
            SessionState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// One-shot user-facing notification (toast-style). Receive failures never produce one.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Notice {
    PermissionDenied(Capability),
    ConnectionFailed {
        address: TransportAddress,
        reason: String,
    },
    Connected(TransportAddress),
    ConnectionLost(String),
}

/// Sink for session events. Cloning shares the same channels.
#[derive(Debug, Clone)]
pub struct SessionEvents {
    devices: Arc<watch::Sender<Vec<String>>>,
    payload: Arc<watch::Sender<Option<String>>>,
    state: Arc<watch::Sender<SessionState>>,
    notices: broadcast::Sender<Notice>,
}

impl Default for SessionEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionEvents {
    pub fn new() -> Self {
        let (devices, _) = watch::channel(Vec::new());
        let (payload, _) = watch::channel(None);
        let (state, _) = watch::channel(SessionState::Idle);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            devices: Arc::new(devices),
            payload: Arc::new(payload),
            state: Arc::new(state),
            notices,
        }
    }

    /// Append `name` to the device list unless already present. Returns true if appended.
    pub fn add_device_name(&self, name: &str) -> bool {
        self.devices.send_if_modified(|names| {
            if names.iter().any(|n| n == name) {
                false
            } else {
                names.push(name.to_owned());
                true
            }
        })
    }

    pub fn device_names(&self) -> Vec<String> {
        self.devices.borrow().clone()
    }

    /// Overwrites the previous payload. Bytes are decoded lossily as UTF-8.
    pub fn publish_payload(&self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes).into_owned();
        self.payload.send_replace(Some(text));
    }

    pub fn latest_payload(&self) -> Option<String> {
        self.payload.borrow().clone()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                tracing::debug!(from = %current, to = %state, "session state");
                *current = state;
                true
            }
        });
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub(crate) fn notify(&self, notice: Notice) {
        // No subscribers is fine; notices are transient.
        let _ = self.notices.send(notice);
    }

    pub fn subscribe_devices(&self) -> watch::Receiver<Vec<String>> {
        self.devices.subscribe()
    }

    pub fn subscribe_payload(&self) -> watch::Receiver<Option<String>> {
        self.payload.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }
}
