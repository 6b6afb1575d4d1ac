//! Session tuning knobs and the fixed service identifier.

use std::time::Duration;

use uuid::Uuid;

/// Service identifier both peers agree on out of band (serial-port-style profile UUID).
pub const SERVICE_ID: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Consecutive failed transfers before the session gives up on the connection.
pub const DEFAULT_IO_FAILURE_LIMIT: u32 = 3;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub service_id: Uuid,
    /// Sleep between receive polls, whether or not data arrived.
    pub poll_interval: Duration,
    /// Upper bound on bytes returned by one read.
    pub read_buffer_size: usize,
    /// A read that sees no data within this window yields an empty payload.
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
    /// 0 disables the limit.
    pub io_failure_limit: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_id: SERVICE_ID,
            poll_interval: DEFAULT_POLL_INTERVAL,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            read_timeout: DEFAULT_READ_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_failure_limit: DEFAULT_IO_FAILURE_LIMIT,
        }
    }
}

impl SessionConfig {
    pub fn with_service_id(mut self, id: Uuid) -> Self {
        self.service_id = id;
        self
    }

    pub fn with_poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = d;
        self
    }

    /// Clamped to at least one byte.
    pub fn with_read_buffer_size(mut self, n: usize) -> Self {
        self.read_buffer_size = n.max(1);
        self
    }

    pub fn with_read_timeout(mut self, d: Duration) -> Self {
        self.read_timeout = d;
        self
    }

    pub fn with_connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = d;
        self
    }

    pub fn with_io_failure_limit(mut self, n: u32) -> Self {
        self.io_failure_limit = n;
        self
    }
}
