//! Capability (permission) checks. Checked before every privileged call, never cached:
//! platforms may revoke a grant between calls.

use std::fmt;

/// Privileged operations.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Capability {
    /// Start a device scan.
    Scan,
    /// Open a connection (and resolve paired devices).
    Connect,
    /// Send or receive bytes on an open connection.
    Transfer,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::Scan => "scan",
            Capability::Connect => "connect",
            Capability::Transfer => "transfer",
        };
        f.write_str(s)
    }
}

pub trait CapabilityCheck: Send + Sync {
    fn is_granted(&self, capability: Capability) -> bool;
}

/// Grants everything. For hosts without a permission model (desktop daemons).
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl CapabilityCheck for AllowAll {
    fn is_granted(&self, _capability: Capability) -> bool {
        true
    }
}
