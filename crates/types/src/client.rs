use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a connected client process.
///
/// A client is the pair of the transport endpoint it talks through and the
/// process id behind it. Two identities are equal only when both match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientIdentity {
    /// Connection endpoint identifier assigned by the transport.
    pub endpoint: u64,
    /// Process id of the caller.
    pub pid: u32,
}

impl ClientIdentity {
    pub const fn new(endpoint: u64, pid: u32) -> Self {
        Self { endpoint, pid }
    }

    /// Same endpoint, different process (e.g. a spawned helper).
    pub const fn with_pid(self, pid: u32) -> Self {
        Self {
            endpoint: self.endpoint,
            pid,
        }
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.endpoint, self.pid)
    }
}
