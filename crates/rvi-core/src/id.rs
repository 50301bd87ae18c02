//! Identifiers shared by the registries and the wire layer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier of one live peer session.
///
/// Allocated by the node when the transport handshake completes and never
/// reused for the lifetime of the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Who registered a service: the local process or a remote connection.
///
/// `Local` orders before every remote registrant, so the registrant index
/// lists local services first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Registrant {
    Local,
    Remote(ConnectionId),
}

impl Registrant {
    pub fn is_local(&self) -> bool {
        matches!(self, Registrant::Local)
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            Registrant::Local => None,
            Registrant::Remote(id) => Some(*id),
        }
    }
}

impl From<ConnectionId> for Registrant {
    fn from(id: ConnectionId) -> Self {
        Registrant::Remote(id)
    }
}

impl fmt::Display for Registrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Registrant::Local => f.write_str("local"),
            Registrant::Remote(id) => id.fmt(f),
        }
    }
}
