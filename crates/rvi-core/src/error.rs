//! Error taxonomy shared by the registries, the protocol engine and the node.
//!
//! Registry-level errors (`DuplicateService`, `NotFound`, `Unauthorized`) are
//! recovered locally and turned into replies or return codes. Transport,
//! protocol and timeout errors close the affected connection only.

use crate::id::ConnectionId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RviError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("connection {0} already exists")]
    DuplicateConnection(ConnectionId),
    #[error("service {0} is already registered")]
    DuplicateService(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("transport failure: {0}")]
    TransportFailure(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("timed out: {0}")]
    Timeout(String),
}

impl RviError {
    /// True when the error must close the connection it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RviError::TransportFailure(_) | RviError::ProtocolViolation(_) | RviError::Timeout(_)
        )
    }

    /// Stable reason string carried in `invoke-error` replies.
    pub fn reason(&self) -> &'static str {
        match self {
            RviError::InvalidArgument(_) => "invalid-argument",
            RviError::DuplicateConnection(_) => "duplicate-connection",
            RviError::DuplicateService(_) => "duplicate-service",
            RviError::NotFound(_) => "not-found",
            RviError::Unauthorized(_) => "unauthorized",
            RviError::TransportFailure(_) => "transport-failure",
            RviError::ProtocolViolation(_) => "protocol-violation",
            RviError::Timeout(_) => "timeout",
        }
    }
}

impl From<std::io::Error> for RviError {
    fn from(e: std::io::Error) -> Self {
        RviError::TransportFailure(e.to_string())
    }
}
