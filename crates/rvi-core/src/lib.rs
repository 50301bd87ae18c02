//! rvi-core: shared types, wire format, name patterns and credentials.
//! All other RVI crates depend on this one.

pub mod config;
pub mod credential;
pub mod error;
pub mod id;
pub mod pattern;
pub mod wire;

pub use credential::{CredentialVerifier, Grant};
pub use error::RviError;
pub use id::{ConnectionId, Registrant};
pub use pattern::{NamePattern, PatternSet};
pub use wire::WireMessage;
