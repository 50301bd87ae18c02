//! rvi-services: in-memory node state and the protocol engine.
//!
//! `Registry` pairs the connection and service registries so every
//! compound mutation happens under one borrow. `ProtocolEngine` drives the
//! authenticate → announce → invoke state machine against it.

pub mod connection;
pub mod protocol;
pub mod registry;
pub mod service;

pub use connection::{
    Connection, ConnectionRegistry, ConnectionSnapshot, ConnectionState, Inbound, SessionHandle,
};
pub use protocol::{LocalCall, Outcome, ProtocolEngine, Round};
pub use registry::{Dispatch, InvokeOutcome, Registry};
pub use service::{Service, ServiceCallback, ServiceRegistry};
