//! Protocol engine: the authenticate → service-announce → invoke state
//! machine, run one message at a time against the shared `Registry`.
//!
//! Per connection:
//!
//! ```text
//!   HANDSHAKING ──authenticate──▶ AUTHENTICATED ──announce sent──▶ OPERATIONAL
//!        │                                                              │
//!        └──────────── transport error / violation / timeout ───────────┴──▶ CLOSED
//! ```
//!
//! Registry-level failures (unknown or unauthorized services) become
//! `invoke-error` replies or dropped announce entries. Anything fatal is
//! returned as an error; the caller disconnects the connection.

use std::sync::Arc;

use serde_json::Value;

use rvi_core::wire::{version_supported, Availability, ServiceStatus, PROTOCOL_VERSION};
use rvi_core::{ConnectionId, CredentialVerifier, Grant, Registrant, RviError, WireMessage};

use crate::connection::{ConnectionState, Inbound};
use crate::registry::{Dispatch, Registry};
use crate::service::ServiceCallback;

/// A local callback an inbound invoke resolved to, ready to run once the
/// registry lock is released.
pub struct LocalCall {
    pub invoker: ConnectionId,
    pub service: String,
    callback: ServiceCallback,
    parameters: Value,
}

impl LocalCall {
    pub fn run(self) -> Value {
        let result = (self.callback)(&self.service, &self.parameters);
        tracing::debug!(
            connection = %self.invoker,
            service = %self.service,
            "local service invoked"
        );
        result
    }
}

impl std::fmt::Debug for LocalCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCall")
            .field("invoker", &self.invoker)
            .field("service", &self.service)
            .finish()
    }
}

/// What handling one message left for the caller to do.
#[derive(Debug)]
pub enum Outcome {
    Done,
    LocalCall(LocalCall),
}

/// Result of draining one connection's inbox.
#[derive(Debug, Default)]
pub struct Round {
    pub calls: Vec<LocalCall>,
    /// Set when the connection must be closed; messages after the failing
    /// one were discarded.
    pub fatal: Option<RviError>,
}

pub struct ProtocolEngine {
    verifier: Arc<dyn CredentialVerifier>,
    credentials: Vec<String>,
}

impl ProtocolEngine {
    /// `credentials` are the tokens this node presents to every peer.
    pub fn new(verifier: Arc<dyn CredentialVerifier>, credentials: Vec<String>) -> Self {
        Self {
            verifier,
            credentials,
        }
    }

    pub fn credentials(&self) -> &[String] {
        &self.credentials
    }

    /// The transport handshake for `id` completed: present our credentials.
    pub fn on_transport_ready(&self, reg: &mut Registry, id: ConnectionId) -> Result<(), RviError> {
        let conn = reg.connection_mut(id)?;
        conn.set_state(ConnectionState::Handshaking);
        conn.send(WireMessage::authenticate(self.credentials.clone()))?;
        tracing::debug!(connection = %id, credentials = self.credentials.len(), "authenticate sent");
        Ok(())
    }

    /// Drain and handle everything queued for `id`.
    pub fn process(&self, reg: &mut Registry, id: ConnectionId) -> Round {
        let mut round = Round::default();
        let inbox = match reg.drain_inbound(id) {
            Ok(inbox) => inbox,
            Err(e) => {
                tracing::debug!(connection = %id, error = %e, "nothing to process");
                return round;
            }
        };
        for item in inbox {
            match self.handle_inbound(reg, id, item) {
                Ok(Outcome::Done) => {}
                Ok(Outcome::LocalCall(call)) => round.calls.push(call),
                Err(e) => {
                    round.fatal = Some(e);
                    break;
                }
            }
        }
        round
    }

    pub fn handle_inbound(
        &self,
        reg: &mut Registry,
        id: ConnectionId,
        item: Inbound,
    ) -> Result<Outcome, RviError> {
        match item {
            Inbound::Message(msg) => self.handle_message(reg, id, msg),
            Inbound::Closed(e) => Err(e),
        }
    }

    /// Handle one message from `id`. An error means the connection must close.
    pub fn handle_message(
        &self,
        reg: &mut Registry,
        id: ConnectionId,
        msg: WireMessage,
    ) -> Result<Outcome, RviError> {
        let conn = reg.connection_mut(id)?;
        if conn.state() == ConnectionState::Closed {
            return Ok(Outcome::Done);
        }
        conn.touch();
        tracing::trace!(connection = %id, command = msg.command(), "message received");

        match msg {
            WireMessage::Authenticate {
                protocol_version,
                credentials,
            } => {
                self.authenticate(reg, id, &protocol_version, &credentials)?;
                Ok(Outcome::Done)
            }
            WireMessage::ServiceAnnounce { services } => {
                self.service_announce(reg, id, services);
                Ok(Outcome::Done)
            }
            WireMessage::Invoke {
                service,
                parameters,
            } => self.invoke(reg, id, service, parameters),
            WireMessage::InvokeError { service, reason } => {
                tracing::warn!(connection = %id, service = %service, reason = %reason, "remote invoke failed");
                Ok(Outcome::Done)
            }
            WireMessage::Ping => {
                reg.connection_mut(id)?.send(WireMessage::Pong)?;
                Ok(Outcome::Done)
            }
            WireMessage::Pong => Ok(Outcome::Done),
        }
    }

    // ── Handlers ──────────────────────────────────────────────────────────

    fn authenticate(
        &self,
        reg: &mut Registry,
        id: ConnectionId,
        protocol_version: &str,
        credentials: &[String],
    ) -> Result<(), RviError> {
        if !version_supported(protocol_version) {
            return Err(RviError::ProtocolViolation(format!(
                "unsupported protocol version {protocol_version} (speaking {PROTOCOL_VERSION})"
            )));
        }

        // All or nothing: one bad credential rejects the session.
        let mut grant = Grant::default();
        for token in credentials {
            match self.verifier.verify(token) {
                Ok(g) => grant.merge(&g),
                Err(e) => {
                    tracing::warn!(connection = %id, error = %e, "credential rejected");
                    return Err(match e {
                        RviError::ProtocolViolation(_) => e,
                        other => RviError::ProtocolViolation(other.to_string()),
                    });
                }
            }
        }
        reg.grant(id, &grant)?;

        let conn = reg.connection_mut(id)?;
        let first = conn.state() == ConnectionState::Handshaking;
        if first {
            conn.set_state(ConnectionState::Authenticated);
        }
        tracing::info!(
            connection = %id,
            credentials = credentials.len(),
            register = grant.register.len(),
            invoke = grant.invoke.len(),
            first,
            "peer authenticated"
        );

        let services = reg.visible_to(id);
        let count = services.len();
        let conn = reg.connection_mut(id)?;
        conn.send(WireMessage::ServiceAnnounce { services })?;
        conn.set_state(ConnectionState::Operational);
        tracing::debug!(connection = %id, services = count, "service announce sent");
        Ok(())
    }

    fn service_announce(&self, reg: &mut Registry, id: ConnectionId, services: Vec<ServiceStatus>) {
        let Ok(conn) = reg.connection_mut(id) else {
            return;
        };
        if conn.state() == ConnectionState::Handshaking {
            tracing::warn!(
                connection = %id,
                services = services.len(),
                "announce before authenticate dropped"
            );
            return;
        }
        conn.mark_announce_received();

        for entry in services {
            let name = entry.name;
            let result = match entry.status {
                Availability::Available => reg.register_remote(id, &name).map(|_| ()),
                Availability::Unavailable => reg.withdraw_remote(id, &name).map(|_| ()),
            };
            if let Err(e) = result {
                tracing::warn!(
                    connection = %id,
                    service = %name,
                    error = %e,
                    "announced service rejected"
                );
            }
        }
    }

    fn invoke(
        &self,
        reg: &mut Registry,
        id: ConnectionId,
        service: String,
        parameters: Value,
    ) -> Result<Outcome, RviError> {
        let operational = reg
            .find_connection(id)
            .is_some_and(|c| c.state() == ConnectionState::Operational);
        let dispatch = if operational {
            reg.prepare_invoke(&service, Registrant::Remote(id), parameters)
        } else {
            Err(RviError::Unauthorized(format!(
                "{id} invoked {service} before authenticating"
            )))
        };

        match dispatch {
            Ok(Dispatch::Local {
                service,
                callback,
                parameters,
            }) => Ok(Outcome::LocalCall(LocalCall {
                invoker: id,
                service,
                callback,
                parameters,
            })),
            Ok(Dispatch::Forwarded { registrant }) => {
                tracing::debug!(
                    connection = %id,
                    service = %service,
                    registrant = %registrant,
                    "invoke relayed"
                );
                Ok(Outcome::Done)
            }
            Err(e) => {
                tracing::debug!(connection = %id, service = %service, error = %e, "invoke refused");
                reg.connection_mut(id)?.send(WireMessage::InvokeError {
                    service,
                    reason: e.reason().to_string(),
                })?;
                Ok(Outcome::Done)
            }
        }
    }
}
