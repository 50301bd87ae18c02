//! Combined node state: connections and services behind one borrow.
//!
//! Every compound operation (disconnect cascade, registration with
//! announcement, invoke dispatch) runs against `&mut Registry`, so a caller
//! holding the registry lock never observes a connection gone while one of
//! its services remains, or a service in one index but not the other.

use std::time::{Duration, Instant};

use serde_json::Value;

use rvi_core::wire::{Availability, ServiceStatus};
use rvi_core::{ConnectionId, Grant, Registrant, RviError, WireMessage};

use crate::connection::{Connection, ConnectionRegistry, ConnectionState, Inbound};
use crate::service::{Service, ServiceCallback, ServiceRegistry};

/// Result of an invoke, from the invoker's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeOutcome {
    /// A local callback ran and produced this value.
    Completed(Value),
    /// The invoke was handed to the registrant's session. Any reply arrives
    /// later as a separate message.
    Pending { registrant: ConnectionId },
}

/// Where an authorized invoke goes.
///
/// Local callbacks are returned rather than called so the caller can drop
/// the registry lock before running user code.
pub enum Dispatch {
    Local {
        service: String,
        callback: ServiceCallback,
        parameters: Value,
    },
    Forwarded { registrant: ConnectionId },
}

impl Dispatch {
    pub fn run(self) -> InvokeOutcome {
        match self {
            Dispatch::Local {
                service,
                callback,
                parameters,
            } => InvokeOutcome::Completed(callback(&service, &parameters)),
            Dispatch::Forwarded { registrant } => InvokeOutcome::Pending { registrant },
        }
    }
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dispatch::Local { service, .. } => {
                f.debug_struct("Local").field("service", service).finish()
            }
            Dispatch::Forwarded { registrant } => f
                .debug_struct("Forwarded")
                .field("registrant", registrant)
                .finish(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    connections: ConnectionRegistry,
    services: ServiceRegistry,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    // ── Connections ───────────────────────────────────────────────────────

    /// Add a freshly handshaken connection. It holds no rights until `grant`.
    pub fn insert_connection(&mut self, connection: Connection) -> Result<(), RviError> {
        let id = connection.id();
        self.connections.insert(connection)?;
        tracing::debug!(connection = %id, "connection registered");
        Ok(())
    }

    pub fn find_connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.find(id)
    }

    pub(crate) fn connection_mut(&mut self, id: ConnectionId) -> Result<&mut Connection, RviError> {
        self.connections
            .find_mut(id)
            .ok_or_else(|| RviError::NotFound(format!("connection {id}")))
    }

    /// Merge a verified grant into a connection and re-evaluate its
    /// membership in every service's permission sets.
    pub fn grant(&mut self, id: ConnectionId, grant: &Grant) -> Result<(), RviError> {
        let (register, invoke) = self
            .connections
            .update_rights(id, &grant.register, &grant.invoke)?;
        if let Some(conn) = self.connections.find(id) {
            self.services.refresh_rights(conn);
        }
        tracing::debug!(connection = %id, register, invoke, "rights updated");
        Ok(())
    }

    /// Queue transport input for `id`.
    pub fn push_inbound(&mut self, id: ConnectionId, item: Inbound) -> Result<(), RviError> {
        self.connection_mut(id)?.push_inbound(item)
    }

    /// Take everything queued for `id`.
    pub fn drain_inbound(&mut self, id: ConnectionId) -> Result<Vec<Inbound>, RviError> {
        Ok(self.connection_mut(id)?.drain_inbound())
    }

    /// Remove a connection and every service it registered, in one step.
    ///
    /// Surviving services forget the identifier, and peers that could see a
    /// withdrawn service are told it is gone. The caller closes the session.
    pub fn disconnect(&mut self, id: ConnectionId) -> Result<(Connection, Vec<Service>), RviError> {
        let mut conn = self.connections.remove(id)?;
        conn.set_state(ConnectionState::Closed);
        let withdrawn = self.services.remove_by_registrant(Registrant::Remote(id));
        self.services.forget_connection(id);
        for service in &withdrawn {
            self.announce(service.name(), Availability::Unavailable, Some(id));
        }
        tracing::info!(
            connection = %id,
            withdrawn = withdrawn.len(),
            "connection removed"
        );
        Ok((conn, withdrawn))
    }

    /// Connections still short of a full handshake once `deadline` has
    /// passed since they were established.
    pub fn stale_handshakes(&self, now: Instant, deadline: Duration) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|c| now.saturating_duration_since(c.established_at()) >= deadline)
            .filter(|c| c.state() != ConnectionState::Operational || !c.announce_received())
            .map(Connection::id)
            .collect()
    }

    /// Operational connections that have delivered nothing for `limit`.
    pub fn idle_connections(&self, now: Instant, limit: Duration) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|c| c.state() == ConnectionState::Operational)
            .filter(|c| now.saturating_duration_since(c.last_seen()) >= limit)
            .map(Connection::id)
            .collect()
    }

    pub fn operational(&self) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|c| c.state() == ConnectionState::Operational)
            .map(Connection::id)
            .collect()
    }

    /// Remove every connection, then every remaining service.
    pub fn teardown(&mut self) -> Vec<Connection> {
        let closed = self
            .connections
            .ids()
            .into_iter()
            .filter_map(|id| self.disconnect(id).ok())
            .map(|(conn, _)| conn)
            .collect();
        let dropped = self.services.clear();
        tracing::debug!(services = dropped.len(), "registry torn down");
        closed
    }

    // ── Services ──────────────────────────────────────────────────────────

    pub fn register_local(&mut self, name: &str, callback: ServiceCallback) -> Result<(), RviError> {
        self.services
            .register(&self.connections, name, Registrant::Local, Some(callback))?;
        tracing::info!(service = name, "local service registered");
        self.announce(name, Availability::Available, None);
        Ok(())
    }

    pub fn unregister_local(&mut self, name: &str) -> Result<Service, RviError> {
        let service = self.services.unregister(name, Registrant::Local)?;
        tracing::info!(service = name, "local service unregistered");
        self.announce(name, Availability::Unavailable, None);
        Ok(service)
    }

    /// Accept one name from a peer's announce.
    ///
    /// Returns `false` when the peer already owns the name; its permission
    /// sets are recomputed and nothing else changes.
    pub fn register_remote(&mut self, id: ConnectionId, name: &str) -> Result<bool, RviError> {
        let registrant = Registrant::Remote(id);
        if self
            .services
            .find_by_name(name)
            .is_some_and(|s| s.registrant() == registrant)
        {
            self.services.recompute(&self.connections, name);
            return Ok(false);
        }
        self.services
            .register(&self.connections, name, registrant, None)?;
        tracing::info!(connection = %id, service = name, "remote service registered");
        self.announce(name, Availability::Available, Some(id));
        Ok(true)
    }

    /// Apply one withdrawal from a peer's announce.
    pub fn withdraw_remote(&mut self, id: ConnectionId, name: &str) -> Result<Service, RviError> {
        let service = self.services.unregister(name, Registrant::Remote(id))?;
        tracing::info!(connection = %id, service = name, "remote service withdrawn");
        self.announce(name, Availability::Unavailable, Some(id));
        Ok(service)
    }

    /// Services `id` may see: everything matching its invoke rights except
    /// what it registered itself.
    pub fn visible_to(&self, id: ConnectionId) -> Vec<ServiceStatus> {
        let Some(conn) = self.connections.find(id) else {
            return Vec::new();
        };
        self.services
            .iter()
            .filter(|s| s.registrant() != Registrant::Remote(id))
            .filter(|s| conn.invoke_patterns().matches(s.name()))
            .map(|s| ServiceStatus::available(s.name()))
            .collect()
    }

    pub fn list_services(&self) -> Vec<String> {
        self.services.names()
    }

    pub fn list_connections(&self) -> Vec<ConnectionId> {
        self.connections.ids()
    }

    // ── Invoke ────────────────────────────────────────────────────────────

    /// Authorize an invoke and work out where it goes.
    ///
    /// Remote targets receive the `invoke` message before this returns.
    /// Failures leave the registry untouched.
    pub fn prepare_invoke(
        &self,
        name: &str,
        invoker: Registrant,
        parameters: Value,
    ) -> Result<Dispatch, RviError> {
        if !parameters.is_object() {
            return Err(RviError::InvalidArgument(format!(
                "parameters for {name} must be an object"
            )));
        }
        let service = self
            .services
            .find_by_name(name)
            .ok_or_else(|| RviError::NotFound(format!("service {name}")))?;
        if !service.invokable_by(invoker) {
            return Err(RviError::Unauthorized(format!("{invoker} may not invoke {name}")));
        }

        match service.registrant() {
            Registrant::Local => {
                let callback = service
                    .callback()
                    .cloned()
                    .ok_or_else(|| RviError::NotFound(format!("callback for {name}")))?;
                Ok(Dispatch::Local {
                    service: name.to_string(),
                    callback,
                    parameters,
                })
            }
            Registrant::Remote(registrant) => {
                let conn = self
                    .connections
                    .find(registrant)
                    .ok_or_else(|| RviError::NotFound(format!("connection {registrant}")))?;
                conn.send(WireMessage::Invoke {
                    service: name.to_string(),
                    parameters,
                })?;
                tracing::debug!(service = name, registrant = %registrant, "invoke forwarded");
                Ok(Dispatch::Forwarded { registrant })
            }
        }
    }

    /// `prepare_invoke` followed by running any local callback in place.
    pub fn invoke(
        &self,
        name: &str,
        invoker: Registrant,
        parameters: Value,
    ) -> Result<InvokeOutcome, RviError> {
        Ok(self.prepare_invoke(name, invoker, parameters)?.run())
    }

    /// Both service indexes agree and every remote registrant is live.
    pub fn is_consistent(&self) -> bool {
        self.services.indexes_consistent()
            && self.services.iter().all(|s| match s.registrant() {
                Registrant::Local => true,
                Registrant::Remote(id) => self.connections.contains(id),
            })
    }

    /// Tell operational peers (other than `except`) that may invoke `name`
    /// about a change in its availability.
    fn announce(&self, name: &str, status: Availability, except: Option<ConnectionId>) {
        let entry = ServiceStatus {
            name: name.to_string(),
            status,
        };
        for conn in self.connections.iter() {
            if Some(conn.id()) == except
                || conn.state() != ConnectionState::Operational
                || !conn.invoke_patterns().matches(name)
            {
                continue;
            }
            let msg = WireMessage::ServiceAnnounce {
                services: vec![entry.clone()],
            };
            if let Err(e) = conn.send(msg) {
                tracing::debug!(connection = %conn.id(), error = %e, "announce not delivered");
            }
        }
    }
}
