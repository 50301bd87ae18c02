//! Service registry: every known service, local or remote.
//!
//! Two ordered indexes over one set of records:
//!   - `by_name`: fully-qualified name → service (owns the record)
//!   - `by_registrant`: (registrant, name) keys, for bulk removal on disconnect
//!
//! Every mutating method updates both indexes before returning, so no
//! caller can observe one without the other.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use rvi_core::pattern::validate_service_name;
use rvi_core::{ConnectionId, Registrant, RviError};

use crate::connection::{Connection, ConnectionRegistry};

/// Local invocation callback: `(service name, parameters) -> result`.
pub type ServiceCallback = Arc<dyn Fn(&str, &Value) -> Value + Send + Sync>;

/// One registered service.
#[derive(Clone)]
pub struct Service {
    name: String,
    registrant: Registrant,
    may_register: BTreeSet<ConnectionId>,
    may_invoke: BTreeSet<ConnectionId>,
    callback: Option<ServiceCallback>,
}

impl Service {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registrant(&self) -> Registrant {
        self.registrant
    }

    /// Connections whose register rights match this name.
    pub fn may_register(&self) -> &BTreeSet<ConnectionId> {
        &self.may_register
    }

    /// Connections whose invoke rights match this name.
    pub fn may_invoke(&self) -> &BTreeSet<ConnectionId> {
        &self.may_invoke
    }

    pub fn callback(&self) -> Option<&ServiceCallback> {
        self.callback.as_ref()
    }

    /// The local process may always invoke; remotes need a matching grant.
    pub fn invokable_by(&self, invoker: Registrant) -> bool {
        match invoker {
            Registrant::Local => true,
            Registrant::Remote(id) => self.may_invoke.contains(&id),
        }
    }

    fn apply_rights(&mut self, conn: &Connection) {
        let id = conn.id();
        if conn.register_patterns().matches(&self.name) {
            self.may_register.insert(id);
        } else {
            self.may_register.remove(&id);
        }
        if conn.invoke_patterns().matches(&self.name) {
            self.may_invoke.insert(id);
        } else {
            self.may_invoke.remove(&id);
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("registrant", &self.registrant)
            .field("may_register", &self.may_register)
            .field("may_invoke", &self.may_invoke)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    by_name: BTreeMap<String, Service>,
    by_registrant: BTreeSet<(Registrant, String)>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` under `registrant`.
    ///
    /// A remote registrant must exist and hold a matching register pattern.
    /// A local registrant is always authorized but must supply a callback.
    pub fn register(
        &mut self,
        connections: &ConnectionRegistry,
        name: &str,
        registrant: Registrant,
        callback: Option<ServiceCallback>,
    ) -> Result<&Service, RviError> {
        validate_service_name(name)?;

        let remote = match registrant {
            Registrant::Local => {
                if callback.is_none() {
                    return Err(RviError::InvalidArgument(format!(
                        "local service {name} needs a callback"
                    )));
                }
                None
            }
            Registrant::Remote(id) => {
                if callback.is_some() {
                    return Err(RviError::InvalidArgument(format!(
                        "remote service {name} cannot carry a local callback"
                    )));
                }
                Some(
                    connections
                        .find(id)
                        .ok_or_else(|| RviError::NotFound(format!("connection {id}")))?,
                )
            }
        };

        if self.by_name.contains_key(name) {
            return Err(RviError::DuplicateService(name.to_string()));
        }
        if let Some(conn) = remote {
            if !conn.register_patterns().matches(name) {
                return Err(RviError::Unauthorized(format!(
                    "{} may not register {name}",
                    conn.id()
                )));
            }
        }

        let mut service = Service {
            name: name.to_string(),
            registrant,
            may_register: BTreeSet::new(),
            may_invoke: BTreeSet::new(),
            callback,
        };
        for conn in connections.iter() {
            service.apply_rights(conn);
        }

        self.by_registrant.insert((registrant, name.to_string()));
        Ok(self.by_name.entry(name.to_string()).or_insert(service))
    }

    /// Remove `name`. Only its registrant may do so.
    pub fn unregister(&mut self, name: &str, requester: Registrant) -> Result<Service, RviError> {
        let service = self
            .by_name
            .get(name)
            .ok_or_else(|| RviError::NotFound(format!("service {name}")))?;
        if service.registrant != requester {
            return Err(RviError::Unauthorized(format!(
                "{requester} did not register {name}"
            )));
        }
        self.remove_entry(name)
            .ok_or_else(|| RviError::NotFound(format!("service {name}")))
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Service> {
        self.by_name.get(name)
    }

    /// Names registered by `registrant`, collected so the caller may delete
    /// while walking them.
    pub fn find_by_registrant(&self, registrant: Registrant) -> Vec<String> {
        self.by_registrant
            .range((registrant, String::new())..)
            .take_while(|(r, _)| *r == registrant)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Remove every service registered by `registrant`.
    pub fn remove_by_registrant(&mut self, registrant: Registrant) -> Vec<Service> {
        self.find_by_registrant(registrant)
            .iter()
            .filter_map(|name| self.remove_entry(name))
            .collect()
    }

    /// Recompute `may_register`/`may_invoke` of one service against all connections.
    pub fn recompute(&mut self, connections: &ConnectionRegistry, name: &str) {
        if let Some(service) = self.by_name.get_mut(name) {
            service.may_register.clear();
            service.may_invoke.clear();
            for conn in connections.iter() {
                service.apply_rights(conn);
            }
        }
    }

    /// Re-evaluate one connection's membership across every service.
    pub fn refresh_rights(&mut self, conn: &Connection) {
        for service in self.by_name.values_mut() {
            service.apply_rights(conn);
        }
    }

    /// Drop a vanished connection from every permission set.
    pub fn forget_connection(&mut self, id: ConnectionId) {
        for service in self.by_name.values_mut() {
            service.may_register.remove(&id);
            service.may_invoke.remove(&id);
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.by_name.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        self.by_name.values()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// True when both indexes describe exactly the same set of services.
    pub fn indexes_consistent(&self) -> bool {
        self.by_name.len() == self.by_registrant.len()
            && self.by_registrant.iter().all(|(registrant, name)| {
                self.by_name
                    .get(name)
                    .is_some_and(|s| s.registrant == *registrant)
            })
    }

    /// Drop every service. Used at node teardown.
    pub fn clear(&mut self) -> Vec<Service> {
        self.by_registrant.clear();
        std::mem::take(&mut self.by_name).into_values().collect()
    }

    fn remove_entry(&mut self, name: &str) -> Option<Service> {
        let service = self.by_name.remove(name)?;
        self.by_registrant
            .remove(&(service.registrant, service.name.clone()));
        Some(service)
    }
}
