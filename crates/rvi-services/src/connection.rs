//! Connection registry: one entry per live peer session.
//!
//! The registry exclusively owns each `Connection` and the `SessionHandle`
//! inside it. Removing an entry hands both back to the caller, which is
//! responsible for cascading into the service registry and closing the
//! session.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use rvi_core::{ConnectionId, PatternSet, RviError, WireMessage};

/// Inbound items a connection may queue before it is treated as flooding.
pub const MAX_PENDING_INBOUND: usize = 4096;

/// Per-connection protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport up; waiting for the peer's authenticate.
    Handshaking,
    /// Peer rights known; our announce not yet sent.
    Authenticated,
    /// Announce exchanged; invokes accepted.
    Operational,
    Closed,
}

/// Something the transport delivered for a connection, awaiting dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(WireMessage),
    /// The transport failed or the peer hung up.
    Closed(RviError),
}

/// Owned handle on one TLS session.
///
/// Outbound messages go through an unbounded channel to the session's
/// writer task, so sending never blocks the caller. Dropping the handle
/// closes the channel, which ends the writer and shuts the stream down.
#[derive(Debug)]
pub struct SessionHandle {
    outbound: mpsc::UnboundedSender<WireMessage>,
    reader: Option<AbortHandle>,
    peer_addr: Option<SocketAddr>,
    fingerprint: Option<String>,
}

impl SessionHandle {
    pub fn new(outbound: mpsc::UnboundedSender<WireMessage>) -> Self {
        Self {
            outbound,
            reader: None,
            peer_addr: None,
            fingerprint: None,
        }
    }

    /// A handle whose outbound side is a plain channel receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WireMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn with_peer(mut self, addr: SocketAddr, fingerprint: Option<String>) -> Self {
        self.peer_addr = Some(addr);
        self.fingerprint = fingerprint;
        self
    }

    pub fn with_reader(mut self, reader: AbortHandle) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn send(&self, msg: WireMessage) -> Result<(), RviError> {
        self.outbound
            .send(msg)
            .map_err(|_| RviError::TransportFailure("session writer has shut down".into()))
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Hex BLAKE3 digest of the peer's leaf certificate.
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    /// Stop the reader and release the writer.
    pub fn close(self) {
        if let Some(reader) = &self.reader {
            reader.abort();
        }
    }
}

/// One live peer session.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    state: ConnectionState,
    register_patterns: PatternSet,
    invoke_patterns: PatternSet,
    session: SessionHandle,
    inbox: VecDeque<Inbound>,
    established_at: Instant,
    last_seen: Instant,
    announce_received: bool,
}

impl Connection {
    pub fn new(id: ConnectionId, session: SessionHandle) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: ConnectionState::Handshaking,
            register_patterns: PatternSet::new(),
            invoke_patterns: PatternSet::new(),
            session,
            inbox: VecDeque::new(),
            established_at: now,
            last_seen: now,
            announce_received: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn register_patterns(&self) -> &PatternSet {
        &self.register_patterns
    }

    pub fn invoke_patterns(&self) -> &PatternSet {
        &self.invoke_patterns
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn established_at(&self) -> Instant {
        self.established_at
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn announce_received(&self) -> bool {
        self.announce_received
    }

    pub fn send(&self, msg: WireMessage) -> Result<(), RviError> {
        self.session.send(msg)
    }

    /// Queue transport input for the next dispatch round.
    ///
    /// Fails with `ProtocolViolation` once `MAX_PENDING_INBOUND` items are
    /// waiting; a transport close is always queued.
    pub fn push_inbound(&mut self, item: Inbound) -> Result<(), RviError> {
        if self.inbox.len() >= MAX_PENDING_INBOUND && matches!(item, Inbound::Message(_)) {
            return Err(RviError::ProtocolViolation(format!(
                "more than {MAX_PENDING_INBOUND} messages awaiting dispatch"
            )));
        }
        self.last_seen = Instant::now();
        self.inbox.push_back(item);
        Ok(())
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbox.len()
    }

    pub(crate) fn drain_inbound(&mut self) -> Vec<Inbound> {
        self.inbox.drain(..).collect()
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub(crate) fn mark_announce_received(&mut self) {
        self.announce_received = true;
    }

    pub(crate) fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn into_session(self) -> SessionHandle {
        self.session
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id,
            state: self.state,
            register_patterns: self.register_patterns.clone(),
            invoke_patterns: self.invoke_patterns.clone(),
            peer_addr: self.session.peer_addr(),
            fingerprint: self.session.fingerprint().map(String::from),
            last_seen: self.last_seen,
        }
    }
}

/// Point-in-time copy of a connection, detached from the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub register_patterns: PatternSet,
    pub invoke_patterns: PatternSet,
    pub peer_addr: Option<SocketAddr>,
    /// Hex BLAKE3 digest of the peer's leaf certificate.
    pub fingerprint: Option<String>,
    /// When the peer last delivered anything.
    pub last_seen: Instant,
}

/// Ordered index of live connections, keyed by identifier.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: BTreeMap<ConnectionId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, connection: Connection) -> Result<(), RviError> {
        let id = connection.id();
        if self.entries.contains_key(&id) {
            return Err(RviError::DuplicateConnection(id));
        }
        self.entries.insert(id, connection);
        Ok(())
    }

    pub fn find(&self, id: ConnectionId) -> Option<&Connection> {
        self.entries.get(&id)
    }

    pub fn find_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Union newly granted patterns into the connection's rights.
    ///
    /// Returns how many register and invoke patterns were new.
    pub fn update_rights(
        &mut self,
        id: ConnectionId,
        register: &PatternSet,
        invoke: &PatternSet,
    ) -> Result<(usize, usize), RviError> {
        let conn = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| RviError::NotFound(format!("connection {id}")))?;
        let added_register = conn.register_patterns.merge(register);
        let added_invoke = conn.invoke_patterns.merge(invoke);
        Ok((added_register, added_invoke))
    }

    pub fn remove(&mut self, id: ConnectionId) -> Result<Connection, RviError> {
        self.entries
            .remove(&id)
            .ok_or_else(|| RviError::NotFound(format!("connection {id}")))
    }

    /// Snapshot of every connection. Later mutations are not reflected.
    pub fn for_each(&self) -> std::vec::IntoIter<ConnectionSnapshot> {
        self.entries
            .values()
            .map(Connection::snapshot)
            .collect::<Vec<_>>()
            .into_iter()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.entries.values()
    }
}
