//! The node handle: session lifecycle and the local API.
//!
//! One `Node` owns:
//!   - the `Registry` (connections + services) behind a single lock
//!   - the `ProtocolEngine` with this node's credentials and verifier
//!   - a dispatch task fed by every session's reader
//!   - a maintenance tick that closes stalled handshakes and sends pings
//!
//! Local callbacks never run while the registry lock is held.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rustls::pki_types::ServerName;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::timeout;
use tokio_rustls::TlsStream;

use rvi_core::config::NodeConfig;
use rvi_core::credential::JwtVerifier;
use rvi_core::{ConnectionId, CredentialVerifier, Registrant, RviError, WireMessage};
use rvi_services::{
    Connection, ConnectionSnapshot, ConnectionState, Inbound, InvokeOutcome, LocalCall,
    ProtocolEngine, Registry,
};

use crate::tls::TlsConfig;
use crate::transport::{spawn_session, EventSender};

/// Keepalive pings a peer may leave unanswered before it is closed.
const IDLE_PINGS: u32 = 3;

/// How far a connection has got through the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Progress {
    state: ConnectionState,
    /// The peer's service-announce has been processed.
    announced: bool,
    /// Why the connection closed, when it did so on our side.
    closed: Option<RviError>,
}

impl Progress {
    fn ready(&self) -> bool {
        self.state == ConnectionState::Operational && self.announced
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

pub struct NodeBuilder {
    config: NodeConfig,
    verifier: Option<Arc<dyn CredentialVerifier>>,
    credentials: Option<Vec<String>>,
    tls: Option<TlsConfig>,
    manual_dispatch: bool,
}

impl NodeBuilder {
    /// Verifier for peer credentials. Defaults to a `JwtVerifier` built from
    /// `cred.verify_key` or `cred.secret`.
    pub fn verifier(mut self, verifier: Arc<dyn CredentialVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Credentials presented to peers. Defaults to the `*.jwt` files in `cred.dir`.
    pub fn credentials(mut self, credentials: Vec<String>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Use an already built TLS configuration instead of the configured paths.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Queue inbound messages until `Node::process_pending` is called,
    /// instead of dispatching them as they arrive.
    pub fn manual_dispatch(mut self) -> Self {
        self.manual_dispatch = true;
        self
    }

    pub async fn build(self) -> Result<Node, RviError> {
        let tls = match self.tls {
            Some(tls) => tls,
            None => TlsConfig::from_config(&self.config)?,
        };
        let credentials = match self.credentials {
            Some(c) => c,
            None => self.config.load_credentials()?,
        };
        let verifier = match self.verifier {
            Some(v) => v,
            None => default_verifier(&self.config)?,
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        let inner = Arc::new(Inner {
            registry: Mutex::new(Registry::new()),
            engine: ProtocolEngine::new(verifier, credentials),
            tls,
            handshake_timeout: self.config.handshake_timeout(),
            ping_interval: self.config.ping_interval(),
            auto_dispatch: !self.manual_dispatch,
            next_id: AtomicU64::new(1),
            events: events_tx,
            progress: DashMap::new(),
            shutdown,
        });

        tokio::spawn(dispatch_loop(inner.clone(), events_rx));
        tokio::spawn(maintenance_loop(inner.clone()));

        tracing::info!(
            credentials = inner.engine.credentials().len(),
            handshake_timeout_secs = inner.handshake_timeout.as_secs(),
            auto_dispatch = inner.auto_dispatch,
            "node initialized"
        );
        Ok(Node { inner })
    }
}

fn default_verifier(config: &NodeConfig) -> Result<Arc<dyn CredentialVerifier>, RviError> {
    if let Some(path) = &config.cred.verify_key {
        let pem = std::fs::read(path).map_err(|e| {
            RviError::InvalidArgument(format!("failed to read {}: {e}", path.display()))
        })?;
        return Ok(Arc::new(JwtVerifier::from_pem(&pem)?));
    }
    if let Some(secret) = &config.cred.secret {
        return Ok(Arc::new(JwtVerifier::from_secret(secret.as_bytes())));
    }
    Err(RviError::InvalidArgument(
        "no credential verifier: set cred.verify_key or cred.secret".into(),
    ))
}

// ── Node ──────────────────────────────────────────────────────────────────────

struct Inner {
    registry: Mutex<Registry>,
    engine: ProtocolEngine,
    tls: TlsConfig,
    handshake_timeout: Duration,
    ping_interval: Option<Duration>,
    auto_dispatch: bool,
    next_id: AtomicU64,
    events: EventSender,
    progress: DashMap<ConnectionId, watch::Sender<Progress>>,
    shutdown: broadcast::Sender<()>,
}

/// Handle on one running node. Cheap to clone; every clone drives the same
/// registries.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

impl Node {
    /// Build a node from configuration alone.
    pub async fn init(config: NodeConfig) -> Result<Self, RviError> {
        Self::builder(config).build().await
    }

    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder {
            config,
            verifier: None,
            credentials: None,
            tls: None,
            manual_dispatch: false,
        }
    }

    /// Accept inbound sessions on `addr`. Returns the bound address.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, RviError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, "listening for peers");
        tokio::spawn(accept_loop(self.inner.clone(), listener));
        Ok(local)
    }

    /// Dial a peer and run the handshake.
    ///
    /// With automatic dispatch this returns once the peer's services are
    /// known. With manual dispatch it returns as soon as our authenticate
    /// is sent; the caller drives the rest through `process_pending`.
    pub async fn connect(&self, host: &str, port: u16) -> Result<ConnectionId, RviError> {
        let inner = &self.inner;
        let deadline = Instant::now()
            .checked_add(inner.handshake_timeout)
            .ok_or_else(|| {
                RviError::InvalidArgument(format!(
                    "handshake timeout {:?} out of range",
                    inner.handshake_timeout
                ))
            })?;

        let stream = dial(host, port, inner.handshake_timeout).await?;
        let peer_addr = stream.peer_addr()?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| RviError::InvalidArgument(format!("invalid server name {host}: {e}")))?;
        let tls = timeout(
            remaining(deadline),
            inner.tls.connector().connect(server_name, stream),
        )
        .await
        .map_err(|_| RviError::Timeout(format!("TLS handshake with {host}:{port}")))?
        .map_err(|e| RviError::TransportFailure(format!("TLS handshake with {host}:{port}: {e}")))?;

        let (id, mut progress) = inner.establish(TlsStream::Client(tls), peer_addr).await?;
        if !inner.auto_dispatch {
            return Ok(id);
        }

        let waited = match timeout(
            remaining(deadline),
            progress.wait_for(|p| p.ready() || p.state == ConnectionState::Closed),
        )
        .await
        {
            Ok(Ok(p)) => Some(Some(p.clone())),
            Ok(Err(_)) => Some(None),
            Err(_) => None,
        };
        let Some(seen) = waited else {
            let err = RviError::Timeout(format!("handshake with {host}:{port}"));
            inner.close(id, Some(err.clone())).await;
            return Err(err);
        };
        let seen = seen.unwrap_or_else(|| progress.borrow().clone());
        if seen.ready() {
            return Ok(id);
        }
        Err(seen.closed.unwrap_or_else(|| {
            RviError::TransportFailure(format!("{host}:{port} closed during handshake"))
        }))
    }

    /// Wait until connection `id` has closed. Returns at once for unknown ids.
    pub async fn closed(&self, id: ConnectionId) {
        let Some(mut rx) = self.inner.progress.get(&id).map(|tx| tx.subscribe()) else {
            return;
        };
        let _ = rx.wait_for(|p| p.state == ConnectionState::Closed).await;
    }

    /// Close a connection and drop every service it registered.
    pub async fn disconnect(&self, id: ConnectionId) -> Result<(), RviError> {
        let mut reg = self.inner.registry.lock().await;
        self.inner.close_locked(&mut reg, id, None)
    }

    /// Offer a local service. Peers allowed to invoke it are told at once.
    pub async fn register_service<F>(&self, name: &str, callback: F) -> Result<(), RviError>
    where
        F: Fn(&str, &Value) -> Value + Send + Sync + 'static,
    {
        let mut reg = self.inner.registry.lock().await;
        reg.register_local(name, Arc::new(callback))
    }

    pub async fn unregister_service(&self, name: &str) -> Result<(), RviError> {
        let mut reg = self.inner.registry.lock().await;
        reg.unregister_local(name).map(|_| ())
    }

    /// Invoke any known service as the local process.
    ///
    /// Local services run here and return `Completed`. Remote ones are sent
    /// to their registrant and return `Pending`.
    pub async fn invoke_service(&self, name: &str, parameters: Value) -> Result<InvokeOutcome, RviError> {
        let dispatch = {
            let reg = self.inner.registry.lock().await;
            reg.prepare_invoke(name, Registrant::Local, parameters)?
        };
        Ok(dispatch.run())
    }

    pub async fn list_services(&self) -> Vec<String> {
        self.inner.registry.lock().await.list_services()
    }

    pub async fn list_connections(&self) -> Vec<ConnectionId> {
        self.inner.registry.lock().await.list_connections()
    }

    /// Point-in-time detail of every connection.
    pub async fn connection_snapshots(&self) -> Vec<ConnectionSnapshot> {
        self.inner.registry.lock().await.connections().for_each().collect()
    }

    /// Connections with queued inbound input.
    pub async fn ready_connections(&self) -> Vec<ConnectionId> {
        let reg = self.inner.registry.lock().await;
        reg.list_connections()
            .into_iter()
            .filter(|id| reg.find_connection(*id).is_some_and(|c| c.pending_inbound() > 0))
            .collect()
    }

    /// Run one dispatch round for `ready`. Returns how many local callbacks ran.
    ///
    /// A peer's invoke of a local service has no success reply on the wire, so
    /// callback results are logged at debug level and then dropped.
    pub async fn process_pending(&self, ready: &[ConnectionId]) -> usize {
        self.inner.process_pending(ready).await
    }

    /// Close every connection, drop every service and stop background tasks.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(());
        let mut reg = self.inner.registry.lock().await;
        for conn in reg.teardown() {
            let id = conn.id();
            conn.into_session().close();
            self.inner.publish_closed(id, None);
        }
        tracing::info!("node shut down");
    }
}

// ── Session lifecycle ─────────────────────────────────────────────────────────

impl Inner {
    /// Register a freshly handshaken TLS stream and send our authenticate.
    async fn establish(
        &self,
        stream: TlsStream<TcpStream>,
        peer_addr: SocketAddr,
    ) -> Result<(ConnectionId, watch::Receiver<Progress>), RviError> {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = watch::channel(Progress {
            state: ConnectionState::Handshaking,
            announced: false,
            closed: None,
        });

        // Hold the lock while the reader starts so its first event cannot
        // reach the dispatch loop before the entry exists.
        let mut reg = self.registry.lock().await;
        let session = spawn_session(id, stream, peer_addr, self.events.clone());
        reg.insert_connection(Connection::new(id, session))?;
        self.progress.insert(id, tx);
        if let Err(e) = self.engine.on_transport_ready(&mut reg, id) {
            let _ = self.close_locked(&mut reg, id, Some(e.clone()));
            return Err(e);
        }
        tracing::info!(connection = %id, peer = %peer_addr, "session established");
        Ok((id, rx))
    }

    async fn close(&self, id: ConnectionId, reason: Option<RviError>) {
        let mut reg = self.registry.lock().await;
        let _ = self.close_locked(&mut reg, id, reason);
    }

    /// Disconnect cascade: registry entry, services, session, watchers.
    fn close_locked(
        &self,
        reg: &mut Registry,
        id: ConnectionId,
        reason: Option<RviError>,
    ) -> Result<(), RviError> {
        let (conn, withdrawn) = reg.disconnect(id)?;
        conn.into_session().close();
        self.publish_closed(id, reason.clone());
        match reason {
            Some(e) => tracing::warn!(
                connection = %id,
                withdrawn = withdrawn.len(),
                error = %e,
                "connection closed"
            ),
            None => tracing::info!(connection = %id, withdrawn = withdrawn.len(), "disconnected"),
        }
        Ok(())
    }

    fn publish_closed(&self, id: ConnectionId, reason: Option<RviError>) {
        if let Some((_, tx)) = self.progress.remove(&id) {
            tx.send_replace(Progress {
                state: ConnectionState::Closed,
                announced: false,
                closed: reason,
            });
        }
    }

    fn publish(&self, reg: &Registry, id: ConnectionId) {
        let (Some(conn), Some(tx)) = (reg.find_connection(id), self.progress.get(&id)) else {
            return;
        };
        let next = Progress {
            state: conn.state(),
            announced: conn.announce_received(),
            closed: None,
        };
        tx.send_if_modified(|p| {
            let changed = p.state != next.state || p.announced != next.announced;
            *p = next;
            changed
        });
    }

    async fn process_pending(&self, ready: &[ConnectionId]) -> usize {
        let mut calls: Vec<LocalCall> = Vec::new();
        {
            let mut reg = self.registry.lock().await;
            for &id in ready {
                let round = self.engine.process(&mut reg, id);
                calls.extend(round.calls);
                match round.fatal {
                    Some(e) => {
                        let _ = self.close_locked(&mut reg, id, Some(e));
                    }
                    None => self.publish(&reg, id),
                }
            }
        }

        let count = calls.len();
        for call in calls {
            let invoker = call.invoker;
            let service = call.service.clone();
            let result = call.run();
            tracing::debug!(
                connection = %invoker,
                service = %service,
                result = %result,
                "invoke completed"
            );
        }
        count
    }

    /// Close connections that have not finished the handshake in time, and
    /// with keepalive on, operational ones that stopped answering pings.
    async fn sweep(&self) {
        let now = Instant::now();
        let mut reg = self.registry.lock().await;
        for id in reg.stale_handshakes(now, self.handshake_timeout) {
            let reason = RviError::Timeout(format!(
                "handshake not complete after {}s",
                self.handshake_timeout.as_secs()
            ));
            let _ = self.close_locked(&mut reg, id, Some(reason));
        }

        let Some(interval) = self.ping_interval else {
            return;
        };
        let limit = interval.saturating_mul(IDLE_PINGS);
        for id in reg.idle_connections(now, limit) {
            let reason = RviError::Timeout(format!("peer silent for {}s", limit.as_secs()));
            let _ = self.close_locked(&mut reg, id, Some(reason));
        }
    }

    async fn ping_all(&self) {
        let reg = self.registry.lock().await;
        for id in reg.operational() {
            if let Some(conn) = reg.find_connection(id) {
                if let Err(e) = conn.send(WireMessage::Ping) {
                    tracing::debug!(connection = %id, error = %e, "ping not sent");
                }
            }
        }
    }
}

// ── Background tasks ──────────────────────────────────────────────────────────

async fn dispatch_loop(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<(ConnectionId, Inbound)>) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("dispatch loop shutting down");
                return;
            }
            event = events.recv() => {
                let Some((id, item)) = event else { return };
                {
                    let mut reg = inner.registry.lock().await;
                    match reg.push_inbound(id, item) {
                        Ok(()) => {}
                        Err(RviError::NotFound(_)) => {
                            tracing::trace!(connection = %id, "event for closed connection");
                            continue;
                        }
                        Err(e) => {
                            let _ = inner.close_locked(&mut reg, id, Some(e));
                            continue;
                        }
                    }
                }
                if inner.auto_dispatch {
                    inner.process_pending(&[id]).await;
                }
            }
        }
    }
}

async fn maintenance_loop(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let sweep_every = (inner.handshake_timeout / 4).max(Duration::from_millis(250));
    let mut sweep = tokio::time::interval(sweep_every);
    let mut ping = tokio::time::interval(inner.ping_interval.unwrap_or(Duration::from_secs(3600)));
    ping.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = sweep.tick() => inner.sweep().await,
            _ = ping.tick(), if inner.ping_interval.is_some() => inner.ping_all().await,
        }
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        let (tcp, peer) = tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("listener shutting down");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        let inner = inner.clone();
        tokio::spawn(async move {
            let acceptor = inner.tls.acceptor();
            match timeout(inner.handshake_timeout, acceptor.accept(tcp)).await {
                Ok(Ok(tls)) => {
                    if let Err(e) = inner.establish(TlsStream::Server(tls), peer).await {
                        tracing::warn!(peer = %peer, error = %e, "inbound session rejected");
                    }
                }
                Ok(Err(e)) => tracing::warn!(peer = %peer, error = %e, "TLS accept failed"),
                Err(_) => tracing::warn!(peer = %peer, "TLS accept timed out"),
            }
        });
    }
}

/// TCP connect to the first reachable address of `host:port`.
async fn dial(host: &str, port: u16, limit: Duration) -> Result<TcpStream, RviError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    let mut last = RviError::NotFound(format!("no address for {host}:{port}"));
    for addr in addrs {
        match timeout(limit, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last = RviError::TransportFailure(format!("connect {addr}: {e}")),
            Err(_) => last = RviError::Timeout(format!("connect {addr}")),
        }
    }
    Err(last)
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}
