//! Connection state management

use crate::auth::{Nonce, Permissions};
use crate::server::protocol::{ConnectOptions, ServerMessage};
use crate::subjects::{Subject, SubjectPattern};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// What is on the other end of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// An end client
    Client,
    /// Another server in the same cluster
    Route,
    /// A server in another cluster; no authentication path exists yet
    Gateway,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::Client => write!(f, "client"),
            ConnectionKind::Route => write!(f, "route"),
            ConnectionKind::Gateway => write!(f, "gateway"),
        }
    }
}

/// Identity a connection assumed when it authenticated
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Accepted without credentials
    #[default]
    None,
    /// Accepted by a custom authenticator
    Custom,
    PublicKey(String),
    User(String),
    Token,
}

/// Peer certificate state from a completed TLS handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsState {
    /// DER-encoded peer chain, leaf first
    pub peer_certificates: Vec<Vec<u8>>,
    pub verified: bool,
    pub server_name: Option<String>,
}

/// A subscription held by a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub conn_id: Uuid,
    pub sid: String,
    pub subject: SubjectPattern,
}

#[derive(Default)]
struct ConnectionState {
    options: ConnectOptions,
    tls: Option<TlsState>,
    nonce: Option<Nonce>,
    authenticated: bool,
    identity: Identity,
    permissions: Option<Permissions>,
    subscriptions: HashMap<String, Arc<Subscription>>,
}

/// A live connection
///
/// The connection's own worker drives authentication; other workers (such as
/// a reload) read or mutate its state only through the internal mutex.
pub struct Connection {
    /// Unique connection ID
    pub id: Uuid,
    pub kind: ConnectionKind,
    state: Mutex<ConnectionState>,
    closed: AtomicBool,
    /// Channel for sending notices to this connection's writer
    tx: mpsc::Sender<ServerMessage>,
}

impl Connection {
    pub fn new(kind: ConnectionKind, nonce: Option<Nonce>, tx: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            state: Mutex::new(ConnectionState {
                nonce,
                ..Default::default()
            }),
            closed: AtomicBool::new(false),
            tx,
        }
    }

    /// The nonce issued in the greeting, if not yet consumed
    pub fn nonce(&self) -> Option<String> {
        self.state.lock().nonce.as_ref().map(|n| n.as_str().to_string())
    }

    /// Remove the nonce so it can be verified at most once
    pub(crate) fn take_nonce(&self) -> Option<Nonce> {
        self.state.lock().nonce.take()
    }

    /// Record the options decoded from the client's connect message
    pub fn set_options(&self, options: ConnectOptions) {
        self.state.lock().options = options;
    }

    pub fn options(&self) -> ConnectOptions {
        self.state.lock().options.clone()
    }

    pub fn set_tls_state(&self, tls: TlsState) {
        self.state.lock().tls = Some(tls);
    }

    pub fn tls_state(&self) -> Option<TlsState> {
        self.state.lock().tls.clone()
    }

    /// Mark the connection authenticated and install its permissions
    ///
    /// The caller passes an owned copy; nothing else holds it.
    pub(crate) fn bind(&self, identity: Identity, permissions: Option<Permissions>) {
        let mut state = self.state.lock();
        state.authenticated = true;
        state.identity = identity;
        state.permissions = permissions;
    }

    pub(crate) fn unbind(&self) {
        let mut state = self.state.lock();
        state.authenticated = false;
        state.identity = Identity::None;
        state.permissions = None;
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.lock().authenticated
    }

    pub fn identity(&self) -> Identity {
        self.state.lock().identity.clone()
    }

    /// A copy of the bound permissions
    pub fn permissions(&self) -> Option<Permissions> {
        self.state.lock().permissions.clone()
    }

    pub fn has_permissions(&self) -> bool {
        self.state.lock().permissions.is_some()
    }

    pub fn can_publish(&self, subject: &Subject) -> bool {
        match &self.state.lock().permissions {
            Some(perms) => perms.can_publish(subject),
            None => true,
        }
    }

    pub fn can_subscribe(&self, subject: &SubjectPattern) -> bool {
        match &self.state.lock().permissions {
            Some(perms) => perms.can_subscribe(subject),
            None => true,
        }
    }

    /// Store a subscription, returning any previous one with the same sid
    pub(crate) fn add_subscription(&self, sub: Arc<Subscription>) -> Option<Arc<Subscription>> {
        self.state.lock().subscriptions.insert(sub.sid.clone(), sub)
    }

    pub(crate) fn remove_subscription(&self, sid: &str) -> Option<Arc<Subscription>> {
        self.state.lock().subscriptions.remove(sid)
    }

    /// Remove `sub` only if it is still the subscription stored under its sid
    pub(crate) fn drop_subscription(&self, sub: &Arc<Subscription>) -> bool {
        let mut state = self.state.lock();
        let stored = state
            .subscriptions
            .get(&sub.sid)
            .is_some_and(|current| Arc::ptr_eq(current, sub));
        if stored {
            state.subscriptions.remove(&sub.sid);
        }
        stored
    }

    /// Empty the subscription map, returning what it held
    pub(crate) fn clear_subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.state
            .lock()
            .subscriptions
            .drain()
            .map(|(_, sub)| sub)
            .collect()
    }

    /// Snapshot of current subscriptions
    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.state.lock().subscriptions.values().cloned().collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Queue a notice without blocking. Returns false if it could not be queued.
    pub fn send(&self, msg: ServerMessage) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(e) => {
                // Expected while the peer is going away
                debug!(conn_id = %self.id, error = %e, "Failed to queue notice");
                false
            }
        }
    }

    pub fn send_err(&self, message: impl Into<String>) -> bool {
        self.send(ServerMessage::error(message))
    }

    /// Mark closed. Returns false if it was already closed.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Manages all active connections
#[derive(Clone)]
pub struct ConnectionManager {
    connections: Arc<DashMap<Uuid, Arc<Connection>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Register a new connection
    pub fn add(&self, conn: Arc<Connection>) {
        self.connections.insert(conn.id, conn);
    }

    pub fn remove(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.connections.remove(&id).map(|(_, conn)| conn)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|r| r.clone())
    }

    /// Snapshot of every registered connection
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    /// Connections currently bound to the given identity
    pub fn count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
