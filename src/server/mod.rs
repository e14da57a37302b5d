//! Busgate server core
//!
//! Greets connections, authenticates them, enforces publish and subscribe
//! permissions, and applies configuration reloads to live connections.
//! Transport and wire framing live outside this crate: a connection worker
//! feeds decoded messages in and drains `ServerMessage`s from its channel.

mod connections;
mod protocol;
mod sublist;

pub use connections::{
    Connection, ConnectionKind, ConnectionManager, Identity, Subscription, TlsState,
};
pub use protocol::{
    ConnectOptions, PermissionViolation, ServerInfo, ServerMessage, AUTHORIZATION_VIOLATION,
};
pub use sublist::{SubList, SubListError, SubscriptionIndex};

use crate::auth::{Authorizer, Decision, Nonce};
use crate::config::{AuthOptions, ConfigError};
use crate::subjects::{Subject, SubjectError, SubjectPattern};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A refused publish, subscribe or unsubscribe
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("connection is closed")]
    Closed,

    #[error("connection is not authenticated")]
    NotAuthenticated,

    #[error("invalid subject: {0}")]
    InvalidSubject(#[from] SubjectError),

    #[error(transparent)]
    Permission(#[from] PermissionViolation),
}

/// What a reload did to live connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadReport {
    /// Connections closed because their identity no longer authenticates
    pub closed: usize,
    /// Subscriptions removed from connections that stayed open
    pub removed_subscriptions: usize,
}

/// The server side of authentication and authorization
pub struct AuthServer {
    server_id: String,
    authorizer: Authorizer,
    connections: ConnectionManager,
    sublist: Arc<dyn SubscriptionIndex>,
}

impl AuthServer {
    pub fn new(opts: AuthOptions) -> Result<Self, ConfigError> {
        Self::with_index(opts, Arc::new(SubList::new()))
    }

    /// Build a server that removes revoked subscriptions from `sublist`
    pub fn with_index(
        opts: AuthOptions,
        sublist: Arc<dyn SubscriptionIndex>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            server_id: Uuid::new_v4().simple().to_string(),
            authorizer: Authorizer::new(opts)?,
            connections: ConnectionManager::new(),
            sublist,
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn authorizer(&self) -> &Authorizer {
        &self.authorizer
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn sublist(&self) -> Arc<dyn SubscriptionIndex> {
        self.sublist.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.count()
    }

    pub fn auth_required(&self) -> bool {
        self.authorizer.auth_required()
    }

    /// Register a new connection and queue its greeting
    ///
    /// Clients get a fresh nonce whenever auth is required.
    pub fn accept_connection(
        &self,
        kind: ConnectionKind,
        tx: mpsc::Sender<ServerMessage>,
    ) -> (Arc<Connection>, ServerInfo) {
        let auth_required = self.authorizer.auth_required();
        let nonce = (auth_required && kind == ConnectionKind::Client).then(Nonce::generate);

        let conn = Arc::new(Connection::new(kind, nonce, tx));
        let info = ServerInfo {
            server_id: self.server_id.clone(),
            client_id: conn.id.to_string(),
            auth_required,
            nonce: conn.nonce(),
        };

        self.connections.add(conn.clone());
        conn.send(ServerMessage::Info(info.clone()));
        debug!(conn_id = %conn.id, kind = %kind, auth_required, "Connection accepted");

        (conn, info)
    }

    /// Apply a connect message
    ///
    /// A rejected connection gets the generic violation notice and is closed.
    pub fn authenticate(&self, conn: &Connection, options: ConnectOptions) -> Decision {
        let verbose = options.verbose;
        conn.set_options(options);

        let decision = self.authorizer.check(conn);
        if decision.is_accepted() {
            if verbose {
                conn.send(ServerMessage::Ok);
            }
        } else {
            conn.send_err(AUTHORIZATION_VIOLATION);
            self.close_connection(conn, "authentication failed");
        }
        decision
    }

    pub fn subscribe(
        &self,
        conn: &Connection,
        sid: impl Into<String>,
        subject: &str,
    ) -> Result<Arc<Subscription>, OperationError> {
        if conn.is_closed() {
            return Err(OperationError::Closed);
        }
        if !conn.is_authenticated() {
            return Err(OperationError::NotAuthenticated);
        }
        let sid = sid.into();
        let pattern = SubjectPattern::parse(subject)?;

        if !conn.can_subscribe(&pattern) {
            let violation = PermissionViolation::Subscription {
                subject: pattern.to_string(),
                sid,
            };
            conn.send_err(violation.to_string());
            return Err(violation.into());
        }

        let sub = Arc::new(Subscription {
            conn_id: conn.id,
            sid,
            subject: pattern,
        });
        // Index first: a sweep only sees what the connection holds, and
        // re-using a sid replaces the index entry in place.
        self.sublist.insert(sub.clone());
        conn.add_subscription(sub.clone());

        // Closed after the check above; the close may have missed this entry
        if conn.is_closed() {
            let _ = self.sublist.remove(&sub);
            conn.drop_subscription(&sub);
            return Err(OperationError::Closed);
        }

        // Permissions may have been narrowed by a reload since the check above
        if !conn.can_subscribe(&sub.subject) {
            self.revoke(conn, &sub);
            return Err(PermissionViolation::Subscription {
                subject: sub.subject.to_string(),
                sid: sub.sid.clone(),
            }
            .into());
        }

        Ok(sub)
    }

    pub fn unsubscribe(&self, conn: &Connection, sid: &str) -> bool {
        match conn.remove_subscription(sid) {
            Some(sub) => {
                if let Err(e) = self.sublist.remove(&sub) {
                    debug!(conn_id = %conn.id, error = %e, "Unsubscribe found no index entry");
                }
                true
            }
            None => false,
        }
    }

    /// Check a publish and return the subscriptions it would reach
    pub fn publish(
        &self,
        conn: &Connection,
        subject: &str,
    ) -> Result<Vec<Arc<Subscription>>, OperationError> {
        if conn.is_closed() {
            return Err(OperationError::Closed);
        }
        if !conn.is_authenticated() {
            return Err(OperationError::NotAuthenticated);
        }
        let subject = Subject::parse(subject)?;

        if !conn.can_publish(&subject) {
            let violation = PermissionViolation::Publish {
                subject: subject.to_string(),
            };
            conn.send_err(violation.to_string());
            return Err(violation.into());
        }

        Ok(self.sublist.matches(&subject))
    }

    /// Remove every subscription the connection's bound permissions no longer allow
    ///
    /// Each removal sends a violation notice. Returns the number removed;
    /// a second sweep over the same state removes nothing.
    pub fn remove_unauthorized_subs(&self, conn: &Connection) -> usize {
        let Some(permissions) = conn.permissions() else {
            return 0;
        };

        let mut removed = 0;
        for sub in conn.subscriptions() {
            if !permissions.can_subscribe(&sub.subject) && self.revoke(conn, &sub) {
                removed += 1;
            }
        }
        removed
    }

    /// Replace the configuration and re-check every live connection
    ///
    /// Connections whose identity no longer authenticates are closed; the
    /// rest have their permissions re-bound and are swept. An invalid
    /// configuration is rejected and the current one stays active.
    pub fn reload(&self, opts: AuthOptions) -> Result<ReloadReport, ConfigError> {
        self.authorizer.configure(opts)?;

        let mut report = ReloadReport::default();
        for conn in self.connections.all() {
            if conn.is_closed() || !conn.is_authenticated() {
                continue;
            }
            if !self.authorizer.revalidate(&conn) {
                conn.send_err(AUTHORIZATION_VIOLATION);
                self.close_connection(&conn, "authorization revoked");
                report.closed += 1;
                continue;
            }
            report.removed_subscriptions += self.remove_unauthorized_subs(&conn);
        }

        info!(
            closed = report.closed,
            removed_subscriptions = report.removed_subscriptions,
            "Configuration reloaded"
        );
        Ok(report)
    }

    /// Close a connection and drop its subscriptions from the index
    pub fn close_connection(&self, conn: &Connection, reason: &str) {
        if !conn.mark_closed() {
            return;
        }
        for sub in conn.clear_subscriptions() {
            let _ = self.sublist.remove(&sub);
        }
        self.connections.remove(conn.id);
        warn!(conn_id = %conn.id, kind = %conn.kind, reason, "Connection closed");
    }

    /// Remove one subscription from the index and the connection, then notify
    fn revoke(&self, conn: &Connection, sub: &Arc<Subscription>) -> bool {
        // A missing index entry only means an earlier sweep got there first
        let _ = self.sublist.remove(sub);
        if !conn.drop_subscription(sub) {
            return false;
        }

        let violation = PermissionViolation::Subscription {
            subject: sub.subject.to_string(),
            sid: sub.sid.clone(),
        };
        conn.send_err(violation.to_string());
        info!(conn_id = %conn.id, subject = %sub.subject, sid = %sub.sid, "Removed unauthorized subscription");
        true
    }
}

impl std::fmt::Debug for AuthServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthServer")
            .field("server_id", &self.server_id)
            .field("connections", &self.connections.count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Permissions, SubjectPermission, User};

    fn pat(s: &str) -> SubjectPattern {
        SubjectPattern::parse(s).unwrap()
    }

    fn alice(perms: Permissions) -> AuthOptions {
        AuthOptions::new().with_users([User::new("alice", "secret").with_permissions(perms)])
    }

    fn login(server: &AuthServer) -> (Arc<Connection>, mpsc::Receiver<ServerMessage>) {
        let (tx, mut rx) = mpsc::channel(32);
        let (conn, _) = server.accept_connection(ConnectionKind::Client, tx);
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Info(_))));
        assert!(server
            .authenticate(&conn, ConnectOptions::default().with_user("alice", "secret"))
            .is_accepted());
        (conn, rx)
    }

    #[test]
    fn test_greeting_carries_nonce_only_when_required() {
        let server = AuthServer::new(AuthOptions::new()).unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let (_, info) = server.accept_connection(ConnectionKind::Client, tx);
        assert!(!info.auth_required);
        assert!(info.nonce.is_none());

        let server = AuthServer::new(AuthOptions::new().with_token("T")).unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let (conn, info) = server.accept_connection(ConnectionKind::Client, tx);
        assert!(info.auth_required);
        assert_eq!(info.nonce, conn.nonce());
        assert!(info.nonce.is_some());
        assert_eq!(info.server_id, server.server_id());
    }

    #[test]
    fn test_rejection_notifies_and_closes() {
        let server = AuthServer::new(AuthOptions::new().with_token("T")).unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let (conn, _) = server.accept_connection(ConnectionKind::Client, tx);
        let _ = rx.try_recv();

        let decision = server.authenticate(&conn, ConnectOptions::default().with_token("nope"));
        assert!(!decision.is_accepted());
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::error(AUTHORIZATION_VIOLATION));
        assert!(conn.is_closed());
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_verbose_connect_gets_ok() {
        let server = AuthServer::new(AuthOptions::new()).unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let (conn, _) = server.accept_connection(ConnectionKind::Client, tx);
        let _ = rx.try_recv();

        let options = ConnectOptions {
            verbose: true,
            ..Default::default()
        };
        assert!(server.authenticate(&conn, options).is_accepted());
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::Ok);
    }

    #[test]
    fn test_operations_require_authentication() {
        let server = AuthServer::new(AuthOptions::new().with_token("T")).unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let (conn, _) = server.accept_connection(ConnectionKind::Client, tx);

        assert_eq!(
            server.subscribe(&conn, "1", "a").unwrap_err(),
            OperationError::NotAuthenticated
        );
        assert_eq!(
            server.publish(&conn, "a").unwrap_err(),
            OperationError::NotAuthenticated
        );
    }

    #[test]
    fn test_subscribe_denied_sends_violation() {
        let perms = Permissions::new().with_subscribe(SubjectPermission::allow([pat("a.*")]));
        let server = AuthServer::new(alice(perms)).unwrap();
        let (conn, mut rx) = login(&server);

        assert!(server.subscribe(&conn, "1", "a.b").is_ok());
        let err = server.subscribe(&conn, "2", "b.c").unwrap_err();
        assert!(matches!(err, OperationError::Permission(_)));
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerMessage::error("Permissions Violation for Subscription to \"b.c\" (sid 2)")
        );
        assert_eq!(conn.subscription_count(), 1);
        assert_eq!(server.sublist().count(), 1);
    }

    #[test]
    fn test_publish_routes_to_matching_subscriptions() {
        let perms = Permissions::new().with_publish(SubjectPermission::deny([pat("secret.>")]));
        let server = AuthServer::new(alice(perms)).unwrap();
        let (conn, mut rx) = login(&server);
        server.subscribe(&conn, "1", "news.*").unwrap();

        assert_eq!(server.publish(&conn, "news.today").unwrap().len(), 1);
        assert!(server.publish(&conn, "weather").unwrap().is_empty());
        assert!(matches!(
            server.publish(&conn, "news.*"),
            Err(OperationError::InvalidSubject(_))
        ));

        assert!(server.publish(&conn, "secret.plans").is_err());
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerMessage::error("Permissions Violation for Publish to \"secret.plans\"")
        );
    }

    #[test]
    fn test_unsubscribe() {
        let server = AuthServer::new(alice(Permissions::new())).unwrap();
        let (conn, _rx) = login(&server);
        server.subscribe(&conn, "1", "a").unwrap();

        assert!(server.unsubscribe(&conn, "1"));
        assert!(!server.unsubscribe(&conn, "1"));
        assert_eq!(server.sublist().count(), 0);
    }

    #[test]
    fn test_resubscribe_same_sid_replaces_index_entry() {
        let server = AuthServer::new(alice(Permissions::new())).unwrap();
        let (conn, _rx) = login(&server);
        server.subscribe(&conn, "1", "a").unwrap();
        server.subscribe(&conn, "1", "b").unwrap();

        assert_eq!(server.sublist().count(), 1);
        assert_eq!(conn.subscriptions()[0].subject, pat("b"));
    }

    #[test]
    fn test_sweep_without_permissions_is_noop() {
        let server = AuthServer::new(AuthOptions::new()).unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let (conn, _) = server.accept_connection(ConnectionKind::Client, tx);
        server.authenticate(&conn, ConnectOptions::default());
        server.subscribe(&conn, "1", ">").unwrap();

        assert_eq!(server.remove_unauthorized_subs(&conn), 0);
        assert_eq!(conn.subscription_count(), 1);
    }

    #[test]
    fn test_reload_narrows_and_sweeps() {
        let server = AuthServer::new(alice(Permissions::new())).unwrap();
        let (conn, mut rx) = login(&server);
        server.subscribe(&conn, "1", "a.b").unwrap();
        server.subscribe(&conn, "2", "c.d").unwrap();

        let narrow = Permissions::new().with_subscribe(SubjectPermission::allow([pat("a.*")]));
        let report = server.reload(alice(narrow)).unwrap();
        assert_eq!(
            report,
            ReloadReport {
                closed: 0,
                removed_subscriptions: 1
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerMessage::error("Permissions Violation for Subscription to \"c.d\" (sid 2)")
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(server.sublist().count(), 1);

        assert_eq!(server.remove_unauthorized_subs(&conn), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_close_drops_index_entries() {
        let server = AuthServer::new(alice(Permissions::new())).unwrap();
        let (conn, _rx) = login(&server);
        server.subscribe(&conn, "1", "a").unwrap();

        server.close_connection(&conn, "test");
        assert_eq!(server.sublist().count(), 0);
        assert_eq!(conn.subscription_count(), 0);
        assert!(server.connections().get(conn.id).is_none());
    }

    /// Index that closes a connection while its subscription is being inserted
    struct ClosingIndex {
        inner: SubList,
        target: parking_lot::Mutex<Option<Arc<Connection>>>,
    }

    impl SubscriptionIndex for ClosingIndex {
        fn insert(&self, sub: Arc<Subscription>) {
            if let Some(conn) = self.target.lock().take() {
                conn.mark_closed();
            }
            self.inner.insert(sub);
        }

        fn remove(&self, sub: &Subscription) -> Result<(), SubListError> {
            self.inner.remove(sub)
        }

        fn matches(&self, subject: &Subject) -> Vec<Arc<Subscription>> {
            self.inner.matches(subject)
        }

        fn count(&self) -> usize {
            self.inner.count()
        }
    }

    #[test]
    fn test_subscribe_rolls_back_when_closed_midway() {
        let index = Arc::new(ClosingIndex {
            inner: SubList::new(),
            target: parking_lot::Mutex::new(None),
        });
        let server = AuthServer::with_index(alice(Permissions::new()), index.clone()).unwrap();
        let (conn, _rx) = login(&server);
        *index.target.lock() = Some(conn.clone());

        assert_eq!(
            server.subscribe(&conn, "1", "orders.>").unwrap_err(),
            OperationError::Closed
        );
        assert_eq!(index.count(), 0);
        assert_eq!(conn.subscription_count(), 0);
    }

    #[test]
    fn test_revoked_connection_cannot_subscribe_or_publish() {
        let server = AuthServer::new(alice(Permissions::new())).unwrap();
        let (conn, _rx) = login(&server);
        server.subscribe(&conn, "1", "orders.created").unwrap();

        let report = server
            .reload(AuthOptions::new().with_users([User::new("bob", "x")]))
            .unwrap();
        assert_eq!(report.closed, 1);
        assert!(conn.is_closed());

        assert_eq!(
            server.subscribe(&conn, "2", "orders.>").unwrap_err(),
            OperationError::Closed
        );
        assert_eq!(
            server.publish(&conn, "orders.created").unwrap_err(),
            OperationError::Closed
        );
        assert_eq!(server.sublist().count(), 0);
        assert_eq!(conn.subscription_count(), 0);

        // Nothing published elsewhere reaches the revoked connection
        let (tx, _bob_rx) = mpsc::channel(8);
        let (bob, _) = server.accept_connection(ConnectionKind::Client, tx);
        assert!(server
            .authenticate(&bob, ConnectOptions::default().with_user("bob", "x"))
            .is_accepted());
        assert!(server.publish(&bob, "orders.created").unwrap().is_empty());
    }
}
