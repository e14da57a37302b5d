//! Authorization decision engine
//!
//! `Authorizer::check` picks exactly one strategy for a connection from a
//! single `AuthSnapshot` of the configuration, then evaluates it with no
//! lock held.
//! Hashing and signature verification can be slow and must never stall a
//! reload or another connection's handshake.

use crate::auth::nonce::{verify_signature, ChallengeError};
use crate::auth::permissions::Permissions;
use crate::auth::secrets::compare;
use crate::auth::store::{CredentialStore, PublicKeyUser, User};
use crate::config::{AuthOptions, ConfigError};
use crate::server::{ConnectOptions, Connection, ConnectionKind, Identity, TlsState};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a custom authenticator gets to look at
#[derive(Debug, Clone, Copy)]
pub struct ConnectionView<'a> {
    pub id: Uuid,
    pub kind: ConnectionKind,
    pub options: &'a ConnectOptions,
    pub tls: Option<&'a TlsState>,
}

/// Verdict of a custom authenticator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Accept, optionally binding permissions
    Accept { permissions: Option<Permissions> },
    Reject,
}

impl AuthOutcome {
    pub fn accept() -> Self {
        AuthOutcome::Accept { permissions: None }
    }

    pub fn accept_with(permissions: Permissions) -> Self {
        AuthOutcome::Accept {
            permissions: Some(permissions),
        }
    }
}

/// A pluggable authenticator that replaces all built-in client (or route) strategies
pub trait Authenticator: Send + Sync {
    fn check(&self, conn: &ConnectionView<'_>) -> AuthOutcome;
}

impl<F> Authenticator for F
where
    F: Fn(&ConnectionView<'_>) -> AuthOutcome + Send + Sync,
{
    fn check(&self, conn: &ConnectionView<'_>) -> AuthOutcome {
        self(conn)
    }
}

/// Why a connection was refused. Logged locally, never sent to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("custom authenticator refused the connection")]
    CustomRejected,

    #[error("unknown public key")]
    UnknownPublicKey,

    #[error("public key presented without a signature")]
    MissingSignature,

    #[error("nonce challenge failed: {0}")]
    BadSignature(#[from] ChallengeError),

    #[error("unknown user")]
    UnknownUser,

    #[error("password mismatch")]
    BadPassword,

    #[error("token mismatch")]
    BadToken,

    #[error("no usable credentials presented")]
    NoCredentials,

    #[error("no authentication path for {0} connections")]
    UnsupportedKind(ConnectionKind),

    #[error("configuration changed during authentication and no longer admits the connection")]
    Revoked,
}

/// Result of `Authorizer::check`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept(Identity),
    Reject(Rejection),
}

impl Decision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Decision::Accept(_))
    }
}

/// The one strategy chosen for a connection
enum Strategy {
    Open,
    Custom(Arc<dyn Authenticator>),
    PublicKey(Arc<PublicKeyUser>),
    PerUser(Arc<User>),
    SharedToken(String),
    SharedUser {
        username: String,
        password: String,
    },
    Route {
        username: String,
        password: String,
        permissions: Option<Permissions>,
    },
    Refuse(Rejection),
}

type Verdict = Result<(Identity, Option<Permissions>), Rejection>;

/// One installed configuration. Replaced as a whole on reload.
#[derive(Debug)]
pub struct AuthSnapshot {
    pub options: Arc<AuthOptions>,
    pub store: Arc<CredentialStore>,
    pub auth_required: bool,
    /// Bumped by every successful `configure`
    pub generation: u64,
}

impl AuthSnapshot {
    fn select(&self, kind: ConnectionKind, options: &ConnectOptions) -> Strategy {
        match kind {
            ConnectionKind::Client => {
                select_client(&self.options, self.auth_required, &self.store, options)
            }
            ConnectionKind::Route => select_route(&self.options, options),
            ConnectionKind::Gateway => Strategy::Refuse(Rejection::UnsupportedKind(kind)),
        }
    }
}

/// Decides whether connections may proceed and with which permissions
pub struct Authorizer {
    snapshot: RwLock<Arc<AuthSnapshot>>,
}

impl Authorizer {
    pub fn new(opts: AuthOptions) -> Result<Self, ConfigError> {
        let authorizer = Self {
            snapshot: RwLock::new(Arc::new(AuthSnapshot {
                options: Arc::new(AuthOptions::default()),
                store: Arc::new(CredentialStore::empty()),
                auth_required: false,
                generation: 0,
            })),
        };
        authorizer.configure(opts)?;
        Ok(authorizer)
    }

    /// Validate and install a new configuration
    ///
    /// On error the previous configuration stays in place.
    pub fn configure(&self, opts: AuthOptions) -> Result<(), ConfigError> {
        let store = CredentialStore::from_options(&opts)?;
        if opts.has_plaintext_passwords() {
            warn!("Plaintext passwords detected, use bcrypt hashes in production");
        }

        let auth_required = opts.auth_required();
        let users = store.user_count();
        let public_keys = store.public_key_count();

        let generation = {
            let mut current = self.snapshot.write();
            let generation = current.generation + 1;
            *current = Arc::new(AuthSnapshot {
                options: Arc::new(opts),
                store: Arc::new(store),
                auth_required,
                generation,
            });
            generation
        };

        info!(auth_required, users, public_keys, generation, "Authorization configured");
        Ok(())
    }

    /// The configuration decisions are currently taken against
    pub fn snapshot(&self) -> Arc<AuthSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn auth_required(&self) -> bool {
        self.snapshot.read().auth_required
    }

    pub fn generation(&self) -> u64 {
        self.snapshot.read().generation
    }

    /// Current options snapshot
    pub fn options(&self) -> Arc<AuthOptions> {
        self.snapshot.read().options.clone()
    }

    /// Current credential store snapshot
    pub fn store(&self) -> Arc<CredentialStore> {
        self.snapshot.read().store.clone()
    }

    /// Authenticate a connection and bind its permissions on success
    ///
    /// A reload that lands while the strategy is being evaluated skips this
    /// connection, so once bound it is checked again against whatever is
    /// installed by then.
    pub fn check(&self, conn: &Connection) -> Decision {
        let options = conn.options();
        let snapshot = self.snapshot();
        let strategy = snapshot.select(conn.kind, &options);

        let (identity, permissions) = match self.evaluate(strategy, conn, &options) {
            Ok(verdict) => verdict,
            Err(reason) => {
                debug!(conn_id = %conn.id, kind = %conn.kind, reason = %reason, "Authentication rejected");
                return Decision::Reject(reason);
            }
        };
        conn.bind(identity, permissions);

        if self.generation() != snapshot.generation && !self.revalidate(conn) {
            conn.unbind();
            debug!(
                conn_id = %conn.id,
                kind = %conn.kind,
                generation = snapshot.generation,
                "Configuration changed during authentication"
            );
            return Decision::Reject(Rejection::Revoked);
        }

        let identity = conn.identity();
        info!(
            conn_id = %conn.id,
            kind = %conn.kind,
            identity = ?identity,
            restricted = conn.has_permissions(),
            "Connection authenticated"
        );
        Decision::Accept(identity)
    }

    /// Re-check an authenticated connection against the current configuration
    ///
    /// Public-key identities proved themselves at connect time and the nonce
    /// is gone, so they only need their key to still be configured. Everything
    /// else is decided again from the connection's retained options. On
    /// success the permissions are re-bound from the new records.
    pub fn revalidate(&self, conn: &Connection) -> bool {
        if !conn.is_authenticated() {
            return true;
        }

        let options = conn.options();
        let verdict = match self.snapshot().select(conn.kind, &options) {
            Strategy::PublicKey(record)
                if conn.identity() == Identity::PublicKey(record.public_key.clone()) =>
            {
                Ok((
                    Identity::PublicKey(record.public_key.clone()),
                    record.permissions.clone(),
                ))
            }
            strategy => self.evaluate(strategy, conn, &options),
        };

        match verdict {
            Ok((identity, permissions)) => {
                conn.bind(identity, permissions);
                true
            }
            Err(reason) => {
                debug!(conn_id = %conn.id, reason = %reason, "Connection failed revalidation");
                false
            }
        }
    }

    fn evaluate(&self, strategy: Strategy, conn: &Connection, options: &ConnectOptions) -> Verdict {
        match strategy {
            Strategy::Open => Ok((Identity::None, None)),
            Strategy::Custom(authenticator) => {
                let tls = conn.tls_state();
                let view = ConnectionView {
                    id: conn.id,
                    kind: conn.kind,
                    options,
                    tls: tls.as_ref(),
                };
                match authenticator.check(&view) {
                    AuthOutcome::Accept { permissions } => Ok((Identity::Custom, permissions)),
                    AuthOutcome::Reject => Err(Rejection::CustomRejected),
                }
            }
            Strategy::PublicKey(record) => {
                let signature = options.signature().ok_or(Rejection::MissingSignature)?;
                let nonce = conn.take_nonce().ok_or(ChallengeError::MissingNonce)?;
                verify_signature(&record.public_key, signature, &nonce)?;
                Ok((
                    Identity::PublicKey(record.public_key.clone()),
                    record.permissions.clone(),
                ))
            }
            Strategy::PerUser(user) => {
                if !compare(&user.password, options.password().unwrap_or_default()) {
                    return Err(Rejection::BadPassword);
                }
                Ok((Identity::User(user.username.clone()), user.permissions.clone()))
            }
            Strategy::SharedToken(token) => {
                if !compare(&token, options.auth_token().unwrap_or_default()) {
                    return Err(Rejection::BadToken);
                }
                Ok((Identity::Token, None))
            }
            Strategy::SharedUser { username, password } => {
                if !compare(&password, options.password().unwrap_or_default()) {
                    return Err(Rejection::BadPassword);
                }
                Ok((Identity::User(username), None))
            }
            Strategy::Route {
                username,
                password,
                permissions,
            } => {
                if !compare(&password, options.password().unwrap_or_default()) {
                    return Err(Rejection::BadPassword);
                }
                Ok((Identity::User(username), permissions))
            }
            Strategy::Refuse(reason) => Err(reason),
        }
    }
}

impl std::fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorizer")
            .field("auth_required", &self.auth_required())
            .finish_non_exhaustive()
    }
}

fn select_client(
    opts: &AuthOptions,
    auth_required: bool,
    store: &CredentialStore,
    options: &ConnectOptions,
) -> Strategy {
    if let Some(custom) = &opts.custom_client_auth {
        return Strategy::Custom(custom.clone());
    }
    if !auth_required {
        return Strategy::Open;
    }

    if store.has_public_keys() {
        if let Some(public_key) = options.public_key() {
            return match store.lookup_public_key(public_key) {
                Some(record) => Strategy::PublicKey(record),
                None => Strategy::Refuse(Rejection::UnknownPublicKey),
            };
        }
    }

    if store.has_users() {
        if let Some(username) = options.username() {
            return match store.lookup_user(username) {
                Some(user) => Strategy::PerUser(user),
                None => Strategy::Refuse(Rejection::UnknownUser),
            };
        }
    }

    if let Some(token) = &opts.token {
        return Strategy::SharedToken(token.clone());
    }

    if let Some(username) = &opts.username {
        if options.username() != Some(username.as_str()) {
            return Strategy::Refuse(Rejection::UnknownUser);
        }
        return Strategy::SharedUser {
            username: username.clone(),
            password: opts.password.clone().unwrap_or_default(),
        };
    }

    Strategy::Refuse(Rejection::NoCredentials)
}

fn select_route(opts: &AuthOptions, options: &ConnectOptions) -> Strategy {
    if let Some(custom) = &opts.custom_route_auth {
        return Strategy::Custom(custom.clone());
    }

    let cluster = &opts.cluster;
    match &cluster.username {
        Some(username) if options.username() != Some(username.as_str()) => {
            Strategy::Refuse(Rejection::UnknownUser)
        }
        Some(username) => Strategy::Route {
            username: username.clone(),
            password: cluster.password.clone().unwrap_or_default(),
            permissions: cluster.permissions.as_ref().map(|p| p.to_permissions()),
        },
        None => Strategy::Open,
    }
}
