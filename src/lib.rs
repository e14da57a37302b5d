//! Busgate - authentication and authorization core for a publish/subscribe broker
//!
//! Decides whether a connection may proceed, binds the permissions it gets,
//! and enforces them on publish and subscribe. Configuration reloads are
//! applied to live connections: revoked identities are disconnected and
//! subscriptions that are no longer permitted are removed.

pub mod auth;
pub mod config;
pub mod server;
pub mod subjects;

pub use auth::{Authenticator, AuthOutcome, Authorizer, Decision, Permissions, Rejection};
pub use config::{AuthOptions, ConfigError};
pub use server::{AuthServer, ConnectOptions, ConnectionKind, ReloadReport, ServerMessage};
pub use subjects::{Subject, SubjectPattern};
