//! Authentication and authorization
//!
//! Client strategies, in priority order:
//! - custom: a pluggable `Authenticator` decides everything
//! - public key: `pk-` identity plus an Ed25519 signature over the greeting nonce
//! - per-user: username lookup plus password compare
//! - token: one shared token
//! - shared user: one shared username/password pair
//!
//! Stored passwords and tokens may be plaintext or bcrypt (`$2a$`, `$2b$`, `$2y$`).
//!
//! Permissions restrict which subjects a connection may publish to and
//! subscribe on. No permissions bound means unrestricted.

mod engine;
mod nonce;
mod permissions;
mod secrets;
mod store;

pub use engine::{AuthOutcome, AuthSnapshot, Authenticator, Authorizer, ConnectionView, Decision, Rejection};
pub use nonce::{
    sign_nonce_with_seed, verify_signature, ChallengeError, IdentityKeyPair, Nonce,
    PublicKeyIdentity, NKEY_USER_PREFIX, NKEY_USER_SEED_PREFIX, NONCE_RAW_LEN,
};
pub use permissions::{Operation, Permissions, RoutePermissions, SubjectPermission};
pub use secrets::{compare, hash_secret, is_hashed};
pub use store::{CredentialStore, PublicKeyUser, User};
