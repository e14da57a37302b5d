//! Configured identities

use crate::auth::permissions::Permissions;
use crate::config::{AuthOptions, ConfigError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// A username/password identity
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "user")]
    pub username: String,
    /// Plaintext or bcrypt hash
    pub password: String,
    #[serde(default)]
    pub permissions: Option<Permissions>,
}

impl User {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            permissions: None,
        }
    }

    pub fn with_permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = Some(permissions);
        self
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("permissions", &self.permissions)
            .finish()
    }
}

/// A public-key identity. Trust comes from the nonce signature alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyUser {
    #[serde(rename = "nkey")]
    pub public_key: String,
    #[serde(default)]
    pub permissions: Option<Permissions>,
}

impl PublicKeyUser {
    pub fn new(public_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            permissions: None,
        }
    }

    pub fn with_permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = Some(permissions);
        self
    }
}

/// Lookup tables built from `AuthOptions`
///
/// A table is `None` when nothing of that kind is configured. The store has no
/// mutation API; a reload builds a new one.
#[derive(Debug, Default)]
pub struct CredentialStore {
    users: Option<HashMap<String, Arc<User>>>,
    public_keys: Option<HashMap<String, Arc<PublicKeyUser>>>,
}

impl CredentialStore {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build the store. When two records share an identity the later one wins.
    pub fn from_options(opts: &AuthOptions) -> Result<Self, ConfigError> {
        opts.validate()?;

        let public_keys = if opts.public_keys.is_empty() {
            None
        } else {
            let mut map = HashMap::with_capacity(opts.public_keys.len());
            for key in &opts.public_keys {
                if map
                    .insert(key.public_key.clone(), Arc::new(key.clone()))
                    .is_some()
                {
                    warn!(public_key = %key.public_key, "Duplicate public key in config, last entry wins");
                }
            }
            Some(map)
        };

        let users = if opts.users.is_empty() {
            None
        } else {
            let mut map = HashMap::with_capacity(opts.users.len());
            for user in &opts.users {
                if map
                    .insert(user.username.clone(), Arc::new(user.clone()))
                    .is_some()
                {
                    warn!(user = %user.username, "Duplicate user in config, last entry wins");
                }
            }
            Some(map)
        };

        Ok(Self { users, public_keys })
    }

    pub fn has_users(&self) -> bool {
        self.users.is_some()
    }

    pub fn has_public_keys(&self) -> bool {
        self.public_keys.is_some()
    }

    pub fn lookup_user(&self, username: &str) -> Option<Arc<User>> {
        self.users.as_ref()?.get(username).cloned()
    }

    pub fn lookup_public_key(&self, public_key: &str) -> Option<Arc<PublicKeyUser>> {
        self.public_keys.as_ref()?.get(public_key).cloned()
    }

    pub fn user_count(&self) -> usize {
        self.users.as_ref().map_or(0, HashMap::len)
    }

    pub fn public_key_count(&self) -> usize {
        self.public_keys.as_ref().map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::nonce::IdentityKeyPair;
    use crate::auth::permissions::SubjectPermission;
    use crate::subjects::SubjectPattern;

    #[test]
    fn test_empty_options_build_empty_store() {
        let store = CredentialStore::from_options(&AuthOptions::new()).unwrap();
        assert!(!store.has_users());
        assert!(!store.has_public_keys());
        assert!(store.lookup_user("alice").is_none());
    }

    #[test]
    fn test_lookup() {
        let kp = IdentityKeyPair::generate();
        let pk = kp.public_identity().encode();
        let opts = AuthOptions::new()
            .with_users([User::new("alice", "secret"), User::new("bob", "hunter2")])
            .with_public_keys([PublicKeyUser::new(pk.clone())]);

        let store = CredentialStore::from_options(&opts).unwrap();
        assert_eq!(store.user_count(), 2);
        assert_eq!(store.public_key_count(), 1);
        assert_eq!(store.lookup_user("alice").unwrap().password, "secret");
        assert!(store.lookup_user("carol").is_none());
        assert!(store.lookup_public_key(&pk).is_some());
        assert!(store.lookup_public_key("pk-unknown").is_none());
    }

    #[test]
    fn test_duplicate_user_last_wins() {
        let opts = AuthOptions::new().with_users([
            User::new("alice", "first"),
            User::new("alice", "second"),
        ]);

        let store = CredentialStore::from_options(&opts).unwrap();
        assert_eq!(store.user_count(), 1);
        assert_eq!(store.lookup_user("alice").unwrap().password, "second");
    }

    #[test]
    fn test_invalid_options_rejected() {
        let opts = AuthOptions::new().with_public_keys([PublicKeyUser::new("garbage")]);
        assert!(CredentialStore::from_options(&opts).is_err());
    }

    #[test]
    fn test_store_records_are_independent_of_options() {
        let perms = Permissions::new()
            .with_subscribe(SubjectPermission::allow([SubjectPattern::parse("a.*").unwrap()]));
        let mut opts =
            AuthOptions::new().with_users([User::new("alice", "x").with_permissions(perms.clone())]);
        let store = CredentialStore::from_options(&opts).unwrap();

        opts.users[0].permissions = None;
        assert_eq!(store.lookup_user("alice").unwrap().permissions, Some(perms));
    }

    #[test]
    fn test_user_debug_redacts_password() {
        let debug = format!("{:?}", User::new("alice", "topsecret"));
        assert!(debug.contains("alice"));
        assert!(!debug.contains("topsecret"));
    }
}
