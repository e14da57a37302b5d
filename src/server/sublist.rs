//! Subscription index used for message routing

use crate::server::connections::Subscription;
use crate::subjects::Subject;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubListError {
    #[error("subscription {sid} of connection {conn_id} is not indexed")]
    NotFound { conn_id: Uuid, sid: String },
}

/// The routing side of subscriptions
///
/// Implementations guard their own state; callers never hold a connection
/// lock while calling in.
pub trait SubscriptionIndex: Send + Sync {
    fn insert(&self, sub: Arc<Subscription>);

    fn remove(&self, sub: &Subscription) -> Result<(), SubListError>;

    /// Subscriptions whose pattern matches a published subject
    fn matches(&self, subject: &Subject) -> Vec<Arc<Subscription>>;

    fn count(&self) -> usize;
}

/// In-memory subscription index keyed by connection and sid
#[derive(Debug, Default)]
pub struct SubList {
    subs: RwLock<HashMap<(Uuid, String), Arc<Subscription>>>,
}

impl SubList {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubscriptionIndex for SubList {
    fn insert(&self, sub: Arc<Subscription>) {
        self.subs
            .write()
            .insert((sub.conn_id, sub.sid.clone()), sub);
    }

    fn remove(&self, sub: &Subscription) -> Result<(), SubListError> {
        let key = (sub.conn_id, sub.sid.clone());
        let mut subs = self.subs.write();
        // A sid re-used for another subject is a different subscription
        let indexed = subs.get(&key).is_some_and(|current| **current == *sub);
        if !indexed {
            return Err(SubListError::NotFound {
                conn_id: sub.conn_id,
                sid: sub.sid.clone(),
            });
        }
        subs.remove(&key);
        Ok(())
    }

    fn matches(&self, subject: &Subject) -> Vec<Arc<Subscription>> {
        self.subs
            .read()
            .values()
            .filter(|sub| sub.subject.matches(subject))
            .cloned()
            .collect()
    }

    fn count(&self) -> usize {
        self.subs.read().len()
    }
}
