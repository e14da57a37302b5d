//! Publish/subscribe permissions

use crate::subjects::{Subject, SubjectPattern};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operations governed by a permission set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Publish,
    Subscribe,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Publish => write!(f, "publish"),
            Operation::Subscribe => write!(f, "subscribe"),
        }
    }
}

/// Allow and deny lists for one operation
///
/// An absent or empty allow list allows everything; an absent or empty deny
/// list denies nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectPermission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow: Option<Vec<SubjectPattern>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny: Option<Vec<SubjectPattern>>,
}

impl SubjectPermission {
    pub fn allow(patterns: impl IntoIterator<Item = SubjectPattern>) -> Self {
        Self {
            allow: Some(patterns.into_iter().collect()),
            deny: None,
        }
    }

    pub fn deny(patterns: impl IntoIterator<Item = SubjectPattern>) -> Self {
        Self {
            allow: None,
            deny: Some(patterns.into_iter().collect()),
        }
    }

    /// Add deny patterns to an existing filter
    pub fn with_deny(mut self, patterns: impl IntoIterator<Item = SubjectPattern>) -> Self {
        self.deny
            .get_or_insert_with(Vec::new)
            .extend(patterns);
        self
    }

    /// Deny wins over allow. `denied` and `allowed` decide how a pattern applies.
    fn permits(
        &self,
        denied: impl Fn(&SubjectPattern) -> bool,
        allowed: impl Fn(&SubjectPattern) -> bool,
    ) -> bool {
        if let Some(deny) = &self.deny {
            if deny.iter().any(&denied) {
                return false;
            }
        }

        match &self.allow {
            Some(allow) if !allow.is_empty() => allow.iter().any(&allowed),
            _ => true,
        }
    }
}

/// Publish and subscribe permissions bound to a connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub publish: Option<SubjectPermission>,
    #[serde(default)]
    pub subscribe: Option<SubjectPermission>,
}

impl Permissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_publish(mut self, publish: SubjectPermission) -> Self {
        self.publish = Some(publish);
        self
    }

    pub fn with_subscribe(mut self, subscribe: SubjectPermission) -> Self {
        self.subscribe = Some(subscribe);
        self
    }

    /// Check if the operation is permitted on the given subject or pattern
    pub fn allows(&self, operation: Operation, subject: &SubjectPattern) -> bool {
        match operation {
            Operation::Publish => match &self.publish {
                Some(filter) => filter.permits(|p| p.covers(subject), |p| p.covers(subject)),
                None => true,
            },
            // A wildcard subscription is refused if any subject it could
            // receive is denied, and accepted only if one allow pattern
            // covers all of them.
            Operation::Subscribe => match &self.subscribe {
                Some(filter) => {
                    filter.permits(|p| p.intersects(subject), |p| p.covers(subject))
                }
                None => true,
            },
        }
    }

    pub fn can_publish(&self, subject: &Subject) -> bool {
        self.allows(Operation::Publish, &subject.to_pattern())
    }

    pub fn can_subscribe(&self, subject: &SubjectPattern) -> bool {
        self.allows(Operation::Subscribe, subject)
    }
}

/// Permissions for inter-broker routes
///
/// `import` governs what a remote server may send us, `export` what it may
/// receive from us.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutePermissions {
    #[serde(default)]
    pub import: Option<SubjectPermission>,
    #[serde(default)]
    pub export: Option<SubjectPermission>,
}

impl RoutePermissions {
    /// Express route permissions as connection permissions
    pub fn to_permissions(&self) -> Permissions {
        Permissions {
            publish: self.import.clone(),
            subscribe: self.export.clone(),
        }
    }
}
