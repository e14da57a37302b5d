//! Subject naming and pattern matching
//!
//! Subjects are dot-separated tokens: `orders.eu.created`
//! Tokens are non-empty and contain no whitespace.
//!
//! Patterns may use two wildcards, each occupying a whole token:
//! - `*` matches exactly one token: `orders.*` matches `orders.eu` but not `orders.eu.created`
//! - `>` matches one or more trailing tokens and must be last: `orders.>` matches both

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const SINGLE_WILDCARD: &str = "*";
const FULL_WILDCARD: &str = ">";

fn is_valid_token(s: &str) -> bool {
    !s.is_empty() && !s.chars().any(|c| c.is_whitespace() || c.is_control())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubjectError {
    #[error("subject cannot be empty")]
    Empty,

    #[error("empty token in subject")]
    EmptyToken,

    #[error("invalid token '{0}': whitespace and control characters are not allowed")]
    InvalidToken(String),

    #[error("wildcard '{0}' is not allowed in a literal subject")]
    WildcardInLiteral(String),

    #[error("full wildcard '>' can only appear as the last token")]
    FullWildcardNotLast,
}

fn check_token(token: &str) -> Result<(), SubjectError> {
    if token.is_empty() {
        return Err(SubjectError::EmptyToken);
    }
    if !is_valid_token(token) {
        return Err(SubjectError::InvalidToken(token.to_string()));
    }
    Ok(())
}

/// A validated literal subject (no wildcards), as used for publishing
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subject {
    name: String,
}

impl Subject {
    /// Parse and validate a literal subject
    pub fn parse(name: &str) -> Result<Self, SubjectError> {
        if name.is_empty() {
            return Err(SubjectError::Empty);
        }

        for token in name.split('.') {
            check_token(token)?;
            if token == SINGLE_WILDCARD || token == FULL_WILDCARD {
                return Err(SubjectError::WildcardInLiteral(token.to_string()));
            }
        }

        Ok(Self {
            name: name.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.name.split('.')
    }

    /// View this subject as a pattern that matches only itself
    pub fn to_pattern(&self) -> SubjectPattern {
        SubjectPattern {
            name: self.name.clone(),
            tokens: self.tokens().map(|t| Token::Literal(t.to_string())).collect(),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Token {
    Literal(String),
    /// `*`
    Single,
    /// `>`
    Full,
}

/// A subject pattern that may include `*` and `>` wildcards
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectPattern {
    name: String,
    tokens: Vec<Token>,
}

impl SubjectPattern {
    /// Parse a subject pattern
    pub fn parse(pattern: &str) -> Result<Self, SubjectError> {
        if pattern.is_empty() {
            return Err(SubjectError::Empty);
        }

        let raw: Vec<&str> = pattern.split('.').collect();
        let mut tokens = Vec::with_capacity(raw.len());

        for (i, part) in raw.iter().enumerate() {
            check_token(part)?;
            let token = match *part {
                SINGLE_WILDCARD => Token::Single,
                FULL_WILDCARD => {
                    if i + 1 != raw.len() {
                        return Err(SubjectError::FullWildcardNotLast);
                    }
                    Token::Full
                }
                literal => Token::Literal(literal.to_string()),
            };
            tokens.push(token);
        }

        Ok(Self {
            name: pattern.to_string(),
            tokens,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// True if the pattern has no wildcard tokens
    pub fn is_literal(&self) -> bool {
        self.tokens.iter().all(|t| matches!(t, Token::Literal(_)))
    }

    /// Check if this pattern matches a literal subject
    pub fn matches(&self, subject: &Subject) -> bool {
        let subject: Vec<&str> = subject.tokens().collect();

        for (i, token) in self.tokens.iter().enumerate() {
            match token {
                Token::Full => return subject.len() > i,
                Token::Single => {
                    if i >= subject.len() {
                        return false;
                    }
                }
                Token::Literal(lit) => {
                    if subject.get(i) != Some(&lit.as_str()) {
                        return false;
                    }
                }
            }
        }

        self.tokens.len() == subject.len()
    }

    /// Check if every subject matched by `other` is also matched by this pattern
    ///
    /// `orders.>` covers `orders.*` and `orders.eu.created`; `orders.*` does not cover `orders.>`.
    pub fn covers(&self, other: &SubjectPattern) -> bool {
        for (i, token) in self.tokens.iter().enumerate() {
            match token {
                Token::Full => return other.tokens.len() > i,
                Token::Single => match other.tokens.get(i) {
                    Some(Token::Literal(_)) | Some(Token::Single) => {}
                    Some(Token::Full) | None => return false,
                },
                Token::Literal(lit) => match other.tokens.get(i) {
                    Some(Token::Literal(o)) if o == lit => {}
                    _ => return false,
                },
            }
        }

        self.tokens.len() == other.tokens.len()
    }

    /// Check if at least one subject is matched by both patterns
    pub fn intersects(&self, other: &SubjectPattern) -> bool {
        let mut i = 0;
        loop {
            match (self.tokens.get(i), other.tokens.get(i)) {
                (None, None) => return true,
                (Some(Token::Full), Some(_)) | (Some(_), Some(Token::Full)) => return true,
                (None, _) | (_, None) => return false,
                (Some(Token::Literal(a)), Some(Token::Literal(b))) if a != b => return false,
                _ => {}
            }
            i += 1;
        }
    }
}

impl fmt::Display for SubjectPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl TryFrom<String> for SubjectPattern {
    type Error = SubjectError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SubjectPattern::parse(&value)
    }
}

impl From<SubjectPattern> for String {
    fn from(pattern: SubjectPattern) -> Self {
        pattern.name
    }
}

impl From<&Subject> for SubjectPattern {
    fn from(subject: &Subject) -> Self {
        subject.to_pattern()
    }
}
