//! Session resolution seam.
//!
//! The authentication subsystem is an external collaborator; this crate
//! only needs "give me the user id for this upgrade request". By the time
//! the registry's `opened` runs, the user id is already known and trusted.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use crate::registry::UserId;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("missing session token")]
    MissingToken,
    #[error("unknown session token")]
    UnknownToken,
}

/// Resolves the authenticated user for a transport upgrade request.
#[async_trait]
pub trait SessionAuth: Send + Sync {
    async fn resolve(&self, token: Option<&str>) -> Result<UserId, AuthError>;
}

/// Development-only auth: the session token itself is the user id, and a
/// missing token maps to `"local"`.
pub struct AnonymousAuth;

#[async_trait]
impl SessionAuth for AnonymousAuth {
    async fn resolve(&self, token: Option<&str>) -> Result<UserId, AuthError> {
        Ok(token.unwrap_or("local").to_string())
    }
}

/// Fixed token table, for tests and demos.
pub struct StaticTokenAuth {
    tokens: HashMap<String, UserId>,
}

impl StaticTokenAuth {
    pub fn new(tokens: impl IntoIterator<Item = (String, UserId)>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

#[async_trait]
impl SessionAuth for StaticTokenAuth {
    async fn resolve(&self, token: Option<&str>) -> Result<UserId, AuthError> {
        let token = token.ok_or(AuthError::MissingToken)?;
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::UnknownToken)
    }
}
