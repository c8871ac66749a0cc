//! # Authentication
//!
//! Pluggable authentication handlers behind a common trait (§4.4, Design
//! Note on pluggable authentication). Grounded in
//! `irobot/authentication/_base.py::BaseAuthHandler`/`AuthenticatedUser`;
//! the cache-by-validation-time behaviour matches
//! `AuthenticatedUser.valid()` exactly — an entry expires at
//! `authenticated + cache_duration`, never re-measured from last use.

pub mod arvados;
pub mod basic;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::config::DurationLimit;
use crate::errors::{GatewayError, Result};

/// A successfully authenticated principal and when that authentication
/// happened (not when it was last used — §4.4).
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user: String,
    pub authenticated: DateTime<Utc>,
}

impl AuthenticatedUser {
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into(), authenticated: Utc::now() }
    }

    /// Whether this authentication is still within its cache window.
    pub fn valid(&self, cache: DurationLimit) -> bool {
        match cache {
            DurationLimit::Unlimited => true,
            DurationLimit::Finite(d) => {
                let age = Utc::now() - self.authenticated;
                age <= chrono::Duration::from_std(d).unwrap_or_default()
            }
        }
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Validate the contents of the `Authorization` header, returning the
    /// authenticated user on success.
    async fn authenticate(&self, auth_header: &str) -> Result<AuthenticatedUser>;

    /// The `WWW-Authenticate` challenge this handler issues on a 401.
    fn www_authenticate(&self) -> String;

    /// Whether this handler recognises the scheme of `auth_header` at all,
    /// used to pick between multiple configured handlers (§4.4).
    fn matches(&self, auth_header: &str) -> bool;
}

/// Cache of already-validated credentials, keyed by whatever the handler
/// considers its identity (a username, a bearer token). Expiry is checked
/// lazily on lookup rather than swept by a background timer — idiomatic
/// for a `DashMap`-backed cache and equivalent in effect.
pub(crate) struct AuthCache {
    entries: DashMap<String, AuthenticatedUser>,
    cache: DurationLimit,
}

impl AuthCache {
    pub fn new(cache: DurationLimit) -> Self {
        Self { entries: DashMap::new(), cache }
    }

    pub fn get(&self, key: &str) -> Option<AuthenticatedUser> {
        let hit = self.entries.get(key)?;
        if hit.valid(self.cache) {
            Some(hit.clone())
        } else {
            drop(hit);
            self.entries.remove(key);
            None
        }
    }

    pub fn insert(&self, key: String, user: AuthenticatedUser) {
        if !matches!(self.cache, DurationLimit::Finite(d) if d.is_zero()) {
            self.entries.insert(key, user);
        }
    }
}

/// Dispatch an `Authorization` header to the first handler that recognises
/// its scheme, 401ing with every handler's combined challenge if none do
/// or all reject it.
pub async fn authenticate_with(
    handlers: &[std::sync::Arc<dyn Authenticator>],
    auth_header: Option<&str>,
) -> Result<AuthenticatedUser> {
    let challenge = || handlers.iter().map(|h| h.www_authenticate()).collect::<Vec<_>>().join(", ");

    let Some(header) = auth_header else {
        return Err(GatewayError::Unauthorized(challenge()));
    };

    for handler in handlers {
        if handler.matches(header) {
            return handler.authenticate(header).await;
        }
    }

    Err(GatewayError::Unauthorized(challenge()))
}
