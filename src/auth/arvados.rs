//! Arvados token authentication handler: validates an `Arvados <token>`
//! bearer-style header against the Arvados API's `users/current`
//! endpoint. Grounded in `irobot/authentication/arvados.py`.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use super::{AuthCache, AuthenticatedUser, Authenticator};
use crate::config::ArvadosAuthConfig;
use crate::errors::{GatewayError, Result};

static ARVADOS_AUTH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^Arvados\s+(.+)$").unwrap());

#[derive(Deserialize)]
struct CurrentUser {
    username: String,
}

pub struct ArvadosAuthHandler {
    http: reqwest::Client,
    config: ArvadosAuthConfig,
    cache: AuthCache,
}

impl ArvadosAuthHandler {
    pub fn new(config: ArvadosAuthConfig) -> Self {
        let cache = AuthCache::new(config.cache);
        Self { http: reqwest::Client::new(), config, cache }
    }

    fn parse(auth_header: &str) -> Result<String> {
        ARVADOS_AUTH_RE
            .captures(auth_header.trim())
            .map(|c| c[1].to_string())
            .ok_or_else(|| GatewayError::Unauthorized(Self::challenge_for(None)))
    }

    fn challenge_for(api_host: Option<&str>) -> String {
        format!("Bearer realm=\"{}\"", api_host.unwrap_or("arvados"))
    }

    fn current_user_url(&self) -> String {
        format!("https://{}/arvados/{}/users/current", self.config.api_host, self.config.api_version)
    }
}

#[async_trait]
impl Authenticator for ArvadosAuthHandler {
    fn matches(&self, auth_header: &str) -> bool {
        auth_header.trim_start().to_ascii_lowercase().starts_with("arvados ")
    }

    fn www_authenticate(&self) -> String {
        Self::challenge_for(Some(&self.config.api_host))
    }

    async fn authenticate(&self, auth_header: &str) -> Result<AuthenticatedUser> {
        let token = Self::parse(auth_header)?;

        if let Some(cached) = self.cache.get(&token) {
            tracing::debug!("authenticated arvados token from cache");
            return Ok(cached);
        }

        let response = self
            .http
            .get(self.current_user_url())
            .header("Authorization", format!("OAuth2 {token}"))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable(e.to_string()))?;

        if response.status().as_u16() == 200 {
            let current: CurrentUser = response
                .json()
                .await
                .map_err(|e| GatewayError::UpstreamUnavailable(e.to_string()))?;
            let authenticated = AuthenticatedUser::new(&current.username);
            self.cache.insert(token, authenticated.clone());
            Ok(authenticated)
        } else if response.status().as_u16() == 401 || response.status().as_u16() == 403 {
            Err(GatewayError::Unauthorized(self.www_authenticate()))
        } else {
            Err(GatewayError::UpstreamUnavailable(format!(
                "arvados auth upstream returned {}",
                response.status()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_token_from_header() {
        assert_eq!(ArvadosAuthHandler::parse("Arvados v2/abc123").unwrap(), "v2/abc123");
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(ArvadosAuthHandler::parse("Basic xyz").is_err());
    }
}
