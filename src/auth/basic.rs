//! HTTP Basic authentication handler: validates credentials against an
//! upstream endpoint that accepts the same `Authorization: Basic ...`
//! header. Grounded in `irobot/authentication/basic.py` and
//! `http_basic.py`.

use async_trait::async_trait;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{AuthCache, AuthenticatedUser, Authenticator};
use crate::config::BasicAuthConfig;
use crate::errors::{GatewayError, Result};

static BASIC_AUTH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^Basic\s+((?:[a-z0-9+/]{4})*(?:[a-z0-9+/]{2}==|[a-z0-9+/]{3}=)?)$").unwrap()
});

pub struct BasicAuthHandler {
    http: reqwest::Client,
    config: BasicAuthConfig,
    cache: AuthCache,
}

impl BasicAuthHandler {
    pub fn new(config: BasicAuthConfig) -> Self {
        let cache = AuthCache::new(config.cache);
        Self { http: reqwest::Client::new(), config, cache }
    }

    fn parse(auth_header: &str) -> Result<(String, String)> {
        let captures = BASIC_AUTH_RE
            .captures(auth_header.trim())
            .ok_or_else(|| GatewayError::Unauthorized("Basic realm=\"irobot\"".to_string()))?;

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&captures[1])
            .map_err(|_| GatewayError::Unauthorized("Basic realm=\"irobot\"".to_string()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| GatewayError::Unauthorized("Basic realm=\"irobot\"".to_string()))?;

        let (user, password) = decoded
            .split_once(':')
            .ok_or_else(|| GatewayError::Unauthorized("Basic realm=\"irobot\"".to_string()))?;
        Ok((user.to_string(), password.to_string()))
    }
}

#[async_trait]
impl Authenticator for BasicAuthHandler {
    fn matches(&self, auth_header: &str) -> bool {
        auth_header.trim_start().to_ascii_lowercase().starts_with("basic ")
    }

    fn www_authenticate(&self) -> String {
        "Basic realm=\"irobot\"".to_string()
    }

    async fn authenticate(&self, auth_header: &str) -> Result<AuthenticatedUser> {
        let (user, password) = Self::parse(auth_header)?;

        if let Some(cached) = self.cache.get(&user) {
            tracing::debug!(user = %user, "authenticated from cache");
            return Ok(cached);
        }

        let response = self
            .http
            .get(&self.config.url)
            .basic_auth(&user, Some(&password))
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable(e.to_string()))?;

        if response.status().is_success() {
            let authenticated = AuthenticatedUser::new(&user);
            self.cache.insert(user.clone(), authenticated.clone());
            tracing::debug!(user = %user, "authenticated against upstream");
            Ok(authenticated)
        } else if response.status().as_u16() == 401 || response.status().as_u16() == 403 {
            Err(GatewayError::Unauthorized(self.www_authenticate()))
        } else {
            Err(GatewayError::UpstreamUnavailable(format!(
                "basic auth upstream returned {}",
                response.status()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_header() {
        let header = format!("Basic {}", base64::engine::general_purpose::STANDARD.encode("alice:s3cret"));
        let (user, password) = BasicAuthHandler::parse(&header).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(password, "s3cret");
    }

    #[test]
    fn rejects_malformed_header() {
        assert!(BasicAuthHandler::parse("Basic not-valid-base64!!").is_err());
        assert!(BasicAuthHandler::parse("Bearer abc").is_err());
    }
}
