//! Effective runtime configuration (§6).
//!
//! File-format parsing is an explicit external collaborator (§1 Out of
//! scope); what lives here is the shape configuration takes once parsed,
//! loaded from the environment with one `from_env()` constructor per
//! section, plus the small human-readable size/duration/expiry parsers
//! grounded in `irobot/config/_precache.py` and `_datetime_arithmetic.py`.

use std::time::Duration;

use serde::Serialize;

/// A size in bytes, or no limit at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SizeLimit {
    Bytes(u64),
    Unlimited,
}

impl SizeLimit {
    pub fn bytes(&self) -> Option<u64> {
        match self {
            SizeLimit::Bytes(b) => Some(*b),
            SizeLimit::Unlimited => None,
        }
    }
}

/// Parse a human size string (`"10MiB"`, `"512"`, `"2GB"`) into bytes.
/// Grounded in `irobot/common/parse_input.py`'s `human_size`.
pub fn parse_size(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let split_at = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split_at);

    let number: f64 = number
        .parse()
        .map_err(|_| format!("could not parse size \"{value}\""))?;

    let multiplier: f64 = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "k" | "kb" => 1_000.0,
        "ki" | "kib" => 1024.0,
        "m" | "mb" => 1_000_000.0,
        "mi" | "mib" => 1024.0 * 1024.0,
        "g" | "gb" => 1_000_000_000.0,
        "gi" | "gib" => 1024.0 * 1024.0 * 1024.0,
        "t" | "tb" => 1_000_000_000_000.0,
        "ti" | "tib" => 1024.0_f64.powi(4),
        other => return Err(format!("unrecognised size suffix \"{other}\"")),
    };

    Ok((number * multiplier).round() as u64)
}

/// Parse a size that may be the literal `"unlimited"`.
pub fn parse_size_limit(value: &str) -> Result<SizeLimit, String> {
    if value.trim().eq_ignore_ascii_case("unlimited") {
        return Ok(SizeLimit::Unlimited);
    }
    parse_size(value).map(SizeLimit::Bytes)
}

/// A duration, or no limit/expiry at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DurationLimit {
    Finite(Duration),
    Unlimited,
}

/// Parse an expiry string: `"unlimited"`, `"30d"`, `"2 years"`, `"1w"`, etc.
/// Grounded in `irobot/config/_precache.py::_parse_expiry`.
pub fn parse_expiry(value: &str) -> Result<DurationLimit, String> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("unlimited") {
        return Ok(DurationLimit::Unlimited);
    }

    let split_at = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| format!("could not parse expiry \"{value}\""))?;
    let (quantity, unit) = value.split_at(split_at);
    let quantity: f64 = quantity
        .parse()
        .map_err(|_| format!("could not parse expiry quantity in \"{value}\""))?;

    let unit = unit.trim().to_ascii_lowercase();
    let seconds_per_unit = if unit.starts_with('h') {
        3600.0
    } else if unit.starts_with('d') {
        86_400.0
    } else if unit.starts_with('w') {
        7.0 * 86_400.0
    } else if unit.starts_with('y') {
        365.25 * 86_400.0
    } else {
        return Err(format!("unrecognised expiry unit \"{unit}\""));
    };

    Ok(DurationLimit::Finite(Duration::from_secs_f64(quantity * seconds_per_unit)))
}

/// Parse a plain duration string (`"30s"`, `"5m"`, `"2h"`, `"unlimited"`).
pub fn parse_duration_limit(value: &str) -> Result<DurationLimit, String> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("unlimited") {
        return Ok(DurationLimit::Unlimited);
    }

    let split_at = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(value.len());
    let (quantity, unit) = value.split_at(split_at);
    let quantity: f64 = quantity
        .parse()
        .map_err(|_| format!("could not parse duration \"{value}\""))?;

    let seconds = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "s" | "sec" | "secs" => quantity,
        "ms" => quantity / 1000.0,
        "m" | "min" | "mins" => quantity * 60.0,
        "h" | "hour" | "hours" => quantity * 3600.0,
        other => return Err(format!("unrecognised duration unit \"{other}\"")),
    };

    Ok(DurationLimit::Finite(Duration::from_secs_f64(seconds)))
}

#[derive(Debug, Clone, Serialize)]
pub struct PrecacheConfig {
    pub location: std::path::PathBuf,
    pub index: std::path::PathBuf,
    pub size: SizeLimit,
    pub expiry: DurationLimit,
    pub chunk_size: u64,
}

impl PrecacheConfig {
    pub fn from_env() -> Self {
        let location = std::env::var("IROBOT_PRECACHE_LOCATION")
            .unwrap_or_else(|_| "/var/lib/irobot/precache".to_string())
            .into();
        let index = std::env::var("IROBOT_PRECACHE_INDEX")
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|_| {
                let mut p: std::path::PathBuf = std::path::PathBuf::from(&location);
                p.push(".precache.db");
                p
            });
        let size = std::env::var("IROBOT_PRECACHE_SIZE")
            .ok()
            .and_then(|v| parse_size_limit(&v).ok())
            .unwrap_or(SizeLimit::Unlimited);
        let expiry = std::env::var("IROBOT_PRECACHE_EXPIRY")
            .ok()
            .and_then(|v| parse_expiry(&v).ok())
            .unwrap_or(DurationLimit::Unlimited);
        let chunk_size = std::env::var("IROBOT_PRECACHE_CHUNK_SIZE")
            .ok()
            .and_then(|v| parse_size(&v).ok())
            .unwrap_or(64 * 1024 * 1024);

        Self { location, index, size, expiry, chunk_size }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IrodsConfig {
    pub max_connections: usize,
    pub base_url: String,
}

impl IrodsConfig {
    pub fn from_env() -> Self {
        Self {
            max_connections: std::env::var("IROBOT_IRODS_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            base_url: std::env::var("IROBOT_IRODS_URL")
                .unwrap_or_else(|_| "http://localhost:9998".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpdConfig {
    pub bind_address: std::net::Ipv4Addr,
    pub listen: u16,
    pub timeout: DurationLimit,
    pub authentication: Vec<String>,
}

impl HttpdConfig {
    pub fn from_env() -> Self {
        Self {
            bind_address: std::env::var("IROBOT_HTTPD_BIND")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(std::net::Ipv4Addr::new(0, 0, 0, 0)),
            listen: std::env::var("IROBOT_HTTPD_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5000),
            timeout: std::env::var("IROBOT_HTTPD_TIMEOUT")
                .ok()
                .and_then(|v| parse_duration_limit(&v).ok())
                .unwrap_or(DurationLimit::Finite(Duration::from_secs(60))),
            authentication: std::env::var("IROBOT_HTTPD_AUTHENTICATION")
                .unwrap_or_else(|_| "basic_auth".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BasicAuthConfig {
    pub url: String,
    pub cache: DurationLimit,
}

impl BasicAuthConfig {
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("IROBOT_BASIC_AUTH_URL")
                .unwrap_or_else(|_| "http://localhost:9999/validate".to_string()),
            cache: std::env::var("IROBOT_BASIC_AUTH_CACHE")
                .ok()
                .and_then(|v| parse_duration_limit(&v).ok())
                .unwrap_or(DurationLimit::Finite(Duration::from_secs(3600))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArvadosAuthConfig {
    pub api_host: String,
    pub api_version: String,
    pub cache: DurationLimit,
}

impl ArvadosAuthConfig {
    pub fn from_env() -> Self {
        Self {
            api_host: std::env::var("IROBOT_ARVADOS_API_HOST")
                .unwrap_or_else(|_| "localhost".to_string()),
            api_version: std::env::var("IROBOT_ARVADOS_API_VERSION")
                .unwrap_or_else(|_| "v1".to_string()),
            cache: std::env::var("IROBOT_ARVADOS_CACHE")
                .ok()
                .and_then(|v| parse_duration_limit(&v).ok())
                .unwrap_or(DurationLimit::Finite(Duration::from_secs(3600))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingConfig {
    pub output: Option<std::path::PathBuf>,
    pub level: String,
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        Self {
            output: std::env::var("IROBOT_LOG_OUTPUT").ok().map(Into::into),
            level: std::env::var("IROBOT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub precache: PrecacheConfig,
    pub irods: IrodsConfig,
    pub httpd: HttpdConfig,
    pub basic_auth: BasicAuthConfig,
    pub arvados_auth: ArvadosAuthConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            precache: PrecacheConfig::from_env(),
            irods: IrodsConfig::from_env(),
            httpd: HttpdConfig::from_env(),
            basic_auth: BasicAuthConfig::from_env(),
            arvados_auth: ArvadosAuthConfig::from_env(),
            logging: LoggingConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_byte_sizes() {
        assert_eq!(parse_size("512").unwrap(), 512);
    }

    #[test]
    fn parses_binary_suffixes() {
        assert_eq!(parse_size("1KiB").unwrap(), 1024);
        assert_eq!(parse_size("10MiB").unwrap(), 10 * 1024 * 1024);
    }

    #[test]
    fn parses_decimal_suffixes() {
        assert_eq!(parse_size("1kb").unwrap(), 1000);
    }

    #[test]
    fn unlimited_size_limit() {
        assert_eq!(parse_size_limit("unlimited").unwrap(), SizeLimit::Unlimited);
    }

    #[test]
    fn parses_expiry_units() {
        match parse_expiry("2d").unwrap() {
            DurationLimit::Finite(d) => assert_eq!(d.as_secs(), 2 * 86_400),
            DurationLimit::Unlimited => panic!("expected finite"),
        }
    }

    #[test]
    fn parses_expiry_years() {
        match parse_expiry("1y").unwrap() {
            DurationLimit::Finite(d) => assert!(d.as_secs() > 365 * 86_000),
            DurationLimit::Unlimited => panic!("expected finite"),
        }
    }

    #[test]
    fn rejects_unknown_suffix() {
        assert!(parse_size("5xyz").is_err());
    }
}
