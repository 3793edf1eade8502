//! Environment-driven configuration.
//!
//! Every setting comes from a single environment variable. Values are read once
//! at startup into an immutable [`Config`] that the engine, the gateway and the
//! HTTP fetcher share for the rest of the process lifetime.

use reqwest::Url;
use std::fmt::Write as _;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Describes one recognised environment variable.
struct EnvVar {
    key: &'static str,
    default: Option<&'static str>,
    help: &'static str,
}

const ENV_VARS: &[EnvVar] = &[
    EnvVar { key: "HTTP_URL", default: None, help: "Base URL that requested filenames are appended to" },
    EnvVar { key: "LISTEN", default: Some(":69"), help: "Address and port to listen to" },
    EnvVar { key: "HTTP_MAX_IDLE", default: Some("10"), help: "Maximum idle connections per host for HTTP requests" },
    EnvVar { key: "HTTP_TIMEOUT", default: Some("5"), help: "HTTP timeout limit of initial response in seconds" },
    EnvVar { key: "TFTP_TIMEOUT", default: Some("1"), help: "TFTP timeout limit in seconds" },
    EnvVar { key: "TFTP_RETRIES", default: Some("5"), help: "TFTP retries" },
];

/// Why a URL was refused as an HTTP origin.
#[derive(Debug, Error, PartialEq)]
pub enum UrlError {
    #[error("error parsing: '{0}'")]
    Parse(String),

    #[error("invalid scheme: '{0}'")]
    Scheme(String),

    #[error("host must be provided: '{0}'")]
    MissingHost(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0}: mandatory value missing")]
    Missing(&'static str),

    #[error("{key}: invalid value '{value}': {reason}")]
    Invalid { key: &'static str, value: String, reason: String },

    #[error("{key}: {source}")]
    Url {
        key: &'static str,
        #[source]
        source: UrlError,
    },
}

/// Validated gateway settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// Socket address string handed to the UDP bind.
    pub listen_addr: String,
    /// Origin base that requested filenames are appended to, verbatim.
    pub http_url: String,
    pub http_timeout: Duration,
    pub http_max_idle: usize,
    pub tftp_timeout: Duration,
    pub tftp_retries: u32,
}

/// Checks that `raw` is an absolute http(s) URL with a host.
pub fn validate_url(raw: &str) -> Result<Url, UrlError> {
    let url = Url::parse(raw).map_err(|_| UrlError::Parse(raw.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(UrlError::Scheme(url.scheme().to_string()));
    }
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(url),
        _ => Err(UrlError::MissingHost(raw.to_string())),
    }
}

/// Go-style `:69` means every interface.
fn normalize_listen(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

impl Config {
    /// Builds the configuration from the process environment.
    pub fn from_env() -> Result<Config, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str| -> Result<String, ConfigError> {
            let var = ENV_VARS.iter().find(|v| v.key == key).ok_or(ConfigError::Missing(key))?;
            let value = match lookup(key).filter(|v| !v.is_empty()) {
                Some(value) => value,
                None => var.default.ok_or(ConfigError::Missing(key))?.to_string(),
            };
            log::info!("{key}={value}");
            Ok(value)
        };

        let listen_addr = normalize_listen(&get("LISTEN")?);
        let http_max_idle = parse_num(&get, "HTTP_MAX_IDLE")?;
        let http_timeout = parse_secs(&get, "HTTP_TIMEOUT")?;
        let tftp_timeout = parse_secs(&get, "TFTP_TIMEOUT")?;
        let tftp_retries = parse_num(&get, "TFTP_RETRIES")?;
        let http_url = get("HTTP_URL")?;
        validate_url(&http_url).map_err(|source| ConfigError::Url { key: "HTTP_URL", source })?;

        Ok(Config { listen_addr, http_url, http_timeout, http_max_idle, tftp_timeout, tftp_retries })
    }
}

fn parse_num<T, G>(get: &G, key: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&'static str) -> Result<String, ConfigError>,
{
    let value = get(key)?;
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid { key, value, reason: e.to_string() })
}

fn parse_secs<G>(get: &G, key: &'static str) -> Result<Duration, ConfigError>
where
    G: Fn(&'static str) -> Result<String, ConfigError>,
{
    let secs: u64 = parse_num(get, key)?;
    if secs == 0 {
        return Err(ConfigError::Invalid { key, value: secs.to_string(), reason: "must be greater than zero".into() });
    }
    Ok(Duration::from_secs(secs))
}

/// Help text listing every recognised variable.
pub fn usage() -> String {
    let mut out = String::from("Usage:\n\n");
    for var in ENV_VARS {
        let default = match var.default {
            Some(value) => format!("Default {value}"),
            None => "Mandatory".to_string(),
        };
        let _ = write!(out, "{}: {} ({})\n\n", var.key, var.help, default);
    }
    out
}
