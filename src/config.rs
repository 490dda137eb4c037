//! Adapter settings and route parsing.
//!
//! Settings come from environment-style keys. They are read once, through a
//! lookup function, into [`Settings`]; nothing below this module reads the
//! environment.

use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::client::ClientConfig;
use crate::connection::{ReconnectPolicy, RetryPolicy};
use crate::encoder::Format;
use crate::tag::{SuffixFallback, TagConfig};

const DEFAULT_BUFFER_LIMIT: usize = 1024 * 1024;
const DEFAULT_RETRY_WAIT_MS: u64 = 1000;
const DEFAULT_MAX_RETRIES: u32 = i32::MAX as u32;
const DEFAULT_MAX_RETRY_WAIT_MS: u64 = 60_000;
const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 3;
const DEFAULT_RETRY_ATTEMPTS: u32 = 11;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 10;
const DEFAULT_RECONNECT_INTERVAL_SECS: u64 = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid route '{0}': {1}")]
    InvalidRoute(String, url::ParseError),
    #[error("Invalid fluentd-address {0}")]
    InvalidAddress(String),
    #[error("{key} must be a number, got '{value}'")]
    NotANumber { key: &'static str, value: String },
    #[error("{key} must be a boolean, got '{value}'")]
    NotABoolean { key: &'static str, value: String },
    #[error("Invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("Unable to find adapter: {0}")]
    UnknownAdapter(String),
    #[error("Unable to find transport: {0}")]
    UnknownTransport(String),
    #[error("Unable to connect: {0}")]
    Dial(#[from] crate::transport::DialError),
    #[error("Unable to create fluentd logger: {0}")]
    Client(#[from] crate::client::PostError),
}

/// Client-mode knobs that are not part of the address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub buffer_limit: usize,
    pub retry_wait: Duration,
    pub max_retries: u32,
    pub max_retry_wait: Duration,
    pub async_connect: bool,
    pub sub_second_precision: bool,
    pub request_ack: bool,
    pub write_timeout: Duration,
    pub marshal_json: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub tags: TagConfig,
    pub client: ClientSettings,
    pub retry: RetryPolicy,
    pub reconnect: ReconnectPolicy,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Empty values count as unset, like unset environment variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|value| !value.is_empty());

        let fallback = match get("TAG_SUFFIX_FALLBACK") {
            Some(value) => value
                .parse::<SuffixFallback>()
                .map_err(|reason| ConfigError::Invalid {
                    key: "TAG_SUFFIX_FALLBACK",
                    reason,
                })?,
            None => SuffixFallback::default(),
        };

        let tags = TagConfig {
            prefix: get("TAG_PREFIX").unwrap_or_else(|| "docker".to_string()),
            suffix_label: get("TAG_SUFFIX_LABEL").unwrap_or_default(),
            fallback,
            always_append_suffix: parse_bool(&get, "TAG_ALWAYS_APPEND_SUFFIX", false)?,
        };

        let client = ClientSettings {
            buffer_limit: parse_number(&get, "FLUENTD_BUFFER_LIMIT", DEFAULT_BUFFER_LIMIT)?,
            retry_wait: Duration::from_millis(parse_number(
                &get,
                "FLUENTD_RETRY_WAIT",
                DEFAULT_RETRY_WAIT_MS,
            )?),
            max_retries: parse_number(&get, "FLUENTD_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            max_retry_wait: Duration::from_millis(parse_number(
                &get,
                "FLUENTD_MAX_RETRY_WAIT",
                DEFAULT_MAX_RETRY_WAIT_MS,
            )?),
            async_connect: parse_bool(&get, "FLUENTD_ASYNC_CONNECT", false)?,
            sub_second_precision: parse_bool(&get, "FLUENTD_SUBSECOND_PRECISION", false)?,
            request_ack: parse_bool(&get, "FLUENTD_REQUEST_ACK", false)?,
            write_timeout: Duration::from_secs(parse_number(
                &get,
                "FLUENTD_WRITE_TIMEOUT",
                DEFAULT_WRITE_TIMEOUT_SECS,
            )?),
            marshal_json: parse_bool(&get, "FLUENTD_MARSHAL_JSON", false)?,
        };

        let retry = RetryPolicy {
            max_attempts: parse_number(&get, "FLUENTD_RETRY_ATTEMPTS", DEFAULT_RETRY_ATTEMPTS)?,
            base_delay: Duration::from_millis(parse_number(
                &get,
                "FLUENTD_RETRY_BASE_DELAY_MS",
                DEFAULT_RETRY_BASE_DELAY_MS,
            )?),
        };
        if retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "FLUENTD_RETRY_ATTEMPTS",
                reason: "must be at least 1".to_string(),
            });
        }

        let reconnect = ReconnectPolicy {
            interval: Duration::from_secs(parse_number(
                &get,
                "FLUENTD_RECONNECT_INTERVAL",
                DEFAULT_RECONNECT_INTERVAL_SECS,
            )?),
        };

        Ok(Self {
            tags,
            client,
            retry,
            reconnect,
        })
    }

    pub fn format(&self) -> Format {
        if self.client.marshal_json {
            Format::Json
        } else {
            Format::MsgPack
        }
    }

    pub fn client_config(&self, route: &Route) -> Result<ClientConfig, ConfigError> {
        let network = route.adapter_transport(crate::transport::DEFAULT_TRANSPORT);
        let (host, port, socket_path) = if network == "unix" {
            (String::new(), 0, route.address.clone())
        } else {
            let (host, port) = route.host_port()?;
            (host, port, String::new())
        };

        Ok(ClientConfig {
            host,
            port,
            network: network.to_string(),
            socket_path,
            buffer_limit: self.client.buffer_limit,
            retry_wait: self.client.retry_wait,
            max_retries: self.client.max_retries,
            max_retry_wait: self.client.max_retry_wait,
            async_connect: self.client.async_connect,
            sub_second_precision: self.client.sub_second_precision,
            request_ack: self.client.request_ack,
            write_timeout: self.client.write_timeout,
            format: self.format(),
            ..Default::default()
        })
    }
}

fn parse_number<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::NotANumber { key, value }),
        None => Ok(default),
    }
}

fn parse_bool(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match get(key) {
        Some(value) => match value.as_str() {
            "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
            "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
            _ => Err(ConfigError::NotABoolean { key, value }),
        },
        None => Ok(default),
    }
}

/// Where and how to forward: `adapter[+transport]://address[?options]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub adapter: String,
    pub transport: Option<String>,
    pub address: String,
    pub options: HashMap<String, String>,
}

impl Route {
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(uri).map_err(|e| ConfigError::InvalidRoute(uri.to_string(), e))?;

        let (adapter, transport) = match url.scheme().split_once('+') {
            Some((adapter, transport)) => (adapter.to_string(), Some(transport.to_string())),
            None => (url.scheme().to_string(), None),
        };

        let address = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) if !host.is_empty() => host.to_string(),
            _ => url.path().to_string(),
        };
        if address.is_empty() {
            return Err(ConfigError::InvalidAddress(uri.to_string()));
        }

        let options = url.query_pairs().into_owned().collect();

        Ok(Self {
            adapter,
            transport,
            address,
            options,
        })
    }

    pub fn adapter_transport<'a>(&'a self, default: &'a str) -> &'a str {
        self.transport.as_deref().unwrap_or(default)
    }

    pub fn host_port(&self) -> Result<(String, u16), ConfigError> {
        let invalid = || ConfigError::InvalidAddress(self.address.clone());
        let (host, port) = self.address.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        Ok((host.to_string(), port))
    }
}
