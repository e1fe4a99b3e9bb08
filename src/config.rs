//! Operational configuration.
//!
//! All limits are fixed for the lifetime of the process; the file is read
//! once at startup and there is no runtime renegotiation. Missing fields
//! fall back to compiled-in defaults so an empty file is a valid config.

use std::{fs, net::SocketAddr, path::Path};

use serde::Deserialize;

/// simultaneous connection hard cap; above it accepted sockets are dropped
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;
/// read buffer size before a line terminator must be found
pub const DEFAULT_REQUEST_BUFFER_SIZE: usize = 4095;
/// relay copy block size
pub const DEFAULT_READ_BLOCK_SIZE: usize = 8192;
/// cooldown before a held authorization decision is retried
pub const DEFAULT_HOLD_RETRY_MS: u64 = 1000;
/// CONNECT targets without a port historically fall back to 80 here,
/// where 443 would be conventional
pub const DEFAULT_CONNECT_PORT: u16 = 80;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file {0}: {1}")]
    Read(String, std::io::Error),
    #[error("could not parse config file {0}: {1}")]
    Parse(String, toml::de::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// proxy listener
    #[serde(default = "default_proxy_addr")]
    pub proxy_addr: SocketAddr,
    /// administrative web interface listener
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_request_buffer_size")]
    pub request_buffer_size: usize,
    #[serde(default = "default_read_block_size")]
    pub read_block_size: usize,
    #[serde(default = "default_hold_retry_ms")]
    pub hold_retry_ms: u64,
    #[serde(default = "default_connect_port")]
    pub connect_default_port: u16,
    #[serde(default = "default_hosts_file")]
    pub hosts_file: String,
    #[serde(default = "default_rules_file")]
    pub rules_file: String,
    /// identity used in Via headers and log lines
    #[serde(default = "default_server_name")]
    pub server_name: String,
}

fn default_proxy_addr() -> SocketAddr {
    "127.0.0.1:8081".parse().unwrap()
}

fn default_admin_addr() -> SocketAddr {
    "127.0.0.1:8080".parse().unwrap()
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_request_buffer_size() -> usize {
    DEFAULT_REQUEST_BUFFER_SIZE
}

fn default_read_block_size() -> usize {
    DEFAULT_READ_BLOCK_SIZE
}

fn default_hold_retry_ms() -> u64 {
    DEFAULT_HOLD_RETRY_MS
}

fn default_connect_port() -> u16 {
    DEFAULT_CONNECT_PORT
}

fn default_hosts_file() -> String {
    "known_hosts".to_string()
}

fn default_rules_file() -> String {
    "rules".to_string()
}

fn default_server_name() -> String {
    "webgate".to_string()
}

impl Default for Config {
    fn default() -> Config {
        Config {
            proxy_addr: default_proxy_addr(),
            admin_addr: default_admin_addr(),
            max_connections: default_max_connections(),
            request_buffer_size: default_request_buffer_size(),
            read_block_size: default_read_block_size(),
            hold_retry_ms: default_hold_retry_ms(),
            connect_default_port: default_connect_port(),
            hosts_file: default_hosts_file(),
            rules_file: default_rules_file(),
            server_name: default_server_name(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
        toml::from_str(&data).map_err(|e| ConfigError::Parse(path.display().to_string(), e))
    }
}
