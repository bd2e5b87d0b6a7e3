//! Configuration for the DNS server.
//!
//! This module defines the configuration structure and methods to load
//! configuration from environment variables.

use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use crate::dns::{HEADER_LEN, MAX_MESSAGE_LEN, UDP_MAX_RESPONSE};
use crate::errors::DnsError;

/// Default listen address.
pub const DEFAULT_BIND: &str = "0.0.0.0:53";

/// Default path of the compiled zone database.
pub const DEFAULT_DATA_PATH: &str = "data.cdb";

/// Seconds between checks for a new database generation.
pub const DEFAULT_REFRESH_SECS: u64 = 10;

pub const DEFAULT_TCP_MAX_CONNECTIONS: usize = 256;

pub const DEFAULT_TCP_IDLE_SECS: u64 = 60;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Addresses to serve on; each gets a UDP socket and a TCP listener.
    pub bind_addrs: Vec<SocketAddr>,

    /// Path to the compiled zone database.
    pub data_path: PathBuf,

    /// How often the database file is checked for a new generation.
    pub refresh_interval: Duration,

    /// Largest UDP answer before truncation.
    pub udp_max_response: usize,

    /// Concurrent TCP connections; further connections are closed on accept.
    pub tcp_max_connections: usize,

    /// How long a TCP connection may sit between reads.
    pub tcp_idle_timeout: Duration,

    /// Prometheus exporter listen address, if metrics are wanted.
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addrs: vec![SocketAddr::from(([0, 0, 0, 0], 53))],
            data_path: PathBuf::from(DEFAULT_DATA_PATH),
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_SECS),
            udp_max_response: UDP_MAX_RESPONSE,
            tcp_max_connections: DEFAULT_TCP_MAX_CONNECTIONS,
            tcp_idle_timeout: Duration::from_secs(DEFAULT_TCP_IDLE_SECS),
            metrics_addr: None,
        }
    }
}

impl ServerConfig {
    /// Load server configuration from environment variables.
    ///
    /// # Returns
    /// A `Result` containing either the loaded `ServerConfig` or a `DnsError`.
    pub fn from_env() -> Result<Self, DnsError> {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Load server configuration from any variable source.
    ///
    /// # Arguments
    /// * `var` - Returns the value of a variable, or `None` if it is unset.
    pub fn from_vars<F>(var: F) -> Result<Self, DnsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_addrs = var("DNS_BIND")
            .unwrap_or_else(|| DEFAULT_BIND.into())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse()
                    .map_err(|_| DnsError::Config(format!("Invalid DNS_BIND address: {}", s)))
            })
            .collect::<Result<Vec<SocketAddr>, _>>()?;
        if bind_addrs.is_empty() {
            return Err(DnsError::Config("DNS_BIND lists no addresses".into()));
        }

        let refresh_secs: u64 = parse_var(&var, "DNS_REFRESH_SECS", DEFAULT_REFRESH_SECS)?;
        if refresh_secs == 0 {
            return Err(DnsError::Config("DNS_REFRESH_SECS must be positive".into()));
        }

        let udp_max_response: usize = parse_var(&var, "DNS_UDP_MAX_RESPONSE", UDP_MAX_RESPONSE)?;
        if !(HEADER_LEN..=MAX_MESSAGE_LEN).contains(&udp_max_response) {
            return Err(DnsError::Config(format!(
                "DNS_UDP_MAX_RESPONSE must be between {} and {}",
                HEADER_LEN, MAX_MESSAGE_LEN
            )));
        }

        let tcp_max_connections: usize =
            parse_var(&var, "DNS_TCP_MAX_CONNECTIONS", DEFAULT_TCP_MAX_CONNECTIONS)?;
        if tcp_max_connections == 0 {
            return Err(DnsError::Config("DNS_TCP_MAX_CONNECTIONS must be positive".into()));
        }

        let tcp_idle_secs: u64 = parse_var(&var, "DNS_TCP_IDLE_SECS", DEFAULT_TCP_IDLE_SECS)?;

        let metrics_addr = match var("DNS_METRICS_ADDR").filter(|v| !v.trim().is_empty()) {
            Some(v) => Some(
                v.trim()
                    .parse()
                    .map_err(|_| DnsError::Config(format!("Invalid DNS_METRICS_ADDR: {}", v)))?,
            ),
            None => None,
        };

        Ok(Self {
            bind_addrs,
            data_path: var("DNS_DATA_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_PATH)),
            refresh_interval: Duration::from_secs(refresh_secs),
            udp_max_response,
            tcp_max_connections,
            tcp_idle_timeout: Duration::from_secs(tcp_idle_secs),
            metrics_addr,
        })
    }
}

fn parse_var<F, T>(var: &F, name: &str, default: T) -> Result<T, DnsError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match var(name) {
        None => Ok(default),
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| DnsError::Config(format!("Invalid {}: {}", name, v))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<ServerConfig, DnsError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.bind_addrs, vec!["0.0.0.0:53".parse().unwrap()]);
        assert_eq!(config.data_path, PathBuf::from("data.cdb"));
        assert_eq!(config.refresh_interval, Duration::from_secs(10));
        assert_eq!(config.udp_max_response, 512);
        assert_eq!(config.tcp_max_connections, 256);
        assert_eq!(config.tcp_idle_timeout, Duration::from_secs(60));
        assert!(config.metrics_addr.is_none());

        let default = ServerConfig::default();
        assert_eq!(default.bind_addrs, config.bind_addrs);
        assert_eq!(default.udp_max_response, config.udp_max_response);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("DNS_BIND", "127.0.0.1:5353, [::1]:5353"),
            ("DNS_DATA_PATH", "/var/dns/data.cdb"),
            ("DNS_REFRESH_SECS", "2"),
            ("DNS_UDP_MAX_RESPONSE", "1232"),
            ("DNS_TCP_MAX_CONNECTIONS", "8"),
            ("DNS_TCP_IDLE_SECS", "5"),
            ("DNS_METRICS_ADDR", "127.0.0.1:9100"),
        ])
        .unwrap();
        assert_eq!(config.bind_addrs.len(), 2);
        assert_eq!(config.bind_addrs[1], "[::1]:5353".parse().unwrap());
        assert_eq!(config.data_path, PathBuf::from("/var/dns/data.cdb"));
        assert_eq!(config.refresh_interval, Duration::from_secs(2));
        assert_eq!(config.udp_max_response, 1232);
        assert_eq!(config.tcp_max_connections, 8);
        assert_eq!(config.tcp_idle_timeout, Duration::from_secs(5));
        assert_eq!(config.metrics_addr, Some("127.0.0.1:9100".parse().unwrap()));
    }

    #[test]
    fn test_invalid_values() {
        for (name, value) in [
            ("DNS_BIND", "localhost"),
            ("DNS_BIND", " , "),
            ("DNS_REFRESH_SECS", "soon"),
            ("DNS_REFRESH_SECS", "0"),
            ("DNS_UDP_MAX_RESPONSE", "11"),
            ("DNS_UDP_MAX_RESPONSE", "65536"),
            ("DNS_TCP_MAX_CONNECTIONS", "0"),
            ("DNS_TCP_IDLE_SECS", "-1"),
            ("DNS_METRICS_ADDR", "9100"),
        ] {
            match load(&[(name, value)]) {
                Err(DnsError::Config(_)) => {}
                other => panic!("{}={} gave {:?}", name, value, other),
            }
        }
    }
}
