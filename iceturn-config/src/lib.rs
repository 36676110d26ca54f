//! Configuration management for the iceturn relay
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use serde::Deserialize;
use std::env;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Environment variable prefix for all settings (`TURN_LISTEN_PORT`, ...)
pub const ENV_PREFIX: &str = "TURN";

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_VAR: &str = "ICETURN_CONFIG";

/// Realm used when none is configured
pub const DEFAULT_REALM: &str = "pjsip.org";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Loading or deserializing failed
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// A value is present but unusable
    #[error("Invalid configuration value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Transport protocols the listener can be started with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenProtocol {
    /// UDP listener only
    Udp,
    /// UDP and TCP listeners on the same port
    Tcp,
}

impl FromStr for ListenProtocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(ListenProtocol::Udp),
            "tcp" => Ok(ListenProtocol::Tcp),
            other => Err(ConfigError::Invalid {
                key: "listen_protocol",
                reason: format!("unsupported net protocol '{}'", other),
            }),
        }
    }
}

impl fmt::Display for ListenProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenProtocol::Udp => write!(f, "udp"),
            ListenProtocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable console output
    Console,
    /// JSON lines
    Json,
}

/// A long-term credential entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCredential {
    pub username: String,
    pub password: String,
}

/// Relay server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TurnConfig {
    /// `udp` binds UDP only, `tcp` binds UDP and TCP
    pub listen_protocol: ListenProtocol,
    pub listen_host: String,
    pub listen_port: u16,
    /// Local IP relay sockets bind to
    pub relay_ip: String,
    /// Address advertised in XOR-RELAYED-ADDRESS, defaults to `relay_ip`.
    /// Required when `relay_ip` is a wildcard address.
    pub external_ip: Option<String>,
    pub relay_port_min: u16,
    pub relay_port_max: u16,
    pub realm: String,
    /// Comma separated `username:password` pairs
    pub users: String,
    pub log_level: Option<String>,
    pub log_format: LogFormat,
    /// Value of the SOFTWARE attribute, empty to omit
    pub software: String,
    pub default_lifetime_secs: u64,
    pub max_lifetime_secs: u64,
    pub permission_lifetime_secs: u64,
    pub channel_lifetime_secs: u64,
    pub nonce_lifetime_secs: u64,
    /// Global allocation ceiling
    pub max_allocations: usize,
    /// Allocations allowed per username
    pub user_quota: usize,
    /// Allocations allowed per client IP
    pub ip_quota: usize,
    pub worker_count: usize,
    pub queue_depth: usize,
    pub sweep_interval_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        TurnConfig {
            listen_protocol: ListenProtocol::Udp,
            listen_host: "0.0.0.0".to_string(),
            listen_port: 3478,
            relay_ip: "127.0.0.1".to_string(),
            external_ip: None,
            relay_port_min: 49152,
            relay_port_max: 65535,
            realm: DEFAULT_REALM.to_string(),
            users: String::new(),
            log_level: Some("info".to_string()),
            log_format: LogFormat::Console,
            software: concat!("iceturn ", env!("CARGO_PKG_VERSION")).to_string(),
            default_lifetime_secs: 600,
            max_lifetime_secs: 3600,
            permission_lifetime_secs: 300,
            channel_lifetime_secs: 600,
            nonce_lifetime_secs: 600,
            max_allocations: 10_000,
            user_quota: 100,
            ip_quota: 100,
            worker_count: 4,
            queue_depth: 1024,
            sweep_interval_ms: 1000,
            shutdown_grace_ms: 2000,
        }
    }
}

impl TurnConfig {
    /// Load configuration from `.env`, an optional file and `TURN_*` variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let defaults = TurnConfig::default();
        let mut builder = config::Config::builder()
            .set_default("listen_protocol", defaults.listen_protocol.to_string())?
            .set_default("listen_host", defaults.listen_host.clone())?
            .set_default("listen_port", i64::from(defaults.listen_port))?
            .set_default("relay_ip", defaults.relay_ip.clone())?
            .set_default("relay_port_min", i64::from(defaults.relay_port_min))?
            .set_default("relay_port_max", i64::from(defaults.relay_port_max))?
            .set_default("realm", defaults.realm.clone())?
            .set_default("users", defaults.users.clone())?
            .set_default("log_level", "info")?
            .set_default("log_format", "console")?
            .set_default("software", defaults.software.clone())?
            .set_default("default_lifetime_secs", defaults.default_lifetime_secs as i64)?
            .set_default("max_lifetime_secs", defaults.max_lifetime_secs as i64)?
            .set_default("permission_lifetime_secs", defaults.permission_lifetime_secs as i64)?
            .set_default("channel_lifetime_secs", defaults.channel_lifetime_secs as i64)?
            .set_default("nonce_lifetime_secs", defaults.nonce_lifetime_secs as i64)?
            .set_default("max_allocations", defaults.max_allocations as i64)?
            .set_default("user_quota", defaults.user_quota as i64)?
            .set_default("ip_quota", defaults.ip_quota as i64)?
            .set_default("worker_count", defaults.worker_count as i64)?
            .set_default("queue_depth", defaults.queue_depth as i64)?
            .set_default("sweep_interval_ms", defaults.sweep_interval_ms as i64)?
            .set_default("shutdown_grace_ms", defaults.shutdown_grace_ms as i64)?;

        if let Ok(path) = env::var(CONFIG_FILE_VAR) {
            builder = builder.add_source(config::File::with_name(&path).required(false));
        }

        let config: TurnConfig = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay_port_min == 0 || self.relay_port_min > self.relay_port_max {
            return Err(ConfigError::Invalid {
                key: "relay_port_min",
                reason: format!(
                    "relay port range {}-{} is empty",
                    self.relay_port_min, self.relay_port_max
                ),
            });
        }
        if self.default_lifetime_secs == 0 || self.max_lifetime_secs < self.default_lifetime_secs {
            return Err(ConfigError::Invalid {
                key: "max_lifetime_secs",
                reason: "maximum lifetime must be at least the non-zero default".to_string(),
            });
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid {
                key: "worker_count",
                reason: "at least one worker is required".to_string(),
            });
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::Invalid {
                key: "queue_depth",
                reason: "queue depth must be non-zero".to_string(),
            });
        }
        if self.realm.is_empty() {
            return Err(ConfigError::Invalid {
                key: "realm",
                reason: "realm must not be empty".to_string(),
            });
        }
        let key = if self.external_ip.is_some() { "external_ip" } else { "relay_ip" };
        match self.advertised_ip().parse::<IpAddr>() {
            Ok(ip) if ip.is_unspecified() => {
                return Err(ConfigError::Invalid {
                    key: "external_ip",
                    reason: format!("clients cannot reach relay addresses on {}; set external_ip", ip),
                });
            }
            Ok(_) => {}
            Err(_) => {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("'{}' is not an IP address", self.advertised_ip()),
                });
            }
        }
        self.credentials()?;
        Ok(())
    }

    /// Parse the `users` setting
    pub fn credentials(&self) -> Result<Vec<UserCredential>, ConfigError> {
        self.users
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (username, password) = entry.split_once(':').ok_or_else(|| ConfigError::Invalid {
                    key: "users",
                    reason: format!("entry '{}' is not username:password", entry),
                })?;
                if username.is_empty() {
                    return Err(ConfigError::Invalid {
                        key: "users",
                        reason: "empty username".to_string(),
                    });
                }
                Ok(UserCredential {
                    username: username.to_string(),
                    password: password.to_string(),
                })
            })
            .collect()
    }

    /// Control listener address as `host:port`
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    /// IP advertised to clients for relay addresses
    pub fn advertised_ip(&self) -> &str {
        self.external_ip.as_deref().unwrap_or(&self.relay_ip)
    }

    /// Get log level, defaulting to "info"
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn default_lifetime(&self) -> Duration {
        Duration::from_secs(self.default_lifetime_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn permission_lifetime(&self) -> Duration {
        Duration::from_secs(self.permission_lifetime_secs)
    }

    pub fn channel_lifetime(&self) -> Duration {
        Duration::from_secs(self.channel_lifetime_secs)
    }

    pub fn nonce_lifetime(&self) -> Duration {
        Duration::from_secs(self.nonce_lifetime_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
