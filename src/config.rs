//! Client configuration and traffic totals persistence.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::crypto::{Cipher, CipherKind};
use crate::filter::{DEFAULT_DIRECT_DNS_SERVER, DomainRules, FilterMode};
use crate::protocol::Identification;
use crate::stats::{TrafficSnapshot, TrafficStore};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    FileRead(String, String),

    #[error("Failed to write config file {0}: {1}")]
    FileWrite(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub cipher: CipherConfig,
    pub timing: TimingConfig,
    pub filter: FilterConfig,
    pub device: DeviceConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::LOCALHOST,
            port: 5000,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.host, self.port)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Seeds the identification token.
    pub user: String,
    pub secret: String,
}

impl AuthConfig {
    pub fn identification(&self) -> Identification {
        Identification::from_name(&self.user)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CipherConfig {
    pub kind: CipherKind,
    /// Carry length-prefixed units instead of one ciphertext per datagram.
    pub length_prefixed: bool,
}

/// Timeouts and intervals, in multiples of one time unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimingConfig {
    pub unit_ms: u64,
    pub handshake_timeout_units: u32,
    pub retry_budget: u32,
    pub persist_every_ticks: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            unit_ms: 1000,
            handshake_timeout_units: 2,
            retry_budget: 5,
            persist_every_ticks: 60,
        }
    }
}

impl TimingConfig {
    /// Defaults scaled to a different time unit.
    pub fn with_unit(unit: Duration) -> Self {
        Self {
            unit_ms: unit.as_millis() as u64,
            ..Self::default()
        }
    }

    pub fn unit(&self) -> Duration {
        Duration::from_millis(self.unit_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.unit() * self.handshake_timeout_units
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FilterConfig {
    pub mode: FilterMode,
    pub domains: Vec<String>,
    pub cidrs: Vec<String>,
    /// Routed around the tunnel and used for every direct lookup.
    pub direct_dns_server: Ipv4Addr,
    pub resolve_timeout_ms: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            mode: FilterMode::Blacklist,
            domains: Vec::new(),
            cidrs: Vec::new(),
            direct_dns_server: DEFAULT_DIRECT_DNS_SERVER,
            resolve_timeout_ms: 2000,
        }
    }
}

impl FilterConfig {
    /// Parse the static CIDR list.
    pub fn static_cidrs(&self) -> Result<Vec<Ipv4Network>, ConfigError> {
        self.cidrs
            .iter()
            .map(|c| {
                c.parse::<Ipv4Network>()
                    .map_err(|e| ConfigError::Validation(format!("Invalid CIDR '{}': {}", c, e)))
            })
            .collect()
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }
}

/// Local end of the packet device bridge.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub local: SocketAddr,
    pub peer: SocketAddr,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            local: SocketAddr::from(([127, 0, 0, 1], 7000)),
            peer: SocketAddr::from(([127, 0, 0, 1], 7001)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub traffic_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            traffic_file: PathBuf::from("traffic.toml"),
        }
    }
}

impl Config {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.display().to_string(), e.to_string()))?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation("Server port cannot be 0".to_string()));
        }
        if self.auth.secret.is_empty() {
            return Err(ConfigError::Validation("Secret cannot be empty".to_string()));
        }
        if self.timing.unit_ms == 0 {
            return Err(ConfigError::Validation("Time unit cannot be 0".to_string()));
        }
        if self.timing.retry_budget == 0 {
            return Err(ConfigError::Validation("Retry budget cannot be 0".to_string()));
        }
        if self.timing.handshake_timeout_units == 0 || self.timing.persist_every_ticks == 0 {
            return Err(ConfigError::Validation(
                "Handshake timeout and persist interval must be at least one unit".to_string(),
            ));
        }
        if self.filter.direct_dns_server.is_unspecified() {
            return Err(ConfigError::Validation(
                "Direct DNS server cannot be 0.0.0.0".to_string(),
            ));
        }

        self.filter.static_cidrs()?;
        DomainRules::compile(&self.filter.domains)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Parse(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, toml_string)
            .map_err(|e| ConfigError::FileWrite(path.display().to_string(), e.to_string()))?;
        Ok(())
    }

    pub fn cipher(&self) -> Cipher {
        Cipher::new(self.cipher.kind, self.auth.secret.as_bytes())
    }
}

/// Traffic totals kept in a small TOML file.
#[derive(Debug, Clone)]
pub struct TrafficFile {
    path: PathBuf,
}

impl TrafficFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the totals. A missing file reads as zero.
    pub fn read(&self) -> Result<TrafficSnapshot, ConfigError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(TrafficSnapshot::default());
            }
            Err(e) => {
                return Err(ConfigError::FileRead(
                    self.path.display().to_string(),
                    e.to_string(),
                ));
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn write(&self, snapshot: TrafficSnapshot) -> Result<(), ConfigError> {
        let contents = toml::to_string(&snapshot)
            .map_err(|e| ConfigError::Parse(format!("Failed to serialize traffic: {}", e)))?;
        std::fs::write(&self.path, contents)
            .map_err(|e| ConfigError::FileWrite(self.path.display().to_string(), e.to_string()))
    }
}

impl TrafficStore for TrafficFile {
    fn load(&self) -> TrafficSnapshot {
        self.read().unwrap_or_else(|e| {
            warn!(error = %e, "Traffic totals unreadable, starting from zero");
            TrafficSnapshot::default()
        })
    }

    fn save(&self, snapshot: TrafficSnapshot) {
        if let Err(e) = self.write(snapshot) {
            warn!(error = %e, "Failed to persist traffic totals");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut config = Config::default();
        config.auth.secret = "hunter2".into();
        config
    }

    #[test]
    fn parses_full_file() {
        let config: Config = toml::from_str(
            r#"
            [server]
            host = "203.0.113.7"
            port = 4500

            [auth]
            user = "alice"
            secret = "s3cret"

            [cipher]
            kind = "stream"
            length_prefixed = true

            [timing]
            unit_ms = 250

            [filter]
            mode = "whitelist"
            domains = ['(.*\.)?example\.com']
            cidrs = ["10.8.0.0/16"]
            direct_dns_server = "8.8.8.8"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.addr(), "203.0.113.7:4500".parse().unwrap());
        assert_eq!(config.cipher.kind, CipherKind::Stream);
        assert!(config.cipher.length_prefixed);
        assert_eq!(config.timing.unit(), Duration::from_millis(250));
        assert_eq!(config.timing.handshake_timeout(), Duration::from_millis(500));
        assert_eq!(config.timing.retry_budget, 5);
        assert_eq!(config.filter.mode, FilterMode::Whitelist);
        assert_eq!(config.filter.direct_dns_server, Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(
            config.filter.static_cidrs().unwrap(),
            vec!["10.8.0.0/16".parse::<Ipv4Network>().unwrap()]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.cipher.kind, CipherKind::Block);
        assert_eq!(config.timing, TimingConfig::default());
        assert_eq!(config.filter.mode, FilterMode::Blacklist);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = valid();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.auth.secret.clear();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.timing.unit_ms = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.timing.retry_budget = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.filter.cidrs = vec!["10.0.0.0/33".into()];
        assert!(config.validate().is_err());

        let mut config = valid();
        config.filter.domains = vec!["(".into()];
        assert!(config.validate().is_err());

        let mut config = valid();
        config.filter.direct_dns_server = Ipv4Addr::UNSPECIFIED;
        assert!(config.validate().is_err());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("splitvpn.toml");
        let mut config = valid();
        config.filter.domains = vec![r"ads\.example\.com".into()];

        config.save(&path).unwrap();
        let loaded = Config::load(Some(path.as_path())).unwrap();

        assert_eq!(loaded.auth.secret, "hunter2");
        assert_eq!(loaded.filter.domains, config.filter.domains);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/splitvpn.toml"))).unwrap_err();

        assert!(matches!(err, ConfigError::FileRead(..)));
    }

    #[test]
    fn missing_traffic_file_reads_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let file = TrafficFile::new(dir.path().join("traffic.toml"));

        assert_eq!(file.read().unwrap(), TrafficSnapshot::default());
    }

    #[test]
    fn traffic_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = TrafficFile::new(dir.path().join("traffic.toml"));
        let snapshot = TrafficSnapshot {
            rx_total: 123,
            tx_total: 456,
        };

        file.save(snapshot);

        assert_eq!(file.load(), snapshot);
        let raw = std::fs::read_to_string(file.path()).unwrap();
        assert!(raw.contains("rx = 123"));
        assert!(raw.contains("tx = 456"));
    }
}
