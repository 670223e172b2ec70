//! YAML configuration.
//!
//! ```yaml
//! server: { address: "0.0.0.0:9443", tls: "relay" }
//! client: { address: "relay.example:9443", tls: "edge", server_name: "relay.example" }
//! channel:
//!   - { local: "127.0.0.1:2222", remote: "10.0.0.5:22" }
//! proxy:
//!   - { local: "127.0.0.1:8080", remote: ["10.0.0.7:80", "10.0.0.8:80"] }
//! tls:
//!   - { name: "relay", cert: "server.pem", key: "server.key", ca: "ca.pem" }
//! timeout: "60s"
//! dial_timeout: "10s"
//! stats_interval: "10s"
//! ```
//!
//! Relative TLS paths are resolved against the directory of the config file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tunmux_transport::TlsFiles;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("missing `{0}` section")]
    MissingSection(&'static str),

    #[error("{field}: invalid address `{value}` (expected host:port)")]
    InvalidAddress { field: String, value: String },

    #[error("{field}: invalid duration `{value}` ({reason})")]
    InvalidDuration {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("unknown tls profile `{0}`")]
    UnknownTlsProfile(String),

    #[error("{0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Which part of the configuration a run mode needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client,
    Proxy,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: Option<ServerSection>,
    #[serde(default)]
    pub client: Option<ClientSection>,
    #[serde(default)]
    pub channel: Vec<ChannelEntry>,
    #[serde(default)]
    pub proxy: Vec<ProxyEntry>,
    #[serde(default)]
    pub tls: Vec<TlsProfile>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub dial_timeout: Option<String>,
    #[serde(default)]
    pub stats_interval: Option<String>,
    #[serde(skip)]
    base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    pub address: String,
    #[serde(default)]
    pub tls: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientSection {
    pub address: String,
    #[serde(default)]
    pub tls: Option<String>,
    /// Name the server certificate must carry. Defaults to the host of `address`.
    #[serde(default)]
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelEntry {
    /// Only `tcp` is supported.
    #[serde(default)]
    pub protocol: Option<String>,
    pub local: String,
    pub remote: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyEntry {
    pub local: String,
    pub remote: Vec<String>,
    #[serde(default)]
    pub local_tls: Option<String>,
    #[serde(default)]
    pub remote_tls: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsProfile {
    pub name: String,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let body = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config =
            serde_yaml::from_str(&body).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(config)
    }

    /// Check everything `mode` is going to use.
    pub fn validate(&self, mode: Mode) -> Result<()> {
        self.timeout()?;
        self.dial_timeout()?;
        self.stats_interval()?;

        let mut names = HashSet::new();
        for profile in &self.tls {
            if !names.insert(profile.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate tls profile `{}`",
                    profile.name
                )));
            }
        }

        match mode {
            Mode::Server => {
                let server = self.server()?;
                check_address("server.address", &server.address)?;
                self.check_profile(server.tls.as_deref())?;
            }
            Mode::Client => {
                let client = self.client()?;
                check_address("client.address", &client.address)?;
                self.check_profile(client.tls.as_deref())?;
                if self.channel.is_empty() {
                    return Err(ConfigError::Invalid(
                        "client mode needs at least one `channel` entry".to_string(),
                    ));
                }
                for (i, entry) in self.channel.iter().enumerate() {
                    if let Some(protocol) = entry.protocol.as_deref() {
                        if !protocol.eq_ignore_ascii_case("tcp") {
                            return Err(ConfigError::Invalid(format!(
                                "channel[{i}].protocol: unsupported protocol `{protocol}`"
                            )));
                        }
                    }
                    check_address(&format!("channel[{i}].local"), &entry.local)?;
                    check_address(&format!("channel[{i}].remote"), &entry.remote)?;
                }
            }
            Mode::Proxy => {
                if self.proxy.is_empty() {
                    return Err(ConfigError::Invalid(
                        "proxy mode needs at least one `proxy` entry".to_string(),
                    ));
                }
                for (i, entry) in self.proxy.iter().enumerate() {
                    check_address(&format!("proxy[{i}].local"), &entry.local)?;
                    if entry.remote.is_empty() {
                        return Err(ConfigError::Invalid(format!(
                            "proxy[{i}].remote: at least one address is required"
                        )));
                    }
                    for (j, remote) in entry.remote.iter().enumerate() {
                        check_address(&format!("proxy[{i}].remote[{j}]"), remote)?;
                    }
                    self.check_profile(entry.local_tls.as_deref())?;
                    self.check_profile(entry.remote_tls.as_deref())?;
                }
            }
        }
        Ok(())
    }

    pub fn server(&self) -> Result<&ServerSection> {
        self.server
            .as_ref()
            .ok_or(ConfigError::MissingSection("server"))
    }

    pub fn client(&self) -> Result<&ClientSection> {
        self.client
            .as_ref()
            .ok_or(ConfigError::MissingSection("client"))
    }

    /// Resolve a TLS profile by name.
    pub fn tls_files(&self, name: &str) -> Result<TlsFiles> {
        let profile = self
            .tls
            .iter()
            .find(|profile| profile.name == name)
            .ok_or_else(|| ConfigError::UnknownTlsProfile(name.to_string()))?;
        Ok(TlsFiles {
            cert: self.base_dir.join(&profile.cert),
            key: self.base_dir.join(&profile.key),
            ca: self.base_dir.join(&profile.ca),
        })
    }

    /// Per-I/O deadline on the tunnel and on channel writes.
    pub fn timeout(&self) -> Result<Duration> {
        duration_field("timeout", self.timeout.as_deref(), DEFAULT_TIMEOUT)
    }

    /// Bound on the server dialing a destination.
    pub fn dial_timeout(&self) -> Result<Duration> {
        duration_field(
            "dial_timeout",
            self.dial_timeout.as_deref(),
            DEFAULT_DIAL_TIMEOUT,
        )
    }

    /// Period of the throughput report.
    pub fn stats_interval(&self) -> Result<Duration> {
        duration_field(
            "stats_interval",
            self.stats_interval.as_deref(),
            DEFAULT_STATS_INTERVAL,
        )
    }

    fn check_profile(&self, name: Option<&str>) -> Result<()> {
        match name {
            Some(name) => self.tls_files(name).map(|_| ()),
            None => Ok(()),
        }
    }
}

impl ClientSection {
    /// Name the server certificate is verified against.
    pub fn server_name(&self) -> &str {
        self.server_name
            .as_deref()
            .unwrap_or_else(|| host_of(&self.address))
    }
}

/// Host part of a `host:port` address, without IPv6 brackets.
pub fn host_of(address: &str) -> &str {
    let host = address
        .rsplit_once(':')
        .map_or(address, |(host, _)| host);
    host.strip_prefix('[')
        .and_then(|host| host.strip_suffix(']'))
        .unwrap_or(host)
}

fn check_address(field: &str, value: &str) -> Result<()> {
    let invalid = || ConfigError::InvalidAddress {
        field: field.to_string(),
        value: value.to_string(),
    };
    let (host, port) = value.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid());
    }
    Ok(())
}

fn duration_field(field: &'static str, value: Option<&str>, default: Duration) -> Result<Duration> {
    match value {
        None => Ok(default),
        Some(value) => parse_duration(value).map_err(|reason| ConfigError::InvalidDuration {
            field,
            value: value.to_string(),
            reason,
        }),
    }
}

/// Parse `5s`, `150ms` or a bare number of seconds. Zero is rejected.
pub fn parse_duration(input: &str) -> std::result::Result<Duration, &'static str> {
    let input = input.trim();
    if input.is_empty() {
        return Err("must not be empty");
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number.trim().parse().map_err(|_| "not a number")?;
    if value == 0 {
        return Err("must be greater than zero");
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
