//! Gateway configuration
//!
//! Built from defaults, overlaid by an optional TOML file (see [`file`]) and
//! then by command-line flags and environment variables in the binary.

pub mod file;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gateway::DialOptions;
use crate::mux::MuxOptions;
use crate::plugins::DiscoveryOptions;
use crate::{Error, Result};

pub use file::{PorticoConfigFile, config_file_path, load_config_file};

/// Port used when none is configured
pub const DEFAULT_PORT: u16 = 50051;

/// Complete gateway configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Address to bind
    pub host: IpAddr,

    /// Port serving both gRPC and REST; 0 picks a free port
    pub port: u16,

    /// Directories scanned for plugin artifacts, in order
    pub plugin_dirs: Vec<PathBuf>,

    /// Plugin discovery settings
    pub discovery: DiscoveryOptions,

    /// Server runtime settings
    pub server: ServerConfig,

    /// Loopback channel settings used by REST handlers
    pub gateway: DialOptions,
}

/// Server runtime settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Time engines get to drain after shutdown is requested
    pub shutdown_grace: Duration,

    /// Time a new connection gets to identify its protocol
    pub classify_timeout: Duration,

    /// Serve gRPC reflection
    pub reflection: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(10),
            classify_timeout: Duration::from_secs(10),
            reflection: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            plugin_dirs: vec![PathBuf::from(".")],
            discovery: DiscoveryOptions::default(),
            server: ServerConfig::default(),
            gateway: DialOptions::default(),
        }
    }
}

impl Config {
    /// Load configuration from defaults and a config file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be loaded or holds invalid values
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::from_file(file::load_config_file(path)?)
    }

    /// Overlay a parsed config file on top of defaults
    ///
    /// # Errors
    ///
    /// Returns error if the host is not an IP address
    pub fn from_file(fc: PorticoConfigFile) -> Result<Self> {
        let defaults = Self::default();

        let host = match fc.host {
            Some(host) => host
                .parse()
                .map_err(|e| Error::Config(format!("invalid host {host:?}: {e}")))?,
            None => defaults.host,
        };

        Ok(Self {
            host,
            port: fc.port.unwrap_or(defaults.port),
            plugin_dirs: fc.plugin_dirs.unwrap_or(defaults.plugin_dirs),
            discovery: DiscoveryOptions {
                max_depth: fc
                    .discovery
                    .max_depth
                    .unwrap_or(defaults.discovery.max_depth),
                suffix: fc.discovery.suffix.unwrap_or(defaults.discovery.suffix),
            },
            server: ServerConfig {
                shutdown_grace: fc
                    .server
                    .shutdown_grace_secs
                    .map_or(defaults.server.shutdown_grace, Duration::from_secs),
                classify_timeout: fc
                    .server
                    .classify_timeout_secs
                    .map_or(defaults.server.classify_timeout, Duration::from_secs),
                reflection: fc.server.reflection.unwrap_or(defaults.server.reflection),
            },
            gateway: DialOptions {
                connect_timeout: fc
                    .gateway
                    .connect_timeout_secs
                    .map_or(defaults.gateway.connect_timeout, Duration::from_secs),
                request_timeout: fc
                    .gateway
                    .request_timeout_secs
                    .map(Duration::from_secs)
                    .or(defaults.gateway.request_timeout),
            },
        })
    }

    /// Check values that would only fail later at startup
    ///
    /// # Errors
    ///
    /// Returns error for empty plugin directory entries, zero discovery depth,
    /// an empty artifact suffix or zero timeouts
    pub fn validate(&self) -> Result<()> {
        if self.plugin_dirs.iter().any(|d| d.as_os_str().is_empty()) {
            return Err(Error::Config("plugin directory path is empty".to_string()));
        }
        if self.discovery.max_depth == 0 {
            return Err(Error::Config(
                "discovery.max_depth must be at least 1".to_string(),
            ));
        }
        if self.discovery.suffix.is_empty() {
            return Err(Error::Config("discovery.suffix must not be empty".to_string()));
        }

        let timeouts = [
            ("server.shutdown_grace_secs", Some(self.server.shutdown_grace)),
            ("server.classify_timeout_secs", Some(self.server.classify_timeout)),
            ("gateway.connect_timeout_secs", Some(self.gateway.connect_timeout)),
            ("gateway.request_timeout_secs", self.gateway.request_timeout),
        ];
        for (key, value) in timeouts {
            if value.is_some_and(|d| d.is_zero()) {
                return Err(Error::Config(format!("{key} must be greater than zero")));
            }
        }

        Ok(())
    }

    /// Socket address to bind
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Multiplexer settings derived from the server section
    #[must_use]
    pub fn mux_options(&self) -> MuxOptions {
        MuxOptions {
            classify_timeout: self.server.classify_timeout,
            ..MuxOptions::default()
        }
    }
}
