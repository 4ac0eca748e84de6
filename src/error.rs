//! Error types for the Portico gateway

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for Portico operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while starting or running the gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error without path context
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A plugin directory could not be scanned
    #[error("failed to read plugin directory {}: {source}", path.display())]
    Discovery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A plugin artifact could not be loaded into the process
    #[error("failed to load plugin {}: {source}", path.display())]
    PluginLoad {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    /// A loaded artifact does not export the plugin entry point
    #[error("plugin {} does not export `{symbol}`: {source}", path.display())]
    MissingEntryPoint {
        path: PathBuf,
        symbol: &'static str,
        #[source]
        source: libloading::Error,
    },

    /// A plugin reported failure while registering
    #[error("failed to activate plugin {plugin}: {source}")]
    Activation {
        plugin: String,
        #[source]
        source: crate::plugins::PluginError,
    },

    /// Two registrations claimed the same gRPC service
    #[error("gRPC service {service} is already registered")]
    ServiceConflict { service: String },

    /// Two registrations claimed overlapping REST routes
    #[error("gateway route {method} {path} conflicts with {existing}")]
    RouteConflict {
        method: String,
        path: String,
        existing: String,
    },

    /// A REST route pattern was rejected before reaching the router
    #[error("invalid gateway route {path}: {reason}")]
    InvalidRoute { path: String, reason: String },

    /// The listening socket could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// gRPC transport error
    #[error("grpc transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Serving loop failure
    #[error("server error: {0}")]
    Server(String),
}
