//! TOML configuration file loading
//!
//! Supports `<config_dir>/portico/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PorticoConfigFile {
    /// Address to bind (e.g. "0.0.0.0" or "127.0.0.1")
    pub host: Option<String>,

    /// Port serving both gRPC and REST
    pub port: Option<u16>,

    /// Directories scanned for plugin artifacts, in order
    pub plugin_dirs: Option<Vec<PathBuf>>,

    /// Plugin discovery settings
    #[serde(default)]
    pub discovery: DiscoveryFileConfig,

    /// Server runtime settings
    #[serde(default)]
    pub server: ServerFileConfig,

    /// REST gateway settings
    #[serde(default)]
    pub gateway: GatewayFileConfig,
}

/// Plugin discovery configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryFileConfig {
    /// Directory levels scanned below each root (1 = direct children)
    pub max_depth: Option<usize>,

    /// Artifact suffix, overriding the platform default
    pub suffix: Option<String>,
}

/// Server runtime configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerFileConfig {
    /// Seconds engines get to drain after shutdown is requested
    pub shutdown_grace_secs: Option<u64>,

    /// Seconds a new connection gets to identify its protocol
    pub classify_timeout_secs: Option<u64>,

    /// Serve gRPC reflection
    pub reflection: Option<bool>,
}

/// REST gateway configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayFileConfig {
    /// Seconds allowed to connect the loopback channel
    pub connect_timeout_secs: Option<u64>,

    /// Deadline for calls forwarded by REST handlers
    pub request_timeout_secs: Option<u64>,
}

/// Load a config file
///
/// With an explicit path the file must exist. Without one, the default path
/// is used when present and defaults apply otherwise.
///
/// # Errors
///
/// Returns error if an explicit file is missing, or any file cannot be read
/// or parsed
pub fn load_config_file(path: Option<&Path>) -> Result<PorticoConfigFile> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match config_file_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(PorticoConfigFile::default()),
        },
    };

    let content = std::fs::read_to_string(&path).map_err(|e| {
        Error::Config(format!("failed to read config file {}: {e}", path.display()))
    })?;
    let config = toml::from_str(&content)?;

    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Return the default config file path: `<config_dir>/portico/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("portico").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_file() {
        let config: PorticoConfigFile = toml::from_str(
            r#"
            port = 8080
            plugin_dirs = ["/opt/portico/plugins", "/usr/lib/portico"]

            [server]
            shutdown_grace_secs = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.port, Some(8080));
        assert_eq!(
            config.plugin_dirs,
            Some(vec![
                PathBuf::from("/opt/portico/plugins"),
                PathBuf::from("/usr/lib/portico"),
            ])
        );
        assert_eq!(config.server.shutdown_grace_secs, Some(3));
        assert!(config.server.reflection.is_none());
        assert!(config.discovery.max_depth.is_none());
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config: PorticoConfigFile = toml::from_str("").unwrap();
        assert!(config.port.is_none());
        assert!(config.plugin_dirs.is_none());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<PorticoConfigFile>("prot = 1").is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = load_config_file(Some(Path::new("/nonexistent/portico.toml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn loads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = 9090\n[discovery]\nmax_depth = 2\n").unwrap();

        let config = load_config_file(Some(&path)).unwrap();
        assert_eq!(config.port, Some(9090));
        assert_eq!(config.discovery.max_depth, Some(2));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();

        assert!(matches!(
            load_config_file(Some(&path)),
            Err(Error::Toml(_))
        ));
    }
}
