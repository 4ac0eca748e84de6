use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use portico::{Config, ServerBuilder};

/// Portico - pluggable gRPC and REST gateway on a single port
#[derive(Parser)]
#[command(name = "portico", version, about)]
struct Cli {
    /// Port serving both gRPC and REST [default: 50051]
    #[arg(short, long, env = "PORTICO_PORT")]
    port: Option<u16>,

    /// Directory to scan for plugins (repeatable, scanned in order) [default: .]
    #[arg(
        long = "plugin-dir",
        env = "PORTICO_PLUGIN_DIRS",
        value_delimiter = ',',
        num_args = 1..
    )]
    plugin_dirs: Vec<PathBuf>,

    /// Config file [default: <config_dir>/portico/config.toml]
    #[arg(short, long, env = "PORTICO_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity; RUST_LOG wins when set
    let filter = match cli.verbose {
        0 => "info,portico=info",
        1 => "info,portico=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;

    // CLI and env (via clap) > config file > defaults
    if let Some(port) = cli.port {
        config.port = port;
    }
    if !cli.plugin_dirs.is_empty() {
        config.plugin_dirs = cli.plugin_dirs;
    }

    tracing::info!(
        port = config.port,
        plugin_dirs = ?config.plugin_dirs,
        "starting portico"
    );
    tracing::debug!(?config, "loaded configuration");

    let server = ServerBuilder::new(config).activate()?.bind().await?;
    server.serve().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_dirs_are_repeatable_and_ordered() {
        let cli = Cli::parse_from([
            "portico",
            "--plugin-dir",
            "/plugins",
            "--plugin-dir",
            "/other",
        ]);
        assert_eq!(
            cli.plugin_dirs,
            vec![PathBuf::from("/plugins"), PathBuf::from("/other")]
        );
    }

    #[test]
    fn plugin_dirs_accept_comma_list() {
        let cli = Cli::parse_from(["portico", "--plugin-dir", "/plugins,/other"]);
        assert_eq!(cli.plugin_dirs.len(), 2);
    }

    #[test]
    fn flags_are_optional() {
        let cli = Cli::parse_from(["portico", "-p", "8080", "-vv"]);
        assert_eq!(cli.port, Some(8080));
        assert_eq!(cli.verbose, 2);
        assert!(cli.config.is_none());
    }

    #[test]
    fn invalid_port_is_rejected() {
        assert!(Cli::try_parse_from(["portico", "--port", "70000"]).is_err());
    }
}
