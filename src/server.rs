//! Gateway server - activation, binding and dual-protocol serving
//!
//! Startup runs in three steps, each its own type:
//!
//! 1. [`ServerBuilder::activate`] discovers plugin artifacts, activates
//!    builtin plugins and artifacts in order, and freezes the inventory.
//! 2. [`ActivatedServer::bind`] binds the single listening port.
//! 3. [`BoundServer::serve`] splits the port into a gRPC listener (tonic) and
//!    an HTTP listener (axum) and serves until shutdown.
//!
//! No connection is accepted before activation has finished.

use std::future::Future;
use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tonic::service::Routes;

use crate::config::Config;
use crate::gateway::{GatewayContext, GatewayMux, LoopbackAddr};
use crate::inventory::InventoryService;
use crate::mux::{ConnectionMux, Matcher};
use crate::plugins::{
    ActivatedPlugins, Plugin, PluginActivator, PluginDescriptor, PluginSource, discover_plugins,
};
use crate::rpc::ServiceRegistrar;
use crate::shutdown::shutdown_signal;
use crate::{Error, Result, proto};

/// Collects configuration and builtin plugins before activation
pub struct ServerBuilder {
    config: Config,
    builtins: Vec<Box<dyn Plugin>>,
}

impl ServerBuilder {
    /// Start building a server
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            builtins: Vec::new(),
        }
    }

    /// Add a plugin compiled into the binary
    ///
    /// Builtin plugins are activated before discovered artifacts, in the order
    /// they were added.
    #[must_use]
    pub fn plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.builtins.push(Box::new(plugin));
        self
    }

    /// Add an already boxed builtin plugin
    #[must_use]
    pub fn boxed_plugin(mut self, plugin: Box<dyn Plugin>) -> Self {
        self.builtins.push(plugin);
        self
    }

    /// Discover and activate every plugin
    ///
    /// Must be called from within a Tokio runtime: plugins receive lazily
    /// connecting channels whose workers are spawned immediately.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid, discovery fails, or any
    /// plugin fails to load or register. Nothing after the failing plugin is
    /// activated.
    pub fn activate(self) -> Result<ActivatedServer> {
        let Self { config, builtins } = self;
        config.validate()?;

        let artifacts = discover_plugins(&config.plugin_dirs, &config.discovery)?;
        tracing::info!(
            builtin = builtins.len(),
            discovered = artifacts.len(),
            "activating plugins"
        );

        let cancel = CancellationToken::new();
        let loopback = LoopbackAddr::default();
        let mut registrar = ServiceRegistrar::new();
        let mut mux = GatewayMux::new();

        let (plugins, inventory) = {
            let mut gateway = GatewayContext::new(
                &mut mux,
                loopback.clone(),
                config.gateway.clone(),
                cancel.clone(),
            );

            let sources = builtins
                .into_iter()
                .map(PluginSource::Builtin)
                .chain(artifacts.into_iter().map(PluginSource::Artifact));
            let plugins = PluginActivator::new(&mut registrar, &mut gateway).activate_all(sources)?;

            let inventory = InventoryService::new(plugins.descriptors().to_vec());
            inventory.clone().register(&mut registrar, &mut gateway)?;
            (plugins, inventory)
        };

        registrar.add_file_descriptor_set(proto::FILE_DESCRIPTOR_SET);
        let services = registrar.services().count();
        let routes = registrar.into_routes(config.server.reflection)?;

        tracing::info!(
            plugins = plugins.len(),
            services,
            routes = mux.len(),
            "plugins activated"
        );

        Ok(ActivatedServer {
            config,
            routes,
            router: mux.into_router(),
            plugins,
            inventory,
            loopback,
            cancel,
        })
    }
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("builtins", &self.builtins.len())
            .finish()
    }
}

/// Server with every plugin activated, not yet listening
pub struct ActivatedServer {
    config: Config,
    routes: Routes,
    router: Router,
    plugins: ActivatedPlugins,
    inventory: InventoryService,
    loopback: LoopbackAddr,
    cancel: CancellationToken,
}

impl ActivatedServer {
    /// Activated plugins, sorted by name then version
    #[must_use]
    pub fn inventory(&self) -> &[PluginDescriptor] {
        self.inventory.plugins()
    }

    /// Token that stops the server when cancelled
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Bind the listening port
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound
    pub async fn bind(self) -> Result<BoundServer> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| Error::Bind { addr, source })?;

        if !self.loopback.set(local_addr) {
            return Err(Error::Server("server is already bound".to_string()));
        }

        tracing::info!(addr = %local_addr, "listening");

        Ok(BoundServer {
            listener,
            local_addr,
            server: self,
        })
    }
}

impl std::fmt::Debug for ActivatedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivatedServer")
            .field("config", &self.config)
            .field("plugins", &self.plugins)
            .finish_non_exhaustive()
    }
}

/// Server bound to its port, ready to serve
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    server: ActivatedServer,
}

impl BoundServer {
    /// Address actually bound (useful with port 0)
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Activated plugins, sorted by name then version
    #[must_use]
    pub fn inventory(&self) -> &[PluginDescriptor] {
        self.server.inventory()
    }

    /// Token that stops the server when cancelled
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.server.cancellation_token()
    }

    /// Serve until Ctrl+C or SIGTERM
    ///
    /// # Errors
    ///
    /// Returns error if an engine or the accept loop fails
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(shutdown_signal()).await
    }

    /// Serve until `signal` resolves or the cancellation token fires
    ///
    /// # Errors
    ///
    /// Returns error if an engine or the accept loop fails
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Self {
            listener,
            local_addr,
            server,
        } = self;
        let ActivatedServer {
            config,
            routes,
            router,
            plugins,
            cancel,
            ..
        } = server;

        let mut mux = ConnectionMux::new(listener, config.mux_options())?;
        let grpc_listener = mux.match_with(Matcher::grpc());
        let http_listener = mux.match_with(Matcher::any());

        let mut engines = JoinSet::new();

        let grpc_cancel = cancel.clone();
        engines.spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_routes(routes)
                .serve_with_incoming_shutdown(grpc_listener, async move {
                    grpc_cancel.cancelled().await;
                })
                .await
                .map_err(Error::from);
            ("grpc", result)
        });

        let http_cancel = cancel.clone();
        engines.spawn(async move {
            let result = axum::serve(http_listener, router)
                .with_graceful_shutdown(async move {
                    http_cancel.cancelled().await;
                })
                .await
                .map_err(|e| Error::Server(format!("http engine failed: {e}")));
            ("http", result)
        });

        let mux_cancel = cancel.clone();
        engines.spawn(async move { ("multiplexer", mux.serve(mux_cancel).await) });

        tracing::info!(
            addr = %local_addr,
            plugins = plugins.len(),
            "serving grpc and rest"
        );

        // Engines stop on their own once the token fires, so a requested
        // shutdown must win over the engine exits it causes
        let outcome = tokio::select! {
            biased;

            () = signal => {
                tracing::info!("shutdown requested");
                Ok(())
            }
            () = cancel.cancelled() => {
                tracing::info!("server cancelled");
                Ok(())
            }
            Some(joined) = engines.join_next() => match joined {
                Ok((name, Ok(()))) if cancel.is_cancelled() => {
                    tracing::debug!(engine = name, "engine stopped");
                    Ok(())
                }
                Ok((name, Ok(()))) => {
                    tracing::error!(engine = name, "engine stopped unexpectedly");
                    Err(Error::Server(format!("{name} engine stopped unexpectedly")))
                }
                Ok((name, Err(e))) => {
                    tracing::error!(engine = name, error = %e, "engine failed");
                    Err(e)
                }
                Err(e) => {
                    tracing::error!(error = %e, "engine task failed");
                    Err(Error::Server(format!("engine task failed: {e}")))
                }
            },
        };

        cancel.cancel();
        drain(&mut engines, config.server.shutdown_grace).await;

        // Plugins outlive the engines that call into them
        drop(plugins);
        outcome
    }
}

impl std::fmt::Debug for BoundServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundServer")
            .field("local_addr", &self.local_addr)
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

/// Wait for engines to stop, aborting whatever outlives the grace period
async fn drain(engines: &mut JoinSet<(&'static str, Result<()>)>, grace: std::time::Duration) {
    let wait = async {
        while let Some(joined) = engines.join_next().await {
            match joined {
                Ok((name, Ok(()))) => tracing::debug!(engine = name, "engine stopped"),
                Ok((name, Err(e))) => {
                    tracing::warn!(engine = name, error = %e, "engine failed during shutdown");
                }
                Err(e) => tracing::warn!(error = %e, "engine task failed during shutdown"),
            }
        }
    };

    if tokio::time::timeout(grace, wait).await.is_err() {
        tracing::warn!(
            grace_secs = grace.as_secs_f64(),
            remaining = engines.len(),
            "engines did not stop in time, aborting"
        );
        engines.abort_all();
    } else {
        tracing::info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::plugins::PluginError;

    struct Named(&'static str);

    impl Plugin for Named {
        fn descriptor(&self) -> PluginDescriptor {
            PluginDescriptor::new(self.0, "v1alpha1")
        }

        fn register(
            &self,
            _server: &mut ServiceRegistrar,
            _gateway: &mut GatewayContext<'_>,
        ) -> std::result::Result<(), PluginError> {
            Ok(())
        }
    }

    fn test_config(plugin_dir: PathBuf) -> Config {
        Config {
            host: "127.0.0.1".parse().unwrap(),
            port: 0,
            plugin_dirs: vec![plugin_dir],
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn activation_freezes_sorted_inventory() {
        let dir = tempfile::tempdir().unwrap();
        let server = ServerBuilder::new(test_config(dir.path().to_path_buf()))
            .plugin(Named("zeta.packages"))
            .plugin(Named("alpha.packages"))
            .activate()
            .unwrap();

        let names: Vec<&str> = server.inventory().iter().map(PluginDescriptor::name).collect();
        assert_eq!(names, vec!["alpha.packages", "zeta.packages"]);
    }

    #[tokio::test]
    async fn invalid_config_fails_activation() {
        let config = Config {
            plugin_dirs: vec![PathBuf::new()],
            ..Config::default()
        };
        assert!(matches!(
            ServerBuilder::new(config).activate(),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn missing_plugin_dir_fails_activation() {
        let config = test_config(PathBuf::from("/nonexistent/portico/plugins"));
        assert!(matches!(
            ServerBuilder::new(config).activate(),
            Err(Error::Discovery { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancellation_is_a_clean_stop_on_multi_thread_runtime() {
        let dir = tempfile::tempdir().unwrap();

        for _ in 0..25 {
            let bound = ServerBuilder::new(test_config(dir.path().to_path_buf()))
                .activate()
                .unwrap()
                .bind()
                .await
                .unwrap();
            let cancel = bound.cancellation_token();
            let serving = tokio::spawn(bound.serve_with_shutdown(std::future::pending()));

            // Let the engines start before stopping them
            tokio::task::yield_now().await;
            cancel.cancel();

            let result = tokio::time::timeout(std::time::Duration::from_secs(15), serving)
                .await
                .unwrap()
                .unwrap();
            assert!(result.is_ok(), "cancelled server reported {result:?}");
        }
    }

    #[tokio::test]
    async fn bind_reports_ephemeral_port_and_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let bound = ServerBuilder::new(test_config(dir.path().to_path_buf()))
            .activate()
            .unwrap()
            .bind()
            .await
            .unwrap();

        assert_ne!(bound.local_addr().port(), 0);
        let cancel = bound.cancellation_token();
        let serving = tokio::spawn(bound.serve_with_shutdown(std::future::pending()));

        cancel.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(15), serving)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
