//! Shared test utilities

// Each test binary uses a different subset
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use portico::plugins::{Plugin, PluginDescriptor, PluginError};
use portico::{Config, GatewayContext, ServerBuilder, ServiceRegistrar};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A gateway serving on an ephemeral loopback port
pub struct TestServer {
    pub addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<portico::Result<()>>,
    _plugin_dir: TempDir,
}

impl TestServer {
    /// Base URL for REST calls
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Connect a gRPC channel to the gateway
    pub async fn channel(&self) -> tonic::transport::Channel {
        tonic::transport::Endpoint::from_shared(format!("http://{}", self.addr))
            .expect("valid endpoint")
            .connect()
            .await
            .expect("failed to connect to test server")
    }

    /// Stop the server and wait for it to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(15), self.handle)
            .await
            .expect("server did not stop in time")
            .expect("server task panicked");
        assert!(result.is_ok(), "server failed: {result:?}");
    }
}

/// Config bound to an ephemeral loopback port with an empty plugin directory
#[must_use]
pub fn test_config(plugin_dir: &TempDir) -> Config {
    Config {
        host: "127.0.0.1".parse().expect("valid host"),
        port: 0,
        plugin_dirs: vec![plugin_dir.path().to_path_buf()],
        ..Config::default()
    }
}

/// Activate, bind and serve a gateway with the given builtin plugins
pub async fn start_server(plugins: Vec<Box<dyn Plugin>>) -> TestServer {
    let plugin_dir = tempfile::tempdir().expect("failed to create plugin dir");
    start_server_in(plugin_dir, plugins).await
}

/// Like [`start_server`], discovering artifacts in `plugin_dir`
pub async fn start_server_in(plugin_dir: TempDir, plugins: Vec<Box<dyn Plugin>>) -> TestServer {
    let builder = plugins
        .into_iter()
        .fold(ServerBuilder::new(test_config(&plugin_dir)), ServerBuilder::boxed_plugin);

    let bound = builder
        .activate()
        .expect("activation failed")
        .bind()
        .await
        .expect("bind failed");

    let addr = bound.local_addr();
    let cancel = bound.cancellation_token();
    let handle = tokio::spawn(bound.serve_with_shutdown(std::future::pending()));

    TestServer {
        addr,
        cancel,
        handle,
        _plugin_dir: plugin_dir,
    }
}

/// Plugin that registers nothing
pub struct Named {
    pub name: &'static str,
    pub version: &'static str,
}

impl Named {
    #[must_use]
    pub fn boxed(name: &'static str, version: &'static str) -> Box<dyn Plugin> {
        Box::new(Self { name, version })
    }
}

impl Plugin for Named {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new(self.name, self.version)
    }

    fn register(
        &self,
        _server: &mut ServiceRegistrar,
        _gateway: &mut GatewayContext<'_>,
    ) -> Result<(), PluginError> {
        Ok(())
    }
}
