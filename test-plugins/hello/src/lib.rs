//! Plugin library loaded from disk by the integration tests
//!
//! Registers one REST route and no gRPC service. The handler avoids anything
//! that needs the host's Tokio context, since this library carries its own
//! copy of every dependency.

use portico::plugins::{Plugin, PluginDescriptor, PluginError};
use portico::{GatewayContext, ServiceRegistrar};

#[derive(Default)]
struct Hello;

impl Plugin for Hello {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new("hello.packages", "v1alpha1")
    }

    fn register(
        &self,
        _server: &mut ServiceRegistrar,
        gateway: &mut GatewayContext<'_>,
    ) -> Result<(), PluginError> {
        gateway
            .mux()
            .get("/hello/v1alpha1/greeting", || async { "hello" })?;
        Ok(())
    }
}

portico::export_plugin!(Hello::default);
