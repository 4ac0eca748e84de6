//! Plugin inventory service
//!
//! Reports the plugins activated at startup over gRPC
//! (`portico.core.plugins.v1alpha1.PluginsService/GetConfiguredPlugins`) and
//! REST (`GET /core/plugins/v1alpha1/configured-plugins`). The inventory is
//! frozen once activation completes and never changes afterwards.

use std::sync::Arc;

use axum::http::HeaderMap;
use tonic::{Request, Response, Status};

use crate::Result;
use crate::gateway::{GatewayContext, forward, grpc_request};
use crate::plugins::{PluginDescriptor, sort_plugins};
use crate::proto::plugins::plugins_service_client::PluginsServiceClient;
use crate::proto::plugins::plugins_service_server::{PluginsService, PluginsServiceServer};
use crate::proto::plugins::{GetConfiguredPluginsRequest, GetConfiguredPluginsResponse};
use crate::rpc::ServiceRegistrar;

/// REST path of the inventory listing
pub const CONFIGURED_PLUGINS_PATH: &str = "/core/plugins/v1alpha1/configured-plugins";

/// Read-only list of activated plugins
#[derive(Debug, Clone)]
pub struct InventoryService {
    plugins: Arc<[PluginDescriptor]>,
}

impl InventoryService {
    /// Freeze an inventory from the plugins activated at startup
    ///
    /// The list is sorted by name, then version; duplicates are kept.
    #[must_use]
    pub fn new(mut plugins: Vec<PluginDescriptor>) -> Self {
        sort_plugins(&mut plugins);
        Self {
            plugins: plugins.into(),
        }
    }

    /// The frozen, sorted plugin list
    #[must_use]
    pub fn plugins(&self) -> &[PluginDescriptor] {
        &self.plugins
    }

    /// Register the gRPC service and its REST mapping
    ///
    /// The inventory registers through the same paths as any plugin but is not
    /// listed in its own output.
    ///
    /// # Errors
    ///
    /// Returns error if the service name or REST route is already taken
    pub fn register(
        self,
        server: &mut ServiceRegistrar,
        gateway: &mut GatewayContext<'_>,
    ) -> Result<()> {
        server.add_service(PluginsServiceServer::new(self))?;

        let client = PluginsServiceClient::new(gateway.channel());
        gateway
            .mux()
            .get(CONFIGURED_PLUGINS_PATH, move |headers: HeaderMap| {
                let mut client = client.clone();
                async move {
                    let request = grpc_request(GetConfiguredPluginsRequest {}, &headers);
                    forward(client.get_configured_plugins(request).await)
                }
            })?;

        Ok(())
    }
}

#[tonic::async_trait]
impl PluginsService for InventoryService {
    async fn get_configured_plugins(
        &self,
        _request: Request<GetConfiguredPluginsRequest>,
    ) -> std::result::Result<Response<GetConfiguredPluginsResponse>, Status> {
        Ok(Response::new(GetConfiguredPluginsResponse {
            plugins: self.plugins.iter().cloned().map(Into::into).collect(),
        }))
    }
}
