//! Plugin system for the Portico gateway
//!
//! Plugins are shared libraries discovered in the configured plugin
//! directories. Each library exports a factory (see [`export_plugin!`]) that
//! produces a [`Plugin`]; activating the plugin registers its gRPC services with
//! the shared [`ServiceRegistrar`] and its REST mapping with the shared
//! [`GatewayContext`].
//!
//! Plugin libraries must be built with the same compiler and the same version
//! of this crate as the gateway, since the entry point uses the Rust ABI.
//!
//! # Example
//!
//! ```rust,ignore
//! use portico::plugins::{Plugin, PluginDescriptor, PluginError};
//! use portico::{GatewayContext, ServiceRegistrar};
//!
//! #[derive(Default)]
//! struct Weather;
//!
//! impl Plugin for Weather {
//!     fn descriptor(&self) -> PluginDescriptor {
//!         PluginDescriptor::new("weather.packages", "v1alpha1")
//!     }
//!
//!     fn register(
//!         &self,
//!         server: &mut ServiceRegistrar,
//!         gateway: &mut GatewayContext<'_>,
//!     ) -> Result<(), PluginError> {
//!         server.add_service(WeatherServiceServer::new(WeatherService))?;
//!         let client = WeatherServiceClient::new(gateway.channel());
//!         gateway.mux().get("/weather/v1alpha1/forecast", forecast_handler(client))?;
//!         Ok(())
//!     }
//! }
//!
//! portico::export_plugin!(Weather::default);
//! ```

pub mod descriptor;
pub mod discovery;
pub mod loader;

use thiserror::Error;

use crate::gateway::GatewayContext;
use crate::rpc::ServiceRegistrar;

pub use descriptor::{PluginDescriptor, sort_plugins};
pub use discovery::{DiscoveryOptions, PLUGIN_SUFFIX, discover_plugins};
pub use loader::{ActivatedPlugins, LoadedPlugin, PluginActivator, PluginSource, load_plugin};

/// Name of the factory symbol every plugin library exports
pub const PLUGIN_ENTRY_SYMBOL: &str = "_portico_plugin_create";

/// Signature of the exported plugin factory
pub type PluginFactory = fn() -> Box<dyn Plugin>;

/// A unit of services activated by the gateway at startup
pub trait Plugin: Send + Sync {
    /// Identity reported by the inventory service
    fn descriptor(&self) -> PluginDescriptor;

    /// Register gRPC services and REST routes
    ///
    /// Called exactly once, before the gateway starts accepting connections.
    ///
    /// # Errors
    ///
    /// Returning an error aborts gateway startup
    fn register(
        &self,
        server: &mut ServiceRegistrar,
        gateway: &mut GatewayContext<'_>,
    ) -> Result<(), PluginError>;
}

/// Failure reported by a plugin during registration
#[derive(Debug, Error)]
pub enum PluginError {
    /// Service or route registration was rejected by the gateway
    #[error(transparent)]
    Registration(#[from] Box<crate::Error>),

    /// Plugin-specific failure
    #[error("{0}")]
    Failed(String),
}

impl PluginError {
    /// Create a plugin-specific failure
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<crate::Error> for PluginError {
    fn from(err: crate::Error) -> Self {
        Self::Registration(Box::new(err))
    }
}

/// Export a plugin factory from a plugin library
///
/// Takes a path to a function (or constructor) returning a type that
/// implements [`Plugin`].
#[macro_export]
macro_rules! export_plugin {
    ($constructor:path) => {
        #[allow(unsafe_code)]
        #[unsafe(no_mangle)]
        pub fn _portico_plugin_create() -> ::std::boxed::Box<dyn $crate::plugins::Plugin> {
            ::std::boxed::Box::new($constructor())
        }

        const _: $crate::plugins::PluginFactory = _portico_plugin_create;
    };
}
