//! Portico - pluggable gRPC and REST gateway
//!
//! Serves gRPC and a REST/JSON gateway on one port, backed by plugins that
//! are discovered as shared libraries at startup (or compiled in).
//!
//! # Architecture
//!
//! ```text
//!            clients (gRPC over HTTP/2, REST over HTTP/1.1 or h2c)
//!                                  │
//! ┌────────────────────────────────▼────────────────────────────────┐
//! │              ConnectionMux (one port, sniffs each conn)          │
//! └───────────────┬─────────────────────────────────┬────────────────┘
//!                 │ application/grpc                │ everything else
//! ┌───────────────▼──────────────┐   ┌──────────────▼────────────────┐
//! │  tonic (ServiceRegistrar)    │◄──│  axum (GatewayMux)            │
//! │  plugin services, inventory, │   │  plugin REST routes, inventory│
//! │  reflection                  │   │  route; calls gRPC on loopback│
//! └──────────────────────────────┘   └───────────────────────────────┘
//! ```
//!
//! Startup: discovery → activation (each plugin registers services and
//! routes) → inventory frozen → bind → serve.

pub mod config;
pub mod error;
pub mod gateway;
pub mod inventory;
pub mod mux;
pub mod plugins;
pub mod proto;
pub mod rpc;
pub mod server;
pub mod shutdown;

pub use config::Config;
pub use error::{Error, Result};
pub use gateway::{DialOptions, GatewayContext, GatewayError, GatewayMux};
pub use inventory::InventoryService;
pub use mux::{ConnectionMux, Matcher, MuxConn, MuxListener};
pub use plugins::{Plugin, PluginDescriptor, PluginError};
pub use rpc::ServiceRegistrar;
pub use server::{ActivatedServer, BoundServer, ServerBuilder};
