//! REST gateway shared by all plugins
//!
//! Every plugin maps its REST surface onto one [`GatewayMux`]. Handlers reach
//! their gRPC backend through [`GatewayContext::channel`], a client channel
//! that dials the gateway's own listening port, so REST calls travel the same
//! path as external gRPC traffic.

pub mod status;

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::Router;
use axum::handler::Handler;
use axum::http::Method;
use axum::routing::{MethodFilter, on};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tower_http::trace::TraceLayer;

use crate::{Error, Result};

pub use status::{
    ErrorBody, GatewayError, METADATA_HEADER_PREFIX, forward, grpc_request, http_status,
    metadata_from_headers,
};

/// Authority used for loopback calls; the connector ignores it
const LOOPBACK_AUTHORITY: &str = "http://portico.loopback";

/// How the gateway dials its own gRPC endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialOptions {
    /// Time allowed to establish the loopback connection
    pub connect_timeout: Duration,

    /// Per-call deadline applied to forwarded calls, if any
    pub request_timeout: Option<Duration>,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: None,
        }
    }
}

/// Address of the gateway's own listener, known once the port is bound
#[derive(Debug, Clone, Default)]
pub struct LoopbackAddr(Arc<OnceLock<SocketAddr>>);

impl LoopbackAddr {
    /// The dialable address, if the listener is bound
    #[must_use]
    pub fn get(&self) -> Option<SocketAddr> {
        self.0.get().copied()
    }

    /// Record the bound address; wildcard IPs are replaced by loopback
    ///
    /// Returns `false` if an address was already recorded.
    pub fn set(&self, bound: SocketAddr) -> bool {
        let ip = match bound.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        self.0.set(SocketAddr::new(ip, bound.port())).is_ok()
    }
}

/// What a plugin receives to register its REST surface
pub struct GatewayContext<'a> {
    mux: &'a mut GatewayMux,
    loopback: LoopbackAddr,
    dial: DialOptions,
    cancel: CancellationToken,
}

impl<'a> GatewayContext<'a> {
    /// Create a context over a mux
    pub fn new(
        mux: &'a mut GatewayMux,
        loopback: LoopbackAddr,
        dial: DialOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            mux,
            loopback,
            dial,
            cancel,
        }
    }

    /// The shared REST route table
    pub fn mux(&mut self) -> &mut GatewayMux {
        self.mux
    }

    /// Lazily connecting channel to the gateway's own gRPC endpoint
    ///
    /// The connection is made on first use, after the listener is bound.
    /// Calls made before that fail with `Unavailable`.
    #[must_use]
    pub fn channel(&self) -> Channel {
        let mut endpoint =
            Endpoint::from_static(LOOPBACK_AUTHORITY).connect_timeout(self.dial.connect_timeout);
        if let Some(timeout) = self.dial.request_timeout {
            endpoint = endpoint.timeout(timeout);
        }

        let loopback = self.loopback.clone();
        endpoint.connect_with_connector_lazy(tower::service_fn(move |_: http::Uri| {
            let loopback = loopback.clone();
            async move {
                let addr = loopback.get().ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotConnected,
                        "gateway listener is not bound yet",
                    )
                })?;
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
    }

    /// Address the loopback channel dials, once bound
    #[must_use]
    pub fn loopback_addr(&self) -> Option<SocketAddr> {
        self.loopback.get()
    }

    /// Options used for the loopback channel
    #[must_use]
    pub fn dial_options(&self) -> &DialOptions {
        &self.dial
    }

    /// Token cancelled when the gateway shuts down
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// REST route table
///
/// Routes are checked before they reach the router: registering the same
/// method and path twice, or two paths the router would consider ambiguous,
/// is reported as [`Error::RouteConflict`].
#[derive(Default)]
pub struct GatewayMux {
    router: Router,
    routes: BTreeSet<(String, String)>,
    // Normalized path -> path as registered
    shapes: HashMap<String, String>,
    // Normalized prefix ending in a parameter -> parameter name
    params: HashMap<String, String>,
}

impl GatewayMux {
    /// Create an empty route table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `method path` to a handler
    ///
    /// Paths use `{name}` for a segment parameter and `{*name}` for a
    /// trailing wildcard.
    ///
    /// # Errors
    ///
    /// Returns error if the path is malformed or conflicts with an existing
    /// route
    pub fn handle<H, T>(&mut self, method: &Method, path: &str, handler: H) -> Result<&mut Self>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        let filter = MethodFilter::try_from(method.clone()).map_err(|_| Error::InvalidRoute {
            path: path.to_string(),
            reason: format!("unsupported method {method}"),
        })?;
        let route = RouteShape::parse(path)?;

        let key = (method.to_string(), path.to_string());
        if self.routes.contains(&key) {
            return Err(Error::RouteConflict {
                method: key.0,
                path: key.1,
                existing: format!("{method} {path}"),
            });
        }
        if let Some(existing) = self.shapes.get(&route.shape)
            && existing != path
        {
            return Err(Error::RouteConflict {
                method: key.0,
                path: key.1,
                existing: existing.clone(),
            });
        }
        for (prefix, name) in &route.params {
            if let Some(existing) = self.params.get(prefix)
                && existing != name
            {
                return Err(Error::RouteConflict {
                    method: key.0,
                    path: key.1,
                    existing: format!("parameter {{{existing}}}"),
                });
            }
        }

        self.shapes.insert(route.shape, path.to_string());
        self.params.extend(route.params);
        self.routes.insert(key);

        let router = std::mem::take(&mut self.router);
        self.router = router.route(path, on(filter, handler));

        tracing::debug!(%method, path, "registered gateway route");
        Ok(self)
    }

    /// Map `GET path` to a handler
    ///
    /// # Errors
    ///
    /// See [`GatewayMux::handle`]
    pub fn get<H, T>(&mut self, path: &str, handler: H) -> Result<&mut Self>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.handle(&Method::GET, path, handler)
    }

    /// Map `POST path` to a handler
    ///
    /// # Errors
    ///
    /// See [`GatewayMux::handle`]
    pub fn post<H, T>(&mut self, path: &str, handler: H) -> Result<&mut Self>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.handle(&Method::POST, path, handler)
    }

    /// Map `PUT path` to a handler
    ///
    /// # Errors
    ///
    /// See [`GatewayMux::handle`]
    pub fn put<H, T>(&mut self, path: &str, handler: H) -> Result<&mut Self>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.handle(&Method::PUT, path, handler)
    }

    /// Map `PATCH path` to a handler
    ///
    /// # Errors
    ///
    /// See [`GatewayMux::handle`]
    pub fn patch<H, T>(&mut self, path: &str, handler: H) -> Result<&mut Self>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.handle(&Method::PATCH, path, handler)
    }

    /// Map `DELETE path` to a handler
    ///
    /// # Errors
    ///
    /// See [`GatewayMux::handle`]
    pub fn delete<H, T>(&mut self, path: &str, handler: H) -> Result<&mut Self>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.handle(&Method::DELETE, path, handler)
    }

    /// Registered `(method, path)` pairs, sorted
    pub fn routes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.routes.iter().map(|(m, p)| (m.as_str(), p.as_str()))
    }

    /// Number of registered routes
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no route is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Finish registration; unmatched requests get a JSON `NotFound`
    #[must_use]
    pub fn into_router(self) -> Router {
        self.router
            .fallback(not_found)
            .layer(TraceLayer::new_for_http())
    }
}

impl std::fmt::Debug for GatewayMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayMux")
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

async fn not_found() -> GatewayError {
    GatewayError::not_found()
}

/// Normalized form of a route path used for conflict checks
struct RouteShape {
    shape: String,
    params: Vec<(String, String)>,
}

impl RouteShape {
    fn parse(path: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidRoute {
            path: path.to_string(),
            reason: reason.to_string(),
        };

        let Some(rest) = path.strip_prefix('/') else {
            return Err(invalid("path must start with '/'"));
        };

        let segments: Vec<&str> = rest.split('/').collect();
        let mut shape = String::new();
        let mut params = Vec::new();

        for (i, segment) in segments.iter().enumerate() {
            shape.push('/');

            if segment.starts_with(':') || segment.starts_with('*') {
                return Err(invalid("use {name} or {*name} for parameters"));
            }

            match segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(name) => {
                    let (marker, name) = match name.strip_prefix('*') {
                        Some(name) if i + 1 == segments.len() => ("{*}", name),
                        Some(_) => return Err(invalid("wildcard must be the last segment")),
                        None => ("{}", name),
                    };
                    if name.is_empty() || name.contains(['{', '}', '*']) {
                        return Err(invalid("malformed parameter"));
                    }
                    params.push((format!("{shape}{{}}"), name.to_string()));
                    shape.push_str(marker);
                }
                None if segment.contains(['{', '}']) => {
                    return Err(invalid("parameters must span a whole segment"));
                }
                None => shape.push_str(segment),
            }
        }

        Ok(Self { shape, params })
    }
}
