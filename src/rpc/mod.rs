//! gRPC service registry shared by all plugins
//!
//! Plugins add their generated tonic servers here during activation. Service
//! names are unique across the whole gateway; the registry is turned into a
//! single set of routes once activation completes.

use std::collections::BTreeSet;
use std::convert::Infallible;

use tonic::body::Body;
use tonic::server::NamedService;
use tonic::service::{Routes, RoutesBuilder};
use tower::Service;

use crate::{Error, Result};

/// Collects gRPC services before the engine starts
#[derive(Default)]
pub struct ServiceRegistrar {
    routes: RoutesBuilder,
    services: BTreeSet<&'static str>,
    descriptor_sets: Vec<&'static [u8]>,
}

impl ServiceRegistrar {
    /// Create an empty registrar
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a gRPC service
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceConflict`] if a service with the same fully
    /// qualified name is already registered
    pub fn add_service<S>(&mut self, service: S) -> Result<&mut Self>
    where
        S: Service<http::Request<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Response: axum::response::IntoResponse,
        S::Future: Send + 'static,
    {
        if !self.services.insert(S::NAME) {
            return Err(Error::ServiceConflict {
                service: S::NAME.to_string(),
            });
        }

        self.routes.add_service(service);
        tracing::debug!(service = S::NAME, "registered grpc service");
        Ok(self)
    }

    /// Publish an encoded `FileDescriptorSet` through server reflection
    pub fn add_file_descriptor_set(&mut self, encoded: &'static [u8]) -> &mut Self {
        self.descriptor_sets.push(encoded);
        self
    }

    /// Whether a service with this fully qualified name is registered
    #[must_use]
    pub fn contains(&self, service: &str) -> bool {
        self.services.contains(service)
    }

    /// Registered service names, sorted
    pub fn services(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.services.iter().copied()
    }

    /// Finish registration, optionally adding the reflection services
    ///
    /// # Errors
    ///
    /// Returns error if a descriptor set cannot be decoded or a plugin already
    /// claimed a reflection service name
    pub fn into_routes(mut self, reflection: bool) -> Result<Routes> {
        if reflection {
            self.add_reflection()?;
        }

        tracing::debug!(
            services = self.services.len(),
            reflection,
            "grpc services ready"
        );
        Ok(self.routes.routes())
    }

    fn add_reflection(&mut self) -> Result<()> {
        let v1 = self
            .reflection_builder()
            .build_v1()
            .map_err(|e| Error::Server(format!("failed to build reflection service: {e}")))?;
        let v1alpha = self
            .reflection_builder()
            .build_v1alpha()
            .map_err(|e| Error::Server(format!("failed to build reflection service: {e}")))?;

        self.add_service(v1)?;
        self.add_service(v1alpha)?;
        Ok(())
    }

    fn reflection_builder(&self) -> tonic_reflection::server::Builder<'static> {
        self.descriptor_sets.iter().copied().fold(
            tonic_reflection::server::Builder::configure(),
            |builder, set| builder.register_encoded_file_descriptor_set(set),
        )
    }
}

impl std::fmt::Debug for ServiceRegistrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistrar")
            .field("services", &self.services)
            .field("descriptor_sets", &self.descriptor_sets.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::future;
    use std::task::{Context, Poll};

    use http::{Request, Response};

    use super::*;

    const GREETER: &str = "portico.test.Greeter";

    #[derive(Clone)]
    struct Greeter;

    impl NamedService for Greeter {
        const NAME: &'static str = GREETER;
    }

    impl Service<Request<Body>> for Greeter {
        type Response = Response<Body>;
        type Error = Infallible;
        type Future = future::Ready<std::result::Result<Self::Response, Self::Error>>;

        fn poll_ready(
            &mut self,
            _cx: &mut Context<'_>,
        ) -> Poll<std::result::Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: Request<Body>) -> Self::Future {
            future::ready(Ok(Response::new(Body::empty())))
        }
    }

    #[test]
    fn registers_services_by_name() {
        let mut registrar = ServiceRegistrar::new();
        registrar.add_service(Greeter).unwrap();

        assert!(registrar.contains(GREETER));
        assert_eq!(registrar.services().collect::<Vec<_>>(), vec![GREETER]);
    }

    #[test]
    fn rejects_duplicate_service_names() {
        let mut registrar = ServiceRegistrar::new();
        registrar.add_service(Greeter).unwrap();

        let err = registrar.add_service(Greeter).unwrap_err();
        assert!(matches!(err, Error::ServiceConflict { ref service } if service == GREETER));
    }

    #[test]
    fn reflection_registers_both_versions() {
        let mut registrar = ServiceRegistrar::new();
        registrar.add_file_descriptor_set(crate::proto::FILE_DESCRIPTOR_SET);
        registrar.add_reflection().unwrap();

        assert!(registrar.contains("grpc.reflection.v1.ServerReflection"));
        assert!(registrar.contains("grpc.reflection.v1alpha.ServerReflection"));
    }

    #[test]
    fn reflection_name_cannot_be_claimed_twice() {
        let mut registrar = ServiceRegistrar::new();
        registrar.add_reflection().unwrap();
        assert!(registrar.add_reflection().is_err());
    }

    #[test]
    fn builds_routes_without_reflection() {
        let mut registrar = ServiceRegistrar::new();
        registrar.add_service(Greeter).unwrap();
        assert!(registrar.into_routes(false).is_ok());
    }
}
