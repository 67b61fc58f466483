//! Container-facing adapters: publishing service implementations and
//! invoking remote ones.

use crate::error::{Error, Result};
use crate::handler::{ServiceDefinition, ServiceRegistry};
use crate::protocol::{Request, Value};
use crate::transport::client::RpcClient;
use crate::transport::server::RpcServer;
use sparrow_discovery::{ServiceDiscovery, ServiceName};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Identity of a service implementation: group, version and interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceConfig {
    group: String,
    version: String,
    interface: String,
}

impl ServiceConfig {
    /// Create a config for `interface` with an empty group and version.
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            group: String::new(),
            version: String::new(),
            interface: interface.into(),
        }
    }

    /// Set the group.
    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Set the version.
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// The interface name.
    #[must_use]
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// The logical name the service is published and looked up under.
    #[must_use]
    pub fn service_name(&self) -> ServiceName {
        ServiceName::new(&self.group, &self.version, &self.interface)
    }
}

/// Publishes service implementations on a server and in discovery.
pub struct ServiceProvider<D> {
    discovery: Arc<D>,
    registry: ServiceRegistry,
    address: SocketAddr,
    published: parking_lot::Mutex<Vec<ServiceName>>,
}

impl<D: ServiceDiscovery> ServiceProvider<D> {
    /// Create a provider installing methods into `registry` and advertising
    /// `address`.
    pub fn new(discovery: Arc<D>, registry: ServiceRegistry, address: SocketAddr) -> Self {
        Self {
            discovery,
            registry,
            address,
            published: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Create a provider for a started server dispatching through a
    /// [`ServiceRegistry`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the server has not been started.
    pub fn for_server(discovery: Arc<D>, server: &RpcServer<ServiceRegistry>) -> Result<Self> {
        let address = server
            .advertised_addr()
            .ok_or_else(|| Error::Config("server not started".to_string()))?;
        Ok(Self::new(
            discovery,
            ServiceRegistry::clone(server.handler()),
            address,
        ))
    }

    /// The address registered with discovery.
    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    /// Install `definition` and register this provider's address for it.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyPublished`] if the name is already published here
    /// - [`Error::ServiceUnavailable`] if discovery rejects the
    ///   registration; the methods are removed again
    #[instrument(skip(self, definition), fields(service = %config.service_name()))]
    pub async fn publish_service(
        &self,
        config: &ServiceConfig,
        definition: ServiceDefinition,
    ) -> Result<()> {
        let service = config.service_name();
        self.registry
            .register_service(service.clone(), definition)?;

        if let Err(e) = self.discovery.register(&service, self.address).await {
            self.registry.unregister_service(&service);
            return Err(Error::ServiceUnavailable {
                service: service.to_string(),
                reason: e.to_string(),
            });
        }

        info!("published {} at {}", service, self.address);
        self.published.lock().push(service);
        Ok(())
    }

    /// Withdraw one published service. Returns whether it was published.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceUnavailable`] if discovery fails to
    /// unregister; the methods are removed regardless.
    pub async fn unpublish_service(&self, config: &ServiceConfig) -> Result<bool> {
        let service = config.service_name();
        let was_published = {
            let mut published = self.published.lock();
            let before = published.len();
            published.retain(|s| s != &service);
            published.len() != before
        };
        if !was_published {
            return Ok(false);
        }

        self.withdraw(&service).await?;
        Ok(true)
    }

    /// Withdraw every published service.
    ///
    /// # Errors
    ///
    /// Returns the last discovery failure; every service is attempted.
    pub async fn unpublish_all(&self) -> Result<()> {
        let services = std::mem::take(&mut *self.published.lock());
        let mut result = Ok(());
        for service in &services {
            if let Err(e) = self.withdraw(service).await {
                warn!("failed to unpublish {}: {}", service, e);
                result = Err(e);
            }
        }
        result
    }

    /// Names currently published by this provider.
    #[must_use]
    pub fn published(&self) -> Vec<ServiceName> {
        self.published.lock().clone()
    }

    async fn withdraw(&self, service: &ServiceName) -> Result<()> {
        self.registry.unregister_service(service);
        self.discovery
            .unregister(service, self.address)
            .await
            .map_err(|e| Error::ServiceUnavailable {
                service: service.to_string(),
                reason: e.to_string(),
            })?;
        info!("unpublished {} at {}", service, self.address);
        Ok(())
    }
}

/// Caller-side handle to a remote service.
pub struct ServiceReference<D> {
    client: Arc<RpcClient<D>>,
    service: ServiceName,
    timeout: Duration,
}

impl<D: ServiceDiscovery> ServiceReference<D> {
    /// Bind `config` to `client`, using the client's default timeout.
    pub fn new(client: Arc<RpcClient<D>>, config: &ServiceConfig) -> Self {
        let timeout = client.config().default_timeout;
        Self {
            client,
            service: config.service_name(),
            timeout,
        }
    }

    /// Override the call timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The referenced service.
    #[must_use]
    pub const fn service(&self) -> &ServiceName {
        &self.service
    }

    /// Call `method` remotely and return its result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RemoteFailure`] if the remote side answered FAIL,
    /// or any transport error from [`RpcClient::call`].
    pub async fn invoke(&self, method: &str, parameters: Vec<Value>) -> Result<Value> {
        let request = Request::new(self.service.clone(), method, parameters);
        self.client.call(request, self.timeout).await?.into_result()
    }
}
