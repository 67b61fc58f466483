//! RPC client implementation.

use crate::error::{Error, Result};
use crate::protocol::{CodecKind, Message, Request, Response, Value};
use crate::transport::connection::PoolConfig;
use crate::transport::pending::PendingCalls;
use crate::transport::pool::ConnectionPool;
use sparrow_discovery::{ServiceDiscovery, ServiceName};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, instrument};

/// Configuration for the RPC client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Connection pool configuration.
    pub pool_config: PoolConfig,
    /// Timeout for calls that do not specify one.
    pub default_timeout: Duration,
    /// Codec requests are serialized with.
    pub codec: CodecKind,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool_config: PoolConfig::default(),
            default_timeout: Duration::from_secs(30),
            codec: CodecKind::default(),
        }
    }
}

/// Builder for creating RPC clients.
pub struct ClientBuilder<D> {
    discovery: Option<Arc<D>>,
    config: ClientConfig,
}

impl<D: ServiceDiscovery> ClientBuilder<D> {
    /// Create a new client builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            discovery: None,
            config: ClientConfig::default(),
        }
    }

    /// Set the discovery service used to resolve service names.
    #[must_use]
    pub fn discovery(mut self, discovery: Arc<D>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default call timeout.
    #[must_use]
    pub const fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool_config.connect_timeout = timeout;
        self
    }

    /// Set the heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.pool_config.heartbeat_interval = interval;
        self
    }

    /// Set how long a connection may go without receiving any frame before
    /// it is closed.
    #[must_use]
    pub const fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool_config.idle_timeout = timeout;
        self
    }

    /// Set the per-connection outbound queue size.
    #[must_use]
    pub const fn outbound_capacity(mut self, capacity: usize) -> Self {
        self.config.pool_config.outbound_capacity = capacity;
        self
    }

    /// Set the payload codec.
    #[must_use]
    pub const fn codec(mut self, codec: CodecKind) -> Self {
        self.config.codec = codec;
        self
    }

    /// Build the RPC client. Connections are made lazily.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no discovery service was set or the
    /// pool settings are unusable.
    pub fn build(self) -> Result<RpcClient<D>> {
        let discovery = self
            .discovery
            .ok_or_else(|| Error::Config("discovery service not specified".to_string()))?;
        self.config.pool_config.validate()?;

        let pending = PendingCalls::new();
        let pool = ConnectionPool::new(
            self.config.pool_config.clone(),
            self.config.codec,
            pending.clone(),
        );

        Ok(RpcClient {
            discovery,
            pool,
            pending,
            config: self.config,
        })
    }
}

impl<D: ServiceDiscovery> Default for ClientBuilder<D> {
    fn default() -> Self {
        Self::new()
    }
}

/// RPC client for making requests.
///
/// Construct one per process and share it; all calls to the same endpoint
/// are multiplexed over one pooled connection.
pub struct RpcClient<D> {
    discovery: Arc<D>,
    pool: ConnectionPool,
    pending: PendingCalls,
    config: ClientConfig,
}

impl<D: ServiceDiscovery> RpcClient<D> {
    /// Create a new client builder.
    #[must_use]
    pub fn builder() -> ClientBuilder<D> {
        ClientBuilder::new()
    }

    /// Call `method` on `service` with the default timeout and return the
    /// response.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::call`].
    pub async fn request(
        &self,
        service: ServiceName,
        method: &str,
        parameters: Vec<Value>,
    ) -> Result<Response> {
        self.call(
            Request::new(service, method, parameters),
            self.config.default_timeout,
        )
        .await
    }

    /// Send a request to a provider of its service and wait for the response.
    ///
    /// A FAIL response is returned as a response, not an error. `timeout`
    /// bounds the whole call: discovery, connecting and the wait for the
    /// response.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceUnavailable`] if discovery has no provider
    /// - [`Error::Connection`] if connecting fails or the connection dies
    ///   while the call is outstanding
    /// - [`Error::SendFailed`] if the connection is closed or not writable
    /// - [`Error::Timeout`] if the call does not complete in time
    #[instrument(skip(self, request), fields(request_id = %request.request_id(), service = %request.service()))]
    pub async fn call(&self, request: Request, timeout: Duration) -> Result<Response> {
        let deadline = Instant::now() + timeout;
        let addr = timeout_at(deadline, self.discovery.lookup(request.service()))
            .await
            .map_err(|_| Error::Timeout(timeout))?
            .map_err(|e| Error::ServiceUnavailable {
                service: request.service().to_string(),
                reason: e.to_string(),
            })?;

        self.call_until(addr, request, deadline, timeout).await
    }

    /// Send a request to a known address, bypassing discovery.
    ///
    /// # Errors
    ///
    /// As [`RpcClient::call`], minus discovery failures.
    pub async fn call_address(
        &self,
        addr: SocketAddr,
        request: Request,
        timeout: Duration,
    ) -> Result<Response> {
        self.call_until(addr, request, Instant::now() + timeout, timeout)
            .await
    }

    async fn call_until(
        &self,
        addr: SocketAddr,
        request: Request,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Response> {
        let conn = timeout_at(deadline, self.pool.acquire(addr))
            .await
            .map_err(|_| Error::Timeout(timeout))??;
        let request_id = request.request_id().to_string();
        let frame = Message::Request(request).into_frame(self.config.codec)?;

        // Registered before the write so a fast response always finds it
        let pending = self.pending.register(request_id.as_str(), conn.id())?;

        // Dropping `pending` on failure purges the entry
        conn.send(frame)?;
        debug!("sent request {} on connection {}", request_id, conn.id());

        pending.wait_until(deadline, timeout).await
    }

    /// Number of calls awaiting a response.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// The connection pool.
    #[must_use]
    pub const fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// The client configuration.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Close every connection. Calls still pending fail with a connection
    /// error.
    pub fn shutdown(&self) {
        debug!("shutting down RPC client");
        self.pool.shutdown();
    }
}
