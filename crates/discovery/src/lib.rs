//! Abstract interface for registering and locating RPC service providers.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod service_name;

pub use service_name::{InvalidServiceName, ServiceName};

use std::error::Error;
use std::fmt::Debug;
use std::net::SocketAddr;

use async_trait::async_trait;

/// Marker trait for `ServiceDiscovery` errors
pub trait DiscoveryError: Debug + Error + Send + Sync + 'static {}

/// A registry of service providers, keyed by `group@version@interface`.
///
/// Providers register the address their RPC server is reachable on; callers
/// look a name up right before issuing a call. Implementations decide how
/// several providers for one name are balanced.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync + 'static {
    /// The error type for discovery operations.
    type Error: DiscoveryError;

    /// Announces that `address` serves `service`.
    ///
    /// # Arguments
    /// * `service`: The fully qualified service name.
    /// * `address`: The socket address of the provider's RPC server.
    async fn register(
        &self,
        service: &ServiceName,
        address: SocketAddr,
    ) -> Result<(), Self::Error>;

    /// Withdraws a previous registration. Unknown registrations are ignored.
    async fn unregister(
        &self,
        service: &ServiceName,
        address: SocketAddr,
    ) -> Result<(), Self::Error>;

    /// Resolves `service` to the address of one live provider.
    ///
    /// Fails when no provider is registered for the name.
    async fn lookup(&self, service: &ServiceName) -> Result<SocketAddr, Self::Error>;
}
