use sparrow_discovery::{DiscoveryError, ServiceName};
use thiserror::Error;

/// Errors returned by the in-memory discovery registry.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// No provider is registered under the name.
    #[error("no provider registered for {0}")]
    NoProvider(ServiceName),
}

impl DiscoveryError for Error {}
