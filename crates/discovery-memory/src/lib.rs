//! In-memory (single process) implementation of service discovery for tests
//! and local development.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use sparrow_discovery::{ServiceDiscovery, ServiceName};
use tracing::debug;

/// In-memory service registry.
///
/// Clones share the same registrations. Lookups rotate round-robin over the
/// providers of a name.
#[derive(Clone, Debug, Default)]
pub struct MemoryServiceDiscovery {
    providers: Arc<RwLock<HashMap<ServiceName, Vec<SocketAddr>>>>,
    cursor: Arc<AtomicUsize>,
}

impl MemoryServiceDiscovery {
    /// Creates a new, empty `MemoryServiceDiscovery`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every provider currently registered for `service`.
    #[must_use]
    pub fn providers(&self, service: &ServiceName) -> Vec<SocketAddr> {
        self.providers
            .read()
            .get(service)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ServiceDiscovery for MemoryServiceDiscovery {
    type Error = Error;

    async fn register(&self, service: &ServiceName, address: SocketAddr) -> Result<(), Error> {
        let mut providers = self.providers.write();
        let addresses = providers.entry(service.clone()).or_default();

        if !addresses.contains(&address) {
            addresses.push(address);
            debug!("registered {} at {}", service, address);
        }

        Ok(())
    }

    async fn unregister(&self, service: &ServiceName, address: SocketAddr) -> Result<(), Error> {
        let mut providers = self.providers.write();

        if let Some(addresses) = providers.get_mut(service) {
            addresses.retain(|a| *a != address);
            if addresses.is_empty() {
                providers.remove(service);
            }
            debug!("unregistered {} at {}", service, address);
        }

        Ok(())
    }

    async fn lookup(&self, service: &ServiceName) -> Result<SocketAddr, Error> {
        let providers = self.providers.read();

        match providers.get(service) {
            Some(addresses) if !addresses.is_empty() => {
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) % addresses.len();
                Ok(addresses[index])
            }
            _ => Err(Error::NoProvider(service.clone())),
        }
    }
}
