//! Method table the server dispatches requests through.
//!
//! Services are collected into a [`ServiceDefinition`] at startup and
//! installed into a [`ServiceRegistry`], which is the [`RequestHandler`]
//! handed to the server.

use crate::error::{Error, HandlerError, Result};
use crate::protocol::Value;
use crate::transport::server::RequestHandler;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sparrow_discovery::ServiceName;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

type MethodFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, HandlerError>> + Send>>;
type MethodFn = Arc<dyn Fn(Vec<Value>) -> MethodFuture + Send + Sync>;

/// Identifies one overload of one method of one service.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodKey {
    /// The service the method belongs to.
    pub service: ServiceName,
    /// The method name.
    pub method: String,
    /// Declared parameter types, in order.
    pub parameter_types: Vec<String>,
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}({})",
            self.service,
            self.method,
            self.parameter_types.join(", ")
        )
    }
}

/// The methods of one service implementation, ready to be published.
#[derive(Default)]
pub struct ServiceDefinition {
    methods: Vec<(String, Vec<String>, MethodFn)>,
}

impl ServiceDefinition {
    /// Create an empty definition.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a method taking parameters of the given types.
    ///
    /// A later method with the same name and types replaces an earlier one.
    #[must_use]
    pub fn method<F, Fut>(mut self, name: impl Into<String>, parameter_types: &[&str], f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
    {
        let f: MethodFn = Arc::new(move |parameters| Box::pin(f(parameters)));
        self.methods.push((
            name.into(),
            parameter_types.iter().map(|t| (*t).to_string()).collect(),
            f,
        ));
        self
    }

    /// Number of methods defined.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether no methods are defined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Published services and their methods.
///
/// Clones share the same table.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    methods: Arc<DashMap<MethodKey, MethodFn>>,
    services: Arc<DashMap<ServiceName, Vec<MethodKey>>>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the methods of `definition` under `service`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyPublished`] if the service is already
    /// registered.
    pub fn register_service(&self, service: ServiceName, definition: ServiceDefinition) -> Result<()> {
        let Entry::Vacant(entry) = self.services.entry(service.clone()) else {
            return Err(Error::AlreadyPublished(service.to_string()));
        };

        let mut keys = Vec::with_capacity(definition.methods.len());
        for (method, parameter_types, f) in definition.methods {
            let key = MethodKey {
                service: service.clone(),
                method,
                parameter_types,
            };
            debug!("registered method {}", key);
            self.methods.insert(key.clone(), f);
            keys.push(key);
        }
        entry.insert(keys);

        Ok(())
    }

    /// Remove a service and its methods. Returns whether it was registered.
    pub fn unregister_service(&self, service: &ServiceName) -> bool {
        match self.services.remove(service) {
            Some((_, keys)) => {
                for key in &keys {
                    self.methods.remove(key);
                }
                debug!("unregistered service {}", service);
                true
            }
            None => false,
        }
    }

    /// Whether a service is registered.
    #[must_use]
    pub fn contains_service(&self, service: &ServiceName) -> bool {
        self.services.contains_key(service)
    }

    /// Names of every registered service.
    #[must_use]
    pub fn services(&self) -> Vec<ServiceName> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }
}

#[async_trait]
impl RequestHandler for ServiceRegistry {
    async fn handle(
        &self,
        service: &ServiceName,
        method: &str,
        parameter_types: &[String],
        parameters: Vec<Value>,
    ) -> std::result::Result<Value, HandlerError> {
        let key = MethodKey {
            service: service.clone(),
            method: method.to_string(),
            parameter_types: parameter_types.to_vec(),
        };

        let Some(f) = self.methods.get(&key).map(|m| Arc::clone(m.value())) else {
            if self.contains_service(service) {
                return Err(HandlerError::NotFound(key.to_string()));
            }
            return Err(HandlerError::NotFound(service.to_string()));
        };

        f(parameters).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn calculator() -> ServiceDefinition {
        ServiceDefinition::new()
            .method("add", &["int", "int"], |params| async move {
                match params.as_slice() {
                    [Value::Int(a), Value::Int(b)] => Ok(Value::Int(a + b)),
                    _ => Err(HandlerError::internal("expected two ints")),
                }
            })
            .method("add", &["float", "float"], |params| async move {
                match params.as_slice() {
                    [Value::Float(a), Value::Float(b)] => Ok(Value::Float(a + b)),
                    _ => Err(HandlerError::internal("expected two floats")),
                }
            })
    }

    fn name() -> ServiceName {
        ServiceName::new("g", "v1", "Calc")
    }

    fn types(types: &[&str]) -> Vec<String> {
        types.iter().map(|t| (*t).to_string()).collect()
    }

    #[tokio::test]
    async fn test_dispatch_by_parameter_types() {
        let registry = ServiceRegistry::new();
        registry.register_service(name(), calculator()).unwrap();

        let sum = registry
            .handle(&name(), "add", &types(&["int", "int"]), vec![Value::Int(2), Value::Int(3)])
            .await;
        assert_eq!(sum, Ok(Value::Int(5)));

        let sum = registry
            .handle(&name(), "add", &types(&["float", "float"]), vec![Value::Float(1.5), Value::Float(1.0)])
            .await;
        assert_eq!(sum, Ok(Value::Float(2.5)));
    }

    #[tokio::test]
    async fn test_missing_method_and_service() {
        let registry = ServiceRegistry::new();
        registry.register_service(name(), calculator()).unwrap();

        let result = registry.handle(&name(), "sub", &[], vec![]).await;
        assert_matches!(result, Err(HandlerError::NotFound(m)) if m == "g@v1@Calc.sub()");

        let other = ServiceName::new("g", "v1", "Other");
        let result = registry.handle(&other, "add", &[], vec![]).await;
        assert_matches!(result, Err(HandlerError::NotFound(s)) if s == "g@v1@Other");
    }

    #[tokio::test]
    async fn test_handler_error_passes_through() {
        let registry = ServiceRegistry::new();
        registry.register_service(name(), calculator()).unwrap();

        let result = registry
            .handle(&name(), "add", &types(&["int", "int"]), vec![Value::Null, Value::Null])
            .await;
        assert_eq!(result, Err(HandlerError::internal("expected two ints")));
    }

    #[test]
    fn test_register_twice_fails() {
        let registry = ServiceRegistry::new();
        registry.register_service(name(), calculator()).unwrap();
        assert_matches!(
            registry.register_service(name(), ServiceDefinition::new()),
            Err(Error::AlreadyPublished(s)) if s == "g@v1@Calc"
        );
    }

    #[tokio::test]
    async fn test_unregister_removes_methods() {
        let registry = ServiceRegistry::new();
        registry.register_service(name(), calculator()).unwrap();
        assert!(registry.unregister_service(&name()));
        assert!(!registry.unregister_service(&name()));
        assert!(!registry.contains_service(&name()));
        assert!(registry.services().is_empty());

        let result = registry
            .handle(&name(), "add", &types(&["int", "int"]), vec![Value::Int(2), Value::Int(3)])
            .await;
        assert_matches!(result, Err(HandlerError::NotFound(_)));

        registry.register_service(name(), calculator()).unwrap();
        assert!(registry.contains_service(&name()));
    }
}
