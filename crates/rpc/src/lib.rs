//! Request/response RPC over TCP with response correlation.
//!
//! Many concurrent calls share one pooled connection per remote endpoint;
//! each response is matched back to its waiting caller by request id.
//!
//! # Features
//!
//! - **Framing**: magic-prefixed, length-delimited frames with a codec byte
//! - **Correlation**: pending calls resolved by id, failed when their
//!   connection dies, purged on timeout
//! - **Connection Pooling**: one connection per endpoint, established once
//!   even under concurrent demand
//! - **Backpressure**: a server that cannot write a result answers FAIL
//! - **Pluggable Serialization**: bincode, CBOR or JSON payloads
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sparrow_discovery_memory::MemoryServiceDiscovery;
//! use sparrow_rpc::{
//!     HandlerError, RpcClient, RpcServer, ServiceConfig, ServiceDefinition, ServiceProvider,
//!     ServiceReference, ServiceRegistry, Value,
//! };
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let discovery = Arc::new(MemoryServiceDiscovery::new());
//!
//!     let server = RpcServer::builder().handler(ServiceRegistry::new()).build()?;
//!     server.start().await?;
//!
//!     let config = ServiceConfig::new("Calculator").group("demo").version("1.0");
//!     let provider = ServiceProvider::for_server(Arc::clone(&discovery), &server)?;
//!     provider
//!         .publish_service(
//!             &config,
//!             ServiceDefinition::new().method("add", &["int", "int"], |p| async move {
//!                 let a = p[0].as_int().unwrap_or_default();
//!                 let b = p[1].as_int().unwrap_or_default();
//!                 Ok::<_, HandlerError>(Value::Int(a + b))
//!             }),
//!         )
//!         .await?;
//!
//!     let client = Arc::new(RpcClient::builder().discovery(discovery).build()?);
//!     let calculator = ServiceReference::new(client, &config);
//!     let sum = calculator
//!         .invoke("add", vec![Value::Int(2), Value::Int(3)])
//!         .await?;
//!     assert_eq!(sum, Value::Int(5));
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod handler;
pub mod protocol;
pub mod provider;
pub mod transport;

// Re-export commonly used types
pub use error::{CodecError, ConnectionError, Error, HandlerError, ProtocolError, Result};
pub use handler::{MethodKey, ServiceDefinition, ServiceRegistry};
pub use protocol::{CodecKind, Frame, FrameCodec, Message, MessageType, Request, Response, Status, Value};
pub use provider::{ServiceConfig, ServiceProvider, ServiceReference};
pub use transport::{
    client::{ClientBuilder, ClientConfig, RpcClient},
    connection::PoolConfig,
    pending::PendingCalls,
    pool::ConnectionPool,
    server::{RequestHandler, RpcServer, ServerBuilder, ServerConfig},
};

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
pub use sparrow_discovery::{ServiceDiscovery, ServiceName};
