//! Transport layer for the RPC framework.
//!
//! This module handles connection management, correlation of responses to
//! pending calls, and the client and server implementations.

pub mod client;
pub mod connection;
pub mod pending;
pub mod pool;
pub mod server;

pub use client::{ClientBuilder, ClientConfig, RpcClient};
pub use connection::{Connection, PoolConfig};
pub use pending::{ConnectionId, PendingCalls, PendingResponse};
pub use pool::ConnectionPool;
pub use server::{RequestHandler, RpcServer, ServerBuilder, ServerConfig};
