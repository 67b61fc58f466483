//! Shared setup for the integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sparrow_discovery_memory::MemoryServiceDiscovery;
use sparrow_rpc::{
    ClientBuilder, FrameCodec, HandlerError, RpcClient, RpcServer, ServerBuilder, ServiceConfig,
    ServiceDefinition, ServiceProvider, ServiceReference, ServiceRegistry, Value,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing_subscriber::EnvFilter;

pub type Client = RpcClient<MemoryServiceDiscovery>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn ints(params: &[Value]) -> Result<(i64, i64), HandlerError> {
    match params {
        [Value::Int(a), Value::Int(b)] => Ok((*a, *b)),
        _ => Err(HandlerError::internal("expected two ints")),
    }
}

async fn add(params: Vec<Value>) -> Result<Value, HandlerError> {
    let (a, b) = ints(&params)?;
    Ok(Value::Int(a + b))
}

async fn divide(params: Vec<Value>) -> Result<Value, HandlerError> {
    let (a, b) = ints(&params)?;
    if b == 0 {
        return Err(HandlerError::internal("division by zero"));
    }
    Ok(Value::Int(a / b))
}

async fn boom(_params: Vec<Value>) -> Result<Value, HandlerError> {
    panic!("kaboom")
}

/// Answers with the first parameter after sleeping for the second, in ms.
async fn echo_after(params: Vec<Value>) -> Result<Value, HandlerError> {
    let (value, delay) = ints(&params)?;
    tokio::time::sleep(Duration::from_millis(delay.unsigned_abs())).await;
    Ok(Value::Int(value))
}

pub fn calculator() -> ServiceDefinition {
    ServiceDefinition::new()
        .method("add", &["int", "int"], add)
        .method("divide", &["int", "int"], divide)
        .method("boom", &[], boom)
        .method("echo_after", &["int", "int"], echo_after)
}

pub fn calculator_config() -> ServiceConfig {
    ServiceConfig::new("Calculator").group("test").version("1.0")
}

pub struct Harness {
    pub discovery: Arc<MemoryServiceDiscovery>,
    pub server: RpcServer<ServiceRegistry>,
    pub provider: ServiceProvider<MemoryServiceDiscovery>,
    pub client: Arc<Client>,
    pub addr: SocketAddr,
}

impl Harness {
    pub fn calculator(&self) -> ServiceReference<MemoryServiceDiscovery> {
        ServiceReference::new(Arc::clone(&self.client), &calculator_config())
    }
}

pub async fn start() -> Harness {
    start_with(RpcServer::builder(), RpcClient::builder()).await
}

/// Start a server publishing the calculator and a client pointed at it.
pub async fn start_with(
    server: ServerBuilder<ServiceRegistry>,
    client: ClientBuilder<MemoryServiceDiscovery>,
) -> Harness {
    init_tracing();

    let discovery = Arc::new(MemoryServiceDiscovery::new());
    let server = server.handler(ServiceRegistry::new()).build().unwrap();
    let addr = server.start().await.unwrap();

    let provider = ServiceProvider::for_server(Arc::clone(&discovery), &server).unwrap();
    provider
        .publish_service(&calculator_config(), calculator())
        .await
        .unwrap();

    let client = Arc::new(client.discovery(Arc::clone(&discovery)).build().unwrap());

    Harness {
        discovery,
        server,
        provider,
        client,
        addr,
    }
}

/// A listener standing in for a misbehaving server.
pub async fn raw_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

pub fn framed(stream: TcpStream) -> Framed<TcpStream, FrameCodec> {
    Framed::new(stream, FrameCodec::new())
}

/// Poll `condition` until it holds or a second passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
