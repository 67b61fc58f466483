//! Publishes a calculator service and calls it over loopback.
//!
//! Run with `RUST_LOG=debug cargo run --example calculator` to see the
//! transport at work.

use std::sync::Arc;

use sparrow_discovery_memory::MemoryServiceDiscovery;
use sparrow_rpc::{
    Error, HandlerError, RpcClient, RpcServer, ServiceConfig, ServiceDefinition, ServiceProvider,
    ServiceReference, ServiceRegistry, Value,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn operands(params: &[Value]) -> Result<(i64, i64), HandlerError> {
    match params {
        [Value::Int(a), Value::Int(b)] => Ok((*a, *b)),
        _ => Err(HandlerError::internal("expected two integers")),
    }
}

async fn add(params: Vec<Value>) -> Result<Value, HandlerError> {
    let (a, b) = operands(&params)?;
    a.checked_add(b)
        .map(Value::Int)
        .ok_or_else(|| HandlerError::internal("overflow"))
}

async fn divide(params: Vec<Value>) -> Result<Value, HandlerError> {
    let (a, b) = operands(&params)?;
    a.checked_div(b)
        .map(Value::Int)
        .ok_or_else(|| HandlerError::internal("division by zero"))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let discovery = Arc::new(MemoryServiceDiscovery::new());

    let server = RpcServer::builder()
        .handler(ServiceRegistry::new())
        .build()?;
    let addr = server.start().await?;

    let config = ServiceConfig::new("Calculator")
        .group("demo")
        .version("1.0");
    let provider = ServiceProvider::for_server(Arc::clone(&discovery), &server)?;
    provider
        .publish_service(
            &config,
            ServiceDefinition::new()
                .method("add", &["int", "int"], add)
                .method("divide", &["int", "int"], divide),
        )
        .await?;
    info!("{} listening on {}", config.service_name(), addr);

    let client = Arc::new(RpcClient::builder().discovery(discovery).build()?);
    let calculator = ServiceReference::new(Arc::clone(&client), &config);

    let sum = calculator
        .invoke("add", vec![Value::Int(2), Value::Int(3)])
        .await?;
    info!("add(2, 3) = {:?}", sum);

    let quotient = calculator
        .invoke("divide", vec![Value::Int(84), Value::Int(2)])
        .await?;
    info!("divide(84, 2) = {:?}", quotient);

    match calculator
        .invoke("divide", vec![Value::Int(1), Value::Int(0)])
        .await
    {
        Err(Error::RemoteFailure(message)) => info!("divide(1, 0) failed remotely: {}", message),
        other => error!("divide(1, 0) unexpectedly returned {:?}", other),
    }

    provider.unpublish_all().await?;
    client.shutdown();
    server.shutdown();

    Ok(())
}
