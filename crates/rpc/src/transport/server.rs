//! RPC server implementation.

use crate::error::{Error, HandlerError, Result};
use crate::protocol::{CodecKind, Frame, FrameCodec, Message, Request, Response, Value};
use crate::transport::connection::Outbound;
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use sparrow_discovery::ServiceName;
use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

/// Message sent in place of a result when the connection cannot take it.
const NOT_WRITABLE: &str = "connection not writable";

/// Configuration for the RPC server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on. Port 0 picks a free port.
    pub bind_addr: SocketAddr,
    /// Address published to discovery, if different from the bound one.
    pub advertised_addr: Option<SocketAddr>,
    /// Close connections that deliver no frame for this long.
    pub idle_timeout: Duration,
    /// Responses that may queue per connection before it reports itself as
    /// not writable.
    pub outbound_capacity: usize,
    /// Maximum frame size.
    pub max_frame_size: usize,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            advertised_addr: None,
            idle_timeout: Duration::from_secs(90),
            outbound_capacity: 1024,
            max_frame_size: crate::protocol::framing::MAX_FRAME_SIZE,
            max_connections: 1024,
        }
    }
}

/// Trait for handling RPC requests.
///
/// Errors become FAIL responses; they never close the connection.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Invoke `method` of `service` with the decoded parameters.
    async fn handle(
        &self,
        service: &ServiceName,
        method: &str,
        parameter_types: &[String],
        parameters: Vec<Value>,
    ) -> std::result::Result<Value, HandlerError>;
}

/// Builder for creating RPC servers.
pub struct ServerBuilder<H> {
    handler: Option<H>,
    config: ServerConfig,
}

impl<H: RequestHandler> ServerBuilder<H> {
    /// Create a new server builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handler: None,
            config: ServerConfig::default(),
        }
    }

    /// Set the request handler.
    #[must_use]
    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the listen address.
    #[must_use]
    pub const fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Set the address published to discovery.
    #[must_use]
    pub const fn advertised_addr(mut self, addr: SocketAddr) -> Self {
        self.config.advertised_addr = Some(addr);
        self
    }

    /// Set the idle timeout.
    #[must_use]
    pub const fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set the per-connection outbound queue size.
    #[must_use]
    pub const fn outbound_capacity(mut self, capacity: usize) -> Self {
        self.config.outbound_capacity = capacity;
        self
    }

    /// Set the maximum frame size.
    #[must_use]
    pub const fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the connection limit.
    #[must_use]
    pub const fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Build the RPC server. Nothing is bound until [`RpcServer::start`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no handler was set.
    pub fn build(self) -> Result<RpcServer<H>> {
        let handler = self
            .handler
            .ok_or_else(|| Error::Config("request handler not specified".to_string()))?;
        Ok(RpcServer::new(handler, self.config))
    }
}

impl<H: RequestHandler> Default for ServerBuilder<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// RPC server that listens for incoming connections.
pub struct RpcServer<H> {
    handler: Arc<H>,
    config: ServerConfig,
    connections: Arc<Semaphore>,
    shutdown: CancellationToken,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl<H: RequestHandler> RpcServer<H> {
    /// Create a new RPC server.
    pub fn new(handler: H, config: ServerConfig) -> Self {
        Self {
            handler: Arc::new(handler),
            connections: Arc::new(Semaphore::new(config.max_connections)),
            config,
            shutdown: CancellationToken::new(),
            local_addr: parking_lot::Mutex::new(None),
        }
    }

    /// Create a new server builder.
    #[must_use]
    pub fn builder() -> ServerBuilder<H> {
        ServerBuilder::new()
    }

    /// Bind the listener and start accepting connections in the background.
    ///
    /// Returns the bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the server was already started or shut down, or
    /// if binding fails.
    #[instrument(skip(self), fields(bind_addr = %self.config.bind_addr))]
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Config("server has been shut down".to_string()));
        }
        if self.local_addr.lock().is_some() {
            return Err(Error::Config("server already started".to_string()));
        }

        let listener = TcpListener::bind(self.config.bind_addr).await.map_err(|e| {
            error!("failed to bind {}: {}", self.config.bind_addr, e);
            e
        })?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);

        info!("RPC server listening on {}", local_addr);

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.handler),
            self.config.clone(),
            Arc::clone(&self.connections),
            self.shutdown.clone(),
        ));

        Ok(local_addr)
    }

    /// The bound address, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// The address clients should connect to.
    #[must_use]
    pub fn advertised_addr(&self) -> Option<SocketAddr> {
        self.config.advertised_addr.or_else(|| self.local_addr())
    }

    /// The request handler.
    #[must_use]
    pub const fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Number of connections currently being served.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.config.max_connections - self.connections.available_permits()
    }

    /// Stop accepting and close every live connection.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("RPC server shutdown requested");
            self.shutdown.cancel();
        }
    }
}

impl<H> Drop for RpcServer<H> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop<H: RequestHandler>(
    listener: TcpListener,
    handler: Arc<H>,
    config: ServerConfig,
    connections: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => match Arc::clone(&connections).try_acquire_owned() {
                Ok(permit) => {
                    let handler = Arc::clone(&handler);
                    let config = config.clone();
                    let closed = shutdown.child_token();
                    tokio::spawn(async move {
                        serve_connection(stream, peer, handler, &config, closed).await;
                        drop(permit);
                    });
                }
                Err(_) => {
                    warn!(
                        "max connections reached, rejecting connection from {}",
                        peer
                    );
                }
            },
            Err(e) => {
                error!("failed to accept connection: {}", e);
            }
        }
    }

    debug!("accept loop stopped");
}

/// Read frames until the peer goes away, errs, idles out, or the server
/// shuts down. Requests are dispatched concurrently.
async fn serve_connection<H: RequestHandler>(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    config: &ServerConfig,
    closed: CancellationToken,
) {
    debug!("new connection from {}", peer);

    if let Err(e) = stream.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY for {}: {}", peer, e);
    }

    let frame_codec = FrameCodec::new().with_max_frame_size(config.max_frame_size);
    let (read_half, write_half) = stream.into_split();
    let outbound = Outbound::spawn(
        FramedWrite::new(write_half, frame_codec),
        config.outbound_capacity,
        closed.clone(),
    );
    let mut reader = FramedRead::new(read_half, frame_codec);

    loop {
        let next = tokio::select! {
            () = closed.cancelled() => {
                debug!("connection from {} closed locally", peer);
                break;
            }
            next = timeout(config.idle_timeout, reader.next()) => next,
        };

        let frame = match next {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                warn!("closing connection from {}: {}", peer, e);
                break;
            }
            Ok(None) => {
                debug!("connection closed by {}", peer);
                break;
            }
            Err(_) => {
                warn!("connection from {} idle for {:?}", peer, config.idle_timeout);
                break;
            }
        };

        match Message::from_frame(&frame) {
            Ok(Message::Request(request)) => {
                tokio::spawn(dispatch(
                    request,
                    frame.codec,
                    Arc::clone(&handler),
                    outbound.clone(),
                ));
            }
            Ok(Message::Heartbeat) => {
                trace!("heartbeat from {}", peer);
                if let Err(e) = outbound.try_send(Frame::heartbeat(frame.codec)) {
                    debug!("heartbeat reply to {} dropped: {}", peer, e);
                }
            }
            Ok(Message::Response(response)) => {
                warn!(
                    "unexpected response {} from {}",
                    response.request_id(),
                    peer
                );
            }
            Err(e) => {
                warn!("closing connection from {}: {}", peer, e);
                break;
            }
        }
    }

    outbound.close();
}

/// Run one request through the handler and queue its response.
async fn dispatch<H: RequestHandler>(
    request: Request,
    codec: CodecKind,
    handler: Arc<H>,
    outbound: Outbound,
) {
    let request_id = request.request_id().to_string();
    let service = request.service().clone();
    let method = request.method().to_string();
    let parameter_types = request.parameter_types().to_vec();

    debug!("handling request {} for {}.{}", request_id, service, method);

    let outcome = AssertUnwindSafe(handler.handle(
        &service,
        &method,
        &parameter_types,
        request.into_parameters(),
    ))
    .catch_unwind()
    .await
    .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(&*panic))));

    if let Err(e) = &outcome {
        debug!("request {} failed: {}", request_id, e);
    }

    // A reserved slot cannot be taken by another writer before the send
    let permit = outbound.try_reserve();
    let response = build_response(request_id.as_str(), outcome, permit.is_some());
    let Some(frame) = encode_response(request_id.as_str(), response, codec) else {
        return;
    };

    match permit {
        Some(permit) => permit.send(frame),
        None => {
            if let Err(e) = outbound.send(frame).await {
                debug!("response {} not sent: {}", request_id, e);
            }
        }
    }
}

/// Encode a response, falling back to a FAIL carrying the encoding error.
fn encode_response(request_id: &str, response: Response, codec: CodecKind) -> Option<Frame> {
    match Message::Response(response).into_frame(codec) {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!("failed to encode response {}: {}", request_id, e);
            Message::Response(Response::fail(request_id, e.to_string()))
                .into_frame(codec)
                .map_err(|e| error!("failed to encode failure {}: {}", request_id, e))
                .ok()
        }
    }
}

/// Turn a handler outcome into the response to send.
///
/// A connection that cannot take more output gets a FAIL carrying the
/// request id, whatever the outcome was.
fn build_response(
    request_id: &str,
    outcome: std::result::Result<Value, HandlerError>,
    writable: bool,
) -> Response {
    if !writable {
        warn!("connection not writable, failing request {}", request_id);
        return Response::fail(request_id, NOT_WRITABLE);
    }

    match outcome {
        Ok(value) => Response::success(request_id, value),
        Err(e) => Response::fail(request_id, e.to_string()),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Status;
    use assert_matches::assert_matches;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(
            &self,
            _service: &ServiceName,
            method: &str,
            _parameter_types: &[String],
            parameters: Vec<Value>,
        ) -> std::result::Result<Value, HandlerError> {
            match method {
                "echo" => Ok(Value::List(parameters)),
                "panic" => panic!("boom"),
                _ => Err(HandlerError::NotFound(method.to_string())),
            }
        }
    }

    #[test]
    fn test_build_response_success() {
        let response = build_response("r1", Ok(Value::Int(5)), true);
        assert_eq!(response.request_id(), "r1");
        assert_eq!(response.status(), Status::Success);
        assert_eq!(response.data(), Some(&Value::Int(5)));
    }

    #[test]
    fn test_build_response_handler_error() {
        let response = build_response("r1", Err(HandlerError::internal("division by zero")), true);
        assert_eq!(response.status(), Status::Fail);
        assert_eq!(response.message(), Some("division by zero"));
    }

    #[test]
    fn test_not_writable_fails_with_request_id() {
        let response = build_response("r7", Ok(Value::Int(5)), false);
        assert_eq!(response.request_id(), "r7");
        assert_eq!(response.status(), Status::Fail);
        assert_eq!(response.message(), Some(NOT_WRITABLE));
        assert!(response.data().is_none());
    }

    #[test]
    fn test_panic_message() {
        let panic: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*panic), "boom");
        let panic: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*panic), "bang");
        let panic: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(&*panic), "unknown panic");
    }

    #[test]
    fn test_build_requires_handler() {
        let result = RpcServer::<Echo>::builder().build();
        assert_matches!(result.err(), Some(Error::Config(_)));
    }

    #[tokio::test]
    async fn test_start_binds_ephemeral_port() {
        let server = RpcServer::builder().handler(Echo).build().unwrap();
        assert!(server.local_addr().is_none());

        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
        assert_eq!(server.advertised_addr(), Some(addr));

        assert_matches!(server.start().await, Err(Error::Config(_)));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_advertised_addr_override() {
        let advertised: SocketAddr = "10.0.0.1:7000".parse().unwrap();
        let server = RpcServer::builder()
            .handler(Echo)
            .advertised_addr(advertised)
            .build()
            .unwrap();
        server.start().await.unwrap();
        assert_eq!(server.advertised_addr(), Some(advertised));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_dispatch_catches_panic() {
        let (client, server) = tokio::io::duplex(4096);
        let token = CancellationToken::new();
        let outbound = Outbound::spawn(
            FramedWrite::new(server, FrameCodec::new()),
            8,
            token.clone(),
        );

        let request = Request::with_id("p1", ServiceName::new("g", "v", "S"), "panic", vec![]);
        dispatch(request, CodecKind::Bincode, Arc::new(Echo), outbound).await;

        let mut reader = FramedRead::new(client, FrameCodec::new());
        let frame = reader.next().await.unwrap().unwrap();
        let response = assert_matches!(Message::from_frame(&frame), Ok(Message::Response(r)) => r);
        assert_eq!(response.request_id(), "p1");
        assert_eq!(response.status(), Status::Fail);
        assert_eq!(response.message(), Some("Handler panicked: boom"));
        token.cancel();
    }

    #[tokio::test]
    async fn test_dispatch_to_stalled_connection_fails_request() {
        // Nobody reads the tiny duplex, so the writer stalls and the queue fills
        let (client, server) = tokio::io::duplex(16);
        let token = CancellationToken::new();
        let outbound = Outbound::spawn(
            FramedWrite::new(server, FrameCodec::new()),
            1,
            token.clone(),
        );
        for _ in 0..16 {
            if outbound.try_send(Frame::heartbeat(CodecKind::Bincode)).is_err() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!outbound.is_writable());

        let request = Request::with_id(
            "w1",
            ServiceName::new("g", "v", "S"),
            "echo",
            vec![Value::Int(1)],
        );
        let dispatched = tokio::spawn(dispatch(
            request,
            CodecKind::Bincode,
            Arc::new(Echo),
            outbound,
        ));

        // Draining the peer unblocks the writer and lets the FAIL through
        let mut reader = FramedRead::new(client, FrameCodec::new());
        let response = loop {
            let frame = reader.next().await.unwrap().unwrap();
            match Message::from_frame(&frame) {
                Ok(Message::Heartbeat) => continue,
                Ok(Message::Response(response)) => break response,
                other => panic!("unexpected frame: {other:?}"),
            }
        };
        assert_eq!(response.request_id(), "w1");
        assert_eq!(response.status(), Status::Fail);
        assert_eq!(response.message(), Some(NOT_WRITABLE));
        assert!(response.data().is_none());

        dispatched.await.unwrap();
        token.cancel();
    }

    #[tokio::test]
    async fn test_dispatch_to_closed_connection_returns() {
        let (_client, server) = tokio::io::duplex(4096);
        let token = CancellationToken::new();
        let outbound = Outbound::spawn(
            FramedWrite::new(server, FrameCodec::new()),
            8,
            token.clone(),
        );
        token.cancel();

        let request = Request::with_id("c1", ServiceName::new("g", "v", "S"), "echo", vec![]);
        tokio::time::timeout(
            Duration::from_secs(1),
            dispatch(request, CodecKind::Bincode, Arc::new(Echo), outbound),
        )
        .await
        .unwrap();
    }
}
