//! Connections: the writer task shared by both sides, and the client-side
//! connection with its read path.

use crate::error::{ConnectionError, Error, Result};
use crate::protocol::{CodecKind, Frame, FrameCodec, Message};
use crate::transport::pending::{ConnectionId, PendingCalls};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, timeout};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Connection-level settings shared by the client pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Frames that may queue for the writer before the connection reports
    /// itself as not writable.
    pub outbound_capacity: usize,
    /// Maximum payload size accepted or sent.
    pub max_frame_size: usize,
    /// Interval between keep-alive heartbeats.
    pub heartbeat_interval: Duration,
    /// Close a connection that has delivered no frame, not even a heartbeat
    /// echo, for this long.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            outbound_capacity: 1024,
            max_frame_size: crate::protocol::framing::MAX_FRAME_SIZE,
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl PoolConfig {
    /// Check the settings a connection cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero heartbeat interval, idle timeout
    /// or outbound capacity.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(Error::Config("heartbeat interval must be non-zero".to_string()));
        }
        if self.idle_timeout.is_zero() {
            return Err(Error::Config("idle timeout must be non-zero".to_string()));
        }
        if self.outbound_capacity == 0 {
            return Err(Error::Config("outbound capacity must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Handle to a connection's writer task.
///
/// Open until the connection's token is cancelled; writable while open and
/// the outbound queue has room.
#[derive(Clone, Debug)]
pub struct Outbound {
    sender: mpsc::Sender<Frame>,
    closed: CancellationToken,
}

impl Outbound {
    /// Spawn a writer task draining a bounded queue into `sink`.
    ///
    /// A write error cancels `closed`, which the read side observes.
    pub fn spawn<W>(
        mut sink: FramedWrite<W, FrameCodec>,
        capacity: usize,
        closed: CancellationToken,
    ) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, mut receiver) = mpsc::channel::<Frame>(capacity.max(1));
        let token = closed.clone();

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    () = token.cancelled() => break,
                    frame = receiver.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };

                // Batch whatever else is already queued into one flush
                let mut result = sink.feed(frame).await;
                while result.is_ok() {
                    match receiver.try_recv() {
                        Ok(frame) => result = sink.feed(frame).await,
                        Err(_) => break,
                    }
                }
                if result.is_ok() {
                    result = sink.flush().await;
                }

                if let Err(e) = result {
                    error!("write failed, closing connection: {}", e);
                    break;
                }
            }

            token.cancel();
            receiver.close();
        });

        Self { sender, closed }
    }

    /// Whether the connection has not been closed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.sender.is_closed()
    }

    /// Whether a frame can be queued right now without waiting.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.is_open() && self.sender.capacity() > 0
    }

    /// Queue a frame without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SendFailed`] if the connection is closed or its
    /// outbound queue is full.
    pub fn try_send(&self, frame: Frame) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::SendFailed("connection closed".to_string()));
        }
        self.sender.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => Error::SendFailed("connection not writable".to_string()),
            TrySendError::Closed(_) => Error::SendFailed("connection closed".to_string()),
        })
    }

    /// Reserve a queue slot, or `None` if the connection is closed or full.
    /// A frame sent through the permit cannot be rejected.
    pub fn try_reserve(&self) -> Option<mpsc::Permit<'_, Frame>> {
        if self.closed.is_cancelled() {
            return None;
        }
        self.sender.try_reserve().ok()
    }

    /// Queue a frame, waiting for room if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SendFailed`] if the connection closes first.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        tokio::select! {
            () = self.closed.cancelled() => Err(Error::SendFailed("connection closed".to_string())),
            result = self.sender.send(frame) => {
                result.map_err(|_| Error::SendFailed("connection closed".to_string()))
            }
        }
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

/// Callback run once when a client connection dies.
pub type OnClose = Box<dyn FnOnce(ConnectionId) + Send + 'static>;

/// A client connection to one remote endpoint.
///
/// Many calls share it; their responses are routed back through the
/// pending-call registry by the connection's read task.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    addr: SocketAddr,
    outbound: Outbound,
}

impl Connection {
    /// Connect to `addr` and start the read and write tasks.
    ///
    /// When the connection dies, every call pending on it is failed with
    /// [`ConnectionError::Closed`] and `on_close` runs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` is invalid, or a
    /// [`ConnectionError`] if the connection cannot be established.
    pub async fn open(
        id: ConnectionId,
        addr: SocketAddr,
        config: &PoolConfig,
        codec: CodecKind,
        pending: PendingCalls,
        on_close: OnClose,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectionError::ConnectTimeout {
                addr,
                timeout: config.connect_timeout,
            })?
            .map_err(|source| ConnectionError::ConnectFailed { addr, source })?;
        stream.set_nodelay(true)?;

        let frame_codec = FrameCodec::new().with_max_frame_size(config.max_frame_size);
        let (read_half, write_half) = stream.into_split();
        let closed = CancellationToken::new();
        let outbound = Outbound::spawn(
            FramedWrite::new(write_half, frame_codec),
            config.outbound_capacity,
            closed.clone(),
        );

        let connection = Arc::new(Self {
            id,
            addr,
            outbound: outbound.clone(),
        });

        let reader = FramedRead::new(read_half, frame_codec);
        let config = config.clone();
        tokio::spawn(async move {
            read_loop(id, addr, reader, &outbound, codec, &config, &pending).await;

            // Closed before cancelling so a caller registering concurrently
            // either sees the closed flag or is caught by the cancellation.
            outbound.close();
            on_close(id);
            let failed = pending.cancel_connection(id, || ConnectionError::Closed.into());
            debug!(
                "connection {} to {} closed, failed {} pending calls",
                id, addr, failed
            );
        });

        debug!("created new connection {} to {}", id, addr);
        Ok(connection)
    }

    /// The connection id.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// The remote endpoint.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the connection is still usable.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.outbound.is_open()
    }

    /// Whether a frame can be queued right now.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.outbound.is_writable()
    }

    /// Queue a frame for sending without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SendFailed`] if the connection is closed or not
    /// writable.
    pub fn send(&self, frame: Frame) -> Result<()> {
        self.outbound.try_send(frame)
    }

    /// Close the connection; pending calls on it fail.
    pub fn close(&self) {
        self.outbound.close();
    }

    /// Resolves once the connection has closed.
    pub async fn closed(&self) {
        self.outbound.closed().await;
    }
}

async fn read_loop(
    id: ConnectionId,
    addr: SocketAddr,
    mut reader: FramedRead<tokio::net::tcp::OwnedReadHalf, FrameCodec>,
    outbound: &Outbound,
    codec: CodecKind,
    config: &PoolConfig,
    pending: &PendingCalls,
) {
    let mut heartbeat = interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let idle = sleep(config.idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            () = outbound.closed() => {
                debug!("connection {} closed locally", id);
                break;
            }
            () = &mut idle => {
                warn!(
                    "no frames from {} for {:?}, closing connection {}",
                    addr, config.idle_timeout, id
                );
                break;
            }
            _ = heartbeat.tick() => {
                match outbound.try_send(Frame::heartbeat(codec)) {
                    Ok(()) => trace!("heartbeat sent on connection {}", id),
                    Err(e) => warn!("heartbeat on connection {} not sent: {}", id, e),
                }
            }
            frame = reader.next() => match frame {
                Some(Ok(frame)) => {
                    idle.as_mut().reset(Instant::now() + config.idle_timeout);
                    match Message::from_frame(&frame) {
                        Ok(Message::Response(response)) => {
                            let request_id = response.request_id().to_string();
                            if pending.resolve(response) {
                                trace!("resolved request {} on connection {}", request_id, id);
                            } else {
                                warn!("dropping response for unknown or expired request {}", request_id);
                            }
                        }
                        Ok(Message::Heartbeat) => trace!("heartbeat from {}", addr),
                        Ok(Message::Request(request)) => {
                            warn!("ignoring request {} sent to a client connection", request.request_id());
                        }
                        Err(e) => {
                            error!("protocol violation from {}: {}", addr, e);
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    error!("stream error on connection {} to {}: {}", id, addr, e);
                    break;
                }
                None => {
                    debug!("connection {} closed by {}", id, addr);
                    break;
                }
            }
        }
    }
}
