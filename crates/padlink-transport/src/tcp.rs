//! Reliable transport: TCP with stream framing.
//!
//! A [`TcpConnection`] serves exactly one peer, so its channels are keyed by
//! id alone. Reads go through a `FramedRead` with [`FrameCodec`]; writes are
//! queued to a writer task so frames leave in the order they were sent.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use padlink_exec::Queue;
use padlink_protocol::{ChannelId, FrameCodec, Marshal, ProtocolError};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::channel::{ChannelKey, Outbound, ReadChannel, WriteChannel};
use crate::shared::{Shared, lock};
use crate::{Connection, ConnectionId, Transport, TransportError};

/// How long a closing connection keeps writing frames queued before the
/// close.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// TcpTransport
// ---------------------------------------------------------------------------

/// A TCP listener that yields [`TcpConnection`]s.
pub struct TcpTransport {
    listener: TcpListener,
    delegate: Option<Arc<dyn Queue>>,
    shutdown: CancellationToken,
}

impl TcpTransport {
    /// Binds a new TCP transport to the given address.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::BindFailed)?;
        let local = listener.local_addr().map_err(TransportError::BindFailed)?;
        info!(addr = %local, "TCP transport listening");
        Ok(Self {
            listener,
            delegate: None,
            shutdown: CancellationToken::new(),
        })
    }

    /// Makes accepted connections deliver callbacks on `queue` instead of a
    /// private queue each.
    pub fn with_delegate(mut self, queue: Arc<dyn Queue>) -> Self {
        self.delegate = Some(queue);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener.local_addr().map_err(TransportError::BindFailed)
    }
}

impl Transport for TcpTransport {
    type Connection = TcpConnection;
    type Error = TransportError;

    /// Accepts the next peer. The returned connection does not read until
    /// [`TcpConnection::begin_receiving`] is called, so channels can be
    /// registered first without losing the peer's opening frames.
    async fn accept(&mut self) -> Result<TcpConnection, TransportError> {
        let (stream, addr) = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(TransportError::Shutdown),
            accepted = self.listener.accept() => accepted.map_err(TransportError::AcceptFailed)?,
        };

        let conn = TcpConnection::with_delegate_option(self.delegate.clone());
        conn.attach(stream, addr, false);
        debug!(conn = %conn.id(), %addr, "accepted TCP connection");
        Ok(conn)
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.shutdown.cancel();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TcpConnection
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TcpState {
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    /// Read half parked until `begin_receiving`.
    pending_reader: Option<OwnedReadHalf>,
}

struct TcpInner {
    shared: Arc<Shared>,
    state: Mutex<TcpState>,
}

impl Outbound for TcpInner {
    fn send_bytes(&self, data: Bytes, _dest: Option<SocketAddr>) {
        let writer = lock(&self.state).writer.clone();
        match writer {
            Some(writer) if !self.shared.is_closed() => {
                let _ = writer.send(data);
            }
            _ => trace!(conn = %self.shared.id, "send on unconnected TCP connection ignored"),
        }
    }
}

/// A reliable, ordered connection to one peer. Cheap to clone.
#[derive(Clone)]
pub struct TcpConnection {
    inner: Arc<TcpInner>,
}

impl TcpConnection {
    /// An unconnected connection with a private delegate queue.
    pub fn new() -> Self {
        Self::with_delegate_option(None)
    }

    /// An unconnected connection that delivers callbacks on `queue`.
    pub fn with_delegate(queue: Arc<dyn Queue>) -> Self {
        Self::with_delegate_option(Some(queue))
    }

    fn with_delegate_option(queue: Option<Arc<dyn Queue>>) -> Self {
        Self {
            inner: Arc::new(TcpInner {
                shared: Shared::new("tcp", queue),
                state: Mutex::new(TcpState::default()),
            }),
        }
    }

    /// Starts reading frames on an accepted connection. No-op if already
    /// reading.
    pub fn begin_receiving(&self) {
        let reader = lock(&self.inner.state).pending_reader.take();
        if let Some(reader) = reader {
            tokio::spawn(read_loop(Arc::clone(&self.inner.shared), reader));
        }
    }

    /// `(read channels, write channels)` currently registered.
    pub fn channel_counts(&self) -> (usize, usize) {
        self.inner.shared.registry.len()
    }

    /// Installs the stream's halves and starts the writer task. With
    /// `receive` set the reader starts too.
    fn attach(&self, stream: TcpStream, peer: SocketAddr, receive: bool) {
        let _ = stream.set_nodelay(true);
        let local = stream.local_addr().ok();
        let (reader, writer) = stream.into_split();

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(Arc::clone(&self.inner.shared), writer, rx));

        {
            let mut state = lock(&self.inner.state);
            state.peer = Some(peer);
            state.local = local;
            state.writer = Some(tx);
            state.pending_reader = Some(reader);
        }

        if receive {
            self.begin_receiving();
        }
    }
}

impl Default for TcpConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.inner.shared.id)
            .field("peer", &self.peer_addr())
            .finish()
    }
}

impl Connection for TcpConnection {
    async fn connect(&self, addr: SocketAddr) -> Result<(), TransportError> {
        if self.inner.shared.is_closed() {
            return Err(TransportError::ConnectionClosed(self.id().to_string()));
        }
        if self.is_connected() {
            return Ok(());
        }

        let stream = TcpStream::connect(addr)
            .await
            .map_err(TransportError::ConnectFailed)?;
        self.attach(stream, addr, true);
        info!(conn = %self.id(), %addr, "TCP connected");
        Ok(())
    }

    async fn listen(&self, _port: u16) -> Result<(), TransportError> {
        Err(TransportError::Unsupported(
            "TCP connections do not listen; use TcpTransport",
        ))
    }

    fn disconnect(&self) {
        lock(&self.inner.state).writer = None;
        self.inner.shared.close();
    }

    fn send(&self, data: Bytes, dest: Option<SocketAddr>) {
        self.inner.send_bytes(data, dest);
    }

    /// `host` is ignored: the connection has a single peer.
    fn register_read_channel<T>(&self, id: ChannelId, _host: Option<IpAddr>) -> Option<ReadChannel<T>>
    where
        T: Marshal + Send + 'static,
    {
        if !self.is_connected() {
            return None;
        }
        Some(self.inner.shared.registry.register_read(ChannelKey::local(id)))
    }

    /// `dest` is ignored: frames always go to the connected peer.
    fn register_write_channel<T>(&self, id: ChannelId, _dest: Option<SocketAddr>) -> Option<WriteChannel<T>>
    where
        T: Marshal + Send + 'static,
    {
        if !self.is_connected() {
            return None;
        }
        let outbound: Arc<dyn Outbound> = self.inner.clone();
        Some(
            self.inner
                .shared
                .registry
                .register_write(ChannelKey::local(id), None, outbound),
        )
    }

    fn deregister_read_channel<T>(&self, channel: &ReadChannel<T>) {
        self.inner.shared.registry.deregister_read(channel);
    }

    fn deregister_write_channel<T>(&self, channel: &WriteChannel<T>) {
        self.inner.shared.registry.deregister_write(channel);
    }

    fn on_error<F>(&self, handler: F)
    where
        F: Fn(TransportError) + Send + Sync + 'static,
    {
        self.inner.shared.set_error_handler(Arc::new(handler));
    }

    fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.shared.set_disconnect_handler(Arc::new(handler));
    }

    fn is_connected(&self) -> bool {
        !self.inner.shared.is_closed() && lock(&self.inner.state).peer.is_some()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.state).local
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.state).peer
    }

    fn id(&self) -> ConnectionId {
        self.inner.shared.id
    }
}

// ---------------------------------------------------------------------------
// I/O tasks
// ---------------------------------------------------------------------------

async fn read_loop(shared: Arc<Shared>, reader: OwnedReadHalf) {
    let mut frames = FramedRead::new(reader, FrameCodec::new());
    loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(frame)) => shared.route(None, frame),
            Some(Err(ProtocolError::Io(e))) => {
                shared.report(TransportError::ReceiveFailed(e));
                break;
            }
            Some(Err(e)) => {
                shared.report(TransportError::Framing(e));
                break;
            }
            None => {
                debug!(conn = %shared.id, "peer closed TCP stream");
                break;
            }
        }
    }
    shared.close();
}

async fn write_loop(shared: Arc<Shared>, mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    loop {
        let data = tokio::select! {
            _ = shared.cancel.cancelled() => {
                // Frames sent before the close still go out, within a bound.
                if time::timeout(DRAIN_TIMEOUT, drain(&mut writer, &mut rx)).await.is_err() {
                    debug!(conn = %shared.id, "peer stopped reading, queued frames dropped");
                }
                break;
            }
            data = rx.recv() => data,
        };
        let Some(data) = data else { break };
        if let Err(e) = writer.write_all(&data).await {
            shared.report(TransportError::SendFailed(e));
            shared.close();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn drain(writer: &mut OwnedWriteHalf, rx: &mut mpsc::UnboundedReceiver<Bytes>) {
    while let Ok(data) = rx.try_recv() {
        if writer.write_all(&data).await.is_err() {
            return;
        }
    }
}
