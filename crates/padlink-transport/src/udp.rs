//! Unreliable transport: UDP datagrams, one frame per datagram.
//!
//! One socket can serve many peers, so read channels are keyed by the
//! sender's host and write channels carry their own destination.
//! Datagrams may be lost or reordered; nothing here tries to fix that.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use padlink_exec::{ConcurrentQueue, Queue, QueueExt};
use padlink_protocol::{ChannelId, Frame, Marshal};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};

use crate::channel::{ChannelKey, Outbound, ReadChannel, WriteChannel};
use crate::shared::{Shared, lock};
use crate::{Connection, ConnectionId, TransportError};

/// Largest datagram the receive loop accepts.
const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Default)]
struct UdpState {
    socket: Option<Arc<UdpSocket>>,
    /// Set by `connect`; the default destination and read host.
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
}

struct UdpInner {
    shared: Arc<Shared>,
    state: Mutex<UdpState>,
    io: ConcurrentQueue,
}

impl Outbound for UdpInner {
    fn send_bytes(&self, data: Bytes, dest: Option<SocketAddr>) {
        let (socket, dest) = {
            let state = lock(&self.state);
            (state.socket.clone(), dest.or(state.peer))
        };
        let (Some(socket), Some(dest)) = (socket, dest) else {
            trace!(conn = %self.shared.id, "UDP send without socket or destination ignored");
            return;
        };
        if self.shared.is_closed() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        self.io.dispatch(move || match socket.try_send_to(&data, dest) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                trace!(conn = %shared.id, %dest, "socket busy, datagram dropped");
            }
            Err(e) => shared.report(TransportError::SendFailed(e)),
        });
    }
}

/// A datagram connection that multiplexes many peers over one socket.
/// Cheap to clone.
#[derive(Clone)]
pub struct UdpConnection {
    inner: Arc<UdpInner>,
}

impl UdpConnection {
    /// An unbound connection with a private delegate queue.
    pub fn new() -> Self {
        Self::with_delegate_option(None)
    }

    /// An unbound connection that delivers callbacks on `queue`.
    pub fn with_delegate(queue: Arc<dyn Queue>) -> Self {
        Self::with_delegate_option(Some(queue))
    }

    fn with_delegate_option(queue: Option<Arc<dyn Queue>>) -> Self {
        Self {
            inner: Arc::new(UdpInner {
                shared: Shared::new("udp", queue),
                state: Mutex::new(UdpState::default()),
                io: ConcurrentQueue::new(),
            }),
        }
    }

    /// Binds to an explicit local address and starts receiving.
    pub async fn bind(&self, addr: SocketAddr) -> Result<SocketAddr, TransportError> {
        if self.inner.shared.is_closed() {
            return Err(TransportError::ConnectionClosed(self.id().to_string()));
        }
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(TransportError::BindFailed)?;
        let local = socket.local_addr().map_err(TransportError::BindFailed)?;
        self.install(socket, local, None);
        info!(conn = %self.id(), %local, "UDP listening");
        Ok(local)
    }

    /// `(read channels, write channels)` currently registered.
    pub fn channel_counts(&self) -> (usize, usize) {
        self.inner.shared.registry.len()
    }

    fn install(&self, socket: UdpSocket, local: SocketAddr, peer: Option<SocketAddr>) {
        let socket = Arc::new(socket);
        {
            let mut state = lock(&self.inner.state);
            state.socket = Some(Arc::clone(&socket));
            state.local = Some(local);
            state.peer = peer;
        }
        tokio::spawn(recv_loop(Arc::clone(&self.inner.shared), socket));
    }

    fn is_bound(&self) -> bool {
        lock(&self.inner.state).socket.is_some()
    }
}

impl Default for UdpConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpConnection")
            .field("id", &self.inner.shared.id)
            .field("local", &self.local_addr())
            .field("peer", &self.peer_addr())
            .finish()
    }
}

impl Connection for UdpConnection {
    /// Binds an ephemeral socket and fixes `addr` as the default peer.
    async fn connect(&self, addr: SocketAddr) -> Result<(), TransportError> {
        if self.inner.shared.is_closed() {
            return Err(TransportError::ConnectionClosed(self.id().to_string()));
        }
        if self.is_bound() {
            return Ok(());
        }

        let any: IpAddr = match addr {
            SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let socket = UdpSocket::bind(SocketAddr::new(any, 0))
            .await
            .map_err(TransportError::BindFailed)?;
        socket
            .connect(addr)
            .await
            .map_err(TransportError::ConnectFailed)?;
        let local = socket.local_addr().map_err(TransportError::BindFailed)?;
        self.install(socket, local, Some(addr));
        info!(conn = %self.id(), %local, peer = %addr, "UDP connected");
        Ok(())
    }

    /// Binds every interface on `port` (0 picks one) and starts receiving.
    async fn listen(&self, port: u16) -> Result<(), TransportError> {
        if self.is_bound() {
            return Ok(());
        }
        self.bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port))
            .await
            .map(|_| ())
    }

    fn disconnect(&self) {
        lock(&self.inner.state).socket = None;
        self.inner.shared.close();
    }

    fn send(&self, data: Bytes, dest: Option<SocketAddr>) {
        self.inner.send_bytes(data, dest);
    }

    /// Receives frames on `id` from `host`, or from the connected peer when
    /// `host` is `None`. Returns `None` if neither is known.
    fn register_read_channel<T>(&self, id: ChannelId, host: Option<IpAddr>) -> Option<ReadChannel<T>>
    where
        T: Marshal + Send + 'static,
    {
        let host = host.or_else(|| self.peer_addr().map(|p| p.ip()))?;
        Some(self.inner.shared.registry.register_read(ChannelKey::host(host, id)))
    }

    /// Sends frames on `id` to `dest`, or to the connected peer when `dest`
    /// is `None`. Returns `None` if neither is known.
    fn register_write_channel<T>(&self, id: ChannelId, dest: Option<SocketAddr>) -> Option<WriteChannel<T>>
    where
        T: Marshal + Send + 'static,
    {
        let dest = dest.or_else(|| self.peer_addr())?;
        let outbound: Arc<dyn Outbound> = self.inner.clone();
        Some(
            self.inner
                .shared
                .registry
                .register_write(ChannelKey::endpoint(dest, id), Some(dest), outbound),
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

async fn recv_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        match received {
            Ok((len, from)) => match Frame::decode(&buf[..len]) {
                Ok(frame) => shared.route(Some(from.ip()), frame),
                Err(e) => trace!(conn = %shared.id, %from, error = %e, "bad datagram dropped"),
            },
            // ICMP feedback from an earlier send on a connected socket.
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset) => {
                debug!(conn = %shared.id, error = %e, "peer unreachable");
            }
            Err(e) => {
                shared.report(TransportError::ReceiveFailed(e));
                break;
            }
        }
    }
    shared.close();
}
