//! Transport layer for Padlink.
//!
//! Two connection kinds share the [`Connection`] contract:
//!
//! - [`TcpConnection`]: reliable and ordered, one peer per connection,
//!   channels keyed by id. [`TcpTransport`] accepts inbound ones.
//! - [`UdpConnection`]: datagrams, many peers per socket, read channels keyed
//!   by `host/id` and write channels by `host:port/id`.
//!
//! Frames are routed to typed [`ReadChannel`]s; [`WriteChannel`]s frame
//! values for one destination. Receive handlers, error callbacks and
//! disconnect callbacks all run on the connection's delegate queue, never
//! on a socket task.
//!
//! Every constructor spawns onto the current Tokio runtime.

#![allow(async_fn_in_trait)]

mod channel;
mod error;
mod shared;
mod tcp;
mod udp;

pub use channel::{ChannelKey, ReadChannel, WriteChannel};
pub use error::TransportError;
pub use tcp::{TcpConnection, TcpTransport};
pub use udp::UdpConnection;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use padlink_protocol::{ChannelId, Marshal};

/// Names one TCP or UDP connection for its whole life.
///
/// Ids come from a process-wide counter, so a replacement link to the same
/// peer never reuses the id of the link it replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Accepts new incoming connections.
pub trait Transport: Send + Sync + 'static {
    /// The connection type produced by this transport.
    type Connection: Connection;
    /// The error type for transport operations.
    type Error: std::error::Error + Send + Sync;

    /// Waits for and accepts the next incoming connection.
    async fn accept(&mut self) -> Result<Self::Connection, Self::Error>;

    /// Stops accepting. A pending or later `accept` returns an error.
    async fn shutdown(&self) -> Result<(), Self::Error>;
}

/// A socket plus its channel tables.
///
/// `connect` and `listen` report failure through their result. Failures
/// after that (a write or read error) reach the [`on_error`] handler once,
/// and the connection closes; closing for any reason fires [`on_disconnect`]
/// exactly once.
///
/// [`on_error`]: Connection::on_error
/// [`on_disconnect`]: Connection::on_disconnect
pub trait Connection: Send + Sync + 'static {
    /// Connects to a remote peer. A no-op if already connected.
    async fn connect(&self, addr: SocketAddr) -> Result<(), TransportError>;

    /// Starts receiving on a local port.
    async fn listen(&self, port: u16) -> Result<(), TransportError>;

    /// Closes the socket. Every channel becomes inert.
    fn disconnect(&self);

    /// Sends raw, already-framed bytes. Fire-and-forget.
    ///
    /// `dest` defaults to the connected peer; without one this is a no-op.
    fn send(&self, data: Bytes, dest: Option<SocketAddr>);

    /// Registers a channel decoding `T` frames on `id`.
    ///
    /// Returns `None` while the connection cannot tell which peer the
    /// channel belongs to.
    fn register_read_channel<T>(&self, id: ChannelId, host: Option<IpAddr>) -> Option<ReadChannel<T>>
    where
        T: Marshal + Send + 'static;

    /// Registers a channel framing `T` values on `id`.
    ///
    /// Returns `None` while no destination is known.
    fn register_write_channel<T>(&self, id: ChannelId, dest: Option<SocketAddr>) -> Option<WriteChannel<T>>
    where
        T: Marshal + Send + 'static;

    /// Stops routing frames to `channel`. Frames already queued for
    /// delivery are dropped.
    fn deregister_read_channel<T>(&self, channel: &ReadChannel<T>);

    /// Makes `channel` inert.
    fn deregister_write_channel<T>(&self, channel: &WriteChannel<T>);

    /// Sets the handler for errors after connect/listen.
    fn on_error<F>(&self, handler: F)
    where
        F: Fn(TransportError) + Send + Sync + 'static;

    /// Sets the handler run once when the connection closes.
    fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static;

    /// Whether a remote peer is bound and the connection is open.
    fn is_connected(&self) -> bool;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_ids_are_unique_across_kinds() {
        let tcp = TcpConnection::new();
        let udp = UdpConnection::new();
        let replacement = TcpConnection::new();

        assert_ne!(tcp.id(), udp.id());
        assert!(replacement.id() > tcp.id());
        assert!(replacement.id() > udp.id());
        assert!(tcp.id().to_string().starts_with("link-"));
    }
}
