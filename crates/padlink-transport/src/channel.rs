//! Typed read/write channels and the registry that routes frames to them.
//!
//! A connection owns one [`ChannelRegistry`]. Inbound frames are looked up
//! by `(peer host, channel id)`; reliable connections serve a single peer
//! and leave the host out of the key.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use padlink_protocol::{ChannelId, FRAME_HEADER_LEN, Frame, Marshal};
use tracing::{trace, warn};

use crate::shared::lock;

// ---------------------------------------------------------------------------
// ChannelKey
// ---------------------------------------------------------------------------

/// Identity of a channel within one connection.
///
/// Displays as `host[:port]/id`, or just `id` when the connection serves a
/// single peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub host: Option<IpAddr>,
    pub port: Option<u16>,
    pub id: ChannelId,
}

impl ChannelKey {
    /// Key for a single-peer connection.
    pub fn local(id: ChannelId) -> Self {
        Self {
            host: None,
            port: None,
            id,
        }
    }

    /// Key matching every datagram from `host`, whatever its source port.
    pub fn host(host: IpAddr, id: ChannelId) -> Self {
        Self {
            host: Some(host),
            port: None,
            id,
        }
    }

    /// Key for one exact remote endpoint.
    pub fn endpoint(addr: SocketAddr, id: ChannelId) -> Self {
        Self {
            host: Some(addr.ip()),
            port: Some(addr.port()),
            id,
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.host, self.port) {
            (Some(host), Some(port)) => write!(f, "{}/{}", SocketAddr::new(host, port), self.id.0),
            (Some(host), None) => write!(f, "{host}/{}", self.id.0),
            (None, _) => write!(f, "{}", self.id.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal seams
// ---------------------------------------------------------------------------

/// Receives raw frames routed to a read channel.
pub(crate) trait FrameSink: Send + Sync {
    fn receive(&self, frame: &Frame);
}

/// The send half of a connection, as seen by a write channel.
pub(crate) trait Outbound: Send + Sync {
    fn send_bytes(&self, data: Bytes, dest: Option<SocketAddr>);
}

static NEXT_REGISTRATION: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// ReadChannel
// ---------------------------------------------------------------------------

type ReceiveHandler<T> = Arc<dyn Fn(T) + Send + Sync + 'static>;

struct ReadSlot<T> {
    key: ChannelKey,
    handler: Mutex<Option<ReceiveHandler<T>>>,
}

impl<T: Marshal + Send + 'static> FrameSink for ReadSlot<T> {
    fn receive(&self, frame: &Frame) {
        let message = match T::unmarshal(&frame.payload) {
            Ok(message) => message,
            Err(e) => {
                trace!(channel = %self.key, error = %e, "undecodable frame dropped");
                return;
            }
        };
        let handler = lock(&self.handler).clone();
        match handler {
            Some(handler) => handler(message),
            None => trace!(channel = %self.key, "no receive handler, frame dropped"),
        }
    }
}

/// Inbound side of a channel: decodes frames into `T`.
pub struct ReadChannel<T> {
    registration: u64,
    slot: Arc<ReadSlot<T>>,
}

impl<T: Marshal + Send + 'static> ReadChannel<T> {
    /// Sets the receive handler, replacing any previous one.
    ///
    /// The handler runs on the connection's delegate queue.
    pub fn on_receive<F>(&self, handler: F)
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        *lock(&self.slot.handler) = Some(Arc::new(handler));
    }

    pub fn key(&self) -> ChannelKey {
        self.slot.key
    }
}

impl<T> fmt::Debug for ReadChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadChannel")
            .field("key", &self.slot.key)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// WriteChannel
// ---------------------------------------------------------------------------

/// Outbound side of a channel: frames `T` values for one destination.
pub struct WriteChannel<T> {
    registration: u64,
    key: ChannelKey,
    dest: Option<SocketAddr>,
    active: Arc<AtomicBool>,
    outbound: Arc<dyn Outbound>,
    _marker: PhantomData<fn(&T)>,
}

impl<T: Marshal> WriteChannel<T> {
    /// Frames `payload` and hands it to the connection. Fire-and-forget.
    ///
    /// A no-op once the channel is deregistered.
    pub fn send(&self, payload: &T) {
        if !self.active.load(Ordering::Acquire) {
            trace!(channel = %self.key, "send on deregistered channel ignored");
            return;
        }
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + 64);
        if let Err(e) = Frame::write(self.key.id, &mut buf, |buf| payload.marshal(buf)) {
            warn!(channel = %self.key, error = %e, "unsendable payload dropped");
            return;
        }
        self.outbound.send_bytes(buf.freeze(), self.dest);
    }

    pub fn key(&self) -> ChannelKey {
        self.key
    }

    /// Destination bound at registration, if the connection needs one.
    pub fn destination(&self) -> Option<SocketAddr> {
        self.dest
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl<T> fmt::Debug for WriteChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteChannel")
            .field("key", &self.key)
            .field("dest", &self.dest)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ChannelRegistry
// ---------------------------------------------------------------------------

struct ReadEntry {
    registration: u64,
    sink: Arc<dyn FrameSink>,
}

struct WriteEntry {
    registration: u64,
    active: Arc<AtomicBool>,
}

/// Read and write channel tables of one connection.
///
/// Registering a key that is already present replaces the old channel; the
/// old handle then stops receiving (reads) or sending (writes).
#[derive(Default)]
pub(crate) struct ChannelRegistry {
    reads: Mutex<HashMap<ChannelKey, ReadEntry>>,
    writes: Mutex<HashMap<ChannelKey, WriteEntry>>,
}

impl ChannelRegistry {
    pub(crate) fn register_read<T: Marshal + Send + 'static>(&self, key: ChannelKey) -> ReadChannel<T> {
        let registration = NEXT_REGISTRATION.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(ReadSlot {
            key,
            handler: Mutex::new(None),
        });
        let sink: Arc<dyn FrameSink> = slot.clone();
        lock(&self.reads).insert(key, ReadEntry { registration, sink });
        tracing::debug!(channel = %key, "read channel registered");
        ReadChannel { registration, slot }
    }

    pub(crate) fn deregister_read<T>(&self, channel: &ReadChannel<T>) {
        let key = channel.slot.key;
        let mut reads = lock(&self.reads);
        if reads.get(&key).is_some_and(|e| e.registration == channel.registration) {
            reads.remove(&key);
            tracing::debug!(channel = %key, "read channel deregistered");
        }
    }

    pub(crate) fn register_write<T: Marshal>(
        &self,
        key: ChannelKey,
        dest: Option<SocketAddr>,
        outbound: Arc<dyn Outbound>,
    ) -> WriteChannel<T> {
        let registration = NEXT_REGISTRATION.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let previous = lock(&self.writes).insert(
            key,
            WriteEntry {
                registration,
                active: Arc::clone(&active),
            },
        );
        if let Some(previous) = previous {
            previous.active.store(false, Ordering::Release);
        }
        tracing::debug!(channel = %key, "write channel registered");
        WriteChannel {
            registration,
            key,
            dest,
            active,
            outbound,
            _marker: PhantomData,
        }
    }

    pub(crate) fn deregister_write<T>(&self, channel: &WriteChannel<T>) {
        let mut writes = lock(&self.writes);
        if writes
            .get(&channel.key)
            .is_some_and(|e| e.registration == channel.registration)
        {
            writes.remove(&channel.key);
            tracing::debug!(channel = %channel.key, "write channel deregistered");
        }
        channel.active.store(false, Ordering::Release);
    }

    /// Finds the read channel for a frame from `host`.
    pub(crate) fn read_sink(&self, host: Option<IpAddr>, id: ChannelId) -> Option<Arc<dyn FrameSink>> {
        let key = match host {
            Some(host) => ChannelKey::host(host, id),
            None => ChannelKey::local(id),
        };
        lock(&self.reads).get(&key).map(|e| Arc::clone(&e.sink))
    }

    /// Deactivates and forgets every write channel.
    pub(crate) fn deactivate_writes(&self) {
        for (_, entry) in lock(&self.writes).drain() {
            entry.active.store(false, Ordering::Release);
        }
    }

    pub(crate) fn clear_reads(&self) {
        lock(&self.reads).clear();
    }

    /// `(read channels, write channels)` currently registered.
    pub(crate) fn len(&self) -> (usize, usize) {
        (lock(&self.reads).len(), lock(&self.writes).len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use padlink_protocol::{ControllerNameMessage, GamepadLayoutMessage};
    use std::net::Ipv4Addr;
    use std::sync::mpsc;

    struct Captured(Mutex<Vec<(Bytes, Option<SocketAddr>)>>);

    impl Outbound for Captured {
        fn send_bytes(&self, data: Bytes, dest: Option<SocketAddr>) {
            lock(&self.0).push((data, dest));
        }
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_key_display() {
        let id = ChannelId(3);
        assert_eq!(ChannelKey::local(id).to_string(), "3");
        assert_eq!(ChannelKey::host(ip(7), id).to_string(), "10.0.0.7/3");
        let addr = SocketAddr::new(ip(7), 9000);
        assert_eq!(ChannelKey::endpoint(addr, id).to_string(), "10.0.0.7:9000/3");
    }

    #[test]
    fn test_read_routing_isolates_hosts() {
        let registry = ChannelRegistry::default();
        let a = registry.register_read::<GamepadLayoutMessage>(ChannelKey::host(ip(1), ChannelId(3)));
        let (tx, rx) = mpsc::channel();
        a.on_receive(move |m| tx.send(m).unwrap());

        assert!(registry.read_sink(Some(ip(2)), ChannelId(3)).is_none());
        assert!(registry.read_sink(Some(ip(1)), ChannelId(4)).is_none());

        let frame = Frame::new(ChannelId(3), vec![2u8, 0]);
        registry.read_sink(Some(ip(1)), ChannelId(3)).unwrap().receive(&frame);
        assert_eq!(rx.try_recv().unwrap().layout, padlink_protocol::GamepadLayout::Regular);
    }

    #[test]
    fn test_undecodable_frame_is_dropped() {
        let registry = ChannelRegistry::default();
        let channel = registry.register_read::<GamepadLayoutMessage>(ChannelKey::local(ChannelId(1)));
        let (tx, rx) = mpsc::channel();
        channel.on_receive(move |m| tx.send(m).unwrap());

        let sink = registry.read_sink(None, ChannelId(1)).unwrap();
        sink.receive(&Frame::new(ChannelId(1), vec![9u8, 0]));
        sink.receive(&Frame::new(ChannelId(1), Vec::<u8>::new()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stale_deregistration_keeps_replacement() {
        let registry = ChannelRegistry::default();
        let key = ChannelKey::local(ChannelId(2));
        let old = registry.register_read::<GamepadLayoutMessage>(key);
        let _new = registry.register_read::<GamepadLayoutMessage>(key);

        registry.deregister_read(&old);
        assert!(registry.read_sink(None, ChannelId(2)).is_some());
    }

    #[test]
    fn test_write_channel_frames_payload() {
        let registry = ChannelRegistry::default();
        let out = Arc::new(Captured(Mutex::new(Vec::new())));
        let dest = SocketAddr::new(ip(4), 5000);
        let channel = registry.register_write::<GamepadLayoutMessage>(
            ChannelKey::endpoint(dest, ChannelId(1)),
            Some(dest),
            out.clone(),
        );

        channel.send(&GamepadLayoutMessage { layout: padlink_protocol::GamepadLayout::Micro });
        let sent = lock(&out.0).clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.as_ref(), &[1, 0, 2, 0, 0, 0, 1, 0]);
        assert_eq!(sent[0].1, Some(dest));
    }

    #[test]
    fn test_write_channel_drops_oversized_payload() {
        let registry = ChannelRegistry::default();
        let out = Arc::new(Captured(Mutex::new(Vec::new())));
        let channel = registry.register_write::<ControllerNameMessage>(
            ChannelKey::local(ChannelId::CONTROLLER_NAME),
            None,
            out.clone(),
        );

        let huge = "x".repeat(padlink_protocol::MAX_FRAME_PAYLOAD + 1);
        channel.send(&ControllerNameMessage::new(Some(huge)));
        assert!(lock(&out.0).is_empty());

        channel.send(&ControllerNameMessage::new(Some("pad".into())));
        assert_eq!(lock(&out.0)[0].0.as_ref(), &[2, 0, 3, 0, 0, 0, b'p', b'a', b'd']);
    }

    #[test]
    fn test_deregistered_or_replaced_write_channel_is_inert() {
        let registry = ChannelRegistry::default();
        let out = Arc::new(Captured(Mutex::new(Vec::new())));
        let key = ChannelKey::local(ChannelId(1));
        let first = registry.register_write::<GamepadLayoutMessage>(key, None, out.clone());
        let second = registry.register_write::<GamepadLayoutMessage>(key, None, out.clone());
        assert!(!first.is_active());

        registry.deregister_write(&second);
        let msg = GamepadLayoutMessage { layout: padlink_protocol::GamepadLayout::Micro };
        first.send(&msg);
        second.send(&msg);
        assert!(lock(&out.0).is_empty());
        assert_eq!(registry.len(), (0, 0));
    }
}
