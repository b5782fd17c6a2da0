//! State shared by both connection kinds: channel tables, delegate queue,
//! callbacks and the close latch.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use padlink_exec::{Queue, QueueExt, SerialQueue};
use padlink_protocol::Frame;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::channel::ChannelRegistry;
use crate::{ConnectionId, TransportError};

pub(crate) type ErrorHandler = Arc<dyn Fn(TransportError) + Send + Sync + 'static>;
pub(crate) type DisconnectHandler = Arc<dyn Fn() + Send + Sync + 'static>;

pub(crate) fn lock<S>(mutex: &Mutex<S>) -> MutexGuard<'_, S> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct Shared {
    pub(crate) id: ConnectionId,
    pub(crate) registry: ChannelRegistry,
    pub(crate) cancel: CancellationToken,
    delegate: Arc<dyn Queue>,
    on_error: Mutex<Option<ErrorHandler>>,
    on_disconnect: Mutex<Option<DisconnectHandler>>,
    closed: AtomicBool,
}

impl Shared {
    pub(crate) fn new(kind: &str, delegate: Option<Arc<dyn Queue>>) -> Arc<Self> {
        let id = ConnectionId::next();
        let delegate = delegate
            .unwrap_or_else(|| Arc::new(SerialQueue::new(format!("{kind}.{id}.delegate"))));
        Arc::new(Self {
            id,
            registry: ChannelRegistry::default(),
            cancel: CancellationToken::new(),
            delegate,
            on_error: Mutex::new(None),
            on_disconnect: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn set_error_handler(&self, handler: ErrorHandler) {
        *lock(&self.on_error) = Some(handler);
    }

    pub(crate) fn set_disconnect_handler(&self, handler: DisconnectHandler) {
        *lock(&self.on_disconnect) = Some(handler);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Delivers `err` to the error handler on the delegate queue.
    pub(crate) fn report(&self, err: TransportError) {
        warn!(conn = %self.id, error = %err, "connection error");
        let handler = lock(&self.on_error).clone();
        if let Some(handler) = handler {
            self.delegate.dispatch(move || handler(err));
        }
    }

    /// Closes the connection once: stops I/O tasks, makes every write
    /// channel inert and fires the disconnect handler. Read channels are
    /// dropped on the delegate queue, after frames routed before the close
    /// have been delivered. Later calls do nothing.
    pub(crate) fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.registry.deactivate_writes();
        info!(conn = %self.id, "connection closed");

        let shared = Arc::clone(self);
        let handler = lock(&self.on_disconnect).clone();
        self.delegate.dispatch(move || {
            shared.registry.clear_reads();
            if let Some(handler) = handler {
                handler();
            }
        });
    }

    /// Routes a frame to its read channel on the delegate queue. The lookup
    /// happens there too, so a channel deregistered before the frame is
    /// delivered never sees it.
    pub(crate) fn route(self: &Arc<Self>, host: Option<IpAddr>, frame: Frame) {
        let shared = Arc::clone(self);
        self.delegate.dispatch(move || {
            match shared.registry.read_sink(host, frame.channel) {
                Some(sink) => sink.receive(&frame),
                None => trace!(
                    conn = %shared.id,
                    channel = %frame.channel,
                    ?host,
                    "frame for unregistered channel dropped"
                ),
            }
        });
    }
}
