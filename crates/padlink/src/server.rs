//! `ControllerBrowser` builder and accept loop.
//!
//! The browser is the consuming side: it publishes a service, accepts
//! client links and turns what they announce into [`Controller`]s. Local
//! input devices attach to the same controller space through
//! [`attach_device`](ControllerBrowser::attach_device).

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use padlink_exec::{Queue, QueueExt, SerialQueue};
use padlink_protocol::{ControllerConnectedMessage, GamepadLayout, InputMessage, ServiceTxtRecord};
use padlink_session::{
    Controller, ControllerType, DeviceId, DeviceRegistry, Discovery, GraceTimer, PeerManager,
    SessionConfig, SessionError, next_free_index, service_type,
};
use padlink_transport::{Connection, ConnectionId, TcpTransport, Transport, TransportError, UdpConnection};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handler::{PeerChannels, handle_connection};
use crate::{BrowserConfig, PadlinkError, lock};

/// What a browser reports to the application.
#[derive(Debug)]
pub enum BrowserEvent {
    /// A remote or local controller appeared.
    ControllerConnected(Controller),
    /// A controller went away for good: a remote one outlived its grace
    /// period, or a local device was detached.
    ControllerDisconnected(Controller),
    /// A socket failed.
    Error(PadlinkError),
}

/// State shared by the accept loop, every connection's callbacks and the
/// browser handle.
///
/// Callbacks only hold a `Weak` to it, so dropping the browser tears
/// everything down.
pub(crate) struct BrowserState {
    pub(crate) delegate: Arc<dyn Queue>,
    pub(crate) input: UdpConnection,
    peers: Mutex<PeerManager<PeerChannels>>,
    devices: DeviceRegistry,
    session: SessionConfig,
    events: mpsc::UnboundedSender<BrowserEvent>,
    shutdown: CancellationToken,
}

impl BrowserState {
    pub(crate) fn peers(&self) -> MutexGuard<'_, PeerManager<PeerChannels>> {
        lock(&self.peers)
    }

    pub(crate) fn emit(&self, event: BrowserEvent) {
        if self.events.send(event).is_err() {
            debug!("browser event receiver dropped");
        }
    }

    /// Next free global index across remote and local controllers.
    ///
    /// Takes the peers guard so callers allocate and insert under one lock.
    fn free_index(&self, peers: &PeerManager<PeerChannels>) -> u16 {
        next_free_index(peers.indexes().chain(self.devices.indexes()))
    }

    /// A peer announced one of its controllers.
    pub(crate) fn controller_announced(&self, host: IpAddr, message: &ControllerConnectedMessage) {
        let controller = {
            let mut peers = self.peers();
            let index = self.free_index(&peers);
            peers.controller_connected(host, message, index)
        };
        if let Some(controller) = controller {
            self.emit(BrowserEvent::ControllerConnected(controller));
        }
    }

    /// A peer's TCP link closed. Ignored if the peer has since moved to a
    /// newer link.
    pub(crate) fn link_lost(self: &Arc<Self>, host: IpAddr, conn: ConnectionId) {
        let timer = {
            let mut peers = self.peers();
            let current = peers
                .peer(host)
                .is_some_and(|peer| peer.channels().conn.id() == conn);
            if !current {
                debug!(%host, %conn, "superseded link closed");
                return;
            }
            peers.peer_disconnected(host)
        };
        if let Some(timer) = timer {
            self.schedule(timer);
        }
    }

    fn schedule(self: &Arc<Self>, timer: GraceTimer) {
        let state = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = timer.wait() => {}
            }
            if let Some(state) = state.upgrade() {
                let delegate = Arc::clone(&state.delegate);
                delegate.dispatch(move || state.grace_elapsed(&timer));
            }
        });
    }

    fn grace_elapsed(&self, timer: &GraceTimer) {
        let expired = self.peers().grace_elapsed(timer);
        if let Some(channels) = expired.channels {
            channels.close(&self.input);
        }
        for controller in expired.removed {
            self.emit(BrowserEvent::ControllerDisconnected(controller));
        }
    }
}

/// Builder for configuring and starting a [`ControllerBrowser`].
///
/// # Example
///
/// ```rust,no_run
/// use padlink::prelude::*;
///
/// # async fn run() -> Result<(), PadlinkError> {
/// let (browser, mut events) = ControllerBrowser::builder()
///     .name("Living Room")
///     .start(MemoryDiscovery::new())
///     .await?;
/// while let Some(event) = events.recv().await {
///     println!("{event:?}");
/// }
/// # browser.stop();
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ControllerBrowserBuilder {
    config: BrowserConfig,
}

impl ControllerBrowserBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: BrowserConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the published service name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn service_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.config.service_identifier = identifier.into();
        self
    }

    /// Sets the host both sockets bind to.
    pub fn bind_host(mut self, host: impl Into<IpAddr>) -> Self {
        self.config.bind_host = host.into();
        self
    }

    /// Sets the session configuration.
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.config.session = config;
        self
    }

    /// Binds the sockets, publishes the service and starts accepting.
    ///
    /// # Errors
    /// A bind failure, or the discovery collaborator refusing to publish.
    pub async fn start<D: Discovery>(
        self,
        discovery: D,
    ) -> Result<(ControllerBrowser, mpsc::UnboundedReceiver<BrowserEvent>), PadlinkError> {
        let config = self.config;
        let delegate: Arc<dyn Queue> = Arc::new(SerialQueue::new("padlink.browser"));

        let transport = TcpTransport::bind(SocketAddr::new(config.bind_host, 0))
            .await?
            .with_delegate(Arc::clone(&delegate));
        let local_addr = transport.local_addr()?;

        let input = UdpConnection::with_delegate(Arc::clone(&delegate));
        let input_addr = input.bind(SocketAddr::new(config.bind_host, 0)).await?;

        let (events, receiver) = mpsc::unbounded_channel();
        let state = Arc::new(BrowserState {
            delegate: Arc::clone(&delegate),
            input: input.clone(),
            peers: Mutex::new(PeerManager::new(config.session).with_delivery(Arc::clone(&delegate))),
            devices: DeviceRegistry::new(),
            session: config.session,
            events,
            shutdown: CancellationToken::new(),
        });

        {
            let weak = Arc::downgrade(&state);
            input.on_error(move |e| {
                warn!(error = %e, "input socket failed");
                if let Some(state) = weak.upgrade() {
                    state.emit(BrowserEvent::Error(e.into()));
                }
            });
        }

        tokio::spawn(accept_loop(transport, Arc::downgrade(&state)));

        let txt = ServiceTxtRecord::new(input_addr.port()).encode();
        let published = discovery.publish(
            &service_type(&config.service_identifier),
            &config.name,
            local_addr.port(),
            txt,
        );
        if let Err(e) = published {
            state.shutdown.cancel();
            input.disconnect();
            return Err(e.into());
        }

        info!(
            name = %config.name,
            addr = %local_addr,
            input = %input_addr,
            "controller browser started"
        );
        let browser = ControllerBrowser {
            state,
            unpublish: Box::new(move || discovery.stop()),
            local_addr,
            input_addr,
        };
        Ok((browser, receiver))
    }
}

/// Accepts client links until shutdown. Each link is wired up on the
/// delegate queue, in order with every other callback.
async fn accept_loop(mut transport: TcpTransport, state: Weak<BrowserState>) {
    let Some(shutdown) = state.upgrade().map(|s| s.shutdown.clone()) else {
        return;
    };
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = transport.accept() => accepted,
        };
        match accepted {
            Ok(conn) => {
                let Some(state) = state.upgrade() else {
                    conn.disconnect();
                    break;
                };
                let delegate = Arc::clone(&state.delegate);
                delegate.dispatch(move || handle_connection(conn, &state));
            }
            Err(TransportError::Shutdown) => break,
            Err(e) => {
                warn!(error = %e, "accept failed");
                if let Some(state) = state.upgrade() {
                    state.emit(BrowserEvent::Error(e.into()));
                }
            }
        }
    }
    let _ = transport.shutdown().await;
    debug!("accept loop stopped");
}

/// A running controller browser.
///
/// Dropping it has the same effect as [`stop`](Self::stop).
pub struct ControllerBrowser {
    state: Arc<BrowserState>,
    /// Withdraws the published service.
    unpublish: Box<dyn Fn() + Send + Sync>,
    local_addr: SocketAddr,
    input_addr: SocketAddr,
}

impl ControllerBrowser {
    /// Creates a new builder.
    pub fn builder() -> ControllerBrowserBuilder {
        ControllerBrowserBuilder::new()
    }

    /// Address of the TCP acceptor.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address of the UDP socket gamepad state arrives on.
    pub fn input_addr(&self) -> SocketAddr {
        self.input_addr
    }

    /// Every remote and local controller, ordered by index.
    pub fn controllers(&self) -> Vec<Controller> {
        let mut controllers = self.state.peers().controllers();
        controllers.extend(self.state.devices.controllers());
        controllers.sort_by_key(Controller::index);
        controllers
    }

    pub fn peer_count(&self) -> usize {
        self.state.peers().peer_count()
    }

    /// Creates a controller for a local input device and reports it.
    ///
    /// Button and joystick input to the controller is throttled with the
    /// session's throttle config.
    ///
    /// # Errors
    /// [`SessionError::DeviceInUse`] if `id` is already attached.
    pub fn attach_device(
        &self,
        id: DeviceId,
        controller_type: ControllerType,
        layout: GamepadLayout,
        name: Option<String>,
    ) -> Result<Controller, PadlinkError> {
        let controller = {
            let peers = self.state.peers();
            if self.state.devices.get(id).is_some() {
                return Err(SessionError::DeviceInUse(id).into());
            }
            let controller = Controller::builder(self.state.free_index(&peers), controller_type)
                .layout(layout)
                .name(name)
                .throttle(self.state.session.throttle)
                .delivery(Arc::clone(&self.state.delegate))
                .spawn();
            self.state.devices.attach(id, controller.clone())?;
            controller
        };
        info!(device = %id, index = controller.index(), "device attached");
        self.state
            .emit(BrowserEvent::ControllerConnected(controller.clone()));
        Ok(controller)
    }

    /// Detaches a local device and reports its controller as gone.
    pub fn detach_device(&self, id: DeviceId) -> Option<Controller> {
        let controller = self.state.devices.detach(id)?;
        info!(device = %id, index = controller.index(), "device detached");
        self.state
            .emit(BrowserEvent::ControllerDisconnected(controller.clone()));
        Some(controller)
    }

    /// Routes normalized device input to the device's controller.
    ///
    /// # Errors
    /// [`SessionError::UnknownDevice`] if nothing is attached under `id`.
    pub fn device_input(&self, id: DeviceId, message: impl Into<InputMessage>) -> Result<(), PadlinkError> {
        Ok(self.state.devices.dispatch(id, message)?)
    }

    /// Unpublishes the service, stops accepting and drops every peer.
    /// Their controllers are reported as disconnected. Idempotent.
    pub fn stop(&self) {
        if self.state.shutdown.is_cancelled() {
            return;
        }
        self.state.shutdown.cancel();
        (self.unpublish)();

        let peers = self.state.peers().clear();
        for (controllers, channels) in peers {
            channels.close(&self.state.input);
            for controller in controllers {
                self.state
                    .emit(BrowserEvent::ControllerDisconnected(controller));
            }
        }
        self.state.input.disconnect();
        info!(addr = %self.local_addr, "controller browser stopped");
    }
}

impl Drop for ControllerBrowser {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ControllerBrowser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerBrowser")
            .field("local_addr", &self.local_addr)
            .field("input_addr", &self.input_addr)
            .finish()
    }
}
