//! The publishing side: finds browsers and streams local controllers to one.
//!
//! ```text
//! Controller ──observe──→ ThrottledBuffer ──ch 3 (UDP)──→ browser
//!            announce ───────────────────── ch 1 (TCP) ──→
//!            rename ──────────────────────── ch 2 (TCP) ──→
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use padlink_actor::Subscription;
use padlink_exec::{Queue, SerialQueue, ThrottledBuffer};
use padlink_protocol::{
    ChannelId, ControllerConnectedMessage, ControllerNameMessage, GamepadMessage, GamepadState,
    RemoteMessage, ServiceTxtRecord,
};
use padlink_session::{Controller, Discovery, DiscoveryEvent, ServiceInfo, service_type};
use padlink_transport::{
    Connection, ConnectionId, TcpConnection, TransportError, UdpConnection, WriteChannel,
};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ClientConfig, PadlinkError, lock};

/// Shortest wait between announcing a controller and sending its current
/// state over the unreliable channel.
const SNAPSHOT_DELAY: Duration = Duration::from_millis(20);

/// What a client reports to the application.
#[derive(Debug)]
pub enum ClientEvent {
    ServiceFound(ServiceInfo),
    ServiceLost(ServiceInfo),
    /// A link to the service is up and every controller was announced.
    Connected(ServiceInfo),
    /// The link to the service closed.
    Disconnected(ServiceInfo),
    /// A socket failed.
    Error(PadlinkError),
}

type GamepadChannel = WriteChannel<RemoteMessage<GamepadMessage>>;

/// The live link to one browser.
struct Link {
    service: ServiceInfo,
    conn: TcpConnection,
    input: UdpConnection,
    connect: WriteChannel<ControllerConnectedMessage>,
    name: WriteChannel<RemoteMessage<ControllerNameMessage>>,
}

impl Link {
    fn announce(&self, controller: &Controller) {
        let message =
            ControllerConnectedMessage::new(controller.index(), controller.layout(), controller.name());
        self.connect.send(&message);
    }

    fn close(&self) {
        self.conn.disconnect();
        self.input.disconnect();
    }
}

/// A controller being streamed. Its observer owns the throttled buffer.
struct Streamed {
    controller: Controller,
    subscription: Subscription,
}

struct ClientInner<D> {
    config: ClientConfig,
    discovery: D,
    delegate: Arc<dyn Queue>,
    events: mpsc::UnboundedSender<ClientEvent>,
    link: Mutex<Option<Link>>,
    /// Read by every controller's throttled buffer.
    gamepad: Arc<Mutex<Option<GamepadChannel>>>,
    controllers: Mutex<BTreeMap<u16, Streamed>>,
    search: Mutex<Option<CancellationToken>>,
}

impl<D> ClientInner<D> {
    fn emit(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            debug!(client = %self.config.name, "client event receiver dropped");
        }
    }

    /// Drops the link if it is still `conn`.
    fn link_lost(&self, conn: ConnectionId) {
        let link = {
            let mut link = lock(&self.link);
            if link.as_ref().is_none_or(|l| l.conn.id() != conn) {
                return;
            }
            link.take()
        };
        if let Some(link) = link {
            *lock(&self.gamepad) = None;
            link.input.disconnect();
            info!(client = %self.config.name, service = %link.service, "link lost");
            self.emit(ClientEvent::Disconnected(link.service));
        }
    }
}

/// Streams local controllers to a controller browser.
///
/// Cheap to clone; clones share the same link and controllers.
pub struct Client<D: Discovery> {
    inner: Arc<ClientInner<D>>,
}

impl<D: Discovery> Clone for Client<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Discovery> Client<D> {
    /// Creates a client. Must be called inside a Tokio runtime.
    pub fn new(config: ClientConfig, discovery: D) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            config,
            discovery,
            delegate: Arc::new(SerialQueue::new("padlink.client")),
            events,
            link: Mutex::new(None),
            gamepad: Arc::new(Mutex::new(None)),
            controllers: Mutex::new(BTreeMap::new()),
            search: Mutex::new(None),
        });
        (Self { inner }, receiver)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Starts searching. Found and lost services arrive as events.
    /// No-op while a search is running.
    ///
    /// # Errors
    /// The discovery collaborator refusing to search.
    pub fn start(&self) -> Result<(), PadlinkError> {
        let mut search = lock(&self.inner.search);
        if search.is_some() {
            return Ok(());
        }
        let service_type = service_type(&self.inner.config.service_identifier);
        let mut found = self.inner.discovery.search(&service_type)?;

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let events = self.inner.events.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancelled.cancelled() => break,
                    event = found.recv() => event,
                };
                let event = match event {
                    Some(DiscoveryEvent::ServiceFound(service)) => ClientEvent::ServiceFound(service),
                    Some(DiscoveryEvent::ServiceLost(service)) => ClientEvent::ServiceLost(service),
                    None => break,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            debug!("search stopped");
        });

        info!(client = %self.inner.config.name, %service_type, "search started");
        *search = Some(token);
        Ok(())
    }

    /// Ends the search and drops the link.
    pub fn stop(&self) {
        if let Some(token) = lock(&self.inner.search).take() {
            token.cancel();
        }
        self.inner.discovery.stop();
        self.disconnect();
    }

    /// Resolves `service`, links to it and announces every controller.
    /// An existing link is dropped first.
    ///
    /// # Errors
    /// Resolution failure, a service without addresses, an unreadable TXT
    /// record, or a socket that fails to connect.
    pub async fn connect(&self, service: &ServiceInfo) -> Result<(), PadlinkError> {
        let resolved = self.inner.discovery.resolve(service).await?;
        let addr = *resolved
            .addresses
            .first()
            .ok_or_else(|| PadlinkError::NoAddress(service.to_string()))?;
        let txt = ServiceTxtRecord::decode(&resolved.txt)?;
        let input_addr = SocketAddr::new(addr.ip(), txt.input_port);

        self.disconnect();

        let conn = TcpConnection::with_delegate(Arc::clone(&self.inner.delegate));
        conn.connect(addr).await?;
        let input = UdpConnection::with_delegate(Arc::clone(&self.inner.delegate));
        if let Err(e) = input.connect(input_addr).await {
            conn.disconnect();
            return Err(e.into());
        }

        let connect = conn.register_write_channel(ChannelId::CONTROLLER_CONNECTED, None);
        let name = conn.register_write_channel(ChannelId::CONTROLLER_NAME, None);
        let gamepad = input.register_write_channel(ChannelId::GAMEPAD, None);
        let (Some(connect), Some(name), Some(gamepad)) = (connect, name, gamepad) else {
            conn.disconnect();
            input.disconnect();
            return Err(TransportError::ConnectionClosed(conn.id().to_string()).into());
        };

        self.watch(&conn, &input);
        let link = Link {
            service: service.clone(),
            conn,
            input,
            connect,
            name,
        };
        *lock(&self.inner.gamepad) = Some(gamepad);
        for streamed in lock(&self.inner.controllers).values() {
            link.announce(&streamed.controller);
            self.send_snapshot(&streamed.controller);
        }
        *lock(&self.inner.link) = Some(link);

        info!(client = %self.inner.config.name, %service, %addr, input = %input_addr, "connected");
        self.inner.emit(ClientEvent::Connected(service.clone()));
        Ok(())
    }

    fn watch(&self, conn: &TcpConnection, input: &UdpConnection) {
        let conn_id = conn.id();
        let weak = Arc::downgrade(&self.inner);
        conn.on_disconnect(move || {
            if let Some(inner) = weak.upgrade() {
                inner.link_lost(conn_id);
            }
        });

        let weak = Arc::downgrade(&self.inner);
        conn.on_error(move |e| {
            warn!(conn = %conn_id, error = %e, "link failed");
            if let Some(inner) = weak.upgrade() {
                inner.emit(ClientEvent::Error(e.into()));
            }
        });

        let weak = Arc::downgrade(&self.inner);
        input.on_error(move |e| {
            warn!(error = %e, "input stream failed");
            if let Some(inner) = weak.upgrade() {
                inner.emit(ClientEvent::Error(e.into()));
            }
        });
    }

    /// Sends the current state of a just-announced controller, so the
    /// browser does not show a blank state until the next input. Waits one
    /// throttle window first so the datagram trails the announcement; a
    /// snapshot that still arrives first is dropped by the browser.
    fn send_snapshot(&self, controller: &Controller) {
        let controller = controller.clone();
        let slot = Arc::clone(&self.inner.gamepad);
        let delay = self.inner.config.throttle.interval().max(SNAPSHOT_DELAY);
        tokio::spawn(async move {
            time::sleep(delay).await;
            let Ok(state) = controller.state().await else {
                return;
            };
            if let Some(channel) = lock(&slot).as_ref() {
                channel.send(&RemoteMessage::new(controller.index(), GamepadMessage::new(state)));
            }
        });
    }

    /// Drops the link, if any, and reports it.
    pub fn disconnect(&self) {
        let link = lock(&self.inner.link).take();
        let Some(link) = link else {
            return;
        };
        *lock(&self.inner.gamepad) = None;
        link.close();
        info!(client = %self.inner.config.name, service = %link.service, "disconnected");
        self.inner.emit(ClientEvent::Disconnected(link.service));
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.link)
            .as_ref()
            .is_some_and(|link| link.conn.is_connected())
    }

    /// Starts streaming `controller`, replacing any controller with the
    /// same index. Announced right away if a link is up.
    pub fn add_controller(&self, controller: Controller) {
        let index = controller.index();
        let slot = Arc::clone(&self.inner.gamepad);
        let buffer = ThrottledBuffer::from_config(self.inner.config.throttle, move |state: GamepadState| {
            if let Some(channel) = lock(&slot).as_ref() {
                channel.send(&RemoteMessage::new(index, GamepadMessage::new(state)));
            }
        });
        let subscription = controller.observe(move |state: &GamepadState| buffer.insert(*state));

        if let Some(link) = lock(&self.inner.link).as_ref() {
            link.announce(&controller);
            self.send_snapshot(&controller);
        }
        debug!(client = %self.inner.config.name, index, "controller added");

        let previous = lock(&self.inner.controllers).insert(
            index,
            Streamed {
                controller,
                subscription,
            },
        );
        if let Some(previous) = previous {
            previous.subscription.unsubscribe();
        }
    }

    /// Stops streaming the controller with `index`.
    pub fn remove_controller(&self, index: u16) -> Option<Controller> {
        let streamed = lock(&self.inner.controllers).remove(&index)?;
        streamed.subscription.unsubscribe();
        debug!(client = %self.inner.config.name, index, "controller removed");
        Some(streamed.controller)
    }

    /// Renames a controller locally and on the linked browser. Returns
    /// whether a controller with `index` is being streamed.
    pub fn rename_controller(&self, index: u16, name: Option<String>) -> bool {
        let Some(controller) = lock(&self.inner.controllers)
            .get(&index)
            .map(|s| s.controller.clone())
        else {
            return false;
        };
        controller.set_name(name.clone());
        if let Some(link) = lock(&self.inner.link).as_ref() {
            link.name
                .send(&RemoteMessage::new(index, ControllerNameMessage::new(name)));
        }
        true
    }

    /// Streamed controllers, ordered by index.
    pub fn controllers(&self) -> Vec<Controller> {
        lock(&self.inner.controllers)
            .values()
            .map(|s| s.controller.clone())
            .collect()
    }
}

impl<D: Discovery> std::fmt::Debug for Client<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.inner.config.name)
            .field("connected", &self.is_connected())
            .finish()
    }
}
