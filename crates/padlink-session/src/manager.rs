//! The peer manager: remote controllers grouped by the host that owns them.
//!
//! A peer's link can flap, especially over Wi-Fi. Instead of reporting every
//! drop as a lost controller, the manager parks the peer's controllers as
//! [`ConnectionStatus::Disconnected`] and hands back a [`GraceTimer`]. If the
//! peer announces a controller again before the timer fires, that controller
//! simply flips back to `Connected`. When the timer fires, whatever is still
//! disconnected is removed, and a peer with nothing left is dropped along
//! with its channels.
//!
//! ```text
//!   announce ──→ Connected ──(link lost)──→ Disconnected ──(grace elapsed)──→ Removed
//!                   ↑                            │
//!                   └──────(announced again)─────┘
//! ```
//!
//! `PeerManager` is a plain state machine. It owns no tasks and no sockets;
//! the owner runs it from one task, sleeps on the timers it returns and
//! feeds them back through [`grace_elapsed`](PeerManager::grace_elapsed).

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use padlink_exec::Queue;
use padlink_protocol::{ControllerConnectedMessage, GamepadMessage, RemoteMessage};
use tokio::time::{self, Instant};
use tracing::{debug, info, trace};

use crate::{ConnectionStatus, Controller, ControllerType, SessionConfig};

/// One remote host and the controllers it announced.
///
/// `C` is whatever the owner keeps per peer, typically its channel handles.
#[derive(Debug)]
pub struct RemotePeer<C> {
    /// Keyed by the index the peer uses on the wire.
    controllers: BTreeMap<u16, Controller>,
    channels: C,
    connected: bool,
    /// Bumped on every disconnect so older timers can tell they are stale.
    generation: u64,
}

impl<C> RemotePeer<C> {
    pub fn controllers(&self) -> impl Iterator<Item = (u16, &Controller)> {
        self.controllers.iter().map(|(i, c)| (*i, c))
    }

    pub fn channels(&self) -> &C {
        &self.channels
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

/// A pending grace-period expiry for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraceTimer {
    pub host: IpAddr,
    pub generation: u64,
    pub deadline: Instant,
}

impl GraceTimer {
    /// Sleeps until the deadline.
    pub async fn wait(&self) {
        time::sleep_until(self.deadline).await;
    }
}

/// What a fired grace timer removed.
#[derive(Debug)]
pub struct Expired<C> {
    /// Controllers that never came back, to report as removed.
    pub removed: Vec<Controller>,
    /// The peer's channels, if the peer itself was dropped. The owner
    /// deregisters them.
    pub channels: Option<C>,
}

impl<C> Default for Expired<C> {
    fn default() -> Self {
        Self {
            removed: Vec::new(),
            channels: None,
        }
    }
}

/// Tracks every remote peer and its controllers.
pub struct PeerManager<C> {
    peers: HashMap<IpAddr, RemotePeer<C>>,
    config: SessionConfig,
    delivery: Option<Arc<dyn Queue>>,
}

impl<C> PeerManager<C> {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            peers: HashMap::new(),
            config,
            delivery: None,
        }
    }

    /// Makes remote controllers deliver observer callbacks on `queue`.
    pub fn with_delivery(mut self, queue: Arc<dyn Queue>) -> Self {
        self.delivery = Some(queue);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Records a live link from `host`.
    ///
    /// A host seen before keeps its controllers; its old channels are
    /// swapped out and returned so the owner can deregister them. Pending
    /// grace timers keep running, so controllers the peer does not announce
    /// again are still removed on time.
    pub fn peer_connected(&mut self, host: IpAddr, channels: C) -> Option<C> {
        if let Some(peer) = self.peers.get_mut(&host) {
            peer.connected = true;
            info!(%host, controllers = peer.controllers.len(), "peer reconnected");
            return Some(std::mem::replace(&mut peer.channels, channels));
        }
        info!(%host, "peer connected");
        self.peers.insert(
            host,
            RemotePeer {
                controllers: BTreeMap::new(),
                channels,
                connected: true,
                generation: 0,
            },
        );
        None
    }

    /// Handles a connect frame from `host`.
    ///
    /// An index the peer has not used yet gets a new remote controller with
    /// global index `global_index`, which is returned so the owner can
    /// report it. A known index flips back to `Connected` and returns
    /// `None`, as does a frame from an unknown host.
    pub fn controller_connected(
        &mut self,
        host: IpAddr,
        message: &ControllerConnectedMessage,
        global_index: u16,
    ) -> Option<Controller> {
        let Some(peer) = self.peers.get_mut(&host) else {
            trace!(%host, index = message.index, "connect frame from unknown peer");
            return None;
        };

        if let Some(existing) = peer.controllers.get(&message.index) {
            if existing.status() != ConnectionStatus::Connected {
                debug!(%host, index = message.index, "controller back within grace period");
                existing.set_status(ConnectionStatus::Connected);
            }
            return None;
        }

        let mut builder = Controller::builder(global_index, ControllerType::Remote)
            .layout(message.layout)
            .name(message.name().map(str::to_owned));
        if let Some(queue) = &self.delivery {
            builder = builder.delivery(Arc::clone(queue));
        }
        let controller = builder.spawn();
        peer.controllers.insert(message.index, controller.clone());
        info!(%host, remote_index = message.index, index = global_index, "remote controller connected");
        Some(controller)
    }

    /// Applies a name update from `host`. Returns whether a controller
    /// matched.
    pub fn rename(&mut self, host: IpAddr, remote_index: u16, name: Option<String>) -> bool {
        match self.controller(host, remote_index) {
            Some(controller) => {
                controller.set_name(name);
                true
            }
            None => false,
        }
    }

    /// Forwards a gamepad state frame from `host` to its controller's input
    /// actor. Frames for unknown controllers are dropped.
    pub fn route_gamepad(&self, host: IpAddr, message: RemoteMessage<GamepadMessage>) {
        match self.controller(host, message.controller_index) {
            Some(controller) => {
                if let Err(e) = controller.send(message.message) {
                    trace!(%host, error = %e, "gamepad frame for stopped controller");
                }
            }
            None => trace!(%host, remote_index = message.controller_index, "gamepad frame for unknown controller"),
        }
    }

    /// Handles a lost link from `host`: every controller it owns goes
    /// `Disconnected` and a grace timer starts. Returns `None` for an
    /// unknown host.
    pub fn peer_disconnected(&mut self, host: IpAddr) -> Option<GraceTimer> {
        let peer = self.peers.get_mut(&host)?;
        peer.connected = false;
        peer.generation += 1;
        for controller in peer.controllers.values() {
            controller.set_status(ConnectionStatus::Disconnected);
        }
        info!(
            %host,
            controllers = peer.controllers.len(),
            grace_secs = self.config.grace_period_secs,
            "peer disconnected, grace period started"
        );
        Some(GraceTimer {
            host,
            generation: peer.generation,
            deadline: Instant::now() + self.config.grace_period(),
        })
    }

    /// Handles a fired grace timer.
    ///
    /// A timer superseded by a later disconnect does nothing. Otherwise
    /// every controller still disconnected is removed, and a peer left
    /// with no controllers and no live link is dropped.
    pub fn grace_elapsed(&mut self, timer: &GraceTimer) -> Expired<C> {
        let Some(peer) = self.peers.get_mut(&timer.host) else {
            return Expired::default();
        };
        if peer.generation != timer.generation {
            trace!(host = %timer.host, "stale grace timer ignored");
            return Expired::default();
        }

        let gone: Vec<u16> = peer
            .controllers
            .iter()
            .filter(|(_, c)| c.status() == ConnectionStatus::Disconnected)
            .map(|(index, _)| *index)
            .collect();
        let removed: Vec<Controller> = gone
            .iter()
            .filter_map(|index| peer.controllers.remove(index))
            .collect();
        for controller in &removed {
            info!(host = %timer.host, index = controller.index(), "remote controller removed");
        }

        let channels = if peer.controllers.is_empty() && !peer.connected {
            info!(host = %timer.host, "peer removed");
            self.peers.remove(&timer.host).map(|p| p.channels)
        } else {
            None
        };
        Expired { removed, channels }
    }

    /// The controller `host` calls `remote_index`.
    pub fn controller(&self, host: IpAddr, remote_index: u16) -> Option<&Controller> {
        self.peers.get(&host)?.controllers.get(&remote_index)
    }

    pub fn peer(&self, host: IpAddr) -> Option<&RemotePeer<C>> {
        self.peers.get(&host)
    }

    /// Every remote controller, in no particular order.
    pub fn controllers(&self) -> Vec<Controller> {
        self.peers
            .values()
            .flat_map(|p| p.controllers.values().cloned())
            .collect()
    }

    /// Global indexes in use by remote controllers.
    pub fn indexes(&self) -> impl Iterator<Item = u16> + '_ {
        self.peers
            .values()
            .flat_map(|p| p.controllers.values().map(Controller::index))
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Drops every peer, returning their controllers and channels.
    pub fn clear(&mut self) -> Vec<(Vec<Controller>, C)> {
        self.peers
            .drain()
            .map(|(_, peer)| (peer.controllers.into_values().collect(), peer.channels))
            .collect()
    }
}

// =========================================================================
// Tests
// =========================================================================
