//! Per-connection wiring on the browser side.
//!
//! Each accepted link gets:
//!   1. Channel 1 (TCP): controller announcements
//!   2. Channel 2 (TCP): name updates
//!   3. Channel 3 (shared UDP socket, filtered by the link's host): gamepad
//!      state
//!
//! Handlers run on the browser's delegate queue and hold only a `Weak` to
//! the browser state.

use std::sync::Arc;

use padlink_protocol::{
    ChannelId, ControllerConnectedMessage, ControllerNameMessage, GamepadMessage, RemoteMessage,
};
use padlink_transport::{Connection, ReadChannel, TcpConnection, UdpConnection};
use tracing::{debug, info, warn};

use crate::server::{BrowserEvent, BrowserState};

/// The channels the browser holds for one peer.
pub(crate) struct PeerChannels {
    pub(crate) conn: TcpConnection,
    connect: ReadChannel<ControllerConnectedMessage>,
    name: ReadChannel<RemoteMessage<ControllerNameMessage>>,
    gamepad: ReadChannel<RemoteMessage<GamepadMessage>>,
}

impl PeerChannels {
    /// Deregisters every channel and closes the link.
    pub(crate) fn close(&self, input: &UdpConnection) {
        input.deregister_read_channel(&self.gamepad);
        self.conn.deregister_read_channel(&self.connect);
        self.conn.deregister_read_channel(&self.name);
        self.conn.disconnect();
    }
}

/// Wires up an accepted connection and starts reading from it.
pub(crate) fn handle_connection(conn: TcpConnection, state: &Arc<BrowserState>) {
    let Some(peer) = conn.peer_addr() else {
        conn.disconnect();
        return;
    };
    let host = peer.ip();
    let conn_id = conn.id();

    let connect = conn.register_read_channel::<ControllerConnectedMessage>(ChannelId::CONTROLLER_CONNECTED, None);
    let name = conn.register_read_channel::<RemoteMessage<ControllerNameMessage>>(ChannelId::CONTROLLER_NAME, None);
    let gamepad = state
        .input
        .register_read_channel::<RemoteMessage<GamepadMessage>>(ChannelId::GAMEPAD, Some(host));
    let (Some(connect), Some(name), Some(gamepad)) = (connect, name, gamepad) else {
        // The link closed before it could be wired.
        debug!(conn = %conn_id, %peer, "link closed during setup");
        conn.disconnect();
        return;
    };

    let weak = Arc::downgrade(state);
    connect.on_receive(move |message: ControllerConnectedMessage| {
        if let Some(state) = weak.upgrade() {
            state.controller_announced(host, &message);
        }
    });

    let weak = Arc::downgrade(state);
    name.on_receive(move |message: RemoteMessage<ControllerNameMessage>| {
        if let Some(state) = weak.upgrade() {
            let index = message.controller_index;
            if !state.peers().rename(host, index, message.message.into_name()) {
                debug!(%host, remote_index = index, "name for unknown controller");
            }
        }
    });

    let weak = Arc::downgrade(state);
    gamepad.on_receive(move |message: RemoteMessage<GamepadMessage>| {
        if let Some(state) = weak.upgrade() {
            state.peers().route_gamepad(host, message);
        }
    });

    let weak = Arc::downgrade(state);
    conn.on_disconnect(move || {
        if let Some(state) = weak.upgrade() {
            state.link_lost(host, conn_id);
        }
    });

    let weak = Arc::downgrade(state);
    conn.on_error(move |e| {
        warn!(conn = %conn_id, %host, error = %e, "peer link failed");
        if let Some(state) = weak.upgrade() {
            state.emit(BrowserEvent::Error(e.into()));
        }
    });

    let channels = PeerChannels {
        conn: conn.clone(),
        connect,
        name,
        gamepad,
    };
    let replaced = state.peers().peer_connected(host, channels);
    if let Some(old) = replaced {
        // The UDP read key is per host, so the new registration already
        // took over; closing the old set only drops its TCP side.
        old.close(&state.input);
    }

    info!(conn = %conn_id, %peer, "peer link ready");
    conn.begin_receiving();
}
