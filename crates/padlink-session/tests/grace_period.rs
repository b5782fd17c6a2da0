//! Grace-period reconciliation driven the way an owner task drives it:
//! timers are slept on in spawned tasks and fed back through a channel.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use padlink_protocol::{ControllerConnectedMessage, GamepadLayout};
use padlink_session::{
    ConnectionStatus, GraceTimer, PeerManager, SessionConfig, next_free_index,
};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

#[derive(Debug, PartialEq)]
enum Event {
    Connected(u16),
    Removed(u16),
}

/// Owner-side glue: applies a step to the manager and records events with
/// the time they happened.
struct Harness {
    manager: PeerManager<()>,
    timers_tx: mpsc::UnboundedSender<GraceTimer>,
    timers_rx: mpsc::UnboundedReceiver<GraceTimer>,
    events: Vec<(Duration, Event)>,
    start: Instant,
}

const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

impl Harness {
    fn new() -> Self {
        let (timers_tx, timers_rx) = mpsc::unbounded_channel();
        Self {
            manager: PeerManager::new(SessionConfig::default()),
            timers_tx,
            timers_rx,
            events: Vec::new(),
            start: Instant::now(),
        }
    }

    fn connect(&mut self) {
        self.manager.peer_connected(PEER, ());
    }

    fn announce(&mut self, remote_index: u16) {
        let index = next_free_index(self.manager.indexes());
        let message = ControllerConnectedMessage::new(remote_index, GamepadLayout::Extended, None);
        if let Some(controller) = self.manager.controller_connected(PEER, &message, index) {
            self.events.push((self.start.elapsed(), Event::Connected(controller.index())));
        }
    }

    fn disconnect(&mut self) {
        if let Some(timer) = self.manager.peer_disconnected(PEER) {
            let tx = self.timers_tx.clone();
            tokio::spawn(async move {
                timer.wait().await;
                let _ = tx.send(timer);
            });
        }
    }

    /// Runs until `until` has passed, firing every timer due before then.
    async fn run_until(&mut self, until: Duration) {
        let deadline = self.start + until;
        loop {
            tokio::select! {
                Some(timer) = self.timers_rx.recv() => {
                    for controller in self.manager.grace_elapsed(&timer).removed {
                        self.events.push((self.start.elapsed(), Event::Removed(controller.index())));
                    }
                }
                _ = time::sleep_until(deadline) => break,
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_before_grace_emits_no_removal() {
    let mut h = Harness::new();
    h.connect();
    h.announce(0);

    h.disconnect();
    h.run_until(Duration::from_secs(5)).await;
    h.connect();
    h.announce(0);
    h.run_until(Duration::from_secs(60)).await;

    assert_eq!(h.events, vec![(Duration::ZERO, Event::Connected(0))]);
    let controller = h.manager.controller(PEER, 0).unwrap();
    assert_eq!(controller.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_no_reconnect_emits_one_removal_at_twelve_seconds() {
    let mut h = Harness::new();
    h.connect();
    h.announce(0);

    h.disconnect();
    h.run_until(Duration::from_secs(60)).await;

    assert_eq!(
        h.events,
        vec![
            (Duration::ZERO, Event::Connected(0)),
            (Duration::from_secs(12), Event::Removed(0)),
        ]
    );
    assert_eq!(h.manager.peer_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_flap_restarts_grace_period() {
    let mut h = Harness::new();
    h.connect();
    h.announce(0);
    h.announce(1);

    h.disconnect();
    h.run_until(Duration::from_secs(4)).await;
    h.connect();
    h.announce(1);
    h.run_until(Duration::from_secs(8)).await;
    h.disconnect();
    h.run_until(Duration::from_secs(60)).await;

    // The second disconnect supersedes the first timer, so controller 0
    // outlives 12 s and both controllers go at 8 + 12.
    assert_eq!(
        h.events,
        vec![
            (Duration::ZERO, Event::Connected(0)),
            (Duration::ZERO, Event::Connected(1)),
            (Duration::from_secs(20), Event::Removed(0)),
            (Duration::from_secs(20), Event::Removed(1)),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_removed_index_is_reused() {
    let mut h = Harness::new();
    h.connect();
    h.announce(0);
    h.disconnect();
    h.run_until(Duration::from_secs(13)).await;

    h.connect();
    h.announce(5);
    assert_eq!(h.events.last(), Some(&(Duration::from_secs(13), Event::Connected(0))));
}
