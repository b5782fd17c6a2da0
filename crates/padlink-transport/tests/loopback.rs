//! Loopback tests for the TCP and UDP connections.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use padlink_protocol::{
    ChannelId, ControllerConnectedMessage, GamepadLayout, GamepadMessage, GamepadState,
    RemoteMessage,
};
use padlink_transport::{
    Connection, TcpConnection, TcpTransport, Transport, TransportError, UdpConnection,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

// =========================================================================
// Helpers
// =========================================================================

const WAIT: Duration = Duration::from_secs(2);

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// Binds a transport and returns `(transport, client, accepted)`.
async fn tcp_pair() -> (TcpTransport, TcpConnection, TcpConnection) {
    let mut transport = TcpTransport::bind(loopback(0)).await.unwrap();
    let addr = transport.local_addr().unwrap();

    let client = TcpConnection::new();
    let (connected, accepted) = tokio::join!(client.connect(addr), transport.accept());
    connected.unwrap();
    (transport, client, accepted.unwrap())
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("channel closed")
}

fn gamepad(index: u16, button_a: f32) -> RemoteMessage<GamepadMessage> {
    let mut state = GamepadState::new(GamepadLayout::Micro);
    state.button_a = button_a;
    RemoteMessage::new(index, GamepadMessage::new(state))
}

// =========================================================================
// TCP
// =========================================================================

#[tokio::test]
async fn test_tcp_frames_arrive_in_order() {
    let (_transport, client, server) = tcp_pair().await;

    let inbound = server
        .register_read_channel::<ControllerConnectedMessage>(ChannelId::CONTROLLER_CONNECTED, None)
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    inbound.on_receive(move |msg| {
        let _ = tx.send(msg);
    });
    server.begin_receiving();

    let outbound = client
        .register_write_channel::<ControllerConnectedMessage>(ChannelId::CONTROLLER_CONNECTED, None)
        .unwrap();
    for index in 0..50 {
        outbound.send(&ControllerConnectedMessage::new(index, GamepadLayout::Regular, None));
    }

    for index in 0..50 {
        assert_eq!(recv(&mut rx).await.index, index);
    }
}

#[tokio::test]
async fn test_tcp_frames_on_unregistered_channel_are_dropped() {
    let (_transport, client, server) = tcp_pair().await;

    let inbound = server
        .register_read_channel::<ControllerConnectedMessage>(ChannelId::CONTROLLER_CONNECTED, None)
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    inbound.on_receive(move |msg| {
        let _ = tx.send(msg);
    });
    server.begin_receiving();

    let stray = client
        .register_write_channel::<RemoteMessage<GamepadMessage>>(ChannelId::GAMEPAD, None)
        .unwrap();
    let announce = client
        .register_write_channel::<ControllerConnectedMessage>(ChannelId::CONTROLLER_CONNECTED, None)
        .unwrap();
    stray.send(&gamepad(0, 1.0));
    announce.send(&ControllerConnectedMessage::new(9, GamepadLayout::Micro, None));

    assert_eq!(recv(&mut rx).await.index, 9);
}

#[tokio::test]
async fn test_tcp_registration_requires_connection() {
    let conn = TcpConnection::new();
    assert!(!conn.is_connected());
    assert!(
        conn.register_read_channel::<ControllerConnectedMessage>(ChannelId(1), None)
            .is_none()
    );
    assert!(
        conn.register_write_channel::<ControllerConnectedMessage>(ChannelId(1), None)
            .is_none()
    );
    assert!(matches!(
        conn.listen(0).await,
        Err(TransportError::Unsupported(_))
    ));
}

#[tokio::test]
async fn test_tcp_disconnect_notifies_both_sides_once() {
    let (_transport, client, server) = tcp_pair().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let server_tx = tx.clone();
    server.on_disconnect(move || {
        let _ = server_tx.send("server");
    });
    client.on_disconnect(move || {
        let _ = tx.send("client");
    });
    server.begin_receiving();

    client.disconnect();
    client.disconnect();

    let mut seen = vec![recv(&mut rx).await, recv(&mut rx).await];
    seen.sort_unstable();
    assert_eq!(seen, vec!["client", "server"]);
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    assert!(!client.is_connected());
    assert!(!server.is_connected());
}

#[tokio::test]
async fn test_tcp_frames_sent_before_disconnect_are_delivered() {
    let (_transport, client, server) = tcp_pair().await;

    let inbound = server
        .register_read_channel::<ControllerConnectedMessage>(ChannelId::CONTROLLER_CONNECTED, None)
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let frame_tx = tx.clone();
    inbound.on_receive(move |msg: ControllerConnectedMessage| {
        let _ = frame_tx.send(Some(msg.index));
    });
    server.on_disconnect(move || {
        let _ = tx.send(None);
    });
    server.begin_receiving();

    let outbound = client
        .register_write_channel::<ControllerConnectedMessage>(ChannelId::CONTROLLER_CONNECTED, None)
        .unwrap();
    for index in 0..20 {
        outbound.send(&ControllerConnectedMessage::new(index, GamepadLayout::Extended, None));
    }
    client.disconnect();

    for index in 0..20 {
        assert_eq!(recv(&mut rx).await, Some(index));
    }
    assert_eq!(recv(&mut rx).await, None);
}

#[tokio::test]
async fn test_tcp_connect_failure_is_returned() {
    // Grab a free port, then close the listener so nothing is there.
    let addr = {
        let transport = TcpTransport::bind(loopback(0)).await.unwrap();
        transport.local_addr().unwrap()
    };
    let conn = TcpConnection::new();
    assert!(matches!(
        conn.connect(addr).await,
        Err(TransportError::ConnectFailed(_))
    ));
}

#[tokio::test]
async fn test_tcp_transport_shutdown_stops_accept() {
    let mut transport = TcpTransport::bind(loopback(0)).await.unwrap();
    transport.shutdown().await.unwrap();
    assert!(matches!(
        transport.accept().await,
        Err(TransportError::Shutdown)
    ));
}

// =========================================================================
// UDP
// =========================================================================

#[tokio::test]
async fn test_udp_client_to_listener() {
    let listener = UdpConnection::new();
    let addr = listener.bind(loopback(0)).await.unwrap();

    let inbound = listener
        .register_read_channel::<RemoteMessage<GamepadMessage>>(
            ChannelId::GAMEPAD,
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        )
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    inbound.on_receive(move |msg| {
        let _ = tx.send(msg);
    });

    let client = UdpConnection::new();
    client.connect(addr).await.unwrap();
    let outbound = client
        .register_write_channel::<RemoteMessage<GamepadMessage>>(ChannelId::GAMEPAD, None)
        .unwrap();
    assert_eq!(outbound.destination(), Some(addr));
    assert_eq!(outbound.key().to_string(), format!("{addr}/3"));

    outbound.send(&gamepad(2, 0.5));
    let msg = recv(&mut rx).await;
    assert_eq!(msg.controller_index, 2);
    assert_eq!(msg.message.state.button_a, 0.5);
}

#[tokio::test]
async fn test_udp_channels_are_isolated_by_host() {
    let listener = UdpConnection::new();
    let addr = listener.bind(loopback(0)).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let local_tx = tx.clone();
    let local = listener
        .register_read_channel::<RemoteMessage<GamepadMessage>>(
            ChannelId::GAMEPAD,
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        )
        .unwrap();
    local.on_receive(move |msg| {
        let _ = local_tx.send(("local", msg.controller_index));
    });
    let remote = listener
        .register_read_channel::<RemoteMessage<GamepadMessage>>(
            ChannelId::GAMEPAD,
            Some(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))),
        )
        .unwrap();
    remote.on_receive(move |msg| {
        let _ = tx.send(("remote", msg.controller_index));
    });

    let client = UdpConnection::new();
    client.connect(addr).await.unwrap();
    let outbound = client
        .register_write_channel::<RemoteMessage<GamepadMessage>>(ChannelId::GAMEPAD, None)
        .unwrap();
    outbound.send(&gamepad(1, 1.0));
    outbound.send(&gamepad(2, 1.0));

    assert_eq!(recv(&mut rx).await.0, "local");
    assert_eq!(recv(&mut rx).await.0, "local");
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_udp_deregistered_channel_receives_nothing() {
    let listener = UdpConnection::new();
    let addr = listener.bind(loopback(0)).await.unwrap();
    let host = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));

    let inbound = listener
        .register_read_channel::<RemoteMessage<GamepadMessage>>(ChannelId::GAMEPAD, host)
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    inbound.on_receive(move |msg| {
        let _ = tx.send(msg);
    });
    listener.deregister_read_channel(&inbound);
    assert_eq!(listener.channel_counts(), (0, 0));

    let client = UdpConnection::new();
    client.connect(addr).await.unwrap();
    client
        .register_write_channel::<RemoteMessage<GamepadMessage>>(ChannelId::GAMEPAD, None)
        .unwrap()
        .send(&gamepad(0, 1.0));

    assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_udp_registration_needs_an_endpoint() {
    let listener = UdpConnection::new();
    listener.listen(0).await.unwrap();

    assert!(
        listener
            .register_read_channel::<GamepadMessage>(ChannelId::GAMEPAD, None)
            .is_none()
    );
    assert!(
        listener
            .register_write_channel::<GamepadMessage>(ChannelId::GAMEPAD, None)
            .is_none()
    );
    assert!(
        listener
            .register_write_channel::<GamepadMessage>(ChannelId::GAMEPAD, Some(loopback(9)))
            .is_some()
    );
}

#[tokio::test]
async fn test_udp_reply_reaches_connected_client() {
    let listener = UdpConnection::new();
    let addr = listener.bind(loopback(0)).await.unwrap();

    let client = UdpConnection::new();
    client.connect(addr).await.unwrap();
    let client_addr = loopback(client.local_addr().unwrap().port());

    // The client's read channel defaults to its connected peer's host.
    let inbound = client
        .register_read_channel::<ControllerConnectedMessage>(ChannelId(7), None)
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    inbound.on_receive(move |msg| {
        let _ = tx.send(msg);
    });

    listener
        .register_write_channel::<ControllerConnectedMessage>(ChannelId(7), Some(client_addr))
        .unwrap()
        .send(&ControllerConnectedMessage::new(4, GamepadLayout::Extended, Some("x".into())));

    let msg = recv(&mut rx).await;
    assert_eq!(msg.index, 4);
    assert_eq!(msg.name(), Some("x"));
}

#[tokio::test]
async fn test_udp_disconnect_makes_channels_inert() {
    let client = UdpConnection::new();
    client.connect(loopback(9)).await.unwrap();
    let channel = client
        .register_write_channel::<GamepadMessage>(ChannelId::GAMEPAD, None)
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on_disconnect(move || {
        let _ = tx.send(());
    });
    client.disconnect();

    recv(&mut rx).await;
    assert!(!channel.is_active());
    assert!(matches!(
        client.connect(loopback(9)).await,
        Err(TransportError::ConnectionClosed(_))
    ));
}
