use padlink_protocol::ProtocolError;

/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Establishing an outbound connection failed.
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] std::io::Error),

    /// Binding a local socket failed.
    #[error("bind failed: {0}")]
    BindFailed(#[source] std::io::Error),

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Receiving data failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// Accepting an inbound connection failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// The byte stream could not be framed; the connection is unusable.
    #[error("framing failed: {0}")]
    Framing(#[from] ProtocolError),

    /// The connection was closed and cannot be reused.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The operation is not available on this connection kind.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The transport was shut down.
    #[error("transport shut down")]
    Shutdown,
}
