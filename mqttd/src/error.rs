//! Error types for mqttd.

use std::io;

use crate::auth::AuthError;

/// Result type alias for mqttd.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mqttd operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Peer violated packet framing.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// Remaining length exceeds the accepted maximum.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Remaining length needs a fifth continuation byte.
    #[error("variable length integer overflow")]
    VarintOverflow,

    /// Not enough bytes buffered to finish decoding.
    #[error("incomplete packet, need {needed} more bytes")]
    Incomplete { needed: usize },

    /// Unknown or reserved control packet type.
    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),

    /// QoS outside 0..=2.
    #[error("invalid qos: {0}")]
    InvalidQoS(u8),

    /// Topic name or filter with misplaced wildcards.
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// Subscribe called without a subscriber.
    #[error("invalid subscriber")]
    InvalidSubscriber,

    /// Unsubscribe for a filter the subscriber never registered.
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// Offline queue at capacity.
    #[error("offline queue full for {client_id}")]
    QueueFull { client_id: String },

    /// Every non-zero packet identifier is in flight.
    #[error("no free packet identifier")]
    PacketIdsExhausted,

    /// Authenticator refused the request.
    #[error("auth: {0}")]
    Auth(#[from] AuthError),

    /// CONNECT refused with the given CONNACK code.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// Connection closed by peer or by the broker.
    #[error("connection closed")]
    ConnectionClosed,

    /// Unexpected packet received.
    #[error("unexpected packet: expected {expected}, got {got}")]
    UnexpectedPacket { expected: String, got: String },

    /// Timeout error.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Broker is already running.
    #[error("broker already running")]
    AlreadyRunning,

    /// Broker is shutting down.
    #[error("broker shutting down")]
    ShuttingDown,
}
