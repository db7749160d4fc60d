//! In-memory MQTT 3.1.1 broker.
//!
//! Supports QoS 0/1/2 delivery, wildcard subscriptions, retained messages,
//! last-will messages and persistent sessions with a bounded offline queue,
//! with a pluggable [`Authenticator`] consulted at every step:
//!
//! - **Connect**: Authenticate client credentials
//! - **Publish**: Check write permission for topic
//! - **Subscribe**: Check read permission for each filter
//!
//! ## Components
//!
//! - [`protocol`]: packet codec
//! - [`topics`]: subscription and retained-message tries
//! - [`inflight`]: packet identifier correlation
//! - [`session`]: per-client state that survives reconnects
//! - [`Broker`]: listener, connections and routing
//!
//! ## Example
//!
//! ```no_run
//! use mqttd::{Broker, BrokerConfig, QoS};
//!
//! #[tokio::main]
//! async fn main() -> mqttd::Result<()> {
//!     let broker = Broker::new(BrokerConfig::new("127.0.0.1:1883"));
//!     let addr = broker.start().await?;
//!     println!("listening on {addr}");
//!
//!     broker.publish("status/broker", "up", QoS::AtLeastOnce, true).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     broker.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
mod broker;
pub mod config;
pub mod connection;
mod error;
pub mod inflight;
pub mod protocol;
pub mod session;
pub mod snowflake;
pub mod topics;
pub mod trie;
mod types;

pub use auth::{Action, AllowAll, AuthError, Authenticator, StaticAuthenticator};
pub use broker::{Broker, BrokerBuilder};
pub use config::BrokerConfig;
pub use error::{Error, Result};
pub use types::{ConnectFlags, ConnectReturnCode, FixedHeader, PacketType, QoS};
