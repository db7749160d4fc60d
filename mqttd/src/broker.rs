//! MQTT broker: listener, accept loop and message routing.
//!
//! ## Lifecycle
//!
//! [`Broker::start`] binds the listen address and spawns the accept loop;
//! [`Broker::shutdown`] stops accepting, closes every connection and waits
//! until all of them have finished their teardown.
//!
//! ## Routing
//!
//! A publish is retained first (when flagged), then delivered to the session
//! of every matching subscriber. Sessions without a live connection queue
//! the message offline.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::auth::{AllowAll, Authenticator};
use crate::config::BrokerConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::protocol::v4::{Packet, Publish};
use crate::session::Sessions;
use crate::snowflake::Snowflake;
use crate::topics::Topics;
use crate::trie::topic_levels;
use crate::types::QoS;

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// State shared by the broker and all of its connections.
pub(crate) struct BrokerContext {
    pub(crate) config: BrokerConfig,
    pub(crate) topics: Topics,
    pub(crate) sessions: Sessions,
    pub(crate) authenticator: Arc<dyn Authenticator>,
    connections: AtomicUsize,
}

impl BrokerContext {
    fn new(config: BrokerConfig, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            sessions: Sessions::new(config.offline_queue_size),
            topics: Topics::new(),
            authenticator,
            connections: AtomicUsize::new(0),
            config,
        }
    }

    pub(crate) fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::SeqCst);
    }

    /// Retain (if flagged) and deliver a publish to every matching session.
    pub(crate) async fn route(&self, publish: Publish) {
        if publish.retain {
            if let Err(e) = self.topics.retain(&publish) {
                warn!("Failed to retain message on {}: {}", publish.topic, e);
            }
        }

        let subscribers = match self.topics.subscribers(&publish.topic, publish.qos) {
            Ok(subscribers) => subscribers,
            Err(e) => {
                warn!("Cannot route message on {}: {}", publish.topic, e);
                return;
            }
        };
        trace!("Routing {} to {} subscribers", publish.topic, subscribers.len());

        for (client_id, qos) in subscribers {
            let Some(session) = self.sessions.get(&client_id) else {
                debug!("No session for subscriber {} of {}", client_id, publish.topic);
                continue;
            };

            let mut delivery = publish.clone();
            delivery.qos = qos;
            delivery.retain = false;
            delivery.dup = false;
            delivery.pkid = 0;

            if let Err(e) = session.write_message(Packet::Publish(delivery)).await {
                warn!("Dropping message on {} for {}: {}", publish.topic, client_id, e);
            }
        }
    }
}

/// Builder for Broker.
pub struct BrokerBuilder {
    config: BrokerConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl BrokerBuilder {
    /// Create a new broker builder.
    pub fn new(config: BrokerConfig) -> Self {
        Self { config, authenticator: None }
    }

    /// Set the authenticator.
    pub fn authenticator<A: Authenticator + 'static>(mut self, auth: A) -> Self {
        self.authenticator = Some(Arc::new(auth));
        self
    }

    /// Build the broker.
    pub fn build(self) -> Broker {
        let authenticator = self.authenticator.unwrap_or_else(|| Arc::new(AllowAll));
        Broker {
            ctx: Arc::new(BrokerContext::new(self.config, authenticator)),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            running: AtomicBool::new(false),
            local_addr: Mutex::new(None),
        }
    }
}

/// MQTT 3.1.1 broker.
pub struct Broker {
    ctx: Arc<BrokerContext>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Broker {
    /// Create a new broker with the given config.
    pub fn new(config: BrokerConfig) -> Self {
        BrokerBuilder::new(config).build()
    }

    /// Create a builder for this broker.
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.ctx.config
    }

    /// Bind the listen address and start accepting in the background.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// the configured port is 0.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        let bound = self.bind().await;
        if bound.is_err() {
            self.running.store(false, Ordering::SeqCst);
        }
        let (listener, ids) = bound?;

        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        info!("Broker listening on {}", addr);

        self.tracker.spawn(accept_loop(
            listener,
            self.ctx.clone(),
            ids,
            self.shutdown.clone(),
            self.tracker.clone(),
        ));
        Ok(addr)
    }

    async fn bind(&self) -> Result<(TcpListener, Snowflake)> {
        let config = &self.ctx.config;
        config.validate()?;
        let ids = Snowflake::new(config.work_group_id, config.work_id)?;
        let listener = TcpListener::bind(&config.listen).await?;
        Ok((listener, ids))
    }

    /// Start the broker and run until [`Broker::shutdown`] is called.
    pub async fn serve(&self) -> Result<()> {
        self.start().await?;
        self.shutdown.cancelled().await;
        Ok(())
    }

    /// Stop accepting, close every connection, and wait for all of them to
    /// finish closing.
    pub async fn shutdown(&self) {
        info!("Broker shutting down");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Broker stopped");
    }

    /// Publish a message from the broker itself.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        topic_levels(topic)?;
        let mut publish = Publish::new(topic, qos, payload);
        publish.retain = retain;
        self.ctx.route(publish).await;
        Ok(())
    }

    /// Force-disconnect the connection bound to `client_id`. Its will, if
    /// any, is published.
    pub fn disconnect(&self, client_id: &str) -> bool {
        match self.ctx.sessions.get(client_id).and_then(|s| s.connection()) {
            Some(outbound) => {
                info!("Disconnecting client {}", client_id);
                outbound.close();
                true
            }
            None => false,
        }
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.ctx.connections.load(Ordering::SeqCst)
    }

    /// Number of registered sessions, connected or not.
    pub fn session_count(&self) -> usize {
        self.ctx.sessions.len()
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<BrokerContext>,
    ids: Snowflake,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    let mut backoff = Duration::ZERO;

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                backoff = Duration::ZERO;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                }

                let id = ids.next_id();
                let ctx = ctx.clone();
                let shutdown = shutdown.clone();
                tracker.spawn(async move {
                    Connection::run(ctx, id, stream, addr, &shutdown).await;
                });
            }
            Err(_) if shutdown.is_cancelled() => break,
            Err(e) if !is_transient(&e) => {
                error!("Accept failed: {}; listener stopped", e);
                break;
            }
            Err(e) => {
                backoff = if backoff.is_zero() {
                    MIN_ACCEPT_BACKOFF
                } else {
                    (backoff * 2).min(MAX_ACCEPT_BACKOFF)
                };
                warn!("Accept error: {}; retrying in {:?}", e, backoff);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }

    drop(listener);
    debug!("Accept loop stopped");
}

/// Accept errors worth retrying: the peer went away before the accept
/// completed, or the process is out of file descriptors for now.
fn is_transient(e: &io::Error) -> bool {
    // errno values shared by Linux and the BSDs.
    const ENFILE: i32 = 23;
    const EMFILE: i32 = 24;

    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) || matches!(e.raw_os_error(), Some(ENFILE | EMFILE))
}
