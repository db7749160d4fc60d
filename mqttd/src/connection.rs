//! Per-connection protocol state machine.
//!
//! A connection runs two loops over one split socket. The receive loop
//! decodes packets and drives the MQTT state machine; the send loop drains
//! the bounded outbound queue to the socket and probes idle peers. They
//! communicate only through that queue and the connection's close signal.
//!
//! Teardown happens once both loops have stopped: the will is published, a
//! clean session is dropped (a persistent one keeps whatever was still
//! queued), and the session binding is released.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::auth::Action;
use crate::broker::BrokerContext;
use crate::error::{Error, Result};
use crate::protocol::v4::{
    ConnAck, Connect, Packet, Publish, SubAck, Subscribe, SubscribeReturnCode, Unsubscribe, Will,
};
use crate::protocol;
use crate::session::Session;
use crate::trie::{topic_levels, Subscriber};
use crate::types::{ConnectReturnCode, QoS};

/// How long the send loop gets to flush queued packets (a refusing CONNACK,
/// for instance) after the receive loop stops.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Outbound path
// ============================================================================

/// Item on a connection's outbound queue.
#[derive(Debug)]
pub enum Outgoing {
    Packet(Packet),
    /// Start live delivery: flush the session's offline backlog, then take
    /// routed messages directly.
    Resume,
    /// Stop the send loop once everything queued before it is written.
    Close,
}

/// Write path and close signals of a connection.
///
/// Sessions hold this instead of the connection itself, so a persistent
/// session never keeps a dead connection alive.
#[derive(Debug, Clone)]
pub struct Outbound {
    connection_id: u64,
    tx: mpsc::Sender<Outgoing>,
    closed: CancellationToken,
    done: CancellationToken,
}

impl Outbound {
    pub fn new(
        connection_id: u64,
        tx: mpsc::Sender<Outgoing>,
        closed: CancellationToken,
        done: CancellationToken,
    ) -> Self {
        Self { connection_id, tx, closed, done }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Enqueue a packet, waiting while the queue is full.
    ///
    /// Hands the packet back if the connection closes first.
    pub async fn send(&self, packet: Packet) -> std::result::Result<(), Packet> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(packet),
            permit = self.tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(Outgoing::Packet(packet));
                    Ok(())
                }
                Err(_) => Err(packet),
            },
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Ask the connection to close. Safe to call any number of times.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Wait until the connection has finished its teardown.
    pub async fn closed(&self) {
        self.done.cancelled().await;
    }
}

// ============================================================================
// Connection state
// ============================================================================

/// Protocol phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for CONNECT.
    Init,
    /// CONNECT being processed.
    Connecting,
    Connected,
    /// Loops stopping.
    Shutdown,
    Closed,
}

struct State {
    phase: Phase,
    client_id: Option<Subscriber>,
    username: String,
    session: Option<Arc<Session>>,
    clean: bool,
    will: Option<Will>,
    /// Filters this connection registered, with the granted QoS.
    subscriptions: HashMap<String, QoS>,
    read_timeout: Option<Duration>,
    /// PINGRESP packets received in reply to our probes.
    pings: u64,
}

/// A live client connection.
pub(crate) struct Connection {
    id: u64,
    addr: SocketAddr,
    ctx: Arc<BrokerContext>,
    tx: mpsc::Sender<Outgoing>,
    closed: CancellationToken,
    done: CancellationToken,
    last_activity: Mutex<Instant>,
    state: Mutex<State>,
}

impl Connection {
    /// Serve one accepted stream until it closes.
    ///
    /// `shutdown` is the broker's stop signal; the connection closes when it
    /// fires.
    pub(crate) async fn run<S>(
        ctx: Arc<BrokerContext>,
        id: u64,
        stream: S,
        addr: SocketAddr,
        shutdown: &CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(ctx.config.queue_size);
        let read_timeout = ctx.config.keepalive_interval().map(read_deadline);

        let conn = Connection {
            id,
            addr,
            ctx: ctx.clone(),
            tx,
            closed: shutdown.child_token(),
            done: CancellationToken::new(),
            last_activity: Mutex::new(Instant::now()),
            state: Mutex::new(State {
                phase: Phase::Init,
                client_id: None,
                username: String::new(),
                session: None,
                clean: true,
                will: None,
                subscriptions: HashMap::new(),
                read_timeout,
                pings: 0,
            }),
        };

        ctx.connection_opened();
        debug!("Connection {} from {} opened", id, addr);

        let (reader, writer) = tokio::io::split(stream);
        let mut unsent = Vec::new();
        let receive = async {
            let result = conn.receive_loop(reader).await;
            conn.stop_sending().await;
            result
        };
        let send = async {
            let result = conn.send_loop(writer, &mut rx, &mut unsent).await;
            conn.closed.cancel();
            result
        };
        let (received, sent) = tokio::join!(receive, send);

        match received {
            Ok(()) | Err(Error::ConnectionClosed) => {}
            Err(e) => debug!("Connection {} receive error: {}", id, e),
        }
        match sent {
            Ok(()) | Err(Error::ConnectionClosed) => {}
            Err(e) => debug!("Connection {} send error: {}", id, e),
        }

        conn.teardown(leftover_packets(unsent, &mut rx)).await;
        ctx.connection_closed();
    }

    fn outbound(&self) -> Outbound {
        Outbound::new(self.id, self.tx.clone(), self.closed.clone(), self.done.clone())
    }

    fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.state.lock().session.clone()
    }

    /// Client identifier, username and session of a connected client.
    fn identity(&self) -> Result<(Subscriber, String, Arc<Session>)> {
        let state = self.state.lock();
        match (&state.client_id, &state.session) {
            (Some(client_id), Some(session)) => {
                Ok((client_id.clone(), state.username.clone(), session.clone()))
            }
            _ => Err(Error::ConnectionClosed),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Enqueue a packet on our own outbound queue.
    async fn send(&self, packet: Packet) -> Result<()> {
        self.outbound().send(packet).await.map_err(|_| Error::ConnectionClosed)
    }

    /// Let the send loop flush what is queued, then make sure it stops.
    async fn stop_sending(&self) {
        {
            let mut state = self.state.lock();
            if state.phase != Phase::Closed {
                state.phase = Phase::Shutdown;
            }
        }
        if self.tx.try_send(Outgoing::Close).is_ok() {
            let _ = timeout(FLUSH_TIMEOUT, self.closed.cancelled()).await;
        }
        self.closed.cancel();
    }

    // ========================================================================
    // Receive loop
    // ========================================================================

    async fn receive_loop<R: AsyncRead + Unpin>(&self, mut reader: R) -> Result<()> {
        let mut buf = BytesMut::with_capacity(self.ctx.config.buffer_size);
        let max_size = self.ctx.config.max_packet_size;

        loop {
            let deadline = self.state.lock().read_timeout;
            let read = protocol::read_packet(&mut reader, &mut buf, max_size);

            let packet = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Ok(()),
                result = read_with_deadline(deadline, read) => result?,
            };
            self.touch();
            trace!("Connection {} received {:?}", self.id, packet.packet_type());

            if !self.handle_packet(packet).await? {
                return Ok(());
            }
        }
    }

    /// Returns false once the client has disconnected gracefully.
    async fn handle_packet(&self, packet: Packet) -> Result<bool> {
        if let Packet::Connect(connect) = packet {
            self.on_connect(connect).await?;
            return Ok(true);
        }

        if self.phase() != Phase::Connected {
            return Err(Error::UnexpectedPacket {
                expected: "Connect".to_string(),
                got: format!("{:?}", packet.packet_type()),
            });
        }

        match packet {
            Packet::Publish(publish) => self.on_publish(publish).await?,
            Packet::PubAck(pkid) | Packet::PubComp(pkid) => {
                if let Some(session) = self.session() {
                    session.unref_message(pkid);
                }
            }
            Packet::PubRec(pkid) => self.send(Packet::PubRel(pkid)).await?,
            Packet::PubRel(pkid) => {
                self.send(Packet::PubComp(pkid)).await?;
                if let Some(session) = self.session() {
                    session.release_incoming(pkid);
                }
            }
            Packet::Subscribe(subscribe) => self.on_subscribe(subscribe).await?,
            Packet::Unsubscribe(unsubscribe) => self.on_unsubscribe(unsubscribe).await?,
            Packet::PingReq => self.send(Packet::PingResp).await?,
            Packet::PingResp => {
                let mut state = self.state.lock();
                state.pings += 1;
                trace!("Connection {} answered {} probes", self.id, state.pings);
            }
            Packet::Disconnect => {
                let mut state = self.state.lock();
                state.will = None;
                state.phase = Phase::Shutdown;
                debug!("Client {:?} disconnected gracefully", state.client_id);
                return Ok(false);
            }
            other => {
                return Err(Error::UnexpectedPacket {
                    expected: "client packet".to_string(),
                    got: format!("{:?}", other.packet_type()),
                });
            }
        }
        Ok(true)
    }

    async fn refuse(&self, code: ConnectReturnCode, reason: String) -> Result<()> {
        self.send(Packet::ConnAck(ConnAck::new(code, false))).await?;
        Err(Error::ConnectionRefused(reason))
    }

    async fn on_connect(&self, connect: Connect) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.phase != Phase::Init {
                warn!("Connection {} sent a second CONNECT, ignoring", self.id);
                return Ok(());
            }
            state.phase = Phase::Connecting;
        }

        if connect.protocol_level != 3 && connect.protocol_level != 4 {
            return self
                .refuse(
                    ConnectReturnCode::UnacceptableProtocolVersion,
                    format!("protocol level {}", connect.protocol_level),
                )
                .await;
        }

        let client_id = if connect.client_id.is_empty() {
            if !connect.clean_session {
                return self
                    .refuse(
                        ConnectReturnCode::IdentifierRejected,
                        "empty client id with persistent session".to_string(),
                    )
                    .await;
            }
            uuid::Uuid::new_v4().to_string()
        } else {
            connect.client_id.clone()
        };

        let username = connect.username.clone().unwrap_or_default();
        let password = connect.password.as_deref().unwrap_or(&[]);
        if let Err(e) = self.ctx.authenticator.authenticate(&client_id, &username, password) {
            warn!("Authentication failed for {} from {}: {}", client_id, self.addr, e);
            self.send(Packet::ConnAck(ConnAck::new(e.connect_return_code(), false))).await?;
            return Err(e.into());
        }

        let client: Subscriber = Arc::from(client_id.as_str());
        let attached = self.ctx.sessions.attach(&client, connect.clean_session, self.outbound());
        {
            let mut state = self.state.lock();
            state.client_id = Some(client.clone());
            state.username = username;
            state.session = Some(attached.session.clone());
            state.clean = connect.clean_session;
        }

        // The old connection must finish its teardown before we touch the
        // topic engine, or its cleanup could undo our subscriptions.
        if let Some(old) = attached.evicted {
            info!("Client {} reconnected, closing connection {}", client, old.connection_id());
            old.close();
            tokio::select! {
                _ = self.closed.cancelled() => return Err(Error::ConnectionClosed),
                _ = old.closed() => {}
            }
        }

        if let Some(replaced) = &attached.replaced {
            for (filter, _) in replaced.topics() {
                let _ = self.ctx.topics.unsubscribe(&filter, &client);
            }
        }

        if attached.present {
            for (filter, qos) in attached.session.topics() {
                if let Err(e) = self.ctx.topics.subscribe(&filter, qos, &client) {
                    warn!("Failed to restore {} for {}: {}", filter, client, e);
                }
            }
        }

        {
            let mut state = self.state.lock();
            state.will = connect.will;
            state.phase = Phase::Connected;
            if connect.keep_alive > 0 {
                state.read_timeout =
                    Some(read_deadline(Duration::from_secs(u64::from(connect.keep_alive))));
            }
        }

        self.send(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted, attached.present)))
            .await?;
        self.tx.send(Outgoing::Resume).await.map_err(|_| Error::ConnectionClosed)?;

        info!(
            "Client {} connected from {} (connection {}, clean={}, present={}, keep_alive={}s)",
            client, self.addr, self.id, connect.clean_session, attached.present, connect.keep_alive
        );
        Ok(())
    }

    async fn on_publish(&self, publish: Publish) -> Result<()> {
        topic_levels(&publish.topic)?;
        let (client_id, username, session) = self.identity()?;

        match publish.qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => self.send(Packet::PubAck(publish.pkid)).await?,
            QoS::ExactlyOnce => {
                session.register_incoming(&publish);
                self.send(Packet::PubRec(publish.pkid)).await?;
            }
        }

        if let Err(e) = self.ctx.authenticator.authorize(
            Action::Publish,
            &client_id,
            &username,
            &self.addr,
            &publish.topic,
        ) {
            debug!("Publish from {} to {} denied: {}", client_id, publish.topic, e);
            return Ok(());
        }

        self.ctx.route(publish).await;
        Ok(())
    }

    async fn on_subscribe(&self, subscribe: Subscribe) -> Result<()> {
        let (client_id, username, session) = self.identity()?;
        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        let mut retained = Vec::new();

        for filter in &subscribe.filters {
            if let Err(e) = self.ctx.authenticator.authorize(
                Action::Subscribe,
                &client_id,
                &username,
                &self.addr,
                &filter.path,
            ) {
                debug!("Subscribe from {} to {} denied: {}", client_id, filter.path, e);
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            }

            let previous = self.state.lock().subscriptions.remove(&filter.path);
            if previous.is_some() {
                let _ = self.ctx.topics.unsubscribe(&filter.path, &client_id);
            }

            match self.ctx.topics.subscribe(&filter.path, filter.qos, &client_id) {
                Ok(granted) => {
                    self.state.lock().subscriptions.insert(filter.path.clone(), granted);
                    session.add_topic(&filter.path, granted as u8);
                    return_codes.push(SubscribeReturnCode::Success(granted));
                    match self.ctx.topics.retained(&filter.path) {
                        Ok(messages) => retained.extend(messages),
                        Err(e) => debug!("Retained lookup for {} failed: {}", filter.path, e),
                    }
                }
                Err(e) => {
                    debug!("Subscribe from {} to {} failed: {}", client_id, filter.path, e);
                    // The old registration is gone, so it must not come back
                    // on the next resume either.
                    if previous.is_some() {
                        session.remove_topic(&filter.path);
                    }
                    return_codes.push(SubscribeReturnCode::Failure);
                }
            }
        }

        self.send(Packet::SubAck(SubAck::new(subscribe.pkid, return_codes))).await?;

        for mut message in retained {
            message.retain = true;
            self.send(Packet::Publish(message)).await?;
        }
        Ok(())
    }

    async fn on_unsubscribe(&self, unsubscribe: Unsubscribe) -> Result<()> {
        let (client_id, _, session) = self.identity()?;

        for filter in &unsubscribe.topics {
            let registered = self.state.lock().subscriptions.remove(filter).is_some();
            let persisted = session.remove_topic(filter);
            if registered || persisted {
                if let Err(e) = self.ctx.topics.unsubscribe(filter, &client_id) {
                    debug!("Unsubscribe {} from {} failed: {}", client_id, filter, e);
                }
            }
        }

        let reply = if self.ctx.config.unsuback_as_suback {
            Packet::SubAck(SubAck::new(unsubscribe.pkid, Vec::new()))
        } else {
            Packet::UnsubAck(unsubscribe.pkid)
        };
        self.send(reply).await
    }

    // ========================================================================
    // Send loop
    // ========================================================================

    /// Packets taken off the queue but not completely written end up in
    /// `unsent`, oldest first.
    async fn send_loop<W: AsyncWrite + Unpin>(
        &self,
        mut writer: W,
        rx: &mut mpsc::Receiver<Outgoing>,
        unsent: &mut Vec<Packet>,
    ) -> Result<()> {
        let probe = self.ctx.config.keepalive_interval();

        loop {
            let idle_deadline = match probe {
                Some(interval) if self.phase() == Phase::Connected => {
                    Some(*self.last_activity.lock() + interval)
                }
                _ => None,
            };

            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Ok(()),
                item = rx.recv() => match item {
                    Some(Outgoing::Packet(packet)) => {
                        if let Err((e, packet)) = self.write(&mut writer, packet).await {
                            unsent.push(packet);
                            return Err(e);
                        }
                    }
                    Some(Outgoing::Resume) => {
                        let backlog = match self.session() {
                            Some(session) => session.activate(self.id),
                            None => Vec::new(),
                        };
                        if !backlog.is_empty() {
                            debug!("Connection {} flushing {} offline messages", self.id, backlog.len());
                        }
                        let mut backlog = backlog.into_iter();
                        while let Some(packet) = backlog.next() {
                            if let Err((e, packet)) = self.write(&mut writer, packet).await {
                                unsent.push(packet);
                                unsent.extend(backlog);
                                return Err(e);
                            }
                        }
                    }
                    Some(Outgoing::Close) | None => return Ok(()),
                },
                _ = sleep_until(idle_deadline.unwrap_or_else(Instant::now)), if idle_deadline.is_some() => {
                    trace!("Connection {} idle, sending PINGREQ", self.id);
                    self.write(&mut writer, Packet::PingReq).await.map_err(|(e, _)| e)?;
                }
            }
        }
    }

    /// Write one packet, stamping a packet identifier on QoS 1/2 publishes.
    ///
    /// Hands the packet back with the error when it was not completely
    /// written.
    async fn write<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        mut packet: Packet,
    ) -> std::result::Result<(), (Error, Packet)> {
        if let Packet::Publish(publish) = &mut packet {
            if publish.qos != QoS::AtMostOnce {
                let Some(session) = self.session() else {
                    return Ok(());
                };
                if let Err(e) = session.register_message(publish) {
                    warn!("Dropping publish to {} on {}: {}", session.client_id(), publish.topic, e);
                    return Ok(());
                }
            }
        }

        let written = tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::ConnectionClosed),
            result = protocol::write_packet(writer, &packet) => result,
        };
        match written {
            Ok(()) => {
                self.touch();
                Ok(())
            }
            Err(e) => Err((e, packet)),
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// `leftover` holds the packets that never reached the peer, in the
    /// order they were queued.
    async fn teardown(&self, leftover: Vec<Packet>) {
        let (will, client_id, session, clean) = {
            let mut state = self.state.lock();
            state.phase = Phase::Shutdown;
            (state.will.take(), state.client_id.clone(), state.session.clone(), state.clean)
        };

        if let Some(will) = will {
            debug!("Publishing will of {:?} to {}", client_id, will.topic);
            let mut publish = Publish::new(will.topic, will.qos, will.payload);
            publish.retain = will.retain;
            self.ctx.route(publish).await;
        }

        if let (Some(client_id), Some(session)) = (client_id, session) {
            if clean {
                for (filter, _) in session.topics() {
                    let _ = self.ctx.topics.unsubscribe(&filter, &client_id);
                }
                self.ctx.sessions.remove(&client_id, &session);
            } else {
                // Anything routed since the takeover is already queued
                // offline and is newer than what this connection still held.
                let kept = leftover.len();
                let dropped = session.requeue_front(leftover);
                if dropped > 0 {
                    warn!("Offline queue of {} full, dropped {} packets", client_id, dropped);
                }
                if kept > dropped {
                    debug!("Kept {} queued packets for {}", kept - dropped, client_id);
                }
                session.discard_inflight();
            }
            session.unbind(self.id);
            info!("Client {} disconnected (connection {})", client_id, self.id);
        }

        self.state.lock().phase = Phase::Closed;
        self.done.cancel();
        debug!("Connection {} from {} closed", self.id, self.addr);
    }
}

/// Collect what the send loop never wrote: the packet it was writing first,
/// then whatever is still queued. Connection-scoped packets are dropped.
fn leftover_packets(mut unsent: Vec<Packet>, rx: &mut mpsc::Receiver<Outgoing>) -> Vec<Packet> {
    while let Ok(item) = rx.try_recv() {
        if let Outgoing::Packet(packet) = item {
            unsent.push(packet);
        }
    }
    unsent.retain(|packet| {
        !matches!(
            packet,
            Packet::Connect(_) | Packet::Disconnect | Packet::PingReq | Packet::PingResp
        )
    });
    unsent
}

fn read_deadline(keepalive: Duration) -> Duration {
    keepalive * 3 / 2
}

async fn read_with_deadline<F>(deadline: Option<Duration>, read: F) -> Result<Packet>
where
    F: std::future::Future<Output = Result<Packet>>,
{
    match deadline {
        Some(limit) => timeout(limit, read)
            .await
            .map_err(|_| Error::Timeout(format!("no packet within {limit:?}")))?,
        None => read.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(topic: &str) -> Packet {
        Packet::Publish(Publish::new(topic, QoS::AtMostOnce, "v"))
    }

    #[test]
    fn test_leftover_packets_keep_order_and_skip_connection_packets() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.try_send(Outgoing::Packet(publish("b"))).unwrap();
        tx.try_send(Outgoing::Packet(Packet::PingResp)).unwrap();
        tx.try_send(Outgoing::Resume).unwrap();
        tx.try_send(Outgoing::Packet(Packet::PubAck(3))).unwrap();
        tx.try_send(Outgoing::Packet(Packet::PingReq)).unwrap();
        tx.try_send(Outgoing::Packet(Packet::Disconnect)).unwrap();
        tx.try_send(Outgoing::Close).unwrap();
        tx.try_send(Outgoing::Packet(publish("c"))).unwrap();

        let leftover = leftover_packets(vec![publish("a")], &mut rx);
        assert_eq!(
            leftover,
            vec![publish("a"), publish("b"), Packet::PubAck(3), publish("c")]
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_read_deadline_is_one_and_a_half_keepalives() {
        assert_eq!(read_deadline(Duration::from_secs(60)), Duration::from_secs(90));
    }
}
