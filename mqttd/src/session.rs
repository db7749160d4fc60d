//! Client sessions and the session registry.
//!
//! A [`Session`] outlives the network connection when the client asked for a
//! persistent session. It never owns its connection: the binding is an
//! [`Outbound`] handle (a queue sender plus close signals), so a session kept
//! in the registry does not pin a dead connection alive.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::connection::Outbound;
use crate::error::{Error, Result};
use crate::inflight::{Context, InflightTable};
use crate::protocol::v4::{Packet, Publish};
use crate::trie::Subscriber;

/// Default capacity of a session's offline queue.
pub const DEFAULT_OFFLINE_QUEUE_SIZE: usize = 1024;

struct Binding {
    outbound: Outbound,
    /// False until the connection has flushed the offline backlog; deliveries
    /// keep going to the offline queue meanwhile so the backlog stays first.
    live: bool,
}

struct SessionInner {
    binding: Option<Binding>,
    offline: VecDeque<Packet>,
    /// Outgoing QoS 1/2 deliveries awaiting PUBACK or PUBCOMP.
    outgoing: InflightTable,
    /// Incoming QoS 2 publishes awaiting PUBREL.
    incoming: InflightTable,
    /// Persisted subscriptions: filter -> requested QoS.
    topics: BTreeMap<String, u8>,
}

/// Per-client state.
pub struct Session {
    client_id: Subscriber,
    /// Created by a clean-session CONNECT; never resumed.
    clean: bool,
    offline_capacity: usize,
    inner: Mutex<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("client_id", &self.client_id).finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(client_id: impl Into<Subscriber>, clean: bool, offline_capacity: usize) -> Self {
        let client_id = client_id.into();

        let mut outgoing = InflightTable::new();
        let owner = client_id.clone();
        outgoing.on_finish(Arc::new(move |id: u16, msg: &Publish, ctx: Context| {
            trace!("{} acknowledged packet {} on {}", owner, id, msg.topic);
            if let Context::Waiter(tx) = ctx {
                let _ = tx.send(());
            }
        }));

        Self {
            client_id,
            clean,
            offline_capacity,
            inner: Mutex::new(SessionInner {
                binding: None,
                offline: VecDeque::new(),
                outgoing,
                incoming: InflightTable::new(),
                topics: BTreeMap::new(),
            }),
        }
    }

    pub fn client_id(&self) -> &Subscriber {
        &self.client_id
    }

    pub fn is_clean(&self) -> bool {
        self.clean
    }

    /// Write path of the bound connection, live or pending.
    pub fn connection(&self) -> Option<Outbound> {
        self.inner.lock().binding.as_ref().map(|b| b.outbound.clone())
    }

    // ------------------------------------------------------------------------
    // Connection binding
    // ------------------------------------------------------------------------

    /// Bind a connection's write path. The binding starts out pending; see
    /// [`Session::activate`]. Returns the previously bound connection, which
    /// the caller must disconnect.
    pub fn bind(&self, outbound: Outbound) -> Option<Outbound> {
        let previous = self.inner.lock().binding.replace(Binding { outbound, live: false });
        previous.map(|b| b.outbound)
    }

    /// Detach whatever connection is bound.
    pub fn take_binding(&self) -> Option<Outbound> {
        self.inner.lock().binding.take().map(|b| b.outbound)
    }

    /// Detach the binding if it still belongs to `connection_id`.
    pub fn unbind(&self, connection_id: u64) -> bool {
        let mut inner = self.inner.lock();
        let owned = inner
            .binding
            .as_ref()
            .is_some_and(|b| b.outbound.connection_id() == connection_id);
        if owned {
            inner.binding = None;
        }
        owned
    }

    /// Start live delivery to `connection_id` and hand back the offline
    /// backlog in FIFO order. Both happen under one lock, so every message
    /// routed afterwards is queued behind the backlog.
    pub fn activate(&self, connection_id: u64) -> Vec<Packet> {
        let mut inner = self.inner.lock();
        match &mut inner.binding {
            Some(b) if b.outbound.connection_id() == connection_id => b.live = true,
            _ => return Vec::new(),
        }
        inner.offline.drain(..).collect()
    }

    /// Whether a connection is bound and receiving live traffic.
    pub fn is_connected(&self) -> bool {
        self.inner.lock().binding.as_ref().is_some_and(|b| b.live)
    }

    // ------------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------------

    /// Deliver a packet to the bound connection, or park it in the offline
    /// queue when nothing is bound or the connection is going away.
    ///
    /// Waits while the connection's outbound queue is full. A packet handed
    /// back by a connection that closed meanwhile goes to whatever is bound
    /// by then.
    pub async fn write_message(&self, mut packet: Packet) -> Result<()> {
        loop {
            let outbound = {
                let mut inner = self.inner.lock();
                let live = inner
                    .binding
                    .as_ref()
                    .filter(|b| b.live && !b.outbound.is_closed())
                    .map(|b| b.outbound.clone());
                match live {
                    Some(outbound) => outbound,
                    None => return self.push_offline(&mut inner, packet),
                }
            };

            match outbound.send(packet).await {
                Ok(()) => return Ok(()),
                Err(returned) => packet = returned,
            }
        }
    }

    /// Append to the offline queue.
    pub fn queue_offline(&self, packet: Packet) -> Result<()> {
        self.push_offline(&mut self.inner.lock(), packet)
    }

    fn push_offline(&self, inner: &mut SessionInner, packet: Packet) -> Result<()> {
        if inner.offline.len() >= self.offline_capacity {
            return Err(Error::QueueFull { client_id: self.client_id.to_string() });
        }
        inner.offline.push_back(packet);
        Ok(())
    }

    /// Put packets back at the head of the offline queue, ahead of anything
    /// queued since, keeping their order.
    ///
    /// Returns how many did not fit. Those are the oldest of `packets`.
    pub fn requeue_front(&self, packets: Vec<Packet>) -> usize {
        let mut inner = self.inner.lock();
        let room = self.offline_capacity.saturating_sub(inner.offline.len());
        let dropped = packets.len().saturating_sub(room);
        for packet in packets.into_iter().skip(dropped).rev() {
            inner.offline.push_front(packet);
        }
        dropped
    }

    /// Drain the offline queue in FIFO order.
    pub fn offline_messages(&self) -> Vec<Packet> {
        self.inner.lock().offline.drain(..).collect()
    }

    // ------------------------------------------------------------------------
    // Acknowledgment tracking
    // ------------------------------------------------------------------------

    /// Stamp a fresh packet identifier on an outgoing QoS 1/2 publish and
    /// track it until acknowledged.
    pub fn register_message(&self, publish: &mut Publish) -> Result<u16> {
        self.register_message_with(publish, Context::None)
    }

    /// Like [`Session::register_message`] with an explicit context.
    pub fn register_message_with(&self, publish: &mut Publish, context: Context) -> Result<u16> {
        let mut inner = self.inner.lock();
        let id = inner.outgoing.new_id()?;
        publish.pkid = id;
        inner.outgoing.register(id, publish.clone(), 1, context);
        Ok(id)
    }

    /// Retire an outgoing delivery (PUBACK or PUBCOMP received).
    pub fn unref_message(&self, id: u16) -> bool {
        let done = self.inner.lock().outgoing.unref(id);
        if !done {
            debug!("{} acknowledged unknown packet {}", self.client_id, id);
        }
        done
    }

    /// Remember an incoming QoS 2 publish until its PUBREL arrives.
    pub fn register_incoming(&self, publish: &Publish) {
        self.inner.lock().incoming.register(publish.pkid, publish.clone(), 1, Context::None);
    }

    /// PUBREL received for an incoming QoS 2 publish.
    pub fn release_incoming(&self, id: u16) -> bool {
        self.inner.lock().incoming.unref(id)
    }

    /// Number of outgoing deliveries awaiting acknowledgment.
    pub fn inflight_len(&self) -> usize {
        self.inner.lock().outgoing.len()
    }

    /// Forget all unacknowledged deliveries without completing them. In-flight
    /// messages are not redelivered on reconnect.
    pub fn discard_inflight(&self) {
        let mut inner = self.inner.lock();
        inner.outgoing.clear();
        inner.incoming.clear();
    }

    // ------------------------------------------------------------------------
    // Persisted subscriptions
    // ------------------------------------------------------------------------

    pub fn add_topic(&self, filter: &str, qos: u8) {
        self.inner.lock().topics.insert(filter.to_string(), qos);
    }

    pub fn remove_topic(&self, filter: &str) -> bool {
        self.inner.lock().topics.remove(filter).is_some()
    }

    /// Persisted subscriptions, ordered by filter.
    pub fn topics(&self) -> Vec<(String, u8)> {
        self.inner.lock().topics.iter().map(|(f, q)| (f.clone(), *q)).collect()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Result of binding a connection to a session.
pub struct Attached {
    pub session: Arc<Session>,
    /// A persistent session already existed for this client.
    pub present: bool,
    /// The session this one replaced, for clean-session connects.
    pub replaced: Option<Arc<Session>>,
    /// Connection previously bound to the client, to be force-disconnected.
    pub evicted: Option<Outbound>,
}

/// Sessions keyed by client identifier.
pub struct Sessions {
    sessions: RwLock<HashMap<Subscriber, Arc<Session>>>,
    offline_capacity: usize,
}

impl Sessions {
    pub fn new(offline_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            offline_capacity,
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(client_id).cloned()
    }

    /// Bind `outbound` to the session for `client_id`.
    ///
    /// A persistent connect resumes an existing persistent session. Anything
    /// else (a clean connect, or a persistent connect finding a clean
    /// session still registered) installs a fresh session in its place. Lookup, replacement and binding
    /// happen under the registry lock, so concurrent connects for one client
    /// identifier serialize here and at most one of them stays bound.
    pub fn attach(&self, client_id: &Subscriber, clean: bool, outbound: Outbound) -> Attached {
        let mut sessions = self.sessions.write();

        let existing = sessions.get(client_id).cloned();
        match existing {
            Some(session) if !clean && !session.is_clean() => {
                let evicted = session.bind(outbound);
                Attached { session, present: true, replaced: None, evicted }
            }
            replaced => {
                let session = Arc::new(Session::new(client_id.clone(), clean, self.offline_capacity));
                session.bind(outbound);
                sessions.insert(client_id.clone(), session.clone());
                let evicted = replaced.as_ref().and_then(|old| old.take_binding());
                Attached { session, present: false, replaced, evicted }
            }
        }
    }

    /// Remove the registry entry for `client_id` if it is still `session`.
    pub fn remove(&self, client_id: &str, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write();
        let current = sessions.get(client_id).is_some_and(|s| Arc::ptr_eq(s, session));
        if current {
            sessions.remove(client_id);
        }
        current
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outgoing;
    use crate::types::QoS;
    use std::collections::HashSet;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn outbound(id: u64, capacity: usize) -> (Outbound, mpsc::Receiver<Outgoing>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Outbound::new(id, tx, CancellationToken::new(), CancellationToken::new()), rx)
    }

    fn publish(topic: &str) -> Packet {
        Packet::Publish(Publish::new(topic, QoS::AtMostOnce, "v"))
    }

    fn topic_of(packet: &Packet) -> &str {
        match packet {
            Packet::Publish(p) => &p.topic,
            other => panic!("expected publish, got {other:?}"),
        }
    }

    #[test]
    fn test_offline_queue_bounded_fifo() {
        let session = Session::new("c", false, 2);
        session.queue_offline(publish("a")).unwrap();
        session.queue_offline(publish("b")).unwrap();
        assert!(matches!(session.queue_offline(publish("c")), Err(Error::QueueFull { .. })));

        let drained = session.offline_messages();
        assert_eq!(drained.iter().map(topic_of).collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(session.offline_messages().is_empty());
    }

    #[test]
    fn test_requeue_front_keeps_order() {
        let session = Session::new("c", false, 4);
        session.queue_offline(publish("c")).unwrap();
        session.queue_offline(publish("d")).unwrap();

        assert_eq!(session.requeue_front(vec![publish("a"), publish("b")]), 0);
        let drained = session.offline_messages();
        assert_eq!(drained.iter().map(topic_of).collect::<Vec<_>>(), vec!["a", "b", "c", "d"]);

        session.queue_offline(publish("z")).unwrap();
        let dropped = session.requeue_front(vec![publish("w"), publish("x"), publish("y")]);
        assert_eq!(dropped, 0);
        assert_eq!(session.requeue_front(vec![publish("u"), publish("v")]), 2);
        let drained = session.offline_messages();
        assert_eq!(drained.iter().map(topic_of).collect::<Vec<_>>(), vec!["w", "x", "y", "z"]);
    }

    #[test]
    fn test_requeue_front_drops_oldest_when_full() {
        let session = Session::new("c", false, 3);
        session.queue_offline(publish("d")).unwrap();

        assert_eq!(session.requeue_front(vec![publish("a"), publish("b"), publish("c")]), 1);
        let drained = session.offline_messages();
        assert_eq!(drained.iter().map(topic_of).collect::<Vec<_>>(), vec!["b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_write_message_pending_binding_goes_offline() {
        let session = Session::new("c", false, 8);
        let (out, mut rx) = outbound(1, 8);
        assert!(session.bind(out).is_none());

        session.write_message(publish("early")).await.unwrap();
        assert!(rx.try_recv().is_err());

        let backlog = session.activate(1);
        assert_eq!(backlog.iter().map(topic_of).collect::<Vec<_>>(), vec!["early"]);
        assert!(session.is_connected());

        session.write_message(publish("live")).await.unwrap();
        match rx.recv().await {
            Some(Outgoing::Packet(p)) => assert_eq!(topic_of(&p), "live"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_write_message_to_closing_connection_goes_offline() {
        let session = Session::new("c", false, 8);
        let (out, _rx) = outbound(1, 1);
        out.close();
        session.bind(out);
        session.activate(1);

        session.write_message(publish("x")).await.unwrap();
        assert_eq!(session.offline_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_write_message_waits_for_queue_space() {
        let session = Arc::new(Session::new("c", false, 8));
        let (out, mut rx) = outbound(1, 1);
        session.bind(out);
        session.activate(1);

        session.write_message(publish("first")).await.unwrap();
        let blocked = tokio::spawn({
            let session = session.clone();
            async move { session.write_message(publish("second")).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        let Some(Outgoing::Packet(first)) = rx.recv().await else { panic!("queue closed") };
        assert_eq!(topic_of(&first), "first");
        blocked.await.unwrap().unwrap();
        let Some(Outgoing::Packet(second)) = rx.recv().await else { panic!("queue closed") };
        assert_eq!(topic_of(&second), "second");
        assert!(session.offline_messages().is_empty());
    }

    #[tokio::test]
    async fn test_blocked_write_moves_to_new_connection() {
        let session = Arc::new(Session::new("c", false, 8));
        let (old, _old_rx) = outbound(1, 1);
        session.bind(old.clone());
        session.activate(1);
        session.write_message(publish("queued")).await.unwrap();

        let blocked = tokio::spawn({
            let session = session.clone();
            async move { session.write_message(publish("moved")).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let (new, mut new_rx) = outbound(2, 4);
        session.bind(new);
        old.close();
        blocked.await.unwrap().unwrap();

        // The new binding is still pending, so the packet waits offline.
        assert!(new_rx.try_recv().is_err());
        let backlog = session.activate(2);
        assert_eq!(backlog.iter().map(topic_of).collect::<Vec<_>>(), vec!["moved"]);
    }

    #[test]
    fn test_unbind_only_own_connection() {
        let session = Session::new("c", false, 8);
        let (first, _rx1) = outbound(1, 1);
        let (second, _rx2) = outbound(2, 1);
        session.bind(first);
        let evicted = session.bind(second).unwrap();
        assert_eq!(evicted.connection_id(), 1);

        assert!(!session.unbind(1));
        assert!(session.unbind(2));
        assert!(!session.is_connected());
    }

    #[test]
    fn test_register_stamps_distinct_ids_concurrently() {
        let session = Arc::new(Session::new("c", false, 8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = session.clone();
                std::thread::spawn(move || {
                    (0..500)
                        .map(|_| {
                            let mut p = Publish::new("t", QoS::AtLeastOnce, "v");
                            session.register_message(&mut p).unwrap()
                        })
                        .collect::<Vec<u16>>()
                })
            })
            .collect();

        let ids: Vec<u16> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let unique: HashSet<u16> = ids.iter().copied().collect();
        assert_eq!(unique.len(), 4000);
        assert!(!unique.contains(&0));
        assert_eq!(session.inflight_len(), 4000);

        for id in &ids {
            assert!(session.unref_message(*id));
        }
        assert_eq!(session.inflight_len(), 0);
        assert!(!session.unref_message(ids[0]));
    }

    #[test]
    fn test_incoming_qos2_tracking() {
        let session = Session::new("c", false, 8);
        let mut p = Publish::new("t", QoS::ExactlyOnce, "v");
        p.pkid = 7;
        session.register_incoming(&p);
        assert!(session.release_incoming(7));
        assert!(!session.release_incoming(7));
    }

    #[test]
    fn test_discard_inflight() {
        let session = Session::new("c", false, 8);
        let mut p = Publish::new("t", QoS::AtLeastOnce, "v");
        let id = session.register_message(&mut p).unwrap();
        session.discard_inflight();
        assert_eq!(session.inflight_len(), 0);
        assert!(!session.unref_message(id));
    }

    #[test]
    fn test_registry_attach() {
        let sessions = Sessions::new(8);
        let client: Subscriber = Arc::from("c");

        let (first, _rx1) = outbound(1, 1);
        let attached = sessions.attach(&client, false, first);
        assert!(!attached.present);
        assert!(attached.evicted.is_none());
        attached.session.add_topic("x", 1);

        let (second, _rx2) = outbound(2, 1);
        let resumed = sessions.attach(&client, false, second);
        assert!(resumed.present);
        assert!(Arc::ptr_eq(&resumed.session, &attached.session));
        assert_eq!(resumed.evicted.unwrap().connection_id(), 1);
        assert_eq!(resumed.session.topics(), vec![("x".to_string(), 1)]);

        let (third, _rx3) = outbound(3, 1);
        let fresh = sessions.attach(&client, true, third);
        assert!(!fresh.present);
        assert_eq!(fresh.evicted.unwrap().connection_id(), 2);
        assert!(fresh.session.topics().is_empty());
        let replaced = fresh.replaced.unwrap();
        assert!(Arc::ptr_eq(&replaced, &attached.session));

        assert!(!sessions.remove("c", &replaced));

        // A persistent connect never resumes a clean session.
        let (fourth, _rx4) = outbound(4, 1);
        let persistent = sessions.attach(&client, false, fourth);
        assert!(!persistent.present);
        assert!(!persistent.session.is_clean());
        assert!(Arc::ptr_eq(&persistent.replaced.unwrap(), &fresh.session));
        assert_eq!(persistent.evicted.unwrap().connection_id(), 3);

        assert!(!sessions.remove("c", &fresh.session));
        assert!(sessions.remove("c", &persistent.session));
        assert!(sessions.is_empty());
    }
}
