//! Topic engine: subscription matching and retained messages.
//!
//! The subscription trie and the retained trie sit behind separate
//! read-write locks, so retaining a message never blocks subscribe traffic.

use parking_lot::RwLock;
use tracing::trace;

use crate::error::{Error, Result};
use crate::protocol::v4::Publish;
use crate::trie::{filter_levels, topic_levels, RetainedNode, Subscriber, SubscriptionNode};
use crate::types::QoS;

/// Process-wide subscription and retained-message index.
#[derive(Debug, Default)]
pub struct Topics {
    subscriptions: RwLock<SubscriptionNode>,
    retained: RwLock<RetainedNode>,
}

impl Topics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subscriber` for `filter`, returning the granted QoS.
    ///
    /// Re-subscribing the same subscriber to the same filter replaces its QoS.
    pub fn subscribe(&self, filter: &str, qos: u8, subscriber: &Subscriber) -> Result<QoS> {
        let qos = QoS::from_u8(qos)?;
        if subscriber.is_empty() {
            return Err(Error::InvalidSubscriber);
        }
        let levels = filter_levels(filter)?;

        self.subscriptions.write().insert(&levels, subscriber.clone(), qos);
        trace!("{} subscribed to {} (qos {})", subscriber, filter, qos);
        Ok(qos)
    }

    /// Remove `subscriber` from `filter`.
    pub fn unsubscribe(&self, filter: &str, subscriber: &str) -> Result<()> {
        let levels = filter_levels(filter)?;
        self.subscriptions.write().remove(&levels, subscriber)?;
        trace!("{} unsubscribed from {}", subscriber, filter);
        Ok(())
    }

    /// Subscribers matching the publish `topic`, each paired with the QoS the
    /// message is delivered at. Delivery uses the publisher's `qos`; the QoS
    /// granted at subscribe time is not applied as a ceiling.
    pub fn subscribers(&self, topic: &str, qos: QoS) -> Result<Vec<(Subscriber, QoS)>> {
        let levels = topic_levels(topic)?;
        let mut matched = Vec::new();
        self.subscriptions.read().matches(&levels, &mut matched);
        Ok(matched.into_iter().map(|(subscriber, _granted)| (subscriber, qos)).collect())
    }

    /// Store the retained message for `publish.topic`, or delete it when the
    /// payload is empty.
    pub fn retain(&self, publish: &Publish) -> Result<()> {
        let levels = topic_levels(&publish.topic)?;
        let mut retained = self.retained.write();

        if publish.payload.is_empty() {
            retained.remove(&levels);
            trace!("cleared retained message on {}", publish.topic);
        } else {
            let mut stored = publish.clone();
            stored.dup = false;
            stored.pkid = 0;
            retained.insert(&levels, stored);
            trace!("retained message on {}", publish.topic);
        }
        Ok(())
    }

    /// Retained messages whose topic matches `filter`.
    pub fn retained(&self, filter: &str) -> Result<Vec<Publish>> {
        let levels = filter_levels(filter)?;
        let mut out = Vec::new();
        self.retained.read().matching(&levels, &mut out);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn subscriber(id: &str) -> Subscriber {
        Arc::from(id)
    }

    #[test]
    fn test_subscribe_validation() {
        let topics = Topics::new();
        assert!(matches!(topics.subscribe("a", 3, &subscriber("c")), Err(Error::InvalidQoS(3))));
        assert!(matches!(topics.subscribe("a", 0, &subscriber("")), Err(Error::InvalidSubscriber)));
        assert!(matches!(topics.subscribe("a/#/b", 0, &subscriber("c")), Err(Error::InvalidTopic(_))));
        assert_eq!(topics.subscribe("a/#", 2, &subscriber("c")).unwrap(), QoS::ExactlyOnce);
    }

    #[test]
    fn test_delivery_uses_publisher_qos() {
        let topics = Topics::new();
        topics.subscribe("a/+", 0, &subscriber("low")).unwrap();
        topics.subscribe("a/b", 2, &subscriber("high")).unwrap();

        let mut matched = topics.subscribers("a/b", QoS::AtLeastOnce).unwrap();
        matched.sort();
        assert_eq!(
            matched,
            vec![(subscriber("high"), QoS::AtLeastOnce), (subscriber("low"), QoS::AtLeastOnce)]
        );

        assert!(topics.subscribers("a/+", QoS::AtMostOnce).is_err());
    }

    #[test]
    fn test_unsubscribe() {
        let topics = Topics::new();
        topics.subscribe("x/y", 1, &subscriber("c")).unwrap();
        topics.unsubscribe("x/y", "c").unwrap();
        assert!(topics.subscribers("x/y", QoS::AtMostOnce).unwrap().is_empty());
        assert!(matches!(topics.unsubscribe("x/y", "c"), Err(Error::SubscriptionNotFound(_))));
    }

    #[test]
    fn test_retain_and_clear() {
        let topics = Topics::new();
        let mut publish = Publish::new("t", QoS::AtLeastOnce, "v");
        publish.retain = true;
        publish.pkid = 5;
        topics.retain(&publish).unwrap();

        let retained = topics.retained("t").unwrap();
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].payload, "v");
        assert_eq!(retained[0].pkid, 0);

        topics.retain(&Publish::new("t", QoS::AtMostOnce, "")).unwrap();
        assert!(topics.retained("t").unwrap().is_empty());
        assert!(topics.retained("#").unwrap().is_empty());
    }
}
