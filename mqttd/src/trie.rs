//! Trie data structures for MQTT topic matching.
//!
//! Supports MQTT wildcards:
//! - `+` matches exactly one topic level
//! - `#` matches any number of remaining topic levels (must be last)
//!
//! Wildcard tokens are stored as ordinary child keys, so `a/+` and `a/#`
//! are separate branches next to literal children of `a`. Topics starting
//! with `$` are never matched by a wildcard in the first level.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::v4::Publish;
use crate::types::QoS;

/// Subscriber identity stored in the trie (the owning client identifier).
pub type Subscriber = Arc<str>;

const MULTI_LEVEL: &str = "#";
const SINGLE_LEVEL: &str = "+";

/// Split a subscription filter into levels, validating wildcard placement.
pub fn filter_levels(filter: &str) -> Result<Vec<&str>> {
    if filter.is_empty() {
        return Err(Error::InvalidTopic("empty topic filter".into()));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;

    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != MULTI_LEVEL || i != last) {
            return Err(Error::InvalidTopic(format!("'#' must be the whole last level: {filter}")));
        }
        if level.contains('+') && *level != SINGLE_LEVEL {
            return Err(Error::InvalidTopic(format!("'+' must be a whole level: {filter}")));
        }
    }

    Ok(levels)
}

/// Split a publish topic name into levels; wildcards are not allowed.
pub fn topic_levels(topic: &str) -> Result<Vec<&str>> {
    if topic.is_empty() {
        return Err(Error::InvalidTopic("empty topic name".into()));
    }
    if topic.contains(['+', '#']) {
        return Err(Error::InvalidTopic(format!("wildcard in topic name: {topic}")));
    }
    Ok(topic.split('/').collect())
}

fn is_system(levels: &[&str]) -> bool {
    levels.first().is_some_and(|l| l.starts_with('$'))
}

// ============================================================================
// Subscription trie
// ============================================================================

/// Node of the subscription trie.
#[derive(Debug, Default)]
pub struct SubscriptionNode {
    /// Subscribers whose filter terminates at this node.
    subscribers: Vec<(Subscriber, QoS)>,
    children: HashMap<String, SubscriptionNode>,
}

impl SubscriptionNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subscriber` under the filter `levels`. An existing entry for
    /// the same subscriber has its QoS replaced instead of being duplicated.
    pub fn insert(&mut self, levels: &[&str], subscriber: Subscriber, qos: QoS) {
        let Some((first, rest)) = levels.split_first() else {
            match self.subscribers.iter_mut().find(|(s, _)| *s == subscriber) {
                Some(entry) => entry.1 = qos,
                None => self.subscribers.push((subscriber, qos)),
            }
            return;
        };

        self.children
            .entry((*first).to_string())
            .or_default()
            .insert(rest, subscriber, qos);
    }

    /// Remove `subscriber` from the filter `levels`, pruning nodes left with
    /// no subscribers and no children on the way back up.
    pub fn remove(&mut self, levels: &[&str], subscriber: &str) -> Result<()> {
        let Some((first, rest)) = levels.split_first() else {
            let before = self.subscribers.len();
            self.subscribers.retain(|(s, _)| s.as_ref() != subscriber);
            if self.subscribers.len() == before {
                return Err(Error::SubscriptionNotFound(subscriber.to_string()));
            }
            return Ok(());
        };

        let child = self
            .children
            .get_mut(*first)
            .ok_or_else(|| Error::SubscriptionNotFound(subscriber.to_string()))?;
        child.remove(rest, subscriber)?;

        if child.is_empty() {
            self.children.remove(*first);
        }
        Ok(())
    }

    /// Collect every subscriber whose filter matches the topic `levels`.
    pub fn matches(&self, levels: &[&str], out: &mut Vec<(Subscriber, QoS)>) {
        self.matches_at(levels, is_system(levels), out);
    }

    fn matches_at(&self, levels: &[&str], skip_wildcards: bool, out: &mut Vec<(Subscriber, QoS)>) {
        if !skip_wildcards {
            if let Some(all) = self.children.get(MULTI_LEVEL) {
                out.extend(all.subscribers.iter().cloned());
            }
        }

        let Some((first, rest)) = levels.split_first() else {
            out.extend(self.subscribers.iter().cloned());
            return;
        };

        if !skip_wildcards {
            if let Some(any) = self.children.get(SINGLE_LEVEL) {
                any.matches_at(rest, false, out);
            }
        }
        if let Some(child) = self.children.get(*first) {
            child.matches_at(rest, false, out);
        }
    }

    /// Whether the node holds nothing and can be pruned.
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.children.is_empty()
    }
}

// ============================================================================
// Retained trie
// ============================================================================

/// Node of the retained-message trie, keyed by exact topic levels.
#[derive(Debug, Default)]
pub struct RetainedNode {
    message: Option<Publish>,
    children: HashMap<String, RetainedNode>,
}

impl RetainedNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or replace the retained message at `levels`.
    pub fn insert(&mut self, levels: &[&str], message: Publish) {
        match levels.split_first() {
            None => self.message = Some(message),
            Some((first, rest)) => self
                .children
                .entry((*first).to_string())
                .or_default()
                .insert(rest, message),
        }
    }

    /// Drop the retained message at `levels`, pruning emptied nodes.
    /// Returns whether a message was stored there.
    pub fn remove(&mut self, levels: &[&str]) -> bool {
        let Some((first, rest)) = levels.split_first() else {
            return self.message.take().is_some();
        };

        let Some(child) = self.children.get_mut(*first) else {
            return false;
        };
        let removed = child.remove(rest);
        if child.is_empty() {
            self.children.remove(*first);
        }
        removed
    }

    /// Collect retained messages matching the filter `levels`.
    pub fn matching(&self, levels: &[&str], out: &mut Vec<Publish>) {
        self.matching_at(levels, true, out);
    }

    fn matching_at(&self, levels: &[&str], at_root: bool, out: &mut Vec<Publish>) {
        let Some((first, rest)) = levels.split_first() else {
            out.extend(self.message.iter().cloned());
            return;
        };

        match *first {
            MULTI_LEVEL => {
                // "a/#" also covers "a" itself.
                if !at_root {
                    out.extend(self.message.iter().cloned());
                }
                for (key, child) in &self.children {
                    if !(at_root && key.starts_with('$')) {
                        child.collect_all(out);
                    }
                }
            }
            SINGLE_LEVEL => {
                for (key, child) in &self.children {
                    if !(at_root && key.starts_with('$')) {
                        child.matching_at(rest, false, out);
                    }
                }
            }
            literal => {
                if let Some(child) = self.children.get(literal) {
                    child.matching_at(rest, false, out);
                }
            }
        }
    }

    fn collect_all(&self, out: &mut Vec<Publish>) {
        out.extend(self.message.iter().cloned());
        for child in self.children.values() {
            child.collect_all(out);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.message.is_none() && self.children.is_empty()
    }
}
