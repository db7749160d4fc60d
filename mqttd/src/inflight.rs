//! Per-session correlation of packet identifiers with in-flight messages.
//!
//! Identifiers are handed out by [`InflightTable::new_id`] and stay reserved
//! until the entry's reference count reaches zero or it is removed. The table
//! is not synchronized itself; the owning session serializes access.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::protocol::v4::Publish;

/// Caller context carried alongside an in-flight message.
#[derive(Debug, Default)]
pub enum Context {
    #[default]
    None,
    /// Fired when the message completes.
    Waiter(oneshot::Sender<()>),
    /// Delivery attempts made so far.
    Retry { attempts: u32 },
}

/// Completion callback, invoked once per entry with `(id, message, context)`.
///
/// Runs while the owning session's lock is held, so it must not call back
/// into that session.
pub type FinishCallback = Arc<dyn Fn(u16, &Publish, Context) + Send + Sync>;

#[derive(Debug)]
struct Entry {
    message: Publish,
    refs: u32,
    context: Context,
    created: Instant,
    updated: Instant,
}

/// Packet identifier table.
#[derive(Default)]
pub struct InflightTable {
    next_id: u16,
    in_use: HashSet<u16>,
    entries: HashMap<u16, Entry>,
    on_finish: Option<FinishCallback>,
}

impl fmt::Debug for InflightTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InflightTable")
            .field("next_id", &self.next_id)
            .field("in_use", &self.in_use.len())
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl InflightTable {
    pub fn new() -> Self {
        Self { next_id: 1, ..Default::default() }
    }

    /// Install the completion callback.
    pub fn on_finish(&mut self, callback: FinishCallback) {
        self.on_finish = Some(callback);
    }

    /// Reserve the next free identifier, counting up from 1 and wrapping
    /// past 65535. Zero is never handed out.
    pub fn new_id(&mut self) -> Result<u16> {
        for _ in 0..u16::MAX {
            let id = self.next_id;
            self.next_id = match self.next_id.wrapping_add(1) {
                0 => 1,
                next => next,
            };
            if id != 0 && self.in_use.insert(id) {
                return Ok(id);
            }
        }
        Err(Error::PacketIdsExhausted)
    }

    /// Track `message` under `id` until `refs` acknowledgments arrive.
    pub fn register(&mut self, id: u16, message: Publish, refs: u32, context: Context) {
        let now = Instant::now();
        self.in_use.insert(id);
        self.entries.insert(
            id,
            Entry {
                message,
                refs: refs.max(1),
                context,
                created: now,
                updated: now,
            },
        );
    }

    /// Drop one reference. When the count reaches zero the completion
    /// callback fires and `id` becomes free again. Returns whether the entry
    /// completed.
    pub fn unref(&mut self, id: u16) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };

        entry.refs -= 1;
        entry.updated = Instant::now();
        if entry.refs > 0 {
            return false;
        }

        let Some(entry) = self.entries.remove(&id) else {
            return false;
        };
        self.in_use.remove(&id);

        tracing::trace!(
            "packet {} completed after {:?}",
            id,
            entry.updated.duration_since(entry.created)
        );
        match &self.on_finish {
            Some(callback) => callback(id, &entry.message, entry.context),
            None => {
                if let Context::Waiter(tx) = entry.context {
                    let _ = tx.send(());
                }
            }
        }
        true
    }

    /// Discard `id` without completing it. The identifier is freed.
    pub fn remove(&mut self, id: u16) -> Option<Publish> {
        self.in_use.remove(&id);
        self.entries.remove(&id).map(|entry| entry.message)
    }

    /// Discard every entry without completing any of them.
    pub fn clear(&mut self) {
        self.in_use.clear();
        self.entries.clear();
    }

    /// Message registered under `id`.
    pub fn get(&self, id: u16) -> Option<&Publish> {
        self.entries.get(&id).map(|entry| &entry.message)
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
