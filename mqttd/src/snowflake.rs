//! Snowflake-style connection ID generator.
//!
//! Layout, high to low: 41 bits of milliseconds since [`EPOCH_MS`], 5 bits
//! of work group, 5 bits of worker, 12 bits of per-millisecond sequence.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// 2020-01-01T00:00:00Z in Unix milliseconds.
pub const EPOCH_MS: u64 = 1_577_836_800_000;

const SEQUENCE_BITS: u32 = 12;
const WORKER_BITS: u32 = 5;
const GROUP_BITS: u32 = 5;

const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;
/// Largest accepted worker or group identifier.
pub const MAX_WORKER_ID: u8 = (1 << WORKER_BITS) - 1;

const WORKER_SHIFT: u32 = SEQUENCE_BITS;
const GROUP_SHIFT: u32 = SEQUENCE_BITS + WORKER_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + WORKER_BITS + GROUP_BITS;

#[derive(Debug, Default)]
struct State {
    last_ms: u64,
    sequence: u64,
}

/// Unique, roughly time-ordered 64-bit ID generator.
#[derive(Debug)]
pub struct Snowflake {
    node: u64,
    state: Mutex<State>,
}

impl Snowflake {
    /// Create a generator for `(work_group_id, work_id)`, both in `0..=31`.
    pub fn new(work_group_id: u8, work_id: u8) -> Result<Self> {
        if work_group_id > MAX_WORKER_ID || work_id > MAX_WORKER_ID {
            return Err(Error::InvalidConfig(format!(
                "work_group_id {work_group_id} / work_id {work_id} out of range 0..={MAX_WORKER_ID}"
            )));
        }

        Ok(Self {
            node: (u64::from(work_group_id) << GROUP_SHIFT) | (u64::from(work_id) << WORKER_SHIFT),
            state: Mutex::new(State::default()),
        })
    }

    /// Next ID. Strictly increasing for one generator, even if the wall
    /// clock steps backwards or a millisecond's sequence runs out.
    pub fn next_id(&self) -> u64 {
        let mut state = self.state.lock();
        let now = current_ms();

        if now > state.last_ms {
            state.last_ms = now;
            state.sequence = 0;
        } else {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                state.last_ms += 1;
            }
        }

        (state.last_ms << TIMESTAMP_SHIFT) | self.node | state.sequence
    }
}

fn current_ms() -> u64 {
    let unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(EPOCH_MS);
    unix_ms.saturating_sub(EPOCH_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_ids_increase_and_carry_node_bits() {
        let generator = Snowflake::new(3, 17).unwrap();
        let mut last = 0;
        for _ in 0..10_000 {
            let id = generator.next_id();
            assert!(id > last);
            assert_eq!((id >> GROUP_SHIFT) & 0x1F, 3);
            assert_eq!((id >> WORKER_SHIFT) & 0x1F, 17);
            last = id;
        }
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let generator = Arc::new(Snowflake::new(0, 0).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let generator = generator.clone();
                std::thread::spawn(move || (0..5000).map(|_| generator.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let ids: HashSet<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), 20_000);
    }

    #[test]
    fn test_rejects_out_of_range_node() {
        assert!(Snowflake::new(32, 0).is_err());
        assert!(Snowflake::new(0, 32).is_err());
        assert!(Snowflake::new(31, 31).is_ok());
    }
}
