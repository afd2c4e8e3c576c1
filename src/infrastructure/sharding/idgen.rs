//! Snowflake-style notification id generator.
//!
//! Layout (low to high): 12-bit sequence | 10-bit hash segment | 41-bit
//! millisecond timestamp. The hash segment carries shard placement, so an id
//! alone is enough to find its row.

use std::sync::Mutex;

use super::hash::hash_biz_key;
use crate::redis::current_time_ms;

pub const TIMESTAMP_BITS: u32 = 41;
pub const HASH_BITS: u32 = 10;
pub const SEQUENCE_BITS: u32 = 12;

const HASH_SHIFT: u32 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + HASH_BITS;

const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const HASH_MASK: u64 = (1 << HASH_BITS) - 1;
const TIMESTAMP_MASK: u64 = (1 << TIMESTAMP_BITS) - 1;

/// Custom epoch: 2024-01-01T00:00:00Z. Keeps 41 bits of millis good for
/// roughly 69 years.
const EPOCH_MS: i64 = 1_704_067_200_000;

/// The 10-bit segment both the generator and the sharding strategy use.
pub fn hash_segment(biz_id: i64, key: &str) -> u64 {
    hash_biz_key(biz_id, key) & HASH_MASK
}

/// Recover the hash segment from a generated id.
pub fn extract_hash_segment(id: i64) -> u64 {
    ((id as u64) >> HASH_SHIFT) & HASH_MASK
}

#[derive(Debug)]
pub struct IdGenerator {
    state: Mutex<GeneratorState>,
}

#[derive(Debug)]
struct GeneratorState {
    last_ms: i64,
    sequence: u64,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GeneratorState {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    /// Generate an id for a tenant-scoped key. Unique within this process;
    /// cross-process uniqueness comes from the `(biz_id, key)` unique index
    /// at insert time.
    pub fn generate(&self, biz_id: i64, key: &str) -> i64 {
        let segment = hash_segment(biz_id, key);
        let mut state = self.state.lock().expect("id generator mutex poisoned");

        let mut now = current_time_ms() - EPOCH_MS;
        if now < state.last_ms {
            // Clock went backwards; stay on the last timestamp and burn
            // sequence numbers until real time catches up.
            now = state.last_ms;
        }
        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                now += 1;
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        let id = (((now as u64) & TIMESTAMP_MASK) << TIMESTAMP_SHIFT)
            | (segment << HASH_SHIFT)
            | state.sequence;
        id as i64
    }
}
