//! Placement of notification rows across `(database, table)` shards.
//!
//! Acceptance hashes `(biz_id, key)` into a 10-bit segment that is also
//! embedded in the generated notification id, so a later lookup by id lands
//! on the same shard without re-reading the key.

mod hash;
mod idgen;

pub use hash::hash_biz_key;
pub use idgen::{IdGenerator, HASH_BITS, SEQUENCE_BITS, TIMESTAMP_BITS};

/// A concrete `(database, table)` destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardDst {
    pub db_suffix: u32,
    pub table_suffix: u32,
    pub db: String,
    pub table: String,
}

#[derive(Debug, Clone)]
pub struct ShardingStrategy {
    db_prefix: String,
    table_prefix: String,
    db_count: u32,
    table_count: u32,
}

impl ShardingStrategy {
    pub fn new(db_prefix: &str, table_prefix: &str, db_count: u32, table_count: u32) -> Self {
        assert!(db_count >= 1 && table_count >= 1);
        Self {
            db_prefix: db_prefix.to_string(),
            table_prefix: table_prefix.to_string(),
            db_count,
            table_count,
        }
    }

    fn dst(&self, hash_segment: u64) -> ShardDst {
        let db_suffix = (hash_segment % self.db_count as u64) as u32;
        let table_suffix = ((hash_segment / self.db_count as u64) % self.table_count as u64) as u32;
        ShardDst {
            db_suffix,
            table_suffix,
            db: format!("{}_{}", self.db_prefix, db_suffix),
            table: format!("{}_{}", self.table_prefix, table_suffix),
        }
    }

    /// Destination for a tenant-scoped key. Uses the same 10-bit hash
    /// segment that `IdGenerator` embeds, so both paths agree on placement.
    pub fn shard(&self, biz_id: i64, key: &str) -> ShardDst {
        self.dst(idgen::hash_segment(biz_id, key))
    }

    /// Destination for an already-generated notification id.
    pub fn shard_with_id(&self, id: i64) -> ShardDst {
        self.dst(idgen::extract_hash_segment(id))
    }

    /// Every `(db, table)` pair, in deterministic order. The scheduler walks
    /// this to contend for shard locks.
    pub fn broadcast(&self) -> Vec<ShardDst> {
        let mut dsts = Vec::with_capacity((self.db_count * self.table_count) as usize);
        for db in 0..self.db_count {
            for table in 0..self.table_count {
                dsts.push(ShardDst {
                    db_suffix: db,
                    table_suffix: table,
                    db: format!("{}_{}", self.db_prefix, db),
                    table: format!("{}_{}", self.table_prefix, table),
                });
            }
        }
        dsts
    }

    pub fn db_count(&self) -> u32 {
        self.db_count
    }

    pub fn table_count(&self) -> u32 {
        self.table_count
    }

    pub fn table_prefix(&self) -> &str {
        &self.table_prefix
    }
}
