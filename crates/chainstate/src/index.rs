//! In-memory block index: an arena of entries linked by slot numbers.
//!
//! `prev` follows the parent relation for every known block; `next` is set
//! only along the main chain and flipped after a successful store commit.

use std::collections::HashMap;

use cinder_consensus::Hash256;
use cinder_pow::difficulty::{BlockAncestry, TargetInfo};
use primitive_types::U256;

use crate::blockindex::BlockIndexRecord;

const MEDIAN_TIME_SPAN: usize = 11;

#[derive(Clone, Debug)]
pub struct IndexEntry {
    pub hash: Hash256,
    pub prev: Option<u32>,
    pub next: Option<u32>,
    pub record: BlockIndexRecord,
}

impl IndexEntry {
    pub fn chain_trust(&self) -> U256 {
        U256::from_little_endian(&self.record.chain_trust)
    }
}

#[derive(Default)]
pub struct ChainIndex {
    entries: Vec<IndexEntry>,
    by_hash: HashMap<Hash256, u32>,
    by_file_pos: HashMap<(u32, u64), u32>,
    genesis: Option<u32>,
    best: Option<u32>,
}

impl ChainIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, slot: u32) -> &IndexEntry {
        &self.entries[slot as usize]
    }

    pub fn entry_mut(&mut self, slot: u32) -> &mut IndexEntry {
        &mut self.entries[slot as usize]
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<u32> {
        self.by_hash.get(hash).copied()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn slot_by_file_pos(&self, file: u32, offset: u64) -> Option<u32> {
        self.by_file_pos.get(&(file, offset)).copied()
    }

    pub fn genesis(&self) -> Option<u32> {
        self.genesis
    }

    pub fn best(&self) -> Option<u32> {
        self.best
    }

    pub fn set_best(&mut self, slot: Option<u32>) {
        self.best = slot;
    }

    pub fn best_trust(&self) -> U256 {
        self.best
            .map(|slot| self.entry(slot).chain_trust())
            .unwrap_or_default()
    }

    pub fn best_height(&self) -> i64 {
        self.best.map(|slot| self.entry(slot).record.height).unwrap_or(-1)
    }

    pub fn parent(&self, slot: u32) -> Option<u32> {
        self.entry(slot).prev
    }

    /// Inserts an entry, wiring `prev` by the header's parent hash. The
    /// caller is responsible for height and trust being already computed.
    pub fn insert(&mut self, hash: Hash256, record: BlockIndexRecord) -> u32 {
        let prev = self.by_hash.get(&record.header.prev_block).copied();
        let slot = self.entries.len() as u32;
        self.by_hash.insert(hash, slot);
        self.by_file_pos
            .insert((record.pos.file, record.pos.offset), slot);
        if record.height == 0 {
            self.genesis = Some(slot);
        }
        self.entries.push(IndexEntry {
            hash,
            prev,
            next: None,
            record,
        });
        slot
    }

    /// The main-chain entry at `height`, walked back from the best tip.
    pub fn main_ancestor_at(&self, height: i64) -> Option<u32> {
        let mut cursor = self.best?;
        if height < 0 || height > self.entry(cursor).record.height {
            return None;
        }
        while self.entry(cursor).record.height > height {
            cursor = self.parent(cursor)?;
        }
        Some(cursor)
    }

    pub fn is_main_chain(&self, slot: u32) -> bool {
        self.main_ancestor_at(self.entry(slot).record.height) == Some(slot)
    }

    /// Median of the last 11 block times ending at `slot`.
    pub fn median_time_past(&self, slot: u32) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = Some(slot);
        while let Some(current) = cursor {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            times.push(self.entry(current).record.header.time as i64);
            cursor = self.parent(current);
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Number of PoW blocks strictly between main-chain heights
    /// `start_height` and `end_height`.
    pub fn pow_blocks_between(&self, start_height: i64, end_height: i64) -> i64 {
        if start_height >= end_height || start_height < 0 || end_height < 0 {
            return 0;
        }
        let Some(end) = self.main_ancestor_at(end_height) else {
            return 0;
        };
        let mut between = 0i64;
        let mut cursor = end;
        loop {
            let Some(prev) = self.parent(cursor) else {
                return 0;
            };
            if self.entry(prev).record.height <= start_height {
                break;
            }
            if self.entry(cursor).record.kind.is_work() {
                between += 1;
            }
            cursor = prev;
        }
        between
    }

    /// Lowest common ancestor of two entries.
    pub fn fork_point(&self, a: u32, b: u32) -> Option<u32> {
        let mut left = a;
        let mut right = b;
        while left != right {
            while self.entry(right).record.height > self.entry(left).record.height {
                right = self.parent(right)?;
            }
            if left == right {
                break;
            }
            left = self.parent(left)?;
        }
        Some(left)
    }
}

impl BlockAncestry for ChainIndex {
    type Id = u32;

    fn info(&self, id: u32) -> TargetInfo {
        let entry = self.entry(id);
        TargetInfo {
            height: entry.record.height,
            time: entry.record.header.time,
            bits: entry.record.header.bits,
            burn_bits: entry.record.header.burn_bits,
            kind: entry.record.kind,
            effective_burn_coins: entry.record.effective_burn_coins,
        }
    }

    fn parent(&self, id: u32) -> Option<u32> {
        self.entry(id).prev
    }
}
