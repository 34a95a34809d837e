//! Transaction index entries with one spend slot per output.

use std::collections::{HashMap, HashSet};

use cinder_consensus::Hash256;
use cinder_primitives::encoding::{CodecError, Reader, Writer};
use cinder_storage::{Column, KeyValueStore, StoreError, WriteBatch};

/// Location of a transaction: its block's file position plus the index of
/// the transaction within the block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxPos {
    pub file: u32,
    pub offset: u64,
    pub index: u32,
}

impl TxPos {
    /// Sentinel for transactions that only exist in the memory pool.
    pub fn mempool() -> Self {
        Self {
            file: u32::MAX,
            offset: u64::MAX,
            index: u32::MAX,
        }
    }

    pub fn is_mempool(&self) -> bool {
        *self == Self::mempool()
    }

    fn encode_into(&self, writer: &mut Writer) {
        writer.put_u32(self.file);
        writer.put_u64(self.offset);
        writer.put_u32(self.index);
    }

    fn decode_from(reader: &mut Reader) -> Result<Self, CodecError> {
        Ok(Self {
            file: reader.u32()?,
            offset: reader.u64()?,
            index: reader.u32()?,
        })
    }
}

/// Where a transaction lives and, per output, the position of the spending
/// transaction when the spend is in the main chain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIndexEntry {
    pub pos: TxPos,
    pub spent: Vec<Option<TxPos>>,
}

impl TxIndexEntry {
    pub fn new(pos: TxPos, outputs: usize) -> Self {
        Self {
            pos,
            spent: vec![None; outputs],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(16 + self.spent.len() * 17);
        self.pos.encode_into(&mut writer);
        writer.put_compact_size(self.spent.len() as u64);
        for slot in &self.spent {
            match slot {
                Some(pos) => {
                    writer.put_u8(1);
                    pos.encode_into(&mut writer);
                }
                None => writer.put_u8(0),
            }
        }
        writer.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(bytes);
        let pos = TxPos::decode_from(&mut reader)?;
        let count = reader.compact_size()?;
        let count = usize::try_from(count).map_err(|_| CodecError::OversizedCount)?;
        let mut spent = Vec::with_capacity(count);
        for _ in 0..count {
            match reader.u8()? {
                0 => spent.push(None),
                1 => spent.push(Some(TxPos::decode_from(&mut reader)?)),
                _ => return Err(CodecError::Invalid("invalid spend slot marker")),
            }
        }
        if !reader.is_empty() {
            return Err(CodecError::TrailingBytes);
        }
        Ok(Self { pos, spent })
    }
}

pub fn read_tx_index(
    store: &dyn KeyValueStore,
    txid: &Hash256,
) -> Result<Option<TxIndexEntry>, StoreError> {
    let Some(bytes) = store.get(Column::TxIndex, txid)? else {
        return Ok(None);
    };
    TxIndexEntry::decode(&bytes)
        .map(Some)
        .map_err(|_| StoreError::Corrupt("invalid tx index entry"))
}

/// Pending tx-index changes for one store transaction: reads see staged
/// writes and erasures before the backing store, and everything lands in a
/// single batch on commit.
#[derive(Default)]
pub struct TxIndexOverlay {
    pending: HashMap<Hash256, TxIndexEntry>,
    erased: HashSet<Hash256>,
}

impl TxIndexOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(
        &self,
        store: &dyn KeyValueStore,
        txid: &Hash256,
    ) -> Result<Option<TxIndexEntry>, StoreError> {
        if let Some(entry) = self.pending.get(txid) {
            return Ok(Some(entry.clone()));
        }
        if self.erased.contains(txid) {
            return Ok(None);
        }
        read_tx_index(store, txid)
    }

    pub fn contains(&self, store: &dyn KeyValueStore, txid: &Hash256) -> Result<bool, StoreError> {
        Ok(self.get(store, txid)?.is_some())
    }

    pub fn put(&mut self, txid: Hash256, entry: TxIndexEntry) {
        self.erased.remove(&txid);
        self.pending.insert(txid, entry);
    }

    pub fn erase(&mut self, txid: Hash256) {
        self.pending.remove(&txid);
        self.erased.insert(txid);
    }

    pub fn flush_into(&self, batch: &mut WriteBatch) {
        for txid in &self.erased {
            batch.delete(Column::TxIndex, txid);
        }
        for (txid, entry) in &self.pending {
            batch.put(Column::TxIndex, txid, entry.encode());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_storage::memory::MemoryStore;

    fn pos(file: u32, offset: u64, index: u32) -> TxPos {
        TxPos {
            file,
            offset,
            index,
        }
    }

    #[test]
    fn entry_round_trips() {
        let mut entry = TxIndexEntry::new(pos(1, 2048, 3), 4);
        entry.spent[1] = Some(pos(2, 100, 0));
        let decoded = TxIndexEntry::decode(&entry.encode()).expect("decode");
        assert_eq!(decoded, entry);
    }

    #[test]
    fn mempool_sentinel_is_distinct() {
        assert!(TxPos::mempool().is_mempool());
        assert!(!pos(0, 0, 0).is_mempool());
    }

    #[test]
    fn overlay_masks_the_store() {
        let store = MemoryStore::new();
        let txid = [7u8; 32];
        let stored = TxIndexEntry::new(pos(0, 0, 1), 2);
        store
            .put(Column::TxIndex, &txid, &stored.encode())
            .expect("put");

        let mut overlay = TxIndexOverlay::new();
        assert_eq!(overlay.get(&store, &txid).expect("get"), Some(stored));

        let staged = TxIndexEntry::new(pos(3, 3, 3), 1);
        overlay.put(txid, staged.clone());
        assert_eq!(overlay.get(&store, &txid).expect("get"), Some(staged));

        overlay.erase(txid);
        assert_eq!(overlay.get(&store, &txid).expect("get"), None);

        // The store is untouched until a flush commits.
        assert!(read_tx_index(&store, &txid).expect("read").is_some());

        let mut batch = WriteBatch::new();
        overlay.flush_into(&mut batch);
        store.write_batch(&batch).expect("commit");
        assert!(read_tx_index(&store, &txid).expect("read").is_none());
    }
}
