#![cfg(feature = "fjall")]

use cinder_storage::fjall::FjallStore;
use cinder_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn fjall_round_trip_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let store = FjallStore::open(dir.path()).expect("open");
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"best_chain".as_slice(), [7u8; 32]);
        batch.put(Column::TxIndex, [1u8; 32], b"entry".as_slice());
        store.write_batch(&batch).expect("commit");
        assert_eq!(
            store.get(Column::Meta, b"best_chain").expect("get"),
            Some(vec![7u8; 32])
        );
    }

    let store = FjallStore::open(dir.path()).expect("reopen");
    assert_eq!(
        store.get(Column::TxIndex, &[1u8; 32]).expect("get"),
        Some(b"entry".to_vec())
    );
}
