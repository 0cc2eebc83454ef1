//! Property tests over generated operation sequences, checked against a
//! `BTreeMap` reference.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::collections::BTreeSet;

use bytes::Bytes;
use common::{Model, apply, dump, outcome};
use proptest::prelude::*;
use strata_store::Store;
use strata_test_utils::{SMALL_COPY_CHUNK, strategies, test_store_config};
use strata_types::StoreConfig;
use tokio_util::sync::CancellationToken;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

async fn open() -> Store {
    Store::open(test_store_config(), false).await.unwrap()
}

/// Scan bound: absent, or a short key.
fn arb_bound() -> impl Strategy<Value = Option<Vec<u8>>> {
    prop::option::of(prop::collection::vec(any::<u8>(), 1..3))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any inserted value reads back unchanged.
    #[test]
    fn prop_insert_then_seek(
        entries in prop::collection::btree_map(strategies::arb_wide_key(), strategies::arb_value(), 1..64)
    ) {
        runtime().block_on(async {
            let store = open().await;
            let cancel = CancellationToken::new();
            for (i, (key, value)) in entries.iter().enumerate() {
                store.insert(key, value, i as u64 + 1, &cancel).await.unwrap();
            }
            for (key, value) in &entries {
                let found = store.seek(key, &cancel).await.unwrap();
                prop_assert_eq!(found.as_ref(), value.as_slice());
            }
            Ok(())
        })?;
    }

    /// Every operation, conditional ones included, agrees with the
    /// reference on whether it applied and on the resulting contents.
    #[test]
    fn prop_operations_match_reference(ops in strategies::arb_kv_ops(1..80)) {
        runtime().block_on(async {
            let store = open().await;
            let mut model = Model::default();
            for (i, op) in ops.iter().enumerate() {
                let result = apply(&store, op, i as u64 + 1).await;
                prop_assert_eq!(outcome(&result), model.apply(op), "op {} = {:?}", i, op);
            }
            prop_assert_eq!(dump(&store).await, model.snapshot());
            prop_assert_eq!(store.statistics().unwrap().record_count, model.entries.len() as u64);
            Ok(())
        })?;
    }

    /// Scans yield strictly increasing keys, exactly those inside
    /// `(begin, end]` that carry the prefix.
    #[test]
    fn prop_scan_order_and_bounds(
        keys in prop::collection::vec(strategies::arb_wide_key(), 0..80),
        begin in arb_bound(),
        end in arb_bound(),
        prefix in prop::option::of(prop::collection::vec(any::<u8>(), 1..2)),
    ) {
        runtime().block_on(async {
            let store = open().await;
            let cancel = CancellationToken::new();
            let mut sequence = 0;
            for key in &keys {
                sequence += 1;
                store.upsert(key, b"", sequence, &cancel).await.unwrap();
            }

            let scan = store.create_scan().unwrap();
            scan.open(begin.as_deref(), end.as_deref(), prefix.as_deref(), false, &cancel)
                .await
                .unwrap();
            let mut seen = Vec::new();
            while let Some(position) = scan.move_next(&cancel).await.unwrap() {
                prop_assert!(position.value.is_none());
                seen.push(position.key.to_vec());
            }

            prop_assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
            let expected: Vec<Vec<u8>> = keys
                .iter()
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .filter(|k| begin.as_ref().is_none_or(|b| k > b))
                .filter(|k| end.as_ref().is_none_or(|e| k <= e))
                .filter(|k| prefix.as_ref().is_none_or(|p| k.starts_with(p)))
                .collect();
            prop_assert_eq!(seen, expected);
            Ok(())
        })?;
    }

    /// Replaying the redo stream on a fresh store reproduces the primary.
    #[test]
    fn prop_redo_replay_reproduces_state(ops in strategies::arb_kv_ops(1..60)) {
        runtime().block_on(async {
            let primary = open().await;
            let secondary = open().await;
            let cancel = CancellationToken::new();
            for (i, op) in ops.iter().enumerate() {
                let sequence = i as u64 + 1;
                if let Ok(Some(records)) = apply(&primary, op, sequence).await {
                    secondary.apply_with_output(sequence, &records.redo, false, &cancel).await.unwrap();
                    prop_assert_eq!(dump(&secondary).await, dump(&primary).await);
                }
            }
            Ok(())
        })?;
    }

    /// A copy stream at the last sequence number reproduces every key.
    #[test]
    fn prop_copy_reproduces_state(ops in strategies::arb_kv_ops(1..60)) {
        runtime().block_on(async {
            let config = StoreConfig { copy_chunk_size_bytes: SMALL_COPY_CHUNK, ..test_store_config() };
            let source = Store::open(config, false).await.unwrap();
            let cancel = CancellationToken::new();
            for (i, op) in ops.iter().enumerate() {
                let _ = apply(&source, op, i as u64 + 1).await;
            }

            let up_to = source.last_committed_sequence_number().unwrap();
            let target = open().await;
            for chunk in source.get_copy_state(up_to).unwrap() {
                target.apply_copy_data(&chunk.unwrap(), &cancel).await.unwrap();
            }
            let copied: Vec<(Bytes, Bytes)> = dump(&target).await;
            prop_assert_eq!(copied, dump(&source).await);
            prop_assert_eq!(target.last_committed_sequence_number().unwrap(), up_to);
            Ok(())
        })?;
    }
}
