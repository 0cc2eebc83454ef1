//! Proptest strategies for store keys, values, and operation sequences.
//!
//! Keys come from a small alphabet so generated sequences revisit the same
//! keys often enough to exercise updates, deletes, and conditions.
//!
//! ```no_run
//! use proptest::prelude::*;
//! use strata_test_utils::strategies;
//!
//! proptest! {
//!     #[test]
//!     fn replay_matches(ops in strategies::arb_kv_ops(1..50)) {
//!         // apply `ops` to two stores and compare
//!     }
//! }
//! ```

use std::ops::Range;

use proptest::prelude::*;

/// One mutation request, independent of any store API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    /// Create an absent key.
    Insert {
        /// Raw key.
        key: Vec<u8>,
        /// New value.
        value: Vec<u8>,
    },
    /// Create or replace.
    Upsert {
        /// Raw key.
        key: Vec<u8>,
        /// New value.
        value: Vec<u8>,
    },
    /// Replace an existing key.
    Update {
        /// Raw key.
        key: Vec<u8>,
        /// New value.
        value: Vec<u8>,
    },
    /// Replace if `expected` sits at `offset` in the current value.
    ConditionalUpdate {
        /// Raw key.
        key: Vec<u8>,
        /// New value.
        value: Vec<u8>,
        /// Offset of the comparison.
        offset: u32,
        /// Bytes that must match.
        expected: Vec<u8>,
    },
    /// Overwrite part of an existing value.
    PartialUpdate {
        /// Raw key.
        key: Vec<u8>,
        /// Offset of the overwrite.
        offset: u32,
        /// Replacement bytes.
        bytes: Vec<u8>,
    },
    /// Remove an existing key.
    Delete {
        /// Raw key.
        key: Vec<u8>,
    },
    /// Remove if `expected` sits at `offset` in the current value.
    ConditionalDelete {
        /// Raw key.
        key: Vec<u8>,
        /// Offset of the comparison.
        offset: u32,
        /// Bytes that must match.
        expected: Vec<u8>,
    },
    /// Remove everything.
    Erase,
}

/// Key of 1-2 bytes drawn from eight symbols.
pub fn arb_key() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(b'a'..b'i', 1..3)
}

/// Arbitrary key of 1-64 bytes, for ordering properties.
pub fn arb_wide_key() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 1..64)
}

/// Value of 0-15 bytes from a four-symbol alphabet, so conditions match
/// reasonably often.
pub fn arb_value() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(b'0'..b'4', 0..16)
}

fn arb_offset() -> impl Strategy<Value = u32> {
    0u32..8
}

/// Any single operation; erase is rare.
pub fn arb_kv_op() -> impl Strategy<Value = KvOp> {
    prop_oneof![
        4 => (arb_key(), arb_value()).prop_map(|(key, value)| KvOp::Insert { key, value }),
        4 => (arb_key(), arb_value()).prop_map(|(key, value)| KvOp::Upsert { key, value }),
        3 => (arb_key(), arb_value()).prop_map(|(key, value)| KvOp::Update { key, value }),
        3 => (arb_key(), arb_value(), arb_offset(), proptest::collection::vec(b'0'..b'4', 0..3))
            .prop_map(|(key, value, offset, expected)| KvOp::ConditionalUpdate {
                key,
                value,
                offset,
                expected,
            }),
        2 => (arb_key(), arb_offset(), proptest::collection::vec(b'0'..b'4', 0..4))
            .prop_map(|(key, offset, bytes)| KvOp::PartialUpdate { key, offset, bytes }),
        3 => arb_key().prop_map(|key| KvOp::Delete { key }),
        2 => (arb_key(), arb_offset(), proptest::collection::vec(b'0'..b'4', 0..3))
            .prop_map(|(key, offset, expected)| KvOp::ConditionalDelete { key, offset, expected }),
        1 => Just(KvOp::Erase),
    ]
}

/// A sequence of operations with its length drawn from `len`.
pub fn arb_kv_ops(len: Range<usize>) -> impl Strategy<Value = Vec<KvOp>> {
    proptest::collection::vec(arb_kv_op(), len)
}
