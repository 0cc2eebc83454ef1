//! strata-store: a transactional ordered key-value store for replicated
//! state machines.
//!
//! Every mutation carries a caller-assigned sequence number and yields a
//! redo record (to replay it on another replica) and an undo record (to
//! reverse it locally). The replication layer drives durability through
//! checkpoints and bootstraps new replicas with copy streams.
//!
//! - **Ordered**: keys sort by a comparator chosen at open time
//! - **Snapshot reads**: readers and scans see one committed version, never
//!   a half-applied mutation
//! - **Optimistic writers**: mutations compute off to the side and publish
//!   with a single compare-and-swap
//! - **Dual-slot checkpoints**: a manifest names the current image; a crash
//!   mid-checkpoint leaves the previous one in force
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │         Store / TypedStore API               │
//! │  (insert, update, delete, seek, replay)     │
//! └───────┬───────────────┬─────────────┬───────┘
//!         │               │             │
//! ┌───────▼──────┐ ┌──────▼─────┐ ┌─────▼───────┐
//! │     Scan     │ │ Checkpoint │ │    Copy     │
//! │  (cursors)   │ │ (durable)  │ │  (stream)   │
//! └───────┬──────┘ └──────┬─────┘ └─────┬───────┘
//!         │               │             │
//! ┌───────▼───────────────▼─────────────▼───────┐
//! │       Persistent B+ tree index              │
//! │   (path copying, comparator sort keys)      │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │            Storage Backend                   │
//! │      (FileBackend / InMemoryBackend)        │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use strata_store::Store;
//! use strata_types::{StorageConfig, StoreConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> strata_store::Result<()> {
//! let config = StoreConfig { storage: StorageConfig::volatile(), ..StoreConfig::default() };
//! let store = Store::open(config, false).await?;
//! let cancel = CancellationToken::new();
//!
//! let records = store.insert(b"a", &[1], 1, &cancel).await?;
//! let (prior, _) = store.upsert(b"a", &[2], 2, &cancel).await?;
//! assert_eq!(prior.as_deref(), Some(&[1u8][..]));
//!
//! // Ship `records.redo` to a follower, which replays it with
//! // `apply_with_output`.
//! # let _ = records;
//! store.close(false).await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![cfg_attr(test, allow(clippy::field_reassign_with_default))]

pub mod backend;
mod checkpoint;
pub mod comparator;
mod copy;
pub mod error;
pub mod index;
pub mod metrics;
pub mod operation;
mod scan;
mod store;
mod typed;
pub mod types;

pub use backend::{CommitSlot, FileBackend, InMemoryBackend, Manifest, StorageBackend};
pub use comparator::KeyComparator;
pub use copy::CopyStream;
pub use error::{Error, Result, SequenceNumber};
pub use operation::{Operation, OperationType, RedoUndo};
pub use scan::{Scan, ScanPosition};
pub use store::{Lifecycle, Store, StoreStats};
pub use typed::TypedStore;
pub use types::{Key, Value};
