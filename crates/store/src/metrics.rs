//! Store metrics emitted through the `metrics` crate facade.
//!
//! ## Metric Naming Conventions
//!
//! All metrics follow the pattern: `strata_{name}_{unit}`
//!
//! - Counters: `_total` suffix
//! - Histograms: `_seconds` suffix
//! - Gauges: no suffix
//!
//! Nothing is recorded unless the embedding process installs a recorder.

use metrics::{counter, gauge, histogram};
use uuid::Uuid;

// =============================================================================
// Metric Names (constants for consistency)
// =============================================================================

const OPERATIONS_TOTAL: &str = "strata_operations_total";
const OPERATION_LATENCY: &str = "strata_operation_latency_seconds";
const WRITE_CONFLICTS_TOTAL: &str = "strata_write_conflicts_total";

const CHECKPOINTS_TOTAL: &str = "strata_checkpoints_total";
const CHECKPOINT_DURATION: &str = "strata_checkpoint_duration_seconds";

const COPY_CHUNKS_TOTAL: &str = "strata_copy_chunks_total";

const RECORDS: &str = "strata_records";
const MEMORY_BYTES: &str = "strata_memory_bytes";

// =============================================================================
// Operations
// =============================================================================

/// Records one store operation.
///
/// `strata_operations_total{op, status}` and
/// `strata_operation_latency_seconds{op}`.
#[inline]
pub fn record_operation(op: &'static str, success: bool, latency_secs: f64) {
    let status = if success { "success" } else { "error" };
    counter!(OPERATIONS_TOTAL, "op" => op, "status" => status).increment(1);
    histogram!(OPERATION_LATENCY, "op" => op).record(latency_secs);
}

/// Records a lost compare-and-swap on the committed state.
#[inline]
pub fn record_write_conflict() {
    counter!(WRITE_CONFLICTS_TOTAL).increment(1);
}

// =============================================================================
// Checkpoints
// =============================================================================

/// Records a checkpoint attempt and its duration.
#[inline]
pub fn record_checkpoint(success: bool, duration_secs: f64) {
    let status = if success { "success" } else { "error" };
    counter!(CHECKPOINTS_TOTAL, "status" => status).increment(1);
    histogram!(CHECKPOINT_DURATION).record(duration_secs);
}

// =============================================================================
// Copy
// =============================================================================

/// Records a copy chunk produced (`"out"`) or applied (`"in"`).
#[inline]
pub fn record_copy_chunk(direction: &'static str) {
    counter!(COPY_CHUNKS_TOTAL, "direction" => direction).increment(1);
}

// =============================================================================
// Size gauges
// =============================================================================

/// Updates the record count and memory footprint gauges of one replica.
///
/// `strata_records{partition_id, replica_id}` and
/// `strata_memory_bytes{partition_id, replica_id}`.
#[inline]
pub fn set_store_size(partition_id: Uuid, replica_id: u64, records: usize, memory_bytes: usize) {
    let partition = partition_id.to_string();
    let replica = replica_id.to_string();
    gauge!(RECORDS, "partition_id" => partition.clone(), "replica_id" => replica.clone())
        .set(records as f64);
    gauge!(MEMORY_BYTES, "partition_id" => partition, "replica_id" => replica)
        .set(memory_bytes as f64);
}
