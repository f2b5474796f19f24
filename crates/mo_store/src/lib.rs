//! The node-local entry store of the mosaic cache.
//!
//! One [`EntryStore`] exists per cache type per node. It owns the payload
//! bytes, keeps the sum of entry sizes under a configured byte budget by
//! evicting least-recently-used entries, answers cover queries through the
//! shared planner in [`mo_cube`], and accumulates the per-entry access deltas
//! the coordinator periodically collects.
//!
//! Locking follows the shape described in the concurrency model: lookups take
//! a fine-grained lock per semantic-id bucket; only capacity accounting and
//! eviction serialize on a store-wide ledger lock. No path ever acquires the
//! ledger while holding a bucket, so the two layers cannot deadlock.

mod store;

pub use self::store::{Entry, EntryStore, StatsDelta, StoreConfig, StoreError};
