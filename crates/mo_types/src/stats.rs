use std::time::{SystemTime, UNIX_EPOCH};

use crate::{CacheType, EntryId, EntrySnapshot, SemanticId, TypedKey};

/// Milliseconds since the unix epoch; the clock all access stats use.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Read statistics of a single entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessStats {
    /// Milliseconds since epoch of the last successful read.
    pub last_access: u64,
    pub access_count: u32,
}

impl AccessStats {
    /// Stats of a just-inserted entry: the insert counts as the first access.
    pub fn fresh() -> Self {
        Self {
            last_access: now_millis(),
            access_count: 1,
        }
    }

    pub fn touch(&mut self) {
        self.last_access = now_millis();
        self.access_count = self.access_count.saturating_add(1);
    }
}

// ---

/// Byte usage of one typed store on one node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreUsage {
    pub used: u64,
    pub capacity: u64,
}

impl StoreUsage {
    pub fn ratio(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.used as f64 / self.capacity as f64
        }
    }
}

/// Per-store lookup counters, periodically shipped to the coordinator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryStats {
    /// Queries answered by a single stored entry.
    pub single_hits: u32,
    /// Queries answered by puzzling several stored entries, no remainder.
    pub multi_hits: u32,
    /// Puzzles that still needed producing a remainder.
    pub partials: u32,
    pub misses: u32,
    /// Payload bytes served from this store.
    pub result_bytes: u64,
}

impl std::ops::AddAssign for QueryStats {
    fn add_assign(&mut self, rhs: Self) {
        self.single_hits += rhs.single_hits;
        self.multi_hits += rhs.multi_hits;
        self.partials += rhs.partials;
        self.misses += rhs.misses;
        self.result_bytes += rhs.result_bytes;
    }
}

impl std::fmt::Display for QueryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "hits: {} single / {} multi, partials: {}, misses: {}, served: {} bytes",
            self.single_hits, self.multi_hits, self.partials, self.misses, self.result_bytes
        )
    }
}

// ---

/// Access-stat changes of one entry since the previous stats report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryAccessDelta {
    pub cache_type: CacheType,
    pub semantic_id: SemanticId,
    pub entry_id: EntryId,
    pub last_access: u64,
    pub access_count: u32,
}

/// A node's answer to `STATS_REQUEST`.
///
/// Everything is a delta against the previous report except `usage`, which is
/// absolute. `removed` confirms entries the node evicted on its own to honor
/// its byte budget; the coordinator drops the matching index entries, which
/// is the reconciliation path keeping the index eventually consistent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeStats {
    pub usage: Vec<(CacheType, StoreUsage)>,
    pub query: QueryStats,
    pub access: Vec<EntryAccessDelta>,
    pub removed: Vec<TypedKey>,
}

/// What a node tells the coordinator when its control connection opens.
///
/// Carrying the surviving entries makes coordinator restarts cheap: the whole
/// index is rebuilt from handshakes, nothing is persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeHandshake {
    /// Port of the node's delivery service, on the same host as the control
    /// connection.
    pub delivery_port: u16,
    /// Byte budget per cache type.
    pub capacities: Vec<(CacheType, u64)>,
    pub entries: Vec<EntrySnapshot>,
}
