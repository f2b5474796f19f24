use mo_cube::CacheCube;

use crate::{AccessStats, CacheType, CostProfile, EntryId, SemanticId};

/// Everything known about a cache entry except its payload bytes.
///
/// This is what travels in handshakes, move transfers and the coordinator's
/// index; the payload itself only ever crosses the wire through the delivery
/// service.
#[derive(Clone, Debug, PartialEq)]
pub struct EntryInfo {
    /// Serialized size of the payload; the unit of capacity accounting.
    pub byte_size: u64,
    pub cube: CacheCube,
    pub cost: CostProfile,
    pub access: AccessStats,
}

impl EntryInfo {
    pub fn new(byte_size: u64, cube: CacheCube, cost: CostProfile) -> Self {
        Self {
            byte_size,
            cube,
            cost,
            access: AccessStats::fresh(),
        }
    }
}

impl std::fmt::Display for EntryInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} bytes, {}, accessed {}× (last {})",
            self.byte_size, self.cube, self.access.access_count, self.access.last_access
        )
    }
}

/// One entry of a node's store, as announced in the warm-start handshake.
#[derive(Clone, Debug, PartialEq)]
pub struct EntrySnapshot {
    pub cache_type: CacheType,
    pub semantic_id: SemanticId,
    pub entry_id: EntryId,
    pub info: EntryInfo,
}
