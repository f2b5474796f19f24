use std::cmp::Ordering;

use mo_types::now_millis;

use crate::{IndexEntry, IndexError};

/// Total order over index entries, most valuable first.
///
/// The reorg planner evicts from the low end of this order whenever the
/// cluster is over its target usage.
pub trait RelevanceFunction: Send {
    /// Called once per reorg pass, before any comparisons.
    fn new_turn(&mut self) {}

    /// Scalar worth of an entry; higher is kept longer.
    fn relevance(&self, entry: &IndexEntry) -> f64;

    /// Most relevant first; ties broken by recency, then by id for
    /// determinism.
    fn compare(&self, a: &IndexEntry, b: &IndexEntry) -> Ordering {
        self.relevance(b)
            .total_cmp(&self.relevance(a))
            .then(b.info.access.last_access.cmp(&a.info.access.last_access))
            .then(a.entry_ref().cmp(&b.entry_ref()))
    }
}

/// Factory keyed by configuration string.
pub fn relevance_by_name(name: &str) -> Result<Box<dyn RelevanceFunction>, IndexError> {
    match name.to_ascii_lowercase().as_str() {
        "lru" => Ok(Box::new(Lru)),
        "costlru" => Ok(Box::new(CostLru::default())),
        _ => Err(IndexError::StrategyMisconfigured {
            what: "relevance function",
            name: name.to_owned(),
            known: "lru, costlru",
        }),
    }
}

/// Plain recency: the last access time is the relevance.
pub struct Lru;

impl RelevanceFunction for Lru {
    fn relevance(&self, entry: &IndexEntry) -> f64 {
        entry.info.access.last_access as f64
    }
}

/// Recomputation cost, aged by 1% per idle minute.
///
/// The aging factor is clamped at zero: an entry idle for more than 100
/// minutes is worth nothing regardless of its cost, and such entries are
/// ordered among themselves by recency via the comparison tie-break.
#[derive(Default)]
pub struct CostLru {
    now: u64,
}

impl RelevanceFunction for CostLru {
    fn new_turn(&mut self) {
        self.now = now_millis();
    }

    fn relevance(&self, entry: &IndexEntry) -> f64 {
        let idle_minutes = self.now.saturating_sub(entry.info.access.last_access) / 60_000;
        let age_factor = (1.0 - idle_minutes as f64 * 0.01).max(0.0);
        entry.info.cost.uncached_cost() * age_factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mo_cube::{BoundsCube, CacheCube, Cube3, ResolutionInfo, Srs, TimeKind};
    use mo_types::{CacheType, CostProfile, EntryId, EntryInfo, NodeId, SemanticId};

    fn entry(last_access: u64, uncached_cpu: f64, id: u64) -> IndexEntry {
        let mut info = EntryInfo::new(
            10,
            CacheCube::new(
                BoundsCube::new(
                    Cube3::from_ranges(0.0, 1.0, 0.0, 1.0, 0.0, 1.0),
                    Srs::LatLon,
                    TimeKind::Unix,
                ),
                ResolutionInfo::None,
            ),
            CostProfile {
                uncached_cpu,
                ..Default::default()
            },
        );
        info.access.last_access = last_access;
        IndexEntry {
            cache_type: CacheType::Raster,
            semantic_id: SemanticId::from("op/a"),
            node: NodeId(1),
            entry_id: EntryId(id),
            info,
        }
    }

    #[test]
    fn lru_orders_by_recency() {
        let lru = Lru;
        let old = entry(1_000, 1.0, 1);
        let fresh = entry(2_000, 1.0, 2);
        assert_eq!(lru.compare(&fresh, &old), Ordering::Less); // fresh first
    }

    #[test]
    fn cost_lru_prefers_expensive_entries() {
        let mut rel = CostLru::default();
        rel.new_turn();
        let now = rel.now;
        let cheap = entry(now, 0.1, 1);
        let costly = entry(now, 10.0, 2);
        assert_eq!(rel.compare(&costly, &cheap), Ordering::Less);
    }

    #[test]
    fn cost_lru_ages_out_after_100_minutes() {
        let mut rel = CostLru::default();
        rel.new_turn();
        let now = rel.now;

        let ancient_costly = entry(now.saturating_sub(200 * 60_000), 1000.0, 1);
        let recent_cheap = entry(now, 0.01, 2);
        assert_eq!(rel.relevance(&ancient_costly), 0.0);
        assert_eq!(rel.compare(&recent_cheap, &ancient_costly), Ordering::Less);

        // Two fully aged entries: the more recently touched one survives.
        let aged_a = entry(now.saturating_sub(150 * 60_000), 5.0, 3);
        let aged_b = entry(now.saturating_sub(200 * 60_000), 5.0, 4);
        assert_eq!(rel.compare(&aged_a, &aged_b), Ordering::Less);
    }

    #[test]
    fn unknown_name_is_fatal() {
        assert!(matches!(
            relevance_by_name("mru"),
            Err(IndexError::StrategyMisconfigured { .. })
        ));
        assert!(relevance_by_name("LRU").is_ok());
    }
}
