use std::collections::BTreeSet;

use ahash::{HashMap, HashSet};
use nohash_hasher::IntMap;

use mo_cube::{plan_cover, CoverResult, QueryCube};
use mo_types::{
    CacheType, EntryAccessDelta, EntryId, EntryInfo, EntryRef, EntrySnapshot, NodeId, SemanticId,
    TypedKey,
};

/// A node's entry as the coordinator sees it: metadata, no payload.
#[derive(Clone, Debug)]
pub struct IndexEntry {
    pub cache_type: CacheType,
    pub semantic_id: SemanticId,
    pub node: NodeId,
    pub entry_id: EntryId,
    pub info: EntryInfo,
}

impl IndexEntry {
    pub fn entry_ref(&self) -> EntryRef {
        EntryRef::new(self.node, self.entry_id)
    }
}

/// One cache type's slice of the directory.
///
/// The arena owns the entries; the two id maps only hold [`EntryRef`]s, so
/// removal is O(1) per map and there is no shared ownership to keep cyclic.
#[derive(Default)]
struct TypeDirectory {
    entries: HashMap<EntryRef, IndexEntry>,
    /// Deterministically ordered so resolution plans are reproducible.
    by_semantic: HashMap<SemanticId, BTreeSet<EntryRef>>,
    by_node: IntMap<NodeId, HashSet<EntryRef>>,
}

impl TypeDirectory {
    fn insert(&mut self, entry: IndexEntry) {
        let entry_ref = entry.entry_ref();
        self.by_semantic
            .entry(entry.semantic_id.clone())
            .or_default()
            .insert(entry_ref);
        self.by_node
            .entry(entry.node)
            .or_default()
            .insert(entry_ref);
        self.entries.insert(entry_ref, entry);
    }

    fn remove(&mut self, entry_ref: EntryRef) -> Option<IndexEntry> {
        let entry = self.entries.remove(&entry_ref)?;
        if let Some(refs) = self.by_semantic.get_mut(&entry.semantic_id) {
            refs.remove(&entry_ref);
            if refs.is_empty() {
                self.by_semantic.remove(&entry.semantic_id);
            }
        }
        if let Some(refs) = self.by_node.get_mut(&entry.node) {
            refs.remove(&entry_ref);
        }
        Some(entry)
    }
}

/// The coordinator's mirror of every node's store, minus payloads.
pub struct IndexDirectory {
    types: HashMap<CacheType, TypeDirectory>,
}

impl Default for IndexDirectory {
    fn default() -> Self {
        let mut types = HashMap::default();
        for cache_type in CacheType::ALL {
            types.insert(cache_type, TypeDirectory::default());
        }
        Self { types }
    }
}

impl IndexDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn of(&self, cache_type: CacheType) -> &TypeDirectory {
        &self.types[&cache_type]
    }

    fn of_mut(&mut self, cache_type: CacheType) -> &mut TypeDirectory {
        self.types
            .get_mut(&cache_type)
            .expect("all cache types are pre-populated")
    }

    /// Indexes a published entry (handshake, result publication, or the
    /// destination side of a completed move).
    pub fn publish(&mut self, node: NodeId, snapshot: EntrySnapshot) {
        let entry = IndexEntry {
            cache_type: snapshot.cache_type,
            semantic_id: snapshot.semantic_id,
            node,
            entry_id: snapshot.entry_id,
            info: snapshot.info,
        };
        log::debug!(
            "index: publish {}/{}:{} on {}",
            entry.cache_type,
            entry.semantic_id,
            entry.entry_id,
            node
        );
        self.of_mut(snapshot.cache_type).insert(entry);
    }

    pub fn get(&self, cache_type: CacheType, entry_ref: EntryRef) -> Option<&IndexEntry> {
        self.of(cache_type).entries.get(&entry_ref)
    }

    /// Removes one entry; absent keys are logged, never fatal.
    pub fn remove(&mut self, cache_type: CacheType, entry_ref: EntryRef) {
        if self.of_mut(cache_type).remove(entry_ref).is_none() {
            log::debug!("index: removal of unknown entry {entry_ref} ({cache_type})");
        }
    }

    /// Confirms a node-side eviction reported via stats.
    pub fn confirm_removal(&mut self, node: NodeId, key: &TypedKey) {
        let refs: Vec<EntryRef> = self
            .of(key.cache_type)
            .by_semantic
            .get(&key.semantic_id)
            .map(|refs| {
                refs.iter()
                    .filter(|r| r.node == node && r.entry == key.entry_id)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        for entry_ref in refs {
            self.remove(key.cache_type, entry_ref);
        }
    }

    /// Rewrites an entry's location after a completed move. The entry is
    /// upserted at its new home even if the old reference is already gone:
    /// the copy exists, the index had better point at it.
    pub fn apply_move(
        &mut self,
        cache_type: CacheType,
        semantic_id: &SemanticId,
        old: EntryRef,
        new: EntryRef,
    ) {
        let dir = self.of_mut(cache_type);
        let info = match dir.remove(old) {
            Some(entry) => entry.info,
            None => {
                log::warn!("index: move of unknown entry {old} ignored");
                return;
            }
        };
        dir.insert(IndexEntry {
            cache_type,
            semantic_id: semantic_id.clone(),
            node: new.node,
            entry_id: new.entry,
            info,
        });
    }

    /// Expunges everything a dead node held. Returns how many entries went.
    pub fn remove_node(&mut self, node: NodeId) -> usize {
        let mut removed = 0;
        for cache_type in CacheType::ALL {
            let dir = self.of_mut(cache_type);
            let refs: Vec<EntryRef> = dir
                .by_node
                .remove(&node)
                .map(|refs| refs.into_iter().collect())
                .unwrap_or_default();
            for entry_ref in refs {
                dir.remove(entry_ref);
                removed += 1;
            }
        }
        removed
    }

    /// Folds per-entry access deltas from a node's stats report.
    pub fn update_access(&mut self, node: NodeId, deltas: &[EntryAccessDelta]) {
        for delta in deltas {
            let entry_ref = EntryRef::new(node, delta.entry_id);
            if let Some(entry) = self
                .types
                .get_mut(&delta.cache_type)
                .and_then(|dir| dir.entries.get_mut(&entry_ref))
            {
                entry.info.access.last_access = delta.last_access;
                entry.info.access.access_count = delta.access_count;
            }
        }
    }

    /// All entries of one cache type, for the reorg planner.
    pub fn entries_of_type(&self, cache_type: CacheType) -> Vec<&IndexEntry> {
        let dir = self.of(cache_type);
        // Deterministic order: iterate the semantic map's sorted ref sets.
        let mut semantic_ids: Vec<&SemanticId> = dir.by_semantic.keys().collect();
        semantic_ids.sort();
        semantic_ids
            .into_iter()
            .flat_map(|sid| dir.by_semantic[sid].iter().map(|r| &dir.entries[r]))
            .collect()
    }

    pub fn len_of_type(&self, cache_type: CacheType) -> usize {
        self.of(cache_type).entries.len()
    }

    /// Cross-node resolution: identical matching logic to the node store,
    /// but the keys are `(node, entry)` pairs.
    pub fn resolve(
        &self,
        cache_type: CacheType,
        semantic_id: &SemanticId,
        query: &QueryCube,
    ) -> CoverResult<EntryRef> {
        let dir = self.of(cache_type);
        let Some(refs) = dir.by_semantic.get(semantic_id) else {
            return CoverResult::Miss;
        };
        let candidates = refs
            .iter()
            .filter_map(|r| dir.entries.get(r).map(|e| (*r, e.info.cube)));
        plan_cover(query, candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mo_cube::{
        BoundsCube, CacheCube, Cube3, QueryRect, Resolution, ResolutionInfo, Srs, TimeKind,
    };
    use mo_types::CostProfile;

    fn snapshot(sem: &str, entry: u64, x1: f64, x2: f64) -> EntrySnapshot {
        EntrySnapshot {
            cache_type: CacheType::Raster,
            semantic_id: SemanticId::from(sem),
            entry_id: EntryId(entry),
            info: EntryInfo::new(
                100,
                CacheCube::new(
                    BoundsCube::new(
                        Cube3::from_ranges(x1, x2, 0.0, 10.0, 0.0, 1.0),
                        Srs::LatLon,
                        TimeKind::Unix,
                    ),
                    ResolutionInfo::None,
                ),
                CostProfile::default(),
            ),
        }
    }

    fn query(x1: f64, x2: f64) -> QueryCube {
        QueryRect::new(
            BoundsCube::new(
                Cube3::from_ranges(x1, x2, 0.0, 10.0, 0.0, 1.0),
                Srs::LatLon,
                TimeKind::Unix,
            ),
            Resolution::None,
        )
        .to_query_cube()
    }

    #[test]
    fn resolves_across_nodes() {
        let mut dir = IndexDirectory::new();
        dir.publish(NodeId(1), snapshot("op/a", 1, 0.0, 5.0));
        dir.publish(NodeId(2), snapshot("op/a", 2, 5.0, 10.0));

        match dir.resolve(CacheType::Raster, &SemanticId::from("op/a"), &query(0.0, 10.0)) {
            CoverResult::Partial(plan) => {
                assert_eq!(plan.keys.len(), 2);
                assert!(plan.remainders.is_empty());
                let nodes: Vec<NodeId> = plan.keys.iter().map(|r| r.node).collect();
                assert!(nodes.contains(&NodeId(1)) && nodes.contains(&NodeId(2)));
            }
            other => panic!("expected partial, got {other:?}"),
        }
    }

    #[test]
    fn node_removal_expunges_everything() {
        let mut dir = IndexDirectory::new();
        dir.publish(NodeId(1), snapshot("op/a", 1, 0.0, 5.0));
        dir.publish(NodeId(1), snapshot("op/b", 2, 0.0, 5.0));
        dir.publish(NodeId(2), snapshot("op/a", 3, 5.0, 10.0));

        assert_eq!(dir.remove_node(NodeId(1)), 2);
        assert_eq!(dir.len_of_type(CacheType::Raster), 1);
        match dir.resolve(CacheType::Raster, &SemanticId::from("op/a"), &query(0.0, 10.0)) {
            CoverResult::Partial(plan) => {
                assert_eq!(plan.keys, vec![EntryRef::new(NodeId(2), EntryId(3))]);
                assert_eq!(plan.remainders.len(), 1);
            }
            other => panic!("expected partial, got {other:?}"),
        }
    }

    #[test]
    fn moves_rewrite_the_location() {
        let mut dir = IndexDirectory::new();
        dir.publish(NodeId(1), snapshot("op/a", 1, 0.0, 10.0));
        dir.apply_move(
            CacheType::Raster,
            &SemanticId::from("op/a"),
            EntryRef::new(NodeId(1), EntryId(1)),
            EntryRef::new(NodeId(2), EntryId(9)),
        );

        match dir.resolve(CacheType::Raster, &SemanticId::from("op/a"), &query(2.0, 8.0)) {
            CoverResult::Hit(entry_ref) => {
                assert_eq!(entry_ref, EntryRef::new(NodeId(2), EntryId(9)));
            }
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[test]
    fn confirmed_evictions_disappear() {
        let mut dir = IndexDirectory::new();
        dir.publish(NodeId(1), snapshot("op/a", 1, 0.0, 10.0));
        dir.confirm_removal(
            NodeId(1),
            &TypedKey::new(CacheType::Raster, SemanticId::from("op/a"), EntryId(1)),
        );
        assert_eq!(dir.len_of_type(CacheType::Raster), 0);
    }
}
