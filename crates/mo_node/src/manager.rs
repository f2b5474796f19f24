use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use ahash::HashMap;
use parking_lot::Mutex;

use mo_cube::{CacheCube, QueryRect, ResolutionInfo};
use mo_store::{EntryStore, StoreConfig, StoreError};
use mo_types::{
    CacheType, EntryAccessDelta, EntryId, EntryInfo, EntrySnapshot, NodeHandshake, NodeId,
    NodeStats, Produced, Producer, QueryStats, SemanticId, TypedKey,
};

use crate::NodeConfig;

/// Uniform access to this node's typed stores plus the producer.
///
/// Shared by the worker threads, the delivery service and the control
/// connection; everything inside is behind its own lock.
pub struct NodeManager {
    stores: HashMap<CacheType, EntryStore>,
    producer: Arc<dyn Producer>,
    resolution_tolerance: f64,
    identity: Mutex<Option<(NodeId, String)>>,
    /// Hit/miss counters by job kind, merged into the stats delta.
    job_stats: Mutex<QueryStats>,
}

impl NodeManager {
    pub fn new(config: &NodeConfig, producer: Arc<dyn Producer>) -> Self {
        // One id counter for the whole node: entry ids are node-wide unique.
        let next_entry_id = Arc::new(AtomicU64::new(1));
        let mut stores = HashMap::default();
        for (cache_type, capacity) in &config.capacities {
            let store_config = StoreConfig {
                capacity: *capacity,
                resolution_tolerance: config.resolution_tolerance,
            };
            stores.insert(
                *cache_type,
                EntryStore::new(*cache_type, store_config, next_entry_id.clone()),
            );
        }
        Self {
            stores,
            producer,
            resolution_tolerance: config.resolution_tolerance,
            identity: Mutex::new(None),
            job_stats: Mutex::new(QueryStats::default()),
        }
    }

    pub fn producer(&self) -> &Arc<dyn Producer> {
        &self.producer
    }

    pub fn store(&self, cache_type: CacheType) -> &EntryStore {
        &self.stores[&cache_type]
    }

    // --- Identity ---

    /// Called once per successful handshake; the id may change when the
    /// coordinator restarts and hands out a fresh one.
    pub fn set_identity(&self, node_id: NodeId, observed_host: String) {
        *self.identity.lock() = Some((node_id, observed_host));
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.identity.lock().as_ref().map(|(id, _)| *id)
    }

    // --- Caching results ---

    /// Stores a produced result; refusal (payload bigger than the budget) is
    /// not an error, the result is simply not cached.
    pub fn cache_result(
        &self,
        cache_type: CacheType,
        semantic_id: &SemanticId,
        rect: &QueryRect,
        produced: &Produced,
    ) -> Vec<EntrySnapshot> {
        let cube = CacheCube::new(
            produced.bounds,
            ResolutionInfo::from_scale(&rect.scale(), self.resolution_tolerance),
        );
        match self.store(cache_type).put(
            semantic_id,
            produced.payload.clone(),
            cube,
            produced.cost,
        ) {
            Ok(entry_id) => vec![EntrySnapshot {
                cache_type,
                semantic_id: semantic_id.clone(),
                entry_id,
                info: EntryInfo::new(produced.payload.len() as u64, cube, produced.cost),
            }],
            Err(StoreError::InsufficientCapacity { payload, budget }) => {
                log::info!(
                    "{cache_type}/{semantic_id}: result of {payload} bytes not cached \
                     (budget {budget})"
                );
                vec![]
            }
            Err(e) => {
                log::warn!("{cache_type}/{semantic_id}: caching failed: {e}");
                vec![]
            }
        }
    }

    // --- Job statistics ---

    pub fn note_single_hit(&self) {
        self.job_stats.lock().single_hits += 1;
    }

    pub fn note_multi_hit(&self) {
        self.job_stats.lock().multi_hits += 1;
    }

    pub fn note_partial(&self) {
        self.job_stats.lock().partials += 1;
    }

    pub fn note_miss(&self) {
        self.job_stats.lock().misses += 1;
    }

    pub fn note_result_bytes(&self, bytes: u64) {
        self.job_stats.lock().result_bytes += bytes;
    }

    // --- Reports to the coordinator ---

    /// The warm-start handshake: budgets plus every surviving entry.
    pub fn handshake(&self, delivery_port: u16) -> NodeHandshake {
        let mut capacities = Vec::new();
        let mut entries = Vec::new();
        for cache_type in CacheType::ALL {
            let Some(store) = self.stores.get(&cache_type) else {
                continue;
            };
            capacities.push((cache_type, store.usage().capacity));
            for (semantic_id, entry_id, info) in store.snapshot() {
                entries.push(EntrySnapshot {
                    cache_type,
                    semantic_id,
                    entry_id,
                    info,
                });
            }
        }
        NodeHandshake {
            delivery_port,
            capacities,
            entries,
        }
    }

    /// Everything that changed since the last report; resets the deltas.
    pub fn stats_delta(&self) -> NodeStats {
        let mut usage = Vec::new();
        let mut access = Vec::new();
        let mut removed = Vec::new();
        let mut query = std::mem::take(&mut *self.job_stats.lock());

        for cache_type in CacheType::ALL {
            let Some(store) = self.stores.get(&cache_type) else {
                continue;
            };
            usage.push((cache_type, store.usage()));
            let delta = store.stats_delta();
            query += delta.query;
            for (semantic_id, entry_id, stats) in delta.access {
                access.push(EntryAccessDelta {
                    cache_type,
                    semantic_id,
                    entry_id,
                    last_access: stats.last_access,
                    access_count: stats.access_count,
                });
            }
            for key in delta.evicted {
                removed.push(TypedKey::new(cache_type, key.semantic_id, key.entry_id));
            }
        }

        NodeStats {
            usage,
            query,
            access,
            removed,
        }
    }
}

/// Local key of an entry snapshot, shared by worker and delivery paths.
pub(crate) fn local_key(semantic_id: &SemanticId, entry_id: EntryId) -> mo_types::CacheKey {
    mo_types::CacheKey::new(semantic_id.clone(), entry_id)
}
