use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::HashMap;
use parking_lot::{Mutex, RwLock};

use mo_cube::{plan_cover, CacheCube, CoverResult, QueryCube};
use mo_types::{
    AccessStats, CacheKey, CacheType, CostProfile, EntryId, EntryInfo, QueryStats, SemanticId,
    StoreUsage,
};

/// Errors of the local store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Lookup of an absent key; callers treat this as a cache miss.
    #[error("no such entry: {0}")]
    NoSuchEntry(CacheKey),

    /// The payload alone is larger than the whole byte budget.
    #[error("payload of {payload} bytes exceeds store budget of {budget} bytes")]
    InsufficientCapacity { payload: u64, budget: u64 },
}

#[derive(Clone, Copy, Debug)]
pub struct StoreConfig {
    /// Byte budget; the sum of stored payload sizes never exceeds it.
    pub capacity: u64,
    /// Multiplicative widening of resolution validity ranges (`1.0` = exact).
    pub resolution_tolerance: f64,
}

impl StoreConfig {
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            capacity,
            resolution_tolerance: 1.0,
        }
    }
}

/// A stored entry as handed out to callers; cloning shares the payload.
#[derive(Clone, Debug)]
pub struct Entry {
    pub payload: Arc<[u8]>,
    pub info: EntryInfo,
}

struct StoredEntry {
    payload: Arc<[u8]>,
    info: EntryInfo,
    /// Access stats changed since the last delta report.
    dirty: bool,
}

impl StoredEntry {
    fn to_entry(&self) -> Entry {
        Entry {
            payload: self.payload.clone(),
            info: self.info.clone(),
        }
    }
}

type Bucket = Arc<Mutex<BTreeMap<EntryId, StoredEntry>>>;

/// Store-wide accounting; also the eviction lock.
#[derive(Default)]
struct Ledger {
    used: u64,
    /// Evicted keys awaiting reconciliation with the coordinator.
    evicted: Vec<CacheKey>,
}

/// A byte-budgeted store of typed payloads for one cache type.
pub struct EntryStore {
    cache_type: CacheType,
    config: StoreConfig,
    buckets: RwLock<HashMap<SemanticId, Bucket>>,
    ledger: Mutex<Ledger>,
    /// Node-wide monotone entry ids; never reused, also not after removals.
    next_entry_id: Arc<AtomicU64>,
    query_stats: Mutex<QueryStats>,
}

/// Everything that changed since the previous [`EntryStore::stats_delta`].
#[derive(Debug, Default)]
pub struct StatsDelta {
    pub query: QueryStats,
    pub access: Vec<(SemanticId, EntryId, AccessStats)>,
    pub evicted: Vec<CacheKey>,
}

impl EntryStore {
    /// `next_entry_id` is shared between all stores of a node so that entry
    /// ids are node-wide unique.
    pub fn new(cache_type: CacheType, config: StoreConfig, next_entry_id: Arc<AtomicU64>) -> Self {
        Self {
            cache_type,
            config,
            buckets: RwLock::new(HashMap::default()),
            ledger: Mutex::new(Ledger::default()),
            next_entry_id,
            query_stats: Mutex::new(QueryStats::default()),
        }
    }

    /// Inserts a freshly produced payload, evicting older entries if needed.
    pub fn put(
        &self,
        semantic_id: &SemanticId,
        payload: Arc<[u8]>,
        cube: CacheCube,
        cost: CostProfile,
    ) -> Result<EntryId, StoreError> {
        let info = EntryInfo::new(payload.len() as u64, cube, cost);
        self.install(semantic_id, payload, info)
    }

    /// Inserts an entry with pre-existing metadata (reorg moves keep access
    /// stats and cost); assigns a fresh entry id either way.
    pub fn install(
        &self,
        semantic_id: &SemanticId,
        payload: Arc<[u8]>,
        mut info: EntryInfo,
    ) -> Result<EntryId, StoreError> {
        info.byte_size = payload.len() as u64;
        if info.byte_size > self.config.capacity {
            return Err(StoreError::InsufficientCapacity {
                payload: info.byte_size,
                budget: self.config.capacity,
            });
        }

        {
            let mut ledger = self.ledger.lock();
            while ledger.used + info.byte_size > self.config.capacity {
                if !self.evict_one(&mut ledger) {
                    break;
                }
            }
            ledger.used += info.byte_size;
        }

        let entry_id = EntryId(self.next_entry_id.fetch_add(1, Ordering::Relaxed));
        let bucket = self.bucket(semantic_id);
        bucket.lock().insert(
            entry_id,
            StoredEntry {
                payload,
                info,
                dirty: true,
            },
        );
        log::debug!("{}: stored {}:{}", self.cache_type, semantic_id, entry_id);
        Ok(entry_id)
    }

    /// Reads an entry and counts the access.
    pub fn get(&self, key: &CacheKey) -> Result<Entry, StoreError> {
        let bucket = self.existing_bucket(&key.semantic_id)
            .ok_or_else(|| StoreError::NoSuchEntry(key.clone()))?;
        let mut bucket = bucket.lock();
        let stored = bucket
            .get_mut(&key.entry_id)
            .ok_or_else(|| StoreError::NoSuchEntry(key.clone()))?;
        stored.info.access.touch();
        stored.dirty = true;
        Ok(stored.to_entry())
    }

    /// Reads an entry without counting the access (used by reorg moves).
    pub fn peek(&self, key: &CacheKey) -> Result<Entry, StoreError> {
        let bucket = self.existing_bucket(&key.semantic_id)
            .ok_or_else(|| StoreError::NoSuchEntry(key.clone()))?;
        let bucket = bucket.lock();
        bucket
            .get(&key.entry_id)
            .map(StoredEntry::to_entry)
            .ok_or_else(|| StoreError::NoSuchEntry(key.clone()))
    }

    /// Removes an entry; `NoSuchEntry` is not fatal upstream.
    pub fn remove(&self, key: &CacheKey) -> Result<(), StoreError> {
        let bucket = self.existing_bucket(&key.semantic_id)
            .ok_or_else(|| StoreError::NoSuchEntry(key.clone()))?;
        let removed = bucket.lock().remove(&key.entry_id);
        match removed {
            Some(stored) => {
                self.ledger.lock().used -= stored.info.byte_size;
                log::debug!("{}: removed {}", self.cache_type, key);
                Ok(())
            }
            None => Err(StoreError::NoSuchEntry(key.clone())),
        }
    }

    /// Plans how this store can answer `query`; counts hit/miss statistics
    /// and touches every chosen entry.
    pub fn query(&self, semantic_id: &SemanticId, query: &QueryCube) -> CoverResult<EntryId> {
        let result = match self.existing_bucket(semantic_id) {
            Some(bucket) => {
                let mut bucket = bucket.lock();
                let candidates: Vec<(EntryId, CacheCube)> = bucket
                    .iter()
                    .map(|(id, stored)| (*id, stored.info.cube))
                    .collect();
                let result = plan_cover(query, candidates);

                let chosen: Vec<EntryId> = match &result {
                    CoverResult::Hit(id) => vec![*id],
                    CoverResult::Partial(plan) => plan.keys.clone(),
                    CoverResult::Miss => vec![],
                };
                for id in chosen {
                    if let Some(stored) = bucket.get_mut(&id) {
                        stored.info.access.touch();
                        stored.dirty = true;
                    }
                }
                result
            }
            None => CoverResult::Miss,
        };

        {
            let mut stats = self.query_stats.lock();
            match &result {
                CoverResult::Hit(_) => stats.single_hits += 1,
                CoverResult::Partial(plan) if plan.remainders.is_empty() => stats.multi_hits += 1,
                CoverResult::Partial(_) => stats.partials += 1,
                CoverResult::Miss => stats.misses += 1,
            }
        }
        result
    }

    /// Counts payload bytes served from this store.
    pub fn note_result_bytes(&self, bytes: u64) {
        self.query_stats.lock().result_bytes += bytes;
    }

    pub fn usage(&self) -> StoreUsage {
        StoreUsage {
            used: self.ledger.lock().used,
            capacity: self.config.capacity,
        }
    }

    /// All entries with their metadata, for the warm-start handshake.
    pub fn snapshot(&self) -> Vec<(SemanticId, EntryId, EntryInfo)> {
        let buckets = self.buckets.read();
        let mut out = Vec::new();
        for (semantic_id, bucket) in buckets.iter() {
            for (entry_id, stored) in bucket.lock().iter() {
                out.push((semantic_id.clone(), *entry_id, stored.info.clone()));
            }
        }
        out
    }

    /// Per-entry access changes plus query counters since the previous call;
    /// resets both.
    pub fn stats_delta(&self) -> StatsDelta {
        let query = std::mem::take(&mut *self.query_stats.lock());
        let evicted = std::mem::take(&mut self.ledger.lock().evicted);

        let mut access = Vec::new();
        let buckets = self.buckets.read();
        for (semantic_id, bucket) in buckets.iter() {
            for (entry_id, stored) in bucket.lock().iter_mut() {
                if stored.dirty {
                    stored.dirty = false;
                    access.push((semantic_id.clone(), *entry_id, stored.info.access));
                }
            }
        }

        StatsDelta {
            query,
            access,
            evicted,
        }
    }

    // ---

    fn bucket(&self, semantic_id: &SemanticId) -> Bucket {
        if let Some(bucket) = self.buckets.read().get(semantic_id) {
            return bucket.clone();
        }
        self.buckets
            .write()
            .entry(semantic_id.clone())
            .or_default()
            .clone()
    }

    fn existing_bucket(&self, semantic_id: &SemanticId) -> Option<Bucket> {
        self.buckets.read().get(semantic_id).cloned()
    }

    /// Evicts the least-recently-used entry; returns false if the store is
    /// empty. Caller holds the ledger lock.
    fn evict_one(&self, ledger: &mut Ledger) -> bool {
        let buckets = self.buckets.read();

        let mut victim: Option<(u64, SemanticId, EntryId)> = None;
        for (semantic_id, bucket) in buckets.iter() {
            for (entry_id, stored) in bucket.lock().iter() {
                let at = stored.info.access.last_access;
                let older = match &victim {
                    Some((best, ..)) => at < *best,
                    None => true,
                };
                if older {
                    victim = Some((at, semantic_id.clone(), *entry_id));
                }
            }
        }

        let Some((_, semantic_id, entry_id)) = victim else {
            return false;
        };
        let Some(bucket) = buckets.get(&semantic_id) else {
            return false;
        };
        if let Some(stored) = bucket.lock().remove(&entry_id) {
            ledger.used -= stored.info.byte_size;
            let key = CacheKey::new(semantic_id, entry_id);
            log::debug!(
                "{}: evicted {} ({} bytes)",
                self.cache_type,
                key,
                stored.info.byte_size
            );
            ledger.evicted.push(key);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mo_cube::{BoundsCube, Cube3, QueryRect, Resolution, ResolutionInfo, Srs, TimeKind};

    fn store(capacity: u64) -> EntryStore {
        EntryStore::new(
            CacheType::Raster,
            StoreConfig::with_capacity(capacity),
            Arc::new(AtomicU64::new(1)),
        )
    }

    fn cube(x1: f64, x2: f64) -> CacheCube {
        CacheCube::new(
            BoundsCube::new(
                Cube3::from_ranges(x1, x2, 0.0, 10.0, 0.0, 1.0),
                Srs::LatLon,
                TimeKind::Unix,
            ),
            ResolutionInfo::None,
        )
    }

    fn payload(len: usize) -> Arc<[u8]> {
        vec![0xAB; len].into()
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
    fn put_get_round_trip() {
        let s = store(1000);
        let sem = SemanticId::from("op/a");
        let id = s
            .put(&sem, payload(100), cube(0.0, 10.0), CostProfile::default())
            .expect("put");
        let entry = s.get(&CacheKey::new(sem, id)).expect("get");
        assert_eq!(entry.payload.len(), 100);
        assert_eq!(entry.info.byte_size, 100);
        assert_eq!(entry.info.access.access_count, 2); // insert + get
    }

    #[test]
    fn oversized_payload_is_refused() {
        let s = store(50);
        let err = s
            .put(
                &SemanticId::from("op/a"),
                payload(100),
                cube(0.0, 10.0),
                CostProfile::default(),
            )
            .expect_err("should not fit");
        assert!(matches!(err, StoreError::InsufficientCapacity { .. }));
    }

    #[test]
    fn eviction_keeps_usage_under_budget_and_reports_victims() {
        let s = store(250);
        let sem = SemanticId::from("op/a");
        let first = s
            .put(&sem, payload(100), cube(0.0, 1.0), CostProfile::default())
            .expect("put");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let _second = s
            .put(&sem, payload(100), cube(1.0, 2.0), CostProfile::default())
            .expect("put");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let _third = s
            .put(&sem, payload(100), cube(2.0, 3.0), CostProfile::default())
            .expect("put");

        assert!(s.usage().used <= 250);
        // The oldest entry went first.
        assert!(s.get(&CacheKey::new(sem.clone(), first)).is_err());
        let delta = s.stats_delta();
        assert_eq!(delta.evicted, vec![CacheKey::new(sem, first)]);
    }

    #[test]
    fn entry_ids_are_never_reused() {
        let s = store(1000);
        let sem = SemanticId::from("op/a");
        let mut seen = std::collections::HashSet::new();
        for i in 0..20 {
            let id = s
                .put(
                    &sem,
                    payload(200), // forces constant eviction
                    cube(i as f64, i as f64 + 1.0),
                    CostProfile::default(),
                )
                .expect("put");
            assert!(seen.insert(id), "entry id {id} reused");
        }
    }

    #[test]
    fn query_classifies_hit_partial_miss() {
        let s = store(10_000);
        let sem = SemanticId::from("op/a");
        s.put(&sem, payload(10), cube(0.0, 5.0), CostProfile::default())
            .expect("put");

        assert!(matches!(s.query(&sem, &query(1.0, 4.0)), CoverResult::Hit(_)));
        assert!(matches!(
            s.query(&sem, &query(0.0, 10.0)),
            CoverResult::Partial(_)
        ));
        assert!(matches!(
            s.query(&sem, &query(6.0, 10.0)),
            CoverResult::Miss
        ));
        assert!(matches!(
            s.query(&SemanticId::from("op/b"), &query(0.0, 5.0)),
            CoverResult::Miss
        ));

        let delta = s.stats_delta();
        assert_eq!(delta.query.single_hits, 1);
        assert_eq!(delta.query.partials, 1);
        assert_eq!(delta.query.misses, 2);
    }

    #[test]
    fn stats_delta_resets() {
        let s = store(1000);
        let sem = SemanticId::from("op/a");
        let id = s
            .put(&sem, payload(10), cube(0.0, 5.0), CostProfile::default())
            .expect("put");
        s.get(&CacheKey::new(sem.clone(), id)).expect("get");

        let delta = s.stats_delta();
        assert_eq!(delta.access.len(), 1);
        assert_eq!(delta.access[0].2.access_count, 2);

        // Nothing changed since; the next delta is empty.
        let delta = s.stats_delta();
        assert!(delta.access.is_empty());
        assert_eq!(delta.query, QueryStats::default());
    }

    #[test]
    fn removal_is_accounted_and_absent_keys_error() {
        let s = store(1000);
        let sem = SemanticId::from("op/a");
        let id = s
            .put(&sem, payload(100), cube(0.0, 5.0), CostProfile::default())
            .expect("put");
        assert_eq!(s.usage().used, 100);
        s.remove(&CacheKey::new(sem.clone(), id)).expect("remove");
        assert_eq!(s.usage().used, 0);
        assert!(matches!(
            s.remove(&CacheKey::new(sem, id)),
            Err(StoreError::NoSuchEntry(_))
        ));
    }

    #[test]
    fn random_churn_respects_budget() {
        use rand::{Rng as _, SeedableRng as _};
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);

        let s = store(1_000);
        for i in 0..200 {
            let sem = SemanticId::from(format!("op/{}", rng.gen_range(0..5)));
            let len = rng.gen_range(1..400);
            let x = f64::from(i);
            s.put(&sem, payload(len), cube(x, x + 1.0), CostProfile::default())
                .expect("put");
            assert!(s.usage().used <= 1_000, "budget exceeded");
        }
    }
}
