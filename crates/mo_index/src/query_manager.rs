use std::collections::{BTreeMap, BTreeSet};

use ahash::HashMap;

use mo_cube::CacheCube;
use mo_types::{BaseRequest, DeliveryRequest, EntryRef, NodeId, PuzzleRequest};

pub type ClientId = u64;
pub type WorkerId = u64;
pub type QueryId = u64;

/// What a job asks a worker to do.
#[derive(Clone, Debug)]
pub enum JobKind {
    /// A single stored entry answers the query.
    Deliver {
        request: DeliveryRequest,
        entry: EntryRef,
        bounds: CacheCube,
    },
    /// Assemble from stored pieces plus produced remainders.
    Puzzle {
        request: PuzzleRequest,
        refs: Vec<EntryRef>,
    },
    /// Produce from scratch.
    Create,
}

impl JobKind {
    pub fn references_node(&self, node: NodeId) -> bool {
        match self {
            Self::Deliver { entry, .. } => entry.node == node,
            Self::Puzzle { refs, .. } => refs.iter().any(|r| r.node == node),
            Self::Create => false,
        }
    }
}

/// One deduplicated unit of work, owned by the query manager from creation
/// until its result is routed (or its last client leaves).
#[derive(Clone, Debug)]
pub struct Job {
    pub id: QueryId,
    /// The (possibly batching-extended) client request behind this job.
    pub origin: BaseRequest,
    pub kind: JobKind,
    pub clients: BTreeSet<ClientId>,
    /// Volume of the first request, the base of the batching cap.
    orig_volume: f64,
}

impl Job {
    /// Whether this job's eventual result answers `req` outright.
    pub fn satisfies(&self, req: &BaseRequest) -> bool {
        if self.origin.cache_type != req.cache_type || self.origin.semantic_id != req.semantic_id {
            return false;
        }
        match &self.kind {
            // A delivered entry covers its stored bounds.
            JobKind::Deliver { bounds, .. } => {
                bounds.bounds.same_reference(&req.rect.bounds)
                    && bounds.resolution.matches(&req.rect.scale())
                    && bounds.bounds.cube.contains(req.rect.cube())
            }
            // Puzzles and creates yield exactly their origin rectangle.
            JobKind::Puzzle { .. } | JobKind::Create => self.origin.rect.satisfies(&req.rect),
        }
    }
}

/// The three job tables plus the attach/extend/reschedule bookkeeping.
///
/// This type never touches a socket; it is plain state, driven entirely by
/// the scheduler thread, which makes its transitions unit-testable.
pub struct QueryManager {
    batching: bool,
    max_batch_volume: f64,

    next_query_id: QueryId,
    pending: BTreeMap<QueryId, Job>,
    running: BTreeMap<QueryId, (Job, WorkerId)>,
    /// Result computed, delivery id not yet reported. Late compatible
    /// requests may still attach here.
    finished: BTreeMap<QueryId, (Job, WorkerId)>,
    by_worker: HashMap<WorkerId, QueryId>,
}

impl QueryManager {
    pub fn new(batching: bool, max_batch_volume: f64) -> Self {
        Self {
            batching,
            max_batch_volume,
            next_query_id: 1,
            pending: BTreeMap::new(),
            running: BTreeMap::new(),
            finished: BTreeMap::new(),
            by_worker: HashMap::default(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Step 1 of `add_request`: attach to any job whose result satisfies the
    /// request, preferring the ones furthest along.
    pub fn attach(&mut self, client: ClientId, req: &BaseRequest) -> bool {
        for (job, _) in self.finished.values_mut() {
            if job.satisfies(req) {
                job.clients.insert(client);
                return true;
            }
        }
        for (job, _) in self.running.values_mut() {
            if job.satisfies(req) {
                job.clients.insert(client);
                return true;
            }
        }
        for job in self.pending.values_mut() {
            if job.satisfies(req) {
                job.clients.insert(client);
                return true;
            }
        }
        false
    }

    /// Step 2: grow a compatible pending create job's rectangle to the union,
    /// bounded by the batching volume cap.
    pub fn try_extend(&mut self, client: ClientId, req: &BaseRequest) -> bool {
        if !self.batching {
            return false;
        }
        for job in self.pending.values_mut() {
            if !matches!(job.kind, JobKind::Create) {
                continue;
            }
            if job.origin.cache_type != req.cache_type
                || job.origin.semantic_id != req.semantic_id
                || !job.origin.rect.bounds.same_reference(&req.rect.bounds)
                || !job.origin.rect.scale().matches(&req.rect.scale())
            {
                continue;
            }
            let hull = job.origin.rect.hull(&req.rect);
            if hull.volume() > self.max_batch_volume * job.orig_volume {
                continue;
            }
            job.origin.rect = hull;
            job.clients.insert(client);
            return true;
        }
        false
    }

    /// Step 3: queue a brand-new job.
    pub fn enqueue(&mut self, client: ClientId, origin: BaseRequest, kind: JobKind) -> QueryId {
        let id = self.next_query_id;
        self.next_query_id += 1;
        let orig_volume = origin.rect.volume();
        let mut clients = BTreeSet::new();
        clients.insert(client);
        self.pending.insert(
            id,
            Job {
                id,
                origin,
                kind,
                clients,
                orig_volume,
            },
        );
        id
    }

    /// Re-queues a rebuilt job, keeping its waiters and id.
    pub fn requeue(&mut self, job: Job) {
        self.pending.insert(job.id, job);
    }

    /// Pending job ids, oldest first.
    pub fn pending_ids(&self) -> Vec<QueryId> {
        self.pending.keys().copied().collect()
    }

    pub fn pending_job(&self, id: QueryId) -> Option<&Job> {
        self.pending.get(&id)
    }

    /// Takes a pending job out of the queue (for dispatch or rebuild).
    pub fn take_pending(&mut self, id: QueryId) -> Option<Job> {
        self.pending.remove(&id)
    }

    pub fn mark_running(&mut self, job: Job, worker: WorkerId) {
        self.by_worker.insert(worker, job.id);
        self.running.insert(job.id, (job, worker));
    }

    /// The worker reported `RESULT_READY`: the job moves to `finished` and
    /// the consumer count is fixed at the current waiter set.
    pub fn on_result_ready(&mut self, worker: WorkerId) -> Option<(QueryId, u32)> {
        let id = *self.by_worker.get(&worker)?;
        let (job, worker_id) = self.running.remove(&id)?;
        let qty = job.clients.len() as u32;
        self.finished.insert(id, (job, worker_id));
        Some((id, qty))
    }

    /// The worker reported its delivery id: the job is done, its waiters get
    /// the response.
    pub fn on_delivery_ready(&mut self, worker: WorkerId) -> Option<Job> {
        let id = self.by_worker.remove(&worker)?;
        self.finished.remove(&id).map(|(job, _)| job)
    }

    /// The worker reported an error: the job dies, waiters are told.
    pub fn on_worker_error(&mut self, worker: WorkerId) -> Option<Job> {
        let id = self.by_worker.remove(&worker)?;
        self.running
            .remove(&id)
            .or_else(|| self.finished.remove(&id))
            .map(|(job, _)| job)
    }

    /// A worker's connection died; its running job (if any) must be rebuilt
    /// and re-queued by the caller.
    pub fn on_worker_disconnect(&mut self, worker: WorkerId) -> Option<Job> {
        let id = self.by_worker.remove(&worker)?;
        self.running
            .remove(&id)
            .or_else(|| self.finished.remove(&id))
            .map(|(job, _)| job)
    }

    /// Removes a disconnected client from every waiter set. Returns the ids
    /// of pending jobs that lost their last waiter and were cancelled.
    /// Running jobs stay (the result is still worth caching) but will be
    /// answered with a zero consumer count.
    pub fn on_client_disconnect(&mut self, client: ClientId) -> Vec<QueryId> {
        for (job, _) in self.running.values_mut().chain(self.finished.values_mut()) {
            job.clients.remove(&client);
        }

        let mut cancelled = Vec::new();
        self.pending.retain(|id, job| {
            job.clients.remove(&client);
            if job.clients.is_empty() {
                cancelled.push(*id);
                false
            } else {
                true
            }
        });
        cancelled
    }

    /// Pending jobs whose plan references entries on `node`; the caller
    /// re-resolves and requeues them.
    pub fn pending_affected_by_node(&self, node: NodeId) -> Vec<QueryId> {
        self.pending
            .iter()
            .filter(|(_, job)| job.kind.references_node(node))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Running jobs executing on a worker of `node`, to be rebuilt when the
    /// node goes away. Workers are identified by the caller.
    pub fn running_on_workers(&mut self, workers: &[WorkerId]) -> Vec<Job> {
        let mut out = Vec::new();
        for worker in workers {
            if let Some(job) = self.on_worker_disconnect(*worker) {
                out.push(job);
            }
        }
        out
    }
}

/// Counters the coordinator logs at every stats tick.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemStats {
    pub queries: u64,
    /// Requests answered by attaching to an existing job.
    pub attached: u64,
    /// Requests merged into a pending job by rectangle extension.
    pub batched: u64,
    pub jobs_created: u64,
    pub jobs_delivered: u64,
    pub jobs_failed: u64,
    pub index_single_hits: u64,
    pub index_multi_hits: u64,
    pub index_partials: u64,
    pub index_misses: u64,
    pub reorg_passes: u64,
}

impl std::fmt::Display for SystemStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "queries: {} ({} attached, {} batched), jobs: {} created / {} delivered / {} failed, \
             index: {}/{}/{}/{} single/multi/partial/miss, reorgs: {}",
            self.queries,
            self.attached,
            self.batched,
            self.jobs_created,
            self.jobs_delivered,
            self.jobs_failed,
            self.index_single_hits,
            self.index_multi_hits,
            self.index_partials,
            self.index_misses,
            self.reorg_passes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mo_cube::{BoundsCube, Cube3, QueryRect, Resolution, Srs, TimeKind};
    use mo_types::{CacheType, SemanticId};

    fn request(x1: f64, x2: f64, width: u32) -> BaseRequest {
        BaseRequest::new(
            CacheType::Raster,
            SemanticId::from("op/a"),
            QueryRect::new(
                BoundsCube::new(
                    Cube3::from_ranges(x1, x2, 0.0, 10.0, 0.0, 1.0),
                    Srs::LatLon,
                    TimeKind::Unix,
                ),
                Resolution::Pixels { width, height: 100 },
            ),
        )
    }

    #[test]
    fn attach_joins_an_equivalent_pending_job() {
        let mut qm = QueryManager::new(true, 4.0);
        let req = request(0.0, 10.0, 100);
        assert!(!qm.attach(1, &req));
        qm.enqueue(1, req.clone(), JobKind::Create);

        // Same rectangle, second client: joins instead of a second job.
        assert!(qm.attach(2, &req));
        assert_eq!(qm.pending_count(), 1);

        // Contained rectangle at the same scale: still satisfied.
        let contained = request(2.0, 8.0, 60);
        assert!(qm.attach(3, &contained));

        // Different resolution never attaches.
        let finer = request(0.0, 10.0, 400);
        assert!(!qm.attach(4, &finer));
    }

    #[test]
    fn batching_extends_within_the_volume_cap() {
        let mut qm = QueryManager::new(true, 4.0);
        qm.enqueue(1, request(0.0, 10.0, 100), JobKind::Create);

        // 4/3 of the volume: extended.
        assert!(qm.try_extend(2, &request(0.0, 12.0, 120)));
        let id = qm.pending_ids()[0];
        let job = qm.pending_job(id).expect("job");
        assert_eq!(job.clients.len(), 2);
        assert!((job.origin.rect.cube().x().hi - 12.0).abs() < 1e-9);

        // Way past 4× the original volume: refused.
        assert!(!qm.try_extend(3, &request(0.0, 100.0, 1000)));
    }

    #[test]
    fn batching_can_be_disabled() {
        let mut qm = QueryManager::new(false, 4.0);
        qm.enqueue(1, request(0.0, 10.0, 100), JobKind::Create);
        assert!(!qm.try_extend(2, &request(0.0, 12.0, 120)));
    }

    #[test]
    fn lifecycle_pending_running_finished() {
        let mut qm = QueryManager::new(true, 4.0);
        let id = qm.enqueue(1, request(0.0, 10.0, 100), JobKind::Create);
        qm.attach(2, &request(0.0, 10.0, 100));

        let job = qm.take_pending(id).expect("pending");
        qm.mark_running(job, 77);
        assert_eq!(qm.running_count(), 1);

        let (qid, qty) = qm.on_result_ready(77).expect("result ready");
        assert_eq!(qid, id);
        assert_eq!(qty, 2);

        // Late compatible request still attaches in `finished`.
        assert!(qm.attach(3, &request(0.0, 10.0, 100)));

        let job = qm.on_delivery_ready(77).expect("delivery ready");
        assert_eq!(job.clients.len(), 3);
        assert_eq!(qm.running_count(), 0);
    }

    #[test]
    fn worker_death_returns_the_job_for_requeue() {
        let mut qm = QueryManager::new(true, 4.0);
        let id = qm.enqueue(1, request(0.0, 10.0, 100), JobKind::Create);
        let job = qm.take_pending(id).expect("pending");
        qm.mark_running(job, 5);

        let job = qm.on_worker_disconnect(5).expect("job back");
        assert_eq!(job.id, id);
        assert_eq!(job.clients.len(), 1);
        qm.requeue(job);
        assert_eq!(qm.pending_count(), 1);
    }

    #[test]
    fn last_client_cancels_a_pending_job() {
        let mut qm = QueryManager::new(true, 4.0);
        let id = qm.enqueue(9, request(0.0, 10.0, 100), JobKind::Create);
        let cancelled = qm.on_client_disconnect(9);
        assert_eq!(cancelled, vec![id]);
        assert_eq!(qm.pending_count(), 0);
    }

    #[test]
    fn running_jobs_survive_client_loss_with_zero_consumers() {
        let mut qm = QueryManager::new(true, 4.0);
        let id = qm.enqueue(9, request(0.0, 10.0, 100), JobKind::Create);
        let job = qm.take_pending(id).expect("pending");
        qm.mark_running(job, 1);

        assert!(qm.on_client_disconnect(9).is_empty());
        let (_, qty) = qm.on_result_ready(1).expect("result");
        assert_eq!(qty, 0);
    }
}
