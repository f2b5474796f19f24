use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::HashMap;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use itertools::Itertools as _;

use mo_types::{
    BaseRequest, CacheType, DeliveryRequest, DeliveryResponse, EntryRef, NodeHandshake, NodeId,
    PuzzleRequest, StoreUsage,
};
use mo_wire::{
    ClientMsg, ControlMsg, Framed, MoveItem, MoveResult, ReorgTask, WireError, WorkerMsg,
    CONTROL_TIMEOUT, MAGIC_CLIENT, MAGIC_CONTROL, MAGIC_DELIVERY, MAGIC_WORKER,
};

use crate::query_manager::{Job, JobKind, QueryManager, WorkerId};
use crate::{
    ClientId, IndexConfig, IndexDirectory, IndexError, NodeCapacity, NodeHandle, NodeState,
    ReorgPlanner, SystemStats,
};

/// Poll granularity of the per-connection I/O loops; bounds how long a
/// scheduler response waits in an outbox.
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Everything the I/O threads tell the scheduler.
enum Event {
    ClientConnected {
        conn: u64,
        outbox: Sender<ClientMsg>,
    },
    ClientQuery {
        conn: u64,
        request: BaseRequest,
    },
    ClientGone {
        conn: u64,
    },
    NodeHello {
        conn: u64,
        outbox: Sender<ControlMsg>,
        peer_host: String,
        handshake: NodeHandshake,
    },
    FromNode {
        conn: u64,
        msg: ControlMsg,
    },
    NodeGone {
        conn: u64,
    },
    WorkerRegistered {
        conn: u64,
        node: NodeId,
        outbox: Sender<WorkerMsg>,
    },
    FromWorker {
        conn: u64,
        msg: WorkerMsg,
    },
    WorkerGone {
        conn: u64,
    },
}

/// The coordinator process: accept loop plus scheduler thread.
pub struct IndexServer {
    config: IndexConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
}

impl IndexServer {
    /// Binds the listening socket and validates the configured strategy and
    /// relevance names; misconfiguration is fatal before any node attaches.
    pub fn bind(config: IndexConfig) -> Result<Self, IndexError> {
        crate::strategy_by_name(&config.strategy)?;
        crate::relevance_by_name(&config.relevance)?;

        let listener = TcpListener::bind(("0.0.0.0", config.port))?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            config,
            listener,
            local_addr,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Flag that makes [`IndexServer::run`] return when set.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Runs until the stop flag is set. Accepts connections on the calling
    /// thread; all state lives on the scheduler thread.
    pub fn run(self) -> Result<(), IndexError> {
        log::info!("index: listening on {}", self.local_addr);

        let (tx, rx) = bounded::<Event>(self.config.scheduler_queue);
        let scheduler_stop = self.stop.clone();
        let scheduler = {
            let config = self.config.clone();
            std::thread::Builder::new()
                .name("scheduler".into())
                .spawn(move || Scheduler::new(config).run(rx, scheduler_stop))
                .map_err(IndexError::Io)?
        };

        let next_conn = AtomicU64::new(1);
        while !self.stop.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let conn = next_conn.fetch_add(1, Ordering::Relaxed);
                    let tx = tx.clone();
                    let stop = self.stop.clone();
                    std::thread::Builder::new()
                        .name(format!("conn-{conn}"))
                        .spawn(move || connection_loop(conn, stream, peer, tx, stop))
                        .map_err(IndexError::Io)?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    log::error!("index: accept failed: {e}");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }

        drop(tx);
        scheduler.join().ok();
        log::info!("index: stopped");
        Ok(())
    }
}

/// One thread per accepted connection: parse frames, post events, drain the
/// outbox. The scheduler never sees a socket.
fn connection_loop(
    conn: u64,
    stream: TcpStream,
    peer: SocketAddr,
    tx: Sender<Event>,
    stop: Arc<AtomicBool>,
) {
    let mut framed = Framed::from_stream(stream);
    let magic = match framed.read_magic(CONTROL_TIMEOUT) {
        Ok(magic) => magic,
        Err(e) => {
            log::debug!("conn {conn}: no magic from {peer}: {e}");
            return;
        }
    };

    let result = match magic {
        MAGIC_CLIENT => client_loop(conn, &mut framed, &tx, &stop),
        MAGIC_CONTROL => control_loop(conn, &mut framed, peer, &tx, &stop),
        MAGIC_WORKER => worker_loop(conn, &mut framed, &tx, &stop),
        MAGIC_DELIVERY => {
            log::warn!("conn {conn}: delivery connection to the coordinator refused");
            return;
        }
        other => {
            log::warn!("conn {conn}: unknown magic {other:?} from {peer}");
            return;
        }
    };

    if let Err(e) = result {
        match e {
            WireError::Disconnected => log::debug!("conn {conn}: {peer} disconnected"),
            other => log::warn!("conn {conn}: dropping {peer}: {other}"),
        }
    }
}

fn client_loop(
    conn: u64,
    framed: &mut Framed,
    tx: &Sender<Event>,
    stop: &AtomicBool,
) -> Result<(), WireError> {
    let (outbox_tx, outbox_rx) = bounded::<ClientMsg>(32);
    let _ = tx.send(Event::ClientConnected {
        conn,
        outbox: outbox_tx,
    });

    let result = loop {
        if stop.load(Ordering::Relaxed) {
            break Ok(());
        }
        while let Ok(msg) = outbox_rx.try_recv() {
            if let Err(e) = msg.send(framed) {
                let _ = tx.send(Event::ClientGone { conn });
                return Err(e);
            }
        }
        match ClientMsg::recv(framed, POLL_TIMEOUT) {
            Ok(ClientMsg::Query(request)) => {
                let _ = tx.send(Event::ClientQuery { conn, request });
            }
            Ok(other) => {
                log::warn!("conn {conn}: unexpected client message {other:?}");
            }
            Err(WireError::Timeout) => {}
            Err(e) => break Err(e),
        }
    };
    let _ = tx.send(Event::ClientGone { conn });
    result
}

fn control_loop(
    conn: u64,
    framed: &mut Framed,
    peer: SocketAddr,
    tx: &Sender<Event>,
    stop: &AtomicBool,
) -> Result<(), WireError> {
    // The node leads with its handshake.
    let handshake = match ControlMsg::recv(framed, CONTROL_TIMEOUT)? {
        ControlMsg::Hello(handshake) => handshake,
        other => {
            return Err(WireError::protocol(format!(
                "expected HELLO, got {other:?}"
            )));
        }
    };

    let (outbox_tx, outbox_rx) = bounded::<ControlMsg>(32);
    let _ = tx.send(Event::NodeHello {
        conn,
        outbox: outbox_tx,
        peer_host: peer.ip().to_string(),
        handshake,
    });

    let result = loop {
        if stop.load(Ordering::Relaxed) {
            break Ok(());
        }
        while let Ok(msg) = outbox_rx.try_recv() {
            if let Err(e) = msg.send(framed) {
                let _ = tx.send(Event::NodeGone { conn });
                return Err(e);
            }
        }
        match ControlMsg::recv(framed, POLL_TIMEOUT) {
            Ok(msg) => {
                let _ = tx.send(Event::FromNode { conn, msg });
            }
            Err(WireError::Timeout) => {}
            Err(e) => break Err(e),
        }
    };
    let _ = tx.send(Event::NodeGone { conn });
    result
}

fn worker_loop(
    conn: u64,
    framed: &mut Framed,
    tx: &Sender<Event>,
    stop: &AtomicBool,
) -> Result<(), WireError> {
    let node = mo_wire::read_worker_registration(framed, CONTROL_TIMEOUT)?;

    let (outbox_tx, outbox_rx) = bounded::<WorkerMsg>(32);
    let _ = tx.send(Event::WorkerRegistered {
        conn,
        node,
        outbox: outbox_tx,
    });

    let result = loop {
        if stop.load(Ordering::Relaxed) {
            break Ok(());
        }
        while let Ok(msg) = outbox_rx.try_recv() {
            if let Err(e) = msg.send(framed) {
                let _ = tx.send(Event::WorkerGone { conn });
                return Err(e);
            }
        }
        match WorkerMsg::recv(framed, POLL_TIMEOUT) {
            Ok(msg) => {
                let _ = tx.send(Event::FromWorker { conn, msg });
            }
            Err(WireError::Timeout) => {}
            Err(e) => break Err(e),
        }
    };
    let _ = tx.send(Event::WorkerGone { conn });
    result
}

// --- Scheduler ---

struct WorkerHandle {
    node: NodeId,
    outbox: Sender<WorkerMsg>,
    busy: bool,
}

/// Owns every table; the only thread that mutates coordinator state.
struct Scheduler {
    config: IndexConfig,
    directory: IndexDirectory,
    qm: QueryManager,
    stats: SystemStats,
    planners: HashMap<CacheType, ReorgPlanner>,
    nodes: BTreeMap<NodeId, NodeHandle>,
    node_by_conn: HashMap<u64, NodeId>,
    workers: HashMap<WorkerId, WorkerHandle>,
    clients: HashMap<ClientId, Sender<ClientMsg>>,
    next_node_id: u32,
    /// REORG messages sent but not yet answered with REORG_DONE; no new pass
    /// starts while this is non-zero.
    reorg_outstanding: usize,
    last_reorg: Instant,
    last_stats: Instant,
}

impl Scheduler {
    fn new(config: IndexConfig) -> Self {
        let mut planners = HashMap::default();
        for cache_type in CacheType::ALL {
            let planner = ReorgPlanner::from_names(
                cache_type,
                &config.strategy,
                &config.relevance,
                config.target_usage,
                config.usage_cv_threshold,
            )
            .expect("names validated at bind time");
            planners.insert(cache_type, planner);
        }
        Self {
            qm: QueryManager::new(config.batching, config.max_batch_volume),
            config,
            directory: IndexDirectory::new(),
            stats: SystemStats::default(),
            planners,
            nodes: BTreeMap::new(),
            node_by_conn: HashMap::default(),
            workers: HashMap::default(),
            clients: HashMap::default(),
            next_node_id: 1,
            reorg_outstanding: 0,
            last_reorg: Instant::now(),
            last_stats: Instant::now(),
        }
    }

    fn run(mut self, rx: Receiver<Event>, stop: Arc<AtomicBool>) {
        loop {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            match rx.recv_timeout(POLL_TIMEOUT) {
                Ok(event) => {
                    self.handle(event);
                    while let Ok(event) = rx.try_recv() {
                        self.handle(event);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }

            if self.last_reorg.elapsed() >= self.config.reorg_interval {
                self.last_reorg = Instant::now();
                self.reorg_tick();
            }
            if self.last_stats.elapsed() >= self.config.stats_interval {
                self.last_stats = Instant::now();
                self.stats_tick();
            }
        }
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::ClientConnected { conn, outbox } => {
                self.clients.insert(conn, outbox);
            }
            Event::ClientQuery { conn, request } => {
                self.stats.queries += 1;
                self.handle_request(conn, request);
                self.schedule();
            }
            Event::ClientGone { conn } => {
                self.clients.remove(&conn);
                let cancelled = self.qm.on_client_disconnect(conn);
                for id in &cancelled {
                    log::debug!("query {id}: cancelled, last client disconnected");
                }
            }
            Event::NodeHello {
                conn,
                outbox,
                peer_host,
                handshake,
            } => {
                self.handle_hello(conn, outbox, peer_host, handshake);
                self.schedule();
            }
            Event::FromNode { conn, msg } => {
                if let Some(node_id) = self.node_by_conn.get(&conn).copied() {
                    self.handle_node_msg(node_id, msg);
                } else {
                    log::warn!("control message from unknown connection {conn}");
                }
            }
            Event::NodeGone { conn } => {
                if let Some(node_id) = self.node_by_conn.remove(&conn) {
                    self.handle_node_gone(node_id);
                    self.schedule();
                }
            }
            Event::WorkerRegistered { conn, node, outbox } => {
                if self.nodes.contains_key(&node) {
                    self.workers.insert(
                        conn,
                        WorkerHandle {
                            node,
                            outbox,
                            busy: false,
                        },
                    );
                    self.schedule();
                } else {
                    log::warn!("worker for unknown node {node} refused");
                }
            }
            Event::FromWorker { conn, msg } => {
                self.handle_worker_msg(conn, msg);
                self.schedule();
            }
            Event::WorkerGone { conn } => {
                if let Some(handle) = self.workers.remove(&conn) {
                    if handle.busy {
                        if let Some(job) = self.qm.on_worker_disconnect(conn) {
                            log::info!("query {}: worker died, rebuilding", job.id);
                            self.rebuild_job(job);
                        }
                    }
                    self.schedule();
                }
            }
        }
    }

    // --- Nodes ---

    fn handle_hello(
        &mut self,
        conn: u64,
        outbox: Sender<ControlMsg>,
        peer_host: String,
        handshake: NodeHandshake,
    ) {
        let node_id = NodeId(self.next_node_id);
        self.next_node_id += 1;

        let mut usage = HashMap::default();
        for (cache_type, capacity) in &handshake.capacities {
            usage.insert(
                *cache_type,
                StoreUsage {
                    used: 0,
                    capacity: *capacity,
                },
            );
        }

        let mut handle = NodeHandle {
            id: node_id,
            host: peer_host.clone(),
            delivery_port: handshake.delivery_port,
            state: NodeState::Handshaking,
            outbox,
            usage,
        };
        handle.send(ControlMsg::Welcome {
            node_id,
            host: peer_host.clone(),
        });
        handle.state = NodeState::Active;

        let entries = handshake.entries.len();
        let delivery_port = handshake.delivery_port;
        for snapshot in handshake.entries {
            self.directory.publish(node_id, snapshot);
        }

        self.node_by_conn.insert(conn, node_id);
        self.nodes.insert(node_id, handle);

        log::info!(
            "node {node_id} attached from {peer_host}:{delivery_port} with {entries} warm entries"
        );
    }

    fn handle_node_msg(&mut self, node_id: NodeId, msg: ControlMsg) {
        match msg {
            ControlMsg::ReorgDone => {
                self.reorg_outstanding = self.reorg_outstanding.saturating_sub(1);
                log::debug!("node {node_id}: reorg done ({} left)", self.reorg_outstanding);
            }
            ControlMsg::Moved(MoveResult {
                cache_type,
                semantic_id,
                old,
                new,
            }) => {
                self.directory
                    .apply_move(cache_type, &semantic_id, old, new);
                if let Some(node) = self.nodes.get(&node_id) {
                    node.send(ControlMsg::MoveOk);
                }
            }
            ControlMsg::Stats(stats) => {
                if let Some(node) = self.nodes.get_mut(&node_id) {
                    for (cache_type, usage) in &stats.usage {
                        node.usage.insert(*cache_type, *usage);
                    }
                }
                self.directory.update_access(node_id, &stats.access);
                for key in &stats.removed {
                    self.directory.confirm_removal(node_id, key);
                }
                log::debug!("node {node_id}: {}", stats.query);
            }
            ControlMsg::Bye => {
                log::info!("node {node_id}: draining");
                self.detach_node(node_id, NodeState::Draining);
                self.fail_pending_without_nodes();
            }
            other => {
                log::warn!("node {node_id}: unexpected control message {other:?}");
            }
        }
    }

    fn handle_node_gone(&mut self, node_id: NodeId) {
        log::warn!("node {node_id}: connection lost");
        self.detach_node(node_id, NodeState::Gone);

        // Workers of that node die with it; rebuild whatever they ran.
        let worker_ids: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, w)| w.node == node_id)
            .map(|(id, _)| *id)
            .collect();
        for wid in worker_ids {
            self.workers.remove(&wid);
            if let Some(job) = self.qm.on_worker_disconnect(wid) {
                self.rebuild_job(job);
            }
        }

        if matches!(
            self.nodes.get(&node_id),
            Some(NodeHandle {
                state: NodeState::Gone,
                ..
            })
        ) {
            self.nodes.remove(&node_id);
        }
        self.fail_pending_without_nodes();
    }

    /// With no active node left, parked jobs can never run; every waiter
    /// gets its error now rather than a silent hang.
    fn fail_pending_without_nodes(&mut self) {
        if self.nodes.values().any(NodeHandle::is_active) {
            return;
        }
        for id in self.qm.pending_ids() {
            if let Some(job) = self.qm.take_pending(id) {
                log::warn!("query {}: failed, no cache nodes attached", job.id);
                self.stats.jobs_failed += 1;
                for client in &job.clients {
                    self.respond(*client, ClientMsg::Error("no cache nodes attached".into()));
                }
            }
        }
    }

    /// Shared drain/fail path: the node stops receiving work and its entries
    /// leave the index; jobs planning to use them are rebuilt.
    fn detach_node(&mut self, node_id: NodeId, state: NodeState) {
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.state = state;
        }
        let expunged = self.directory.remove_node(node_id);
        if expunged > 0 {
            log::info!("node {node_id}: expunged {expunged} index entries");
        }
        for planner in self.planners.values_mut() {
            planner.node_failed(node_id);
        }

        for id in self.qm.pending_affected_by_node(node_id) {
            if let Some(job) = self.qm.take_pending(id) {
                log::info!("query {}: plan referenced {node_id}, rebuilding", job.id);
                self.rebuild_job(job);
            }
        }
    }

    // --- Workers ---

    fn handle_worker_msg(&mut self, conn: WorkerId, msg: WorkerMsg) {
        let Some(node_id) = self.workers.get(&conn).map(|w| w.node) else {
            log::warn!("message from unregistered worker {conn}");
            return;
        };

        match msg {
            WorkerMsg::ResultReady(snapshots) => {
                for snapshot in snapshots {
                    self.directory.publish(node_id, snapshot);
                }
                let qty = match self.qm.on_result_ready(conn) {
                    Some((_, qty)) => qty,
                    None => 0,
                };
                if let Some(worker) = self.workers.get(&conn) {
                    let _ = worker.outbox.try_send(WorkerMsg::DeliveryQty(qty));
                }
            }
            WorkerMsg::DeliveryReady(delivery_id) => {
                if let Some(worker) = self.workers.get_mut(&conn) {
                    worker.busy = false;
                }
                let Some(job) = self.qm.on_delivery_ready(conn) else {
                    return;
                };
                if delivery_id == 0 {
                    log::debug!("query {}: no consumers, delivery skipped", job.id);
                    return;
                }
                let Some(node) = self.nodes.get(&node_id) else {
                    return;
                };
                let response = DeliveryResponse {
                    host: node.host.clone(),
                    port: node.delivery_port,
                    delivery_id,
                };
                self.stats.jobs_delivered += 1;
                for client in &job.clients {
                    self.respond(*client, ClientMsg::Delivery(response.clone()));
                }
            }
            WorkerMsg::Error(message) => {
                if let Some(worker) = self.workers.get_mut(&conn) {
                    worker.busy = false;
                }
                if let Some(job) = self.qm.on_worker_error(conn) {
                    log::warn!("query {}: failed: {message}", job.id);
                    self.stats.jobs_failed += 1;
                    for client in &job.clients {
                        self.respond(*client, ClientMsg::Error(message.clone()));
                    }
                }
            }
            other => {
                log::warn!("worker {conn}: unexpected message {other:?}");
            }
        }
    }

    // --- Requests ---

    fn handle_request(&mut self, client: ClientId, request: BaseRequest) {
        log::debug!("client {client}: {request}");

        if self.qm.attach(client, &request) {
            self.stats.attached += 1;
            return;
        }
        if self.qm.try_extend(client, &request) {
            self.stats.batched += 1;
            return;
        }

        if !self.nodes.values().any(NodeHandle::is_active) {
            self.respond(client, ClientMsg::Error("no cache nodes attached".into()));
            return;
        }

        let kind = self.plan_request(&request);
        self.stats.jobs_created += 1;
        let id = self.qm.enqueue(client, request, kind);
        log::debug!("query {id}: queued");
    }

    /// Consults the resolver and builds the job kind for a fresh request.
    fn plan_request(&mut self, request: &BaseRequest) -> JobKind {
        use mo_cube::CoverResult;

        let query = request.rect.to_query_cube();
        match self
            .directory
            .resolve(request.cache_type, &request.semantic_id, &query)
        {
            CoverResult::Hit(entry_ref) => {
                self.stats.index_single_hits += 1;
                let bounds = self
                    .directory
                    .get(request.cache_type, entry_ref)
                    .map(|e| e.info.cube)
                    .expect("resolver returned the ref");
                JobKind::Deliver {
                    request: DeliveryRequest {
                        cache_type: request.cache_type,
                        semantic_id: request.semantic_id.clone(),
                        entry_id: entry_ref.entry,
                    },
                    entry: entry_ref,
                    bounds,
                }
            }
            CoverResult::Partial(plan) => {
                if plan.remainders.is_empty() {
                    self.stats.index_multi_hits += 1;
                } else {
                    self.stats.index_partials += 1;
                }
                self.build_puzzle(request, plan)
            }
            CoverResult::Miss => {
                self.stats.index_misses += 1;
                JobKind::Create
            }
        }
    }

    fn build_puzzle(
        &self,
        request: &BaseRequest,
        plan: mo_cube::CoverPlan<EntryRef>,
    ) -> JobKind {
        // Priority-order the pieces by their owner's byte share, so the
        // preferred node (largest share) leads.
        let mut bytes_by_node: HashMap<NodeId, u64> = HashMap::default();
        for entry_ref in &plan.keys {
            if let Some(entry) = self.directory.get(request.cache_type, *entry_ref) {
                *bytes_by_node.entry(entry_ref.node).or_default() += entry.info.byte_size;
            }
        }

        let parts = plan
            .keys
            .iter()
            .sorted_by_key(|r| {
                (
                    std::cmp::Reverse(bytes_by_node.get(&r.node).copied().unwrap_or(0)),
                    r.node,
                    r.entry,
                )
            })
            .filter_map(|entry_ref| {
                let entry = self.directory.get(request.cache_type, *entry_ref)?;
                let node = self.nodes.get(&entry_ref.node)?;
                Some(mo_types::CacheRef {
                    node_id: entry_ref.node,
                    host: node.host.clone(),
                    port: node.delivery_port,
                    entry_id: entry_ref.entry,
                    bounds: entry.info.cube,
                })
            })
            .collect::<Vec<_>>();

        let remainders = plan
            .remainders
            .iter()
            .map(|cube| request.rect.sub_rect(*cube))
            .collect();

        JobKind::Puzzle {
            request: PuzzleRequest {
                base: request.clone(),
                parts,
                remainders,
            },
            refs: plan.keys,
        }
    }

    /// Re-plans a job against the current index; the waiters stay attached.
    /// A deliver job whose only source vanished degrades to a create job.
    fn rebuild_job(&mut self, mut job: Job) {
        let kind = self.plan_request(&job.origin);
        job.kind = kind;
        self.qm.requeue(job);
    }

    // --- Scheduling ---

    /// Dispatches every pending job whose preferred node has an idle worker,
    /// oldest job first.
    fn schedule(&mut self) {
        for id in self.qm.pending_ids() {
            let Some(job) = self.qm.pending_job(id) else {
                continue;
            };
            let Some(node_id) = self.preferred_node(job) else {
                continue;
            };
            let Some(worker_id) = self.idle_worker_on(node_id) else {
                continue;
            };

            let job = self.qm.take_pending(id).expect("still pending");
            let msg = match &job.kind {
                JobKind::Deliver { request, .. } => WorkerMsg::Deliver(request.clone()),
                JobKind::Puzzle { request, .. } => WorkerMsg::Puzzle(request.clone()),
                JobKind::Create => WorkerMsg::Create(job.origin.clone()),
            };
            let worker = self.workers.get_mut(&worker_id).expect("idle worker");
            if worker.outbox.try_send(msg).is_err() {
                log::warn!("worker {worker_id}: outbox closed, skipping dispatch");
                self.qm.requeue(job);
                continue;
            }
            worker.busy = true;
            log::debug!("query {}: dispatched to {} (worker {worker_id})", job.id, node_id);
            self.qm.mark_running(job, worker_id);
        }
    }

    fn preferred_node(&self, job: &Job) -> Option<NodeId> {
        match &job.kind {
            JobKind::Deliver { entry, .. } => self
                .nodes
                .get(&entry.node)
                .filter(|n| n.is_active())
                .map(|n| n.id),
            JobKind::Puzzle { refs, .. } => {
                // The node owning the largest byte share of the puzzle; ties
                // by lowest usage ratio, then lowest id.
                let mut bytes_by_node: HashMap<NodeId, u64> = HashMap::default();
                for entry_ref in refs {
                    let bytes = self
                        .directory
                        .get(job.origin.cache_type, *entry_ref)
                        .map(|e| e.info.byte_size)
                        .unwrap_or(0);
                    *bytes_by_node.entry(entry_ref.node).or_default() += bytes;
                }
                bytes_by_node
                    .into_iter()
                    .filter(|(node, _)| {
                        self.nodes.get(node).is_some_and(NodeHandle::is_active)
                    })
                    .max_by(|(a_node, a_bytes), (b_node, b_bytes)| {
                        a_bytes.cmp(b_bytes).then_with(|| {
                            let a_ratio = self.node_usage(*a_node, job.origin.cache_type).ratio();
                            let b_ratio = self.node_usage(*b_node, job.origin.cache_type).ratio();
                            b_ratio.total_cmp(&a_ratio).then(b_node.cmp(a_node))
                        })
                    })
                    .map(|(node, _)| node)
            }
            JobKind::Create => {
                let capacities = self.capacities_of(job.origin.cache_type);
                self.planners[&job.origin.cache_type].pick_node(&job.origin, &capacities)
            }
        }
    }

    fn idle_worker_on(&self, node: NodeId) -> Option<WorkerId> {
        self.workers
            .iter()
            .filter(|(_, w)| w.node == node && !w.busy)
            .map(|(id, _)| *id)
            .min()
    }

    // --- Usage & reorg ---

    /// Byte usage as the directory sees it: fresher than the node-reported
    /// numbers, which only arrive with the stats tick.
    fn node_usage(&self, node: NodeId, cache_type: CacheType) -> StoreUsage {
        let capacity = self
            .nodes
            .get(&node)
            .map(|n| n.usage_of(cache_type).capacity)
            .unwrap_or(0);
        let used = self
            .directory
            .entries_of_type(cache_type)
            .iter()
            .filter(|e| e.node == node)
            .map(|e| e.info.byte_size)
            .sum();
        StoreUsage { used, capacity }
    }

    fn capacities_of(&self, cache_type: CacheType) -> Vec<NodeCapacity> {
        self.nodes
            .values()
            .filter(|n| n.is_active())
            .map(|n| NodeCapacity {
                id: n.id,
                usage: self.node_usage(n.id, cache_type),
            })
            .collect()
    }

    fn reorg_tick(&mut self) {
        if self.reorg_outstanding > 0 {
            return;
        }
        for cache_type in CacheType::ALL {
            let capacities = self.capacities_of(cache_type);
            if capacities.is_empty() {
                continue;
            }
            let planner = self
                .planners
                .get_mut(&cache_type)
                .expect("planner per type");
            if !planner.requires_reorg(&capacities) {
                continue;
            }

            let entries: Vec<_> = self
                .directory
                .entries_of_type(cache_type)
                .into_iter()
                .cloned()
                .collect();
            let plan = planner.plan(&capacities, entries);
            if plan.removals.is_empty() && plan.moves.is_empty() {
                continue;
            }
            self.stats.reorg_passes += 1;
            log::info!(
                "reorg {cache_type}: {} removals, {} moves",
                plan.removals.len(),
                plan.moves.len()
            );

            let mut tasks: BTreeMap<NodeId, ReorgTask> = BTreeMap::new();
            for entry in plan.removals {
                tasks
                    .entry(entry.node)
                    .or_default()
                    .removals
                    .push(mo_types::TypedKey::new(
                        cache_type,
                        entry.semantic_id.clone(),
                        entry.entry_id,
                    ));
                // The index stops advertising removed entries right away; the
                // node applies the removal when it processes the task.
                self.directory.remove(cache_type, entry.entry_ref());
            }
            for (entry, destination) in plan.moves {
                let Some(source) = self.nodes.get(&entry.node) else {
                    continue;
                };
                tasks
                    .entry(destination)
                    .or_default()
                    .moves
                    .push(MoveItem {
                        cache_type,
                        semantic_id: entry.semantic_id.clone(),
                        entry_id: entry.entry_id,
                        source_node: entry.node,
                        source_host: source.host.clone(),
                        source_port: source.delivery_port,
                    });
            }

            for (node_id, task) in tasks {
                if task.is_empty() {
                    continue;
                }
                if let Some(node) = self.nodes.get(&node_id) {
                    node.send(ControlMsg::Reorg(task));
                    self.reorg_outstanding += 1;
                }
            }
        }
    }

    fn stats_tick(&mut self) {
        for node in self.nodes.values().filter(|n| n.is_active()) {
            node.send(ControlMsg::StatsRequest);
        }
        log::debug!("index: {}", self.stats);
    }

    fn respond(&self, client: ClientId, msg: ClientMsg) {
        if let Some(outbox) = self.clients.get(&client) {
            if outbox.try_send(msg).is_err() {
                log::debug!("client {client}: outbox unavailable");
            }
        }
    }
}
