use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mo_types::{EntryRef, Producer};
use mo_wire::{
    ControlMsg, DeliveryMsg, Framed, MoveItem, MoveResult, ReorgTask, WireError, CONTROL_TIMEOUT,
    DELIVERY_TIMEOUT, MAGIC_CONTROL, MAGIC_DELIVERY,
};

use crate::manager::local_key;
use crate::{delivery, worker, DeliveryPool, NodeConfig, NodeError, NodeManager};

/// How long a stopping node keeps its delivery service up for unconsumed
/// reservations.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// The cache-node process: control connection, workers, delivery service.
pub struct NodeServer {
    config: NodeConfig,
    manager: Arc<NodeManager>,
    pool: Arc<DeliveryPool>,
    delivery_listener: Option<TcpListener>,
    delivery_port: u16,
    stop: Arc<AtomicBool>,
}

impl NodeServer {
    pub fn new(config: NodeConfig, producer: Arc<dyn Producer>) -> Result<Self, NodeError> {
        let delivery_listener = TcpListener::bind(("0.0.0.0", config.delivery_port))?;
        let delivery_port = delivery_listener.local_addr()?.port();
        let manager = Arc::new(NodeManager::new(&config, producer));
        let pool = Arc::new(DeliveryPool::new(config.delivery_ttl));
        Ok(Self {
            config,
            manager,
            pool,
            delivery_listener: Some(delivery_listener),
            delivery_port,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn delivery_port(&self) -> u16 {
        self.delivery_port
    }

    pub fn manager(&self) -> Arc<NodeManager> {
        self.manager.clone()
    }

    /// Flag that makes [`NodeServer::run`] drain and return when set.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Runs until the stop flag is set, reconnecting to the coordinator
    /// whenever the control connection is lost.
    pub fn run(mut self) -> Result<(), NodeError> {
        log::info!(
            "node: delivery on port {}, coordinator at {}:{}",
            self.delivery_port,
            self.config.index_host,
            self.config.index_port
        );

        let delivery_stop = Arc::new(AtomicBool::new(false));
        let acceptor = {
            let listener = self
                .delivery_listener
                .take()
                .expect("listener present until run");
            let manager = self.manager.clone();
            let pool = self.pool.clone();
            let delivery_stop = delivery_stop.clone();
            std::thread::Builder::new()
                .name("delivery-acceptor".into())
                .spawn(move || delivery::acceptor_loop(listener, manager, pool, delivery_stop))
                .map_err(NodeError::Io)?
        };

        while !self.stop.load(Ordering::Relaxed) {
            match self.serve_control() {
                Ok(()) => break, // voluntary stop
                Err(e) => {
                    log::warn!(
                        "node: lost coordinator ({e}), retrying in {:?}",
                        self.config.reconnect_delay
                    );
                    std::thread::sleep(self.config.reconnect_delay);
                }
            }
        }

        // Draining: deliveries keep streaming until consumed or the grace
        // period runs out.
        let deadline = Instant::now() + DRAIN_GRACE;
        while !self.pool.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        delivery_stop.store(true, Ordering::Relaxed);
        acceptor.join().ok();
        log::info!("node: stopped");
        Ok(())
    }

    /// One control-connection lifetime: handshake, spawn workers, serve
    /// commands. Returns `Ok` only on voluntary shutdown.
    fn serve_control(&self) -> Result<(), NodeError> {
        let mut framed = Framed::connect(
            (self.config.index_host.as_str(), self.config.index_port),
            MAGIC_CONTROL,
        )?;
        ControlMsg::Hello(self.manager.handshake(self.delivery_port)).send(&mut framed)?;

        let (node_id, observed_host) = loop {
            match ControlMsg::recv(&mut framed, Duration::from_secs(5))? {
                ControlMsg::Welcome { node_id, host } => break (node_id, host),
                other => {
                    return Err(NodeError::Wire(WireError::protocol(format!(
                        "expected WELCOME, got {other:?}"
                    ))));
                }
            }
        };
        self.manager.set_identity(node_id, observed_host.clone());
        log::info!("node: attached as {node_id} (observed as {observed_host})");

        // Workers live exactly as long as this control connection; a fresh
        // connection may mean a fresh node id.
        let alive = Arc::new(AtomicBool::new(true));
        let mut workers = Vec::with_capacity(self.config.workers);
        for i in 0..self.config.workers {
            let manager = self.manager.clone();
            let pool = self.pool.clone();
            let addr = self.config.index_addr();
            let alive = alive.clone();
            let stop = self.stop.clone();
            let delay = self.config.reconnect_delay;
            workers.push(
                std::thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || worker::worker_loop(manager, pool, addr, alive, stop, delay))
                    .map_err(NodeError::Io)?,
            );
        }

        let result = loop {
            if self.stop.load(Ordering::Relaxed) {
                // Voluntary shutdown: announce the drain, then leave.
                ControlMsg::Bye.send(&mut framed).ok();
                break Ok(());
            }
            match ControlMsg::recv(&mut framed, CONTROL_TIMEOUT) {
                Ok(ControlMsg::Reorg(task)) => {
                    if let Err(e) = self.handle_reorg(&mut framed, task) {
                        break Err(NodeError::Wire(e));
                    }
                }
                Ok(ControlMsg::StatsRequest) => {
                    if let Err(e) = ControlMsg::Stats(self.manager.stats_delta()).send(&mut framed)
                    {
                        break Err(NodeError::Wire(e));
                    }
                }
                Ok(other) => {
                    log::warn!("node: unexpected control command {other:?}");
                }
                Err(WireError::Timeout) => {}
                Err(e) => break Err(NodeError::Wire(e)),
            }
        };

        alive.store(false, Ordering::Relaxed);
        for handle in workers {
            handle.join().ok();
        }
        result
    }

    /// Applies a reorg task: removals first, then moves, then the
    /// completion report.
    fn handle_reorg(&self, control: &mut Framed, task: ReorgTask) -> Result<(), WireError> {
        log::debug!(
            "node: reorg with {} removals, {} moves",
            task.removals.len(),
            task.moves.len()
        );

        for key in &task.removals {
            let store = self.manager.store(key.cache_type);
            if let Err(e) = store.remove(&local_key(&key.semantic_id, key.entry_id)) {
                log::debug!("node: reorg removal: {e}");
            }
        }

        for item in &task.moves {
            self.move_in(control, item)?;
        }

        ControlMsg::ReorgDone.send(control)
    }

    /// The destination side of a move: pull the entry from the source,
    /// install it, report `MOVED`, and only after the coordinator's `MOVE_OK`
    /// tell the source to drop its copy. Any failure discards the
    /// half-installed entry; the index is never left pointing at nothing.
    fn move_in(&self, control: &mut Framed, item: &MoveItem) -> Result<(), WireError> {
        let Some(my_id) = self.manager.node_id() else {
            return Ok(());
        };
        log::debug!(
            "node: moving {} in from {} ({}:{})",
            item.typed_key(),
            item.source_node,
            item.source_host,
            item.source_port
        );

        let mut source = match Framed::connect(
            (item.source_host.as_str(), item.source_port),
            MAGIC_DELIVERY,
        ) {
            Ok(framed) => framed,
            Err(e) => {
                log::warn!("node: move source unreachable: {e}");
                return Ok(());
            }
        };
        if let Err(e) = DeliveryMsg::MoveItem(item.typed_key()).send(&mut source) {
            log::warn!("node: move request failed: {e}");
            return Ok(());
        }
        let (info, payload) = match DeliveryMsg::recv(&mut source, DELIVERY_TIMEOUT) {
            Ok(DeliveryMsg::MovePayload { info, payload }) => (info, payload),
            Ok(DeliveryMsg::Error(message)) => {
                log::warn!("node: source refused move: {message}");
                return Ok(());
            }
            Ok(other) => {
                log::warn!("node: unexpected move response {other:?}");
                return Ok(());
            }
            Err(e) => {
                log::warn!("node: move transfer failed: {e}");
                return Ok(());
            }
        };

        let store = self.manager.store(item.cache_type);
        let new_id = match store.install(&item.semantic_id, payload.into(), info) {
            Ok(id) => id,
            Err(e) => {
                log::warn!("node: cannot install moved entry: {e}");
                return Ok(());
            }
        };

        ControlMsg::Moved(MoveResult {
            cache_type: item.cache_type,
            semantic_id: item.semantic_id.clone(),
            old: EntryRef::new(item.source_node, item.entry_id),
            new: EntryRef::new(my_id, new_id),
        })
        .send(control)?;

        // Await the index confirmation; stats requests may interleave.
        let mut confirmed = false;
        for _ in 0..5 {
            match ControlMsg::recv(control, CONTROL_TIMEOUT) {
                Ok(ControlMsg::MoveOk) => {
                    confirmed = true;
                    break;
                }
                Ok(ControlMsg::StatsRequest) => {
                    ControlMsg::Stats(self.manager.stats_delta()).send(control)?;
                }
                Ok(other) => {
                    log::warn!("node: unexpected message awaiting MOVE_OK: {other:?}");
                }
                Err(WireError::Timeout) => {}
                Err(e) => return Err(e),
            }
        }

        if confirmed {
            DeliveryMsg::MoveDone.send(&mut source).ok();
            log::debug!("node: move of {} complete as {new_id}", item.typed_key());
        } else {
            log::warn!(
                "node: move of {} unconfirmed, discarding local copy",
                item.typed_key()
            );
            store
                .remove(&local_key(&item.semantic_id, new_id))
                .ok();
        }
        Ok(())
    }
}
