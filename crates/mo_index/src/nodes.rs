use ahash::HashMap;
use crossbeam::channel::Sender;

use mo_types::{CacheType, NodeId, StoreUsage};
use mo_wire::ControlMsg;

/// Lifecycle of a node at the coordinator.
///
/// Only `Active` nodes receive jobs. `Draining` nodes announced a voluntary
/// shutdown: their entries are already expunged from the index and no new
/// work is sent, but they keep streaming deliveries until they exit. `Gone`
/// is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Handshaking,
    Active,
    Draining,
    Gone,
}

/// Everything the coordinator tracks about one attached node.
pub struct NodeHandle {
    pub id: NodeId,
    /// Observed peer address of the control connection.
    pub host: String,
    pub delivery_port: u16,
    pub state: NodeState,
    /// Outbox drained by the control connection's I/O thread.
    pub outbox: Sender<ControlMsg>,
    pub usage: HashMap<CacheType, StoreUsage>,
}

impl NodeHandle {
    pub fn usage_of(&self, cache_type: CacheType) -> StoreUsage {
        self.usage.get(&cache_type).copied().unwrap_or_default()
    }

    pub fn is_active(&self) -> bool {
        self.state == NodeState::Active
    }

    /// Queues a message for the node; a full or closed outbox means the
    /// connection is on its way down, which the disconnect path handles.
    pub fn send(&self, msg: ControlMsg) {
        if let Err(err) = self.outbox.try_send(msg) {
            log::warn!("node {}: control outbox unavailable: {err}", self.id);
        }
    }
}
