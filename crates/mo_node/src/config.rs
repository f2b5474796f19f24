use std::time::Duration;

use mo_types::CacheType;

/// Errors of the node process.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] mo_wire::WireError),
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub index_host: String,
    pub index_port: u16,

    /// Port of the delivery service; 0 picks an ephemeral port.
    pub delivery_port: u16,
    /// Worker threads pulling jobs from the coordinator.
    pub workers: usize,

    /// Byte budget per cache type.
    pub capacities: Vec<(CacheType, u64)>,
    /// Multiplicative widening of resolution validity (`1.0` = exact scale).
    pub resolution_tolerance: f64,

    /// Wall-clock lifetime of an unconsumed delivery.
    pub delivery_ttl: Duration,
    /// Pause before re-dialing a lost coordinator.
    pub reconnect_delay: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            index_host: "127.0.0.1".into(),
            index_port: 10400,
            delivery_port: 0,
            workers: 2,
            capacities: CacheType::ALL
                .iter()
                .map(|t| (*t, 64 * 1024 * 1024))
                .collect(),
            resolution_tolerance: 1.0,
            delivery_ttl: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

impl NodeConfig {
    pub fn index_addr(&self) -> (String, u16) {
        (self.index_host.clone(), self.index_port)
    }
}
