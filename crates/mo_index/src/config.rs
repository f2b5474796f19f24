use std::time::Duration;

/// Fatal coordinator errors.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Unknown strategy or relevance name; fatal at startup.
    #[error("unknown {what} {name:?} (expected one of {known})")]
    StrategyMisconfigured {
        what: &'static str,
        name: String,
        known: &'static str,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct IndexConfig {
    /// Port to listen on; 0 picks an ephemeral port.
    pub port: u16,

    /// Reorg strategy name: `capacity`, `geo` or `graph`.
    pub strategy: String,
    /// Relevance function name: `lru` or `costlru`.
    pub relevance: String,

    /// Whether compatible pending create jobs may be merged.
    pub batching: bool,
    /// A batched job's rectangle may grow to at most this multiple of the
    /// original query's volume.
    pub max_batch_volume: f64,

    /// How often placement is re-examined.
    pub reorg_interval: Duration,
    /// How often node statistics are collected (a multiple of the reorg
    /// interval keeps the two aligned).
    pub stats_interval: Duration,

    /// Reorg target usage per node, as a fraction of its capacity.
    pub target_usage: f64,
    /// Coefficient-of-variation threshold that triggers rebalancing.
    pub usage_cv_threshold: f64,

    /// Capacity of the I/O-thread → scheduler queue; senders block when full.
    pub scheduler_queue: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            port: 10400,
            strategy: "capacity".into(),
            relevance: "costlru".into(),
            batching: true,
            max_batch_volume: 4.0,
            reorg_interval: Duration::from_millis(500),
            stats_interval: Duration::from_millis(2500),
            target_usage: 0.8,
            usage_cv_threshold: 0.1,
            scheduler_queue: 256,
        }
    }
}
