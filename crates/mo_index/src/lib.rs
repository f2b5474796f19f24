//! The mosaic coordinator.
//!
//! One process per cluster. It owns no payloads, only the index directory
//! mirroring every node's store, the tables of outstanding queries, and the
//! reorganization machinery that keeps entries well placed.
//!
//! Threading follows a strict split: every accepted connection gets exactly
//! one I/O thread that parses frames and posts events onto a single bounded
//! queue; one scheduler thread owns every table and is the only place state
//! is mutated. The scheduler never touches a socket; it answers through
//! per-connection outboxes drained by the I/O threads.

mod config;
mod directory;
mod nodes;
mod query_manager;
mod relevance;
mod reorg;
mod server;

pub use self::config::{IndexConfig, IndexError};
pub use self::directory::{IndexDirectory, IndexEntry};
pub use self::nodes::{NodeHandle, NodeState};
pub use self::query_manager::{ClientId, JobKind, QueryId, QueryManager, SystemStats};
pub use self::relevance::{relevance_by_name, CostLru, Lru, RelevanceFunction};
pub use self::reorg::{
    strategy_by_name, CapacityStrategy, GeographicStrategy, GraphStrategy, NodeCapacity,
    ReorgPlan, ReorgPlanner, ReorgStrategy, TargetNode,
};
pub use self::server::IndexServer;
