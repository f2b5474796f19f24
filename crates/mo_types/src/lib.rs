//! Shared vocabulary of the mosaic cache.
//!
//! Every process in the cluster (coordinator, cache nodes, workers, clients)
//! speaks in these types. Geometry lives in [`mo_cube`]; this crate adds the
//! identifiers, entry metadata, request/response structs and statistics
//! payloads layered on top, plus the [`Producer`] interface through which the
//! cache asks the (external) operator machinery for fresh results.

mod cost;
mod entry;
mod ids;
mod producer;
mod request;
mod stats;

pub use self::cost::CostProfile;
pub use self::entry::{EntryInfo, EntrySnapshot};
pub use self::ids::{CacheKey, CacheType, EntryId, EntryRef, NodeId, SemanticId, TypedKey};
pub use self::producer::{Part, Produced, Producer, ProducerError};
pub use self::request::{
    BaseRequest, CacheRef, DeliveryRequest, DeliveryResponse, PuzzleRequest,
};
pub use self::stats::{
    now_millis, AccessStats, EntryAccessDelta, NodeHandshake, NodeStats, QueryStats, StoreUsage,
};
