use mo_cube::{CacheCube, QueryRect};

use crate::{CacheType, EntryId, NodeId, SemanticId};

/// A client's question: one operator graph, one rectangle, one cache type.
#[derive(Clone, Debug, PartialEq)]
pub struct BaseRequest {
    pub cache_type: CacheType,
    pub semantic_id: SemanticId,
    pub rect: QueryRect,
}

impl BaseRequest {
    pub fn new(cache_type: CacheType, semantic_id: SemanticId, rect: QueryRect) -> Self {
        Self {
            cache_type,
            semantic_id,
            rect,
        }
    }
}

impl std::fmt::Display for BaseRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} {}", self.cache_type, self.semantic_id, self.rect)
    }
}

/// A reference to a cache entry on some node, as a puzzle piece.
///
/// Host and port point at the owning node's delivery service so the assembling
/// worker can stream remote pieces with `GET_CACHED`.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheRef {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
    pub entry_id: EntryId,
    pub bounds: CacheCube,
}

impl std::fmt::Display for CacheRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}:{} ({})",
            self.entry_id, self.host, self.port, self.bounds
        )
    }
}

/// Order to assemble a result from stored pieces plus produced remainders.
#[derive(Clone, Debug, PartialEq)]
pub struct PuzzleRequest {
    pub base: BaseRequest,
    /// Pieces to fetch, owner-priority order (largest byte share first).
    pub parts: Vec<CacheRef>,
    /// Rectangles no piece covers; produced fresh by the worker.
    pub remainders: Vec<QueryRect>,
}

impl std::fmt::Display for PuzzleRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} from {} parts + {} remainders",
            self.base,
            self.parts.len(),
            self.remainders.len()
        )
    }
}

/// Order to deliver a single stored entry as-is.
#[derive(Clone, Debug, PartialEq)]
pub struct DeliveryRequest {
    pub cache_type: CacheType,
    pub semantic_id: SemanticId,
    pub entry_id: EntryId,
}

impl std::fmt::Display for DeliveryRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.cache_type, self.semantic_id, self.entry_id)
    }
}

/// Where a finished result can be picked up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryResponse {
    pub host: String,
    pub port: u16,
    pub delivery_id: u64,
}

impl std::fmt::Display for DeliveryResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "delivery {} at {}:{}", self.delivery_id, self.host, self.port)
    }
}
