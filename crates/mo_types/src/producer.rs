use std::sync::Arc;

use mo_cube::{BoundsCube, QueryRect};

use crate::{CacheType, CostProfile, SemanticId};

/// A freshly computed result, as handed back by the producer.
///
/// `bounds` may exceed the requested rectangle (producers often round up to
/// tile boundaries); the cache stores whatever the producer claims is covered.
#[derive(Clone, Debug)]
pub struct Produced {
    pub payload: Arc<[u8]>,
    pub bounds: BoundsCube,
    pub cost: CostProfile,
}

/// One puzzle piece handed to [`Producer::assemble`].
#[derive(Clone, Debug)]
pub struct Part {
    pub bounds: BoundsCube,
    pub payload: Arc<[u8]>,
}

/// The operator machinery failed; surfaced verbatim to every waiting client.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("producer error: {0}")]
pub struct ProducerError(pub String);

impl ProducerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The cache's only window into actual computation.
///
/// Implementations live entirely outside the cache core: the cache hands over
/// a rectangle and a semantic id and gets opaque payload bytes back. Both
/// methods are called from worker threads and may block for as long as the
/// computation takes.
pub trait Producer: Send + Sync + 'static {
    /// Computes the payload for `rect` from scratch.
    fn produce(
        &self,
        cache_type: CacheType,
        semantic_id: &SemanticId,
        rect: &QueryRect,
    ) -> Result<Produced, ProducerError>;

    /// Assembles the payload for `rect` out of covering pieces.
    ///
    /// `parts` jointly cover `rect` (cached fragments and freshly produced
    /// remainders alike); the producer owns the type-specific knowledge of
    /// how to stitch payload bytes together.
    fn assemble(
        &self,
        cache_type: CacheType,
        semantic_id: &SemanticId,
        rect: &QueryRect,
        parts: &[Part],
    ) -> Result<Produced, ProducerError>;
}
