//! Cube algebra for the mosaic result cache.
//!
//! Everything the cache knows about geometry lives here: closed intervals,
//! axis-aligned cubes in x/y/time with a canonical difference decomposition,
//! the spatial-reference and time tags carried by every cached entry, and the
//! greedy cover planner that turns "which stored fragments answer this query"
//! into a concrete puzzle plan.
//!
//! The planner is deliberately generic over the entry key so that the same
//! code drives both a node's local lookup (keys are entry ids) and the
//! coordinator's cross-node resolution (keys are `(node, entry)` pairs).

mod cover;
mod cube;
mod interval;
mod query;
mod reference;

pub use self::cover::{plan_cover, CoverPlan, CoverResult};
pub use self::cube::{Cube, Cube3, CubePieces};
pub use self::interval::Interval;
pub use self::query::{CacheCube, QueryCube, QueryRect, ResScale, Resolution, ResolutionInfo};
pub use self::reference::{BoundsCube, Srs, TimeKind};
