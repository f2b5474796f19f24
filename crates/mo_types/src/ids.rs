use std::sync::Arc;

/// The payload families the cache distinguishes.
///
/// Each type gets its own byte budget and its own slice of the index; a query
/// only ever matches entries of its own type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheType {
    Raster,
    Points,
    Lines,
    Polygons,
    Plot,
}

impl CacheType {
    pub const ALL: [Self; 5] = [
        Self::Raster,
        Self::Points,
        Self::Lines,
        Self::Polygons,
        Self::Plot,
    ];

    pub fn tag(&self) -> u8 {
        match self {
            Self::Raster => 0,
            Self::Points => 1,
            Self::Lines => 2,
            Self::Polygons => 3,
            Self::Plot => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Raster),
            1 => Some(Self::Points),
            2 => Some(Self::Lines),
            3 => Some(Self::Polygons),
            4 => Some(Self::Plot),
            _ => None,
        }
    }
}

impl std::fmt::Display for CacheType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Raster => "raster",
            Self::Points => "points",
            Self::Lines => "lines",
            Self::Polygons => "polygons",
            Self::Plot => "plot",
        };
        f.write_str(name)
    }
}

// ---

/// Canonical serialization of an operator graph.
///
/// Two requests with equal semantic ids (and equal rectangle and resolution)
/// must yield identical bytes; that equivalence is the whole basis of the
/// cache. The string is reference-counted so the many tables keyed by it can
/// clone freely.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SemanticId(Arc<str>);

impl SemanticId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SemanticId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SemanticId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl std::fmt::Display for SemanticId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for SemanticId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SemanticId({:?})", &*self.0)
    }
}

// ---

/// Coordinator-assigned id of a cache node. Zero is never assigned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl nohash_hasher::IsEnabled for NodeId {}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Node-local id of a cache entry.
///
/// Assigned by the owning node from a monotone counter and never reused; an
/// entry that moves to another node gets a fresh id there.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub u64);

impl nohash_hasher::IsEnabled for EntryId {}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Key of an entry within one node's store of one cache type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub semantic_id: SemanticId,
    pub entry_id: EntryId,
}

impl CacheKey {
    pub fn new(semantic_id: SemanticId, entry_id: EntryId) -> Self {
        Self {
            semantic_id,
            entry_id,
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.semantic_id, self.entry_id)
    }
}

/// A [`CacheKey`] plus the cache type, globally meaningful once paired with
/// a node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TypedKey {
    pub cache_type: CacheType,
    pub semantic_id: SemanticId,
    pub entry_id: EntryId,
}

impl TypedKey {
    pub fn new(cache_type: CacheType, semantic_id: SemanticId, entry_id: EntryId) -> Self {
        Self {
            cache_type,
            semantic_id,
            entry_id,
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(self.semantic_id.clone(), self.entry_id)
    }
}

impl std::fmt::Display for TypedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.cache_type, self.semantic_id, self.entry_id)
    }
}

/// Coordinator-side handle of an entry: which node, which entry.
///
/// Entry ids are node-wide unique, so the pair identifies an entry across the
/// whole cluster; it is the key of the index arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryRef {
    pub node: NodeId,
    pub entry: EntryId,
}

impl EntryRef {
    pub fn new(node: NodeId, entry: EntryId) -> Self {
        Self { node, entry }
    }
}

impl std::fmt::Display for EntryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.node, self.entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_type_tags_round_trip() {
        for t in CacheType::ALL {
            assert_eq!(CacheType::from_tag(t.tag()), Some(t));
        }
        assert_eq!(CacheType::from_tag(9), None);
    }

    #[test]
    fn semantic_ids_compare_by_content() {
        let a = SemanticId::from("op/a");
        let b = SemanticId::new(String::from("op/a"));
        assert_eq!(a, b);
        assert_eq!(a.clone(), a);
    }
}
