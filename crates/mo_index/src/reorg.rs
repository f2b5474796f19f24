use std::collections::BTreeSet;

use ahash::HashMap;

use mo_types::{BaseRequest, CacheType, NodeId, SemanticId, StoreUsage};

use crate::{relevance_by_name, IndexEntry, IndexError, RelevanceFunction};

/// Usage snapshot of one node for one cache type, input to placement.
#[derive(Clone, Copy, Debug)]
pub struct NodeCapacity {
    pub id: NodeId,
    pub usage: StoreUsage,
}

/// A node as a bin during distribution.
#[derive(Debug)]
pub struct TargetNode {
    pub id: NodeId,
    target_size: u64,
    size: u64,
    pub entries: Vec<IndexEntry>,
}

impl TargetNode {
    pub fn new(id: NodeId, target_size: u64) -> Self {
        Self {
            id,
            target_size,
            size: 0,
            entries: Vec::new(),
        }
    }

    pub fn remaining(&self) -> i64 {
        self.target_size as i64 - self.size as i64
    }

    /// An entry fits while the bin is under target and the entry would not
    /// overshoot by more than the remaining space itself.
    pub fn fits(&self, entry: &IndexEntry) -> bool {
        self.size < self.target_size
            && 2 * (self.target_size - self.size) >= entry.info.byte_size
    }

    pub fn add(&mut self, entry: IndexEntry) {
        self.size += entry.info.byte_size;
        self.entries.push(entry);
    }
}

/// Placement policy: where new misses go, how entries are spread in a reorg
/// pass, and what to forget when a node dies.
pub trait ReorgStrategy: Send {
    /// Preferred node for a fresh miss, or `None` to fall back to the least
    /// used node.
    fn get_node_for_job(&self, request: &BaseRequest, nodes: &[NodeCapacity]) -> Option<NodeId>;

    /// Distributes `entries` over `targets` (ordered by node id). Entries not
    /// added to their current node's bin become moves.
    fn distribute(&mut self, targets: &mut [TargetNode], entries: Vec<IndexEntry>);

    /// Drops any routing state referring to a dead node.
    fn node_failed(&mut self, node: NodeId);
}

/// Factory keyed by configuration string.
pub fn strategy_by_name(name: &str) -> Result<Box<dyn ReorgStrategy>, IndexError> {
    match name.to_ascii_lowercase().as_str() {
        "capacity" => Ok(Box::new(CapacityStrategy)),
        "geo" => Ok(Box::new(GeographicStrategy::default())),
        "graph" => Ok(Box::new(GraphStrategy::default())),
        _ => Err(IndexError::StrategyMisconfigured {
            what: "reorg strategy",
            name: name.to_owned(),
            known: "capacity, geo, graph",
        }),
    }
}

fn least_used(nodes: &[NodeCapacity]) -> Option<NodeId> {
    nodes
        .iter()
        .min_by(|a, b| {
            a.usage
                .ratio()
                .total_cmp(&b.usage.ratio())
                .then(a.id.cmp(&b.id))
        })
        .map(|n| n.id)
}

// --- Capacity ---

/// Balance bytes across nodes; keep entries where they are when possible and
/// pour the overflow into whichever node has the most room.
pub struct CapacityStrategy;

impl ReorgStrategy for CapacityStrategy {
    fn get_node_for_job(&self, _request: &BaseRequest, _nodes: &[NodeCapacity]) -> Option<NodeId> {
        None // always the least used node
    }

    fn distribute(&mut self, targets: &mut [TargetNode], mut entries: Vec<IndexEntry>) {
        let index_of: HashMap<NodeId, usize> = targets
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id, i))
            .collect();

        // Keep entries on their current node while it has room.
        entries.sort_by(|a, b| a.node.cmp(&b.node).then(a.entry_id.cmp(&b.entry_id)));
        let mut overflow = Vec::new();
        for entry in entries {
            match index_of.get(&entry.node) {
                Some(&i) if targets[i].fits(&entry) => targets[i].add(entry),
                _ => overflow.push(entry),
            }
        }

        // Pour the overflow into the roomiest bins, re-sorting whenever the
        // head bin falls behind so no single node is starved.
        if !overflow.is_empty() {
            let mut order: Vec<usize> = (0..targets.len()).collect();
            order.sort_by_key(|&i| std::cmp::Reverse(targets[i].remaining()));
            for entry in overflow {
                targets[order[0]].add(entry);
                if order.len() > 1 && targets[order[0]].remaining() < targets[order[1]].remaining()
                {
                    order.sort_by_key(|&i| std::cmp::Reverse(targets[i].remaining()));
                }
            }
        }
    }

    fn node_failed(&mut self, _node: NodeId) {}
}

// --- Geographic (z-order) ---

/// Places entries along a Morton curve over the WGS84 lon/lat rectangle and
/// splits the curve contiguously across nodes, remembering the split points
/// to route future requests.
#[derive(Default)]
pub struct GeographicStrategy {
    /// Ascending `(upper z bound, node)` pairs from the last distribution.
    z_bounds: Vec<(u32, NodeId)>,
}

impl GeographicStrategy {
    const MAX_Z: u32 = u32::MAX;
    const MASKS: [u32; 4] = [0x5555_5555, 0x3333_3333, 0x0F0F_0F0F, 0x00FF_00FF];
    const SHIFTS: [u32; 4] = [1, 2, 4, 8];
    const SCALE_X: u32 = 0xFFFF / 360;
    const SCALE_Y: u32 = 0xFFFF / 180;

    fn spread(mut v: u32) -> u32 {
        v = (v | (v << Self::SHIFTS[3])) & Self::MASKS[3];
        v = (v | (v << Self::SHIFTS[2])) & Self::MASKS[2];
        v = (v | (v << Self::SHIFTS[1])) & Self::MASKS[1];
        v = (v | (v << Self::SHIFTS[0])) & Self::MASKS[0];
        v
    }

    /// 32-bit Morton code of a bounds centroid.
    pub fn z_value(bounds: &mo_cube::BoundsCube) -> u32 {
        let (lon, lat) = bounds.centroid_lonlat();
        let x = ((lon + 180.0).max(0.0) * f64::from(Self::SCALE_X)) as u32;
        let y = ((lat + 90.0).max(0.0) * f64::from(Self::SCALE_Y)) as u32;
        Self::spread(x & 0xFFFF) | (Self::spread(y & 0xFFFF) << 1)
    }

    pub fn bounds(&self) -> &[(u32, NodeId)] {
        &self.z_bounds
    }
}

impl ReorgStrategy for GeographicStrategy {
    fn get_node_for_job(&self, request: &BaseRequest, _nodes: &[NodeCapacity]) -> Option<NodeId> {
        if self.z_bounds.is_empty() {
            return None;
        }
        let z = Self::z_value(&request.rect.bounds);
        self.z_bounds
            .iter()
            .find(|(bound, _)| z <= *bound)
            .or_else(|| self.z_bounds.last())
            .map(|(_, node)| *node)
    }

    fn distribute(&mut self, targets: &mut [TargetNode], mut entries: Vec<IndexEntry>) {
        self.z_bounds.clear();
        if targets.is_empty() {
            return;
        }

        entries.sort_by(|a, b| {
            Self::z_value(&a.info.cube.bounds)
                .cmp(&Self::z_value(&b.info.cube.bounds))
                .then(a.entry_ref().cmp(&b.entry_ref()))
        });

        let mut idx = 0;
        let mut last_z = 0u32;
        let mut prev_z: Option<u32> = None;
        for entry in entries {
            let z = Self::z_value(&entry.info.cube.bounds);
            if let Some(p) = prev_z {
                // Never separate entries sharing a z value.
                if !targets[idx].fits(&entry) && idx < targets.len() - 1 && z > p {
                    let bound = p + (z - p) / 2;
                    self.z_bounds.push((bound, targets[idx].id));
                    idx += 1;
                }
            }
            prev_z = Some(z);
            last_z = z;
            targets[idx].add(entry);
        }

        // Split the unclaimed tail of the curve evenly among the remaining
        // nodes so future requests route somewhere sensible.
        let space = (Self::MAX_Z - last_z) / (targets.len() - idx) as u32;
        let mut z = last_z;
        for target in &targets[idx..targets.len() - 1] {
            z = z.saturating_add(space);
            self.z_bounds.push((z, target.id));
        }
        self.z_bounds
            .push((Self::MAX_Z, targets[targets.len() - 1].id));
    }

    fn node_failed(&mut self, node: NodeId) {
        self.z_bounds.retain(|(_, n)| *n != node);
        if let Some(last) = self.z_bounds.last_mut() {
            last.0 = Self::MAX_Z;
        }
    }
}

// --- Graph (semantic affinity) ---

/// Groups entries by operator-graph containment (parent semantic ids contain
/// their children's serializations as substrings), walks the forest breadth
/// first and packs whole subtrees onto nodes in order. Root ordering is kept
/// across passes so assignments stay stable.
#[derive(Default)]
pub struct GraphStrategy {
    assignments: HashMap<SemanticId, NodeId>,
    last_root_order: Vec<SemanticId>,
}

struct GraphNode {
    semantic_id: SemanticId,
    entries: Vec<IndexEntry>,
    children: Vec<usize>,
    marked: bool,
}

impl GraphStrategy {
    fn append(arena: &mut [GraphNode], roots: &mut Vec<usize>, idx: usize) {
        let mut added = false;
        for root in roots.iter_mut() {
            if arena[*root]
                .semantic_id
                .as_str()
                .contains(arena[idx].semantic_id.as_str())
            {
                arena[*root].children.push(idx);
                added = true;
            } else if arena[idx]
                .semantic_id
                .as_str()
                .contains(arena[*root].semantic_id.as_str())
            {
                arena[idx].children.push(*root);
                *root = idx;
                added = true;
            }
        }
        if !added {
            roots.push(idx);
        }
    }

    /// Breadth-first order over the forest, deduplicated by marks (a node can
    /// be reachable from several roots).
    fn build_order(arena: &mut [GraphNode], roots: &[usize]) -> Vec<usize> {
        let mut out = Vec::new();
        for &root in roots {
            if arena[root].marked {
                continue;
            }
            arena[root].marked = true;
            let mut queue = vec![root];
            let mut head = 0;
            while head < queue.len() {
                let current = queue[head];
                head += 1;
                let children = arena[current].children.clone();
                for child in children {
                    if !arena[child].marked {
                        arena[child].marked = true;
                        queue.push(child);
                    }
                }
            }
            out.extend(queue);
        }
        out
    }
}

impl ReorgStrategy for GraphStrategy {
    fn get_node_for_job(&self, request: &BaseRequest, _nodes: &[NodeCapacity]) -> Option<NodeId> {
        if let Some(node) = self.assignments.get(&request.semantic_id) {
            return Some(*node);
        }
        // No exact assignment: the request's graph may contain an assigned
        // sub-graph; prefer the largest such child.
        self.assignments
            .iter()
            .filter(|(sid, _)| request.semantic_id.as_str().contains(sid.as_str()))
            .max_by_key(|(sid, _)| sid.as_str().len())
            .map(|(_, node)| *node)
    }

    fn distribute(&mut self, targets: &mut [TargetNode], entries: Vec<IndexEntry>) {
        self.assignments.clear();
        if targets.is_empty() {
            return;
        }

        // Group entries into graph nodes, deterministically ordered.
        let mut by_semantic: std::collections::BTreeMap<SemanticId, Vec<IndexEntry>> =
            std::collections::BTreeMap::new();
        for entry in entries {
            by_semantic
                .entry(entry.semantic_id.clone())
                .or_default()
                .push(entry);
        }
        let mut arena: Vec<GraphNode> = by_semantic
            .into_iter()
            .map(|(semantic_id, entries)| GraphNode {
                semantic_id,
                entries,
                children: Vec::new(),
                marked: false,
            })
            .collect();

        let mut roots = Vec::new();
        for idx in 0..arena.len() {
            Self::append(&mut arena, &mut roots, idx);
        }

        // Keep whatever part of the previous root ordering still exists, so
        // subtrees do not hop between nodes on every pass.
        let mut ordered_roots = Vec::new();
        for sid in &self.last_root_order {
            if let Some(pos) = roots
                .iter()
                .position(|&r| &arena[r].semantic_id == sid)
            {
                ordered_roots.push(roots.remove(pos));
            }
        }
        ordered_roots.extend(roots);
        self.last_root_order = ordered_roots
            .iter()
            .map(|&r| arena[r].semantic_id.clone())
            .collect();

        let order = Self::build_order(&mut arena, &ordered_roots);

        let mut idx = 0;
        for node_idx in order {
            let node = &mut arena[node_idx];
            for entry in std::mem::take(&mut node.entries) {
                if !targets[idx].fits(&entry) && idx < targets.len() - 1 {
                    idx += 1;
                }
                targets[idx].add(entry);
            }
            self.assignments
                .insert(node.semantic_id.clone(), targets[idx].id);
        }
    }

    fn node_failed(&mut self, node: NodeId) {
        self.assignments.retain(|_, n| *n != node);
    }
}

// --- Planner ---

/// What one reorg pass decided.
#[derive(Debug, Default)]
pub struct ReorgPlan {
    /// Evicted cluster-wide, least relevant first.
    pub removals: Vec<IndexEntry>,
    /// Entries that change nodes, paired with their destination.
    pub moves: Vec<(IndexEntry, NodeId)>,
}

/// Drives one cache type's placement: owns the strategy, the relevance
/// function and the trigger bookkeeping.
pub struct ReorgPlanner {
    cache_type: CacheType,
    strategy: Box<dyn ReorgStrategy>,
    relevance: Box<dyn RelevanceFunction>,
    last_nodes: BTreeSet<NodeId>,
    target_usage: f64,
    cv_threshold: f64,
}

impl ReorgPlanner {
    pub fn from_names(
        cache_type: CacheType,
        strategy: &str,
        relevance: &str,
        target_usage: f64,
        cv_threshold: f64,
    ) -> Result<Self, IndexError> {
        Ok(Self {
            cache_type,
            strategy: strategy_by_name(strategy)?,
            relevance: relevance_by_name(relevance)?,
            last_nodes: BTreeSet::new(),
            target_usage,
            cv_threshold,
        })
    }

    pub fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    /// Preferred node for a fresh miss; falls back to the least used node.
    pub fn pick_node(&self, request: &BaseRequest, nodes: &[NodeCapacity]) -> Option<NodeId> {
        self.strategy
            .get_node_for_job(request, nodes)
            .filter(|picked| nodes.iter().any(|n| n.id == *picked))
            .or_else(|| least_used(nodes))
    }

    pub fn node_failed(&mut self, node: NodeId) {
        self.strategy.node_failed(node);
    }

    /// Whether a pass is due: the set of alive nodes changed, some node is
    /// full, or usage spreads too unevenly (coefficient of variation).
    pub fn requires_reorg(&mut self, nodes: &[NodeCapacity]) -> bool {
        let current: BTreeSet<NodeId> = nodes.iter().map(|n| n.id).collect();
        if current != self.last_nodes {
            self.last_nodes = current;
            return true;
        }
        if nodes.is_empty() {
            return false;
        }

        let mut max = 0.0f64;
        let mut sum = 0.0;
        let mut sqsum = 0.0;
        for n in nodes {
            let u = n.usage.ratio();
            sum += u;
            sqsum += u * u;
            max = max.max(u);
        }
        let count = nodes.len() as f64;
        let avg = sum / count;
        let stddev = if nodes.len() > 1 {
            ((sqsum - sum * sum / count) / count).max(0.0).sqrt()
        } else {
            0.0
        };

        max >= 1.0 || (avg > 0.0 && stddev / avg > self.cv_threshold)
    }

    /// Plans removals and moves for one pass.
    pub fn plan(&mut self, nodes: &[NodeCapacity], entries: Vec<IndexEntry>) -> ReorgPlan {
        let mut plan = ReorgPlan::default();
        if nodes.is_empty() || entries.is_empty() {
            return plan;
        }

        let mut bytes_used: f64 = nodes.iter().map(|n| n.usage.used as f64).sum();
        let bytes_available: f64 = nodes.iter().map(|n| n.usage.capacity as f64).sum();
        if bytes_available <= 0.0 {
            return plan;
        }
        let target_cap = (bytes_used / bytes_available).min(self.target_usage);

        // Over target: evict least relevant entries cluster-wide.
        let mut entries = entries;
        if bytes_used / bytes_available >= self.target_usage {
            self.relevance.new_turn();
            entries.sort_by(|a, b| self.relevance.compare(a, b));
            while let Some(last) = entries.last() {
                if bytes_used / bytes_available < self.target_usage {
                    break;
                }
                bytes_used -= last.info.byte_size as f64;
                plan.removals.push(entries.pop().expect("non-empty"));
            }
        }

        let mut targets: Vec<TargetNode> = nodes
            .iter()
            .map(|n| {
                TargetNode::new(n.id, (target_cap * n.usage.capacity as f64) as u64)
            })
            .collect();
        targets.sort_by_key(|t| t.id);

        self.strategy.distribute(&mut targets, entries);

        for target in targets {
            for entry in target.entries {
                if entry.node != target.id {
                    plan.moves.push((entry, target.id));
                }
            }
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mo_cube::{
        BoundsCube, CacheCube, Cube3, QueryRect, Resolution, ResolutionInfo, Srs, TimeKind,
    };
    use mo_types::{CostProfile, EntryId, EntryInfo};

    fn entry(node: u32, id: u64, size: u64, x: f64, sem: &str) -> IndexEntry {
        IndexEntry {
            cache_type: CacheType::Raster,
            semantic_id: SemanticId::from(sem),
            node: NodeId(node),
            entry_id: EntryId(id),
            info: EntryInfo::new(
                size,
                CacheCube::new(
                    BoundsCube::new(
                        Cube3::from_ranges(x, x + 1.0, 0.0, 1.0, 0.0, 1.0),
                        Srs::LatLon,
                        TimeKind::Unix,
                    ),
                    ResolutionInfo::None,
                ),
                CostProfile::default(),
            ),
        }
    }

    fn capacity(id: u32, used: u64, total: u64) -> NodeCapacity {
        NodeCapacity {
            id: NodeId(id),
            usage: StoreUsage {
                used,
                capacity: total,
            },
        }
    }

    fn planner(strategy: &str) -> ReorgPlanner {
        ReorgPlanner::from_names(CacheType::Raster, strategy, "lru", 0.8, 0.1).expect("planner")
    }

    #[test]
    fn unknown_strategy_is_fatal() {
        assert!(matches!(
            strategy_by_name("roundrobin"),
            Err(IndexError::StrategyMisconfigured { .. })
        ));
    }

    #[test]
    fn requires_reorg_on_node_change_and_imbalance() {
        let mut p = planner("capacity");

        // First sight of the node set always triggers.
        assert!(p.requires_reorg(&[capacity(1, 0, 100), capacity(2, 0, 100)]));
        // Balanced and unchanged: no reorg.
        assert!(!p.requires_reorg(&[capacity(1, 40, 100), capacity(2, 40, 100)]));
        // Heavily skewed usage: reorg.
        assert!(p.requires_reorg(&[capacity(1, 80, 100), capacity(2, 10, 100)]));
        // A full node always triggers.
        assert!(p.requires_reorg(&[capacity(1, 100, 100), capacity(2, 100, 100)]));
    }

    #[test]
    fn capacity_plan_moves_overflow_to_the_empty_node() {
        // Ten 2 MB entries all on node 1, both nodes 10 MB.
        let mb = 1024 * 1024;
        let entries: Vec<IndexEntry> =
            (0..10).map(|i| entry(1, i, 2 * mb, i as f64, "op/a")).collect();
        let nodes = [capacity(1, 20 * mb, 10 * mb), capacity(2, 0, 10 * mb)];

        let mut p = planner("capacity");
        let plan = p.plan(&nodes, entries);

        // Cluster holds 20 MB of 20 MB: evict strictly below 80% (three
        // removals), then spread the rest so both nodes end under 8 MB.
        assert_eq!(plan.removals.len(), 3);
        let moved_bytes: u64 = plan
            .moves
            .iter()
            .map(|(e, _)| e.info.byte_size)
            .sum();
        assert!(plan.moves.iter().all(|(_, dest)| *dest == NodeId(2)));
        assert!(moved_bytes >= 6 * mb, "expected a substantial rebalance");
        let remaining_on_1 = 20 * mb
            - plan.removals.iter().map(|e| e.info.byte_size).sum::<u64>()
            - moved_bytes;
        assert!(remaining_on_1 <= 8 * mb);
    }

    #[test]
    fn geographic_distribution_routes_future_requests() {
        let mut strategy = GeographicStrategy::default();
        // Western and eastern entries, two nodes with room for two each.
        let entries = vec![
            entry(1, 1, 10, -120.0, "op/a"),
            entry(1, 2, 10, -110.0, "op/a"),
            entry(1, 3, 10, 100.0, "op/a"),
            entry(1, 4, 10, 110.0, "op/a"),
        ];
        let mut targets = vec![
            TargetNode::new(NodeId(1), 20),
            TargetNode::new(NodeId(2), 20),
        ];
        strategy.distribute(&mut targets, entries);

        assert_eq!(targets[0].entries.len() + targets[1].entries.len(), 4);
        assert!(!strategy.bounds().is_empty());

        // A request near the west lands on the node holding western entries.
        let west_request = BaseRequest::new(
            CacheType::Raster,
            SemanticId::from("op/a"),
            QueryRect::new(
                BoundsCube::new(
                    Cube3::from_ranges(-119.0, -118.0, 0.0, 1.0, 0.0, 1.0),
                    Srs::LatLon,
                    TimeKind::Unix,
                ),
                Resolution::None,
            ),
        );
        let picked = strategy.get_node_for_job(&west_request, &[]);
        assert_eq!(picked, Some(targets[0].id));
    }

    #[test]
    fn geographic_node_failure_drops_its_ranges() {
        let mut strategy = GeographicStrategy::default();
        let entries = vec![entry(1, 1, 10, -120.0, "op/a"), entry(1, 2, 10, 100.0, "op/a")];
        let mut targets = vec![
            TargetNode::new(NodeId(1), 10),
            TargetNode::new(NodeId(2), 10),
        ];
        strategy.distribute(&mut targets, entries);
        strategy.node_failed(NodeId(2));
        assert!(strategy.bounds().iter().all(|(_, n)| *n != NodeId(2)));
        if let Some((bound, _)) = strategy.bounds().last() {
            assert_eq!(*bound, u32::MAX);
        }
    }

    #[test]
    fn graph_strategy_keeps_subtrees_together() {
        let mut strategy = GraphStrategy::default();
        // "source" is a sub-graph of both projections; each projection is its
        // own root.
        let entries = vec![
            entry(1, 1, 10, 0.0, r#"{"op":"proj-a","src":{"op":"source"}}"#),
            entry(1, 2, 10, 1.0, r#"{"op":"source"}"#),
            entry(2, 3, 10, 2.0, r#"{"op":"proj-b","src2":{"op":"source"}}"#),
        ];
        let mut targets = vec![
            TargetNode::new(NodeId(1), 1000),
            TargetNode::new(NodeId(2), 1000),
        ];
        strategy.distribute(&mut targets, entries);

        // Everything fits on the first node, so the whole forest packs there.
        assert_eq!(targets[0].entries.len(), 3);

        let request = BaseRequest::new(
            CacheType::Raster,
            SemanticId::from(r#"{"op":"proj-a","src":{"op":"source"}}"#),
            QueryRect::new(
                BoundsCube::new(
                    Cube3::from_ranges(0.0, 1.0, 0.0, 1.0, 0.0, 1.0),
                    Srs::LatLon,
                    TimeKind::Unix,
                ),
                Resolution::None,
            ),
        );
        assert_eq!(strategy.get_node_for_job(&request, &[]), Some(NodeId(1)));

        // A brand-new graph that embeds the cached source routes to it too.
        let embedding = BaseRequest::new(
            CacheType::Raster,
            SemanticId::from(r#"{"op":"hist","src":{"op":"source"}}"#),
            request.rect,
        );
        assert_eq!(strategy.get_node_for_job(&embedding, &[]), Some(NodeId(1)));

        strategy.node_failed(NodeId(1));
        assert_eq!(strategy.get_node_for_job(&request, &[]), None);
    }

    #[test]
    fn pick_node_falls_back_to_least_used() {
        let p = planner("capacity");
        let request = BaseRequest::new(
            CacheType::Raster,
            SemanticId::from("op/a"),
            QueryRect::new(
                BoundsCube::new(
                    Cube3::from_ranges(0.0, 1.0, 0.0, 1.0, 0.0, 1.0),
                    Srs::LatLon,
                    TimeKind::Unix,
                ),
                Resolution::None,
            ),
        );
        let nodes = [capacity(1, 50, 100), capacity(2, 10, 100)];
        assert_eq!(p.pick_node(&request, &nodes), Some(NodeId(2)));
        assert_eq!(p.pick_node(&request, &[]), None);
    }
}
