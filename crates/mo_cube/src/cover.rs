use crate::{CacheCube, Cube3, QueryCube};

/// Outcome of planning a lookup against a set of candidate entries.
#[derive(Clone, Debug, PartialEq)]
pub enum CoverResult<K> {
    /// One stored entry answers the query outright.
    Hit(K),
    /// Several fragments cover parts of the query; the rest must be produced.
    Partial(CoverPlan<K>),
    /// Nothing usable is stored.
    Miss,
}

/// A puzzle plan: which entries to fetch and which rectangles to produce.
#[derive(Clone, Debug, PartialEq)]
pub struct CoverPlan<K> {
    /// Chosen entries, most-covering first.
    pub keys: Vec<K>,
    /// Bounds of the chosen entries, parallel to `keys`.
    pub covered: Vec<Cube3>,
    /// Sub-cubes of the query no chosen entry covers, in canonical slab order.
    pub remainders: Vec<Cube3>,
}

/// Extent of `cube` measured only along the axes where `query` has extent.
///
/// Queries are routinely degenerate on the time axis (a single instant), so a
/// plain volume would collapse to zero and make every candidate look equally
/// useless. Degenerate axes contribute a factor of one instead.
fn extent_measure(cube: &Cube3, query: &Cube3) -> f64 {
    if cube.is_empty() {
        return 0.0;
    }
    let mut measure = 1.0;
    for axis in 0..3 {
        if query.dim(axis).length() > 0.0 {
            measure *= cube.dim(axis).length();
        }
    }
    measure
}

/// Greedy cover planning shared by the node store and the index resolver.
///
/// Candidates are filtered by [`CacheCube::qualifies`] (reference tags,
/// resolution validity, intersection), ordered by descending overlap with the
/// query, and picked as long as they strictly shrink the uncovered area. The
/// remainder is the canonical cube difference of the query minus the chosen
/// bounds.
///
/// Candidate order breaks ties, so callers must iterate their entries in a
/// deterministic order to get reproducible plans.
pub fn plan_cover<K>(
    query: &QueryCube,
    candidates: impl IntoIterator<Item = (K, CacheCube)>,
) -> CoverResult<K> {
    let query_cube = *query.cube();
    let total = extent_measure(&query_cube, &query_cube);
    let epsilon = 1e-12 * total.max(1.0);

    let mut qualifying: Vec<(K, CacheCube, f64)> = candidates
        .into_iter()
        .filter(|(_, cube)| cube.qualifies(query))
        .map(|(key, cube)| {
            let overlap = extent_measure(&cube.bounds.cube.intersection(&query_cube), &query_cube);
            (key, cube, overlap)
        })
        .filter(|(_, _, overlap)| *overlap > epsilon)
        .collect();

    if qualifying.is_empty() {
        return CoverResult::Miss;
    }

    // Stable sort: ties keep the caller's iteration order.
    qualifying.sort_by(|a, b| b.2.total_cmp(&a.2));

    let mut keys = Vec::new();
    let mut covered = Vec::new();
    let mut remainders: Vec<Cube3> = vec![query_cube];
    let mut uncovered = total;

    for (key, cube, _) in qualifying {
        if uncovered <= epsilon {
            break;
        }

        let next: Vec<Cube3> = remainders
            .iter()
            .flat_map(|r| r.difference(&cube.bounds.cube))
            .filter(|piece| extent_measure(piece, &query_cube) > epsilon)
            .collect();
        let next_uncovered: f64 = next
            .iter()
            .map(|piece| extent_measure(piece, &query_cube))
            .sum();

        if next_uncovered + epsilon < uncovered {
            keys.push(key);
            covered.push(cube.bounds.cube);
            remainders = next;
            uncovered = next_uncovered;
        }
    }

    let fully_covered = uncovered <= epsilon;
    if fully_covered {
        remainders.clear();
    }

    match (keys.len(), fully_covered) {
        (0, _) => CoverResult::Miss,
        (1, true) => CoverResult::Hit(keys.pop().expect("len checked")),
        _ => CoverResult::Partial(CoverPlan {
            keys,
            covered,
            remainders,
        }),
    }
}
