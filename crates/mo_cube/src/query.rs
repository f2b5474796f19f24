use crate::{BoundsCube, Cube3, Interval};

/// Relative tolerance when comparing pixel scales for equality.
const SCALE_EPSILON: f64 = 1e-9;

#[inline]
fn scales_equal(a: f64, b: f64) -> bool {
    (a - b).abs() <= SCALE_EPSILON * a.abs().max(b.abs()).max(1.0)
}

// --- Requests ---

/// The resolution a client asks for.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Resolution {
    /// Resolution-less data (features, plots).
    None,
    /// A raster of `width × height` pixels covering the query rectangle.
    Pixels { width: u32, height: u32 },
}

/// A query rectangle: bounds, reference tags and the requested resolution.
///
/// This is the unit of work the producer understands and the payload of every
/// `CREATE` command.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QueryRect {
    pub bounds: BoundsCube,
    pub resolution: Resolution,
}

impl QueryRect {
    pub fn new(bounds: BoundsCube, resolution: Resolution) -> Self {
        Self { bounds, resolution }
    }

    #[inline]
    pub fn cube(&self) -> &Cube3 {
        &self.bounds.cube
    }

    #[inline]
    pub fn volume(&self) -> f64 {
        self.bounds.cube.volume()
    }

    /// The per-pixel scale implied by the rectangle, or `ResScale::None`.
    pub fn scale(&self) -> ResScale {
        match self.resolution {
            Resolution::None => ResScale::None,
            Resolution::Pixels { width, height } => ResScale::Pixels {
                x: self.bounds.cube.x().length() / f64::from(width.max(1)),
                y: self.bounds.cube.y().length() / f64::from(height.max(1)),
            },
        }
    }

    pub fn to_query_cube(&self) -> QueryCube {
        QueryCube {
            bounds: self.bounds,
            scale: self.scale(),
        }
    }

    /// A rectangle over `cube` at the same reference and pixel scale.
    ///
    /// Used to turn puzzle remainders back into producible requests; pixel
    /// counts are re-derived from the original scale and rounded to keep the
    /// sampling grid aligned.
    pub fn sub_rect(&self, cube: Cube3) -> Self {
        let resolution = match self.scale() {
            ResScale::None => Resolution::None,
            ResScale::Pixels { x, y } => Resolution::Pixels {
                width: (cube.x().length() / x).round().max(1.0) as u32,
                height: (cube.y().length() / y).round().max(1.0) as u32,
            },
        };
        Self {
            bounds: BoundsCube::new(cube, self.bounds.srs, self.bounds.time_kind),
            resolution,
        }
    }

    /// Whether a result for `self` answers `other` outright: same reference,
    /// same pixel scale, and `other`'s rectangle contained in ours.
    pub fn satisfies(&self, other: &Self) -> bool {
        self.bounds.same_reference(&other.bounds)
            && self.scale().matches(&other.scale())
            && self.bounds.cube.contains(&other.bounds.cube)
    }

    /// Smallest rectangle at our scale covering both operands.
    ///
    /// Callers must have checked compatibility (reference tags and scale)
    /// before extending a batched job this way.
    pub fn hull(&self, other: &Self) -> Self {
        let mut dims = [Interval::EMPTY; 3];
        for (i, d) in dims.iter_mut().enumerate() {
            *d = self.bounds.cube.dim(i).hull(other.bounds.cube.dim(i));
        }
        self.sub_rect(Cube3::new(dims))
    }
}

impl std::fmt::Display for QueryRect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.resolution {
            Resolution::None => write!(f, "{}", self.bounds),
            Resolution::Pixels { width, height } => {
                write!(f, "{} @{width}×{height}px", self.bounds)
            }
        }
    }
}

// --- Query cubes ---

/// The pixel scale a query resolves to, if any.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ResScale {
    None,
    Pixels { x: f64, y: f64 },
}

impl ResScale {
    /// Scale equality up to floating-point noise; `None` only matches `None`.
    pub fn matches(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Pixels { x: ax, y: ay }, Self::Pixels { x: bx, y: by }) => {
                scales_equal(*ax, *bx) && scales_equal(*ay, *by)
            }
            _ => false,
        }
    }
}

/// A query rectangle reduced to what lookups need: bounds plus pixel scale.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QueryCube {
    pub bounds: BoundsCube,
    pub scale: ResScale,
}

impl QueryCube {
    #[inline]
    pub fn cube(&self) -> &Cube3 {
        &self.bounds.cube
    }
}

// --- Cache cubes ---

/// The resolution validity a stored entry advertises.
///
/// A `Pixels` entry matches a query whose scales fall inside both validity
/// ranges. Validity defaults to the entry's own scale; widening it is an
/// explicit configuration choice (see `resolution_tolerance`).
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ResolutionInfo {
    None,
    Pixels {
        valid_x: Interval,
        valid_y: Interval,
        actual_x: f64,
        actual_y: f64,
    },
}

impl ResolutionInfo {
    /// Validity for a freshly produced result at the query's own scale.
    ///
    /// `tolerance >= 1.0` widens the ranges multiplicatively; `1.0` keeps
    /// them degenerate, demanding exact scale equality on lookup.
    pub fn from_scale(scale: &ResScale, tolerance: f64) -> Self {
        let tolerance = tolerance.max(1.0);
        match *scale {
            ResScale::None => Self::None,
            ResScale::Pixels { x, y } => Self::Pixels {
                valid_x: Interval::new(x / tolerance, x * tolerance),
                valid_y: Interval::new(y / tolerance, y * tolerance),
                actual_x: x,
                actual_y: y,
            },
        }
    }

    pub fn matches(&self, query_scale: &ResScale) -> bool {
        match (self, query_scale) {
            (Self::None, ResScale::None) => true,
            (
                Self::Pixels {
                    valid_x, valid_y, ..
                },
                ResScale::Pixels { x, y },
            ) => {
                // The degenerate validity range still needs the epsilon,
                // otherwise a re-derived scale may miss its own entry.
                (valid_x.contains_value(*x) || scales_equal(valid_x.lo, *x))
                    && (valid_y.contains_value(*y) || scales_equal(valid_y.lo, *y))
            }
            _ => false,
        }
    }
}

/// Bounds plus resolution validity: everything lookups know about an entry.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CacheCube {
    pub bounds: BoundsCube,
    pub resolution: ResolutionInfo,
}

impl CacheCube {
    pub fn new(bounds: BoundsCube, resolution: ResolutionInfo) -> Self {
        Self { bounds, resolution }
    }

    /// Whether this entry can take part in answering `query` at all.
    pub fn qualifies(&self, query: &QueryCube) -> bool {
        self.bounds.same_reference(&query.bounds)
            && self.resolution.matches(&query.scale)
            && self.bounds.cube.intersects(query.cube())
    }
}

impl std::fmt::Display for CacheCube {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.bounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Srs, TimeKind};

    fn rect(x1: f64, x2: f64, y1: f64, y2: f64, px: u32, py: u32) -> QueryRect {
        QueryRect::new(
            BoundsCube::new(
                Cube3::from_ranges(x1, x2, y1, y2, 0.0, 10.0),
                Srs::LatLon,
                TimeKind::Unix,
            ),
            Resolution::Pixels {
                width: px,
                height: py,
            },
        )
    }

    #[test]
    fn scale_derivation() {
        let r = rect(0.0, 10.0, 0.0, 10.0, 100, 50);
        match r.scale() {
            ResScale::Pixels { x, y } => {
                assert!((x - 0.1).abs() < 1e-12);
                assert!((y - 0.2).abs() < 1e-12);
            }
            ResScale::None => panic!("expected pixel scale"),
        }
    }

    #[test]
    fn sub_rect_keeps_the_scale() {
        let r = rect(0.0, 10.0, 0.0, 10.0, 100, 100);
        let sub = r.sub_rect(Cube3::from_ranges(5.0, 10.0, 0.0, 10.0, 0.0, 10.0));
        assert_eq!(
            sub.resolution,
            Resolution::Pixels {
                width: 50,
                height: 100
            }
        );
        assert!(r.scale().matches(&sub.scale()));
    }

    #[test]
    fn satisfies_requires_scale_and_containment() {
        let big = rect(0.0, 12.0, 0.0, 10.0, 120, 100);
        let small = rect(0.0, 10.0, 0.0, 10.0, 100, 100);
        let finer = rect(0.0, 10.0, 0.0, 10.0, 200, 200);

        assert!(big.satisfies(&small));
        assert!(!small.satisfies(&big));
        assert!(!big.satisfies(&finer));
    }

    #[test]
    fn exact_resolution_matching_by_default() {
        let r = rect(0.0, 10.0, 0.0, 10.0, 100, 100);
        let info = ResolutionInfo::from_scale(&r.scale(), 1.0);
        assert!(info.matches(&r.scale()));
        assert!(!info.matches(&rect(0.0, 10.0, 0.0, 10.0, 200, 200).scale()));
        assert!(!info.matches(&ResScale::None));
    }

    #[test]
    fn tolerance_widens_validity() {
        let r = rect(0.0, 10.0, 0.0, 10.0, 100, 100);
        let info = ResolutionInfo::from_scale(&r.scale(), 2.0);
        // Half and double the scale are now inside the validity range.
        assert!(info.matches(&rect(0.0, 10.0, 0.0, 10.0, 200, 200).scale()));
        assert!(info.matches(&rect(0.0, 10.0, 0.0, 10.0, 50, 50).scale()));
        assert!(!info.matches(&rect(0.0, 10.0, 0.0, 10.0, 401, 401).scale()));
    }

    #[test]
    fn hull_covers_both() {
        let a = rect(0.0, 10.0, 0.0, 10.0, 100, 100);
        let b = rect(4.0, 12.0, 0.0, 10.0, 80, 100);
        let h = a.hull(&b);
        assert!(h.bounds.cube.contains(a.cube()));
        assert!(h.bounds.cube.contains(b.cube()));
        assert_eq!(
            h.resolution,
            Resolution::Pixels {
                width: 120,
                height: 100
            }
        );
    }
}
