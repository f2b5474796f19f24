use smallvec::SmallVec;

use crate::Interval;

/// An axis-aligned product of `N` closed intervals.
///
/// A cube is empty as soon as any of its dimensions is empty. Empty cubes
/// have volume `0.0` and never intersect anything.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Cube<const N: usize> {
    dims: [Interval; N],
}

/// The spatio-temporal case: x, y, time, in that order.
pub type Cube3 = Cube<3>;

/// Result of a cube difference; six pieces cover the worst 3-D case.
pub type CubePieces<const N: usize> = SmallVec<[Cube<N>; 6]>;

impl<const N: usize> Cube<N> {
    pub const EMPTY: Self = Self {
        dims: [Interval::EMPTY; N],
    };

    #[inline]
    pub fn new(dims: [Interval; N]) -> Self {
        Self { dims }
    }

    #[inline]
    pub fn dim(&self, axis: usize) -> &Interval {
        &self.dims[axis]
    }

    #[inline]
    pub fn dims(&self) -> &[Interval; N] {
        &self.dims
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dims.iter().any(Interval::is_empty)
    }

    #[inline]
    pub fn volume(&self) -> f64 {
        if self.is_empty() {
            0.0
        } else {
            self.dims.iter().map(Interval::length).product()
        }
    }

    pub fn centroid(&self) -> [f64; N] {
        let mut out = [0.0; N];
        for (o, d) in out.iter_mut().zip(&self.dims) {
            *o = d.center();
        }
        out
    }

    pub fn intersects(&self, other: &Self) -> bool {
        self.dims
            .iter()
            .zip(&other.dims)
            .all(|(a, b)| a.intersects(b))
    }

    /// Whether `self` contains all of `other` (`self ⊇ other`).
    pub fn contains(&self, other: &Self) -> bool {
        other.is_empty()
            || self
                .dims
                .iter()
                .zip(&other.dims)
                .all(|(a, b)| a.contains(b))
    }

    pub fn intersection(&self, other: &Self) -> Self {
        let mut dims = [Interval::EMPTY; N];
        for (i, (a, b)) in self.dims.iter().zip(&other.dims).enumerate() {
            let d = a.intersection(b);
            if d.is_empty() {
                return Self::EMPTY;
            }
            dims[i] = d;
        }
        Self { dims }
    }

    /// `self \ other`, decomposed into a canonical set of axis-aligned cubes.
    ///
    /// The decomposition peels two slabs per axis, axis 0 first (x, then y,
    /// then t for [`Cube3`]), so the partition is deterministic for a given
    /// pair of operands. The returned pieces share boundary faces with each
    /// other and with `other`; their interiors are pairwise disjoint and
    /// their volumes add up to `self.volume() - intersection.volume()`.
    pub fn difference(&self, other: &Self) -> CubePieces<N> {
        let mut out = CubePieces::new();
        if self.is_empty() {
            return out;
        }
        if !self.intersects(other) {
            out.push(*self);
            return out;
        }

        let mut rest = *self;
        for axis in 0..N {
            let s = rest.dims[axis];
            let o = other.dims[axis];

            if o.lo > s.lo {
                let mut slab = rest;
                slab.dims[axis] = Interval::new(s.lo, o.lo);
                out.push(slab);
            }
            if o.hi < s.hi {
                let mut slab = rest;
                slab.dims[axis] = Interval::new(o.hi, s.hi);
                out.push(slab);
            }
            rest.dims[axis] = s.intersection(&o);
        }
        // `rest` is now the intersection, which is exactly the removed part.
        out
    }
}

impl Cube3 {
    #[inline]
    pub fn from_ranges(x1: f64, x2: f64, y1: f64, y2: f64, t1: f64, t2: f64) -> Self {
        Self::new([
            Interval::new(x1, x2),
            Interval::new(y1, y2),
            Interval::new(t1, t2),
        ])
    }

    #[inline]
    pub fn x(&self) -> &Interval {
        &self.dims[0]
    }

    #[inline]
    pub fn y(&self) -> &Interval {
        &self.dims[1]
    }

    #[inline]
    pub fn t(&self) -> &Interval {
        &self.dims[2]
    }
}

impl<const N: usize> std::fmt::Display for Cube<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cube(")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, " × ")?;
            }
            d.fmt(f)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_time(x1: f64, x2: f64, y1: f64, y2: f64) -> Cube3 {
        Cube3::from_ranges(x1, x2, y1, y2, 0.0, 1.0)
    }

    #[test]
    fn volume_and_emptiness() {
        assert_eq!(unit_time(0.0, 2.0, 0.0, 3.0).volume(), 6.0);
        assert_eq!(Cube3::EMPTY.volume(), 0.0);
        assert!(!Cube3::EMPTY.intersects(&unit_time(0.0, 1.0, 0.0, 1.0)));
        assert!(unit_time(0.0, 1.0, 0.0, 1.0).contains(&Cube3::EMPTY));
    }

    #[test]
    fn difference_of_disjoint_is_self() {
        let a = unit_time(0.0, 1.0, 0.0, 1.0);
        let b = unit_time(5.0, 6.0, 0.0, 1.0);
        let pieces = a.difference(&b);
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0], a);
    }

    #[test]
    fn difference_of_contained_is_empty() {
        let a = unit_time(0.0, 1.0, 0.0, 1.0);
        let b = unit_time(-1.0, 2.0, -1.0, 2.0);
        assert!(a.difference(&b).is_empty());
    }

    #[test]
    fn difference_is_canonical_slab_order() {
        // Remove the center quarter of a 2×2 square: the x slabs come first.
        let a = unit_time(0.0, 2.0, 0.0, 2.0);
        let b = unit_time(0.5, 1.5, 0.5, 1.5);
        let pieces = a.difference(&b);
        assert_eq!(pieces.len(), 4);

        // x-slabs span the full y range, y-slabs are clamped to the overlap.
        assert_eq!(pieces[0], unit_time(0.0, 0.5, 0.0, 2.0));
        assert_eq!(pieces[1], unit_time(1.5, 2.0, 0.0, 2.0));
        assert_eq!(pieces[2], unit_time(0.5, 1.5, 0.0, 0.5));
        assert_eq!(pieces[3], unit_time(0.5, 1.5, 1.5, 2.0));

        let removed = a.intersection(&b).volume();
        let total: f64 = pieces.iter().map(Cube3::volume).sum();
        assert!((total - (a.volume() - removed)).abs() < 1e-12);
    }

    #[test]
    fn difference_volume_adds_up_in_3d() {
        let a = Cube3::from_ranges(0.0, 4.0, 0.0, 4.0, 0.0, 4.0);
        let b = Cube3::from_ranges(1.0, 3.0, 1.0, 5.0, -1.0, 2.0);
        let pieces = a.difference(&b);
        let removed = a.intersection(&b).volume();
        let total: f64 = pieces.iter().map(Cube3::volume).sum();
        assert!((total - (a.volume() - removed)).abs() < 1e-9);
    }
}
