// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Points, rectangles and point sets of dimension 1 through [`MAX_DIM`].
//!
//! An [`IndexSet`] is stored as a list of pairwise-disjoint inclusive
//! rectangles kept sorted by their low corner. All set algebra preserves that
//! invariant, which makes volume a plain sum and gives every set a canonical
//! enumeration order: rectangle by rectangle, row-major inside each
//! rectangle (last coordinate varies fastest).

use core::fmt;

use serde::{Deserialize, Serialize};

/// Largest supported dimensionality.
pub const MAX_DIM: usize = 4;

/// A point in an integer lattice of dimension 1..=[`MAX_DIM`].
///
/// Unused coordinates are always zero so the derived ordering is row-major
/// among points of equal dimension.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DomainPoint {
    dim: u8,
    coords: [i64; MAX_DIM],
}

impl DomainPoint {
    /// 1-D point.
    #[must_use]
    pub const fn p1(x: i64) -> Self {
        Self {
            dim: 1,
            coords: [x, 0, 0, 0],
        }
    }

    /// 2-D point.
    #[must_use]
    pub const fn p2(x: i64, y: i64) -> Self {
        Self {
            dim: 2,
            coords: [x, y, 0, 0],
        }
    }

    /// 3-D point.
    #[must_use]
    pub const fn p3(x: i64, y: i64, z: i64) -> Self {
        Self {
            dim: 3,
            coords: [x, y, z, 0],
        }
    }

    /// 4-D point.
    #[must_use]
    pub const fn p4(x: i64, y: i64, z: i64, w: i64) -> Self {
        Self {
            dim: 4,
            coords: [x, y, z, w],
        }
    }

    /// Builds a point from a coordinate slice. `None` unless `1 <= len <= MAX_DIM`.
    #[must_use]
    pub fn from_coords(coords: &[i64]) -> Option<Self> {
        if coords.is_empty() || coords.len() > MAX_DIM {
            return None;
        }
        let mut out = [0i64; MAX_DIM];
        out[..coords.len()].copy_from_slice(coords);
        Some(Self {
            dim: coords.len() as u8,
            coords: out,
        })
    }

    /// The origin of the given dimensionality (clamped to 1..=MAX_DIM).
    #[must_use]
    pub fn origin(dim: usize) -> Self {
        Self {
            dim: dim.clamp(1, MAX_DIM) as u8,
            coords: [0; MAX_DIM],
        }
    }

    /// Number of coordinates.
    #[must_use]
    pub const fn dim(&self) -> usize {
        self.dim as usize
    }

    /// Active coordinates.
    #[must_use]
    pub fn coords(&self) -> &[i64] {
        &self.coords[..self.dim()]
    }

    /// Coordinate `d`; zero beyond the point's dimensionality.
    #[must_use]
    pub fn coord(&self, d: usize) -> i64 {
        self.coords.get(d).copied().unwrap_or(0)
    }

    /// Component-wise sum. Dimensionality is taken from `self`.
    #[must_use]
    pub fn offset(&self, delta: &Self) -> Self {
        let mut out = *self;
        for d in 0..self.dim() {
            out.coords[d] = out.coords[d].wrapping_add(delta.coord(d));
        }
        out
    }

    /// Little-endian encoding of the active coordinates (8 bytes each).
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.coords().iter().flat_map(|c| c.to_le_bytes()).collect()
    }

    /// Decodes `dim` little-endian `i64` coordinates. `None` on short input.
    #[must_use]
    pub fn from_le_bytes(bytes: &[u8], dim: usize) -> Option<Self> {
        if dim == 0 || dim > MAX_DIM || bytes.len() < dim * 8 {
            return None;
        }
        let mut coords = [0i64; MAX_DIM];
        for (d, chunk) in bytes.chunks_exact(8).take(dim).enumerate() {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            coords[d] = i64::from_le_bytes(buf);
        }
        Some(Self {
            dim: dim as u8,
            coords,
        })
    }
}

impl fmt::Debug for DomainPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for DomainPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, c) in self.coords().iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{c}")?;
        }
        f.write_str(")")
    }
}

/// Inclusive axis-aligned rectangle. Empty when any `hi < lo`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct Rect {
    lo: DomainPoint,
    hi: DomainPoint,
}

impl Rect {
    /// Rectangle spanning `lo..=hi`.
    ///
    /// When the corner dimensionalities differ the result is an empty
    /// rectangle of `lo`'s dimensionality.
    #[must_use]
    pub fn new(lo: DomainPoint, hi: DomainPoint) -> Self {
        if lo.dim != hi.dim {
            return Self::empty(lo.dim());
        }
        Self { lo, hi }
    }

    /// 1-D rectangle `lo..=hi`.
    #[must_use]
    pub const fn span(lo: i64, hi: i64) -> Self {
        Self {
            lo: DomainPoint::p1(lo),
            hi: DomainPoint::p1(hi),
        }
    }

    /// Canonical empty rectangle of dimension `dim`.
    #[must_use]
    pub fn empty(dim: usize) -> Self {
        let lo = DomainPoint::origin(dim);
        let mut hi = lo;
        hi.coords[0] = -1;
        Self { lo, hi }
    }

    /// Single-point rectangle.
    #[must_use]
    pub const fn unit(p: DomainPoint) -> Self {
        Self { lo: p, hi: p }
    }

    /// Dimensionality.
    #[must_use]
    pub const fn dim(&self) -> usize {
        self.lo.dim()
    }

    /// Low corner.
    #[must_use]
    pub const fn lo(&self) -> DomainPoint {
        self.lo
    }

    /// High corner.
    #[must_use]
    pub const fn hi(&self) -> DomainPoint {
        self.hi
    }

    /// True when the rectangle holds no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        (0..self.dim()).any(|d| self.hi.coords[d] < self.lo.coords[d])
    }

    /// Number of points (saturating).
    #[must_use]
    pub fn volume(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        (0..self.dim()).fold(1u64, |acc, d| {
            let extent = self.hi.coords[d].abs_diff(self.lo.coords[d]).saturating_add(1);
            acc.saturating_mul(extent)
        })
    }

    /// Point membership.
    #[must_use]
    pub fn contains(&self, p: &DomainPoint) -> bool {
        p.dim == self.lo.dim
            && (0..self.dim()).all(|d| self.lo.coords[d] <= p.coords[d] && p.coords[d] <= self.hi.coords[d])
    }

    /// True when every point of `other` lies in `self`.
    #[must_use]
    pub fn contains_rect(&self, other: &Self) -> bool {
        other.is_empty() || (self.contains(&other.lo) && self.contains(&other.hi))
    }

    /// Overlap, or `None` when disjoint or of different dimensionality.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        if self.lo.dim != other.lo.dim {
            return None;
        }
        let mut lo = self.lo;
        let mut hi = self.hi;
        for d in 0..self.dim() {
            lo.coords[d] = lo.coords[d].max(other.lo.coords[d]);
            hi.coords[d] = hi.coords[d].min(other.hi.coords[d]);
        }
        let out = Self { lo, hi };
        (!out.is_empty()).then_some(out)
    }

    /// True when the rectangles share at least one point.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.intersection(other).is_some()
    }

    /// `self \ other` as disjoint rectangles (at most `2 * dim` pieces).
    #[must_use]
    pub fn subtract(&self, other: &Self) -> Vec<Self> {
        let Some(cut) = self.intersection(other) else {
            return if self.is_empty() { Vec::new() } else { vec![*self] };
        };
        let mut pieces = Vec::new();
        let mut rest = *self;
        for d in 0..self.dim() {
            if rest.lo.coords[d] < cut.lo.coords[d] {
                let mut piece = rest;
                piece.hi.coords[d] = cut.lo.coords[d] - 1;
                pieces.push(piece);
                rest.lo.coords[d] = cut.lo.coords[d];
            }
            if rest.hi.coords[d] > cut.hi.coords[d] {
                let mut piece = rest;
                piece.lo.coords[d] = cut.hi.coords[d] + 1;
                pieces.push(piece);
                rest.hi.coords[d] = cut.hi.coords[d];
            }
        }
        pieces
    }

    /// Rectangle shifted by `delta`.
    #[must_use]
    pub fn translate(&self, delta: &DomainPoint) -> Self {
        Self {
            lo: self.lo.offset(delta),
            hi: self.hi.offset(delta),
        }
    }

    /// Row-major iterator over the points.
    #[must_use]
    pub fn points(&self) -> RectPoints {
        RectPoints {
            rect: *self,
            next: (!self.is_empty()).then_some(self.lo),
        }
    }

    /// Row-major ordinal of `p`, or `None` when outside.
    #[must_use]
    pub fn linear_index(&self, p: &DomainPoint) -> Option<u64> {
        if !self.contains(p) {
            return None;
        }
        let mut index = 0u64;
        for d in 0..self.dim() {
            let extent = self.hi.coords[d].abs_diff(self.lo.coords[d]) + 1;
            index = index * extent + p.coords[d].abs_diff(self.lo.coords[d]);
        }
        Some(index)
    }

    /// Merges two rectangles that agree on every axis but one and touch on it.
    fn merge_adjacent(&self, other: &Self) -> Option<Self> {
        if self.lo.dim != other.lo.dim {
            return None;
        }
        let mut axis = None;
        for d in 0..self.dim() {
            let same = self.lo.coords[d] == other.lo.coords[d] && self.hi.coords[d] == other.hi.coords[d];
            if !same {
                if axis.is_some() {
                    return None;
                }
                axis = Some(d);
            }
        }
        let d = axis?;
        let (first, second) = if self.lo.coords[d] <= other.lo.coords[d] {
            (self, other)
        } else {
            (other, self)
        };
        if first.hi.coords[d].checked_add(1) != Some(second.lo.coords[d]) {
            return None;
        }
        let mut merged = *first;
        merged.hi.coords[d] = second.hi.coords[d];
        Some(merged)
    }
}

/// Row-major point iterator over a [`Rect`].
#[derive(Debug, Clone)]
pub struct RectPoints {
    rect: Rect,
    next: Option<DomainPoint>,
}

impl Iterator for RectPoints {
    type Item = DomainPoint;

    fn next(&mut self) -> Option<DomainPoint> {
        let current = self.next?;
        let mut succ = current;
        self.next = None;
        for d in (0..self.rect.dim()).rev() {
            if succ.coords[d] < self.rect.hi.coords[d] {
                succ.coords[d] += 1;
                for inner in d + 1..self.rect.dim() {
                    succ.coords[inner] = self.rect.lo.coords[inner];
                }
                self.next = Some(succ);
                break;
            }
        }
        Some(current)
    }
}

/// A set of points stored as sorted, pairwise-disjoint rectangles.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexSet {
    dim: u8,
    rects: Vec<Rect>,
}

impl PartialEq for IndexSet {
    fn eq(&self, other: &Self) -> bool {
        self.volume() == other.volume() && self.is_subset_of(other)
    }
}

impl Eq for IndexSet {}

impl IndexSet {
    /// Empty set of dimension `dim`.
    #[must_use]
    pub fn empty(dim: usize) -> Self {
        Self {
            dim: dim.clamp(1, MAX_DIM) as u8,
            rects: Vec::new(),
        }
    }

    /// Set holding exactly the points of `rect`.
    #[must_use]
    pub fn from_rect(rect: Rect) -> Self {
        let mut out = Self::empty(rect.dim());
        if !rect.is_empty() {
            out.rects.push(rect);
        }
        out
    }

    /// 1-D set `lo..=hi`.
    #[must_use]
    pub fn range(lo: i64, hi: i64) -> Self {
        Self::from_rect(Rect::span(lo, hi))
    }

    /// Union of arbitrary (possibly overlapping) rectangles.
    #[must_use]
    pub fn from_rects<I: IntoIterator<Item = Rect>>(dim: usize, rects: I) -> Self {
        let mut out = Self::empty(dim);
        for r in rects {
            out.insert_rect(r);
        }
        out.coalesce();
        out
    }

    /// Set holding exactly `points`. Runs along the last axis are fused.
    #[must_use]
    pub fn from_points<I: IntoIterator<Item = DomainPoint>>(dim: usize, points: I) -> Self {
        let mut pts: Vec<DomainPoint> = points.into_iter().filter(|p| p.dim() == dim).collect();
        pts.sort_unstable();
        pts.dedup();
        let mut runs: Vec<Rect> = Vec::new();
        for p in pts {
            if let Some(last) = runs.last_mut() {
                let d = dim - 1;
                let same_prefix = (0..d).all(|k| last.hi.coords[k] == p.coords[k]);
                if same_prefix && last.hi.coords[d].checked_add(1) == Some(p.coords[d]) {
                    last.hi = p;
                    continue;
                }
            }
            runs.push(Rect::unit(p));
        }
        let mut out = Self::empty(dim);
        out.rects = runs;
        out.coalesce();
        out
    }

    /// Dimensionality.
    #[must_use]
    pub const fn dim(&self) -> usize {
        self.dim as usize
    }

    /// Backing rectangles in canonical order.
    #[must_use]
    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    /// True when the set holds no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// Number of points (saturating).
    #[must_use]
    pub fn volume(&self) -> u64 {
        self.rects.iter().fold(0u64, |acc, r| acc.saturating_add(r.volume()))
    }

    /// Point membership.
    #[must_use]
    pub fn contains(&self, p: &DomainPoint) -> bool {
        self.rects.iter().any(|r| r.contains(p))
    }

    /// Smallest rectangle covering the set.
    #[must_use]
    pub fn bounds(&self) -> Option<Rect> {
        let first = self.rects.first()?;
        let mut out = *first;
        for r in &self.rects[1..] {
            for d in 0..self.dim() {
                out.lo.coords[d] = out.lo.coords[d].min(r.lo.coords[d]);
                out.hi.coords[d] = out.hi.coords[d].max(r.hi.coords[d]);
            }
        }
        Some(out)
    }

    /// True when the sets share at least one point.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        if self.dim != other.dim {
            return false;
        }
        match (self.bounds(), other.bounds()) {
            (Some(a), Some(b)) if a.overlaps(&b) => self
                .rects
                .iter()
                .any(|x| other.rects.iter().any(|y| x.overlaps(y))),
            _ => false,
        }
    }

    /// Points in both sets.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        let mut out = Self::empty(self.dim());
        if self.dim != other.dim {
            return out;
        }
        for a in &self.rects {
            for b in &other.rects {
                if let Some(c) = a.intersection(b) {
                    out.rects.push(c);
                }
            }
        }
        out.coalesce();
        out
    }

    /// Points in either set. Sets of another dimensionality contribute nothing.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let mut out = self.clone();
        if self.dim == other.dim {
            for r in &other.rects {
                out.insert_rect(*r);
            }
            out.coalesce();
        }
        out
    }

    /// Points in `self` but not in `other`.
    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        if self.dim != other.dim {
            return self.clone();
        }
        let mut out = Self::empty(self.dim());
        for a in &self.rects {
            let mut pieces = vec![*a];
            for b in &other.rects {
                if !a.overlaps(b) {
                    continue;
                }
                pieces = pieces.iter().flat_map(|p| p.subtract(b)).collect();
                if pieces.is_empty() {
                    break;
                }
            }
            out.rects.extend(pieces);
        }
        out.coalesce();
        out
    }

    /// True when every point of `self` is in `other`.
    #[must_use]
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.is_empty() || self.difference(other).is_empty()
    }

    /// Points in canonical order.
    pub fn points(&self) -> impl Iterator<Item = DomainPoint> + '_ {
        self.rects.iter().flat_map(Rect::points)
    }

    /// Ordinal of `p` in the canonical enumeration.
    #[must_use]
    pub fn linear_index(&self, p: &DomainPoint) -> Option<u64> {
        let mut base = 0u64;
        for r in &self.rects {
            if let Some(i) = r.linear_index(p) {
                return Some(base + i);
            }
            base = base.saturating_add(r.volume());
        }
        None
    }

    /// Image of every point under `f`, dropping `None` results.
    #[must_use]
    pub fn map_points<F>(&self, dim: usize, f: F) -> Self
    where
        F: Fn(&DomainPoint) -> Option<DomainPoint>,
    {
        Self::from_points(dim, self.points().filter_map(|p| f(&p)))
    }

    fn insert_rect(&mut self, rect: Rect) {
        if rect.is_empty() || rect.dim() != self.dim() {
            return;
        }
        let mut pieces = vec![rect];
        for existing in &self.rects {
            if !rect.overlaps(existing) {
                continue;
            }
            pieces = pieces.iter().flat_map(|p| p.subtract(existing)).collect();
            if pieces.is_empty() {
                return;
            }
        }
        self.rects.extend(pieces);
    }

    fn coalesce(&mut self) {
        self.rects.retain(|r| !r.is_empty());
        loop {
            self.rects.sort_unstable();
            let mut merged = false;
            'outer: for i in 0..self.rects.len() {
                for j in i + 1..self.rects.len() {
                    if let Some(m) = self.rects[i].merge_adjacent(&self.rects[j]) {
                        self.rects[i] = m;
                        self.rects.swap_remove(j);
                        merged = true;
                        break 'outer;
                    }
                }
            }
            if !merged {
                break;
            }
        }
    }
}

/// Affine map from color space to index space used by restriction partitions.
///
/// `apply(c) = M * c` where `M` has `rows` target coordinates and `cols`
/// source coordinates.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Transform {
    rows: u8,
    cols: u8,
    m: [[i64; MAX_DIM]; MAX_DIM],
}

impl Transform {
    /// Square identity of dimension `dim`.
    #[must_use]
    pub fn identity(dim: usize) -> Self {
        let dim = dim.clamp(1, MAX_DIM);
        let mut m = [[0; MAX_DIM]; MAX_DIM];
        for (d, row) in m.iter_mut().enumerate().take(dim) {
            row[d] = 1;
        }
        Self {
            rows: dim as u8,
            cols: dim as u8,
            m,
        }
    }

    /// Diagonal transform scaling each axis by the matching coordinate of `scale`.
    #[must_use]
    pub fn diagonal(scale: &DomainPoint) -> Self {
        let mut t = Self::identity(scale.dim());
        for d in 0..scale.dim() {
            t.m[d][d] = scale.coord(d);
        }
        t
    }

    /// Transform from explicit rows. `None` when ragged or out of range.
    #[must_use]
    pub fn from_rows(rows: &[&[i64]]) -> Option<Self> {
        let cols = rows.first()?.len();
        if rows.len() > MAX_DIM || cols == 0 || cols > MAX_DIM || rows.iter().any(|r| r.len() != cols) {
            return None;
        }
        let mut m = [[0; MAX_DIM]; MAX_DIM];
        for (i, row) in rows.iter().enumerate() {
            m[i][..cols].copy_from_slice(row);
        }
        Some(Self {
            rows: rows.len() as u8,
            cols: cols as u8,
            m,
        })
    }

    /// Applies the transform. `None` when `p` has the wrong dimensionality.
    #[must_use]
    pub fn apply(&self, p: &DomainPoint) -> Option<DomainPoint> {
        if p.dim() != self.cols as usize {
            return None;
        }
        let mut out = DomainPoint::origin(self.rows as usize);
        for i in 0..self.rows as usize {
            out.coords[i] = (0..self.cols as usize)
                .fold(0i64, |acc, j| acc.wrapping_add(self.m[i][j].wrapping_mul(p.coords[j])));
        }
        Some(out)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn rect2(x0: i64, y0: i64, x1: i64, y1: i64) -> Rect {
        Rect::new(DomainPoint::p2(x0, y0), DomainPoint::p2(x1, y1))
    }

    #[test]
    fn rect_volume_and_emptiness() {
        assert_eq!(Rect::span(0, 9).volume(), 10);
        assert!(Rect::span(5, 4).is_empty());
        assert_eq!(Rect::empty(3).volume(), 0);
        assert_eq!(rect2(0, 0, 3, 1).volume(), 8);
    }

    #[test]
    fn rect_points_are_row_major() {
        let pts: Vec<_> = rect2(0, 0, 1, 2).points().collect();
        assert_eq!(
            pts,
            vec![
                DomainPoint::p2(0, 0),
                DomainPoint::p2(0, 1),
                DomainPoint::p2(0, 2),
                DomainPoint::p2(1, 0),
                DomainPoint::p2(1, 1),
                DomainPoint::p2(1, 2),
            ]
        );
        assert_eq!(rect2(0, 0, 1, 2).linear_index(&DomainPoint::p2(1, 1)), Some(4));
    }

    #[test]
    fn subtract_covers_exactly_the_remainder() {
        let outer = rect2(0, 0, 9, 9);
        let hole = rect2(3, 3, 5, 5);
        let pieces = outer.subtract(&hole);
        let total: u64 = pieces.iter().map(Rect::volume).sum();
        assert_eq!(total, 100 - 9);
        for (i, a) in pieces.iter().enumerate() {
            assert!(!a.overlaps(&hole));
            for b in &pieces[i + 1..] {
                assert!(!a.overlaps(b));
            }
        }
    }

    #[test]
    fn set_algebra_on_ranges() {
        let a = IndexSet::range(0, 49);
        let b = IndexSet::range(25, 74);
        assert_eq!(a.intersection(&b), IndexSet::range(25, 49));
        assert_eq!(a.union(&b), IndexSet::range(0, 74));
        assert_eq!(a.difference(&b), IndexSet::range(0, 24));
        assert!(a.overlaps(&b));
        assert!(!IndexSet::range(0, 9).overlaps(&IndexSet::range(10, 19)));
        assert_eq!(a.union(&b).rects().len(), 1);
    }

    #[test]
    fn from_points_fuses_runs() {
        let set = IndexSet::from_points(1, [3, 1, 2, 7, 8].map(DomainPoint::p1));
        assert_eq!(set.volume(), 5);
        assert_eq!(set.rects().len(), 2);
        assert!(set.contains(&DomainPoint::p1(8)));
        assert!(!set.contains(&DomainPoint::p1(5)));
    }

    #[test]
    fn equality_is_semantic() {
        let split = IndexSet::from_rects(2, [rect2(0, 0, 4, 9), rect2(5, 0, 9, 9)]);
        let whole = IndexSet::from_rect(rect2(0, 0, 9, 9));
        assert_eq!(split, whole);
        assert_ne!(split, IndexSet::from_rect(rect2(0, 0, 9, 8)));
    }

    #[test]
    fn linear_index_follows_enumeration() {
        let set = IndexSet::from_rects(1, [Rect::span(10, 12), Rect::span(20, 21)]);
        let pts: Vec<_> = set.points().collect();
        for (i, p) in pts.iter().enumerate() {
            assert_eq!(set.linear_index(p), Some(i as u64));
        }
        assert_eq!(set.linear_index(&DomainPoint::p1(15)), None);
    }

    #[test]
    fn transform_applies_matrix() {
        let t = Transform::diagonal(&DomainPoint::p2(10, 4));
        assert_eq!(t.apply(&DomainPoint::p2(2, 3)), Some(DomainPoint::p2(20, 12)));
        let tall = Transform::from_rows(&[&[25], &[0]]).unwrap();
        assert_eq!(tall.apply(&DomainPoint::p1(3)), Some(DomainPoint::p2(75, 0)));
        assert_eq!(tall.apply(&DomainPoint::p2(3, 3)), None);
    }

    #[test]
    fn point_byte_encoding_round_trips() {
        let p = DomainPoint::p3(-1, 7, 1 << 40);
        assert_eq!(DomainPoint::from_le_bytes(&p.to_le_bytes(), 3), Some(p));
        assert_eq!(DomainPoint::from_le_bytes(&[0u8; 4], 1), None);
    }
}
