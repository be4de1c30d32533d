// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Colorings produced by the dependent-partitioning operators.
//!
//! Every function here is pure: it maps parent geometry (and, for the
//! data-driven variants, a per-point lookup) to a color → subspace map. The
//! forest validates and installs the result.

use std::collections::BTreeMap;

use crate::domain::{DomainPoint, IndexSet, Rect, Transform};
use crate::error::RegionTreeError;

/// Color → subspace map.
pub type Coloring = BTreeMap<DomainPoint, IndexSet>;

/// Splits `parent` into `colors` contiguous chunks of near-equal volume.
///
/// Chunks follow the canonical enumeration order, so a 1-D range splits into
/// consecutive sub-ranges. Colors are the 1-D points `0..colors`.
pub fn equal(parent: &IndexSet, colors: u64) -> Result<Coloring, RegionTreeError> {
    if colors == 0 {
        return Err(RegionTreeError::ZeroColors);
    }
    let count = i64::try_from(colors)
        .ok()
        .and_then(|c| usize::try_from(c).ok())
        .ok_or(RegionTreeError::TooManyColors(colors))?;
    let total = u128::from(parent.volume());
    let mut buckets: Vec<Vec<DomainPoint>> = vec![Vec::new(); count];
    if total > 0 {
        for (ordinal, p) in parent.points().enumerate() {
            let color = (ordinal as u128 * u128::from(colors)) / total;
            if let Some(bucket) = usize::try_from(color).ok().and_then(|c| buckets.get_mut(c)) {
                bucket.push(p);
            }
        }
    }
    Ok((0..)
        .zip(buckets)
        .map(|(c, pts)| (DomainPoint::p1(c), IndexSet::from_points(parent.dim(), pts)))
        .collect())
}

/// `subspace(c) = (extent + transform(c)) ∩ parent` for every color.
pub fn restriction(
    parent: &IndexSet,
    color_space: &IndexSet,
    transform: &Transform,
    extent: &Rect,
) -> Result<Coloring, RegionTreeError> {
    if extent.dim() != parent.dim() {
        return Err(RegionTreeError::DimensionMismatch {
            expected: parent.dim(),
            found: extent.dim(),
        });
    }
    let mut out = Coloring::new();
    for color in color_space.points() {
        let offset = transform.apply(&color).ok_or(RegionTreeError::DimensionMismatch {
            expected: color_space.dim(),
            found: color.dim(),
        })?;
        if offset.dim() != parent.dim() {
            return Err(RegionTreeError::DimensionMismatch {
                expected: parent.dim(),
                found: offset.dim(),
            });
        }
        let block = IndexSet::from_rect(extent.translate(&offset));
        out.insert(color, block.intersection(parent));
    }
    Ok(out)
}

/// `subspace(c) = { p ∈ parent | color_of(p) == c }`, restricted to `color_space`.
pub fn by_field<F>(parent: &IndexSet, color_space: &IndexSet, color_of: F) -> Coloring
where
    F: Fn(&DomainPoint) -> Option<DomainPoint>,
{
    let mut buckets: BTreeMap<DomainPoint, Vec<DomainPoint>> =
        color_space.points().map(|c| (c, Vec::new())).collect();
    for p in parent.points() {
        if let Some(c) = color_of(&p) {
            if let Some(bucket) = buckets.get_mut(&c) {
                bucket.push(p);
            }
        }
    }
    buckets
        .into_iter()
        .map(|(c, pts)| (c, IndexSet::from_points(parent.dim(), pts)))
        .collect()
}

/// `subspace(c) = image(source(c)) ∩ target`.
pub fn image<F>(target: &IndexSet, sources: &Coloring, map: F) -> Coloring
where
    F: Fn(&DomainPoint) -> Option<DomainPoint>,
{
    sources
        .iter()
        .map(|(c, src)| {
            let img = src.map_points(target.dim(), |p| map(p));
            (*c, img.intersection(target))
        })
        .collect()
}

/// `subspace(c) = { p ∈ source | map(p) ∈ targets(c) }`.
pub fn preimage<F>(source: &IndexSet, targets: &Coloring, map: F) -> Coloring
where
    F: Fn(&DomainPoint) -> Option<DomainPoint>,
{
    let mut buckets: BTreeMap<DomainPoint, Vec<DomainPoint>> =
        targets.keys().map(|c| (*c, Vec::new())).collect();
    for p in source.points() {
        let Some(q) = map(&p) else { continue };
        for (c, tgt) in targets {
            if tgt.contains(&q) {
                if let Some(bucket) = buckets.get_mut(c) {
                    bucket.push(p);
                }
            }
        }
    }
    buckets
        .into_iter()
        .map(|(c, pts)| (c, IndexSet::from_points(source.dim(), pts)))
        .collect()
}

/// Pairwise set operation over two colorings of one parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    /// Colors from either side; subspaces united.
    Union,
    /// Colors present on both sides; subspaces intersected.
    Intersection,
    /// Colors of the left side; right subspace removed.
    Difference,
}

/// Applies `op` color by color.
pub fn combine(op: SetOp, left: &Coloring, right: &Coloring, dim: usize) -> Coloring {
    let empty = IndexSet::empty(dim);
    match op {
        SetOp::Union => {
            let mut out = left.clone();
            for (c, r) in right {
                let merged = out.get(c).map_or_else(|| r.clone(), |l| l.union(r));
                out.insert(*c, merged);
            }
            out
        }
        SetOp::Intersection => left
            .iter()
            .filter_map(|(c, l)| right.get(c).map(|r| (*c, l.intersection(r))))
            .collect(),
        SetOp::Difference => left
            .iter()
            .map(|(c, l)| (*c, l.difference(right.get(c).unwrap_or(&empty))))
            .collect(),
    }
}

/// First pair of overlapping colors, if any.
pub fn first_overlap(coloring: &Coloring) -> Option<(DomainPoint, DomainPoint)> {
    let entries: Vec<_> = coloring.iter().collect();
    for (i, (ca, a)) in entries.iter().enumerate() {
        for (cb, b) in &entries[i + 1..] {
            if a.overlaps(b) {
                return Some((**ca, **cb));
            }
        }
    }
    None
}

/// Parent points not covered by any subspace.
pub fn uncovered(parent: &IndexSet, coloring: &Coloring) -> u64 {
    let covered = coloring
        .values()
        .fold(IndexSet::empty(parent.dim()), |acc, s| acc.union(s));
    parent.difference(&covered).volume()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn equal_split_rejects_unindexable_color_counts() {
        assert_eq!(equal(&IndexSet::range(0, 3), 0), Err(RegionTreeError::ZeroColors));
        assert_eq!(
            equal(&IndexSet::range(0, 3), u64::MAX),
            Err(RegionTreeError::TooManyColors(u64::MAX))
        );
    }

    #[test]
    fn equal_split_of_one_hundred_into_four() {
        let parts = equal(&IndexSet::range(0, 99), 4).unwrap();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[&DomainPoint::p1(0)], IndexSet::range(0, 24));
        assert_eq!(parts[&DomainPoint::p1(3)], IndexSet::range(75, 99));
        assert!(first_overlap(&parts).is_none());
        assert_eq!(uncovered(&IndexSet::range(0, 99), &parts), 0);
    }

    #[test]
    fn equal_split_with_remainder_is_balanced() {
        let parts = equal(&IndexSet::range(0, 9), 3).unwrap();
        let sizes: Vec<u64> = parts.values().map(IndexSet::volume).collect();
        assert_eq!(sizes.iter().sum::<u64>(), 10);
        assert!(sizes.iter().all(|s| (3..=4).contains(s)));
        assert!(equal(&IndexSet::range(0, 9), 0).is_err());
    }

    #[test]
    fn restriction_builds_halo_blocks() {
        let parent = IndexSet::range(0, 99);
        let colors = IndexSet::range(0, 3);
        let t = Transform::diagonal(&DomainPoint::p1(25));
        let blocks = restriction(&parent, &colors, &t, &Rect::span(-1, 25)).unwrap();
        assert_eq!(blocks[&DomainPoint::p1(0)], IndexSet::range(0, 25));
        assert_eq!(blocks[&DomainPoint::p1(1)], IndexSet::range(24, 50));
        assert_eq!(blocks[&DomainPoint::p1(3)], IndexSet::range(74, 99));
        assert!(first_overlap(&blocks).is_some());
    }

    #[test]
    fn field_image_and_preimage_agree() {
        let parent = IndexSet::range(0, 9);
        let colors = IndexSet::range(0, 1);
        let parity = by_field(&parent, &colors, |p| Some(DomainPoint::p1(p.coord(0) % 2)));
        assert_eq!(parity[&DomainPoint::p1(0)].volume(), 5);

        let target = IndexSet::range(0, 19);
        let doubled = image(&target, &parity, |p| Some(DomainPoint::p1(p.coord(0) * 2)));
        assert!(doubled[&DomainPoint::p1(1)].contains(&DomainPoint::p1(18)));
        assert!(!doubled[&DomainPoint::p1(1)].contains(&DomainPoint::p1(4)));

        let back = preimage(&parent, &doubled, |p| Some(DomainPoint::p1(p.coord(0) * 2)));
        assert_eq!(back[&DomainPoint::p1(0)], parity[&DomainPoint::p1(0)]);
    }

    #[test]
    fn combine_respects_color_sets() {
        let a = equal(&IndexSet::range(0, 9), 2).unwrap();
        let mut b = Coloring::new();
        b.insert(DomainPoint::p1(1), IndexSet::range(3, 6));
        let u = combine(SetOp::Union, &a, &b, 1);
        assert_eq!(u[&DomainPoint::p1(1)], IndexSet::range(3, 9));
        let i = combine(SetOp::Intersection, &a, &b, 1);
        assert_eq!(i.len(), 1);
        assert_eq!(i[&DomainPoint::p1(1)], IndexSet::range(5, 6));
        let d = combine(SetOp::Difference, &a, &b, 1);
        assert_eq!(d[&DomainPoint::p1(1)], IndexSet::range(7, 9));
        assert_eq!(d[&DomainPoint::p1(0)], IndexSet::range(0, 4));
    }
}
