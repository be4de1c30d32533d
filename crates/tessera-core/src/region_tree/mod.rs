// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! The region forest: index-space trees, field spaces and the region trees
//! formed by pairing them.
//!
//! Nodes live in id-keyed arenas. Parent links are stored as ids, so the
//! cyclic index space ↔ partition structure never needs shared ownership.
//! Region-tree nodes are not materialized: a logical region is the triple
//! `(index space, field space, tree id)` and its node in the tree is simply
//! the index space.

pub mod partition;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{DomainPoint, IndexSet, Rect, Transform};
use crate::error::RegionTreeError;
use crate::ident::{
    ContextId, FieldId, FieldSpaceId, IndexPartitionId, IndexSpaceId, RegionTreeId, SerdezId,
};
use partition::{Coloring, SetOp};

/// Handle naming one node of a region tree.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct LogicalRegion {
    index_space: IndexSpaceId,
    field_space: FieldSpaceId,
    tree: RegionTreeId,
}

impl LogicalRegion {
    /// Index space of this region.
    #[must_use]
    pub const fn index_space(&self) -> IndexSpaceId {
        self.index_space
    }

    /// Field space of this region.
    #[must_use]
    pub const fn field_space(&self) -> FieldSpaceId {
        self.field_space
    }

    /// Region tree this region belongs to.
    #[must_use]
    pub const fn tree(&self) -> RegionTreeId {
        self.tree
    }
}

impl core::fmt::Display for LogicalRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "region(tree={}, is={}, fs={})",
            self.tree, self.index_space, self.field_space
        )
    }
}

/// Handle naming a partition node of a region tree.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct LogicalPartition {
    index_partition: IndexPartitionId,
    field_space: FieldSpaceId,
    tree: RegionTreeId,
}

impl LogicalPartition {
    /// Index partition of this logical partition.
    #[must_use]
    pub const fn index_partition(&self) -> IndexPartitionId {
        self.index_partition
    }

    /// Field space.
    #[must_use]
    pub const fn field_space(&self) -> FieldSpaceId {
        self.field_space
    }

    /// Region tree.
    #[must_use]
    pub const fn tree(&self) -> RegionTreeId {
        self.tree
    }
}

/// Asserted or computed disjointness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disjointness {
    /// Subspaces are pairwise disjoint.
    Disjoint,
    /// Subspaces may overlap.
    Aliased,
    /// Compute from the subspaces.
    Compute,
}

/// Asserted or computed completeness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Completeness {
    /// Subspaces cover the parent.
    Complete,
    /// Subspaces may leave parent points uncovered.
    Incomplete,
    /// Compute from the subspaces.
    Compute,
}

/// Partition kind: disjointness × completeness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionKind {
    /// Disjointness claim.
    pub disjointness: Disjointness,
    /// Completeness claim.
    pub completeness: Completeness,
}

impl PartitionKind {
    /// Compute both properties.
    pub const COMPUTE: Self = Self {
        disjointness: Disjointness::Compute,
        completeness: Completeness::Compute,
    };
    /// Assert disjoint; compute completeness.
    pub const DISJOINT: Self = Self {
        disjointness: Disjointness::Disjoint,
        completeness: Completeness::Compute,
    };
    /// Assert aliased; compute completeness.
    pub const ALIASED: Self = Self {
        disjointness: Disjointness::Aliased,
        completeness: Completeness::Compute,
    };
    /// Assert disjoint and complete.
    pub const DISJOINT_COMPLETE: Self = Self {
        disjointness: Disjointness::Disjoint,
        completeness: Completeness::Complete,
    };
}

/// Per-field metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    /// Bytes per point.
    pub size: usize,
    /// Custom serializer for copies, if any.
    pub serdez: Option<SerdezId>,
    /// Owning context for fields freed automatically when it ends.
    pub local_to: Option<ContextId>,
}

#[derive(Debug)]
struct IndexSpaceNode {
    domain: IndexSet,
    parent: Option<(IndexPartitionId, DomainPoint)>,
    partitions: Vec<IndexPartitionId>,
    refs: u32,
}

#[derive(Debug)]
struct IndexPartitionNode {
    parent: IndexSpaceId,
    color_space: IndexSet,
    children: BTreeMap<DomainPoint, IndexSpaceId>,
    disjoint: bool,
    complete: bool,
}

#[derive(Debug, Default)]
struct FieldSpaceNode {
    fields: BTreeMap<FieldId, FieldInfo>,
    next_field: u32,
}

/// The region forest.
#[derive(Debug)]
pub struct RegionForest {
    safe_checks: bool,
    index_spaces: BTreeMap<IndexSpaceId, IndexSpaceNode>,
    partitions: BTreeMap<IndexPartitionId, IndexPartitionNode>,
    field_spaces: BTreeMap<FieldSpaceId, FieldSpaceNode>,
    trees: BTreeMap<RegionTreeId, LogicalRegion>,
    next_index_space: u32,
    next_partition: u32,
    next_field_space: u32,
    next_tree: u32,
}

impl RegionForest {
    /// Empty forest. `safe_checks` verifies asserted partition properties.
    pub fn new(safe_checks: bool) -> Self {
        Self {
            safe_checks,
            index_spaces: BTreeMap::new(),
            partitions: BTreeMap::new(),
            field_spaces: BTreeMap::new(),
            trees: BTreeMap::new(),
            next_index_space: 1,
            next_partition: 1,
            next_field_space: 1,
            next_tree: 1,
        }
    }

    // ── index spaces ────────────────────────────────────────────────────

    /// Creates a root index space over `domain` with one reference.
    pub fn create_index_space(&mut self, domain: IndexSet) -> IndexSpaceId {
        let id = IndexSpaceId::from_raw(self.next_index_space);
        self.next_index_space += 1;
        self.index_spaces.insert(
            id,
            IndexSpaceNode {
                domain,
                parent: None,
                partitions: Vec::new(),
                refs: 1,
            },
        );
        id
    }

    /// Adds an owner to a root index space; each owner must destroy it.
    pub fn create_shared_ownership(&mut self, space: IndexSpaceId) -> Result<(), RegionTreeError> {
        let node = self.index_node_mut(space)?;
        if node.parent.is_some() {
            return Err(RegionTreeError::NotTopLevel(space));
        }
        node.refs += 1;
        Ok(())
    }

    /// Drops one owner. The last owner removes the whole index-space tree and
    /// every region tree built on it; the removed trees are returned.
    pub fn destroy_index_space(
        &mut self,
        space: IndexSpaceId,
    ) -> Result<Vec<RegionTreeId>, RegionTreeError> {
        let node = self.index_node_mut(space)?;
        if node.parent.is_some() {
            return Err(RegionTreeError::NotTopLevel(space));
        }
        node.refs -= 1;
        if node.refs > 0 {
            return Ok(Vec::new());
        }
        self.remove_space_subtree(space);
        let dead: Vec<RegionTreeId> = self
            .trees
            .iter()
            .filter(|(_, root)| root.index_space == space)
            .map(|(t, _)| *t)
            .collect();
        for t in &dead {
            self.trees.remove(t);
        }
        Ok(dead)
    }

    /// Removes a partition and everything beneath it.
    pub fn destroy_index_partition(&mut self, partition: IndexPartitionId) -> Result<(), RegionTreeError> {
        let parent = self.partition_node(partition)?.parent;
        if let Some(p) = self.index_spaces.get_mut(&parent) {
            p.partitions.retain(|ip| *ip != partition);
        }
        self.remove_partition_subtree(partition);
        Ok(())
    }

    fn remove_space_subtree(&mut self, space: IndexSpaceId) {
        if let Some(node) = self.index_spaces.remove(&space) {
            for ip in node.partitions {
                self.remove_partition_subtree(ip);
            }
        }
    }

    fn remove_partition_subtree(&mut self, partition: IndexPartitionId) {
        if let Some(node) = self.partitions.remove(&partition) {
            for child in node.children.into_values() {
                self.remove_space_subtree(child);
            }
        }
    }

    /// Points of an index space.
    pub fn index_space_domain(&self, space: IndexSpaceId) -> Result<&IndexSet, RegionTreeError> {
        Ok(&self.index_node(space)?.domain)
    }

    /// Partitions of an index space, in creation order.
    pub fn index_partitions(&self, space: IndexSpaceId) -> Result<&[IndexPartitionId], RegionTreeError> {
        Ok(&self.index_node(space)?.partitions)
    }

    /// Parent partition and color of a subspace; `None` for roots.
    pub fn index_space_parent(
        &self,
        space: IndexSpaceId,
    ) -> Result<Option<(IndexPartitionId, DomainPoint)>, RegionTreeError> {
        Ok(self.index_node(space)?.parent)
    }

    /// Parent index space of a partition.
    pub fn partition_parent(&self, partition: IndexPartitionId) -> Result<IndexSpaceId, RegionTreeError> {
        Ok(self.partition_node(partition)?.parent)
    }

    /// Color space of a partition.
    pub fn color_space(&self, partition: IndexPartitionId) -> Result<&IndexSet, RegionTreeError> {
        Ok(&self.partition_node(partition)?.color_space)
    }

    /// Whether subspaces are known pairwise disjoint.
    pub fn is_disjoint(&self, partition: IndexPartitionId) -> Result<bool, RegionTreeError> {
        Ok(self.partition_node(partition)?.disjoint)
    }

    /// Whether subspaces are known to cover the parent.
    pub fn is_complete(&self, partition: IndexPartitionId) -> Result<bool, RegionTreeError> {
        Ok(self.partition_node(partition)?.complete)
    }

    /// Subspace of `partition` at `color`.
    pub fn subspace(&self, partition: IndexPartitionId, color: &DomainPoint) -> Result<IndexSpaceId, RegionTreeError> {
        self.partition_node(partition)?
            .children
            .get(color)
            .copied()
            .ok_or(RegionTreeError::UnknownColor {
                partition,
                color: *color,
            })
    }

    /// All `(color, subspace)` pairs of a partition in color order.
    pub fn subspaces(
        &self,
        partition: IndexPartitionId,
    ) -> Result<Vec<(DomainPoint, IndexSpaceId)>, RegionTreeError> {
        Ok(self
            .partition_node(partition)?
            .children
            .iter()
            .map(|(c, s)| (*c, *s))
            .collect())
    }

    /// Number of partition levels from `ancestor` down to `space`, or `None`
    /// when `ancestor` is not on `space`'s root path.
    pub fn partition_depth(&self, ancestor: IndexSpaceId, space: IndexSpaceId) -> Option<u32> {
        let mut depth = 0;
        let mut cursor = space;
        loop {
            if cursor == ancestor {
                return Some(depth);
            }
            let (ip, _) = self.index_spaces.get(&cursor)?.parent?;
            cursor = self.partitions.get(&ip)?.parent;
            depth += 1;
        }
    }

    /// Root of `space`'s index-space tree.
    pub fn index_space_root(&self, space: IndexSpaceId) -> Result<IndexSpaceId, RegionTreeError> {
        let mut cursor = space;
        while let Some((ip, _)) = self.index_node(cursor)?.parent {
            cursor = self.partition_node(ip)?.parent;
        }
        Ok(cursor)
    }

    // ── field spaces ────────────────────────────────────────────────────

    /// Creates an empty field space.
    pub fn create_field_space(&mut self) -> FieldSpaceId {
        let id = FieldSpaceId::from_raw(self.next_field_space);
        self.next_field_space += 1;
        self.field_spaces.insert(id, FieldSpaceNode::default());
        id
    }

    /// Removes a field space and all its fields.
    pub fn destroy_field_space(&mut self, space: FieldSpaceId) -> Result<(), RegionTreeError> {
        self.field_spaces
            .remove(&space)
            .map(|_| ())
            .ok_or(RegionTreeError::UnknownFieldSpace(space))
    }

    /// Allocates a field of `size` bytes per point.
    pub fn allocate_field(
        &mut self,
        space: FieldSpaceId,
        size: usize,
        serdez: Option<SerdezId>,
    ) -> Result<FieldId, RegionTreeError> {
        self.allocate(space, size, serdez, None)
    }

    /// Allocates a field freed when `owner` ends.
    pub fn allocate_local_field(
        &mut self,
        space: FieldSpaceId,
        size: usize,
        owner: ContextId,
    ) -> Result<FieldId, RegionTreeError> {
        self.allocate(space, size, None, Some(owner))
    }

    fn allocate(
        &mut self,
        space: FieldSpaceId,
        size: usize,
        serdez: Option<SerdezId>,
        local_to: Option<ContextId>,
    ) -> Result<FieldId, RegionTreeError> {
        let node = self
            .field_spaces
            .get_mut(&space)
            .ok_or(RegionTreeError::UnknownFieldSpace(space))?;
        let id = FieldId::from_raw(node.next_field);
        node.next_field += 1;
        node.fields.insert(
            id,
            FieldInfo {
                size,
                serdez,
                local_to,
            },
        );
        Ok(id)
    }

    /// Frees a field.
    pub fn free_field(&mut self, space: FieldSpaceId, field: FieldId) -> Result<(), RegionTreeError> {
        let node = self
            .field_spaces
            .get_mut(&space)
            .ok_or(RegionTreeError::UnknownFieldSpace(space))?;
        node.fields
            .remove(&field)
            .map(|_| ())
            .ok_or(RegionTreeError::UnknownField { space, field })
    }

    /// Frees every field local to `owner`, returning what was freed.
    pub fn free_local_fields(&mut self, owner: ContextId) -> Vec<(FieldSpaceId, FieldId)> {
        let mut freed = Vec::new();
        for (fs, node) in &mut self.field_spaces {
            node.fields.retain(|f, info| {
                let local = info.local_to == Some(owner);
                if local {
                    freed.push((*fs, *f));
                }
                !local
            });
        }
        freed
    }

    /// Field metadata.
    pub fn field_info(&self, space: FieldSpaceId, field: FieldId) -> Result<FieldInfo, RegionTreeError> {
        self.field_spaces
            .get(&space)
            .ok_or(RegionTreeError::UnknownFieldSpace(space))?
            .fields
            .get(&field)
            .copied()
            .ok_or(RegionTreeError::UnknownField { space, field })
    }

    /// Allocated fields in id order.
    pub fn fields(&self, space: FieldSpaceId) -> Result<Vec<FieldId>, RegionTreeError> {
        Ok(self
            .field_spaces
            .get(&space)
            .ok_or(RegionTreeError::UnknownFieldSpace(space))?
            .fields
            .keys()
            .copied()
            .collect())
    }

    // ── logical regions ─────────────────────────────────────────────────

    /// Creates a new region tree rooted at `(space, fields)`.
    pub fn create_logical_region(
        &mut self,
        space: IndexSpaceId,
        fields: FieldSpaceId,
    ) -> Result<LogicalRegion, RegionTreeError> {
        let node = self.index_node(space)?;
        if node.parent.is_some() {
            return Err(RegionTreeError::NotTopLevel(space));
        }
        if !self.field_spaces.contains_key(&fields) {
            return Err(RegionTreeError::UnknownFieldSpace(fields));
        }
        let tree = RegionTreeId::from_raw(self.next_tree);
        self.next_tree += 1;
        let root = LogicalRegion {
            index_space: space,
            field_space: fields,
            tree,
        };
        self.trees.insert(tree, root);
        Ok(root)
    }

    /// Destroys a region tree. Only roots may be destroyed.
    pub fn destroy_logical_region(&mut self, region: LogicalRegion) -> Result<(), RegionTreeError> {
        let root = self.tree_root(region.tree)?;
        if root != region {
            return Err(RegionTreeError::NotTopLevel(region.index_space));
        }
        self.trees.remove(&region.tree);
        Ok(())
    }

    /// Root region of a tree.
    pub fn tree_root(&self, tree: RegionTreeId) -> Result<LogicalRegion, RegionTreeError> {
        self.trees
            .get(&tree)
            .copied()
            .ok_or(RegionTreeError::UnknownRegionTree(tree))
    }

    /// Live trees built over `space`.
    pub fn trees_of(&self, space: FieldSpaceId) -> Vec<RegionTreeId> {
        self.trees
            .iter()
            .filter(|(_, root)| root.field_space == space)
            .map(|(t, _)| *t)
            .collect()
    }

    /// Checks that the handle names a live node of a live tree.
    pub fn validate_region(&self, region: &LogicalRegion) -> Result<(), RegionTreeError> {
        let root = self.tree_root(region.tree)?;
        if root.field_space != region.field_space {
            return Err(RegionTreeError::UnknownRegionTree(region.tree));
        }
        if self.index_space_root(region.index_space)? != root.index_space {
            return Err(RegionTreeError::UnknownRegionTree(region.tree));
        }
        Ok(())
    }

    /// Points of a region.
    pub fn region_domain(&self, region: &LogicalRegion) -> Result<&IndexSet, RegionTreeError> {
        self.index_space_domain(region.index_space)
    }

    /// The logical partition of `region` by `partition`.
    pub fn get_logical_partition(
        &self,
        region: LogicalRegion,
        partition: IndexPartitionId,
    ) -> Result<LogicalPartition, RegionTreeError> {
        if self.partition_node(partition)?.parent != region.index_space {
            return Err(RegionTreeError::PartitionParentMismatch {
                partition,
                space: region.index_space,
            });
        }
        Ok(LogicalPartition {
            index_partition: partition,
            field_space: region.field_space,
            tree: region.tree,
        })
    }

    /// The subregion of `partition` at `color`.
    pub fn get_logical_subregion_by_color(
        &self,
        partition: LogicalPartition,
        color: &DomainPoint,
    ) -> Result<LogicalRegion, RegionTreeError> {
        let space = self.subspace(partition.index_partition, color)?;
        Ok(LogicalRegion {
            index_space: space,
            field_space: partition.field_space,
            tree: partition.tree,
        })
    }

    /// The region a logical partition partitions.
    pub fn get_parent_logical_region(&self, partition: LogicalPartition) -> Result<LogicalRegion, RegionTreeError> {
        Ok(LogicalRegion {
            index_space: self.partition_parent(partition.index_partition)?,
            field_space: partition.field_space,
            tree: partition.tree,
        })
    }

    /// The partition a region is a child of; `None` for tree roots.
    pub fn get_parent_logical_partition(
        &self,
        region: LogicalRegion,
    ) -> Result<Option<LogicalPartition>, RegionTreeError> {
        Ok(self
            .index_space_parent(region.index_space)?
            .map(|(ip, _)| LogicalPartition {
                index_partition: ip,
                field_space: region.field_space,
                tree: region.tree,
            }))
    }

    /// True when `region` is `ancestor` or lies beneath it in the same tree.
    pub fn is_subregion(&self, region: &LogicalRegion, ancestor: &LogicalRegion) -> bool {
        region.tree == ancestor.tree
            && region.field_space == ancestor.field_space
            && self
                .partition_depth(ancestor.index_space, region.index_space)
                .is_some()
    }

    /// True when the regions share a tree and at least one point.
    pub fn regions_overlap(&self, a: &LogicalRegion, b: &LogicalRegion) -> bool {
        if a.tree != b.tree {
            return false;
        }
        if a.index_space == b.index_space {
            return true;
        }
        match (self.region_domain(a), self.region_domain(b)) {
            (Ok(da), Ok(db)) => da.overlaps(db),
            _ => false,
        }
    }

    // ── partitions ──────────────────────────────────────────────────────

    /// Installs an explicit coloring as a new partition of `parent`.
    ///
    /// Colors of `color_space` missing from `coloring` get empty subspaces.
    pub fn create_partition(
        &mut self,
        parent: IndexSpaceId,
        color_space: IndexSet,
        mut coloring: Coloring,
        kind: PartitionKind,
    ) -> Result<IndexPartitionId, RegionTreeError> {
        let parent_domain = self.index_node(parent)?.domain.clone();
        for (color, sub) in &coloring {
            if !color_space.contains(color) {
                return Err(RegionTreeError::ColorOutOfBounds(*color));
            }
            if !sub.is_empty() && sub.dim() != parent_domain.dim() {
                return Err(RegionTreeError::DimensionMismatch {
                    expected: parent_domain.dim(),
                    found: sub.dim(),
                });
            }
            if !sub.is_subset_of(&parent_domain) {
                return Err(RegionTreeError::SubspaceNotContained(*color));
            }
        }
        for color in color_space.points() {
            coloring
                .entry(color)
                .or_insert_with(|| IndexSet::empty(parent_domain.dim()));
        }

        let disjoint = match kind.disjointness {
            Disjointness::Aliased => false,
            Disjointness::Disjoint if !self.safe_checks => true,
            Disjointness::Disjoint => {
                if let Some((first, second)) = partition::first_overlap(&coloring) {
                    return Err(RegionTreeError::NotDisjoint { first, second });
                }
                true
            }
            Disjointness::Compute => partition::first_overlap(&coloring).is_none(),
        };
        let complete = match kind.completeness {
            Completeness::Incomplete => false,
            Completeness::Complete if !self.safe_checks => true,
            Completeness::Complete => {
                let missing = partition::uncovered(&parent_domain, &coloring);
                if missing > 0 {
                    return Err(RegionTreeError::NotComplete { missing });
                }
                true
            }
            Completeness::Compute => partition::uncovered(&parent_domain, &coloring) == 0,
        };

        let id = IndexPartitionId::from_raw(self.next_partition);
        self.next_partition += 1;
        let mut children = BTreeMap::new();
        for (color, sub) in coloring {
            let child = IndexSpaceId::from_raw(self.next_index_space);
            self.next_index_space += 1;
            self.index_spaces.insert(
                child,
                IndexSpaceNode {
                    domain: sub,
                    parent: Some((id, color)),
                    partitions: Vec::new(),
                    refs: 1,
                },
            );
            children.insert(color, child);
        }
        self.partitions.insert(
            id,
            IndexPartitionNode {
                parent,
                color_space,
                children,
                disjoint,
                complete,
            },
        );
        self.index_node_mut(parent)?.partitions.push(id);
        Ok(id)
    }

    /// Splits `parent` into `colors` near-equal contiguous subspaces.
    pub fn partition_equal(&mut self, parent: IndexSpaceId, colors: u64) -> Result<IndexPartitionId, RegionTreeError> {
        let coloring = partition::equal(self.index_space_domain(parent)?, colors)?;
        let last = i64::try_from(colors).map_err(|_| RegionTreeError::TooManyColors(colors))? - 1;
        let color_space = IndexSet::range(0, last);
        self.create_partition(parent, color_space, coloring, PartitionKind::DISJOINT_COMPLETE)
    }

    /// Blocks of `extent` placed at `transform(color)` for each color.
    pub fn partition_by_restriction(
        &mut self,
        parent: IndexSpaceId,
        color_space: IndexSet,
        transform: &Transform,
        extent: &Rect,
        kind: PartitionKind,
    ) -> Result<IndexPartitionId, RegionTreeError> {
        let coloring = partition::restriction(self.index_space_domain(parent)?, &color_space, transform, extent)?;
        self.create_partition(parent, color_space, coloring, kind)
    }

    /// Colors each point of `parent` by `color_of`; always disjoint.
    pub fn partition_by_color_fn<F>(
        &mut self,
        parent: IndexSpaceId,
        color_space: IndexSet,
        color_of: F,
    ) -> Result<IndexPartitionId, RegionTreeError>
    where
        F: Fn(&DomainPoint) -> Option<DomainPoint>,
    {
        let coloring = partition::by_field(self.index_space_domain(parent)?, &color_space, color_of);
        self.create_partition(parent, color_space, coloring, PartitionKind::DISJOINT)
    }

    /// Partitions `target` by the image of each subspace of `source` under `map`.
    pub fn partition_by_image_fn<F>(
        &mut self,
        target: IndexSpaceId,
        source: IndexPartitionId,
        map: F,
        kind: PartitionKind,
    ) -> Result<IndexPartitionId, RegionTreeError>
    where
        F: Fn(&DomainPoint) -> Option<DomainPoint>,
    {
        let sources = self.coloring_of(source)?;
        let color_space = self.color_space(source)?.clone();
        let coloring = partition::image(self.index_space_domain(target)?, &sources, map);
        self.create_partition(target, color_space, coloring, kind)
    }

    /// Partitions `source` by which subspace of `target` each point maps into.
    pub fn partition_by_preimage_fn<F>(
        &mut self,
        source: IndexSpaceId,
        target: IndexPartitionId,
        map: F,
        kind: PartitionKind,
    ) -> Result<IndexPartitionId, RegionTreeError>
    where
        F: Fn(&DomainPoint) -> Option<DomainPoint>,
    {
        let targets = self.coloring_of(target)?;
        let color_space = self.color_space(target)?.clone();
        let coloring = partition::preimage(self.index_space_domain(source)?, &targets, map);
        self.create_partition(source, color_space, coloring, kind)
    }

    /// Color-wise union, intersection or difference of two partitions of one parent.
    pub fn partition_by_set_op(
        &mut self,
        op: SetOp,
        first: IndexPartitionId,
        second: IndexPartitionId,
        kind: PartitionKind,
    ) -> Result<IndexPartitionId, RegionTreeError> {
        let parent = self.partition_parent(first)?;
        if self.partition_parent(second)? != parent {
            return Err(RegionTreeError::IncompatiblePartitions { first, second });
        }
        let dim = self.index_space_domain(parent)?.dim();
        let left = self.coloring_of(first)?;
        let right = self.coloring_of(second)?;
        let coloring = partition::combine(op, &left, &right, dim);
        let colors: Vec<DomainPoint> = coloring.keys().copied().collect();
        let color_dim = colors.first().map_or(1, DomainPoint::dim);
        let color_space = IndexSet::from_points(color_dim, colors);
        self.create_partition(parent, color_space, coloring, kind)
    }

    fn coloring_of(&self, partition: IndexPartitionId) -> Result<Coloring, RegionTreeError> {
        let node = self.partition_node(partition)?;
        node.children
            .iter()
            .map(|(c, s)| Ok((*c, self.index_space_domain(*s)?.clone())))
            .collect()
    }

    fn index_node(&self, space: IndexSpaceId) -> Result<&IndexSpaceNode, RegionTreeError> {
        self.index_spaces
            .get(&space)
            .ok_or(RegionTreeError::UnknownIndexSpace(space))
    }

    fn index_node_mut(&mut self, space: IndexSpaceId) -> Result<&mut IndexSpaceNode, RegionTreeError> {
        self.index_spaces
            .get_mut(&space)
            .ok_or(RegionTreeError::UnknownIndexSpace(space))
    }

    fn partition_node(&self, partition: IndexPartitionId) -> Result<&IndexPartitionNode, RegionTreeError> {
        self.partitions
            .get(&partition)
            .ok_or(RegionTreeError::UnknownPartition(partition))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn forest_with_region(n: i64) -> (RegionForest, LogicalRegion) {
        let mut forest = RegionForest::new(true);
        let is = forest.create_index_space(IndexSet::range(0, n - 1));
        let fs = forest.create_field_space();
        forest.allocate_field(fs, 8, None).unwrap();
        let region = forest.create_logical_region(is, fs).unwrap();
        (forest, region)
    }

    #[test]
    fn equal_partition_is_disjoint_and_complete() {
        let (mut forest, region) = forest_with_region(100);
        let ip = forest.partition_equal(region.index_space(), 4).unwrap();
        assert!(forest.is_disjoint(ip).unwrap());
        assert!(forest.is_complete(ip).unwrap());
        let lp = forest.get_logical_partition(region, ip).unwrap();
        let sub = forest
            .get_logical_subregion_by_color(lp, &DomainPoint::p1(1))
            .unwrap();
        assert_eq!(forest.region_domain(&sub).unwrap(), &IndexSet::range(25, 49));
        assert_eq!(forest.get_parent_logical_region(lp).unwrap(), region);
        assert_eq!(forest.get_parent_logical_partition(sub).unwrap(), Some(lp));
        assert!(forest.is_subregion(&sub, &region));
        assert!(!forest.is_subregion(&region, &sub));
    }

    #[test]
    fn asserted_disjoint_overlap_is_rejected_under_safe_checks() {
        let (mut forest, region) = forest_with_region(10);
        let mut coloring = Coloring::new();
        coloring.insert(DomainPoint::p1(0), IndexSet::range(0, 5));
        coloring.insert(DomainPoint::p1(1), IndexSet::range(5, 9));
        let err = forest
            .create_partition(region.index_space(), IndexSet::range(0, 1), coloring.clone(), PartitionKind::DISJOINT)
            .unwrap_err();
        assert!(matches!(err, RegionTreeError::NotDisjoint { .. }));

        let ip = forest
            .create_partition(region.index_space(), IndexSet::range(0, 1), coloring, PartitionKind::COMPUTE)
            .unwrap();
        assert!(!forest.is_disjoint(ip).unwrap());
        assert!(forest.is_complete(ip).unwrap());
    }

    #[test]
    fn unchecked_forest_trusts_assertions() {
        let mut forest = RegionForest::new(false);
        let is = forest.create_index_space(IndexSet::range(0, 9));
        let mut coloring = Coloring::new();
        coloring.insert(DomainPoint::p1(0), IndexSet::range(0, 5));
        coloring.insert(DomainPoint::p1(1), IndexSet::range(5, 9));
        let ip = forest
            .create_partition(is, IndexSet::range(0, 1), coloring, PartitionKind::DISJOINT)
            .unwrap();
        assert!(forest.is_disjoint(ip).unwrap());
    }

    #[test]
    fn coloring_outside_parent_or_color_space_fails() {
        let (mut forest, region) = forest_with_region(10);
        let mut outside = Coloring::new();
        outside.insert(DomainPoint::p1(0), IndexSet::range(5, 20));
        assert!(matches!(
            forest.create_partition(region.index_space(), IndexSet::range(0, 0), outside, PartitionKind::COMPUTE),
            Err(RegionTreeError::SubspaceNotContained(_))
        ));
        let mut bad_color = Coloring::new();
        bad_color.insert(DomainPoint::p1(7), IndexSet::range(0, 1));
        assert!(matches!(
            forest.create_partition(region.index_space(), IndexSet::range(0, 0), bad_color, PartitionKind::COMPUTE),
            Err(RegionTreeError::ColorOutOfBounds(_))
        ));
    }

    #[test]
    fn shared_ownership_delays_destruction() {
        let (mut forest, region) = forest_with_region(10);
        let is = region.index_space();
        let ip = forest.partition_equal(is, 2).unwrap();
        let child = forest.subspace(ip, &DomainPoint::p1(0)).unwrap();
        assert!(matches!(forest.destroy_index_space(child), Err(RegionTreeError::NotTopLevel(_))));

        forest.create_shared_ownership(is).unwrap();
        assert!(forest.destroy_index_space(is).unwrap().is_empty());
        assert!(forest.index_space_domain(is).is_ok());
        let dead = forest.destroy_index_space(is).unwrap();
        assert_eq!(dead, vec![region.tree()]);
        assert!(forest.index_space_domain(child).is_err());
        assert!(forest.tree_root(region.tree()).is_err());
    }

    #[test]
    fn each_region_creation_is_a_new_tree() {
        let mut forest = RegionForest::new(true);
        let is = forest.create_index_space(IndexSet::range(0, 3));
        let fs = forest.create_field_space();
        let a = forest.create_logical_region(is, fs).unwrap();
        let b = forest.create_logical_region(is, fs).unwrap();
        assert_ne!(a.tree(), b.tree());
        assert!(!forest.regions_overlap(&a, &b));
        assert!(forest.regions_overlap(&a, &a));
    }

    #[test]
    fn local_fields_are_freed_with_their_owner() {
        let mut forest = RegionForest::new(true);
        let fs = forest.create_field_space();
        let kept = forest.allocate_field(fs, 4, None).unwrap();
        let owner = ContextId::from_raw(9);
        let local = forest.allocate_local_field(fs, 4, owner).unwrap();
        assert_eq!(forest.free_local_fields(owner), vec![(fs, local)]);
        assert_eq!(forest.fields(fs).unwrap(), vec![kept]);
        assert!(forest.free_field(fs, local).is_err());
    }

    #[test]
    fn set_operations_require_a_common_parent() {
        let (mut forest, region) = forest_with_region(10);
        let a = forest.partition_equal(region.index_space(), 2).unwrap();
        let b = forest.partition_equal(region.index_space(), 2).unwrap();
        let u = forest.partition_by_set_op(SetOp::Union, a, b, PartitionKind::COMPUTE).unwrap();
        assert!(forest.is_disjoint(u).unwrap());

        let other = forest.create_index_space(IndexSet::range(0, 9));
        let c = forest.partition_equal(other, 2).unwrap();
        assert!(matches!(
            forest.partition_by_set_op(SetOp::Union, a, c, PartitionKind::COMPUTE),
            Err(RegionTreeError::IncompatiblePartitions { .. })
        ));
    }
}
