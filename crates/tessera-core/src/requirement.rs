// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Region requirements and layout constraints.

use crate::ident::{FieldId, FieldSpaceId, ProjectionId};
use crate::privilege::{Coherence, FieldSet, Privilege, RegionUsage};
use crate::region_tree::{LogicalPartition, LogicalRegion};

/// What a requirement names: a region, or (for index launches) a partition
/// whose subregions a projection functor selects per point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionTarget {
    /// A concrete region (or, with a non-identity projection, an upper bound).
    Region(LogicalRegion),
    /// A partition upper bound.
    Partition(LogicalPartition),
}

/// Memory an instance lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Host system memory.
    System,
    /// Registered (pinned) host memory.
    Registered,
    /// Device framebuffer memory.
    Framebuffer,
}

/// Field interleaving of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldLayout {
    /// One array per field.
    StructOfArrays,
    /// One record per point.
    ArrayOfStructs,
}

/// Constraints a mapping must satisfy. `None` leaves a dimension free.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayoutConstraintSet {
    /// Required memory kind.
    pub memory: Option<MemoryKind>,
    /// Required interleaving.
    pub layout: Option<FieldLayout>,
    /// Required field order.
    pub field_order: Option<Vec<FieldId>>,
}

/// A concrete instance layout chosen by a mapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLayout {
    /// Memory kind.
    pub memory: MemoryKind,
    /// Interleaving.
    pub layout: FieldLayout,
    /// Field order within the instance.
    pub field_order: Vec<FieldId>,
}

impl InstanceLayout {
    /// The least constrained layout satisfying `constraints` for `fields`.
    pub fn default_for(constraints: &LayoutConstraintSet, fields: &FieldSet) -> Self {
        Self {
            memory: constraints.memory.unwrap_or(MemoryKind::System),
            layout: constraints.layout.unwrap_or(FieldLayout::StructOfArrays),
            field_order: constraints
                .field_order
                .clone()
                .unwrap_or_else(|| fields.iter().copied().collect()),
        }
    }

    /// Whether this layout meets `constraints` and holds every field.
    pub fn satisfies(&self, constraints: &LayoutConstraintSet, fields: &FieldSet) -> bool {
        constraints.memory.is_none_or(|m| m == self.memory)
            && constraints.layout.is_none_or(|l| l == self.layout)
            && constraints
                .field_order
                .as_ref()
                .is_none_or(|order| *order == self.field_order)
            && fields.iter().all(|f| self.field_order.contains(f))
    }
}

/// One data requirement of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionRequirement {
    /// Region or partition named.
    pub target: RegionTarget,
    /// Projection functor applied in index launches.
    pub projection: ProjectionId,
    /// Fields requested.
    pub fields: FieldSet,
    /// Privilege requested.
    pub privilege: Privilege,
    /// Coherence requested.
    pub coherence: Coherence,
    /// Region whose privileges this requirement derives from.
    pub parent: LogicalRegion,
    /// Constraints the mapping must satisfy.
    pub constraints: LayoutConstraintSet,
}

impl RegionRequirement {
    /// Requirement on a concrete region.
    pub fn region(region: LogicalRegion, privilege: Privilege, coherence: Coherence, parent: LogicalRegion) -> Self {
        Self {
            target: RegionTarget::Region(region),
            projection: ProjectionId::from_raw(0),
            fields: FieldSet::new(),
            privilege,
            coherence,
            parent,
            constraints: LayoutConstraintSet::default(),
        }
    }

    /// Projected requirement on a partition upper bound.
    pub fn partition(
        partition: LogicalPartition,
        projection: ProjectionId,
        privilege: Privilege,
        coherence: Coherence,
        parent: LogicalRegion,
    ) -> Self {
        Self {
            target: RegionTarget::Partition(partition),
            projection,
            fields: FieldSet::new(),
            privilege,
            coherence,
            parent,
            constraints: LayoutConstraintSet::default(),
        }
    }

    /// Adds a field.
    pub fn add_field(mut self, field: FieldId) -> Self {
        self.fields.insert(field);
        self
    }

    /// Adds fields.
    pub fn with_fields<I: IntoIterator<Item = FieldId>>(mut self, fields: I) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Replaces the layout constraints.
    pub fn with_constraints(mut self, constraints: LayoutConstraintSet) -> Self {
        self.constraints = constraints;
        self
    }

    /// Replaces the projection functor.
    pub fn with_projection(mut self, projection: ProjectionId) -> Self {
        self.projection = projection;
        self
    }

    /// Usage recorded by the analyzer.
    pub const fn usage(&self) -> RegionUsage {
        RegionUsage::new(self.privilege, self.coherence)
    }

    /// The concrete region, for region targets.
    pub const fn region_target(&self) -> Option<LogicalRegion> {
        match self.target {
            RegionTarget::Region(r) => Some(r),
            RegionTarget::Partition(_) => None,
        }
    }
}

/// A region an operation will create while it executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRequirement {
    /// Field space of the created region.
    pub field_space: FieldSpaceId,
    /// Fields the task writes.
    pub fields: FieldSet,
    /// Dimensionality of the created index space.
    pub dim: usize,
}

impl OutputRequirement {
    /// Output requirement over `fields` of `field_space`.
    pub fn new<I: IntoIterator<Item = FieldId>>(field_space: FieldSpaceId, fields: I, dim: usize) -> Self {
        Self {
            field_space,
            fields: fields.into_iter().collect(),
            dim,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_satisfies_its_constraints() {
        let fields: FieldSet = [FieldId::from_raw(2), FieldId::from_raw(1)].into_iter().collect();
        let constraints = LayoutConstraintSet {
            memory: Some(MemoryKind::Registered),
            ..LayoutConstraintSet::default()
        };
        let layout = InstanceLayout::default_for(&constraints, &fields);
        assert!(layout.satisfies(&constraints, &fields));
        assert_eq!(layout.field_order, vec![FieldId::from_raw(1), FieldId::from_raw(2)]);

        let strict = LayoutConstraintSet {
            layout: Some(FieldLayout::ArrayOfStructs),
            ..LayoutConstraintSet::default()
        };
        assert!(!layout.satisfies(&strict, &fields));
    }

    #[test]
    fn layout_must_hold_every_field() {
        let fields: FieldSet = [FieldId::from_raw(1), FieldId::from_raw(2)].into_iter().collect();
        let layout = InstanceLayout {
            memory: MemoryKind::System,
            layout: FieldLayout::StructOfArrays,
            field_order: vec![FieldId::from_raw(1)],
        };
        assert!(!layout.satisfies(&LayoutConstraintSet::default(), &fields));
    }
}
