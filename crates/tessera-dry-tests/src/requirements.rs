// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Region requirement builder for tests.
//!
//! # Example
//!
//! ```no_run
//! use tessera_dry_tests::RequirementBuilder;
//! # fn demo(region: tessera_core::LogicalRegion, f: tessera_core::FieldId) {
//! let req = RequirementBuilder::region(region).read_write().field(f).build();
//! # }
//! ```

use tessera_core::{
    Coherence, FieldId, LayoutConstraintSet, LogicalPartition, LogicalRegion, Privilege,
    ProjectionId, ReductionOpId, RegionRequirement,
};

/// Builder for [`RegionRequirement`]. Defaults to read-only, exclusive,
/// with the target region as its own parent.
#[derive(Debug, Clone)]
pub struct RequirementBuilder {
    req: RegionRequirement,
}

impl RequirementBuilder {
    /// Requirement on `region`.
    pub fn region(region: LogicalRegion) -> Self {
        Self {
            req: RegionRequirement::region(region, Privilege::ReadOnly, Coherence::Exclusive, region),
        }
    }

    /// Projected requirement on `partition` of `parent`, using the identity
    /// projection.
    pub fn partition(partition: LogicalPartition, parent: LogicalRegion) -> Self {
        Self {
            req: RegionRequirement::partition(
                partition,
                ProjectionId::from_raw(0),
                Privilege::ReadOnly,
                Coherence::Exclusive,
                parent,
            ),
        }
    }

    /// Privileges derive from `parent`.
    #[must_use]
    pub const fn parent(mut self, parent: LogicalRegion) -> Self {
        self.req.parent = parent;
        self
    }

    /// Sets the privilege.
    #[must_use]
    pub const fn privilege(mut self, privilege: Privilege) -> Self {
        self.req.privilege = privilege;
        self
    }

    /// Read-only.
    #[must_use]
    pub const fn read_only(self) -> Self {
        self.privilege(Privilege::ReadOnly)
    }

    /// Read-write.
    #[must_use]
    pub const fn read_write(self) -> Self {
        self.privilege(Privilege::ReadWrite)
    }

    /// Write-discard.
    #[must_use]
    pub const fn write_discard(self) -> Self {
        self.privilege(Privilege::WriteDiscard)
    }

    /// Reduce with `redop`.
    #[must_use]
    pub const fn reduce(self, redop: ReductionOpId) -> Self {
        self.privilege(Privilege::Reduce(redop))
    }

    /// Sets the coherence.
    #[must_use]
    pub const fn coherence(mut self, coherence: Coherence) -> Self {
        self.req.coherence = coherence;
        self
    }

    /// Simultaneous coherence.
    #[must_use]
    pub const fn simultaneous(self) -> Self {
        self.coherence(Coherence::Simultaneous)
    }

    /// Atomic coherence.
    #[must_use]
    pub const fn atomic(self) -> Self {
        self.coherence(Coherence::Atomic)
    }

    /// Adds a field.
    #[must_use]
    pub fn field(mut self, field: FieldId) -> Self {
        self.req.fields.insert(field);
        self
    }

    /// Adds fields.
    #[must_use]
    pub fn fields<I: IntoIterator<Item = FieldId>>(mut self, fields: I) -> Self {
        self.req.fields.extend(fields);
        self
    }

    /// Projection functor for partition targets.
    #[must_use]
    pub const fn projection(mut self, projection: ProjectionId) -> Self {
        self.req.projection = projection;
        self
    }

    /// Layout constraints.
    #[must_use]
    pub fn constraints(mut self, constraints: LayoutConstraintSet) -> Self {
        self.req.constraints = constraints;
        self
    }

    /// The requirement.
    pub fn build(self) -> RegionRequirement {
        self.req
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tessera_core::{IndexSet, RegionForest, RegionTarget};

    use super::*;

    #[test]
    fn defaults_and_overrides() {
        let mut forest = RegionForest::new(true);
        let space = forest.create_index_space(IndexSet::range(0, 3));
        let fields = forest.create_field_space();
        let region = forest.create_logical_region(space, fields).unwrap();
        let req = RequirementBuilder::region(region)
            .reduce(ReductionOpId::from_raw(1))
            .atomic()
            .field(FieldId::from_raw(2))
            .fields([FieldId::from_raw(3)])
            .build();
        assert_eq!(req.target, RegionTarget::Region(region));
        assert_eq!(req.parent, region);
        assert_eq!(req.privilege, Privilege::Reduce(ReductionOpId::from_raw(1)));
        assert_eq!(req.coherence, Coherence::Atomic);
        assert_eq!(req.fields.len(), 2);
        assert_eq!(RequirementBuilder::region(region).build().privilege, Privilege::ReadOnly);
    }
}
