// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Projection functors: per-point region selection for index launches.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::domain::{DomainPoint, IndexSet};
use crate::error::{RegionTreeError, RuntimeError};
use crate::ident::ProjectionId;
use crate::region_tree::{LogicalRegion, RegionForest};
use crate::requirement::RegionTarget;

/// Maps a launch point to the region it accesses.
///
/// Functors must be pure: the same inputs always yield the same region.
/// Replicated contexts rely on this to agree on every point's data.
pub trait ProjectionFunctor: Send + Sync {
    /// Region accessed by `point` of a launch over `launch`.
    fn project(
        &self,
        forest: &RegionForest,
        upper: &RegionTarget,
        point: &DomainPoint,
        launch: &IndexSet,
    ) -> Result<LogicalRegion, RegionTreeError>;

    /// Partition levels below the upper bound the result may reach. A
    /// partition upper bound always contributes one implicit level.
    fn depth(&self) -> u32 {
        0
    }

    /// Whether distinct points always map to distinct regions.
    fn is_injective(&self) -> bool {
        false
    }

    /// Whether a launch reaches every subregion of a partition upper bound.
    fn is_complete(&self) -> bool {
        false
    }
}

/// Identity projection (id 0): point `p` selects the subregion colored `p`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityProjection;

impl ProjectionFunctor for IdentityProjection {
    fn project(
        &self,
        forest: &RegionForest,
        upper: &RegionTarget,
        point: &DomainPoint,
        _launch: &IndexSet,
    ) -> Result<LogicalRegion, RegionTreeError> {
        match upper {
            RegionTarget::Region(r) => Ok(*r),
            RegionTarget::Partition(p) => forest.get_logical_subregion_by_color(*p, point),
        }
    }

    fn is_injective(&self) -> bool {
        true
    }
}

/// Id → functor table, seeded with the identity functor at id 0.
#[derive(Clone)]
pub struct ProjectionRegistry {
    functors: BTreeMap<ProjectionId, Arc<dyn ProjectionFunctor>>,
}

impl Default for ProjectionRegistry {
    fn default() -> Self {
        let mut functors: BTreeMap<ProjectionId, Arc<dyn ProjectionFunctor>> = BTreeMap::new();
        functors.insert(ProjectionId::from_raw(0), Arc::new(IdentityProjection));
        Self { functors }
    }
}

impl ProjectionRegistry {
    /// Registers a functor under `id`.
    pub fn register(&mut self, id: ProjectionId, functor: Arc<dyn ProjectionFunctor>) -> Result<(), RuntimeError> {
        if self.functors.contains_key(&id) {
            return Err(RuntimeError::DuplicateRegistration {
                kind: "projection functor",
                id: id.value(),
            });
        }
        self.functors.insert(id, functor);
        Ok(())
    }

    /// Functor by id.
    pub fn get(&self, id: ProjectionId) -> Result<&Arc<dyn ProjectionFunctor>, RuntimeError> {
        self.functors.get(&id).ok_or(RuntimeError::UnknownRegistration {
            kind: "projection functor",
            id: id.value(),
        })
    }
}

/// Projects `point` and checks the result stays under `upper`.
pub fn project_point(
    forest: &RegionForest,
    functor: &dyn ProjectionFunctor,
    upper: &RegionTarget,
    point: &DomainPoint,
    launch: &IndexSet,
) -> Result<LogicalRegion, RegionTreeError> {
    let region = functor.project(forest, upper, point, launch)?;
    forest.validate_region(&region)?;
    let escaped = RegionTreeError::ProjectionOutOfBounds { point: *point };
    match upper {
        RegionTarget::Region(bound) => {
            let depth = forest
                .partition_depth(bound.index_space(), region.index_space())
                .ok_or(escaped.clone())?;
            if region.tree() != bound.tree() || depth > functor.depth() {
                return Err(escaped);
            }
        }
        RegionTarget::Partition(bound) => {
            if region.tree() != bound.tree() {
                return Err(escaped);
            }
            let top = forest.partition_parent(bound.index_partition())?;
            let mut cursor = region.index_space();
            let mut depth = 0;
            loop {
                let Some((ip, _)) = forest.index_space_parent(cursor)? else {
                    return Err(escaped);
                };
                depth += 1;
                if ip == bound.index_partition() {
                    break;
                }
                cursor = forest.partition_parent(ip)?;
                if cursor == top {
                    return Err(escaped);
                }
            }
            if depth > functor.depth() + 1 {
                return Err(escaped);
            }
        }
    }
    Ok(region)
}
