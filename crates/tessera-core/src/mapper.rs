// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Mapper interface.
//!
//! The runtime consults the mapper when an operation becomes ready: once to
//! pick a processor and once per attempt to choose instance layouts. A
//! mapper may ask for another attempt with [`MapperError::Remap`]; the
//! runtime retries up to the configured budget.

use crate::domain::DomainPoint;
use crate::error::MapperError;
use crate::ident::{OpId, ProcessorId, TaskId};
use crate::op::OpKind;
use crate::privilege::{FieldSet, Privilege};
use crate::region_tree::LogicalRegion;
use crate::requirement::{InstanceLayout, LayoutConstraintSet};

/// One concrete region requirement as the mapper sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappableRegion {
    /// Region to map.
    pub region: LogicalRegion,
    /// Fields to map.
    pub fields: FieldSet,
    /// Privilege requested.
    pub privilege: Privilege,
    /// Constraints the layout must satisfy.
    pub constraints: LayoutConstraintSet,
}

/// An operation (or one point of an index launch) awaiting mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappableInfo {
    /// Operation being mapped.
    pub op: OpId,
    /// Operation kind.
    pub kind: OpKind,
    /// Task, for task operations.
    pub task: Option<TaskId>,
    /// Launch point, for index launches.
    pub point: Option<DomainPoint>,
    /// Concrete requirements in declaration order.
    pub regions: Vec<MappableRegion>,
}

/// Policy object choosing processors and instance layouts.
pub trait Mapper: Send + Sync {
    /// Processor to run on, given the current per-processor load.
    fn select_processor(&self, info: &MappableInfo, load: &[usize]) -> ProcessorId;

    /// One layout per requirement. `attempt` counts from zero.
    fn map_operation(&self, info: &MappableInfo, attempt: u32) -> Result<Vec<InstanceLayout>, MapperError>;

    /// Distinct processors for the tasks of a must-epoch launch.
    fn select_must_epoch_processors(
        &self,
        tasks: &[MappableInfo],
        processors: usize,
    ) -> Result<Vec<ProcessorId>, MapperError>;
}

/// Least-loaded processor, least-constrained layouts.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMapper;

impl Mapper for DefaultMapper {
    fn select_processor(&self, _info: &MappableInfo, load: &[usize]) -> ProcessorId {
        let best = load
            .iter()
            .enumerate()
            .min_by_key(|(i, l)| (**l, *i))
            .map_or(0, |(i, _)| i);
        ProcessorId::from_raw(best as u32)
    }

    fn map_operation(&self, info: &MappableInfo, _attempt: u32) -> Result<Vec<InstanceLayout>, MapperError> {
        Ok(info
            .regions
            .iter()
            .map(|r| InstanceLayout::default_for(&r.constraints, &r.fields))
            .collect())
    }

    fn select_must_epoch_processors(
        &self,
        tasks: &[MappableInfo],
        processors: usize,
    ) -> Result<Vec<ProcessorId>, MapperError> {
        if tasks.len() > processors {
            return Err(MapperError::Fatal(format!(
                "{} must-epoch tasks but only {processors} processors",
                tasks.len()
            )));
        }
        Ok((0..tasks.len()).map(|i| ProcessorId::from_raw(i as u32)).collect())
    }
}

/// Checks a mapper's layouts against the operation's requirements.
pub(crate) fn validate_layouts(info: &MappableInfo, layouts: &[InstanceLayout]) -> Result<(), MapperError> {
    if layouts.len() != info.regions.len() {
        return Err(MapperError::LayoutCount {
            expected: info.regions.len(),
            found: layouts.len(),
        });
    }
    for (i, (layout, req)) in layouts.iter().zip(&info.regions).enumerate() {
        if !layout.satisfies(&req.constraints, &req.fields) {
            return Err(MapperError::InvalidLayout(i));
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::domain::IndexSet;
    use crate::ident::FieldId;
    use crate::region_tree::RegionForest;
    use crate::requirement::FieldLayout;

    fn info() -> MappableInfo {
        let mut forest = RegionForest::new(true);
        let is = forest.create_index_space(IndexSet::range(0, 3));
        let fs = forest.create_field_space();
        let region = forest.create_logical_region(is, fs).unwrap();
        MappableInfo {
            op: OpId::from_raw(1),
            kind: OpKind::Task,
            task: Some(TaskId::from_raw(1)),
            point: None,
            regions: vec![MappableRegion {
                region,
                fields: [FieldId::from_raw(1)].into_iter().collect(),
                privilege: Privilege::ReadWrite,
                constraints: LayoutConstraintSet {
                    layout: Some(FieldLayout::ArrayOfStructs),
                    ..LayoutConstraintSet::default()
                },
            }],
        }
    }

    #[test]
    fn default_mapper_picks_least_loaded_lowest_index() {
        let m = DefaultMapper;
        assert_eq!(m.select_processor(&info(), &[3, 1, 1]), ProcessorId::from_raw(1));
        assert_eq!(m.select_processor(&info(), &[]), ProcessorId::from_raw(0));
    }

    #[test]
    fn default_layouts_validate() {
        let info = info();
        let layouts = DefaultMapper.map_operation(&info, 0).unwrap();
        validate_layouts(&info, &layouts).unwrap();
        assert_eq!(validate_layouts(&info, &[]), Err(MapperError::LayoutCount { expected: 1, found: 0 }));
        let wrong = vec![InstanceLayout::default_for(&LayoutConstraintSet::default(), &info.regions[0].fields)];
        assert_eq!(validate_layouts(&info, &wrong), Err(MapperError::InvalidLayout(0)));
    }

    #[test]
    fn must_epoch_processors_are_distinct() {
        let tasks = vec![info(), info()];
        let procs = DefaultMapper.select_must_epoch_processors(&tasks, 2).unwrap();
        assert_eq!(procs, vec![ProcessorId::from_raw(0), ProcessorId::from_raw(1)]);
        assert!(DefaultMapper.select_must_epoch_processors(&tasks, 1).is_err());
    }
}
