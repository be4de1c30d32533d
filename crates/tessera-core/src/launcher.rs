// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Launchers: the argument bundles handed to [`Context`](crate::Context)
//! to issue operations.

use std::collections::BTreeMap;

use bytemuck::Pod;
use bytes::Bytes;

use crate::domain::{DomainPoint, IndexSet};
use crate::future::Future;
use crate::ident::{FieldId, ShardingId, TaskId};
use crate::predicate::Predicate;
use crate::privilege::FieldSet;
use crate::region_tree::LogicalRegion;
use crate::requirement::{OutputRequirement, RegionRequirement};
use crate::sync::{DynamicCollective, Grant, PhaseBarrier};

/// Barriers and collectives an operation synchronizes through.
#[derive(Debug, Clone, Default)]
pub struct Synchronization {
    /// Generations that must trigger before the operation becomes ready.
    pub wait: Vec<PhaseBarrier>,
    /// Barriers arrived at (count 1) when the operation finishes.
    pub arrive: Vec<PhaseBarrier>,
    /// Collectives arrived at with the operation's value.
    pub collectives: Vec<DynamicCollective>,
}

macro_rules! sync_builders {
    ($ty:ty) => {
        impl $ty {
            /// Waits on `barrier`'s generation before becoming ready.
            #[must_use]
            pub fn wait_on(mut self, barrier: PhaseBarrier) -> Self {
                self.sync.wait.push(barrier);
                self
            }

            /// Arrives at `barrier` when finished.
            #[must_use]
            pub fn arrive_at(mut self, barrier: PhaseBarrier) -> Self {
                self.sync.arrive.push(barrier);
                self
            }

            /// Contributes the result to `collective` when finished.
            #[must_use]
            pub fn arrive_collective(mut self, collective: DynamicCollective) -> Self {
                self.sync.collectives.push(collective);
                self
            }

            /// Runs only when `predicate` holds.
            #[must_use]
            pub fn with_predicate(mut self, predicate: Predicate) -> Self {
                self.predicate = predicate;
                self
            }
        }
    };
}

/// Launch of one task.
#[derive(Debug, Clone)]
pub struct TaskLauncher {
    pub(crate) task: TaskId,
    pub(crate) args: Bytes,
    pub(crate) requirements: Vec<RegionRequirement>,
    pub(crate) outputs: Vec<OutputRequirement>,
    pub(crate) futures: Vec<Future>,
    pub(crate) predicate: Predicate,
    pub(crate) sync: Synchronization,
    pub(crate) grant: Grant,
}

impl TaskLauncher {
    /// Launch of `task` with no arguments.
    pub fn new(task: TaskId) -> Self {
        Self {
            task,
            args: Bytes::new(),
            requirements: Vec::new(),
            outputs: Vec::new(),
            futures: Vec::new(),
            predicate: Predicate::True,
            sync: Synchronization::default(),
            grant: Grant::new(),
        }
    }

    /// Raw argument bytes.
    #[must_use]
    pub fn with_args(mut self, args: impl Into<Bytes>) -> Self {
        self.args = args.into();
        self
    }

    /// Plain-old-data arguments.
    #[must_use]
    pub fn with_pod_args<T: Pod>(mut self, args: &T) -> Self {
        self.args = Bytes::copy_from_slice(bytemuck::bytes_of(args));
        self
    }

    /// Adds a region requirement.
    #[must_use]
    pub fn add_requirement(mut self, requirement: RegionRequirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    /// Adds an output requirement.
    #[must_use]
    pub fn add_output(mut self, output: OutputRequirement) -> Self {
        self.outputs.push(output);
        self
    }

    /// Adds a future argument; the task waits for it.
    #[must_use]
    pub fn add_future(mut self, future: Future) -> Self {
        self.futures.push(future);
        self
    }

    /// Locks held while the task runs.
    #[must_use]
    pub fn with_grant(mut self, grant: Grant) -> Self {
        self.grant = grant;
        self
    }

    /// Task launched.
    pub fn task(&self) -> TaskId {
        self.task
    }
}

sync_builders!(TaskLauncher);

/// Launch of one task per point of a domain.
#[derive(Debug, Clone)]
pub struct IndexTaskLauncher {
    pub(crate) task: TaskId,
    pub(crate) domain: IndexSet,
    pub(crate) args: Bytes,
    pub(crate) point_args: BTreeMap<DomainPoint, Bytes>,
    pub(crate) requirements: Vec<RegionRequirement>,
    pub(crate) futures: Vec<Future>,
    pub(crate) predicate: Predicate,
    pub(crate) sync: Synchronization,
    pub(crate) grant: Grant,
    pub(crate) sharding: ShardingId,
    pub(crate) independent_requirements: bool,
}

impl IndexTaskLauncher {
    /// Launch of `task` over every point of `domain`.
    pub fn new(task: TaskId, domain: IndexSet) -> Self {
        Self {
            task,
            domain,
            args: Bytes::new(),
            point_args: BTreeMap::new(),
            requirements: Vec::new(),
            futures: Vec::new(),
            predicate: Predicate::True,
            sync: Synchronization::default(),
            grant: Grant::new(),
            sharding: ShardingId::from_raw(0),
            independent_requirements: false,
        }
    }

    /// Arguments shared by every point.
    #[must_use]
    pub fn with_args(mut self, args: impl Into<Bytes>) -> Self {
        self.args = args.into();
        self
    }

    /// Arguments for one point, replacing the shared ones there.
    #[must_use]
    pub fn with_point_args(mut self, point: DomainPoint, args: impl Into<Bytes>) -> Self {
        self.point_args.insert(point, args.into());
        self
    }

    /// Adds a (usually projected) region requirement.
    #[must_use]
    pub fn add_requirement(mut self, requirement: RegionRequirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    /// Adds a future argument shared by every point.
    #[must_use]
    pub fn add_future(mut self, future: Future) -> Self {
        self.futures.push(future);
        self
    }

    /// Locks held by each point while it runs.
    #[must_use]
    pub fn with_grant(mut self, grant: Grant) -> Self {
        self.grant = grant;
        self
    }

    /// Sharding functor used in replicated contexts.
    #[must_use]
    pub fn with_sharding(mut self, sharding: ShardingId) -> Self {
        self.sharding = sharding;
        self
    }

    /// Asserts the points never interfere, skipping the pairwise check.
    #[must_use]
    pub fn independent_requirements(mut self, independent: bool) -> Self {
        self.independent_requirements = independent;
        self
    }

    /// Launch domain.
    pub fn domain(&self) -> &IndexSet {
        &self.domain
    }

    pub(crate) fn args_for(&self, point: &DomainPoint) -> Bytes {
        self.point_args.get(point).cloned().unwrap_or_else(|| self.args.clone())
    }
}

sync_builders!(IndexTaskLauncher);

/// Copy between fields of two regions.
///
/// Source and destination fields are paired in ascending id order and must
/// have equal sizes. Only points present in both regions are copied. A
/// reduce privilege on the destination folds instead of overwriting.
#[derive(Debug, Clone)]
pub struct CopyLauncher {
    pub(crate) pairs: Vec<(RegionRequirement, RegionRequirement)>,
    pub(crate) predicate: Predicate,
    pub(crate) sync: Synchronization,
}

impl CopyLauncher {
    /// Empty copy.
    pub fn new() -> Self {
        Self {
            pairs: Vec::new(),
            predicate: Predicate::True,
            sync: Synchronization::default(),
        }
    }

    /// Adds a source/destination pair.
    #[must_use]
    pub fn add_copy(mut self, src: RegionRequirement, dst: RegionRequirement) -> Self {
        self.pairs.push((src, dst));
        self
    }
}

impl Default for CopyLauncher {
    fn default() -> Self {
        Self::new()
    }
}

sync_builders!(CopyLauncher);

/// Fill of every point of a region with one value.
#[derive(Debug, Clone)]
pub struct FillLauncher {
    pub(crate) region: LogicalRegion,
    pub(crate) parent: LogicalRegion,
    pub(crate) fields: FieldSet,
    pub(crate) value: Bytes,
    pub(crate) predicate: Predicate,
    pub(crate) sync: Synchronization,
}

impl FillLauncher {
    /// Fill of `region` (privileges derived from `parent`) with `value`.
    pub fn new(region: LogicalRegion, parent: LogicalRegion, value: impl Into<Bytes>) -> Self {
        Self {
            region,
            parent,
            fields: FieldSet::new(),
            value: value.into(),
            predicate: Predicate::True,
            sync: Synchronization::default(),
        }
    }

    /// Fill with a plain-old-data value.
    pub fn with_pod<T: Pod>(region: LogicalRegion, parent: LogicalRegion, value: &T) -> Self {
        Self::new(region, parent, Bytes::copy_from_slice(bytemuck::bytes_of(value)))
    }

    /// Adds a field.
    #[must_use]
    pub fn add_field(mut self, field: FieldId) -> Self {
        self.fields.insert(field);
        self
    }
}

sync_builders!(FillLauncher);

/// Acquire or release of simultaneous-coherence data.
#[derive(Debug, Clone)]
pub struct CoherenceLauncher {
    pub(crate) region: LogicalRegion,
    pub(crate) parent: LogicalRegion,
    pub(crate) fields: FieldSet,
    pub(crate) predicate: Predicate,
    pub(crate) sync: Synchronization,
}

impl CoherenceLauncher {
    /// Sequencing point on `fields` of `region`.
    pub fn new<I: IntoIterator<Item = FieldId>>(region: LogicalRegion, parent: LogicalRegion, fields: I) -> Self {
        Self {
            region,
            parent,
            fields: fields.into_iter().collect(),
            predicate: Predicate::True,
            sync: Synchronization::default(),
        }
    }
}

sync_builders!(CoherenceLauncher);

/// Acquire launcher.
pub type AcquireLauncher = CoherenceLauncher;
/// Release launcher.
pub type ReleaseLauncher = CoherenceLauncher;

/// Tasks that must run at the same time on distinct processors.
#[derive(Debug, Clone, Default)]
pub struct MustEpochLauncher {
    pub(crate) tasks: Vec<TaskLauncher>,
}

impl MustEpochLauncher {
    /// Empty epoch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task.
    #[must_use]
    pub fn add_task(mut self, task: TaskLauncher) -> Self {
        self.tasks.push(task);
        self
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the epoch has no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
