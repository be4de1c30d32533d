// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! tessera-core: logical-region dependence analysis and deferred task execution.
//!
//! Programs describe data as logical regions (an index space crossed with a
//! field space) and issue operations against them through a [`Context`]:
//! task launches, index launches, copies, fills, inline mappings, fences and
//! coherence markers. Each operation names the regions, fields and
//! privileges it needs; the runtime derives the dependences between
//! operations from those requirements and runs them as soon as their
//! preconditions are satisfied, in any order consistent with program order.
//!
//! The same program can run control-replicated through
//! [`Runtime::replicate`]: every shard analyses the full operation stream
//! and executes only the points it owns.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]

mod analyzer;
mod context;
/// Points, rectangles, index sets and transforms.
pub mod domain;
mod error;
mod event;
mod future;
mod ident;
mod instance;
mod launcher;
mod mapper;
mod op;
mod pipeline;
mod predicate;
mod privilege;
mod projection;
mod reduction;
/// Index spaces, partitions, field spaces and region trees.
pub mod region_tree;
/// Control replication: sharding, transports and collectives.
pub mod replication;
mod requirement;
mod runtime;
mod serdez;
/// Phase barriers, dynamic collectives and reservations.
pub mod sync;
mod task;
mod telemetry;
mod worker;

pub use context::Context;
pub use domain::{DomainPoint, IndexSet, Rect, Transform, MAX_DIM};
pub use error::{
    AccessError, AnalysisError, ErrorClass, FutureError, MapperError, RegionTreeError,
    ReplicationError, RuntimeError, SyncError, TaskError,
};
pub use event::{Event, UserEvent};
pub use future::{Future, FutureMap};
pub use ident::{
    BarrierId, ContextId, FieldId, FieldSpaceId, IndexPartitionId, IndexSpaceId, OpId,
    ProcessorId, ProjectionId, ReductionOpId, RegionTreeId, ReservationId, SerdezId, ShardId,
    ShardingId, TaskId,
};
pub use instance::{FieldInstance, InstanceStore, PhysicalRegion};
pub use launcher::{
    AcquireLauncher, CoherenceLauncher, CopyLauncher, FillLauncher, IndexTaskLauncher,
    MustEpochLauncher, ReleaseLauncher, Synchronization, TaskLauncher,
};
pub use mapper::{DefaultMapper, MappableInfo, MappableRegion, Mapper};
pub use op::{OpKind, OpState};
pub use predicate::Predicate;
pub use privilege::{dependence_type, Coherence, DependenceType, FieldSet, Privilege, RegionUsage};
pub use projection::{project_point, IdentityProjection, ProjectionFunctor, ProjectionRegistry};
pub use reduction::{ReduceOp, ReductionOp, ReductionRegistry};
pub use region_tree::partition::{Coloring, SetOp};
pub use region_tree::{
    Completeness, Disjointness, FieldInfo, LogicalPartition, LogicalRegion, PartitionKind,
    RegionForest,
};
pub use replication::sharding::ShardingFunctor;
pub use replication::{BlockSharding, ModuloSharding, ReduceMode, ShardingRegistry};
pub use requirement::{
    FieldLayout, InstanceLayout, LayoutConstraintSet, MemoryKind, OutputRequirement,
    RegionRequirement, RegionTarget,
};
pub use runtime::Runtime;
pub use serdez::{SerdezOp, SerdezRegistry};
pub use sync::{DynamicCollective, Grant, LockMode, PhaseBarrier, Reservation};
pub use task::{OutputBuffer, OutputRegion, TaskBody, TaskContext, TaskValue};
pub use telemetry::ContextStats;
pub use tessera_config::RuntimeConfig;
