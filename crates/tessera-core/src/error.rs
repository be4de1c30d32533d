// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Error types.
//!
//! Each subsystem owns a narrow enum; [`RuntimeError`] wraps them for the
//! public API and classifies every failure into an [`ErrorClass`].

use thiserror::Error;

use crate::domain::DomainPoint;
use crate::ident::{
    BarrierId, FieldId, FieldSpaceId, IndexPartitionId, IndexSpaceId, OpId, ProcessorId,
    ReductionOpId, RegionTreeId, ReservationId, ShardId, TaskId,
};
use crate::privilege::Privilege;
use crate::region_tree::LogicalRegion;

/// Broad failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The caller violated an API contract (bad handle, missing privilege,
    /// interfering requirements, deadlocking synchronization).
    ApiMisuse,
    /// A bounded resource ran out (mapper attempts, barrier generations).
    ResourceExhaustion,
    /// An operation body failed or produced a poisoned value.
    ExecutionFailure,
    /// Replicated shards disagreed or could not communicate.
    DistributedInconsistency,
}

/// Region forest failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegionTreeError {
    /// Index space handle is unknown or already destroyed.
    #[error("unknown index space {0}")]
    UnknownIndexSpace(IndexSpaceId),
    /// Partition handle is unknown or already destroyed.
    #[error("unknown index partition {0}")]
    UnknownPartition(IndexPartitionId),
    /// Field space handle is unknown or already destroyed.
    #[error("unknown field space {0}")]
    UnknownFieldSpace(FieldSpaceId),
    /// Field is not allocated in the field space.
    #[error("field {field} is not allocated in field space {space}")]
    UnknownField {
        /// Field space searched.
        space: FieldSpaceId,
        /// Missing field.
        field: FieldId,
    },
    /// Region tree handle is unknown or already destroyed.
    #[error("unknown region tree {0}")]
    UnknownRegionTree(RegionTreeId),
    /// Only roots of index-space trees may be destroyed directly.
    #[error("index space {0} is not the root of its tree")]
    NotTopLevel(IndexSpaceId),
    /// Two geometric objects of different dimensionality were combined.
    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch {
        /// Required dimensionality.
        expected: usize,
        /// Supplied dimensionality.
        found: usize,
    },
    /// A color is not in the partition's color space.
    #[error("color {color} is not in the color space of partition {partition}")]
    UnknownColor {
        /// Partition queried.
        partition: IndexPartitionId,
        /// Offending color.
        color: DomainPoint,
    },
    /// An explicit coloring assigned a color outside the color space.
    #[error("color {0} is outside the declared color space")]
    ColorOutOfBounds(DomainPoint),
    /// A subspace is not contained in its parent.
    #[error("subspace for color {0} is not contained in the parent index space")]
    SubspaceNotContained(DomainPoint),
    /// A partition asserted disjoint has overlapping subspaces.
    #[error("partition asserted disjoint but colors {first} and {second} overlap")]
    NotDisjoint {
        /// First overlapping color.
        first: DomainPoint,
        /// Second overlapping color.
        second: DomainPoint,
    },
    /// A partition asserted complete leaves parent points uncovered.
    #[error("partition asserted complete but {missing} parent points are uncovered")]
    NotComplete {
        /// Uncovered point count.
        missing: u64,
    },
    /// A partition does not belong to the region it was paired with.
    #[error("partition {partition} is not a partition of index space {space}")]
    PartitionParentMismatch {
        /// Partition supplied.
        partition: IndexPartitionId,
        /// Index space it was paired with.
        space: IndexSpaceId,
    },
    /// Partition set operations require partitions of one parent.
    #[error("partitions {first} and {second} do not share a parent index space")]
    IncompatiblePartitions {
        /// Left operand.
        first: IndexPartitionId,
        /// Right operand.
        second: IndexPartitionId,
    },
    /// Equal partitions need at least one color.
    #[error("partition requires at least one color")]
    ZeroColors,
    /// More colors than a color space can index.
    #[error("{0} colors exceed the color space")]
    TooManyColors(u64),
    /// A projection functor returned a region outside its upper bound.
    #[error("projection of point {point} escaped its upper bound")]
    ProjectionOutOfBounds {
        /// Launch point being projected.
        point: DomainPoint,
    },
    /// A field-driven partition read a value of the wrong width.
    #[error("field {field} holds {found}-byte values, expected {expected}")]
    FieldSizeMismatch {
        /// Field read.
        field: FieldId,
        /// Required width.
        expected: usize,
        /// Allocated width.
        found: usize,
    },
}

/// Dependence-analysis and privilege failures detected at issue time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    /// The issuing context holds no privilege covering the requirement.
    #[error("requirement {index} requests {privilege:?} on {region} but the context does not hold it on parent {parent}")]
    PrivilegeNotHeld {
        /// Requirement index within the operation.
        index: usize,
        /// Region requested.
        region: LogicalRegion,
        /// Parent named by the requirement.
        parent: LogicalRegion,
        /// Requested privilege.
        privilege: Privilege,
    },
    /// The requirement's region is not a descendant of its named parent.
    #[error("requirement {index}: region {region} is not in the subtree of {parent}")]
    NotInParentSubtree {
        /// Requirement index within the operation.
        index: usize,
        /// Region requested.
        region: LogicalRegion,
        /// Parent named by the requirement.
        parent: LogicalRegion,
    },
    /// A requested field is not covered by the parent privilege.
    #[error("requirement {index}: field {field} is not held by the parent privilege")]
    FieldNotHeld {
        /// Requirement index within the operation.
        index: usize,
        /// Field requested.
        field: FieldId,
    },
    /// A requirement names no fields.
    #[error("requirement {0} names no fields")]
    NoFields(usize),
    /// Two requirements of one operation alias with conflicting privileges.
    #[error("requirements {first} and {second} of one operation interfere")]
    InterferingRequirements {
        /// Lower requirement index.
        first: usize,
        /// Higher requirement index.
        second: usize,
    },
    /// Two points of one index launch interfere on the same requirement.
    #[error("requirement {index}: points {first} and {second} of one index launch interfere")]
    InterferingPoints {
        /// Requirement index.
        index: usize,
        /// First point.
        first: DomainPoint,
        /// Second point.
        second: DomainPoint,
    },
    /// A projection declared complete left a subregion of its partition unreached.
    #[error("requirement {index}: complete projection never reaches color {color}")]
    IncompleteProjection {
        /// Requirement index.
        index: usize,
        /// First color no point projected to.
        color: DomainPoint,
    },
    /// The launch domain is empty.
    #[error("index launch domain is empty")]
    EmptyLaunchDomain,
    /// A non-projected requirement names a partition.
    #[error("requirement {0} must name a region")]
    RegionRequired(usize),
    /// Copy source and destination name different numbers of fields.
    #[error("copy {0}: source and destination field counts differ")]
    CopyFieldMismatch(usize),
    /// Output requirements are only accepted on plain single-task launches
    /// outside replicated contexts.
    #[error("output requirements are not supported in {0}")]
    OutputsUnsupported(&'static str),
}

/// Mapper failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MapperError {
    /// The mapper asks for another attempt.
    #[error("mapper requested remap: {0}")]
    Remap(String),
    /// The mapper cannot map the operation at all.
    #[error("mapper failed: {0}")]
    Fatal(String),
    /// A returned layout violates the requirement's constraints.
    #[error("layout for requirement {0} violates its constraints")]
    InvalidLayout(usize),
    /// The mapper returned the wrong number of layouts.
    #[error("mapper returned {found} layouts for {expected} requirements")]
    LayoutCount {
        /// Requirements on the operation.
        expected: usize,
        /// Layouts returned.
        found: usize,
    },
    /// The mapper selected a processor that does not exist.
    #[error("mapper selected unknown processor {0}")]
    UnknownProcessor(ProcessorId),
    /// Remap attempts exceeded the configured budget.
    #[error("op {op}: mapping failed after {attempts} attempts")]
    AttemptsExhausted {
        /// Operation being mapped.
        op: OpId,
        /// Attempts made.
        attempts: u32,
    },
}

/// Barrier, reservation and must-epoch failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Barrier handle is unknown or destroyed.
    #[error("unknown phase barrier {0}")]
    UnknownBarrier(BarrierId),
    /// Barriers need at least one expected arrival.
    #[error("phase barrier requires at least one expected arrival")]
    ZeroArrivals,
    /// The barrier ran out of generations.
    #[error("phase barrier {barrier} exhausted at generation {generation}")]
    BarrierExhausted {
        /// Barrier.
        barrier: BarrierId,
        /// First generation that cannot be used.
        generation: u32,
    },
    /// More arrivals than the generation still expects.
    #[error("phase barrier {barrier} generation {generation}: {count} arrivals but only {remaining} remaining")]
    OverArrival {
        /// Barrier.
        barrier: BarrierId,
        /// Generation arrived at.
        generation: u32,
        /// Arrivals still expected.
        remaining: u32,
        /// Arrivals attempted.
        count: u32,
    },
    /// The operation would wait on a barrier generation that only it or one
    /// of its predecessors can complete.
    #[error("deadlock: waiting on phase barrier {barrier} generation {generation} that depends on this operation")]
    Deadlock {
        /// Barrier.
        barrier: BarrierId,
        /// Generation.
        generation: u32,
    },
    /// A plain barrier was used where a dynamic collective was expected.
    #[error("phase barrier {0} carries no reduction")]
    NotACollective(BarrierId),
    /// A keyed creation disagrees with the barrier already under that key.
    #[error("keyed phase barrier {barrier} exists with {expected} arrivals per generation; requested {requested} or a different reduction")]
    KeyedBarrierMismatch {
        /// Barrier key.
        barrier: BarrierId,
        /// Arrivals the existing barrier expects.
        expected: u32,
        /// Arrivals requested by the conflicting call.
        requested: u32,
    },
    /// Reservation handle is unknown.
    #[error("unknown reservation {0}")]
    UnknownReservation(ReservationId),
    /// Release of a reservation nobody holds.
    #[error("reservation {0} released while not held")]
    ReleaseWithoutAcquire(ReservationId),
    /// A must-epoch launch has more tasks than processors.
    #[error("must-epoch launch of {tasks} tasks exceeds {processors} processors")]
    MustEpochTooLarge {
        /// Tasks in the epoch.
        tasks: usize,
        /// Processors available.
        processors: usize,
    },
    /// Two must-epoch tasks were assigned the same (or an unknown) processor.
    #[error("must-epoch processor {0} assigned twice or unknown")]
    MustEpochProcessorConflict(ProcessorId),
    /// Two must-epoch tasks have a dependence that would serialize them.
    #[error("must-epoch tasks {first} and {second} depend on each other")]
    MustEpochDependence {
        /// First task index.
        first: usize,
        /// Second task index.
        second: usize,
    },
}

/// Control-replication failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    /// Shards issued different operation streams.
    #[error("shard {shard} diverged at operation sequence {seq}")]
    Divergence {
        /// Sequence number of the divergent operation.
        seq: u64,
        /// Shard whose digest differed from shard 0.
        shard: ShardId,
    },
    /// A functor returned different results for the same input.
    #[error("{kind} functor is impure at point {point}")]
    ImpureFunctor {
        /// `"sharding"` or `"projection"`.
        kind: &'static str,
        /// Input point.
        point: DomainPoint,
    },
    /// A sharding functor returned a shard that does not exist.
    #[error("sharding functor returned shard {shard} of {shards}")]
    ShardOutOfRange {
        /// Returned shard.
        shard: ShardId,
        /// Shard count.
        shards: usize,
    },
    /// Message delivery failed.
    #[error("transport failure: {0}")]
    Transport(String),
    /// A message could not be encoded or decoded.
    #[error("codec failure: {0}")]
    Codec(String),
    /// Unordered reductions need an order-independent operator.
    #[error("reduction {0} is not commutative and cannot be reduced unordered")]
    NonCommutativeUnordered(ReductionOpId),
    /// A shard's top-level function panicked.
    #[error("shard {0} panicked")]
    ShardPanicked(ShardId),
    /// Replication needs at least one shard.
    #[error("replication requires at least one shard")]
    NoShards,
}

/// Failures reading a future.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FutureError {
    /// The producing operation was predicated false.
    #[error("future is empty (producer was predicated false)")]
    Empty,
    /// The producing operation failed.
    #[error("future poisoned: {0}")]
    Poisoned(String),
    /// The stored value has the wrong width for the requested type.
    #[error("future holds {found} bytes, expected {expected}")]
    SizeMismatch {
        /// Requested width.
        expected: usize,
        /// Stored width.
        found: usize,
    },
}

/// Failures accessing a mapped physical region.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessError {
    /// The field was not requested by the mapped requirement.
    #[error("field {0} is not mapped")]
    FieldNotMapped(FieldId),
    /// The access kind is not permitted by the mapped privilege.
    #[error("{access} of field {field} not permitted under {privilege:?}")]
    PrivilegeViolation {
        /// Field accessed.
        field: FieldId,
        /// Mapped privilege.
        privilege: Privilege,
        /// `"read"`, `"write"` or `"reduce"`.
        access: &'static str,
    },
    /// The point is outside the mapped region.
    #[error("point {0} is outside the mapped region")]
    PointOutOfBounds(DomainPoint),
    /// The value width differs from the field size.
    #[error("field {field} holds {expected}-byte values, access used {found}")]
    SizeMismatch {
        /// Field accessed.
        field: FieldId,
        /// Field size.
        expected: usize,
        /// Access width.
        found: usize,
    },
    /// The reduction operator named by the privilege is not registered.
    #[error("unknown reduction operator {0}")]
    UnknownReduction(ReductionOpId),
    /// The inline mapping was already unmapped.
    #[error("physical region is no longer mapped")]
    Unmapped,
}

/// Failure returned from a task body.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Application-level failure.
    #[error("{0}")]
    Failed(String),
    /// Physical-region access failed.
    #[error(transparent)]
    Access(#[from] AccessError),
    /// A future read failed.
    #[error(transparent)]
    Future(#[from] FutureError),
    /// A runtime call made by the task failed.
    #[error(transparent)]
    Runtime(Box<RuntimeError>),
}

impl From<RuntimeError> for TaskError {
    fn from(err: RuntimeError) -> Self {
        Self::Runtime(Box::new(err))
    }
}

/// Umbrella error for the public runtime API.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Region forest failure.
    #[error(transparent)]
    RegionTree(#[from] RegionTreeError),
    /// Privilege or interference failure.
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    /// Mapping failure.
    #[error(transparent)]
    Mapper(#[from] MapperError),
    /// Synchronization failure.
    #[error(transparent)]
    Sync(#[from] SyncError),
    /// Replication failure.
    #[error(transparent)]
    Replication(#[from] ReplicationError),
    /// Future failure.
    #[error(transparent)]
    Future(#[from] FutureError),
    /// Physical access failure.
    #[error(transparent)]
    Access(#[from] AccessError),
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] tessera_config::ConfigError),
    /// No task registered under this id.
    #[error("unknown task {0}")]
    UnknownTask(TaskId),
    /// A task id or name was registered twice.
    #[error("task {id} (`{name}`) is already registered")]
    DuplicateTask {
        /// Task id.
        id: TaskId,
        /// Task name.
        name: &'static str,
    },
    /// A functor or operator id was registered twice.
    #[error("{kind} {id} is already registered")]
    DuplicateRegistration {
        /// Registry kind.
        kind: &'static str,
        /// Raw id.
        id: u32,
    },
    /// A functor or operator id is not registered.
    #[error("{kind} {id} is not registered")]
    UnknownRegistration {
        /// Registry kind.
        kind: &'static str,
        /// Raw id.
        id: u32,
    },
    /// Registration attempted after the first context was created.
    #[error("registrations are closed once the first context exists")]
    RegistrationClosed,
    /// A worker thread could not be started.
    #[error("failed to start worker thread: {0}")]
    WorkerSpawn(String),
    /// An operation body failed.
    #[error("operation {op} failed: {reason}")]
    OperationFailed {
        /// Failed operation.
        op: OpId,
        /// Failure description.
        reason: String,
    },
}

impl RuntimeError {
    /// Classifies the failure.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Mapper(_)
            | Self::WorkerSpawn(_)
            | Self::Sync(SyncError::BarrierExhausted { .. }) => {
                ErrorClass::ResourceExhaustion
            }
            Self::Replication(_) => ErrorClass::DistributedInconsistency,
            Self::Future(_) | Self::OperationFailed { .. } => ErrorClass::ExecutionFailure,
            Self::RegionTree(_)
            | Self::Analysis(_)
            | Self::Sync(_)
            | Self::Access(_)
            | Self::Config(_)
            | Self::UnknownTask(_)
            | Self::DuplicateTask { .. }
            | Self::DuplicateRegistration { .. }
            | Self::UnknownRegistration { .. }
            | Self::RegistrationClosed => ErrorClass::ApiMisuse,
        }
    }
}
