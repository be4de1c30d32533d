// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! The operation pipeline.
//!
//! Every launch goes through the same stages: requirements are validated and
//! made concrete, dependence analysis registers the operation and yields its
//! precondition, and a subscription on that precondition drives the rest
//! (predicate resolution, mapping, dispatch, execution, completion). Nothing
//! after registration blocks the issuing thread, except inline mappings and
//! dependent partitions, whose results the caller needs immediately.
//!
//! Locks are taken in a fixed order: forest, then analyzer, then operation
//! table. The forest lock is never held across analysis.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};

use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::analyzer::{Access, Analysis};
use crate::context::{Context, HeldPrivilege};
use crate::domain::{DomainPoint, IndexSet};
use crate::error::{
    AccessError, AnalysisError, MapperError, RegionTreeError, ReplicationError, RuntimeError, SyncError,
};
use crate::event::{Event, UserEvent};
use crate::future::{Future, FutureMap, FutureSetter};
use crate::ident::{FieldId, IndexPartitionId, IndexSpaceId, OpId, ProcessorId, ReductionOpId, ShardId, TaskId};
use crate::instance::{InstanceSnapshot, PhysicalRegion};
use crate::launcher::{
    AcquireLauncher, CoherenceLauncher, CopyLauncher, FillLauncher, IndexTaskLauncher, MustEpochLauncher,
    ReleaseLauncher, Synchronization, TaskLauncher,
};
use crate::mapper::{validate_layouts, MappableInfo, MappableRegion};
use crate::op::{BarrierGen, OpKind, OpRecord, OpState};
use crate::predicate::Predicate;
use crate::privilege::{Coherence, FieldSet, Privilege, RegionUsage};
use crate::projection::project_point;
use crate::region_tree::{LogicalPartition, LogicalRegion, PartitionKind, RegionForest};
use crate::replication::launch_digest;
use crate::replication::transport::PointValue;
use crate::requirement::{InstanceLayout, LayoutConstraintSet, OutputRequirement, RegionRequirement, RegionTarget};
use crate::sync::{must_epoch, Grant};
use crate::task::{OutputBuffer, OutputRegion, TaskContext};
use crate::{telemetry, worker};

/// A requirement resolved to one region.
#[derive(Debug, Clone)]
pub(crate) struct Concrete {
    index: usize,
    region: LogicalRegion,
    domain: IndexSet,
    fields: FieldSet,
    privilege: Privilege,
    usage: RegionUsage,
    constraints: LayoutConstraintSet,
}

impl Concrete {
    fn new(
        forest: &RegionForest,
        index: usize,
        region: LogicalRegion,
        req: &RegionRequirement,
    ) -> Result<Self, RegionTreeError> {
        Ok(Self {
            index,
            region,
            domain: forest.region_domain(&region)?.clone(),
            fields: req.fields.clone(),
            privilege: req.privilege,
            usage: req.usage(),
            constraints: req.constraints.clone(),
        })
    }

    fn access(&self) -> Access<'_> {
        Access {
            tree: self.region.tree(),
            node: self.region.index_space(),
            domain: &self.domain,
            fields: &self.fields,
            usage: self.usage,
        }
    }

    fn mappable(&self) -> MappableRegion {
        MappableRegion {
            region: self.region,
            fields: self.fields.clone(),
            privilege: self.privilege,
            constraints: self.constraints.clone(),
        }
    }

    fn held(&self) -> HeldPrivilege {
        HeldPrivilege {
            region: self.region,
            fields: self.fields.clone(),
            privilege: self.privilege,
        }
    }
}

/// Region handles of one launch point, as hashed into launch digests.
fn encode_regions(concretes: &[Concrete]) -> Vec<u8> {
    let mut out = Vec::with_capacity(concretes.len() * 8);
    for c in concretes {
        out.extend_from_slice(&c.region.tree().value().to_le_bytes());
        out.extend_from_slice(&c.region.index_space().value().to_le_bytes());
    }
    out
}

fn mappable_info(
    op: OpId,
    kind: OpKind,
    task: Option<TaskId>,
    point: Option<DomainPoint>,
    concretes: &[Concrete],
) -> MappableInfo {
    MappableInfo {
        op,
        kind,
        task,
        point,
        regions: concretes.iter().map(Concrete::mappable).collect(),
    }
}

/// A registered operation.
#[derive(Debug, Clone)]
pub(crate) struct Issued {
    op: OpId,
    seq: u64,
    kind: OpKind,
    completion: UserEvent,
    precondition: Event,
}

/// An inline mapping held by its context until unmapped.
#[derive(Debug)]
pub(crate) struct InlineMapping {
    pub(crate) issued: Issued,
    pub(crate) region: PhysicalRegion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Run,
    Skip,
    Poisoned,
}

#[derive(Debug, Clone)]
enum Outcome {
    Value(Bytes),
    Empty,
    Failed(String),
}

impl Outcome {
    fn point_value(&self) -> PointValue {
        match self {
            Self::Value(v) => PointValue::Value(v.to_vec()),
            Self::Empty => PointValue::Empty,
            Self::Failed(reason) => PointValue::Failed(reason.clone()),
        }
    }

    const fn state(&self) -> OpState {
        match self {
            Self::Value(_) => OpState::Completed,
            Self::Empty => OpState::ResolvedFalse,
            Self::Failed(_) => OpState::Failed,
        }
    }
}

const POISONED: &str = "precondition poisoned";

/// How a non-task operation runs on this shard.
#[derive(Debug)]
enum Role {
    /// Run the body here.
    Run { arrive: bool, announce: bool },
    /// Another shard runs it; finish when its announcement arrives.
    Mirror(Event),
}

#[derive(Debug)]
struct PendingOutput {
    buffer: OutputBuffer,
    region: OutputRegion,
}

/// One task body to run: a single task, one index point or one member of a
/// must-epoch launch.
#[derive(Debug)]
struct PointWork {
    /// Key under which replicated peers learn the result.
    key: DomainPoint,
    point: Option<DomainPoint>,
    task: TaskId,
    args: Bytes,
    futures: Vec<Future>,
    regions: Vec<Concrete>,
    outputs: Vec<PendingOutput>,
    setter: FutureSetter,
    processor: Option<ProcessorId>,
    sync: Synchronization,
    grant: Grant,
}

#[derive(Debug)]
struct TaskRun {
    domain: Option<IndexSet>,
    points: Vec<PointWork>,
    remote: Vec<Event>,
}

/// Counts down the local points of a task operation and finishes it once
/// they and every remote point are done.
struct RunTracker {
    ctx: Context,
    issued: Issued,
    remaining: AtomicUsize,
    failed: AtomicBool,
    skipped: AtomicBool,
    remote: Event,
}

impl RunTracker {
    fn point_done(&self, outcome: &Outcome) {
        match outcome {
            Outcome::Failed(_) => self.failed.store(true, Ordering::SeqCst),
            Outcome::Empty => self.skipped.store(true, Ordering::SeqCst),
            Outcome::Value(_) => {}
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.complete();
        }
    }

    fn complete(&self) {
        let ctx = self.ctx.clone();
        let issued = self.issued.clone();
        let failed = self.failed.load(Ordering::SeqCst);
        let skipped = self.skipped.load(Ordering::SeqCst);
        self.remote.subscribe(move |poisoned| {
            let state = if failed || poisoned {
                OpState::Failed
            } else if skipped {
                OpState::ResolvedFalse
            } else {
                OpState::Completed
            };
            ctx.finish(&issued, state);
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "task panicked".to_owned())
}

/// Fails unless some point of the launch projected requirement `index` to every color of `partition`.
fn check_complete(
    forest: &RegionForest,
    index: usize,
    partition: LogicalPartition,
    per_point: &[Vec<Concrete>],
) -> Result<(), RuntimeError> {
    let reached: BTreeSet<IndexSpaceId> = per_point
        .iter()
        .filter_map(|concretes| concretes.get(index))
        .map(|c| c.region.index_space())
        .collect();
    for color in forest.color_space(partition.index_partition())?.points() {
        if !reached.contains(&forest.subspace(partition.index_partition(), &color)?) {
            return Err(AnalysisError::IncompleteProjection { index, color }.into());
        }
    }
    Ok(())
}

impl Context {
    // ── launches ────────────────────────────────────────────────────────

    /// Launches a single task; the future binds to its return value.
    pub fn execute_task(&self, launcher: TaskLauncher) -> Result<Future, RuntimeError> {
        self.execute_task_with_outputs(launcher).map(|(future, _)| future)
    }

    /// Launches a single task with output requirements. Each returned
    /// [`OutputRegion`] resolves to a fresh region holding the points the
    /// task wrote.
    pub fn execute_task_with_outputs(
        &self,
        launcher: TaskLauncher,
    ) -> Result<(Future, Vec<OutputRegion>), RuntimeError> {
        if self.shard_state().is_some() && !launcher.outputs.is_empty() {
            return Err(AnalysisError::OutputsUnsupported("replicated contexts").into());
        }
        self.rt.sealed().tasks.get(launcher.task)?;
        let op = self.rt.next_op();
        let concretes = self.concretize(op, &launcher.requirements)?;
        let buffers = self.output_buffers(&launcher.outputs)?;
        let accesses: Vec<Access<'_>> = concretes.iter().map(Concrete::access).collect();
        let extra = launcher.futures.iter().map(Future::event).collect();
        let issued = self.register(op, OpKind::Task, &accesses, &launcher.sync, extra)?;

        let key = DomainPoint::origin(1);
        let origin = ShardId::from_raw(0);
        let encoded = encode_regions(&concretes);
        self.publish_digest(&issued, [(&key, origin, encoded.as_slice())]);

        let regions: Vec<OutputRegion> = buffers.iter().map(|_| OutputRegion::pending()).collect();
        let mut run = TaskRun {
            domain: None,
            points: Vec::new(),
            remote: Vec::new(),
        };
        let future = match self.shard_state().filter(|s| s.shard() != origin) {
            Some(shard) => {
                let future = shard.expect_remote(issued.seq, key, op);
                run.remote.push(future.event());
                future
            }
            None => {
                let (future, setter) = Future::pending(Some(op));
                run.points.push(PointWork {
                    key,
                    point: None,
                    task: launcher.task,
                    args: launcher.args,
                    futures: launcher.futures,
                    regions: concretes,
                    outputs: buffers
                        .into_iter()
                        .zip(&regions)
                        .map(|(buffer, region)| PendingOutput {
                            buffer,
                            region: region.clone(),
                        })
                        .collect(),
                    setter,
                    processor: None,
                    sync: launcher.sync,
                    grant: launcher.grant,
                });
                future
            }
        };
        self.spawn_run(issued, run, launcher.predicate);
        Ok((future, regions))
    }

    /// Launches one task per point of the launcher's domain.
    ///
    /// Requirements naming a partition are projected per point. Points whose
    /// requirements interfere are rejected unless the launcher asserts
    /// independence or the projection is injective onto a disjoint
    /// partition. In a replicated context each point runs on the shard its
    /// sharding functor names.
    pub fn execute_index_space(&self, launcher: IndexTaskLauncher) -> Result<FutureMap, RuntimeError> {
        if launcher.domain.is_empty() {
            return Err(AnalysisError::EmptyLaunchDomain.into());
        }
        let sealed = self.rt.sealed();
        sealed.tasks.get(launcher.task)?;
        let op = self.rt.next_op();
        let points: Vec<DomainPoint> = launcher.domain.points().collect();
        let per_point = self.project_launch(op, &launcher, &points)?;
        let owners: Vec<ShardId> = match self.shard_state() {
            Some(shard) => {
                let functor = sealed.shardings.get(launcher.sharding)?;
                points
                    .iter()
                    .map(|p| shard.owner(functor.as_ref(), p, &launcher.domain))
                    .collect::<Result<_, _>>()?
            }
            None => vec![ShardId::from_raw(0); points.len()],
        };
        let accesses: Vec<Access<'_>> = per_point.iter().flatten().map(Concrete::access).collect();
        let extra = launcher.futures.iter().map(Future::event).collect();
        let issued = self.register(op, OpKind::IndexTask, &accesses, &launcher.sync, extra)?;

        if self.shard_state().is_some() {
            let encoded: Vec<Vec<u8>> = per_point.iter().map(|c| encode_regions(c)).collect();
            self.publish_digest(
                &issued,
                points
                    .iter()
                    .zip(&owners)
                    .zip(&encoded)
                    .map(|((p, owner), e)| (p, *owner, e.as_slice())),
            );
        }

        let me = self.shard();
        let mut futures = BTreeMap::new();
        let mut owned = BTreeSet::new();
        let mut run = TaskRun {
            domain: Some(launcher.domain.clone()),
            points: Vec::new(),
            remote: Vec::new(),
        };
        for ((point, owner), regions) in points.iter().zip(&owners).zip(per_point) {
            match (self.shard_state(), me) {
                (Some(shard), Some(me)) if me != *owner => {
                    let future = shard.expect_remote(issued.seq, *point, op);
                    run.remote.push(future.event());
                    futures.insert(*point, future);
                }
                _ => {
                    let (future, setter) = Future::pending(Some(op));
                    futures.insert(*point, future);
                    owned.insert(*point);
                    run.points.push(PointWork {
                        key: *point,
                        point: Some(*point),
                        task: launcher.task,
                        args: launcher.args_for(point),
                        futures: launcher.futures.clone(),
                        regions,
                        outputs: Vec::new(),
                        setter,
                        processor: None,
                        sync: launcher.sync.clone(),
                        grant: launcher.grant.clone(),
                    });
                }
            }
        }
        let mut map = FutureMap::new(launcher.domain.clone(), futures);
        if self.shard_state().is_some() {
            map = map.with_owned(owned);
        }
        self.spawn_run(issued, run, launcher.predicate);
        Ok(map)
    }

    /// Copies field data between region pairs. The returned event triggers
    /// once the copy is done.
    pub fn issue_copy(&self, launcher: CopyLauncher) -> Result<Event, RuntimeError> {
        let op = self.rt.next_op();
        let reqs: Vec<RegionRequirement> = launcher
            .pairs
            .iter()
            .flat_map(|(src, dst)| [src.clone(), dst.clone()])
            .collect();
        let concretes = self.concretize(op, &reqs)?;
        {
            let forest = self.read_forest();
            for (i, pair) in concretes.chunks(2).enumerate() {
                let [src, dst] = pair else { continue };
                if src.fields.len() != dst.fields.len() {
                    return Err(AnalysisError::CopyFieldMismatch(i).into());
                }
                for (sf, df) in src.fields.iter().zip(&dst.fields) {
                    let from = forest.field_info(src.region.field_space(), *sf)?.size;
                    let to = forest.field_info(dst.region.field_space(), *df)?.size;
                    if from != to {
                        return Err(RegionTreeError::FieldSizeMismatch {
                            field: *df,
                            expected: from,
                            found: to,
                        }
                        .into());
                    }
                }
            }
        }
        let accesses: Vec<Access<'_>> = concretes.iter().map(Concrete::access).collect();
        let issued = self.register(op, OpKind::Copy, &accesses, &launcher.sync, Vec::new())?;
        let event = issued.completion.event();
        let info = mappable_info(op, OpKind::Copy, None, None, &concretes);
        let role = self.origin_role(&issued);
        self.run_deferred(issued, launcher.predicate, launcher.sync, info, role, move |ctx| {
            ctx.copy_body(&concretes)
        });
        Ok(event)
    }

    /// Writes one value into every point of the launcher's fields.
    pub fn fill_fields(&self, launcher: FillLauncher) -> Result<Event, RuntimeError> {
        let op = self.rt.next_op();
        let req = RegionRequirement::region(
            launcher.region,
            Privilege::WriteDiscard,
            Coherence::Exclusive,
            launcher.parent,
        )
        .with_fields(launcher.fields.iter().copied());
        let concretes = self.concretize(op, std::slice::from_ref(&req))?;
        {
            let forest = self.read_forest();
            for field in &req.fields {
                let size = forest.field_info(launcher.region.field_space(), *field)?.size;
                if size != launcher.value.len() {
                    return Err(RegionTreeError::FieldSizeMismatch {
                        field: *field,
                        expected: size,
                        found: launcher.value.len(),
                    }
                    .into());
                }
            }
        }
        let accesses: Vec<Access<'_>> = concretes.iter().map(Concrete::access).collect();
        let issued = self.register(op, OpKind::Fill, &accesses, &launcher.sync, Vec::new())?;
        let event = issued.completion.event();
        let info = mappable_info(op, OpKind::Fill, None, None, &concretes);
        let role = self.origin_role(&issued);
        let value = launcher.value;
        self.run_deferred(issued, launcher.predicate, launcher.sync, info, role, move |ctx| {
            concretes.iter().try_for_each(|c| ctx.fill_body(c, &value))
        });
        Ok(event)
    }

    /// Acquire of simultaneous-coherence data: orders after every prior
    /// user of the fields, whatever their coherence.
    pub fn issue_acquire(&self, launcher: AcquireLauncher) -> Result<Event, RuntimeError> {
        self.coherence_op(OpKind::Acquire, launcher)
    }

    /// Release of simultaneous-coherence data: every later user orders
    /// after it.
    pub fn issue_release(&self, launcher: ReleaseLauncher) -> Result<Event, RuntimeError> {
        self.coherence_op(OpKind::Release, launcher)
    }

    fn coherence_op(&self, kind: OpKind, launcher: CoherenceLauncher) -> Result<Event, RuntimeError> {
        let op = self.rt.next_op();
        let req = RegionRequirement::region(
            launcher.region,
            Privilege::NoAccess,
            Coherence::Simultaneous,
            launcher.parent,
        )
        .with_fields(launcher.fields.iter().copied());
        let concretes = self.concretize(op, std::slice::from_ref(&req))?;
        let accesses: Vec<Access<'_>> = concretes
            .iter()
            .map(|c| Access {
                usage: RegionUsage::fence(),
                ..c.access()
            })
            .collect();
        let issued = self.register(op, kind, &accesses, &launcher.sync, Vec::new())?;
        let event = issued.completion.event();
        let info = mappable_info(op, kind, None, None, &concretes);
        let role = Role::Run {
            arrive: self.is_origin_shard(),
            announce: false,
        };
        self.run_deferred(issued, launcher.predicate, launcher.sync, info, role, |_| Ok(()));
        Ok(event)
    }

    /// Launches tasks that must run at the same time on distinct
    /// processors. Their requirements must not interfere.
    ///
    /// The returned map is keyed by launch order (`p1(0)`, `p1(1)`, ...).
    pub fn execute_must_epoch(&self, launcher: MustEpochLauncher) -> Result<FutureMap, RuntimeError> {
        if launcher.is_empty() {
            return Err(AnalysisError::EmptyLaunchDomain.into());
        }
        if launcher.tasks.iter().any(|t| !t.outputs.is_empty()) {
            return Err(AnalysisError::OutputsUnsupported("must-epoch launches").into());
        }
        let sealed = self.rt.sealed();
        let op = self.rt.next_op();
        let mut per_task = Vec::with_capacity(launcher.len());
        for task in &launcher.tasks {
            sealed.tasks.get(task.task)?;
            per_task.push(self.concretize(op, &task.requirements)?);
        }
        {
            let accesses: Vec<Vec<Access<'_>>> = per_task
                .iter()
                .map(|c| c.iter().map(Concrete::access).collect())
                .collect();
            must_epoch::verify_independence(&accesses, self.commutative())?;
        }
        let keys: Vec<DomainPoint> = (0..launcher.len())
            .map(|i| DomainPoint::p1(i64::try_from(i).unwrap_or(i64::MAX)))
            .collect();
        let infos: Vec<MappableInfo> = per_task
            .iter()
            .zip(&launcher.tasks)
            .zip(&keys)
            .map(|((c, t), k)| mappable_info(op, OpKind::MustEpoch, Some(t.task), Some(*k), c))
            .collect();
        let processors = self.rt.pool.processors();
        let assigned = self
            .rt
            .mapper
            .select_must_epoch_processors(&infos, processors)?;
        if assigned.len() != launcher.len() {
            return Err(MapperError::Fatal(format!(
                "mapper assigned {} processors to {} must-epoch tasks",
                assigned.len(),
                launcher.len()
            ))
            .into());
        }
        must_epoch::verify_processors(&assigned, processors)?;

        let mut sync = Synchronization::default();
        let mut extra = Vec::new();
        let mut predicate = Predicate::True;
        for task in &launcher.tasks {
            sync.wait.extend(task.sync.wait.iter().copied());
            sync.arrive.extend(task.sync.arrive.iter().copied());
            sync.collectives.extend(task.sync.collectives.iter().copied());
            extra.extend(task.futures.iter().map(Future::event));
            predicate = if predicate.is_true() {
                task.predicate.clone()
            } else {
                predicate.and(task.predicate.clone())
            };
        }
        let accesses: Vec<Access<'_>> = per_task.iter().flatten().map(Concrete::access).collect();
        let issued = self.register(op, OpKind::MustEpoch, &accesses, &sync, extra)?;

        let origin = ShardId::from_raw(0);
        if self.shard_state().is_some() {
            let encoded: Vec<Vec<u8>> = per_task.iter().map(|c| encode_regions(c)).collect();
            self.publish_digest(&issued, keys.iter().zip(&encoded).map(|(k, e)| (k, origin, e.as_slice())));
        }

        let domain = IndexSet::from_points(1, keys.iter().copied());
        let local = self.is_origin_shard();
        let mut futures = BTreeMap::new();
        let mut run = TaskRun {
            domain: Some(domain.clone()),
            points: Vec::new(),
            remote: Vec::new(),
        };
        let members = launcher.tasks.into_iter().zip(per_task).zip(assigned).zip(&keys);
        for (((task, regions), processor), key) in members {
            match self.shard_state().filter(|_| !local) {
                Some(shard) => {
                    let future = shard.expect_remote(issued.seq, *key, op);
                    run.remote.push(future.event());
                    futures.insert(*key, future);
                }
                None => {
                    let (future, setter) = Future::pending(Some(op));
                    futures.insert(*key, future);
                    run.points.push(PointWork {
                        key: *key,
                        point: Some(*key),
                        task: task.task,
                        args: task.args,
                        futures: task.futures,
                        regions,
                        outputs: Vec::new(),
                        setter,
                        processor: Some(processor),
                        sync: task.sync,
                        grant: task.grant,
                    });
                }
            }
        }
        let mut map = FutureMap::new(domain, futures);
        if self.shard_state().is_some() {
            let owned = if local { keys.iter().copied().collect() } else { BTreeSet::new() };
            map = map.with_owned(owned);
        }
        tracing::debug!(op = op.value(), tasks = keys.len(), "must-epoch launched");
        self.spawn_run(issued, run, predicate);
        Ok(map)
    }

    /// Execution fence: every later operation waits for every earlier one.
    /// The returned future binds (to no bytes) once the fence passes.
    pub fn execute_fence(&self) -> Result<Future, RuntimeError> {
        let op = self.rt.next_op();
        let prior = self
            .state
            .ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending_events();
        let issued = self.register(op, OpKind::Fence, &[], &Synchronization::default(), prior)?;
        *self.state.fence.lock().unwrap_or_else(PoisonError::into_inner) = issued.completion.event();
        let (future, setter) = Future::pending(Some(op));
        let ctx = self.clone();
        let done = issued.clone();
        // A fence passes even when earlier operations failed.
        self.when_ready(&issued, Predicate::True, move |_| {
            setter.set(Bytes::new());
            ctx.finish(&done, OpState::Completed);
        });
        Ok(future)
    }

    // ── inline mappings ─────────────────────────────────────────────────

    /// Maps a region into the issuing context, blocking until every prior
    /// conflicting operation is done. Later conflicting operations wait for
    /// [`unmap_region`](Self::unmap_region).
    pub fn map_region(&self, requirement: RegionRequirement) -> Result<PhysicalRegion, RuntimeError> {
        let op = self.rt.next_op();
        let concretes = self.concretize(op, std::slice::from_ref(&requirement))?;
        let accesses: Vec<Access<'_>> = concretes.iter().map(Concrete::access).collect();
        let issued = self.register(
            op,
            OpKind::InlineMapping,
            &accesses,
            &Synchronization::default(),
            Vec::new(),
        )?;
        if issued.precondition.wait() {
            self.finish(&issued, OpState::Failed);
            return Err(RuntimeError::OperationFailed {
                op,
                reason: POISONED.to_owned(),
            });
        }
        self.transition(op, OpState::Ready);
        let info = mappable_info(op, OpKind::InlineMapping, None, None, &concretes);
        let here = worker::current_processor().unwrap_or(ProcessorId::from_raw(0));
        let mapped = self
            .select_and_map(&info, Some(here))
            .and_then(|(_, layouts)| self.physical_regions(&concretes, layouts))
            .and_then(|regions| {
                regions.into_iter().next().ok_or_else(|| RuntimeError::OperationFailed {
                    op,
                    reason: "no region mapped".to_owned(),
                })
            });
        let region = match mapped {
            Ok(region) => region,
            Err(err) => {
                self.finish(&issued, OpState::Failed);
                return Err(err);
            }
        };
        self.transition(op, OpState::Mapped);
        self.transition(op, OpState::Executing);
        self.state
            .inline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(InlineMapping {
                issued,
                region: region.clone(),
            });
        Ok(region)
    }

    /// Releases an inline mapping.
    pub fn unmap_region(&self, region: &PhysicalRegion) -> Result<(), RuntimeError> {
        let mapping = {
            let mut inline = self.state.inline.lock().unwrap_or_else(PoisonError::into_inner);
            let pos = inline
                .iter()
                .position(|m| m.region.is_same_mapping(region))
                .ok_or(AccessError::Unmapped)?;
            inline.remove(pos)
        };
        mapping.region.unmap();
        self.finish(&mapping.issued, OpState::Completed);
        Ok(())
    }

    // ── dependent partitioning ──────────────────────────────────────────

    /// Partitions `region` by the color stored in `field` at each point.
    /// The field holds one little-endian `i64` per color dimension.
    pub fn partition_by_field(
        &self,
        region: LogicalRegion,
        parent: LogicalRegion,
        field: FieldId,
        color_space: IndexSet,
    ) -> Result<IndexPartitionId, RuntimeError> {
        let dim = color_space.dim();
        self.dependent_partition(region, parent, field, dim, move |forest, color_of| {
            forest.partition_by_color_fn(region.index_space(), color_space, color_of)
        })
    }

    /// Partitions `target` by the image of each subregion of `source` under
    /// the pointer stored in `field`.
    pub fn partition_by_image(
        &self,
        target: IndexSpaceId,
        source: LogicalPartition,
        parent: LogicalRegion,
        field: FieldId,
        kind: PartitionKind,
    ) -> Result<IndexPartitionId, RuntimeError> {
        let source_region = self.get_parent_logical_region(source)?;
        let dim = self.read_forest().index_space_domain(target)?.dim();
        self.dependent_partition(source_region, parent, field, dim, move |forest, map| {
            forest.partition_by_image_fn(target, source.index_partition(), map, kind)
        })
    }

    /// Partitions `source` by which subspace of `target` the pointer stored
    /// in `field` lands in.
    pub fn partition_by_preimage(
        &self,
        target: IndexPartitionId,
        source: LogicalRegion,
        parent: LogicalRegion,
        field: FieldId,
        kind: PartitionKind,
    ) -> Result<IndexPartitionId, RuntimeError> {
        let dim = {
            let forest = self.read_forest();
            let space = forest.partition_parent(target)?;
            forest.index_space_domain(space)?.dim()
        };
        self.dependent_partition(source, parent, field, dim, move |forest, map| {
            forest.partition_by_preimage_fn(source.index_space(), target, map, kind)
        })
    }

    fn dependent_partition<F>(
        &self,
        source: LogicalRegion,
        parent: LogicalRegion,
        field: FieldId,
        dim: usize,
        build: F,
    ) -> Result<IndexPartitionId, RuntimeError>
    where
        F: FnOnce(&mut RegionForest, &dyn Fn(&DomainPoint) -> Option<DomainPoint>) -> Result<IndexPartitionId, RegionTreeError>,
    {
        let op = self.rt.next_op();
        let req = RegionRequirement::region(source, Privilege::ReadOnly, Coherence::Exclusive, parent).add_field(field);
        let concretes = self.concretize(op, std::slice::from_ref(&req))?;
        let size = self.read_forest().field_info(source.field_space(), field)?.size;
        if size != dim * 8 {
            return Err(RegionTreeError::FieldSizeMismatch {
                field,
                expected: dim * 8,
                found: size,
            }
            .into());
        }
        let accesses: Vec<Access<'_>> = concretes.iter().map(Concrete::access).collect();
        let issued = self.register(
            op,
            OpKind::DependentPartition,
            &accesses,
            &Synchronization::default(),
            Vec::new(),
        )?;
        if issued.precondition.wait() {
            self.finish(&issued, OpState::Failed);
            return Err(RuntimeError::OperationFailed {
                op,
                reason: POISONED.to_owned(),
            });
        }
        self.transition(op, OpState::Ready);
        self.transition(op, OpState::Executing);
        let inst = self.instances.instance(source.tree(), field, size);
        let read = |p: &DomainPoint| DomainPoint::from_le_bytes(&inst.read(p), dim);
        let built = build(&mut self.write_forest(), &read);
        match built {
            Ok(partition) => {
                self.finish(&issued, OpState::Completed);
                Ok(partition)
            }
            Err(err) => {
                self.finish(&issued, OpState::Failed);
                Err(err.into())
            }
        }
    }

    // ── validation ──────────────────────────────────────────────────────

    fn commutative(&self) -> impl Fn(ReductionOpId) -> bool + Copy + '_ {
        let reductions = &self.rt.sealed().reductions;
        move |id| reductions.is_commutative(id)
    }

    /// Checks a requirement against the forest and the context's privileges;
    /// returns the region bounding everything it may touch.
    fn validate_requirement(
        &self,
        forest: &RegionForest,
        index: usize,
        req: &RegionRequirement,
    ) -> Result<LogicalRegion, RuntimeError> {
        if req.fields.is_empty() {
            return Err(AnalysisError::NoFields(index).into());
        }
        let upper = match req.target {
            RegionTarget::Region(r) => {
                forest.validate_region(&r)?;
                r
            }
            RegionTarget::Partition(lp) => forest.get_parent_logical_region(lp)?,
        };
        forest.validate_region(&req.parent)?;
        for field in &req.fields {
            forest.field_info(upper.field_space(), *field)?;
        }
        if !forest.is_subregion(&upper, &req.parent) {
            return Err(AnalysisError::NotInParentSubtree {
                index,
                region: upper,
                parent: req.parent,
            }
            .into());
        }
        self.check_privileges(forest, index, req, upper)?;
        Ok(upper)
    }

    fn check_privileges(
        &self,
        forest: &RegionForest,
        index: usize,
        req: &RegionRequirement,
        upper: LogicalRegion,
    ) -> Result<(), AnalysisError> {
        let Some(held) = &self.state.privileges else {
            return Ok(());
        };
        if !self.rt.config.safe_privilege_checks {
            return Ok(());
        }
        let created = self
            .state
            .created_trees
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&upper.tree());
        if created {
            return Ok(());
        }
        let denied = AnalysisError::PrivilegeNotHeld {
            index,
            region: upper,
            parent: req.parent,
            privilege: req.privilege,
        };
        let covering: Vec<&HeldPrivilege> = held
            .iter()
            .filter(|h| forest.is_subregion(&req.parent, &h.region))
            .collect();
        if covering.is_empty() {
            return Err(denied);
        }
        let own_fields = self
            .state
            .created_fields
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for field in &req.fields {
            if own_fields.contains(&(upper.field_space(), *field)) {
                continue;
            }
            let mut holders = covering.iter().filter(|h| h.fields.contains(field)).peekable();
            if holders.peek().is_none() {
                return Err(AnalysisError::FieldNotHeld { index, field: *field });
            }
            if !holders.any(|h| req.privilege.is_subsumed_by(h.privilege)) {
                return Err(denied);
            }
        }
        Ok(())
    }

    /// Validates requirements that must each name a region.
    fn concretize(&self, op: OpId, reqs: &[RegionRequirement]) -> Result<Vec<Concrete>, RuntimeError> {
        let concretes = {
            let forest = self.read_forest();
            let mut out = Vec::with_capacity(reqs.len());
            for (i, req) in reqs.iter().enumerate() {
                self.validate_requirement(&forest, i, req)?;
                let region = req.region_target().ok_or(AnalysisError::RegionRequired(i))?;
                out.push(Concrete::new(&forest, i, region, req)?);
            }
            out
        };
        self.check_pairwise(op, &concretes)?;
        Ok(concretes)
    }

    fn check_pairwise(&self, op: OpId, concretes: &[Concrete]) -> Result<(), RuntimeError> {
        let commutative = self.commutative();
        for (i, a) in concretes.iter().enumerate() {
            for b in concretes.iter().skip(i + 1) {
                if a.access().interferes(&b.access(), commutative) {
                    let err = AnalysisError::InterferingRequirements {
                        first: a.index,
                        second: b.index,
                    };
                    telemetry::interference(self.state.id, op, &err);
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Projects every requirement of an index launch for every point.
    fn project_launch(
        &self,
        op: OpId,
        launcher: &IndexTaskLauncher,
        points: &[DomainPoint],
    ) -> Result<Vec<Vec<Concrete>>, RuntimeError> {
        let sealed = self.rt.sealed();
        let safe = self.shard_state().is_some_and(|s| s.safe());
        let reqs = &launcher.requirements;
        let (per_point, unchecked) = {
            let forest = self.read_forest();
            let mut functors = Vec::with_capacity(reqs.len());
            for (i, req) in reqs.iter().enumerate() {
                self.validate_requirement(&forest, i, req)?;
                functors.push(sealed.projections.get(req.projection)?);
            }
            let mut per_point = Vec::with_capacity(points.len());
            for point in points {
                let mut concretes = Vec::with_capacity(reqs.len());
                for (i, (req, functor)) in reqs.iter().zip(&functors).enumerate() {
                    let region = project_point(&forest, functor.as_ref(), &req.target, point, &launcher.domain)?;
                    if safe && project_point(&forest, functor.as_ref(), &req.target, point, &launcher.domain)? != region {
                        return Err(ReplicationError::ImpureFunctor {
                            kind: "projection",
                            point: *point,
                        }
                        .into());
                    }
                    concretes.push(Concrete::new(&forest, i, region, req)?);
                }
                per_point.push(concretes);
            }
            let unchecked: Vec<bool> = reqs
                .iter()
                .zip(&functors)
                .map(|(req, functor)| {
                    launcher.independent_requirements
                        || match &req.target {
                            // Deeper functors can reach a region and its own descendant.
                            RegionTarget::Partition(lp) => {
                                functor.depth() == 0
                                    && functor.is_injective()
                                    && forest.is_disjoint(lp.index_partition()).unwrap_or(false)
                            }
                            RegionTarget::Region(_) => false,
                        }
                })
                .collect();
            if self.rt.config.safe_partition_checks {
                for (index, (req, functor)) in reqs.iter().zip(&functors).enumerate() {
                    if let RegionTarget::Partition(lp) = &req.target {
                        if functor.is_complete() && functor.depth() == 0 {
                            check_complete(&forest, index, *lp, &per_point)?;
                        }
                    }
                }
            }
            (per_point, unchecked)
        };
        for concretes in &per_point {
            self.check_pairwise(op, concretes)?;
        }
        let commutative = self.commutative();
        for (i, (first, a)) in points.iter().zip(&per_point).enumerate() {
            for (second, b) in points.iter().zip(&per_point).skip(i + 1) {
                for (index, (x, y)) in a.iter().zip(b).enumerate() {
                    if unchecked.get(index).copied().unwrap_or(false) {
                        continue;
                    }
                    if x.access().interferes(&y.access(), commutative) {
                        let err = AnalysisError::InterferingPoints {
                            index,
                            first: *first,
                            second: *second,
                        };
                        telemetry::interference(self.state.id, op, &err);
                        return Err(err.into());
                    }
                }
            }
        }
        Ok(per_point)
    }

    fn output_buffers(&self, outputs: &[OutputRequirement]) -> Result<Vec<OutputBuffer>, RuntimeError> {
        let forest = self.read_forest();
        outputs
            .iter()
            .map(|req| {
                let sizes = req
                    .fields
                    .iter()
                    .map(|f| Ok((*f, forest.field_info(req.field_space, *f)?.size)))
                    .collect::<Result<BTreeMap<_, _>, RegionTreeError>>()?;
                Ok(OutputBuffer::new(req.clone(), sizes))
            })
            .collect()
    }

    // ── registration and lifecycle ──────────────────────────────────────

    /// Analyses `accesses` and enters the operation into the table.
    ///
    /// The precondition merges the completion events of every prior
    /// conflicting operation, the barrier generations waited on, `extra`
    /// and the latest fence.
    pub(crate) fn register(
        &self,
        op: OpId,
        kind: OpKind,
        accesses: &[Access<'_>],
        sync: &Synchronization,
        extra: Vec<Event>,
    ) -> Result<Issued, RuntimeError> {
        let sealed = self.rt.sealed();
        let mut events = extra;
        let mut waits: Vec<BarrierGen> = Vec::with_capacity(sync.wait.len());
        for barrier in &sync.wait {
            events.push(sealed.barriers.event(*barrier)?);
            waits.push((barrier.id(), barrier.generation()));
        }
        let mut arrivals: Vec<BarrierGen> = Vec::new();
        let targets = sync
            .arrive
            .iter()
            .copied()
            .chain(sync.collectives.iter().map(|c| c.barrier()));
        for barrier in targets {
            let target = sealed.barriers.target(barrier)?;
            arrivals.push((target.id(), target.generation()));
        }
        if let Some((barrier, generation)) = arrivals.iter().find(|a| waits.contains(a)) {
            return Err(SyncError::Deadlock {
                barrier: *barrier,
                generation: *generation,
            }
            .into());
        }

        let commutative = self.commutative();
        let mut analyzer = self.state.analyzer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut analysis = Analysis::default();
        for access in accesses {
            analysis.merge(analyzer.analyze(op, access, commutative));
        }
        let deps = analysis.ops();
        let mut ops = self.state.ops.lock().unwrap_or_else(PoisonError::into_inner);
        for (barrier, generation) in &arrivals {
            if ops.reaches_wait(&deps, (*barrier, *generation)) {
                let err = SyncError::Deadlock {
                    barrier: *barrier,
                    generation: *generation,
                };
                telemetry::interference(self.state.id, op, &err);
                return Err(err.into());
            }
        }
        let seq = self.state.next_seq.fetch_add(1, Ordering::Relaxed);
        let completion = UserEvent::new();
        let event = completion.event();
        let none = Analysis::default();
        let mut evicted = 0;
        for (i, access) in accesses.iter().enumerate() {
            let applied = if i == 0 { &analysis } else { &none };
            evicted += analyzer.record(op, &event, access, applied);
        }
        ops.insert(
            seq,
            OpRecord {
                id: op,
                kind,
                state: OpState::Created,
                completion: event,
                deps: deps.clone(),
                waits,
            },
        );
        ops.transition(self.state.id, op, OpState::Analyzed);
        drop(ops);
        drop(analyzer);

        self.state.counters.issued();
        self.state.counters.dependences(deps.len());
        self.state.counters.evictions(evicted);
        events.extend(analysis.events());
        events.push(self.state.fence.lock().unwrap_or_else(PoisonError::into_inner).clone());
        tracing::trace!(
            ctx = self.state.id.value(),
            op = op.value(),
            seq,
            ?kind,
            deps = deps.len(),
            evicted,
            "operation registered"
        );
        Ok(Issued {
            op,
            seq,
            kind,
            completion,
            precondition: Event::merge(events),
        })
    }

    pub(crate) fn transition(&self, op: OpId, state: OpState) {
        self.state
            .ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .transition(self.state.id, op, state);
    }

    /// Runs `then` once the precondition triggers and the predicate resolves.
    fn when_ready<F>(&self, issued: &Issued, predicate: Predicate, then: F)
    where
        F: FnOnce(Readiness) + Send + 'static,
    {
        let ctx = self.clone();
        let op = issued.op;
        issued.precondition.subscribe(move |poisoned| {
            if poisoned {
                then(Readiness::Poisoned);
                return;
            }
            ctx.transition(op, OpState::Ready);
            if predicate.is_true() {
                then(Readiness::Run);
                return;
            }
            // Failed predicate futures resolve false rather than poisoning.
            Event::merge(predicate.events()).subscribe(move |_| {
                if predicate.resolve() {
                    then(Readiness::Run);
                } else {
                    then(Readiness::Skip);
                }
            });
        });
    }

    /// Marks the operation finished, retires whatever committed and
    /// triggers (or poisons) its completion event.
    pub(crate) fn finish(&self, issued: &Issued, state: OpState) {
        let committed = self
            .state
            .ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finish(self.state.id, issued.op, state);
        if !committed.is_empty() {
            let mut analyzer = self.state.analyzer.lock().unwrap_or_else(PoisonError::into_inner);
            for op in &committed {
                analyzer.retire(*op);
            }
        }
        match state {
            OpState::ResolvedFalse => self.state.counters.resolved_false(),
            OpState::Failed => self.state.counters.failed(),
            _ => {}
        }
        tracing::debug!(
            ctx = self.state.id.value(),
            op = issued.op.value(),
            kind = ?issued.kind,
            ?state,
            committed = committed.len(),
            "operation finished"
        );
        if state == OpState::Failed {
            issued.completion.poison();
        } else {
            issued.completion.trigger();
        }
    }

    fn fail_with(&self, op: OpId, err: impl Into<RuntimeError>) -> Outcome {
        let err = err.into();
        let reason = err.to_string();
        self.record_error(op, err);
        Outcome::Failed(reason)
    }

    fn publish_digest<'a, I>(&self, issued: &Issued, decisions: I)
    where
        I: IntoIterator<Item = (&'a DomainPoint, ShardId, &'a [u8])>,
    {
        let Some(shard) = self.shard_state() else {
            return;
        };
        if let Err(err) = shard.digest(issued.seq, launch_digest(issued.seq, decisions)) {
            self.record_error(issued.op, err.into());
        }
    }

    /// Role of a launch-domain-free operation on this shard.
    fn origin_role(&self, issued: &Issued) -> Role {
        match self.shard_state() {
            Some(shard) if shard.shard().index() != 0 => Role::Mirror(
                shard
                    .expect_remote(issued.seq, DomainPoint::origin(1), issued.op)
                    .event(),
            ),
            Some(_) => Role::Run {
                arrive: true,
                announce: true,
            },
            None => Role::Run {
                arrive: true,
                announce: false,
            },
        }
    }

    fn arrive(&self, op: OpId, sync: &Synchronization, value: Option<&[u8]>) {
        let barriers = &self.rt.sealed().barriers;
        for barrier in &sync.arrive {
            if let Err(err) = barriers.arrive(*barrier, 1) {
                self.record_error(op, err.into());
            }
        }
        for collective in &sync.collectives {
            if let Err(err) = barriers.arrive_value(*collective, value, 1) {
                self.record_error(op, err.into());
            }
        }
    }

    // ── mapping ─────────────────────────────────────────────────────────

    /// Picks a processor and asks the mapper for layouts, retrying while it
    /// requests a remap or returns layouts that break the constraints.
    fn select_and_map(
        &self,
        info: &MappableInfo,
        fixed: Option<ProcessorId>,
    ) -> Result<(ProcessorId, Vec<InstanceLayout>), RuntimeError> {
        let processors = self.rt.pool.processors();
        let processor = fixed.unwrap_or_else(|| self.rt.mapper.select_processor(info, &self.rt.pool.load()));
        if processor.index() >= processors {
            return Err(MapperError::UnknownProcessor(processor).into());
        }
        let max_remaps = self.rt.config.max_remaps;
        let mut attempt = 0;
        loop {
            let mapped = self
                .rt
                .mapper
                .map_operation(info, attempt)
                .and_then(|layouts| validate_layouts(info, &layouts).map(|()| layouts));
            match mapped {
                Ok(layouts) => return Ok((processor, layouts)),
                Err(err @ (MapperError::Remap(_) | MapperError::InvalidLayout(_))) => {
                    if attempt >= max_remaps {
                        return Err(MapperError::AttemptsExhausted {
                            op: info.op,
                            attempts: attempt + 1,
                        }
                        .into());
                    }
                    self.state.counters.remap();
                    tracing::warn!(op = info.op.value(), attempt, %err, "remapping");
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn physical_regions(
        &self,
        concretes: &[Concrete],
        layouts: Vec<InstanceLayout>,
    ) -> Result<Vec<PhysicalRegion>, RuntimeError> {
        let reductions = Arc::clone(&self.rt.sealed().reductions);
        let forest = self.read_forest();
        concretes
            .iter()
            .zip(layouts)
            .map(|(c, layout)| {
                let mut instances = FxHashMap::default();
                for field in &c.fields {
                    let size = forest.field_info(c.region.field_space(), *field)?.size;
                    if c.privilege == Privilege::WriteDiscard {
                        self.instances.clear(c.region.tree(), *field, &c.domain);
                    }
                    instances.insert(*field, self.instances.instance(c.region.tree(), *field, size));
                }
                Ok(PhysicalRegion::new(
                    c.region,
                    c.domain.clone(),
                    c.privilege,
                    layout,
                    instances,
                    Arc::clone(&reductions),
                ))
            })
            .collect()
    }

    // ── task execution ──────────────────────────────────────────────────

    fn spawn_run(&self, issued: Issued, run: TaskRun, predicate: Predicate) {
        let ctx = self.clone();
        let ready = issued.clone();
        self.when_ready(&issued, predicate, move |readiness| ctx.start_run(ready, run, readiness));
    }

    fn start_run(&self, issued: Issued, run: TaskRun, readiness: Readiness) {
        let tracker = Arc::new(RunTracker {
            ctx: self.clone(),
            issued: issued.clone(),
            remaining: AtomicUsize::new(run.points.len()),
            failed: AtomicBool::new(false),
            skipped: AtomicBool::new(readiness == Readiness::Skip),
            remote: Event::merge(run.remote),
        });
        if run.points.is_empty() {
            tracker.complete();
            return;
        }
        for work in run.points {
            match readiness {
                Readiness::Run => self.launch_point(&issued, &tracker, work, run.domain.clone()),
                Readiness::Skip => self.settle_point(&issued, &tracker, work, Outcome::Empty),
                Readiness::Poisoned => {
                    self.settle_point(&issued, &tracker, work, Outcome::Failed(POISONED.to_owned()));
                }
            }
        }
    }

    fn launch_point(&self, issued: &Issued, tracker: &Arc<RunTracker>, work: PointWork, domain: Option<IndexSet>) {
        let info = mappable_info(issued.op, issued.kind, Some(work.task), work.point, &work.regions);
        let (processor, layouts) = match self.select_and_map(&info, work.processor) {
            Ok(mapped) => mapped,
            Err(err) => {
                let outcome = self.fail_with(issued.op, err);
                self.settle_point(issued, tracker, work, outcome);
                return;
            }
        };
        self.transition(issued.op, OpState::Mapped);
        let locked = match self.rt.reservations.acquire_grant(&work.grant) {
            Ok(event) => event,
            Err(err) => {
                let outcome = self.fail_with(issued.op, err);
                self.settle_point(issued, tracker, work, outcome);
                return;
            }
        };
        let ctx = self.clone();
        let issued = issued.clone();
        let tracker = Arc::clone(tracker);
        locked.subscribe(move |poisoned| {
            if poisoned {
                let outcome = Outcome::Failed("reservation grant failed".to_owned());
                ctx.settle_point(&issued, &tracker, work, outcome);
                return;
            }
            let runner = ctx.clone();
            ctx.rt.pool.dispatch(
                processor,
                Box::new(move || runner.execute_point(&issued, &tracker, work, layouts, domain)),
            );
        });
    }

    fn execute_point(
        &self,
        issued: &Issued,
        tracker: &Arc<RunTracker>,
        work: PointWork,
        layouts: Vec<InstanceLayout>,
        domain: Option<IndexSet>,
    ) {
        self.transition(issued.op, OpState::Executing);
        let outcome = {
            let _span = tracing::debug_span!("task", op = issued.op.value(), task = work.task.value()).entered();
            self.run_task(issued, &work, layouts, domain)
        };
        if let Err(err) = self.rt.reservations.release_grant(&work.grant) {
            self.record_error(issued.op, err.into());
        }
        self.settle_point(issued, tracker, work, outcome);
    }

    /// Runs the body, replaying failed attempts when resilience is on.
    fn run_task(&self, issued: &Issued, work: &PointWork, layouts: Vec<InstanceLayout>, domain: Option<IndexSet>) -> Outcome {
        let body = match self.rt.sealed().tasks.get(work.task) {
            Ok(variant) => Arc::clone(variant.body()),
            Err(err) => return self.fail_with(issued.op, err),
        };
        let regions = match self.physical_regions(&work.regions, layouts) {
            Ok(regions) => regions,
            Err(err) => return self.fail_with(issued.op, err),
        };
        let child = self.child(work.regions.iter().map(Concrete::held).collect());
        let max_replays = if self.rt.config.resilience { self.rt.config.max_replays } else { 0 };
        // Write-discard regions were cleared when mapped, so their snapshot is the cleared state.
        let saved: Vec<InstanceSnapshot> = if max_replays > 0 {
            regions.iter().flat_map(PhysicalRegion::snapshot).collect()
        } else {
            Vec::new()
        };
        let mut attempt = 0;
        let result = loop {
            let mut tc = TaskContext {
                task: work.task,
                op: issued.op,
                point: work.point,
                index_domain: domain.clone(),
                args: work.args.clone(),
                regions: regions.clone(),
                futures: work.futures.clone(),
                outputs: work.outputs.iter().map(|o| o.buffer.clone()).collect(),
                attempt,
                context: child.clone(),
            };
            let reason = match catch_unwind(AssertUnwindSafe(|| body(&mut tc))) {
                Ok(Ok(value)) => break Ok((value, tc.outputs)),
                Ok(Err(err)) => err.to_string(),
                Err(payload) => panic_message(payload.as_ref()),
            };
            child.wait_all();
            if attempt >= max_replays {
                break Err(reason);
            }
            for snapshot in &saved {
                snapshot.restore();
            }
            attempt += 1;
            self.state.counters.replay();
            tracing::warn!(op = issued.op.value(), task = work.task.value(), attempt, %reason, "task failed; replaying");
        };
        child.close();
        for region in &regions {
            region.unmap();
        }
        match result {
            Ok((value, buffers)) => match self.bind_outputs(issued, work, buffers) {
                Ok(()) => Outcome::Value(value),
                Err(err) => self.fail_with(issued.op, err),
            },
            Err(reason) => {
                tracing::warn!(op = issued.op.value(), task = work.task.value(), %reason, "task failed");
                Outcome::Failed(reason)
            }
        }
    }

    /// Creates the regions of a finished task's output requirements.
    fn bind_outputs(&self, issued: &Issued, work: &PointWork, buffers: Vec<OutputBuffer>) -> Result<(), RuntimeError> {
        let completion = issued.completion.event();
        for (buffer, pending) in buffers.into_iter().zip(&work.outputs) {
            let domain = buffer.domain();
            let fields = buffer.fields().clone();
            let space = buffer.field_space();
            let (region, sizes) = {
                let mut forest = self.write_forest();
                let is = forest.create_index_space(domain.clone());
                let region = forest.create_logical_region(is, space)?;
                let sizes = fields
                    .iter()
                    .map(|f| Ok((*f, forest.field_info(space, *f)?.size)))
                    .collect::<Result<BTreeMap<_, _>, RegionTreeError>>()?;
                (region, sizes)
            };
            self.state
                .created_trees
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(region.tree());
            for (field, values) in buffer.into_values() {
                let size = sizes.get(&field).copied().unwrap_or(0);
                let inst = self.instances.instance(region.tree(), field, size);
                for (point, value) in values {
                    inst.write(point, value);
                }
            }
            let access = Access {
                tree: region.tree(),
                node: region.index_space(),
                domain: &domain,
                fields: &fields,
                usage: RegionUsage::new(Privilege::ReadWrite, Coherence::Exclusive),
            };
            self.state
                .analyzer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record(issued.op, &completion, &access, &Analysis::default());
            pending.region.set(region);
        }
        Ok(())
    }

    fn settle_point(&self, issued: &Issued, tracker: &RunTracker, work: PointWork, outcome: Outcome) {
        match &outcome {
            Outcome::Value(value) => work.setter.set(value.clone()),
            Outcome::Empty => {
                work.setter.set_empty();
                for output in &work.outputs {
                    output.region.set_empty();
                }
            }
            Outcome::Failed(reason) => {
                work.setter.fail(reason.clone());
                for output in &work.outputs {
                    output.region.fail(reason);
                }
            }
        }
        let value = match &outcome {
            Outcome::Value(v) => Some(v.as_ref()),
            Outcome::Empty | Outcome::Failed(_) => None,
        };
        self.arrive(issued.op, &work.sync, value);
        if let Some(shard) = self.shard_state() {
            if let Err(err) = shard.announce(issued.seq, work.key, outcome.point_value()) {
                self.record_error(issued.op, err.into());
            }
        }
        tracker.point_done(&outcome);
    }

    // ── copies, fills and markers ───────────────────────────────────────

    fn run_deferred<F>(
        &self,
        issued: Issued,
        predicate: Predicate,
        sync: Synchronization,
        info: MappableInfo,
        role: Role,
        body: F,
    ) where
        F: FnOnce(&Self) -> Result<(), RuntimeError> + Send + 'static,
    {
        let ctx = self.clone();
        let ready = issued.clone();
        self.when_ready(&issued, predicate, move |readiness| {
            ctx.run_role(ready, readiness, sync, &info, role, body);
        });
    }

    fn run_role<F>(
        &self,
        issued: Issued,
        readiness: Readiness,
        sync: Synchronization,
        info: &MappableInfo,
        role: Role,
        body: F,
    ) where
        F: FnOnce(&Self) -> Result<(), RuntimeError> + Send + 'static,
    {
        let (arrive, announce) = match role {
            Role::Mirror(remote) => {
                let ctx = self.clone();
                remote.subscribe(move |poisoned| {
                    let state = if poisoned || readiness == Readiness::Poisoned {
                        OpState::Failed
                    } else if readiness == Readiness::Skip {
                        OpState::ResolvedFalse
                    } else {
                        OpState::Completed
                    };
                    ctx.finish(&issued, state);
                });
                return;
            }
            Role::Run { arrive, announce } => (arrive, announce),
        };
        match readiness {
            Readiness::Run => {
                let processor = self.rt.mapper.select_processor(info, &self.rt.pool.load());
                self.transition(issued.op, OpState::Mapped);
                let ctx = self.clone();
                self.rt.pool.dispatch(
                    processor,
                    Box::new(move || {
                        ctx.transition(issued.op, OpState::Executing);
                        let outcome = match body(&ctx) {
                            Ok(()) => Outcome::Value(Bytes::new()),
                            Err(err) => ctx.fail_with(issued.op, err),
                        };
                        ctx.settle_deferred(&issued, &sync, arrive, announce, &outcome);
                    }),
                );
            }
            Readiness::Skip => self.settle_deferred(&issued, &sync, arrive, announce, &Outcome::Empty),
            Readiness::Poisoned => {
                let outcome = Outcome::Failed(POISONED.to_owned());
                self.settle_deferred(&issued, &sync, arrive, announce, &outcome);
            }
        }
    }

    fn settle_deferred(&self, issued: &Issued, sync: &Synchronization, arrive: bool, announce: bool, outcome: &Outcome) {
        if arrive {
            self.arrive(issued.op, sync, None);
        }
        if announce {
            if let Some(shard) = self.shard_state() {
                if let Err(err) = shard.announce(issued.seq, DomainPoint::origin(1), outcome.point_value()) {
                    self.record_error(issued.op, err.into());
                }
            }
        }
        self.finish(issued, outcome.state());
    }

    /// Copies (or folds) each source field into its paired destination
    /// field over the points both regions share.
    fn copy_body(&self, concretes: &[Concrete]) -> Result<(), RuntimeError> {
        let sealed = self.rt.sealed();
        for pair in concretes.chunks(2) {
            let [src, dst] = pair else { continue };
            let points = src.domain.intersection(&dst.domain);
            let fold = match dst.privilege.reduction() {
                Some(id) => Some(sealed.reductions.get(id).ok_or(AccessError::UnknownReduction(id))?),
                None => None,
            };
            for (sf, df) in src.fields.iter().zip(&dst.fields) {
                let (info, size) = {
                    let forest = self.read_forest();
                    (
                        forest.field_info(src.region.field_space(), *sf)?,
                        forest.field_info(dst.region.field_space(), *df)?.size,
                    )
                };
                let from = self.instances.instance(src.region.tree(), *sf, info.size);
                let to = self.instances.instance(dst.region.tree(), *df, size);
                for point in points.points() {
                    let value = sealed.serdez.transfer(info.serdez, from.read(&point))?;
                    match fold {
                        Some(op) => to.update(point, |acc| {
                            op.fold(acc, &value);
                            acc.resize(size, 0);
                        }),
                        None => to.write(point, value),
                    }
                }
            }
        }
        Ok(())
    }

    fn fill_body(&self, target: &Concrete, value: &[u8]) -> Result<(), RuntimeError> {
        for field in &target.fields {
            let size = self
                .read_forest()
                .field_info(target.region.field_space(), *field)?
                .size;
            let inst = self.instances.instance(target.region.tree(), *field, size);
            for point in target.domain.points() {
                inst.write(point, value.to_vec());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn panic_messages_are_recovered() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "task panicked");
    }

    #[test]
    fn outcomes_map_to_final_states() {
        assert_eq!(Outcome::Value(Bytes::new()).state(), OpState::Completed);
        assert_eq!(Outcome::Empty.state(), OpState::ResolvedFalse);
        assert_eq!(Outcome::Failed("x".into()).state(), OpState::Failed);
        assert_eq!(Outcome::Empty.point_value(), PointValue::Empty);
    }
}
