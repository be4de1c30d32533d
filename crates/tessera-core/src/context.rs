// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Contexts: the scope operations are issued from.
//!
//! A context owns its dependence analyzer and in-flight operation table.
//! The top-level context holds every privilege on the trees it creates; a
//! task's child context holds exactly the privileges of the task's region
//! requirements. All contexts of one runtime (or one replicated shard) share
//! the region forest and instance storage.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rustc_hash::FxHashSet;
use tessera_config::RuntimeConfig;

use crate::analyzer::DependenceAnalyzer;
use crate::domain::{DomainPoint, IndexSet, Rect, Transform};
use crate::error::{FutureError, ReplicationError, RuntimeError};
use crate::event::Event;
use crate::future::{Future, FutureMap};
use crate::ident::{
    ContextId, FieldId, FieldSpaceId, IndexPartitionId, IndexSpaceId, OpId, ReductionOpId,
    RegionTreeId, SerdezId, ShardId,
};
use crate::instance::InstanceStore;
use crate::op::{OpState, OpTable};
use crate::pipeline::InlineMapping;
use crate::privilege::{FieldSet, Privilege};
use crate::region_tree::partition::{Coloring, SetOp};
use crate::region_tree::{LogicalPartition, LogicalRegion, PartitionKind, RegionForest};
use crate::replication::{ReduceMode, ShardState};
use crate::runtime::RuntimeShared;
use crate::sync::{DynamicCollective, LockMode, PhaseBarrier, Reservation};
use crate::telemetry::{self, ContextCounters, ContextStats};

/// A privilege a context holds on part of a region tree.
#[derive(Debug, Clone)]
pub(crate) struct HeldPrivilege {
    pub(crate) region: LogicalRegion,
    pub(crate) fields: FieldSet,
    pub(crate) privilege: Privilege,
}

pub(crate) struct ContextState {
    pub(crate) id: ContextId,
    /// `None` for top-level contexts, which hold everything.
    pub(crate) privileges: Option<Vec<HeldPrivilege>>,
    pub(crate) created_trees: Mutex<FxHashSet<RegionTreeId>>,
    pub(crate) created_fields: Mutex<FxHashSet<(FieldSpaceId, FieldId)>>,
    pub(crate) analyzer: Mutex<DependenceAnalyzer>,
    pub(crate) ops: Mutex<OpTable>,
    pub(crate) counters: ContextCounters,
    /// Incremented under the analyzer lock so sequence order is analysis order.
    pub(crate) next_seq: AtomicU64,
    /// Completion of the latest execution fence.
    pub(crate) fence: Mutex<Event>,
    pub(crate) errors: Mutex<Vec<RuntimeError>>,
    pub(crate) inline: Mutex<Vec<InlineMapping>>,
    pub(crate) shard: Option<Arc<ShardState>>,
}

/// Handle to a context. Cheap to clone; clones issue into the same stream.
#[derive(Clone)]
pub struct Context {
    pub(crate) rt: Arc<RuntimeShared>,
    pub(crate) forest: Arc<RwLock<RegionForest>>,
    pub(crate) instances: Arc<InstanceStore>,
    pub(crate) state: Arc<ContextState>,
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.state.id)
            .field("shard", &self.shard())
            .finish_non_exhaustive()
    }
}

impl Context {
    pub(crate) fn top_level(
        rt: Arc<RuntimeShared>,
        shard: Option<Arc<ShardState>>,
        instances: Option<Arc<InstanceStore>>,
    ) -> Self {
        rt.sealed();
        let forest = Arc::new(RwLock::new(RegionForest::new(rt.config.safe_partition_checks)));
        let instances = instances.unwrap_or_default();
        Self::with_state(rt, forest, instances, None, shard)
    }

    /// Context for the body of a task holding `privileges`.
    pub(crate) fn child(&self, privileges: Vec<HeldPrivilege>) -> Self {
        Self::with_state(
            Arc::clone(&self.rt),
            Arc::clone(&self.forest),
            Arc::clone(&self.instances),
            Some(privileges),
            None,
        )
    }

    fn with_state(
        rt: Arc<RuntimeShared>,
        forest: Arc<RwLock<RegionForest>>,
        instances: Arc<InstanceStore>,
        privileges: Option<Vec<HeldPrivilege>>,
        shard: Option<Arc<ShardState>>,
    ) -> Self {
        let id = rt.next_ctx();
        let state = ContextState {
            id,
            privileges,
            created_trees: Mutex::new(FxHashSet::default()),
            created_fields: Mutex::new(FxHashSet::default()),
            analyzer: Mutex::new(DependenceAnalyzer::new(id, rt.config.enable_eviction)),
            ops: Mutex::new(OpTable::default()),
            counters: ContextCounters::default(),
            next_seq: AtomicU64::new(0),
            fence: Mutex::new(Event::no_event()),
            errors: Mutex::new(Vec::new()),
            inline: Mutex::new(Vec::new()),
            shard,
        };
        Self {
            rt,
            forest,
            instances,
            state: Arc::new(state),
        }
    }

    pub(crate) fn instances(&self) -> Arc<InstanceStore> {
        Arc::clone(&self.instances)
    }

    pub(crate) fn read_forest(&self) -> RwLockReadGuard<'_, RegionForest> {
        self.forest.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_forest(&self) -> RwLockWriteGuard<'_, RegionForest> {
        self.forest.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn shard_state(&self) -> Option<&Arc<ShardState>> {
        self.state.shard.as_ref()
    }

    /// Whether this shard issues side effects that must happen once per
    /// replicated program (always true outside replication).
    pub(crate) fn is_origin_shard(&self) -> bool {
        self.shard().is_none_or(|s| s.index() == 0)
    }

    // ── identity ────────────────────────────────────────────────────────

    /// Context id.
    pub fn id(&self) -> ContextId {
        self.state.id
    }

    /// Shard this context runs on, inside [`Runtime::replicate`](crate::Runtime::replicate).
    pub fn shard(&self) -> Option<ShardId> {
        self.state.shard.as_ref().map(|s| s.shard())
    }

    /// Number of shards; 1 outside replication.
    pub fn shards(&self) -> usize {
        self.state.shard.as_ref().map_or(1, |s| s.shards())
    }

    /// Runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.rt.config
    }

    /// Number of worker processors.
    pub fn processors(&self) -> usize {
        self.rt.pool.processors()
    }

    // ── index spaces and partitions ─────────────────────────────────────

    /// Creates a top-level index space over `domain`.
    pub fn create_index_space(&self, domain: IndexSet) -> IndexSpaceId {
        self.write_forest().create_index_space(domain)
    }

    /// Adds an owner to a top-level index space.
    pub fn create_shared_ownership(&self, space: IndexSpaceId) -> Result<(), RuntimeError> {
        Ok(self.write_forest().create_shared_ownership(space)?)
    }

    /// Drops one owner; the last owner destroys the space, every partition
    /// under it and every region tree built on it.
    pub fn destroy_index_space(&self, space: IndexSpaceId) -> Result<(), RuntimeError> {
        let dead = self.write_forest().destroy_index_space(space)?;
        if dead.is_empty() {
            return Ok(());
        }
        {
            let mut analyzer = self.state.analyzer.lock().unwrap_or_else(PoisonError::into_inner);
            for tree in &dead {
                analyzer.forget_tree(*tree);
            }
        }
        for tree in &dead {
            self.instances.drop_tree(*tree);
        }
        tracing::debug!(ctx = self.state.id.value(), space = space.value(), trees = dead.len(), "index space destroyed");
        Ok(())
    }

    /// Point set of an index space.
    pub fn index_space_domain(&self, space: IndexSpaceId) -> Result<IndexSet, RuntimeError> {
        Ok(self.read_forest().index_space_domain(space)?.clone())
    }

    /// Installs an explicit coloring as a partition of `parent`.
    pub fn create_partition(
        &self,
        parent: IndexSpaceId,
        color_space: IndexSet,
        coloring: Coloring,
        kind: PartitionKind,
    ) -> Result<IndexPartitionId, RuntimeError> {
        Ok(self
            .write_forest()
            .create_partition(parent, color_space, coloring, kind)?)
    }

    /// Splits `parent` into `colors` near-equal disjoint pieces.
    pub fn partition_equal(&self, parent: IndexSpaceId, colors: u64) -> Result<IndexPartitionId, RuntimeError> {
        Ok(self.write_forest().partition_equal(parent, colors)?)
    }

    /// Blocks of `extent` placed at `transform(color)`.
    pub fn partition_by_restriction(
        &self,
        parent: IndexSpaceId,
        color_space: IndexSet,
        transform: &Transform,
        extent: &Rect,
        kind: PartitionKind,
    ) -> Result<IndexPartitionId, RuntimeError> {
        Ok(self
            .write_forest()
            .partition_by_restriction(parent, color_space, transform, extent, kind)?)
    }

    /// Color-wise union of two partitions of one parent.
    pub fn partition_by_union(
        &self,
        first: IndexPartitionId,
        second: IndexPartitionId,
        kind: PartitionKind,
    ) -> Result<IndexPartitionId, RuntimeError> {
        Ok(self
            .write_forest()
            .partition_by_set_op(SetOp::Union, first, second, kind)?)
    }

    /// Color-wise intersection of two partitions of one parent.
    pub fn partition_by_intersection(
        &self,
        first: IndexPartitionId,
        second: IndexPartitionId,
        kind: PartitionKind,
    ) -> Result<IndexPartitionId, RuntimeError> {
        Ok(self
            .write_forest()
            .partition_by_set_op(SetOp::Intersection, first, second, kind)?)
    }

    /// Color-wise difference of two partitions of one parent.
    pub fn partition_by_difference(
        &self,
        first: IndexPartitionId,
        second: IndexPartitionId,
        kind: PartitionKind,
    ) -> Result<IndexPartitionId, RuntimeError> {
        Ok(self
            .write_forest()
            .partition_by_set_op(SetOp::Difference, first, second, kind)?)
    }

    /// Removes a partition and everything beneath it.
    pub fn destroy_index_partition(&self, partition: IndexPartitionId) -> Result<(), RuntimeError> {
        Ok(self.write_forest().destroy_index_partition(partition)?)
    }

    /// Whether the partition's subspaces are pairwise disjoint.
    pub fn is_disjoint(&self, partition: IndexPartitionId) -> Result<bool, RuntimeError> {
        Ok(self.read_forest().is_disjoint(partition)?)
    }

    /// Whether the partition's subspaces cover its parent.
    pub fn is_complete(&self, partition: IndexPartitionId) -> Result<bool, RuntimeError> {
        Ok(self.read_forest().is_complete(partition)?)
    }

    /// Subspace of `partition` colored `color`.
    pub fn index_subspace(&self, partition: IndexPartitionId, color: &DomainPoint) -> Result<IndexSpaceId, RuntimeError> {
        Ok(self.read_forest().subspace(partition, color)?)
    }

    // ── fields ──────────────────────────────────────────────────────────

    /// Creates an empty field space.
    pub fn create_field_space(&self) -> FieldSpaceId {
        self.write_forest().create_field_space()
    }

    /// Allocates a field of `size` bytes per point. The allocating context
    /// holds privileges on it.
    pub fn allocate_field(&self, space: FieldSpaceId, size: usize) -> Result<FieldId, RuntimeError> {
        let field = self.write_forest().allocate_field(space, size, None)?;
        self.note_field(space, field);
        Ok(field)
    }

    /// Allocates a field whose copies go through a registered serdez operator.
    pub fn allocate_field_with_serdez(
        &self,
        space: FieldSpaceId,
        size: usize,
        serdez: SerdezId,
    ) -> Result<FieldId, RuntimeError> {
        self.rt.sealed().serdez.get(serdez)?;
        let field = self.write_forest().allocate_field(space, size, Some(serdez))?;
        self.note_field(space, field);
        Ok(field)
    }

    /// Allocates a field freed automatically when this context ends.
    pub fn allocate_local_field(&self, space: FieldSpaceId, size: usize) -> Result<FieldId, RuntimeError> {
        let field = self
            .write_forest()
            .allocate_local_field(space, size, self.state.id)?;
        self.note_field(space, field);
        Ok(field)
    }

    fn note_field(&self, space: FieldSpaceId, field: FieldId) {
        self.state
            .created_fields
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((space, field));
    }

    /// Frees a field and its instances in every tree over `space`.
    pub fn free_field(&self, space: FieldSpaceId, field: FieldId) -> Result<(), RuntimeError> {
        let trees = {
            let mut forest = self.write_forest();
            forest.free_field(space, field)?;
            forest.trees_of(space)
        };
        self.instances.drop_field(field, &trees);
        Ok(())
    }

    // ── logical regions ─────────────────────────────────────────────────

    /// Creates a new region tree over `(space, fields)`. The creating
    /// context holds every privilege on it.
    pub fn create_logical_region(&self, space: IndexSpaceId, fields: FieldSpaceId) -> Result<LogicalRegion, RuntimeError> {
        let region = self.write_forest().create_logical_region(space, fields)?;
        self.state
            .created_trees
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(region.tree());
        Ok(region)
    }

    /// Destroys a region tree and its instances.
    pub fn destroy_logical_region(&self, region: LogicalRegion) -> Result<(), RuntimeError> {
        self.write_forest().destroy_logical_region(region)?;
        self.state
            .analyzer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .forget_tree(region.tree());
        self.instances.drop_tree(region.tree());
        Ok(())
    }

    /// The partition of `region` induced by index partition `partition`.
    pub fn get_logical_partition(
        &self,
        region: LogicalRegion,
        partition: IndexPartitionId,
    ) -> Result<LogicalPartition, RuntimeError> {
        Ok(self.read_forest().get_logical_partition(region, partition)?)
    }

    /// Subregion of `partition` colored `color`.
    pub fn get_logical_subregion_by_color(
        &self,
        partition: LogicalPartition,
        color: &DomainPoint,
    ) -> Result<LogicalRegion, RuntimeError> {
        Ok(self
            .read_forest()
            .get_logical_subregion_by_color(partition, color)?)
    }

    /// Region `partition` divides.
    pub fn get_parent_logical_region(&self, partition: LogicalPartition) -> Result<LogicalRegion, RuntimeError> {
        Ok(self.read_forest().get_parent_logical_region(partition)?)
    }

    /// Point set of a region.
    pub fn region_domain(&self, region: &LogicalRegion) -> Result<IndexSet, RuntimeError> {
        Ok(self.read_forest().region_domain(region)?.clone())
    }

    /// Runs `f` against the region forest under a read lock.
    pub fn with_forest<R>(&self, f: impl FnOnce(&RegionForest) -> R) -> R {
        f(&self.read_forest())
    }

    // ── phase barriers and collectives ──────────────────────────────────

    /// Creates a phase barrier expecting `arrivals` per generation.
    ///
    /// In a replicated context every shard receives the same barrier.
    pub fn create_phase_barrier(&self, arrivals: u32) -> Result<PhaseBarrier, RuntimeError> {
        let key = self.shard_state().map(|s| s.next_barrier_key());
        Ok(self.rt.sealed().barriers.create(arrivals, None, key)?)
    }

    /// Creates a dynamic collective folding arrivals with `redop`.
    pub fn create_dynamic_collective(
        &self,
        arrivals: u32,
        redop: ReductionOpId,
    ) -> Result<DynamicCollective, RuntimeError> {
        let key = self.shard_state().map(|s| s.next_barrier_key());
        Ok(self
            .rt
            .sealed()
            .barriers
            .create_collective(arrivals, redop, key)?)
    }

    /// Destroys a barrier; only shard 0 acts in a replicated context.
    pub fn destroy_phase_barrier(&self, barrier: PhaseBarrier) -> Result<(), RuntimeError> {
        if !self.is_origin_shard() {
            return Ok(());
        }
        Ok(self.rt.sealed().barriers.destroy(barrier)?)
    }

    /// Whether the barrier still has usable generations.
    pub fn phase_barrier_exists(&self, barrier: PhaseBarrier) -> bool {
        self.rt.sealed().barriers.exists(barrier)
    }

    /// Arrives `count` times at `barrier`. In a replicated context the
    /// arrival is made once, by shard 0.
    pub fn arrive_barrier(&self, barrier: PhaseBarrier, count: u32) -> Result<(), RuntimeError> {
        if !self.is_origin_shard() {
            return Ok(());
        }
        Ok(self.rt.sealed().barriers.arrive(barrier, count)?)
    }

    /// Arrives at `collective` contributing `value`.
    pub fn arrive_collective(&self, collective: DynamicCollective, value: &[u8], count: u32) -> Result<(), RuntimeError> {
        if !self.is_origin_shard() {
            return Ok(());
        }
        Ok(self
            .rt
            .sealed()
            .barriers
            .arrive_value(collective, Some(value), count)?)
    }

    /// Event triggered when the handle's generation completes.
    pub fn barrier_event(&self, barrier: PhaseBarrier) -> Result<Event, RuntimeError> {
        Ok(self.rt.sealed().barriers.event(barrier)?)
    }

    /// Blocks until the handle's generation completes.
    pub fn wait_barrier(&self, barrier: PhaseBarrier) -> Result<(), RuntimeError> {
        self.barrier_event(barrier)?.wait();
        Ok(())
    }

    /// Folded value of the collective's generation.
    pub fn collective_result(&self, collective: DynamicCollective) -> Result<Future, RuntimeError> {
        Ok(self.rt.sealed().barriers.collective_result(collective)?)
    }

    // ── reservations ────────────────────────────────────────────────────

    /// Creates a reservation.
    pub fn create_reservation(&self) -> Reservation {
        let key = self.shard_state().map(|s| s.next_reservation_key());
        self.rt.reservations.create(key)
    }

    /// Event triggered once `reservation` is held in `mode`. In a
    /// replicated context only shard 0 takes the lock.
    pub fn acquire_reservation(&self, reservation: Reservation, mode: LockMode) -> Result<Event, RuntimeError> {
        if !self.is_origin_shard() {
            return Ok(Event::no_event());
        }
        Ok(self.rt.reservations.acquire(reservation, mode)?)
    }

    /// Releases a reservation held in `mode`.
    pub fn release_reservation(&self, reservation: Reservation, mode: LockMode) -> Result<(), RuntimeError> {
        if !self.is_origin_shard() {
            return Ok(());
        }
        Ok(self.rt.reservations.release(reservation, mode)?)
    }

    // ── futures ─────────────────────────────────────────────────────────

    /// Reduces every bound point of `map` with `redop`. Empty points are
    /// skipped; a failed point fails the reduction.
    ///
    /// `Ordered` folds in point order and is deterministic for any operator.
    /// `Unordered` requires a commutative operator; in a replicated context
    /// each shard folds its own points and the partials are combined by an
    /// all-reduce, so every shard must make the same call.
    pub fn reduce_future_map(&self, map: &FutureMap, redop: ReductionOpId, mode: ReduceMode) -> Result<Future, RuntimeError> {
        let sealed = self.rt.sealed();
        let op = sealed
            .reductions
            .get(redop)
            .ok_or(RuntimeError::UnknownRegistration {
                kind: "reduction operator",
                id: redop.value(),
            })?;
        if mode == ReduceMode::Unordered && !op.is_commutative() {
            return Err(ReplicationError::NonCommutativeUnordered(redop).into());
        }
        let shard = self.shard_state().filter(|_| mode == ReduceMode::Unordered);
        let mut acc = op.identity();
        for (point, future) in map.iter() {
            if shard.is_some() && !map.is_local(point) {
                continue;
            }
            future.event().wait();
            match future.peek() {
                Some(Ok(value)) => op.fold(&mut acc, &value),
                Some(Err(FutureError::Empty)) => {}
                Some(Err(err)) => return Err(err.into()),
                None => return Err(FutureError::Poisoned(format!("point {point} never bound")).into()),
            }
        }
        if let Some(shard) = shard {
            acc = shard.all_reduce(acc, op.as_ref())?;
        }
        Ok(Future::from_value(acc))
    }

    // ── lifecycle ───────────────────────────────────────────────────────

    /// Blocks until every operation issued so far has finished.
    pub fn wait_all(&self) {
        loop {
            let pending = self
                .state
                .ops
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pending_events();
            if pending.is_empty() {
                break;
            }
            for event in pending {
                event.wait();
            }
        }
    }

    /// Activity counters.
    pub fn stats(&self) -> ContextStats {
        let committed = self
            .state
            .ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .committed();
        self.state.counters.snapshot(committed)
    }

    /// Operations `op` was ordered after, ascending. `None` for unknown
    /// operations and for ones committed more than a window of operations ago.
    pub fn dependences(&self, op: OpId) -> Option<Vec<OpId>> {
        self.state
            .ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dependences(op)
    }

    /// Current state of an in-flight operation; `None` once committed (or
    /// never issued here).
    pub fn op_state(&self, op: OpId) -> Option<OpState> {
        self.state
            .ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state(op)
    }

    /// Errors raised by deferred work (barrier arrivals, copies, mapping)
    /// since the last call.
    pub fn take_errors(&self) -> Vec<RuntimeError> {
        std::mem::take(&mut *self.state.errors.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn record_error(&self, op: OpId, err: RuntimeError) {
        tracing::error!(
            ctx = self.state.id.value(),
            op = op.value(),
            class = ?err.class(),
            %err,
            "operation error"
        );
        self.state
            .errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(err);
    }

    pub(crate) fn log_summary(&self) {
        telemetry::summary(self.state.id, &self.stats());
    }

    /// Ends a task's child context: unmaps leftover inline mappings, waits
    /// for its operations and frees its local fields.
    pub(crate) fn close(&self) {
        let leftover: Vec<InlineMapping> = std::mem::take(&mut *self.state.inline.lock().unwrap_or_else(PoisonError::into_inner));
        for mapping in leftover {
            mapping.region.unmap();
            self.finish(&mapping.issued, OpState::Completed);
        }
        self.wait_all();
        let freed = {
            let mut forest = self.write_forest();
            forest
                .free_local_fields(self.state.id)
                .into_iter()
                .map(|(space, field)| (field, forest.trees_of(space)))
                .collect::<Vec<_>>()
        };
        for (field, trees) in &freed {
            self.instances.drop_field(*field, trees);
        }
        self.log_summary();
    }
}
