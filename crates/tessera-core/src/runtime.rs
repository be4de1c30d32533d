// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! The runtime: registries, worker processors and top-level contexts.
//!
//! Tasks, functors and operators are registered up front. Creating the
//! first context seals the registries; later registrations fail with
//! [`RuntimeError::RegistrationClosed`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tessera_config::RuntimeConfig;

use crate::context::Context;
use crate::error::{ReplicationError, RuntimeError, TaskError};
use crate::ident::{ContextId, OpId, ProjectionId, ReductionOpId, SerdezId, ShardId, ShardingId, TaskId};
use crate::mapper::{DefaultMapper, Mapper};
use crate::projection::{ProjectionFunctor, ProjectionRegistry};
use crate::reduction::{ReductionOp, ReductionRegistry};
use crate::replication::sharding::ShardingFunctor;
use crate::replication::transport::Transport;
use crate::replication::{InMemoryTransport, ShardState, ShardingRegistry};
use crate::serdez::{SerdezOp, SerdezRegistry};
use crate::sync::{BarrierTable, ReservationTable};
use crate::task::{TaskContext, TaskRegistry, TaskValue};
use crate::worker::WorkerPool;

#[derive(Default)]
struct Registry {
    tasks: TaskRegistry,
    projections: ProjectionRegistry,
    shardings: ShardingRegistry,
    serdez: SerdezRegistry,
    reductions: ReductionRegistry,
}

/// Registries frozen when the first context is created.
pub(crate) struct Sealed {
    pub(crate) tasks: TaskRegistry,
    pub(crate) projections: ProjectionRegistry,
    pub(crate) shardings: ShardingRegistry,
    pub(crate) serdez: SerdezRegistry,
    pub(crate) reductions: Arc<ReductionRegistry>,
    pub(crate) barriers: BarrierTable,
}

/// State shared by the runtime handle and every context.
pub(crate) struct RuntimeShared {
    pub(crate) config: RuntimeConfig,
    pub(crate) mapper: Arc<dyn Mapper>,
    pub(crate) pool: WorkerPool,
    pub(crate) reservations: Arc<ReservationTable>,
    pending: Mutex<Option<Registry>>,
    sealed: OnceLock<Sealed>,
    next_ctx: AtomicU64,
    next_op: AtomicU64,
    next_group: AtomicU32,
}

impl RuntimeShared {
    /// The sealed registries; seals them on first call.
    pub(crate) fn sealed(&self) -> &Sealed {
        self.sealed.get_or_init(|| {
            let reg = self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .unwrap_or_default();
            tracing::debug!(tasks = reg.tasks.len(), "registrations sealed");
            let reductions = Arc::new(reg.reductions);
            Sealed {
                tasks: reg.tasks,
                projections: reg.projections,
                shardings: reg.shardings,
                serdez: reg.serdez,
                barriers: BarrierTable::new(self.config.max_barrier_generations, Arc::clone(&reductions)),
                reductions,
            }
        })
    }

    fn register<F>(&self, f: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(&mut Registry) -> Result<(), RuntimeError>,
    {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let reg = pending.as_mut().ok_or(RuntimeError::RegistrationClosed)?;
        f(reg)
    }

    pub(crate) fn next_op(&self) -> OpId {
        OpId::from_raw(self.next_op.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_ctx(&self) -> ContextId {
        ContextId::from_raw(self.next_ctx.fetch_add(1, Ordering::Relaxed))
    }
}

/// A running Tessera instance.
///
/// Dropping the runtime stops its processors once their queues drain;
/// contexts must not be used afterwards.
pub struct Runtime {
    shared: Arc<RuntimeShared>,
}

impl core::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Starts a runtime with the [`DefaultMapper`].
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::with_mapper(config, Arc::new(DefaultMapper))
    }

    /// Starts a runtime consulting `mapper`.
    pub fn with_mapper(config: RuntimeConfig, mapper: Arc<dyn Mapper>) -> Result<Self, RuntimeError> {
        config.validate()?;
        let pool = WorkerPool::new(config.workers)?;
        tracing::info!(
            workers = config.workers,
            shards = config.shards,
            resilience = config.resilience,
            "runtime started"
        );
        Ok(Self {
            shared: Arc::new(RuntimeShared {
                config,
                mapper,
                pool,
                reservations: Arc::new(ReservationTable::default()),
                pending: Mutex::new(Some(Registry::default())),
                sealed: OnceLock::new(),
                next_ctx: AtomicU64::new(1),
                next_op: AtomicU64::new(1),
                next_group: AtomicU32::new(0),
            }),
        })
    }

    /// Configuration the runtime was started with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Number of worker processors.
    pub fn processors(&self) -> usize {
        self.shared.pool.processors()
    }

    /// Registers a task body under `id` and `name`.
    pub fn register_task<F>(&self, id: TaskId, name: &'static str, body: F) -> Result<(), RuntimeError>
    where
        F: Fn(&mut TaskContext) -> Result<TaskValue, TaskError> + Send + Sync + 'static,
    {
        self.shared
            .register(|reg| reg.tasks.register(id, name, Arc::new(body)))
    }

    /// Registers a projection functor.
    pub fn register_projection(&self, id: ProjectionId, functor: Arc<dyn ProjectionFunctor>) -> Result<(), RuntimeError> {
        self.shared
            .register(|reg| reg.projections.register(id, functor))
    }

    /// Registers a sharding functor.
    pub fn register_sharding(&self, id: ShardingId, functor: Arc<dyn ShardingFunctor>) -> Result<(), RuntimeError> {
        self.shared.register(|reg| reg.shardings.register(id, functor))
    }

    /// Registers a reduction operator.
    pub fn register_reduction(&self, id: ReductionOpId, op: Arc<dyn ReductionOp>) -> Result<(), RuntimeError> {
        self.shared.register(|reg| reg.reductions.register(id, op))
    }

    /// Registers a serialize/deserialize operator.
    pub fn register_serdez(&self, id: SerdezId, op: Arc<dyn SerdezOp>) -> Result<(), RuntimeError> {
        self.shared.register(|reg| reg.serdez.register(id, op))
    }

    /// A fresh top-level context with its own region forest. Seals the
    /// registries.
    pub fn top_level_context(&self) -> Context {
        Context::top_level(Arc::clone(&self.shared), None, None)
    }

    /// Runs `program` on `shards` control-replicated shards and returns each
    /// shard's result in shard order.
    ///
    /// Every shard gets its own top-level context and region forest; all
    /// shards share instance storage. After `program` returns, each shard
    /// waits for its operations, then shard 0 checks that every shard
    /// issued the same launches.
    pub fn replicate<R, F>(&self, shards: usize, program: F) -> Result<Vec<R>, RuntimeError>
    where
        F: Fn(&Context) -> R + Sync,
        R: Send,
    {
        if shards == 0 {
            return Err(ReplicationError::NoShards.into());
        }
        let group = self.shared.next_group.fetch_add(1, Ordering::Relaxed);
        let safe = self.shared.config.safe_control_replication;
        let program = &program;
        let first = Context::top_level(Arc::clone(&self.shared), None, None);
        let instances = first.instances();
        drop(first);
        tracing::debug!(group, shards, safe, "replicated run starting");

        let results: Vec<Result<R, RuntimeError>> = std::thread::scope(|s| {
            let mut runs = Vec::with_capacity(shards);
            for transport in InMemoryTransport::mesh(shards) {
                let transport: Arc<dyn Transport> = Arc::new(transport);
                let state = Arc::new(ShardState::new(transport, group, safe));
                let router = Arc::clone(&state);
                s.spawn(move || router.route());
                let ctx = Context::top_level(Arc::clone(&self.shared), Some(Arc::clone(&state)), Some(Arc::clone(&instances)));
                runs.push(s.spawn(move || run_shard(&ctx, &state, program)));
            }
            runs.into_iter()
                .enumerate()
                .map(|(i, run)| {
                    run.join()
                        .unwrap_or_else(|_| Err(ReplicationError::ShardPanicked(ShardId::from_raw(i as u32)).into()))
                })
                .collect()
        });
        results.into_iter().collect()
    }
}

fn run_shard<R, F>(ctx: &Context, state: &ShardState, program: &F) -> Result<R, RuntimeError>
where
    F: Fn(&Context) -> R,
{
    let shard = state.shard();
    let _span = tracing::debug_span!("shard", shard = shard.value()).entered();
    let outcome = catch_unwind(AssertUnwindSafe(|| program(ctx)));
    if outcome.is_err() {
        tracing::error!(shard = shard.value(), "shard program panicked");
    }
    ctx.wait_all();
    let finished = state.finish();
    if let Err(err) = state.shutdown() {
        tracing::warn!(shard = shard.value(), %err, "shard router did not acknowledge shutdown");
    }
    ctx.log_summary();
    let value = outcome.map_err(|_| ReplicationError::ShardPanicked(shard))?;
    finished?;
    Ok(value)
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shared.pool.shutdown();
    }
}
