// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tessera_core::{
    DefaultMapper, Future, InstanceLayout, MappableInfo, Mapper, MapperError, OpId, ProcessorId,
    Runtime, RuntimeConfig, TaskContext, TaskError, TaskId,
};
use tessera_dry_tests::{init_test_logging, runtime_with_config, TimelineRecorder};

/// Writes the `u64` argument into every point of every field of region 0.
pub const WRITE: TaskId = TaskId::from_raw(1);
/// Sums field 0 of region 0 and returns the `u64` total.
pub const SUM: TaskId = TaskId::from_raw(2);
/// Reduces the `u64` argument into every point of region 0.
pub const REDUCE: TaskId = TaskId::from_raw(3);
/// Sleeps for the `u64` argument in milliseconds (if any) and returns it.
pub const NOOP: TaskId = TaskId::from_raw(4);
/// Always fails.
pub const FAIL: TaskId = TaskId::from_raw(5);
/// Fails while the attempt number is below the `u32` argument.
pub const FLAKY: TaskId = TaskId::from_raw(6);
/// Writes the launch point's first coordinate into region 0.
pub const WRITE_POINT: TaskId = TaskId::from_raw(7);

/// How long writers hold their regions, to widen ordering windows.
pub const HOLD: Duration = Duration::from_millis(15);

/// Span label of the task body that produced `future`.
pub fn label(future: &Future) -> String {
    future.op().map(|op| op.to_string()).unwrap_or_default()
}

fn body_label(tc: &TaskContext) -> String {
    match tc.point() {
        Some(p) => format!("{}@{p}", tc.op()),
        None => tc.op().to_string(),
    }
}

fn arg_u64(tc: &TaskContext) -> u64 {
    tc.args_as::<u64>().unwrap_or(0)
}

/// Runtime with every test task registered, recording spans into `timeline`.
pub fn runtime_with_tasks(config: RuntimeConfig, timeline: &TimelineRecorder) -> Runtime {
    init_test_logging();
    let rt = runtime_with_config(config);
    register_tasks(&rt, timeline);
    rt
}

/// Registers the test tasks on `rt`.
#[allow(clippy::expect_used)]
pub fn register_tasks(rt: &Runtime, timeline: &TimelineRecorder) {
    let t = timeline.clone();
    rt.register_task(WRITE, "write", move |tc| {
        let label = body_label(tc);
        t.span(label, || -> Result<Bytes, TaskError> {
            let value = arg_u64(tc);
            let region = tc.region(0)?;
            for field in region.fields() {
                for point in region.points().collect::<Vec<_>>() {
                    region.write_as(field, &point, value)?;
                }
            }
            thread::sleep(HOLD);
            Ok(Bytes::new())
        })
    })
    .expect("register write");

    let t = timeline.clone();
    rt.register_task(SUM, "sum", move |tc| {
        let label = body_label(tc);
        t.span(label, || -> Result<Bytes, TaskError> {
            let region = tc.region(0)?;
            let field = region.fields().into_iter().next().ok_or_else(|| TaskError::Failed("no field".into()))?;
            let mut total = 0u64;
            for point in region.points().collect::<Vec<_>>() {
                total = total.wrapping_add(region.read_as::<u64>(field, &point)?);
            }
            Ok(Bytes::copy_from_slice(&total.to_le_bytes()))
        })
    })
    .expect("register sum");

    let t = timeline.clone();
    rt.register_task(REDUCE, "reduce", move |tc| {
        let label = body_label(tc);
        t.span(label, || -> Result<Bytes, TaskError> {
            let value = arg_u64(tc);
            let region = tc.region(0)?;
            for field in region.fields() {
                for point in region.points().collect::<Vec<_>>() {
                    region.reduce_as(field, &point, value)?;
                }
            }
            thread::sleep(HOLD);
            Ok(Bytes::new())
        })
    })
    .expect("register reduce");

    let t = timeline.clone();
    rt.register_task(NOOP, "noop", move |tc| {
        let label = body_label(tc);
        t.span(label, || -> Result<Bytes, TaskError> {
            let ms = arg_u64(tc);
            if ms > 0 {
                thread::sleep(Duration::from_millis(ms));
            }
            Ok(Bytes::copy_from_slice(tc.args()))
        })
    })
    .expect("register noop");

    let t = timeline.clone();
    rt.register_task(FAIL, "fail", move |tc| {
        let label = body_label(tc);
        t.span(label, || -> Result<Bytes, TaskError> { Err(TaskError::Failed("deliberate failure".into())) })
    })
    .expect("register fail");

    let t = timeline.clone();
    rt.register_task(FLAKY, "flaky", move |tc| {
        let label = format!("{}#{}", body_label(tc), tc.attempt());
        t.span(label, || -> Result<Bytes, TaskError> {
            let fail_below = tc.args_as::<u32>().unwrap_or(0);
            if tc.attempt() < fail_below {
                return Err(TaskError::Failed(format!("attempt {} failed", tc.attempt())));
            }
            Ok(Bytes::copy_from_slice(&tc.attempt().to_le_bytes()))
        })
    })
    .expect("register flaky");

    let t = timeline.clone();
    rt.register_task(WRITE_POINT, "write_point", move |tc| {
        let label = body_label(tc);
        t.span(label, || -> Result<Bytes, TaskError> {
            let point = tc.point().ok_or_else(|| TaskError::Failed("not an index launch".into()))?;
            let value = u64::try_from(point.coord(0)).unwrap_or(0);
            let region = tc.region(0)?;
            for field in region.fields() {
                for p in region.points().collect::<Vec<_>>() {
                    region.write_as(field, &p, value)?;
                }
            }
            Ok(Bytes::copy_from_slice(&value.to_le_bytes()))
        })
    })
    .expect("register write_point");
}

/// Hands processors out round-robin so concurrent work never shares a
/// queue.
#[derive(Debug, Default)]
pub struct RoundRobinMapper {
    next: AtomicU32,
}

impl Mapper for RoundRobinMapper {
    fn select_processor(&self, _info: &MappableInfo, load: &[usize]) -> ProcessorId {
        let n = u32::try_from(load.len().max(1)).unwrap_or(1);
        ProcessorId::from_raw(self.next.fetch_add(1, Ordering::Relaxed) % n)
    }

    fn map_operation(&self, info: &MappableInfo, attempt: u32) -> Result<Vec<InstanceLayout>, MapperError> {
        DefaultMapper.map_operation(info, attempt)
    }

    fn select_must_epoch_processors(
        &self,
        tasks: &[MappableInfo],
        processors: usize,
    ) -> Result<Vec<ProcessorId>, MapperError> {
        DefaultMapper.select_must_epoch_processors(tasks, processors)
    }
}

/// Runtime with the round-robin mapper and the test tasks.
#[allow(clippy::expect_used)]
pub fn round_robin_runtime(workers: usize, timeline: &TimelineRecorder) -> Runtime {
    init_test_logging();
    let rt = Runtime::with_mapper(
        RuntimeConfig::default().with_workers(workers),
        Arc::new(RoundRobinMapper::default()),
    )
    .expect("runtime should start");
    register_tasks(&rt, timeline);
    rt
}

/// Sorted dependence list of `op`.
#[allow(clippy::expect_used)]
pub fn deps(ctx: &tessera_core::Context, op: OpId) -> Vec<OpId> {
    let mut deps = ctx.dependences(op).expect("operation was issued here");
    deps.sort();
    deps
}

/// Producer of `future`.
#[allow(clippy::expect_used)]
pub fn op_of(future: &Future) -> OpId {
    future.op().expect("future has a producer")
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}
