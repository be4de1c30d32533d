// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]
//! Failure propagation, resilient replay, remapping and privilege checks.

mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::{label, register_tasks, runtime_with_tasks, FAIL, FLAKY, NOOP, SUM, WRITE};
use tessera_core::{
    AnalysisError, FutureError, MapperError, RuntimeConfig, RuntimeError, TaskContext, TaskError,
    TaskId, TaskLauncher,
};
use tessera_dry_tests::{
    init_test_logging, runtime_with_mapper, RegionFixture, RemapMapper, RequirementBuilder,
    TimelineRecorder,
};

#[test]
fn failures_poison_dependents_but_not_bystanders() {
    let timeline = TimelineRecorder::new();
    let rt = runtime_with_tasks(RuntimeConfig::default().with_workers(2), &timeline);
    let ctx = rt.top_level_context();
    let fx = RegionFixture::new(&ctx, 8, 1);
    let other = RegionFixture::new(&ctx, 8, 1);

    let broken = ctx
        .execute_task(
            TaskLauncher::new(FAIL)
                .add_requirement(RequirementBuilder::region(fx.region).read_write().field(fx.field(0)).build()),
        )
        .unwrap();
    let reader = ctx
        .execute_task(
            TaskLauncher::new(SUM).add_requirement(RequirementBuilder::region(fx.region).field(fx.field(0)).build()),
        )
        .unwrap();
    let bystander = ctx
        .execute_task(
            TaskLauncher::new(SUM)
                .add_requirement(RequirementBuilder::region(other.region).field(other.field(0)).build()),
        )
        .unwrap();

    assert!(matches!(broken.get(), Err(FutureError::Poisoned(reason)) if reason.contains("deliberate")));
    assert!(matches!(reader.get(), Err(FutureError::Poisoned(_))));
    assert!(!timeline.ran(&label(&reader)), "poisoned tasks never run");
    assert_eq!(bystander.get_as::<u64>().unwrap(), 0);
    assert!(broken.event().is_poisoned());

    ctx.wait_all();
    assert_eq!(ctx.stats().failed, 2);
    assert_eq!(ctx.stats().committed, ctx.stats().issued);
}

#[test]
fn fences_pass_after_failures() {
    let timeline = TimelineRecorder::new();
    let rt = runtime_with_tasks(RuntimeConfig::default().with_workers(2), &timeline);
    let ctx = rt.top_level_context();
    let broken = ctx.execute_task(TaskLauncher::new(FAIL)).unwrap();
    let slow = ctx.execute_task(TaskLauncher::new(NOOP).with_pod_args(&20u64)).unwrap();

    let fence = ctx.execute_fence().unwrap();
    let after = ctx.execute_task(TaskLauncher::new(NOOP)).unwrap();

    assert!(fence.get().unwrap().is_empty());
    assert!(after.get().is_ok());
    assert!(broken.get().is_err());
    assert!(timeline.finished_before(&label(&slow), &label(&after)));
}

#[test]
fn resilient_tasks_replay_until_they_succeed() {
    let timeline = TimelineRecorder::new();
    let rt = runtime_with_tasks(RuntimeConfig::default().with_workers(1).with_resilience(2), &timeline);
    let ctx = rt.top_level_context();

    let flaky = ctx.execute_task(TaskLauncher::new(FLAKY).with_pod_args(&2u32)).unwrap();
    assert_eq!(flaky.get_as::<u32>().unwrap(), 2);
    let op = label(&flaky);
    assert!(timeline.finished_before(&format!("{op}#0"), &format!("{op}#1")));
    assert!(timeline.finished_before(&format!("{op}#1"), &format!("{op}#2")));

    let hopeless = ctx.execute_task(TaskLauncher::new(FLAKY).with_pod_args(&3u32)).unwrap();
    assert!(hopeless.get().is_err());
    ctx.wait_all();
    assert_eq!(ctx.stats().replays, 4);
    assert_eq!(ctx.stats().failed, 1);
}

const BUMP: TaskId = TaskId::from_raw(21);
const SCRIBBLE: TaskId = TaskId::from_raw(22);

/// Adds one to every point, then fails on the first attempt.
fn bump(tc: &mut TaskContext) -> Result<Bytes, TaskError> {
    let region = tc.region(0)?;
    let field = region.fields().into_iter().next().ok_or_else(|| TaskError::Failed("no field".into()))?;
    for point in region.points().collect::<Vec<_>>() {
        let v = region.read_as::<u64>(field, &point)?;
        region.write_as(field, &point, v + 1)?;
    }
    if tc.attempt() == 0 {
        return Err(TaskError::Failed("lost the node".into()));
    }
    Ok(Bytes::new())
}

/// First attempt writes 9 everywhere and fails; the replay writes 5 at the first point only.
fn scribble(tc: &mut TaskContext) -> Result<Bytes, TaskError> {
    let region = tc.region(0)?;
    let field = region.fields().into_iter().next().ok_or_else(|| TaskError::Failed("no field".into()))?;
    let points: Vec<_> = region.points().collect();
    if tc.attempt() == 0 {
        for point in &points {
            region.write_as(field, point, 9u64)?;
        }
        return Err(TaskError::Failed("lost the node".into()));
    }
    region.write_as(field, &points[0], 5u64)?;
    Ok(Bytes::new())
}

#[test]
fn replays_start_from_the_regions_as_they_were() {
    let timeline = TimelineRecorder::new();
    let rt = runtime_with_tasks(RuntimeConfig::default().with_workers(2).with_resilience(1), &timeline);
    rt.register_task(BUMP, "bump", bump).unwrap();
    rt.register_task(SCRIBBLE, "scribble", scribble).unwrap();
    let ctx = rt.top_level_context();
    let fx = RegionFixture::new(&ctx, 4, 1);
    let sum = || {
        ctx.execute_task(
            TaskLauncher::new(SUM).add_requirement(RequirementBuilder::region(fx.region).field(fx.field(0)).build()),
        )
        .unwrap()
        .get_as::<u64>()
        .unwrap()
    };

    ctx.execute_task(
        TaskLauncher::new(BUMP)
            .add_requirement(RequirementBuilder::region(fx.region).read_write().field(fx.field(0)).build()),
    )
    .unwrap()
    .get()
    .unwrap();
    assert_eq!(sum(), 4, "each point incremented once");

    ctx.execute_task(
        TaskLauncher::new(SCRIBBLE)
            .add_requirement(RequirementBuilder::region(fx.region).write_discard().field(fx.field(0)).build()),
    )
    .unwrap()
    .get()
    .unwrap();
    assert_eq!(sum(), 5, "discarded points read as zero after the replay");
    ctx.wait_all();
    assert_eq!(ctx.stats().replays, 2);
}

#[test]
fn without_resilience_the_first_failure_is_final() {
    let timeline = TimelineRecorder::new();
    let rt = runtime_with_tasks(RuntimeConfig::default().with_workers(1), &timeline);
    let ctx = rt.top_level_context();
    let flaky = ctx.execute_task(TaskLauncher::new(FLAKY).with_pod_args(&1u32)).unwrap();
    assert!(flaky.get().is_err());
    assert!(!timeline.ran(&format!("{}#1", label(&flaky))));
    ctx.wait_all();
    assert_eq!(ctx.stats().replays, 0);
}

#[test]
fn remap_requests_retry_within_budget() {
    init_test_logging();
    let timeline = TimelineRecorder::new();
    let mapper = RemapMapper::new(2);
    let rt = runtime_with_mapper(1, Arc::new(mapper.clone()));
    register_tasks(&rt, &timeline);
    let ctx = rt.top_level_context();

    let task = ctx.execute_task(TaskLauncher::new(NOOP)).unwrap();
    task.get().unwrap();
    assert_eq!(mapper.attempts(common::op_of(&task)), 3);
    ctx.wait_all();
    assert_eq!(ctx.stats().remaps, 2);
}

#[test]
fn remapping_forever_exhausts_attempts() {
    init_test_logging();
    let timeline = TimelineRecorder::new();
    let rt = runtime_with_mapper(1, Arc::new(RemapMapper::new(u32::MAX)));
    register_tasks(&rt, &timeline);
    let ctx = rt.top_level_context();

    let task = ctx.execute_task(TaskLauncher::new(NOOP)).unwrap();
    assert!(task.get().is_err());
    let errors = ctx.take_errors();
    assert!(errors.iter().any(|e| matches!(
        e,
        RuntimeError::Mapper(MapperError::AttemptsExhausted { attempts: 5, .. })
    )));
    assert!(ctx.take_errors().is_empty(), "errors are drained");
}

#[test]
fn requirements_of_one_task_may_not_interfere() {
    let timeline = TimelineRecorder::new();
    let rt = runtime_with_tasks(RuntimeConfig::default().with_workers(1), &timeline);
    let ctx = rt.top_level_context();
    let fx = RegionFixture::new(&ctx, 8, 2);
    let rw = |field| RequirementBuilder::region(fx.region).read_write().field(field).build();

    let err = ctx
        .execute_task(TaskLauncher::new(NOOP).add_requirement(rw(fx.field(0))).add_requirement(rw(fx.field(0))))
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Analysis(AnalysisError::InterferingRequirements { first: 0, second: 1 })
    ));
    // Disjoint fields are fine.
    ctx.execute_task(TaskLauncher::new(NOOP).add_requirement(rw(fx.field(0))).add_requirement(rw(fx.field(1))))
        .unwrap()
        .get()
        .unwrap();
}

const PARENT: TaskId = TaskId::from_raw(20);

#[test]
fn subtasks_cannot_escalate_privileges() {
    init_test_logging();
    let timeline = TimelineRecorder::new();
    let rt = tessera_dry_tests::runtime(2);
    register_tasks(&rt, &timeline);
    rt.register_task(PARENT, "parent", |tc| {
        let region = tc.region(0)?;
        let held = region.region();
        let field = region.fields().into_iter().next().ok_or_else(|| TaskError::Failed("no field".into()))?;
        let child = tc.context();

        let escalated = child.execute_task(
            TaskLauncher::new(WRITE)
                .with_pod_args(&1u64)
                .add_requirement(RequirementBuilder::region(held).read_write().field(field).build()),
        );
        let refused = matches!(
            escalated,
            Err(RuntimeError::Analysis(AnalysisError::PrivilegeNotHeld { index: 0, .. }))
        );
        let sum = child
            .execute_task(TaskLauncher::new(SUM).add_requirement(RequirementBuilder::region(held).field(field).build()))?
            .get_as::<u64>()?;
        let mut out = vec![u8::from(refused)];
        out.extend_from_slice(&sum.to_le_bytes());
        Ok(Bytes::from(out))
    })
    .unwrap();
    let ctx = rt.top_level_context();
    let fx = RegionFixture::new(&ctx, 4, 1);
    ctx.execute_task(
        TaskLauncher::new(WRITE)
            .with_pod_args(&3u64)
            .add_requirement(RequirementBuilder::region(fx.region).read_write().field(fx.field(0)).build()),
    )
    .unwrap();

    let out = ctx
        .execute_task(
            TaskLauncher::new(PARENT).add_requirement(RequirementBuilder::region(fx.region).field(fx.field(0)).build()),
        )
        .unwrap()
        .get()
        .unwrap();
    assert_eq!(out[0], 1, "write under a read-only parent was accepted");
    assert_eq!(u64::from_le_bytes(out[1..9].try_into().unwrap()), 12);
}
