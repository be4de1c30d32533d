// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]

mod common;

use bytes::Bytes;
use common::{label, runtime_with_tasks, FAIL, NOOP, SUM, WRITE};
use tessera_core::{FillLauncher, Predicate, RuntimeConfig, TaskLauncher};
use tessera_dry_tests::{RegionFixture, RequirementBuilder, TimelineRecorder};

fn flag(value: u8) -> TaskLauncher {
    TaskLauncher::new(NOOP).with_args(Bytes::copy_from_slice(&[value]))
}

#[test]
fn false_predicate_skips_the_body_and_leaves_data_alone() {
    let timeline = TimelineRecorder::new();
    let rt = runtime_with_tasks(RuntimeConfig::default().with_workers(2), &timeline);
    let ctx = rt.top_level_context();
    let fx = RegionFixture::new(&ctx, 10, 1);
    let write = |value: u64| {
        TaskLauncher::new(WRITE)
            .with_pod_args(&value)
            .add_requirement(RequirementBuilder::region(fx.region).read_write().field(fx.field(0)).build())
    };

    ctx.execute_task(write(2)).unwrap().get().unwrap();
    let skipped = ctx.execute_task(write(9).with_predicate(Predicate::False)).unwrap();
    let sum = ctx
        .execute_task(
            TaskLauncher::new(SUM).add_requirement(RequirementBuilder::region(fx.region).field(fx.field(0)).build()),
        )
        .unwrap();

    assert_eq!(sum.get_as::<u64>().unwrap(), 20);
    assert!(skipped.is_empty());
    assert!(!timeline.ran(&label(&skipped)));
    ctx.wait_all();
    assert_eq!(ctx.stats().resolved_false, 1);
    assert_eq!(ctx.stats().failed, 0);
}

#[test]
fn future_predicates_combine() {
    let timeline = TimelineRecorder::new();
    let rt = runtime_with_tasks(RuntimeConfig::default().with_workers(2), &timeline);
    let ctx = rt.top_level_context();
    let yes = Predicate::from_future(ctx.execute_task(flag(1)).unwrap());
    let no = Predicate::from_future(ctx.execute_task(flag(0)).unwrap());

    let ran = ctx.execute_task(flag(7).with_predicate(yes.clone())).unwrap();
    let skipped = ctx.execute_task(flag(7).with_predicate(no.clone())).unwrap();
    let negated = ctx.execute_task(flag(7).with_predicate(no.clone().negate().and(yes.clone()))).unwrap();
    let either = ctx.execute_task(flag(7).with_predicate(no.or(yes.negate()))).unwrap();

    assert_eq!(ran.get().unwrap().as_ref(), &[7]);
    assert!(skipped.is_empty());
    assert_eq!(negated.get().unwrap().as_ref(), &[7]);
    assert!(either.is_empty());
    assert!(timeline.ran(&label(&ran)));
    assert!(!timeline.ran(&label(&either)));
}

#[test]
fn failed_predicate_futures_count_as_false() {
    let timeline = TimelineRecorder::new();
    let rt = runtime_with_tasks(RuntimeConfig::default().with_workers(2), &timeline);
    let ctx = rt.top_level_context();
    let broken = ctx.execute_task(TaskLauncher::new(FAIL)).unwrap();
    assert!(broken.get().is_err());

    let guarded = ctx
        .execute_task(flag(1).with_predicate(Predicate::from_future(broken)))
        .unwrap();
    assert!(guarded.is_empty());
    ctx.wait_all();
    assert_eq!(ctx.stats().failed, 1);
    assert_eq!(ctx.stats().resolved_false, 1);
}

#[test]
fn skipped_operations_still_arrive_at_barriers() {
    let timeline = TimelineRecorder::new();
    let rt = runtime_with_tasks(RuntimeConfig::default().with_workers(2), &timeline);
    let ctx = rt.top_level_context();
    let fx = RegionFixture::new(&ctx, 4, 1);
    let barrier = ctx.create_phase_barrier(2).unwrap();

    let task = ctx
        .execute_task(flag(1).with_predicate(Predicate::False).arrive_at(barrier))
        .unwrap();
    let fill = ctx
        .fill_fields(
            FillLauncher::with_pod(fx.region, fx.region, &5u64)
                .add_field(fx.field(0))
                .with_predicate(Predicate::False)
                .arrive_at(barrier),
        )
        .unwrap();

    ctx.wait_barrier(barrier).unwrap();
    assert!(task.is_empty());
    assert!(!fill.wait());
    let sum = ctx
        .execute_task(
            TaskLauncher::new(SUM).add_requirement(RequirementBuilder::region(fx.region).field(fx.field(0)).build()),
        )
        .unwrap();
    assert_eq!(sum.get_as::<u64>().unwrap(), 0);
}
