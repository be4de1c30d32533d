// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]
//! Fills, copies, inline mappings, output regions and partition operators.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use common::{label, register_tasks, runtime_with_tasks, SUM, WRITE};
use tessera_core::{
    CopyLauncher, DomainPoint, FieldId, FillLauncher, IndexSet, LogicalRegion, OutputRequirement,
    PartitionKind, Rect, ReduceOp, RuntimeConfig, SerdezId, SerdezOp, TaskError, TaskId,
    TaskLauncher, Transform,
};
use tessera_dry_tests::{init_test_logging, runtime, RegionFixture, RequirementBuilder, TimelineRecorder};

fn sum_of(ctx: &tessera_core::Context, region: LogicalRegion, parent: LogicalRegion, field: FieldId) -> u64 {
    ctx.execute_task(
        TaskLauncher::new(SUM).add_requirement(RequirementBuilder::region(region).parent(parent).field(field).build()),
    )
    .unwrap()
    .get_as::<u64>()
    .unwrap()
}

#[test]
fn fills_cover_exactly_their_region() {
    let timeline = TimelineRecorder::new();
    let rt = runtime_with_tasks(RuntimeConfig::default().with_workers(2), &timeline);
    let ctx = rt.top_level_context();
    let fx = RegionFixture::new(&ctx, 40, 2).partitioned(&ctx, 4);

    let piece = fx.piece(&ctx, 1);
    let done = ctx
        .fill_fields(FillLauncher::with_pod(piece, fx.region, &7u64).add_field(fx.field(0)))
        .unwrap();
    assert!(!done.wait());
    assert_eq!(sum_of(&ctx, fx.region, fx.region, fx.field(0)), 7 * 10);
    assert_eq!(sum_of(&ctx, piece, fx.region, fx.field(1)), 0);

    let wrong_width = FillLauncher::new(fx.region, fx.region, Bytes::from_static(&[1, 2, 3])).add_field(fx.field(0));
    assert!(ctx.fill_fields(wrong_width).is_err());
}

#[test]
fn copies_overwrite_and_reduction_copies_fold() {
    let timeline = TimelineRecorder::new();
    let rt = runtime_with_tasks(RuntimeConfig::default().with_workers(2), &timeline);
    let ctx = rt.top_level_context();
    let src = RegionFixture::new(&ctx, 10, 1);
    let dst = RegionFixture::new(&ctx, 10, 1);

    ctx.fill_fields(FillLauncher::with_pod(src.region, src.region, &4u64).add_field(src.field(0)))
        .unwrap();
    let read = || RequirementBuilder::region(src.region).field(src.field(0)).build();
    ctx.issue_copy(
        CopyLauncher::new().add_copy(
            read(),
            RequirementBuilder::region(dst.region).write_discard().field(dst.field(0)).build(),
        ),
    )
    .unwrap();
    assert_eq!(sum_of(&ctx, dst.region, dst.region, dst.field(0)), 40);

    let fold = || {
        CopyLauncher::new().add_copy(
            read(),
            RequirementBuilder::region(dst.region)
                .reduce(ReduceOp::SumU64.id())
                .field(dst.field(0))
                .build(),
        )
    };
    ctx.issue_copy(fold()).unwrap();
    ctx.issue_copy(fold()).unwrap();
    assert_eq!(sum_of(&ctx, dst.region, dst.region, dst.field(0)), 120);
}

/// Reverses bytes on the wire and counts how often it ran.
#[derive(Debug, Default)]
struct CountingSwap {
    calls: AtomicUsize,
}

impl SerdezOp for CountingSwap {
    fn serialize(&self, value: &[u8]) -> Vec<u8> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        value.iter().rev().copied().collect()
    }

    fn deserialize(&self, wire: &[u8]) -> Vec<u8> {
        wire.iter().rev().copied().collect()
    }
}

#[test]
fn serdez_fields_transfer_through_their_operator() {
    init_test_logging();
    let timeline = TimelineRecorder::new();
    let rt = runtime(2);
    register_tasks(&rt, &timeline);
    let swap = Arc::new(CountingSwap::default());
    let id = SerdezId::from_raw(1);
    rt.register_serdez(id, swap.clone()).unwrap();
    let ctx = rt.top_level_context();

    let space = ctx.create_index_space(IndexSet::range(0, 5));
    let fs = ctx.create_field_space();
    let field = ctx.allocate_field_with_serdez(fs, 8, id).unwrap();
    assert!(ctx.allocate_field_with_serdez(fs, 8, SerdezId::from_raw(9)).is_err());
    let src = ctx.create_logical_region(space, fs).unwrap();
    let dst = ctx.create_logical_region(space, fs).unwrap();

    ctx.fill_fields(FillLauncher::with_pod(src, src, &11u64).add_field(field)).unwrap();
    ctx.issue_copy(CopyLauncher::new().add_copy(
        RequirementBuilder::region(src).field(field).build(),
        RequirementBuilder::region(dst).read_write().field(field).build(),
    ))
    .unwrap();
    assert_eq!(sum_of(&ctx, dst, dst, field), 66);
    assert_eq!(swap.calls.load(Ordering::Relaxed), 6);
}

#[test]
fn inline_mappings_order_against_tasks() {
    let timeline = TimelineRecorder::new();
    let rt = runtime_with_tasks(RuntimeConfig::default().with_workers(2), &timeline);
    let ctx = rt.top_level_context();
    let fx = RegionFixture::new(&ctx, 6, 1);
    let write = |value: u64| {
        ctx.execute_task(
            TaskLauncher::new(WRITE)
                .with_pod_args(&value)
                .add_requirement(RequirementBuilder::region(fx.region).read_write().field(fx.field(0)).build()),
        )
        .unwrap()
    };

    let first = write(5);
    let mapped = ctx
        .map_region(RequirementBuilder::region(fx.region).field(fx.field(0)).build())
        .unwrap();
    assert!(timeline.ran(&label(&first)), "mapping waits for the writer");
    assert!(mapped.is_mapped());
    assert_eq!(mapped.read_as::<u64>(fx.field(0), &DomainPoint::p1(3)).unwrap(), 5);
    assert!(mapped.write_as(fx.field(0), &DomainPoint::p1(3), 1u64).is_err(), "read-only mapping");

    let second = write(6);
    thread::sleep(Duration::from_millis(30));
    assert!(!timeline.ran(&label(&second)), "writer waits for the unmap");
    ctx.unmap_region(&mapped).unwrap();
    assert!(!mapped.is_mapped());
    second.get().unwrap();
    assert!(ctx.unmap_region(&mapped).is_err());
    assert_eq!(sum_of(&ctx, fx.region, fx.region, fx.field(0)), 36);
}

const EMIT: TaskId = TaskId::from_raw(40);
const LOCAL: TaskId = TaskId::from_raw(41);

#[test]
fn output_regions_hold_what_the_task_wrote() {
    init_test_logging();
    let timeline = TimelineRecorder::new();
    let rt = runtime(2);
    register_tasks(&rt, &timeline);
    rt.register_task(EMIT, "emit", |tc| {
        let count = tc.args_as::<u64>().map_err(|e| TaskError::Failed(e.to_string()))?;
        let out = tc.output(0)?;
        let field = out.fields().iter().next().copied().ok_or_else(|| TaskError::Failed("no field".into()))?;
        for i in 0..count {
            let p = i64::try_from(i).map_err(|e| TaskError::Failed(e.to_string()))?;
            out.write_as(field, DomainPoint::p1(p * 2), i * 10)?;
        }
        Ok(Bytes::new())
    })
    .unwrap();
    let ctx = rt.top_level_context();
    let fs = ctx.create_field_space();
    let field = ctx.allocate_field(fs, 8).unwrap();

    let (done, outputs) = ctx
        .execute_task_with_outputs(
            TaskLauncher::new(EMIT)
                .with_pod_args(&4u64)
                .add_output(OutputRequirement::new(fs, [field], 1)),
        )
        .unwrap();
    done.get().unwrap();
    let region = outputs[0].region().unwrap();
    let domain = ctx.region_domain(&region).unwrap();
    assert_eq!(domain.volume(), 4);
    assert!(domain.contains(&DomainPoint::p1(6)));
    assert!(!domain.contains(&DomainPoint::p1(1)));
    assert_eq!(sum_of(&ctx, region, region, field), 60);
}

#[test]
fn local_fields_disappear_with_their_context() {
    init_test_logging();
    let timeline = TimelineRecorder::new();
    let rt = runtime(2);
    register_tasks(&rt, &timeline);
    rt.register_task(LOCAL, "local", |tc| {
        let fs = tc.region(0)?.region().field_space();
        let field = tc.context().allocate_local_field(fs, 8)?;
        Ok(Bytes::copy_from_slice(&field.value().to_le_bytes()))
    })
    .unwrap();
    let ctx = rt.top_level_context();
    let fx = RegionFixture::new(&ctx, 4, 1);

    let local = ctx
        .execute_task(
            TaskLauncher::new(LOCAL).add_requirement(RequirementBuilder::region(fx.region).field(fx.field(0)).build()),
        )
        .unwrap()
        .get_as::<u32>()
        .unwrap();
    let gone = ctx.with_forest(|f| f.field_info(fx.field_space, FieldId::from_raw(local)).is_err());
    assert!(gone);

    let extra = ctx.allocate_field(fx.field_space, 8).unwrap();
    ctx.free_field(fx.field_space, extra).unwrap();
    assert!(ctx.with_forest(|f| f.field_info(fx.field_space, extra).is_err()));
    assert!(ctx.with_forest(|f| f.field_info(fx.field_space, fx.field(0)).is_ok()));
}

#[test]
fn restriction_and_set_operations() {
    let timeline = TimelineRecorder::new();
    let rt = runtime_with_tasks(RuntimeConfig::default().with_workers(1), &timeline);
    let ctx = rt.top_level_context();
    let space = ctx.create_index_space(IndexSet::range(0, 99));

    let blocks = ctx
        .partition_by_restriction(
            space,
            IndexSet::range(0, 4),
            &Transform::diagonal(&DomainPoint::p1(20)),
            &Rect::span(0, 19),
            PartitionKind::COMPUTE,
        )
        .unwrap();
    assert!(ctx.is_disjoint(blocks).unwrap());
    assert!(ctx.is_complete(blocks).unwrap());

    let quarters = ctx.partition_equal(space, 4).unwrap();
    let heads = ctx
        .partition_by_restriction(
            space,
            IndexSet::range(0, 3),
            &Transform::diagonal(&DomainPoint::p1(25)),
            &Rect::span(0, 9),
            PartitionKind::DISJOINT,
        )
        .unwrap();
    assert!(!ctx.is_complete(heads).unwrap());

    let volume = |ip, color: i64| {
        let sub = ctx.index_subspace(ip, &DomainPoint::p1(color)).unwrap();
        ctx.index_space_domain(sub).unwrap().volume()
    };
    let both = ctx.partition_by_intersection(quarters, heads, PartitionKind::COMPUTE).unwrap();
    let rest = ctx.partition_by_difference(quarters, heads, PartitionKind::COMPUTE).unwrap();
    let all = ctx.partition_by_union(quarters, heads, PartitionKind::COMPUTE).unwrap();
    for color in 0..4 {
        assert_eq!(volume(both, color), 10);
        assert_eq!(volume(rest, color), 15);
        assert_eq!(volume(all, color), 25);
    }
    assert!(ctx.is_complete(all).unwrap());
    assert!(ctx.is_disjoint(rest).unwrap());
}

#[test]
fn dependent_partitions_follow_field_contents() {
    let timeline = TimelineRecorder::new();
    let rt = runtime_with_tasks(RuntimeConfig::default().with_workers(2), &timeline);
    let ctx = rt.top_level_context();

    // Colors: point p holds p % 3.
    let colored = RegionFixture::new(&ctx, 20, 1);
    let mapped = ctx
        .map_region(RequirementBuilder::region(colored.region).write_discard().field(colored.field(0)).build())
        .unwrap();
    for p in mapped.points().collect::<Vec<_>>() {
        mapped.write_as(colored.field(0), &p, p.coord(0) % 3).unwrap();
    }
    ctx.unmap_region(&mapped).unwrap();
    let by_color = ctx
        .partition_by_field(colored.region, colored.region, colored.field(0), IndexSet::range(0, 2))
        .unwrap();
    assert!(ctx.is_disjoint(by_color).unwrap());
    let sizes: Vec<u64> = (0..3)
        .map(|c| {
            let sub = ctx.index_subspace(by_color, &DomainPoint::p1(c)).unwrap();
            ctx.index_space_domain(sub).unwrap().volume()
        })
        .collect();
    assert_eq!(sizes, vec![7, 7, 6]);

    // Pointers: source point p points at target point 10 * p.
    let target = ctx.create_index_space(IndexSet::range(0, 99));
    let source = RegionFixture::new(&ctx, 10, 1).partitioned(&ctx, 2);
    let mapped = ctx
        .map_region(RequirementBuilder::region(source.region).write_discard().field(source.field(0)).build())
        .unwrap();
    for p in mapped.points().collect::<Vec<_>>() {
        mapped.write_as(source.field(0), &p, p.coord(0) * 10).unwrap();
    }
    ctx.unmap_region(&mapped).unwrap();

    let image = ctx
        .partition_by_image(target, source.logical_partition(), source.region, source.field(0), PartitionKind::COMPUTE)
        .unwrap();
    let first = ctx.index_subspace(image, &DomainPoint::p1(0)).unwrap();
    assert_eq!(
        ctx.index_space_domain(first).unwrap(),
        IndexSet::from_points(1, (0..5).map(|i| DomainPoint::p1(i * 10)))
    );
    assert!(ctx.is_disjoint(image).unwrap());

    let halves = ctx.partition_equal(target, 2).unwrap();
    let preimage = ctx
        .partition_by_preimage(halves, source.region, source.region, source.field(0), PartitionKind::COMPUTE)
        .unwrap();
    let upper = ctx.index_subspace(preimage, &DomainPoint::p1(1)).unwrap();
    assert_eq!(ctx.index_space_domain(upper).unwrap(), IndexSet::range(5, 9));
}
