// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]
//! Control-replicated runs: agreement, ownership and divergence checks.

mod common;

use std::cell::Cell;
use std::sync::Arc;

use bytes::Bytes;
use common::{runtime_with_tasks, NOOP, SUM, WRITE_POINT};
use tessera_core::{
    DomainPoint, IndexSet, IndexTaskLauncher, PartitionKind, Rect, ReduceMode, ReduceOp,
    ReplicationError, RuntimeConfig, RuntimeError, ShardId, ShardingFunctor, ShardingId,
    TaskLauncher, Transform,
};
use tessera_dry_tests::{Mark, RegionFixture, RequirementBuilder, TimelineRecorder};

#[test]
fn shards_agree_and_each_point_runs_once() {
    let timeline = TimelineRecorder::new();
    let rt = runtime_with_tasks(RuntimeConfig::default().with_workers(3), &timeline);

    let results = rt
        .replicate(3, |ctx| {
            let fx = RegionFixture::new(ctx, 12, 1).partitioned(ctx, 3);
            let map = ctx
                .execute_index_space(
                    IndexTaskLauncher::new(WRITE_POINT, IndexSet::range(0, 2)).add_requirement(
                        RequirementBuilder::partition(fx.logical_partition(), fx.region)
                            .read_write()
                            .field(fx.field(0))
                            .build(),
                    ),
                )
                .unwrap();
            let points = ctx
                .reduce_future_map(&map, ReduceOp::SumU64.id(), ReduceMode::Ordered)
                .unwrap()
                .get_as::<u64>()
                .unwrap();
            let total = ctx
                .execute_task(
                    TaskLauncher::new(SUM)
                        .add_requirement(RequirementBuilder::region(fx.region).field(fx.field(0)).build()),
                )
                .unwrap()
                .get_as::<u64>()
                .unwrap();
            (ctx.shard(), ctx.shards(), points, total)
        })
        .unwrap();

    let shards: Vec<_> = results.iter().map(|r| r.0).collect();
    assert_eq!(
        shards,
        vec![Some(ShardId::from_raw(0)), Some(ShardId::from_raw(1)), Some(ShardId::from_raw(2))]
    );
    for (_, count, points, total) in &results {
        assert_eq!(*count, 3);
        assert_eq!(*points, 3);
        assert_eq!(*total, 4 * (1 + 2));
    }
    let ends: Vec<_> = timeline
        .marks()
        .into_iter()
        .filter(|m| matches!(m, Mark::End(_)))
        .collect();
    assert_eq!(ends.len(), 4, "three index points plus one mirrored single task");
}

#[test]
fn sharding_functors_decide_point_ownership() {
    let timeline = TimelineRecorder::new();
    let rt = runtime_with_tasks(RuntimeConfig::default().with_workers(2), &timeline);
    let results = rt
        .replicate(2, |ctx| {
            let map = ctx
                .execute_index_space(
                    IndexTaskLauncher::new(NOOP, IndexSet::range(0, 3)).with_sharding(ShardingId::from_raw(1)),
                )
                .unwrap();
            map.wait_all();
            map.iter()
                .filter(|(p, _)| map.is_local(p))
                .map(|(p, _)| p.coord(0))
                .collect::<Vec<_>>()
        })
        .unwrap();
    assert_eq!(results, vec![vec![0, 2], vec![1, 3]]);
}

#[test]
fn unordered_future_map_reductions_combine_across_shards() {
    let timeline = TimelineRecorder::new();
    let rt = runtime_with_tasks(RuntimeConfig::default().with_workers(2), &timeline);
    let results = rt
        .replicate(3, |ctx| {
            let launcher = (0..4i64).fold(IndexTaskLauncher::new(NOOP, IndexSet::range(0, 3)), |l, p| {
                l.with_point_args(DomainPoint::p1(p), Bytes::copy_from_slice(&(p.unsigned_abs() + 1).to_le_bytes()))
            });
            let map = ctx.execute_index_space(launcher).unwrap();
            let unordered = ctx
                .reduce_future_map(&map, ReduceOp::SumU64.id(), ReduceMode::Unordered)
                .unwrap()
                .get_as::<u64>()
                .unwrap();
            let ordered = ctx
                .reduce_future_map(&map, ReduceOp::SumU64.id(), ReduceMode::Ordered)
                .unwrap()
                .get_as::<u64>()
                .unwrap();
            (unordered, ordered)
        })
        .unwrap();
    assert_eq!(results, vec![(10, 10); 3]);
}

#[test]
fn replicated_barriers_are_shared() {
    let timeline = TimelineRecorder::new();
    let rt = runtime_with_tasks(RuntimeConfig::default().with_workers(2), &timeline);
    let results = rt
        .replicate(2, |ctx| {
            let barrier = ctx.create_phase_barrier(1).unwrap();
            ctx.arrive_barrier(barrier, 1).unwrap();
            ctx.wait_barrier(barrier).unwrap();
            barrier.id()
        })
        .unwrap();
    assert_eq!(results[0], results[1]);
}

fn divergent_program(ctx: &tessera_core::Context) {
    let fx = RegionFixture::new(ctx, 8, 1);
    let halves = ctx.partition_equal(fx.space, 2).unwrap();
    let edges = ctx
        .partition_by_restriction(
            fx.space,
            IndexSet::range(0, 1),
            &Transform::diagonal(&DomainPoint::p1(4)),
            &Rect::span(0, 0),
            PartitionKind::DISJOINT,
        )
        .unwrap();
    // Each shard picks a different partition for the same launch.
    let chosen = if ctx.shard() == Some(ShardId::from_raw(0)) { halves } else { edges };
    let lp = ctx.get_logical_partition(fx.region, chosen).unwrap();
    ctx.execute_index_space(
        IndexTaskLauncher::new(WRITE_POINT, IndexSet::range(0, 1))
            .add_requirement(RequirementBuilder::partition(lp, fx.region).read_write().field(fx.field(0)).build()),
    )
    .unwrap()
    .wait_all();
}

#[test]
fn safe_mode_detects_divergent_launches() {
    let timeline = TimelineRecorder::new();
    let config = RuntimeConfig::default().with_workers(2).with_safe_control_replication(true);
    let rt = runtime_with_tasks(config, &timeline);
    let outcome = rt.replicate(2, divergent_program);
    assert!(matches!(
        outcome,
        Err(RuntimeError::Replication(ReplicationError::Divergence { .. }))
    ));
}

#[test]
fn divergence_goes_unchecked_outside_safe_mode() {
    let timeline = TimelineRecorder::new();
    let rt = runtime_with_tasks(RuntimeConfig::default().with_workers(2), &timeline);
    assert!(rt.replicate(2, divergent_program).is_ok());
}

/// Names a shard that does not exist.
struct Nowhere;

impl ShardingFunctor for Nowhere {
    fn shard(&self, _point: &DomainPoint, _launch: &IndexSet, _shards: usize) -> ShardId {
        ShardId::from_raw(7)
    }
}

thread_local! {
    static CALLS: Cell<u32> = const { Cell::new(0) };
}

/// Alternates its answer on every call from the same thread.
struct Fickle;

impl ShardingFunctor for Fickle {
    fn shard(&self, _point: &DomainPoint, _launch: &IndexSet, shards: usize) -> ShardId {
        let n = CALLS.with(|c| {
            let n = c.get();
            c.set(n + 1);
            n
        });
        ShardId::from_raw(n % u32::try_from(shards).unwrap())
    }
}

#[test]
fn bad_sharding_functors_are_rejected() {
    let timeline = TimelineRecorder::new();
    let config = RuntimeConfig::default().with_workers(2).with_safe_control_replication(true);
    let rt = runtime_with_tasks(config, &timeline);
    rt.register_sharding(ShardingId::from_raw(5), Arc::new(Nowhere)).unwrap();
    rt.register_sharding(ShardingId::from_raw(6), Arc::new(Fickle)).unwrap();

    let results = rt
        .replicate(2, |ctx| {
            let launch = |id| ctx.execute_index_space(IndexTaskLauncher::new(NOOP, IndexSet::range(0, 1)).with_sharding(id));
            (launch(ShardingId::from_raw(5)).err(), launch(ShardingId::from_raw(6)).err())
        })
        .unwrap();
    for (nowhere, fickle) in results {
        assert!(matches!(
            nowhere,
            Some(RuntimeError::Replication(ReplicationError::ShardOutOfRange { shards: 2, .. }))
        ));
        assert!(matches!(
            fickle,
            Some(RuntimeError::Replication(ReplicationError::ImpureFunctor { kind: "sharding", .. }))
        ));
    }
}

#[test]
fn replication_needs_a_shard() {
    let timeline = TimelineRecorder::new();
    let rt = runtime_with_tasks(RuntimeConfig::default().with_workers(1), &timeline);
    assert!(matches!(
        rt.replicate(0, |_| ()),
        Err(RuntimeError::Replication(ReplicationError::NoShards))
    ));
}
