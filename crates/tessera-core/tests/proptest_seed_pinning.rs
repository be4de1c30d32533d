// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs)]
use proptest::prelude::*;
use proptest::test_runner::{Config as PropConfig, RngAlgorithm, TestRng, TestRunner};

mod common;

use common::{label, op_of, runtime_with_tasks, REDUCE, SUM, WRITE};
use tessera_core::{
    Coloring, DomainPoint, IndexSet, PartitionKind, ReduceOp, RegionForest, RuntimeConfig,
    TaskLauncher,
};
use tessera_dry_tests::{RegionFixture, RequirementBuilder, TimelineRecorder};

// Seeds are pinned so failures reproduce across machines and CI. Override
// locally with PROPTEST_SEED or edit the constants below.

const ORDERING_SEED: [u8; 32] = [
    0x7e, 0x55, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0,
];
const COLORING_SEED: [u8; 32] = [
    0xc0, 0x10, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0,
];
const BARRIER_SEED: [u8; 32] = [
    0xba, 0x77, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0,
];

/// Pieces of the 4-way partition; `WHOLE` names the root region.
const PIECES: i64 = 4;
const WHOLE: i64 = PIECES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
    Reduce,
}

fn access() -> impl Strategy<Value = Access> {
    prop_oneof![Just(Access::Read), Just(Access::Write), Just(Access::Reduce)]
}

fn conflicts(a: (i64, Access), b: (i64, Access)) -> bool {
    let overlap = a.0 == WHOLE || b.0 == WHOLE || a.0 == b.0;
    let benign = matches!(
        (a.1, b.1),
        (Access::Read, Access::Read) | (Access::Reduce, Access::Reduce)
    );
    overlap && !benign
}

fn runner(seed: &[u8; 32], cases: u32) -> TestRunner {
    let rng = TestRng::from_seed(RngAlgorithm::ChaCha, seed);
    TestRunner::new_with_rng(
        PropConfig {
            cases,
            ..PropConfig::default()
        },
        rng,
    )
}

#[test]
fn proptest_seed_pinned_conflicting_operations_never_overlap() {
    let mut runner = runner(&ORDERING_SEED, 16);
    let program = prop::collection::vec((0..=WHOLE, access()), 2..7);

    runner
        .run(&program, |program| {
            let timeline = TimelineRecorder::new();
            let rt = runtime_with_tasks(RuntimeConfig::default().with_workers(3), &timeline);
            let ctx = rt.top_level_context();
            let fx = RegionFixture::new(&ctx, 40, 1).partitioned(&ctx, PIECES.unsigned_abs());

            let futures: Vec<_> = program
                .iter()
                .map(|(target, access)| {
                    let region = if *target == WHOLE { fx.region } else { fx.piece(&ctx, *target) };
                    let builder = RequirementBuilder::region(region).parent(fx.region).field(fx.field(0));
                    let (task, builder) = match access {
                        Access::Read => (SUM, builder.read_only()),
                        Access::Write => (WRITE, builder.read_write()),
                        Access::Reduce => (REDUCE, builder.reduce(ReduceOp::SumU64.id())),
                    };
                    ctx.execute_task(TaskLauncher::new(task).with_pod_args(&1u64).add_requirement(builder.build()))
                        .expect("launch")
                })
                .collect();
            ctx.wait_all();

            for (j, later) in futures.iter().enumerate() {
                let direct = ctx.dependences(op_of(later)).unwrap_or_default();
                for (i, earlier) in futures.iter().enumerate().take(j) {
                    if conflicts(program[i], program[j]) {
                        prop_assert!(
                            timeline.finished_before(&label(earlier), &label(later)),
                            "op {i} {:?} must finish before op {j} {:?}",
                            program[i],
                            program[j]
                        );
                    } else {
                        prop_assert!(!direct.contains(&op_of(earlier)), "op {j} needlessly waits on op {i}");
                    }
                }
            }
            Ok(())
        })
        .expect("conflicting operations stay ordered");
}

#[test]
fn proptest_seed_pinned_explicit_colorings_round_trip_disjointness() {
    let mut runner = runner(&COLORING_SEED, 64);
    // Sorted cut points split 0..=199 into contiguous pieces; odd pieces are
    // dropped to leave gaps.
    let cuts = prop::collection::btree_set(1i64..199, 1..8);

    runner
        .run(&cuts, |cuts| {
            let mut forest = RegionForest::new(true);
            let space = forest.create_index_space(IndexSet::range(0, 199));
            let mut bounds: Vec<i64> = vec![0];
            bounds.extend(cuts.iter().copied());
            bounds.push(200);

            let mut coloring = Coloring::new();
            for (color, pair) in bounds.windows(2).enumerate() {
                if color % 2 == 1 {
                    continue;
                }
                let color = i64::try_from(color).unwrap_or(i64::MAX);
                coloring.insert(DomainPoint::p1(color), IndexSet::range(pair[0], pair[1] - 1));
            }
            let colors = i64::try_from(bounds.len() - 1).unwrap_or(1);
            let partition = forest
                .create_partition(space, IndexSet::range(0, colors - 1), coloring.clone(), PartitionKind::DISJOINT)
                .expect("non-overlapping coloring is accepted as disjoint");
            prop_assert!(forest.is_disjoint(partition).expect("partition exists"));

            let subs: Vec<IndexSet> = (0..colors)
                .map(|c| {
                    let sub = forest.subspace(partition, &DomainPoint::p1(c)).expect("color in range");
                    forest.index_space_domain(sub).expect("subspace exists").clone()
                })
                .collect();
            for (i, a) in subs.iter().enumerate() {
                for b in subs.iter().skip(i + 1) {
                    prop_assert!(a.intersection(b).is_empty());
                }
            }
            let covered: u64 = subs.iter().map(IndexSet::volume).sum();
            prop_assert_eq!(covered, coloring.values().map(IndexSet::volume).sum::<u64>());
            Ok(())
        })
        .expect("disjoint colorings round-trip");
}

#[test]
fn proptest_seed_pinned_barrier_fires_on_exact_arrival_count() {
    let mut runner = runner(&BARRIER_SEED, 64);
    let timeline = TimelineRecorder::new();
    let rt = runtime_with_tasks(RuntimeConfig::default().with_workers(1), &timeline);
    let ctx = rt.top_level_context();
    let counts = prop::collection::vec(1u32..4, 1..6);

    runner
        .run(&counts, |counts| {
            let expected: u32 = counts.iter().sum();
            let barrier = ctx.create_phase_barrier(expected).expect("barrier");
            let event = ctx.barrier_event(barrier).expect("event");
            let (last, head) = counts.split_last().expect("at least one arrival");
            for count in head {
                ctx.arrive_barrier(barrier, *count).expect("arrive");
                prop_assert!(!event.has_triggered());
            }
            ctx.arrive_barrier(barrier, *last).expect("final arrival");
            prop_assert!(event.has_triggered());
            prop_assert!(!ctx.barrier_event(barrier.next()).expect("next").has_triggered());
            Ok(())
        })
        .expect("barriers count arrivals exactly");
}
