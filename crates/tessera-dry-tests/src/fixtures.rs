// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Runtime builders and canned region trees.
//!
//! Fixture constructors panic on failure; they only run inside tests.

use std::sync::Arc;

use tessera_config::RuntimeConfig;
use tessera_core::{
    Context, DomainPoint, FieldId, FieldSpaceId, IndexPartitionId, IndexSet, IndexSpaceId,
    LogicalPartition, LogicalRegion, Mapper, Runtime,
};

/// Width of every fixture field: one `u64`.
pub const FIELD_SIZE: usize = 8;

/// Runtime with `workers` processors and default settings.
pub fn runtime(workers: usize) -> Runtime {
    runtime_with_config(RuntimeConfig::default().with_workers(workers))
}

/// Runtime built from `config`.
#[allow(clippy::expect_used)]
pub fn runtime_with_config(config: RuntimeConfig) -> Runtime {
    Runtime::new(config).expect("test runtime should start")
}

/// Runtime with `workers` processors consulting `mapper`.
#[allow(clippy::expect_used)]
pub fn runtime_with_mapper(workers: usize, mapper: Arc<dyn Mapper>) -> Runtime {
    Runtime::with_mapper(RuntimeConfig::default().with_workers(workers), mapper)
        .expect("test runtime should start")
}

/// A 1-D region `0..=points-1` with `u64` fields, optionally split into
/// equal disjoint pieces.
#[derive(Debug, Clone)]
pub struct RegionFixture {
    /// Root index space.
    pub space: IndexSpaceId,
    /// Field space.
    pub field_space: FieldSpaceId,
    /// Allocated fields in allocation order.
    pub fields: Vec<FieldId>,
    /// Root region.
    pub region: LogicalRegion,
    /// Equal partition, once [`partitioned`](Self::partitioned) ran.
    pub partition: Option<(IndexPartitionId, LogicalPartition)>,
}

impl RegionFixture {
    /// Creates the region with `fields` fields in `ctx`.
    #[allow(clippy::expect_used)]
    pub fn new(ctx: &Context, points: i64, fields: usize) -> Self {
        let space = ctx.create_index_space(IndexSet::range(0, points - 1));
        let field_space = ctx.create_field_space();
        let fields = (0..fields)
            .map(|_| {
                ctx.allocate_field(field_space, FIELD_SIZE)
                    .expect("fixture field should allocate")
            })
            .collect();
        let region = ctx
            .create_logical_region(space, field_space)
            .expect("fixture region should be created");
        Self {
            space,
            field_space,
            fields,
            region,
            partition: None,
        }
    }

    /// Splits the region into `colors` equal pieces colored `0..colors`.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn partitioned(mut self, ctx: &Context, colors: u64) -> Self {
        let ip = ctx
            .partition_equal(self.space, colors)
            .expect("fixture partition should be created");
        let lp = ctx
            .get_logical_partition(self.region, ip)
            .expect("fixture partition should resolve");
        self.partition = Some((ip, lp));
        self
    }

    /// Field `index`.
    #[allow(clippy::expect_used)]
    pub fn field(&self, index: usize) -> FieldId {
        *self.fields.get(index).expect("fixture field index in range")
    }

    /// The logical partition.
    #[allow(clippy::expect_used)]
    pub fn logical_partition(&self) -> LogicalPartition {
        self.partition.expect("fixture was not partitioned").1
    }

    /// Piece `color` of the partition.
    #[allow(clippy::expect_used)]
    pub fn piece(&self, ctx: &Context, color: i64) -> LogicalRegion {
        ctx.get_logical_subregion_by_color(self.logical_partition(), &DomainPoint::p1(color))
            .expect("fixture color in range")
    }
}
