// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Sharding functors: which shard owns each point of an index launch.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::domain::{DomainPoint, IndexSet};
use crate::error::RuntimeError;
use crate::ident::{ShardId, ShardingId};

/// Maps a launch point to its owning shard.
///
/// Functors must be pure: every shard evaluates them independently and
/// relies on reaching the same answer.
pub trait ShardingFunctor: Send + Sync {
    /// Owner of `point` in a launch over `launch` with `shards` shards.
    fn shard(&self, point: &DomainPoint, launch: &IndexSet, shards: usize) -> ShardId;
}

/// Contiguous blocks of the launch's canonical order (id 0).
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockSharding;

impl ShardingFunctor for BlockSharding {
    fn shard(&self, point: &DomainPoint, launch: &IndexSet, shards: usize) -> ShardId {
        let volume = launch.volume().max(1);
        let index = launch.linear_index(point).unwrap_or(0);
        let shard = (u128::from(index) * shards as u128 / u128::from(volume)) as u32;
        ShardId::from_raw(shard)
    }
}

/// Round-robin over the launch's canonical order (id 1).
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuloSharding;

impl ShardingFunctor for ModuloSharding {
    fn shard(&self, point: &DomainPoint, launch: &IndexSet, shards: usize) -> ShardId {
        let index = launch.linear_index(point).unwrap_or(0);
        ShardId::from_raw((index % shards.max(1) as u64) as u32)
    }
}

/// Id → functor table seeded with [`BlockSharding`] (0) and
/// [`ModuloSharding`] (1).
#[derive(Clone)]
pub struct ShardingRegistry {
    functors: BTreeMap<ShardingId, Arc<dyn ShardingFunctor>>,
}

impl Default for ShardingRegistry {
    fn default() -> Self {
        let mut functors: BTreeMap<ShardingId, Arc<dyn ShardingFunctor>> = BTreeMap::new();
        functors.insert(ShardingId::from_raw(0), Arc::new(BlockSharding));
        functors.insert(ShardingId::from_raw(1), Arc::new(ModuloSharding));
        Self { functors }
    }
}

impl ShardingRegistry {
    /// Registers a functor under `id`.
    pub fn register(&mut self, id: ShardingId, functor: Arc<dyn ShardingFunctor>) -> Result<(), RuntimeError> {
        if self.functors.contains_key(&id) {
            return Err(RuntimeError::DuplicateRegistration {
                kind: "sharding functor",
                id: id.value(),
            });
        }
        self.functors.insert(id, functor);
        Ok(())
    }

    /// Functor by id.
    pub fn get(&self, id: ShardingId) -> Result<&Arc<dyn ShardingFunctor>, RuntimeError> {
        self.functors.get(&id).ok_or(RuntimeError::UnknownRegistration {
            kind: "sharding functor",
            id: id.value(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn block_sharding_splits_contiguously() {
        let launch = IndexSet::range(0, 7);
        let owners: Vec<u32> = launch
            .points()
            .map(|p| BlockSharding.shard(&p, &launch, 2).value())
            .collect();
        assert_eq!(owners, vec![0, 0, 0, 0, 1, 1, 1, 1]);
    }

    #[test]
    fn modulo_sharding_round_robins() {
        let launch = IndexSet::range(10, 15);
        let owners: Vec<u32> = launch
            .points()
            .map(|p| ModuloSharding.shard(&p, &launch, 4).value())
            .collect();
        assert_eq!(owners, vec![0, 1, 2, 3, 0, 1]);
    }

    #[test]
    fn registry_is_seeded() {
        let mut reg = ShardingRegistry::default();
        assert!(reg.get(ShardingId::from_raw(1)).is_ok());
        assert!(reg.register(ShardingId::from_raw(0), Arc::new(BlockSharding)).is_err());
        assert!(reg.get(ShardingId::from_raw(7)).is_err());
    }
}
