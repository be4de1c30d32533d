// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Phase barriers and dynamic collectives.
//!
//! A barrier expects a fixed number of arrivals per generation. When a
//! generation's count reaches zero its event triggers, after every earlier
//! generation has triggered. Handles name a generation; arriving through a
//! stale handle lands on the oldest generation still pending.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::event::Event;
use crate::future::{Future, FutureSetter};
use crate::ident::{BarrierId, ReductionOpId};
use crate::reduction::ReductionRegistry;

/// Handle to one generation of a phase barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhaseBarrier {
    id: BarrierId,
    generation: u32,
}

impl PhaseBarrier {
    /// Barrier id.
    pub const fn id(&self) -> BarrierId {
        self.id
    }

    /// Generation this handle names.
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Handle to the following generation.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self {
            id: self.id,
            generation: self.generation.saturating_add(1),
        }
    }

    /// Handle to the preceding generation (saturating at zero).
    #[must_use]
    pub const fn prev(&self) -> Self {
        Self {
            id: self.id,
            generation: self.generation.saturating_sub(1),
        }
    }
}

/// A phase barrier whose arrivals carry values folded by a reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DynamicCollective {
    barrier: PhaseBarrier,
    redop: ReductionOpId,
}

impl DynamicCollective {
    /// Underlying barrier generation.
    pub const fn barrier(&self) -> PhaseBarrier {
        self.barrier
    }

    /// Reduction folding arrival values.
    pub const fn redop(&self) -> ReductionOpId {
        self.redop
    }

    /// Handle to the following generation.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self {
            barrier: self.barrier.next(),
            redop: self.redop,
        }
    }
}

#[derive(Debug)]
struct Generation {
    remaining: u32,
    event: Event,
    values: Vec<Vec<u8>>,
    result: Option<FutureSetter>,
}

#[derive(Debug)]
struct BarrierState {
    expected: u32,
    redop: Option<ReductionOpId>,
    oldest: u32,
    generations: BTreeMap<u32, Generation>,
}

impl BarrierState {
    fn generation(&mut self, generation: u32) -> &mut Generation {
        let expected = self.expected;
        self.generations.entry(generation).or_insert_with(|| Generation {
            remaining: expected,
            event: Event::pending(),
            values: Vec::new(),
            result: None,
        })
    }
}

/// A generation that became complete and must be triggered outside the lock.
struct Triggered {
    event: Event,
    result: Option<(FutureSetter, Result<Vec<u8>, String>)>,
}

/// Runtime-wide barrier table.
#[derive(Debug)]
pub struct BarrierTable {
    barriers: Mutex<FxHashMap<BarrierId, BarrierState>>,
    next_id: AtomicU64,
    max_generations: u32,
    reductions: Arc<ReductionRegistry>,
}

impl BarrierTable {
    /// Empty table; barriers expire after `max_generations` generations.
    pub fn new(max_generations: u32, reductions: Arc<ReductionRegistry>) -> Self {
        Self {
            barriers: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
            max_generations,
            reductions,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<BarrierId, BarrierState>> {
        self.barriers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a barrier expecting `arrivals` per generation.
    ///
    /// With `key`, creation is idempotent: a second call with the same key
    /// returns the existing barrier. Replicated shards use this to agree on
    /// one barrier, so a call disagreeing on `arrivals` or `redop` fails.
    pub fn create(
        &self,
        arrivals: u32,
        redop: Option<ReductionOpId>,
        key: Option<BarrierId>,
    ) -> Result<PhaseBarrier, SyncError> {
        if arrivals == 0 {
            return Err(SyncError::ZeroArrivals);
        }
        if let Some(op) = redop {
            if self.reductions.get(op).is_none() {
                return Err(SyncError::NotACollective(key.unwrap_or(BarrierId::from_raw(0))));
            }
        }
        let id = key.unwrap_or_else(|| BarrierId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed)));
        let mut barriers = self.lock();
        let state = barriers.entry(id).or_insert_with(|| BarrierState {
            expected: arrivals,
            redop,
            oldest: 0,
            generations: BTreeMap::new(),
        });
        if state.expected != arrivals || state.redop != redop {
            return Err(SyncError::KeyedBarrierMismatch {
                barrier: id,
                expected: state.expected,
                requested: arrivals,
            });
        }
        Ok(PhaseBarrier { id, generation: 0 })
    }

    /// Creates a dynamic collective folding arrival values with `redop`.
    pub fn create_collective(
        &self,
        arrivals: u32,
        redop: ReductionOpId,
        key: Option<BarrierId>,
    ) -> Result<DynamicCollective, SyncError> {
        let barrier = self.create(arrivals, Some(redop), key)?;
        Ok(DynamicCollective { barrier, redop })
    }

    /// Removes a barrier. Pending generations never trigger.
    pub fn destroy(&self, barrier: PhaseBarrier) -> Result<(), SyncError> {
        self.lock()
            .remove(&barrier.id)
            .map(|_| ())
            .ok_or(SyncError::UnknownBarrier(barrier.id))
    }

    /// Whether the barrier exists and the handle's generation is usable.
    pub fn exists(&self, barrier: PhaseBarrier) -> bool {
        barrier.generation < self.max_generations && self.lock().contains_key(&barrier.id)
    }

    /// Expected arrivals per generation.
    pub fn expected(&self, barrier: PhaseBarrier) -> Result<u32, SyncError> {
        self.lock()
            .get(&barrier.id)
            .map(|s| s.expected)
            .ok_or(SyncError::UnknownBarrier(barrier.id))
    }

    /// Generation an arrival through `barrier` lands on.
    pub fn target(&self, barrier: PhaseBarrier) -> Result<PhaseBarrier, SyncError> {
        let barriers = self.lock();
        let state = barriers
            .get(&barrier.id)
            .ok_or(SyncError::UnknownBarrier(barrier.id))?;
        Ok(PhaseBarrier {
            id: barrier.id,
            generation: barrier.generation.max(state.oldest),
        })
    }

    /// Event of the handle's generation.
    pub fn event(&self, barrier: PhaseBarrier) -> Result<Event, SyncError> {
        self.check_generation(barrier)?;
        let mut barriers = self.lock();
        let state = barriers
            .get_mut(&barrier.id)
            .ok_or(SyncError::UnknownBarrier(barrier.id))?;
        if barrier.generation < state.oldest {
            return Ok(Event::no_event());
        }
        Ok(state.generation(barrier.generation).event.clone())
    }

    /// Records `count` arrivals.
    pub fn arrive(&self, barrier: PhaseBarrier, count: u32) -> Result<(), SyncError> {
        self.arrive_with(barrier, count, None)
    }

    /// Records `count` arrivals contributing `value` once.
    pub fn arrive_value(&self, collective: DynamicCollective, value: Option<&[u8]>, count: u32) -> Result<(), SyncError> {
        self.arrive_with(collective.barrier, count, value)
    }

    fn arrive_with(&self, barrier: PhaseBarrier, count: u32, value: Option<&[u8]>) -> Result<(), SyncError> {
        let fired = {
            let mut barriers = self.lock();
            let state = barriers
                .get_mut(&barrier.id)
                .ok_or(SyncError::UnknownBarrier(barrier.id))?;
            let generation = barrier.generation.max(state.oldest);
            if generation >= self.max_generations {
                return Err(SyncError::BarrierExhausted {
                    barrier: barrier.id,
                    generation,
                });
            }
            if value.is_some() && state.redop.is_none() {
                return Err(SyncError::NotACollective(barrier.id));
            }
            let gen = state.generation(generation);
            if count > gen.remaining {
                return Err(SyncError::OverArrival {
                    barrier: barrier.id,
                    generation,
                    remaining: gen.remaining,
                    count,
                });
            }
            gen.remaining -= count;
            if let Some(v) = value {
                gen.values.push(v.to_vec());
            }
            self.drain_complete(state)
        };
        for t in fired {
            match t.result {
                Some((setter, Ok(value))) => setter.set(Bytes::from(value)),
                Some((setter, Err(reason))) => setter.fail(reason),
                None => {}
            }
            t.event.fire(false);
        }
        Ok(())
    }

    /// Pops every complete generation at the head, in order.
    fn drain_complete(&self, state: &mut BarrierState) -> Vec<Triggered> {
        let mut fired = Vec::new();
        loop {
            let oldest = state.oldest;
            let complete = state.generations.get(&oldest).is_some_and(|g| g.remaining == 0);
            if !complete {
                break;
            }
            let Some(gen) = state.generations.remove(&oldest) else {
                break;
            };
            state.oldest += 1;
            let result = gen.result.map(|setter| {
                let value = state
                    .redop
                    .ok_or_else(|| "phase barrier carries no reduction".to_owned())
                    .and_then(|op| {
                        self.reductions
                            .reduce(op, gen.values.iter().map(Vec::as_slice))
                            .map_err(|err| err.to_string())
                    });
                if let Err(reason) = &value {
                    tracing::warn!(generation = oldest, %reason, "collective fold failed");
                }
                (setter, value)
            });
            tracing::trace!(generation = oldest, "phase barrier generation triggered");
            fired.push(Triggered {
                event: gen.event,
                result,
            });
        }
        fired
    }

    /// Future resolving to the folded arrivals of the collective's generation.
    pub fn collective_result(&self, collective: DynamicCollective) -> Result<Future, SyncError> {
        self.check_generation(collective.barrier)?;
        let mut barriers = self.lock();
        let state = barriers
            .get_mut(&collective.barrier.id)
            .ok_or(SyncError::UnknownBarrier(collective.barrier.id))?;
        if state.redop.is_none() {
            return Err(SyncError::NotACollective(collective.barrier.id));
        }
        if collective.barrier.generation < state.oldest {
            return Err(SyncError::BarrierExhausted {
                barrier: collective.barrier.id,
                generation: collective.barrier.generation,
            });
        }
        let gen = state.generation(collective.barrier.generation);
        if let Some(setter) = &gen.result {
            return Ok(setter.future());
        }
        let (future, setter) = Future::pending(None);
        gen.result = Some(setter);
        Ok(future)
    }

    fn check_generation(&self, barrier: PhaseBarrier) -> Result<(), SyncError> {
        if barrier.generation >= self.max_generations {
            return Err(SyncError::BarrierExhausted {
                barrier: barrier.id,
                generation: barrier.generation,
            });
        }
        Ok(())
    }
}
