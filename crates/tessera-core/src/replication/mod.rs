// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Control replication.
//!
//! Every shard runs the same top-level program against its own region
//! forest, so handles and operation sequence numbers agree without
//! communication. Index launches are analysed for every point on every
//! shard; a point executes only on the shard its sharding functor names,
//! and the owner announces the point's result to its peers. Operations
//! without a launch domain (single tasks, copies, fills) are owned by
//! shard 0.
//!
//! Shards never exchange operation streams. The only traffic is point
//! completions, reduction partials and, in safe mode, one digest per
//! launch compared on shard 0 when the program ends.

pub mod collective;
pub mod sharding;
pub mod transport;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::domain::{DomainPoint, IndexSet};
use crate::error::ReplicationError;
use crate::future::{Future, FutureSetter};
use crate::ident::{BarrierId, OpId, ReservationId, ShardId};
use crate::reduction::ReductionOp;

use collective::CollectiveInbox;
use sharding::ShardingFunctor;
use transport::{recv_message, send_message, PointValue, ShardMessage, Transport};

pub use collective::ReduceMode;
pub use sharding::{BlockSharding, ModuloSharding, ShardingRegistry};
pub use transport::InMemoryTransport;

/// Key bit marking barrier and reservation ids derived from a replication
/// group, keeping them apart from ids handed out by the runtime counters.
const REPLICATED_KEY: u64 = 1 << 63;

enum RemoteSlot {
    Waiting(FutureSetter),
    Arrived(PointValue),
}

#[derive(Default)]
struct Completion {
    done: BTreeMap<ShardId, u64>,
}

/// Per-shard replication state shared by the shard's top-level context and
/// its message router.
pub(crate) struct ShardState {
    shard: ShardId,
    shards: usize,
    group: u32,
    safe: bool,
    transport: Arc<dyn Transport>,
    remote: Mutex<FxHashMap<(u64, DomainPoint), RemoteSlot>>,
    pub(crate) inbox: CollectiveInbox,
    digests: Mutex<BTreeMap<u64, Vec<(ShardId, Vec<u8>)>>>,
    completion: Mutex<Completion>,
    completion_cv: Condvar,
    launches: AtomicU64,
    collective_tag: AtomicU64,
    barrier_index: AtomicU32,
    reservation_index: AtomicU32,
    failure: Mutex<Option<ReplicationError>>,
}

impl core::fmt::Debug for ShardState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ShardState")
            .field("shard", &self.shard)
            .field("shards", &self.shards)
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

impl ShardState {
    pub(crate) fn new(transport: Arc<dyn Transport>, group: u32, safe: bool) -> Self {
        Self {
            shard: transport.shard(),
            shards: transport.shards(),
            group,
            safe,
            transport,
            remote: Mutex::new(FxHashMap::default()),
            inbox: CollectiveInbox::default(),
            digests: Mutex::new(BTreeMap::new()),
            completion: Mutex::new(Completion::default()),
            completion_cv: Condvar::new(),
            launches: AtomicU64::new(0),
            collective_tag: AtomicU64::new(0),
            barrier_index: AtomicU32::new(0),
            reservation_index: AtomicU32::new(0),
            failure: Mutex::new(None),
        }
    }

    pub(crate) fn shard(&self) -> ShardId {
        self.shard
    }

    pub(crate) fn shards(&self) -> usize {
        self.shards
    }

    pub(crate) fn safe(&self) -> bool {
        self.safe
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Owner of `point`, validated and (in safe mode) purity-checked.
    pub(crate) fn owner(
        &self,
        functor: &dyn ShardingFunctor,
        point: &DomainPoint,
        launch: &IndexSet,
    ) -> Result<ShardId, ReplicationError> {
        let shard = functor.shard(point, launch, self.shards);
        if shard.index() >= self.shards {
            return Err(ReplicationError::ShardOutOfRange {
                shard,
                shards: self.shards,
            });
        }
        if self.safe && functor.shard(point, launch, self.shards) != shard {
            return Err(ReplicationError::ImpureFunctor {
                kind: "sharding",
                point: *point,
            });
        }
        Ok(shard)
    }

    /// Future bound when the owner of `point` announces it.
    pub(crate) fn expect_remote(&self, seq: u64, point: DomainPoint, producer: OpId) -> Future {
        let (future, setter) = Future::pending(Some(producer));
        let arrived = {
            let mut remote = self.remote.lock().unwrap_or_else(PoisonError::into_inner);
            match remote.remove(&(seq, point)) {
                Some(RemoteSlot::Arrived(value)) => Some(value),
                Some(RemoteSlot::Waiting(_)) | None => {
                    remote.insert((seq, point), RemoteSlot::Waiting(setter.clone()));
                    None
                }
            }
        };
        if let Some(value) = arrived {
            bind(&setter, value);
        }
        future
    }

    fn deliver_point(&self, seq: u64, point: DomainPoint, value: PointValue) {
        let waiting = {
            let mut remote = self.remote.lock().unwrap_or_else(PoisonError::into_inner);
            match remote.remove(&(seq, point)) {
                Some(RemoteSlot::Waiting(setter)) => Some((setter, value)),
                Some(RemoteSlot::Arrived(_)) | None => {
                    remote.insert((seq, point), RemoteSlot::Arrived(value));
                    None
                }
            }
        };
        if let Some((setter, value)) = waiting {
            bind(&setter, value);
        }
    }

    /// Announces a locally executed point to every peer.
    pub(crate) fn announce(&self, seq: u64, point: DomainPoint, value: PointValue) -> Result<(), ReplicationError> {
        let msg = ShardMessage::PointComplete { seq, point, value };
        for peer in (0..self.shards).filter(|s| *s != self.shard.index()) {
            send_message(self.transport(), ShardId::from_raw(peer as u32), &msg)?;
        }
        Ok(())
    }

    /// Records the digest of launch `seq` for comparison on shard 0.
    pub(crate) fn digest(&self, seq: u64, digest: Vec<u8>) -> Result<(), ReplicationError> {
        self.launches.fetch_add(1, Ordering::Relaxed);
        if !self.safe {
            return Ok(());
        }
        if self.shard.index() == 0 {
            self.store_digest(seq, self.shard, digest);
            Ok(())
        } else {
            send_message(
                self.transport(),
                ShardId::from_raw(0),
                &ShardMessage::Digest {
                    seq,
                    shard: self.shard,
                    digest,
                },
            )
        }
    }

    fn store_digest(&self, seq: u64, shard: ShardId, digest: Vec<u8>) {
        self.digests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(seq)
            .or_default()
            .push((shard, digest));
    }

    /// Next collective tag; identical on every shard issuing the same program.
    pub(crate) fn next_collective(&self) -> u64 {
        self.collective_tag.fetch_add(1, Ordering::Relaxed)
    }

    /// Deterministic barrier key for the next barrier created by this shard.
    pub(crate) fn next_barrier_key(&self) -> BarrierId {
        let index = self.barrier_index.fetch_add(1, Ordering::Relaxed);
        BarrierId::from_raw(REPLICATED_KEY | (u64::from(self.group) << 32) | u64::from(index))
    }

    /// Deterministic reservation key for the next reservation created by this shard.
    pub(crate) fn next_reservation_key(&self) -> ReservationId {
        let index = self.reservation_index.fetch_add(1, Ordering::Relaxed);
        ReservationId::from_raw(REPLICATED_KEY | (u64::from(self.group) << 32) | u64::from(index))
    }

    /// All-reduces `local` with every peer under the next collective tag.
    pub(crate) fn all_reduce(&self, local: Vec<u8>, op: &dyn ReductionOp) -> Result<Vec<u8>, ReplicationError> {
        let tag = self.next_collective();
        collective::all_reduce(self.transport(), &self.inbox, tag, local, op)
    }

    /// Routes incoming messages until `Shutdown` or transport failure.
    pub(crate) fn route(&self) {
        loop {
            let msg = match recv_message(self.transport()) {
                Ok(msg) => msg,
                Err(ReplicationError::Codec(reason)) => {
                    tracing::error!(shard = self.shard.value(), %reason, "dropping undecodable shard message");
                    self.fail(ReplicationError::Codec(reason));
                    continue;
                }
                Err(err) => {
                    tracing::debug!(shard = self.shard.value(), %err, "shard router stopping");
                    break;
                }
            };
            match msg {
                ShardMessage::PointComplete { seq, point, value } => self.deliver_point(seq, point, value),
                ShardMessage::Digest { seq, shard, digest } => self.store_digest(seq, shard, digest),
                ShardMessage::Reduce {
                    tag,
                    round,
                    from,
                    value,
                } => self.inbox.deliver(tag, round, from, value),
                ShardMessage::Done { shard, launches } => {
                    self.completion
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .done
                        .insert(shard, launches);
                    self.completion_cv.notify_all();
                }
                ShardMessage::Shutdown => break,
            }
        }
    }

    fn fail(&self, err: ReplicationError) {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(err);
    }

    /// Stops this shard's router.
    pub(crate) fn shutdown(&self) -> Result<(), ReplicationError> {
        send_message(self.transport(), self.shard, &ShardMessage::Shutdown)
    }

    /// Ends the shard's program. Shard 0 waits for every peer and compares
    /// launch counts and, in safe mode, digests.
    pub(crate) fn finish(&self) -> Result<(), ReplicationError> {
        let launches = self.launches.load(Ordering::Relaxed);
        if self.shard.index() != 0 {
            send_message(
                self.transport(),
                ShardId::from_raw(0),
                &ShardMessage::Done {
                    shard: self.shard,
                    launches,
                },
            )?;
            return self.failure();
        }
        let done = {
            let mut completion = self.completion.lock().unwrap_or_else(PoisonError::into_inner);
            while completion.done.len() + 1 < self.shards {
                completion = self
                    .completion_cv
                    .wait(completion)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            std::mem::take(&mut completion.done)
        };
        self.failure()?;
        for (shard, theirs) in &done {
            if *theirs != launches {
                return Err(ReplicationError::Divergence {
                    seq: launches.min(*theirs),
                    shard: *shard,
                });
            }
        }
        if self.safe {
            let digests = self.digests.lock().unwrap_or_else(PoisonError::into_inner);
            for (seq, entries) in digests.iter() {
                let Some((_, reference)) = entries.iter().find(|(s, _)| s.index() == 0) else {
                    continue;
                };
                if let Some((shard, theirs)) = entries.iter().find(|(_, d)| d != reference) {
                    tracing::error!(
                        seq = *seq,
                        shard = shard.value(),
                        reference = %hex::encode(reference),
                        digest = %hex::encode(theirs),
                        "launch digest mismatch"
                    );
                    return Err(ReplicationError::Divergence { seq: *seq, shard: *shard });
                }
            }
        }
        Ok(())
    }

    fn failure(&self) -> Result<(), ReplicationError> {
        match self.failure.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn bind(setter: &FutureSetter, value: PointValue) {
    match value {
        PointValue::Value(v) => setter.set(Bytes::from(v)),
        PointValue::Empty => setter.set_empty(),
        PointValue::Failed(reason) => setter.fail(reason),
    }
}

/// Digest of one launch's ownership and projection decisions.
pub(crate) fn launch_digest<'a, I>(seq: u64, decisions: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a DomainPoint, ShardId, &'a [u8])>,
{
    let mut hasher = blake3::Hasher::new();
    hasher.update(&seq.to_le_bytes());
    for (point, owner, regions) in decisions {
        hasher.update(&point.to_le_bytes());
        hasher.update(&owner.value().to_le_bytes());
        hasher.update(regions);
    }
    hasher.finalize().as_bytes().to_vec()
}
