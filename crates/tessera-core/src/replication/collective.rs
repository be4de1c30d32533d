// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Cross-shard reduction of future maps.
//!
//! Unordered reductions run a butterfly all-reduce over the largest power of
//! two `p` not exceeding the shard count. Shards `p..n` first fold their
//! partial into shard `i - p`, and receive the final value back from it.
//! Within each exchange the lower shard's partial is folded first, so both
//! partners compute bit-identical results even for floating point.

use std::sync::{Condvar, Mutex, PoisonError};

use rustc_hash::FxHashMap;

use crate::error::ReplicationError;
use crate::ident::ShardId;
use crate::reduction::ReductionOp;

use super::transport::{send_message, ShardMessage, Transport};

/// Round carrying extra shards' partials into the butterfly.
const FOLD_IN: u32 = 0;
/// Round returning the result to extra shards.
const FAN_OUT: u32 = u32::MAX;

/// How `reduce_future_map` combines point values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReduceMode {
    /// Fold every point in canonical point order on every shard.
    /// Deterministic for any operator.
    #[default]
    Ordered,
    /// Fold local points, then all-reduce across shards. Requires a
    /// commutative operator.
    Unordered,
}

type SlotKey = (u64, u32, ShardId);

/// Reduction partials received from peers, keyed by (tag, round, sender).
#[derive(Debug, Default)]
pub(crate) struct CollectiveInbox {
    slots: Mutex<FxHashMap<SlotKey, Vec<u8>>>,
    arrived: Condvar,
}

impl CollectiveInbox {
    pub(crate) fn deliver(&self, tag: u64, round: u32, from: ShardId, value: Vec<u8>) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((tag, round, from), value);
        self.arrived.notify_all();
    }

    fn take(&self, tag: u64, round: u32, from: ShardId) -> Vec<u8> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(v) = slots.remove(&(tag, round, from)) {
                return v;
            }
            slots = self.arrived.wait(slots).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

fn combine(op: &dyn ReductionOp, lower: &[u8], upper: &[u8]) -> Vec<u8> {
    let mut acc = op.identity();
    op.fold(&mut acc, lower);
    op.fold(&mut acc, upper);
    acc
}

fn send(transport: &dyn Transport, to: usize, tag: u64, round: u32, value: &[u8]) -> Result<(), ReplicationError> {
    send_message(
        transport,
        ShardId::from_raw(to as u32),
        &ShardMessage::Reduce {
            tag,
            round,
            from: transport.shard(),
            value: value.to_vec(),
        },
    )
}

/// All-reduces `local` across every shard; every shard gets the same value.
pub(crate) fn all_reduce(
    transport: &dyn Transport,
    inbox: &CollectiveInbox,
    tag: u64,
    local: Vec<u8>,
    op: &dyn ReductionOp,
) -> Result<Vec<u8>, ReplicationError> {
    let n = transport.shards();
    let me = transport.shard().index();
    if n <= 1 {
        return Ok(local);
    }
    let p = 1usize << (usize::BITS - 1 - n.leading_zeros());
    let peer = |i: usize| ShardId::from_raw(i as u32);

    if me >= p {
        send(transport, me - p, tag, FOLD_IN, &local)?;
        return Ok(inbox.take(tag, FAN_OUT, peer(me - p)));
    }

    let mut value = local;
    if me + p < n {
        let extra = inbox.take(tag, FOLD_IN, peer(me + p));
        value = combine(op, &value, &extra);
    }
    let mut stride = 1usize;
    let mut round = 1u32;
    while stride < p {
        let partner = me ^ stride;
        send(transport, partner, tag, round, &value)?;
        let theirs = inbox.take(tag, round, peer(partner));
        value = if me < partner {
            combine(op, &value, &theirs)
        } else {
            combine(op, &theirs, &value)
        };
        stride <<= 1;
        round += 1;
    }
    if me + p < n {
        send(transport, me + p, tag, FAN_OUT, &value)?;
    }
    Ok(value)
}
