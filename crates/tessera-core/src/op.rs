// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Operation kinds, states and the per-context in-flight table.
//!
//! The table holds every operation from issue until commit. Operations
//! finish in any order but commit strictly in program (sequence) order; a
//! finished operation stays in the table until everything issued before it
//! has finished too.

use std::collections::{BTreeMap, VecDeque};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::event::Event;
use crate::ident::{BarrierId, ContextId, OpId};

/// What an operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Single task launch.
    Task,
    /// Index-space task launch.
    IndexTask,
    /// Region-to-region copy.
    Copy,
    /// Field fill.
    Fill,
    /// Simultaneous-coherence acquire.
    Acquire,
    /// Simultaneous-coherence release.
    Release,
    /// Execution fence.
    Fence,
    /// Inline mapping held by the issuing context.
    InlineMapping,
    /// Partition computed from field data.
    DependentPartition,
    /// Co-scheduled task group.
    MustEpoch,
}

/// Lifecycle of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpState {
    /// Issued, not yet analysed.
    Created,
    /// Preconditions known.
    Analyzed,
    /// Preconditions satisfied.
    Ready,
    /// Instances and processor chosen.
    Mapped,
    /// Body running.
    Executing,
    /// Body finished; results bound.
    Completed,
    /// Every earlier operation has finished; bookkeeping released.
    Committed,
    /// Predicate resolved false; results empty.
    ResolvedFalse,
    /// Body or mapping failed; results poisoned.
    Failed,
}

impl OpState {
    /// Whether the operation will not run any further.
    pub const fn is_finished(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Committed | Self::ResolvedFalse | Self::Failed
        )
    }
}

/// A barrier generation an operation waits on or arrives at.
pub(crate) type BarrierGen = (BarrierId, u32);

#[derive(Debug)]
pub(crate) struct OpRecord {
    pub(crate) id: OpId,
    pub(crate) kind: OpKind,
    pub(crate) state: OpState,
    pub(crate) completion: Event,
    pub(crate) deps: Vec<OpId>,
    pub(crate) waits: Vec<BarrierGen>,
}

/// In-flight operations of one context, keyed by sequence number.
#[derive(Debug, Default)]
pub(crate) struct OpTable {
    ops: BTreeMap<u64, OpRecord>,
    seq_of: FxHashMap<OpId, u64>,
    /// Dependence edges of in-flight operations and the most recently committed ones.
    history: FxHashMap<OpId, Vec<OpId>>,
    /// Committed operations still in `history`, oldest first.
    retired: VecDeque<OpId>,
    committed: u64,
}

/// Committed operations whose dependence edges stay queryable.
pub(crate) const HISTORY_WINDOW: usize = 1024;

impl OpTable {
    pub(crate) fn insert(&mut self, seq: u64, record: OpRecord) {
        self.seq_of.insert(record.id, seq);
        self.history.insert(record.id, record.deps.clone());
        self.ops.insert(seq, record);
    }

    fn get_mut(&mut self, op: OpId) -> Option<&mut OpRecord> {
        let seq = self.seq_of.get(&op)?;
        self.ops.get_mut(seq)
    }

    /// Moves `op` to `state`; returns the previous state.
    pub(crate) fn transition(&mut self, ctx: ContextId, op: OpId, state: OpState) -> Option<OpState> {
        let rec = self.get_mut(op)?;
        let prev = rec.state;
        if prev.is_finished() {
            return Some(prev);
        }
        rec.state = state;
        tracing::debug!(ctx = ctx.value(), op = op.value(), kind = ?rec.kind, from = ?prev, state = ?state, "op transition");
        Some(prev)
    }

    /// Marks `op` finished in `state` and commits every finished operation at
    /// the head of program order. Returns the committed ids.
    pub(crate) fn finish(&mut self, ctx: ContextId, op: OpId, state: OpState) -> Vec<OpId> {
        self.transition(ctx, op, state);
        let mut committed = Vec::new();
        while let Some(entry) = self.ops.first_entry() {
            if !entry.get().state.is_finished() {
                break;
            }
            let rec = entry.remove();
            self.seq_of.remove(&rec.id);
            self.retired.push_back(rec.id);
            if self.retired.len() > HISTORY_WINDOW {
                if let Some(old) = self.retired.pop_front() {
                    self.history.remove(&old);
                }
            }
            self.committed += 1;
            tracing::trace!(ctx = ctx.value(), op = rec.id.value(), state = ?OpState::Committed, "op transition");
            committed.push(rec.id);
        }
        committed
    }

    pub(crate) fn state(&self, op: OpId) -> Option<OpState> {
        let seq = self.seq_of.get(&op)?;
        self.ops.get(seq).map(|r| r.state)
    }

    pub(crate) fn dependences(&self, op: OpId) -> Option<Vec<OpId>> {
        self.history.get(&op).cloned()
    }

    /// Completion events of every unfinished operation.
    pub(crate) fn pending_events(&self) -> Vec<Event> {
        self.ops
            .values()
            .filter(|r| !r.state.is_finished())
            .map(|r| r.completion.clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }

    pub(crate) fn committed(&self) -> u64 {
        self.committed
    }

    /// Whether any unfinished operation reachable through `roots` (inclusive)
    /// along dependence edges waits on `target`.
    pub(crate) fn reaches_wait(&self, roots: &[OpId], target: BarrierGen) -> bool {
        let mut seen = FxHashSet::default();
        let mut queue: VecDeque<OpId> = roots.iter().copied().collect();
        while let Some(op) = queue.pop_front() {
            if !seen.insert(op) {
                continue;
            }
            let Some(rec) = self.seq_of.get(&op).and_then(|s| self.ops.get(s)) else {
                continue;
            };
            if rec.state.is_finished() {
                continue;
            }
            if rec.waits.contains(&target) {
                return true;
            }
            queue.extend(rec.deps.iter().copied());
        }
        false
    }
}
