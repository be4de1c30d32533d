// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

// Analyzer decision events and per-context counters.
//
// Per-decision events are emitted at `trace` level only with the
// `telemetry` feature; the context summary is always emitted at `debug`.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::ident::{ContextId, FieldId, OpId};
use crate::privilege::DependenceType;

/// Emits a dependence edge `prior -> op` discovered on `field`.
#[cfg(feature = "telemetry")]
pub(crate) fn dependence(ctx: ContextId, op: OpId, prior: OpId, field: FieldId, kind: DependenceType) {
    tracing::trace!(
        target: "tessera::analyzer",
        ctx = ctx.value(),
        op = op.value(),
        prior = prior.value(),
        field = field.value(),
        kind = ?kind,
        "dependence"
    );
}

#[cfg(not(feature = "telemetry"))]
#[inline]
pub(crate) fn dependence(_ctx: ContextId, _op: OpId, _prior: OpId, _field: FieldId, _kind: DependenceType) {}

/// Emits the eviction of `prior`'s use of `field`, superseded by `op`.
#[cfg(feature = "telemetry")]
pub(crate) fn evicted(ctx: ContextId, op: OpId, prior: OpId, field: FieldId) {
    tracing::trace!(
        target: "tessera::analyzer",
        ctx = ctx.value(),
        op = op.value(),
        prior = prior.value(),
        field = field.value(),
        "evicted"
    );
}

#[cfg(not(feature = "telemetry"))]
#[inline]
pub(crate) fn evicted(_ctx: ContextId, _op: OpId, _prior: OpId, _field: FieldId) {}

/// Emits a rejected launch whose requirements or points interfere.
pub(crate) fn interference(ctx: ContextId, op: OpId, reason: &dyn core::fmt::Display) {
    tracing::warn!(
        target: "tessera::analyzer",
        ctx = ctx.value(),
        op = op.value(),
        %reason,
        "interference rejected"
    );
}

/// Counters for one context.
#[derive(Debug, Default)]
pub(crate) struct ContextCounters {
    issued: AtomicU64,
    dependences: AtomicU64,
    evictions: AtomicU64,
    remaps: AtomicU64,
    replays: AtomicU64,
    resolved_false: AtomicU64,
    failed: AtomicU64,
}

impl ContextCounters {
    pub(crate) fn issued(&self) {
        self.issued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dependences(&self, n: usize) {
        self.dependences.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn evictions(&self, n: usize) {
        self.evictions.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn remap(&self) {
        self.remaps.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn replay(&self) {
        self.replays.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn resolved_false(&self) {
        self.resolved_false.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, committed: u64) -> ContextStats {
        ContextStats {
            issued: self.issued.load(Ordering::Relaxed),
            committed,
            dependences: self.dependences.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            remaps: self.remaps.load(Ordering::Relaxed),
            replays: self.replays.load(Ordering::Relaxed),
            resolved_false: self.resolved_false.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of a context's activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    /// Operations issued.
    pub issued: u64,
    /// Operations committed.
    pub committed: u64,
    /// Dependence edges recorded.
    pub dependences: u64,
    /// Users evicted by dominating writers.
    pub evictions: u64,
    /// Mapper remap attempts.
    pub remaps: u64,
    /// Resilient re-executions.
    pub replays: u64,
    /// Operations skipped by a false predicate.
    pub resolved_false: u64,
    /// Operations that failed.
    pub failed: u64,
}

/// Emits the summary of a context at `debug` level.
pub(crate) fn summary(ctx: ContextId, stats: &ContextStats) {
    tracing::debug!(
        target: "tessera::context",
        ctx = ctx.value(),
        issued = stats.issued,
        committed = stats.committed,
        dependences = stats.dependences,
        evictions = stats.evictions,
        remaps = stats.remaps,
        replays = stats.replays,
        "context summary"
    );
}
