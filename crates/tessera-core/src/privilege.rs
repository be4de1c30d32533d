// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Privileges, coherence modes and the dependence relation between two uses
//! of the same data.
//!
//! The relation is a pair of static tables: one over privilege classes
//! (none, read, write, reduce) giving the hazard kind, and one over coherence
//! modes deciding whether that hazard orders the two uses, serializes them
//! without ordering, or is ignored. [`dependence_type`] combines them with the
//! commutative-reduction escape.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ident::{FieldId, ReductionOpId};

/// Access rights requested on a region's fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Privilege {
    /// No access; useful to name a region purely for ordering.
    NoAccess,
    /// Read only.
    ReadOnly,
    /// Read and write.
    ReadWrite,
    /// Write every point without reading prior contents.
    WriteDiscard,
    /// Fold contributions with the named reduction operator.
    Reduce(ReductionOpId),
}

impl Privilege {
    /// Whether the holder may observe prior contents.
    #[must_use]
    pub const fn reads(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    /// Whether the holder may overwrite contents.
    #[must_use]
    pub const fn writes(self) -> bool {
        matches!(self, Self::ReadWrite | Self::WriteDiscard)
    }

    /// The reduction operator, for reduce privileges.
    #[must_use]
    pub const fn reduction(self) -> Option<ReductionOpId> {
        match self {
            Self::Reduce(op) => Some(op),
            _ => None,
        }
    }

    /// Whether a context holding `held` may grant `self` to a child.
    #[must_use]
    pub fn is_subsumed_by(self, held: Self) -> bool {
        match (self, held) {
            (Self::NoAccess, _) | (_, Self::ReadWrite) => true,
            (Self::ReadOnly, Self::ReadOnly) | (Self::WriteDiscard, Self::WriteDiscard) => true,
            (Self::Reduce(a), Self::Reduce(b)) => a == b,
            _ => false,
        }
    }

    const fn class(self) -> usize {
        match self {
            Self::NoAccess => 0,
            Self::ReadOnly => 1,
            Self::ReadWrite | Self::WriteDiscard => 2,
            Self::Reduce(_) => 3,
        }
    }
}

/// How concurrent users of the same data coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Coherence {
    /// Program-order semantics.
    Exclusive,
    /// Serialized in some order, not necessarily program order.
    Atomic,
    /// May run concurrently; all see one copy of the data.
    Simultaneous,
    /// May run concurrently with arbitrary reordering.
    Relaxed,
}

impl Coherence {
    const fn class(self) -> usize {
        match self {
            Self::Exclusive => 0,
            Self::Atomic => 1,
            Self::Simultaneous => 2,
            Self::Relaxed => 3,
        }
    }
}

/// Privilege and coherence of one recorded use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionUsage {
    /// Privilege requested.
    pub privilege: Privilege,
    /// Coherence requested.
    pub coherence: Coherence,
    /// Fence uses (acquire/release) order against every prior use
    /// regardless of privilege or coherence.
    pub fence: bool,
}

impl RegionUsage {
    /// Ordinary use.
    #[must_use]
    pub const fn new(privilege: Privilege, coherence: Coherence) -> Self {
        Self {
            privilege,
            coherence,
            fence: false,
        }
    }

    /// Fence use: read-write exclusive, ordering against all prior users.
    #[must_use]
    pub const fn fence() -> Self {
        Self {
            privilege: Privilege::ReadWrite,
            coherence: Coherence::Exclusive,
            fence: true,
        }
    }

    /// Whether this use overwrites everything it covers under a serializing
    /// coherence, so that dominated prior users can be evicted.
    #[must_use]
    pub const fn dominates(&self) -> bool {
        self.fence
            || (self.privilege.writes()
                && matches!(self.coherence, Coherence::Exclusive | Coherence::Atomic))
    }
}

/// Hazard between a prior and a later use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependenceType {
    /// No hazard.
    NoDependence,
    /// Read after write.
    TrueDependence,
    /// Write after read.
    AntiDependence,
    /// Write after write.
    OutputDependence,
    /// Serialized in arbitrary order.
    AtomicDependence,
    /// Hazard waived by simultaneous coherence.
    SimultaneousDependence,
    /// Hazard waived by relaxed coherence.
    RelaxedDependence,
}

impl DependenceType {
    /// Whether the later use must wait for the prior one.
    #[must_use]
    pub const fn orders(self) -> bool {
        matches!(
            self,
            Self::TrueDependence | Self::AntiDependence | Self::OutputDependence | Self::AtomicDependence
        )
    }
}

use DependenceType::{
    AntiDependence as A, NoDependence as N, OutputDependence as O, TrueDependence as T,
};

/// Hazard by privilege class: `[prior][next]` over (none, read, write, reduce).
///
/// Reduce-after-reduce is listed as a true dependence; the commutative
/// same-operator case is waived separately.
const PRIVILEGE_TABLE: [[DependenceType; 4]; 4] = [
    [N, N, N, N],
    [N, N, A, A],
    [N, T, O, T],
    [N, T, O, T],
];

/// What coherence does to a hazard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoherenceRule {
    Ordered,
    Atomic,
    Simultaneous,
    Relaxed,
}

use CoherenceRule::{Atomic as At, Ordered as Or, Relaxed as Re, Simultaneous as Si};

/// Coherence combination: `[prior][next]` over (exclusive, atomic,
/// simultaneous, relaxed). Relaxed wins over simultaneous, which wins over
/// atomic.
const COHERENCE_TABLE: [[CoherenceRule; 4]; 4] = [
    [Or, At, Si, Re],
    [At, At, Si, Re],
    [Si, Si, Si, Re],
    [Re, Re, Re, Re],
];

/// Dependence between a `prior` use and a `next` use of overlapping data.
///
/// `commutative` reports whether a reduction operator is order-independent;
/// unknown operators should report `false`.
pub fn dependence_type<F>(prior: &RegionUsage, next: &RegionUsage, commutative: F) -> DependenceType
where
    F: Fn(ReductionOpId) -> bool,
{
    let base = PRIVILEGE_TABLE[prior.privilege.class()][next.privilege.class()];
    if prior.fence || next.fence {
        return if base == N && prior.privilege != Privilege::NoAccess && next.privilege != Privilege::NoAccess {
            T
        } else {
            base
        };
    }
    if base == N {
        return N;
    }
    let rule = COHERENCE_TABLE[prior.coherence.class()][next.coherence.class()];
    match rule {
        CoherenceRule::Simultaneous => return DependenceType::SimultaneousDependence,
        CoherenceRule::Relaxed => return DependenceType::RelaxedDependence,
        CoherenceRule::Ordered | CoherenceRule::Atomic => {}
    }
    if let (Privilege::Reduce(a), Privilege::Reduce(b)) = (prior.privilege, next.privilege) {
        if a == b && commutative(a) {
            return if rule == CoherenceRule::Atomic {
                DependenceType::AtomicDependence
            } else {
                N
            };
        }
    }
    if rule == CoherenceRule::Atomic {
        DependenceType::AtomicDependence
    } else {
        base
    }
}

/// Ordered set of fields named by a requirement.
pub type FieldSet = BTreeSet<FieldId>;

/// Early-exit intersection check for two ordered `BTreeSet`s.
///
/// Uses the merge algorithm on sorted iterators for O(n+m) complexity with
/// early exit on first match.
pub(crate) fn intersects_btree<K: Ord>(a: &BTreeSet<K>, b: &BTreeSet<K>) -> bool {
    let mut it_a = a.iter();
    let mut it_b = b.iter();
    let mut va = it_a.next();
    let mut vb = it_b.next();
    while let (Some(x), Some(y)) = (va, vb) {
        match x.cmp(y) {
            core::cmp::Ordering::Less => va = it_a.next(),
            core::cmp::Ordering::Greater => vb = it_b.next(),
            core::cmp::Ordering::Equal => return true,
        }
    }
    false
}
