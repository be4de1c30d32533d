// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Reduction operators.
//!
//! # Algebraic Categories
//!
//! **Commutative monoids** (permutation-invariant): [`SumU64`](ReduceOp::SumU64),
//! [`SumI64`](ReduceOp::SumI64), [`SumF64`](ReduceOp::SumF64),
//! [`MaxI64`](ReduceOp::MaxI64), [`MinI64`](ReduceOp::MinI64),
//! [`BitOr`](ReduceOp::BitOr), [`BitAnd`](ReduceOp::BitAnd).
//! Concurrent reducers with the same operator never depend on each other.
//!
//! **Order-dependent**: [`DiffI64`](ReduceOp::DiffI64), [`First`](ReduceOp::First),
//! [`Last`](ReduceOp::Last), [`Concat`](ReduceOp::Concat).
//! NOT commutative; every pair of uses is serialized in program order.
//!
//! Values are little-endian byte strings. Numeric operators read exactly
//! eight bytes, zero-padding shorter input and ignoring excess.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::RuntimeError;
use crate::ident::ReductionOpId;

/// A user-registrable reduction operator over byte values.
pub trait ReductionOp: Send + Sync + core::fmt::Debug {
    /// Identity element; `fold(identity, x) == x`.
    fn identity(&self) -> Vec<u8>;
    /// Folds `rhs` into `acc`.
    fn fold(&self, acc: &mut Vec<u8>, rhs: &[u8]);
    /// Whether folding order never changes the result.
    fn is_commutative(&self) -> bool;
}

/// Built-in reduction operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    // ─── COMMUTATIVE MONOIDS ───────────────────────────────────────────
    /// Wrapping sum of u64 values.
    SumU64,
    /// Wrapping sum of i64 values.
    SumI64,
    /// Sum of f64 values (commutative up to rounding).
    SumF64,
    /// Maximum of i64 values.
    MaxI64,
    /// Minimum of i64 values.
    MinI64,
    /// Bitwise OR; shorter values are zero-padded.
    BitOr,
    /// Bitwise AND; result truncated to the shorter value.
    BitAnd,

    // ─── ORDER-DEPENDENT (NOT COMMUTATIVE) ─────────────────────────────
    /// `acc - rhs` over i64 values.
    DiffI64,
    /// Keeps the first value folded in.
    First,
    /// Keeps the last value folded in.
    Last,
    /// Concatenates values in fold order.
    Concat,
}

impl ReduceOp {
    /// All built-ins in id order.
    pub const ALL: [Self; 11] = [
        Self::SumU64,
        Self::SumI64,
        Self::SumF64,
        Self::MaxI64,
        Self::MinI64,
        Self::BitOr,
        Self::BitAnd,
        Self::DiffI64,
        Self::First,
        Self::Last,
        Self::Concat,
    ];

    /// First id available to user-registered operators.
    pub const FIRST_USER_ID: u32 = 1024;

    /// Registry id of this built-in.
    #[must_use]
    pub const fn id(self) -> ReductionOpId {
        ReductionOpId::from_raw(match self {
            Self::SumU64 => 1,
            Self::SumI64 => 2,
            Self::SumF64 => 3,
            Self::MaxI64 => 4,
            Self::MinI64 => 5,
            Self::BitOr => 6,
            Self::BitAnd => 7,
            Self::DiffI64 => 8,
            Self::First => 9,
            Self::Last => 10,
            Self::Concat => 11,
        })
    }

    /// Returns true if this op is a commutative monoid (permutation-invariant).
    #[inline]
    pub const fn commutative(self) -> bool {
        !matches!(self, Self::DiffI64 | Self::First | Self::Last | Self::Concat)
    }

    /// Folds `values` in order starting from the identity.
    pub fn apply<I>(self, values: I) -> Vec<u8>
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let mut acc = ReductionOp::identity(&self);
        for v in values {
            ReductionOp::fold(&self, &mut acc, &v);
        }
        acc
    }
}

fn word(v: &[u8]) -> [u8; 8] {
    let mut buf = [0u8; 8];
    let len = v.len().min(8);
    buf[..len].copy_from_slice(&v[..len]);
    buf
}

fn store(acc: &mut Vec<u8>, bytes: [u8; 8]) {
    acc.clear();
    acc.extend_from_slice(&bytes);
}

impl ReductionOp for ReduceOp {
    fn identity(&self) -> Vec<u8> {
        match self {
            Self::SumU64 | Self::SumI64 | Self::DiffI64 => vec![0u8; 8],
            Self::SumF64 => 0f64.to_le_bytes().to_vec(),
            Self::MaxI64 => i64::MIN.to_le_bytes().to_vec(),
            Self::MinI64 => i64::MAX.to_le_bytes().to_vec(),
            Self::BitOr | Self::BitAnd | Self::First | Self::Last | Self::Concat => Vec::new(),
        }
    }

    fn fold(&self, acc: &mut Vec<u8>, rhs: &[u8]) {
        match self {
            Self::SumU64 => {
                let v = u64::from_le_bytes(word(acc)).wrapping_add(u64::from_le_bytes(word(rhs)));
                store(acc, v.to_le_bytes());
            }
            Self::SumI64 => {
                let v = i64::from_le_bytes(word(acc)).wrapping_add(i64::from_le_bytes(word(rhs)));
                store(acc, v.to_le_bytes());
            }
            Self::SumF64 => {
                let v = f64::from_le_bytes(word(acc)) + f64::from_le_bytes(word(rhs));
                store(acc, v.to_le_bytes());
            }
            Self::MaxI64 => {
                let v = i64::from_le_bytes(word(acc)).max(i64::from_le_bytes(word(rhs)));
                store(acc, v.to_le_bytes());
            }
            Self::MinI64 => {
                let v = i64::from_le_bytes(word(acc)).min(i64::from_le_bytes(word(rhs)));
                store(acc, v.to_le_bytes());
            }
            Self::DiffI64 => {
                let v = i64::from_le_bytes(word(acc)).wrapping_sub(i64::from_le_bytes(word(rhs)));
                store(acc, v.to_le_bytes());
            }
            Self::BitOr => {
                if acc.len() < rhs.len() {
                    acc.resize(rhs.len(), 0);
                }
                for (a, b) in acc.iter_mut().zip(rhs) {
                    *a |= b;
                }
            }
            Self::BitAnd => {
                // Empty accumulator is the identity, not the zero-length value.
                if acc.is_empty() {
                    acc.extend_from_slice(rhs);
                    return;
                }
                acc.truncate(rhs.len());
                for (a, b) in acc.iter_mut().zip(rhs) {
                    *a &= b;
                }
            }
            Self::First => {
                if acc.is_empty() {
                    acc.extend_from_slice(rhs);
                }
            }
            Self::Last => {
                acc.clear();
                acc.extend_from_slice(rhs);
            }
            Self::Concat => acc.extend_from_slice(rhs),
        }
    }

    fn is_commutative(&self) -> bool {
        self.commutative()
    }
}

/// Id → operator table, seeded with every [`ReduceOp`].
#[derive(Debug, Clone)]
pub struct ReductionRegistry {
    ops: BTreeMap<ReductionOpId, Arc<dyn ReductionOp>>,
}

impl Default for ReductionRegistry {
    fn default() -> Self {
        let mut ops: BTreeMap<ReductionOpId, Arc<dyn ReductionOp>> = BTreeMap::new();
        for op in ReduceOp::ALL {
            ops.insert(op.id(), Arc::new(op));
        }
        Self { ops }
    }
}

impl ReductionRegistry {
    /// Registers a user operator.
    pub fn register(&mut self, id: ReductionOpId, op: Arc<dyn ReductionOp>) -> Result<(), RuntimeError> {
        if self.ops.contains_key(&id) {
            return Err(RuntimeError::DuplicateRegistration {
                kind: "reduction operator",
                id: id.value(),
            });
        }
        self.ops.insert(id, op);
        Ok(())
    }

    /// Operator by id.
    pub fn get(&self, id: ReductionOpId) -> Option<&Arc<dyn ReductionOp>> {
        self.ops.get(&id)
    }

    /// Commutativity by id; unknown operators are treated as order-dependent.
    pub fn is_commutative(&self, id: ReductionOpId) -> bool {
        self.ops.get(&id).is_some_and(|op| op.is_commutative())
    }

    /// Folds `values` in iteration order from the identity.
    pub fn reduce<'a, I>(&self, id: ReductionOpId, values: I) -> Result<Vec<u8>, RuntimeError>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let op = self.get(id).ok_or(RuntimeError::UnknownRegistration {
            kind: "reduction operator",
            id: id.value(),
        })?;
        let mut acc = op.identity();
        for v in values {
            op.fold(&mut acc, v);
        }
        Ok(acc)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn le(v: i64) -> Vec<u8> {
        v.to_le_bytes().to_vec()
    }

    #[test]
    fn commutativity_classification() {
        for op in ReduceOp::ALL {
            let expected = !matches!(op, ReduceOp::DiffI64 | ReduceOp::First | ReduceOp::Last | ReduceOp::Concat);
            assert_eq!(op.commutative(), expected, "{op:?}");
        }
    }

    #[test]
    fn numeric_folds() {
        assert_eq!(ReduceOp::SumI64.apply([le(3), le(-5), le(10)]), le(8));
        assert_eq!(ReduceOp::MaxI64.apply([le(3), le(-5), le(10)]), le(10));
        assert_eq!(ReduceOp::MinI64.apply([le(3), le(-5), le(10)]), le(-5));
        assert_eq!(ReduceOp::DiffI64.apply([le(3), le(5)]), le(-8));
        assert_eq!(ReduceOp::SumU64.apply(Vec::<Vec<u8>>::new()), vec![0u8; 8]);
        let f = ReduceOp::SumF64.apply([1.5f64.to_le_bytes().to_vec(), 2.25f64.to_le_bytes().to_vec()]);
        assert_eq!(f, 3.75f64.to_le_bytes().to_vec());
    }

    #[test]
    fn order_dependent_folds() {
        let vals = || vec![vec![1u8], vec![2u8, 3], vec![4u8]];
        assert_eq!(ReduceOp::First.apply(vals()), vec![1]);
        assert_eq!(ReduceOp::Last.apply(vals()), vec![4]);
        assert_eq!(ReduceOp::Concat.apply(vals()), vec![1, 2, 3, 4]);
    }

    #[test]
    fn bitwise_folds_pad_and_truncate() {
        assert_eq!(ReduceOp::BitOr.apply([vec![0b0001], vec![0b0100, 0xFF]]), vec![0b0101, 0xFF]);
        assert_eq!(ReduceOp::BitAnd.apply([vec![0b0111, 0xFF], vec![0b0101]]), vec![0b0101]);
    }

    #[test]
    fn registry_rejects_duplicates_and_unknown_ids() {
        let mut reg = ReductionRegistry::default();
        assert!(reg.is_commutative(ReduceOp::SumI64.id()));
        assert!(!reg.is_commutative(ReduceOp::Concat.id()));
        assert!(!reg.is_commutative(ReductionOpId::from_raw(9999)));
        assert!(reg.register(ReduceOp::SumI64.id(), Arc::new(ReduceOp::MaxI64)).is_err());
        let id = ReductionOpId::from_raw(ReduceOp::FIRST_USER_ID);
        reg.register(id, Arc::new(ReduceOp::MaxI64)).unwrap();
        let out = reg.reduce(id, [le(1).as_slice(), le(7).as_slice()]).unwrap();
        assert_eq!(out, le(7));
        assert!(reg.reduce(ReductionOpId::from_raw(4242), []).is_err());
    }
}
