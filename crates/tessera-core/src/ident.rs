// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Identifier types.
//!
//! Every handle the runtime hands out is a thin `#[repr(transparent)]`
//! wrapper around an integer. Wrappers keep index spaces, field spaces and
//! operations from being mixed up at call sites; the integers themselves are
//! process-local and never hashed into anything persistent except the
//! replication digests, which only compare values produced by the same
//! binary.

use serde::{Deserialize, Serialize};

macro_rules! integer_id {
    ($(#[$meta:meta])* $name:ident($repr:ty)) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name($repr);

        impl $name {
            /// Constructs the id from its raw value.
            #[must_use]
            pub const fn from_raw(value: $repr) -> Self {
                Self(value)
            }

            /// Returns the underlying raw value.
            #[must_use]
            pub const fn value(self) -> $repr {
                self.0
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

integer_id!(
    /// Handle to a node of an index-space tree (a set of points).
    IndexSpaceId(u32)
);
integer_id!(
    /// Handle to a partition of an index space.
    IndexPartitionId(u32)
);
integer_id!(
    /// Handle to a field space (a set of typed fields).
    FieldSpaceId(u32)
);
integer_id!(
    /// Field identifier, unique within its field space.
    FieldId(u32)
);
integer_id!(
    /// Identifies one region tree: the pairing of an index-space tree with a
    /// field space created by one `create_logical_region` call.
    RegionTreeId(u32)
);
integer_id!(
    /// Runtime-unique operation identifier.
    ///
    /// Issued monotonically by the runtime; zero is never issued.
    OpId(u64)
);
integer_id!(
    /// Identifies a context (the top-level context or one task execution's
    /// child scope).
    ContextId(u64)
);
integer_id!(
    /// Registered task identifier.
    TaskId(u32)
);
integer_id!(
    /// Registered projection functor identifier. Zero is the identity functor.
    ProjectionId(u32)
);
integer_id!(
    /// Registered sharding functor identifier. Zero is the block functor.
    ShardingId(u32)
);
integer_id!(
    /// Registered reduction operator identifier.
    ReductionOpId(u32)
);
integer_id!(
    /// Registered serialize/deserialize operator identifier.
    SerdezId(u32)
);
integer_id!(
    /// A worker processor (one run queue).
    ProcessorId(u32)
);
integer_id!(
    /// One replica of a control-replicated context.
    ShardId(u32)
);
integer_id!(
    /// Phase barrier (and dynamic collective) table key.
    BarrierId(u64)
);
integer_id!(
    /// Reservation table key.
    ReservationId(u64)
);

impl ProcessorId {
    /// Index into per-processor tables.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl ShardId {
    /// Index into per-shard tables.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip_and_display() {
        let op = OpId::from_raw(42);
        assert_eq!(op.value(), 42);
        assert_eq!(op.to_string(), "42");
        assert!(OpId::from_raw(1) < OpId::from_raw(2));
        assert_eq!(ProcessorId::from_raw(3).index(), 3);
    }
}
