// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Must-epoch schedulability checks.
//!
//! Every task of a must-epoch launch runs at the same time on its own
//! processor. The launch is rejected when there are more tasks than
//! processors, when two tasks share a processor, or when two tasks carry a
//! data dependence that would force one to wait for the other.

use rustc_hash::FxHashSet;

use crate::analyzer::Access;
use crate::error::SyncError;
use crate::ident::{ProcessorId, ReductionOpId};

/// Checks the processor assignment.
pub(crate) fn verify_processors(assigned: &[ProcessorId], processors: usize) -> Result<(), SyncError> {
    if assigned.len() > processors {
        return Err(SyncError::MustEpochTooLarge {
            tasks: assigned.len(),
            processors,
        });
    }
    let mut seen = FxHashSet::default();
    for p in assigned {
        if p.index() >= processors || !seen.insert(*p) {
            return Err(SyncError::MustEpochProcessorConflict(*p));
        }
    }
    Ok(())
}

/// Checks that no two tasks (given as their concrete accesses) depend on
/// each other.
pub(crate) fn verify_independence<F>(tasks: &[Vec<Access<'_>>], commutative: F) -> Result<(), SyncError>
where
    F: Fn(ReductionOpId) -> bool,
{
    for (i, a) in tasks.iter().enumerate() {
        for (j, b) in tasks.iter().enumerate().skip(i + 1) {
            let conflict = a
                .iter()
                .any(|x| b.iter().any(|y| x.interferes(y, &commutative)));
            if conflict {
                return Err(SyncError::MustEpochDependence { first: i, second: j });
            }
        }
    }
    Ok(())
}
