// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Explicit synchronization: phase barriers, dynamic collectives,
//! reservations and must-epoch checks.

pub mod barrier;
pub(crate) mod must_epoch;
pub mod reservation;

pub use barrier::{BarrierTable, DynamicCollective, PhaseBarrier};
pub use reservation::{Grant, LockMode, Reservation, ReservationTable};
