// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Reservations (locks) and grants.
//!
//! Acquisition never blocks the caller: it returns an event that triggers
//! once the reservation is held. Waiters are served first-come first-served;
//! consecutive shared waiters are granted together.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::event::{Event, UserEvent};
use crate::ident::ReservationId;

/// How a reservation is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockMode {
    /// Sole holder.
    Exclusive,
    /// Any number of shared holders.
    Shared,
}

/// Handle to a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reservation {
    id: ReservationId,
}

impl Reservation {
    /// Reservation id.
    pub const fn id(&self) -> ReservationId {
        self.id
    }
}

/// Locks held for the duration of one deferred operation. Acquired in
/// reservation order immediately before the operation runs; released when
/// it finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Grant {
    locks: Vec<(Reservation, LockMode)>,
}

impl Grant {
    /// Empty grant.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a lock, keeping the set ordered and de-duplicated.
    #[must_use]
    pub fn with(mut self, reservation: Reservation, mode: LockMode) -> Self {
        match self.locks.binary_search_by_key(&reservation, |(r, _)| *r) {
            Ok(i) => {
                if mode == LockMode::Exclusive {
                    self.locks[i].1 = LockMode::Exclusive;
                }
            }
            Err(i) => self.locks.insert(i, (reservation, mode)),
        }
        self
    }

    /// Locks in acquisition order.
    pub fn locks(&self) -> &[(Reservation, LockMode)] {
        &self.locks
    }

    /// Whether the grant holds nothing.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[derive(Debug, Default)]
struct LockState {
    exclusive: bool,
    shared: u32,
    waiters: VecDeque<(LockMode, UserEvent)>,
}

impl LockState {
    fn compatible(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Exclusive => !self.exclusive && self.shared == 0,
            LockMode::Shared => !self.exclusive,
        }
    }

    fn take(&mut self, mode: LockMode) {
        match mode {
            LockMode::Exclusive => self.exclusive = true,
            LockMode::Shared => self.shared += 1,
        }
    }
}

/// Runtime-wide reservation table.
#[derive(Debug)]
pub struct ReservationTable {
    locks: Mutex<FxHashMap<ReservationId, LockState>>,
    next_id: AtomicU64,
}

impl Default for ReservationTable {
    fn default() -> Self {
        Self {
            locks: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl ReservationTable {
    /// Creates a reservation; with `key`, creation is idempotent.
    pub fn create(&self, key: Option<ReservationId>) -> Reservation {
        let id = key.unwrap_or_else(|| ReservationId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed)));
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_default();
        Reservation { id }
    }

    /// Event triggering once `reservation` is held in `mode`.
    pub fn acquire(&self, reservation: Reservation, mode: LockMode) -> Result<Event, SyncError> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let state = locks
            .get_mut(&reservation.id)
            .ok_or(SyncError::UnknownReservation(reservation.id))?;
        if state.waiters.is_empty() && state.compatible(mode) {
            state.take(mode);
            return Ok(Event::no_event());
        }
        let waiter = UserEvent::new();
        state.waiters.push_back((mode, waiter.clone()));
        Ok(waiter.event())
    }

    /// Releases one hold of `reservation` in `mode`.
    pub fn release(&self, reservation: Reservation, mode: LockMode) -> Result<(), SyncError> {
        let granted = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            let state = locks
                .get_mut(&reservation.id)
                .ok_or(SyncError::UnknownReservation(reservation.id))?;
            match mode {
                LockMode::Exclusive if state.exclusive => state.exclusive = false,
                LockMode::Shared if state.shared > 0 => state.shared -= 1,
                _ => return Err(SyncError::ReleaseWithoutAcquire(reservation.id)),
            }
            let mut granted = Vec::new();
            while let Some((next, _)) = state.waiters.front() {
                if !state.compatible(*next) {
                    break;
                }
                let Some((next, waiter)) = state.waiters.pop_front() else {
                    break;
                };
                state.take(next);
                granted.push(waiter);
            }
            granted
        };
        for w in granted {
            w.trigger();
        }
        Ok(())
    }

    /// Event triggering once every lock of `grant` is held, acquiring them
    /// one at a time in reservation order.
    pub fn acquire_grant(self: &Arc<Self>, grant: &Grant) -> Result<Event, SyncError> {
        {
            let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((r, _)) = grant.locks.iter().find(|(r, _)| !locks.contains_key(&r.id)) {
                return Err(SyncError::UnknownReservation(r.id));
            }
        }
        if grant.is_empty() {
            return Ok(Event::no_event());
        }
        let done = UserEvent::new();
        Self::acquire_from(Arc::clone(self), Arc::from(grant.locks.clone()), 0, done.clone());
        Ok(done.event())
    }

    fn acquire_from(table: Arc<Self>, locks: Arc<[(Reservation, LockMode)]>, index: usize, done: UserEvent) {
        let Some((reservation, mode)) = locks.get(index).copied() else {
            done.trigger();
            return;
        };
        match table.acquire(reservation, mode) {
            Ok(held) => {
                let next = Arc::clone(&table);
                held.subscribe(move |_| Self::acquire_from(next, locks, index + 1, done));
            }
            Err(_) => {
                done.poison();
            }
        }
    }

    /// Releases every lock of `grant`, in reverse order.
    pub fn release_grant(&self, grant: &Grant) -> Result<(), SyncError> {
        for (r, mode) in grant.locks.iter().rev() {
            self.release(*r, *mode)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_waiters_are_fifo() {
        let t = ReservationTable::default();
        let r = t.create(None);
        assert!(t.acquire(r, LockMode::Exclusive).unwrap().has_triggered());
        let second = t.acquire(r, LockMode::Exclusive).unwrap();
        let third = t.acquire(r, LockMode::Shared).unwrap();
        assert!(!second.has_triggered());
        t.release(r, LockMode::Exclusive).unwrap();
        assert!(second.has_triggered());
        assert!(!third.has_triggered());
        t.release(r, LockMode::Exclusive).unwrap();
        assert!(third.has_triggered());
        assert_eq!(t.release(r, LockMode::Exclusive), Err(SyncError::ReleaseWithoutAcquire(r.id())));
    }

    #[test]
    fn shared_holders_coexist() {
        let t = ReservationTable::default();
        let r = t.create(None);
        assert!(t.acquire(r, LockMode::Shared).unwrap().has_triggered());
        assert!(t.acquire(r, LockMode::Shared).unwrap().has_triggered());
        let ex = t.acquire(r, LockMode::Exclusive).unwrap();
        t.release(r, LockMode::Shared).unwrap();
        assert!(!ex.has_triggered());
        t.release(r, LockMode::Shared).unwrap();
        assert!(ex.has_triggered());
    }

    #[test]
    fn grants_acquire_in_order_and_release_all() {
        let t = Arc::new(ReservationTable::default());
        let a = t.create(None);
        let b = t.create(None);
        let grant = Grant::new().with(b, LockMode::Shared).with(a, LockMode::Exclusive).with(b, LockMode::Exclusive);
        assert_eq!(grant.locks(), &[(a, LockMode::Exclusive), (b, LockMode::Exclusive)]);
        let blocker = t.acquire(b, LockMode::Exclusive).unwrap();
        assert!(blocker.has_triggered());
        let held = t.acquire_grant(&grant).unwrap();
        assert!(!held.has_triggered());
        t.release(b, LockMode::Exclusive).unwrap();
        assert!(held.has_triggered());
        t.release_grant(&grant).unwrap();
        assert!(t.acquire(a, LockMode::Exclusive).unwrap().has_triggered());
    }
}
