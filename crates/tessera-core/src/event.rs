// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Completion events.
//!
//! An [`Event`] triggers exactly once, optionally poisoned. Consumers either
//! block on it or subscribe a callback; callbacks run on the triggering
//! thread after the event's lock is released. Poison travels through
//! [`Event::merge`] so failures propagate along dependence chains.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::worker;

type Callback = Box<dyn FnOnce(bool) + Send + 'static>;

#[derive(Default)]
struct EventState {
    triggered: bool,
    poisoned: bool,
    callbacks: Vec<Callback>,
}

#[derive(Default)]
struct EventInner {
    state: Mutex<EventState>,
    condvar: Condvar,
}

/// A one-shot completion signal.
#[derive(Clone, Default)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl core::fmt::Debug for Event {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let st = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Event")
            .field("triggered", &st.triggered)
            .field("poisoned", &st.poisoned)
            .finish_non_exhaustive()
    }
}

impl Event {
    /// An event that has already triggered cleanly.
    pub fn no_event() -> Self {
        let ev = Self::default();
        ev.fire(false);
        ev
    }

    /// An untriggered event.
    pub(crate) fn pending() -> Self {
        Self::default()
    }

    /// Whether the event has triggered.
    pub fn has_triggered(&self) -> bool {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .triggered
    }

    /// Whether the event triggered poisoned. `false` while untriggered.
    pub fn is_poisoned(&self) -> bool {
        let st = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.triggered && st.poisoned
    }

    /// Blocks until the event triggers; returns whether it was poisoned.
    ///
    /// Worker threads keep running queued jobs while they wait.
    pub fn wait(&self) -> bool {
        if !self.has_triggered() {
            if let Some(wake) = worker::waker() {
                self.subscribe(move |_| wake());
                worker::help_until(|| self.has_triggered());
            } else {
                let mut st = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
                while !st.triggered {
                    st = self
                        .inner
                        .condvar
                        .wait(st)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        self.is_poisoned()
    }

    /// Blocks for at most `timeout`; returns whether the event triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        while !st.triggered {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            st = self
                .inner
                .condvar
                .wait_timeout(st, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Runs `f(poisoned)` once the event triggers (immediately if it has).
    pub fn subscribe<F>(&self, f: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let mut st = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        if st.triggered {
            let poisoned = st.poisoned;
            drop(st);
            f(poisoned);
        } else {
            st.callbacks.push(Box::new(f));
        }
    }

    /// Event that triggers once every input has; poisoned if any input was.
    pub fn merge<I: IntoIterator<Item = Self>>(events: I) -> Self {
        let events: Vec<Self> = events.into_iter().filter(|e| !e.is_clean()).collect();
        match events.len() {
            0 => Self::no_event(),
            1 => events.into_iter().next().unwrap_or_else(Self::no_event),
            n => {
                let merged = Self::pending();
                let remaining = Arc::new(std::sync::atomic::AtomicUsize::new(n));
                let poisoned = Arc::new(std::sync::atomic::AtomicBool::new(false));
                for e in events {
                    let merged = merged.clone();
                    let remaining = Arc::clone(&remaining);
                    let poisoned = Arc::clone(&poisoned);
                    e.subscribe(move |p| {
                        use std::sync::atomic::Ordering;
                        if p {
                            poisoned.store(true, Ordering::Release);
                        }
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            merged.fire(poisoned.load(Ordering::Acquire));
                        }
                    });
                }
                merged
            }
        }
    }

    /// Whether both handles name the same event.
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn is_clean(&self) -> bool {
        let st = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.triggered && !st.poisoned
    }

    /// Triggers the event. Returns `false` if it had already triggered.
    pub(crate) fn fire(&self, poisoned: bool) -> bool {
        let callbacks = {
            let mut st = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            if st.triggered {
                return false;
            }
            st.triggered = true;
            st.poisoned = poisoned;
            std::mem::take(&mut st.callbacks)
        };
        self.inner.condvar.notify_all();
        for cb in callbacks {
            cb(poisoned);
        }
        true
    }
}

/// An event triggered explicitly by application code.
#[derive(Clone, Debug, Default)]
pub struct UserEvent {
    event: Event,
}

impl UserEvent {
    /// Creates an untriggered user event.
    pub fn new() -> Self {
        Self::default()
    }

    /// The underlying event, for use as a precondition.
    pub fn event(&self) -> Event {
        self.event.clone()
    }

    /// Triggers cleanly. Returns `false` if already triggered.
    pub fn trigger(&self) -> bool {
        self.event.fire(false)
    }

    /// Triggers poisoned. Returns `false` if already triggered.
    pub fn poison(&self) -> bool {
        self.event.fire(true)
    }
}
