// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Futures and future maps.
//!
//! A [`Future`] is bound exactly once by the operation that produces it:
//! to a value, to *empty* (the producer was predicated false) or to a
//! failure. Reading blocks until it is bound.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use bytemuck::Pod;
use bytes::Bytes;

use crate::domain::{DomainPoint, IndexSet};
use crate::error::FutureError;
use crate::event::Event;
use crate::ident::OpId;

#[derive(Debug, Clone)]
enum Slot {
    Pending,
    Ready(Bytes),
    Empty,
    Failed(String),
}

#[derive(Debug)]
struct FutureInner {
    producer: Option<OpId>,
    event: Event,
    slot: Mutex<Slot>,
}

/// Handle to a value produced by one operation.
#[derive(Debug, Clone)]
pub struct Future {
    inner: Arc<FutureInner>,
}

impl Future {
    /// A future already bound to `value`.
    pub fn from_value(value: impl Into<Bytes>) -> Self {
        let (future, setter) = Self::pending(None);
        setter.set(value.into());
        future
    }

    /// A future already bound to a plain-old-data value.
    pub fn from_pod<T: Pod>(value: &T) -> Self {
        Self::from_value(Bytes::copy_from_slice(bytemuck::bytes_of(value)))
    }

    /// An unbound future and the setter that binds it.
    pub(crate) fn pending(producer: Option<OpId>) -> (Self, FutureSetter) {
        let inner = Arc::new(FutureInner {
            producer,
            event: Event::pending(),
            slot: Mutex::new(Slot::Pending),
        });
        (
            Self {
                inner: Arc::clone(&inner),
            },
            FutureSetter { inner },
        )
    }

    /// Operation that produces this future, if any.
    pub fn op(&self) -> Option<OpId> {
        self.inner.producer
    }

    /// Event triggered when the future is bound (poisoned on failure).
    pub fn event(&self) -> Event {
        self.inner.event.clone()
    }

    /// Whether the future is bound.
    pub fn is_ready(&self) -> bool {
        self.inner.event.has_triggered()
    }

    /// Blocks until bound; `true` if the producer was predicated false.
    pub fn is_empty(&self) -> bool {
        self.inner.event.wait();
        matches!(self.slot(), Slot::Empty)
    }

    /// Blocks until bound and returns the value.
    pub fn get(&self) -> Result<Bytes, FutureError> {
        self.inner.event.wait();
        match self.slot() {
            Slot::Ready(v) => Ok(v),
            Slot::Empty => Err(FutureError::Empty),
            Slot::Failed(reason) => Err(FutureError::Poisoned(reason)),
            Slot::Pending => Err(FutureError::Poisoned("future dropped unbound".into())),
        }
    }

    /// Blocks until bound and reads the value as `T`.
    pub fn get_as<T: Pod>(&self) -> Result<T, FutureError> {
        let bytes = self.get()?;
        bytemuck::try_pod_read_unaligned(&bytes).map_err(|_| FutureError::SizeMismatch {
            expected: core::mem::size_of::<T>(),
            found: bytes.len(),
        })
    }

    /// The bound value without blocking; `None` while pending.
    pub(crate) fn peek(&self) -> Option<Result<Bytes, FutureError>> {
        match self.slot() {
            Slot::Pending => None,
            Slot::Ready(v) => Some(Ok(v)),
            Slot::Empty => Some(Err(FutureError::Empty)),
            Slot::Failed(reason) => Some(Err(FutureError::Poisoned(reason))),
        }
    }

    fn slot(&self) -> Slot {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Write side of a [`Future`]; binding twice is ignored.
#[derive(Debug, Clone)]
pub(crate) struct FutureSetter {
    inner: Arc<FutureInner>,
}

impl FutureSetter {
    pub(crate) fn set(&self, value: Bytes) {
        self.bind(Slot::Ready(value), false);
    }

    pub(crate) fn set_empty(&self) {
        self.bind(Slot::Empty, false);
    }

    pub(crate) fn fail(&self, reason: impl Into<String>) {
        self.bind(Slot::Failed(reason.into()), true);
    }

    /// The future this setter binds.
    pub(crate) fn future(&self) -> Future {
        Future {
            inner: Arc::clone(&self.inner),
        }
    }

    fn bind(&self, value: Slot, poisoned: bool) {
        {
            let mut slot = self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner);
            if !matches!(*slot, Slot::Pending) {
                return;
            }
            *slot = value;
        }
        self.inner.event.fire(poisoned);
    }
}

/// Per-point futures of one index launch.
#[derive(Debug, Clone)]
pub struct FutureMap {
    domain: IndexSet,
    futures: BTreeMap<DomainPoint, Future>,
    /// Points executed by this shard; `None` outside replicated contexts.
    owned: Option<BTreeSet<DomainPoint>>,
}

impl FutureMap {
    pub(crate) fn new(domain: IndexSet, futures: BTreeMap<DomainPoint, Future>) -> Self {
        Self {
            domain,
            futures,
            owned: None,
        }
    }

    pub(crate) fn with_owned(mut self, owned: BTreeSet<DomainPoint>) -> Self {
        self.owned = Some(owned);
        self
    }

    /// Whether `point` executed on the calling shard.
    pub fn is_local(&self, point: &DomainPoint) -> bool {
        self.owned.as_ref().is_none_or(|o| o.contains(point))
    }

    /// Launch domain.
    pub fn domain(&self) -> &IndexSet {
        &self.domain
    }

    /// Future of `point`.
    pub fn get(&self, point: &DomainPoint) -> Option<&Future> {
        self.futures.get(point)
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.futures.len()
    }

    /// Whether the launch had no points.
    pub fn is_empty(&self) -> bool {
        self.futures.is_empty()
    }

    /// Futures in point order.
    pub fn iter(&self) -> impl Iterator<Item = (&DomainPoint, &Future)> {
        self.futures.iter()
    }

    /// Event triggered once every point is bound.
    pub fn event(&self) -> Event {
        Event::merge(self.futures.values().map(Future::event))
    }

    /// Blocks until every point is bound.
    pub fn wait_all(&self) {
        self.event().wait();
    }
}
