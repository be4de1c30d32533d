// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Predicates guarding operation execution.

use crate::event::Event;
use crate::future::Future;

/// Condition under which a predicated operation runs.
///
/// Future-backed predicates are true when the future holds a non-zero first
/// byte; empty or failed futures count as false.
#[derive(Debug, Clone, Default)]
pub enum Predicate {
    /// Always run.
    #[default]
    True,
    /// Never run.
    False,
    /// Run when the future resolves truthy.
    Future(Future),
    /// Negation.
    Not(Box<Predicate>),
    /// Conjunction.
    And(Box<Predicate>, Box<Predicate>),
    /// Disjunction.
    Or(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    /// Predicate over a boolean-valued future.
    pub fn from_future(future: Future) -> Self {
        Self::Future(future)
    }

    /// Logical negation.
    #[must_use]
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Logical conjunction.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    /// Logical disjunction.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    /// Events that must trigger before the predicate can be resolved.
    pub fn events(&self) -> Vec<Event> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect(&self, out: &mut Vec<Event>) {
        match self {
            Self::True | Self::False => {}
            Self::Future(f) => out.push(f.event()),
            Self::Not(p) => p.collect(out),
            Self::And(a, b) | Self::Or(a, b) => {
                a.collect(out);
                b.collect(out);
            }
        }
    }

    /// Whether the predicate is statically true.
    pub const fn is_true(&self) -> bool {
        matches!(self, Self::True)
    }

    /// Resolves the predicate; blocks on unbound futures.
    pub fn resolve(&self) -> bool {
        match self {
            Self::True => true,
            Self::False => false,
            Self::Future(f) => f
                .get()
                .is_ok_and(|v| v.first().is_some_and(|b| *b != 0)),
            Self::Not(p) => !p.resolve(),
            Self::And(a, b) => a.resolve() && b.resolve(),
            Self::Or(a, b) => a.resolve() || b.resolve(),
        }
    }
}

impl From<bool> for Predicate {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn combinators_resolve_through_futures() {
        let yes = Predicate::from_future(Future::from_value(Bytes::from_static(&[1])));
        let no = Predicate::from_future(Future::from_value(Bytes::from_static(&[0])));
        assert!(yes.resolve());
        assert!(!no.resolve());
        assert!(yes.clone().and(no.clone().negate()).resolve());
        assert!(no.clone().or(Predicate::True).resolve());
        assert!(!yes.and(Predicate::False).resolve());
        assert_eq!(no.events().len(), 1);
        assert!(Predicate::from(true).is_true());
    }

    #[test]
    fn empty_future_is_false() {
        let (f, set) = Future::pending(None);
        set.set_empty();
        assert!(!Predicate::from_future(f).resolve());
    }
}
