// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Records when task bodies start and end, to check ordering from tests.

use std::sync::{Arc, Mutex, PoisonError};

/// One recorded edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mark {
    /// Body started.
    Start(String),
    /// Body ended.
    End(String),
}

/// Shared, append-only log of [`Mark`]s. Clones share the log.
#[derive(Debug, Clone, Default)]
pub struct TimelineRecorder {
    marks: Arc<Mutex<Vec<Mark>>>,
}

impl TimelineRecorder {
    /// Empty timeline.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, mark: Mark) {
        self.marks.lock().unwrap_or_else(PoisonError::into_inner).push(mark);
    }

    /// Runs `f` between a start and an end mark for `label`.
    pub fn span<R>(&self, label: impl Into<String>, f: impl FnOnce() -> R) -> R {
        let label = label.into();
        self.push(Mark::Start(label.clone()));
        let out = f();
        self.push(Mark::End(label));
        out
    }

    /// Snapshot of every mark.
    pub fn marks(&self) -> Vec<Mark> {
        self.marks.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn position(&self, mark: &Mark) -> Option<usize> {
        self.marks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .position(|m| m == mark)
    }

    /// Whether `first` ended before `second` started.
    pub fn finished_before(&self, first: &str, second: &str) -> bool {
        match (
            self.position(&Mark::End(first.to_owned())),
            self.position(&Mark::Start(second.to_owned())),
        ) {
            (Some(end), Some(start)) => end < start,
            _ => false,
        }
    }

    /// Whether `label` ran at all.
    pub fn ran(&self, label: &str) -> bool {
        self.position(&Mark::End(label.to_owned())).is_some()
    }

    /// Number of completed spans.
    pub fn completed(&self) -> usize {
        self.marks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|m| matches!(m, Mark::End(_)))
            .count()
    }
}
