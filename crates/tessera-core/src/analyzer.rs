// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Dependence analysis.
//!
//! The analyzer keeps, per region tree, per index-space node and per field,
//! the list of in-flight users of that data. A new access collects every
//! user on an overlapping node whose use it must order after, then records
//! itself. Nodes whose point sets do not overlap the access are pruned
//! without looking at their users, so sibling subregions of a disjoint
//! partition never depend on each other.
//!
//! Analysis is split in two: [`DependenceAnalyzer::analyze`] is read-only
//! and returns the dependences plus the users the access supersedes;
//! [`DependenceAnalyzer::record`] applies the evictions and registers the
//! new user. Index launches analyse every point before recording any.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::domain::IndexSet;
use crate::event::Event;
use crate::ident::{ContextId, FieldId, IndexSpaceId, OpId, ReductionOpId, RegionTreeId};
use crate::privilege::{dependence_type, intersects_btree, DependenceType, FieldSet, RegionUsage};
use crate::telemetry;

/// One access to region data.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Access<'a> {
    pub(crate) tree: RegionTreeId,
    pub(crate) node: IndexSpaceId,
    pub(crate) domain: &'a IndexSet,
    pub(crate) fields: &'a FieldSet,
    pub(crate) usage: RegionUsage,
}

impl Access<'_> {
    /// Whether the two accesses touch common data with an ordering hazard.
    pub(crate) fn interferes<F>(&self, other: &Access<'_>, commutative: F) -> bool
    where
        F: Fn(ReductionOpId) -> bool,
    {
        self.tree == other.tree
            && intersects_btree(self.fields, other.fields)
            && self.domain.overlaps(other.domain)
            && dependence_type(&self.usage, &other.usage, commutative).orders()
    }
}

#[derive(Debug, Clone)]
struct UserRecord {
    op: OpId,
    event: Event,
    usage: RegionUsage,
}

#[derive(Debug)]
struct NodeUsers {
    domain: IndexSet,
    fields: BTreeMap<FieldId, Vec<UserRecord>>,
}

/// A prior operation the analysed access must wait for.
#[derive(Debug, Clone)]
pub(crate) struct Dependence {
    pub(crate) op: OpId,
    pub(crate) kind: DependenceType,
    pub(crate) event: Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Eviction {
    node: IndexSpaceId,
    field: FieldId,
    op: OpId,
}

/// Result of [`DependenceAnalyzer::analyze`].
#[derive(Debug, Default)]
pub(crate) struct Analysis {
    pub(crate) deps: Vec<Dependence>,
    evictions: Vec<Eviction>,
}

impl Analysis {
    /// Folds another analysis of the same operation into this one.
    pub(crate) fn merge(&mut self, other: Self) {
        for d in other.deps {
            if !self.deps.iter().any(|x| x.op == d.op) {
                self.deps.push(d);
            }
        }
        self.deps.sort_by_key(|d| d.op);
        self.evictions.extend(other.evictions);
    }

    /// Prior operations depended on, ascending.
    pub(crate) fn ops(&self) -> Vec<OpId> {
        self.deps.iter().map(|d| d.op).collect()
    }

    /// Completion events of the prior operations.
    pub(crate) fn events(&self) -> impl Iterator<Item = Event> + '_ {
        self.deps.iter().map(|d| d.event.clone())
    }
}

/// Per-context dependence state.
#[derive(Debug)]
pub(crate) struct DependenceAnalyzer {
    ctx: ContextId,
    eviction: bool,
    trees: FxHashMap<RegionTreeId, FxHashMap<IndexSpaceId, NodeUsers>>,
    locations: FxHashMap<OpId, Vec<(RegionTreeId, IndexSpaceId)>>,
}

impl DependenceAnalyzer {
    pub(crate) fn new(ctx: ContextId, eviction: bool) -> Self {
        Self {
            ctx,
            eviction,
            trees: FxHashMap::default(),
            locations: FxHashMap::default(),
        }
    }

    /// Prior users `op` must order after for `access`.
    pub(crate) fn analyze<F>(&self, op: OpId, access: &Access<'_>, commutative: F) -> Analysis
    where
        F: Fn(ReductionOpId) -> bool,
    {
        let mut analysis = Analysis::default();
        let Some(nodes) = self.trees.get(&access.tree) else {
            return analysis;
        };
        let dominates = self.eviction && access.usage.dominates();
        let mut seen: BTreeMap<OpId, Dependence> = BTreeMap::new();
        for (node, users) in nodes {
            if !users.domain.overlaps(access.domain) {
                continue;
            }
            let covered = dominates && users.domain.is_subset_of(access.domain);
            for field in access.fields {
                let Some(list) = users.fields.get(field) else {
                    continue;
                };
                for user in list {
                    if user.op == op {
                        continue;
                    }
                    let kind = dependence_type(&user.usage, &access.usage, &commutative);
                    if !kind.orders() {
                        continue;
                    }
                    telemetry::dependence(self.ctx, op, user.op, *field, kind);
                    seen.entry(user.op).or_insert_with(|| Dependence {
                        op: user.op,
                        kind,
                        event: user.event.clone(),
                    });
                    if covered {
                        analysis.evictions.push(Eviction {
                            node: *node,
                            field: *field,
                            op: user.op,
                        });
                    }
                }
            }
        }
        analysis.deps = seen.into_values().collect();
        analysis
    }

    /// Applies the evictions of `analysis` and records `op` as a user.
    /// Returns the number of evicted uses.
    pub(crate) fn record(&mut self, op: OpId, event: &Event, access: &Access<'_>, analysis: &Analysis) -> usize {
        let nodes = self.trees.entry(access.tree).or_default();
        let mut evicted = 0;
        for ev in &analysis.evictions {
            let Some(users) = nodes.get_mut(&ev.node) else {
                continue;
            };
            if let Some(list) = users.fields.get_mut(&ev.field) {
                let before = list.len();
                list.retain(|u| u.op != ev.op);
                if list.len() != before {
                    evicted += before - list.len();
                    telemetry::evicted(self.ctx, op, ev.op, ev.field);
                }
                if list.is_empty() {
                    users.fields.remove(&ev.field);
                }
            }
            if users.fields.is_empty() {
                nodes.remove(&ev.node);
            }
        }
        let users = nodes.entry(access.node).or_insert_with(|| NodeUsers {
            domain: access.domain.clone(),
            fields: BTreeMap::new(),
        });
        for field in access.fields {
            users.fields.entry(*field).or_default().push(UserRecord {
                op,
                event: event.clone(),
                usage: access.usage,
            });
        }
        self.locations.entry(op).or_default().push((access.tree, access.node));
        evicted
    }

    /// Removes every use recorded by `op`. Returns how many were removed.
    pub(crate) fn retire(&mut self, op: OpId) -> usize {
        let Some(places) = self.locations.remove(&op) else {
            return 0;
        };
        let mut removed = 0;
        for (tree, node) in places {
            let Some(nodes) = self.trees.get_mut(&tree) else {
                continue;
            };
            let Some(users) = nodes.get_mut(&node) else {
                continue;
            };
            users.fields.retain(|_, list| {
                let before = list.len();
                list.retain(|u| u.op != op);
                removed += before - list.len();
                !list.is_empty()
            });
            if users.fields.is_empty() {
                nodes.remove(&node);
            }
            if nodes.is_empty() {
                self.trees.remove(&tree);
            }
        }
        removed
    }

    /// Drops all state for a destroyed tree.
    pub(crate) fn forget_tree(&mut self, tree: RegionTreeId) {
        self.trees.remove(&tree);
    }

    /// Number of recorded uses (per field).
    pub(crate) fn user_count(&self) -> usize {
        self.trees
            .values()
            .flat_map(FxHashMap::values)
            .flat_map(|n| n.fields.values())
            .map(Vec::len)
            .sum()
    }
}
