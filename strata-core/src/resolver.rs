use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use petgraph::algo::is_cyclic_directed;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;

use crate::{Catalog, Error, Result, Revision, RevisionId};

/// Where an upgrade should end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The single head of the revision graph. Fails when the graph has
    /// more than one.
    Latest,
    Revision(RevisionId),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Latest => f.write_str("latest"),
            Target::Revision(id) => write!(f, "{id}"),
        }
    }
}

/// Where a downgrade should end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DowngradeTarget {
    Revision(RevisionId),
    /// Revert the `n` most recent revisions.
    Steps(usize),
    /// Revert everything, back to an empty schema.
    Base,
}

impl fmt::Display for DowngradeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DowngradeTarget::Revision(id) => write!(f, "{id}"),
            DowngradeTarget::Steps(count) => write!(f, "{count} steps back"),
            DowngradeTarget::Base => f.write_str("base"),
        }
    }
}

/// The catalog's parent links materialized as a directed acyclic graph.
///
/// Everything here is pure bookkeeping over owned data: the graph is
/// built once from a [`Catalog`] and answers path questions without any
/// database access. Edges point parent to child, so walking `Outgoing`
/// moves away from the roots.
///
/// Ordering is deterministic: whenever several revisions could equally
/// come next, the one with the earliest `created_at` wins, and equal
/// timestamps fall back to the lexicographically smallest id.
#[derive(Debug)]
pub struct RevisionGraph {
    revisions: Vec<Revision>,
    irreversible: Vec<bool>,
    index: HashMap<RevisionId, usize>,
    graph: DiGraphMap<usize, ()>,
}

impl RevisionGraph {
    /// Build and validate the graph. Fails when a parent link points at
    /// an unknown revision or when the links form a cycle.
    pub fn new(catalog: &Catalog) -> Result<Self> {
        let mut revisions = Vec::with_capacity(catalog.len());
        let mut irreversible = Vec::with_capacity(catalog.len());
        let mut index = HashMap::with_capacity(catalog.len());

        for (position, migration) in catalog.iter().enumerate() {
            let revision = migration.describe();

            index.insert(revision.id.clone(), position);
            irreversible.push(migration.irreversible());
            revisions.push(revision);
        }

        let mut graph = DiGraphMap::new();

        for (position, revision) in revisions.iter().enumerate() {
            graph.add_node(position);

            for parent in &revision.parents {
                let Some(&parent_position) = index.get(parent) else {
                    return Err(Error::InvalidCatalog(format!(
                        "revision `{}` references unknown parent `{parent}`",
                        revision.id
                    )));
                };

                graph.add_edge(parent_position, position, ());
            }
        }

        if is_cyclic_directed(&graph) {
            return Err(Error::InvalidCatalog(
                "revision parent links form a cycle".to_owned(),
            ));
        }

        Ok(Self {
            revisions,
            irreversible,
            index,
            graph,
        })
    }

    pub fn contains(&self, id: &RevisionId) -> bool {
        self.index.contains_key(id)
    }

    pub fn revision(&self, id: &RevisionId) -> Option<&Revision> {
        self.index.get(id).map(|&position| &self.revisions[position])
    }

    /// Revisions with no children, sorted by `(created_at, id)`.
    pub fn heads(&self) -> Vec<RevisionId> {
        let mut heads = self
            .graph
            .nodes()
            .filter(|&node| {
                self.graph
                    .neighbors_directed(node, Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .map(|node| &self.revisions[node])
            .collect::<Vec<_>>();

        heads.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        heads.into_iter().map(|revision| revision.id.clone()).collect()
    }

    /// The single head of the graph, or `DivergentHistory` when branches
    /// have not been merged. `None` on an empty catalog.
    pub fn latest(&self) -> Result<Option<RevisionId>> {
        let mut heads = self.heads();

        match heads.len() {
            0 => Ok(None),
            1 => Ok(Some(heads.remove(0))),
            _ => Err(Error::DivergentHistory { heads }),
        }
    }

    /// Ordered revisions to apply so that a database at `current` (its
    /// recorded head revisions) ends up at `target`.
    ///
    /// Returns an empty path when the target is already applied, and
    /// `UnreachableRevision` when the target is not a descendant of the
    /// current state.
    pub fn upgrade_path(
        &self,
        current: &[RevisionId],
        target: &Target,
    ) -> Result<Vec<RevisionId>> {
        let applied = self.closure(current)?;

        let goal = match target {
            Target::Latest => match self.latest()? {
                Some(id) => self.index[&id],
                None => return Ok(Vec::new()),
            },
            Target::Revision(id) => match self.index.get(id) {
                Some(&position) => position,
                None => {
                    return Err(Error::UnreachableRevision {
                        from: describe_state(current),
                        target: id.to_string(),
                    })
                }
            },
        };

        let mut wanted = self.ancestors(goal);
        wanted.insert(goal);

        // Upgrading never unapplies anything, so every revision already
        // applied must be part of the target's history.
        if applied.iter().any(|position| !wanted.contains(position)) {
            return Err(Error::UnreachableRevision {
                from: describe_state(current),
                target: self.revisions[goal].id.to_string(),
            });
        }

        let pending = wanted
            .difference(&applied)
            .copied()
            .collect::<HashSet<_>>();

        Ok(self.forward_order(&pending, &applied))
    }

    /// Ordered revisions to revert so that a database at `current` ends
    /// up at `target`. Children are always reverted before their
    /// parents.
    ///
    /// Fails with `IrreversibleMigration` when the path crosses a
    /// revision that declares no way back.
    pub fn downgrade_path(
        &self,
        current: &[RevisionId],
        target: &DowngradeTarget,
    ) -> Result<Vec<RevisionId>> {
        let applied = self.closure(current)?;

        let to_revert = match target {
            DowngradeTarget::Base => self.reverse_order(&applied),
            DowngradeTarget::Revision(id) => {
                let position = match self.index.get(id) {
                    Some(&position) if applied.contains(&position) => position,
                    _ => {
                        return Err(Error::UnreachableRevision {
                            from: describe_state(current),
                            target: id.to_string(),
                        })
                    }
                };

                let mut keep = self.ancestors(position);
                keep.insert(position);

                let dropped = applied
                    .difference(&keep)
                    .copied()
                    .collect::<HashSet<_>>();

                self.reverse_order(&dropped)
            }
            DowngradeTarget::Steps(count) => {
                if *count > applied.len() {
                    return Err(Error::UnreachableRevision {
                        from: describe_state(current),
                        target: format!("{count} steps back"),
                    });
                }

                // A prefix of the reverse order is closed under
                // descendants, so cutting it off after `count` entries
                // never strands a child whose parent is being reverted.
                let mut order = self.reverse_order(&applied);
                order.truncate(*count);
                order
            }
        };

        for id in &to_revert {
            if self.irreversible[self.index[id]] {
                return Err(Error::IrreversibleMigration {
                    revision: id.clone(),
                });
            }
        }

        Ok(to_revert)
    }

    /// All applied revisions implied by the recorded heads: the heads
    /// themselves plus every ancestor.
    fn closure(&self, heads: &[RevisionId]) -> Result<HashSet<usize>> {
        let mut out = HashSet::new();

        for id in heads {
            let Some(&position) = self.index.get(id) else {
                return Err(Error::InvalidCatalog(format!(
                    "revision `{id}` recorded in the database is not in the catalog"
                )));
            };

            out.insert(position);
            out.extend(self.ancestors(position));
        }

        Ok(out)
    }

    fn ancestors(&self, position: usize) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut stack = self
            .graph
            .neighbors_directed(position, Direction::Incoming)
            .collect::<Vec<_>>();

        while let Some(node) = stack.pop() {
            if seen.insert(node) {
                stack.extend(self.graph.neighbors_directed(node, Direction::Incoming));
            }
        }

        seen
    }

    /// Topological order over `pending`, earliest `(created_at, id)`
    /// first among the revisions whose parents are all satisfied.
    fn forward_order(&self, pending: &HashSet<usize>, applied: &HashSet<usize>) -> Vec<RevisionId> {
        let mut done = applied.clone();
        let mut queued = HashSet::new();
        let mut ready = BinaryHeap::new();
        let mut out = Vec::with_capacity(pending.len());

        let is_ready = |node: usize, done: &HashSet<usize>| {
            self.graph
                .neighbors_directed(node, Direction::Incoming)
                .all(|parent| done.contains(&parent))
        };

        for &node in pending {
            if is_ready(node, &done) && queued.insert(node) {
                ready.push(Reverse(self.order_key(node)));
            }
        }

        while let Some(Reverse((_, _, node))) = ready.pop() {
            out.push(self.revisions[node].id.clone());
            done.insert(node);

            for child in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if pending.contains(&child) && is_ready(child, &done) && queued.insert(child) {
                    ready.push(Reverse(self.order_key(child)));
                }
            }
        }

        out
    }

    /// Reverse topological order over `dropped`, latest `(created_at,
    /// id)` first among the revisions with no remaining children.
    fn reverse_order(&self, dropped: &HashSet<usize>) -> Vec<RevisionId> {
        let mut remaining = dropped.clone();
        let mut queued = HashSet::new();
        let mut ready = BinaryHeap::new();
        let mut out = Vec::with_capacity(dropped.len());

        let is_ready = |node: usize, remaining: &HashSet<usize>| {
            self.graph
                .neighbors_directed(node, Direction::Outgoing)
                .all(|child| !remaining.contains(&child))
        };

        for &node in dropped {
            if is_ready(node, &remaining) && queued.insert(node) {
                ready.push(self.order_key(node));
            }
        }

        while let Some((_, _, node)) = ready.pop() {
            out.push(self.revisions[node].id.clone());
            remaining.remove(&node);

            for parent in self.graph.neighbors_directed(node, Direction::Incoming) {
                if remaining.contains(&parent)
                    && is_ready(parent, &remaining)
                    && queued.insert(parent)
                {
                    ready.push(self.order_key(parent));
                }
            }
        }

        out
    }

    fn order_key(&self, node: usize) -> (DateTime<Utc>, String, usize) {
        let revision = &self.revisions[node];
        (revision.created_at, revision.id.to_string(), node)
    }
}

/// Human-readable form of a set of current heads, `unmigrated` when the
/// database has none.
pub fn describe_state(current: &[RevisionId]) -> String {
    if current.is_empty() {
        "unmigrated".to_owned()
    } else {
        current
            .iter()
            .map(|id| id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}
