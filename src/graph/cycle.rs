//! Cycle prevention and cycle auditing for the hierarchy graph.
//!
//! [`CycleGuard::would_create_cycle`] is the pre-write gate invoked by the
//! store's edge-write path. [`CycleGuard::detect_cycles`] scans the whole
//! edge table for strongly connected components, which can only exist if
//! data was written around the gate; operators run it via `audit`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use rusqlite::Connection;
use serde::Serialize;

use crate::error::Result;
use crate::graph::store::HierarchyStore;
use crate::graph::traversal::NetworkResolver;
use crate::types::UserId;

/// A strongly connected component (cycle) found in the edge table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleInfo {
    pub user_ids: Vec<UserId>,
    pub size: usize,
}

/// Pre-write cycle check and whole-graph cycle audit.
#[derive(Clone, Copy)]
pub struct CycleGuard<'a> {
    conn: &'a Connection,
}

impl<'a> CycleGuard<'a> {
    pub fn new(store: &'a HierarchyStore) -> Self {
        Self { conn: &store.conn }
    }

    /// Bind to a raw connection, typically the store's open write transaction.
    pub fn on(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Whether making `proposed_parent` an ancestor of `child` closes a loop.
    ///
    /// True when they are the same user or when `proposed_parent` is already
    /// one of `child`'s descendants, over edges of every role.
    pub fn would_create_cycle(&self, child: UserId, proposed_parent: UserId) -> Result<bool> {
        if child == proposed_parent {
            return Ok(true);
        }
        let descendants = NetworkResolver::on(self.conn).resolve_descendants(child)?;
        Ok(descendants.contains(&proposed_parent))
    }

    /// Every cycle currently present in the edge table, smallest member first.
    pub fn detect_cycles(&self) -> Result<Vec<CycleInfo>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT parent_id, child_id FROM hierarchy_edges")?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get::<_, UserId>(0)?, row.get::<_, UserId>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut adj: BTreeMap<UserId, Vec<UserId>> = BTreeMap::new();
        let mut nodes: BTreeSet<UserId> = BTreeSet::new();
        for (parent, child) in pairs {
            nodes.insert(parent);
            nodes.insert(child);
            adj.entry(parent).or_default().push(child);
        }

        let cycles: Vec<CycleInfo> = strongly_connected(&adj, &nodes)
            .into_iter()
            .filter(|scc| scc.len() >= 2)
            .map(|mut user_ids| {
                user_ids.sort_unstable();
                let size = user_ids.len();
                CycleInfo { user_ids, size }
            })
            .collect();

        for cycle in &cycles {
            tracing::warn!(users = ?cycle.user_ids, "hierarchy cycle present in edge table");
        }
        Ok(cycles)
    }
}

/// Tarjan's strongly connected components, iterative so deep chains cannot
/// overflow the stack.
fn strongly_connected(
    adj: &BTreeMap<UserId, Vec<UserId>>,
    nodes: &BTreeSet<UserId>,
) -> Vec<Vec<UserId>> {
    let mut counter: u32 = 0;
    let mut index: HashMap<UserId, u32> = HashMap::new();
    let mut lowlink: HashMap<UserId, u32> = HashMap::new();
    let mut on_stack: HashSet<UserId> = HashSet::new();
    let mut stack: Vec<UserId> = Vec::new();
    let mut sccs: Vec<Vec<UserId>> = Vec::new();

    let no_neighbors: Vec<UserId> = Vec::new();

    for &start in nodes {
        if index.contains_key(&start) {
            continue;
        }

        // (node, position of the next neighbor to visit)
        let mut work: Vec<(UserId, usize)> = vec![(start, 0)];
        index.insert(start, counter);
        lowlink.insert(start, counter);
        counter += 1;
        stack.push(start);
        on_stack.insert(start);

        while let Some(frame) = work.last_mut() {
            let v = frame.0;
            let neighbors = adj.get(&v).unwrap_or(&no_neighbors);

            if let Some(&w) = neighbors.get(frame.1) {
                frame.1 += 1;
                if !index.contains_key(&w) {
                    index.insert(w, counter);
                    lowlink.insert(w, counter);
                    counter += 1;
                    stack.push(w);
                    on_stack.insert(w);
                    work.push((w, 0));
                } else if on_stack.contains(&w) {
                    let w_index = index[&w];
                    if let Some(v_low) = lowlink.get_mut(&v) {
                        *v_low = (*v_low).min(w_index);
                    }
                }
                continue;
            }

            work.pop();
            let v_low = lowlink[&v];
            if v_low == index[&v] {
                let mut scc = Vec::new();
                while let Some(w) = stack.pop() {
                    on_stack.remove(&w);
                    scc.push(w);
                    if w == v {
                        break;
                    }
                }
                sccs.push(scc);
            }
            if let Some(&(parent, _)) = work.last() {
                if let Some(p_low) = lowlink.get_mut(&parent) {
                    *p_low = (*p_low).min(v_low);
                }
            }
        }
    }

    sccs
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
