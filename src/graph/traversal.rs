//! Network resolution: transitive descendant sets of a user.
//!
//! The closure is computed by SQLite as a recursive CTE. The CTE combines
//! rows with `UNION` (not `UNION ALL`), so an id that was already produced
//! is discarded instead of re-expanded; that de-duplicates users reachable
//! through several role paths and guarantees termination even if a cycle
//! slipped past the write-time guard.

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::graph::store::{id_list, HierarchyStore};
use crate::types::{EdgeRole, UserId};

// ---------------------------------------------------------------------------
// SQL constants
// ---------------------------------------------------------------------------

const DESCENDANTS_SQL: &str = "\
WITH RECURSIVE network(id) AS (
    -- Base: direct children of the root
    SELECT child_id
    FROM hierarchy_edges
    WHERE parent_id = ?1 AND (?2 IS NULL OR role = ?2)

    UNION

    -- Recursive: follow child edges; UNION drops ids already seen
    SELECT e.child_id
    FROM network n
    JOIN hierarchy_edges e ON e.parent_id = n.id
    WHERE ?2 IS NULL OR e.role = ?2
)
SELECT id FROM network";

const CHILDREN_OF_SQL: &str = "\
SELECT DISTINCT child_id FROM hierarchy_edges
WHERE parent_id IN (SELECT value FROM json_each(?1))
  AND (?2 IS NULL OR role = ?2)
ORDER BY child_id";

// ---------------------------------------------------------------------------
// NetworkResolver
// ---------------------------------------------------------------------------

/// Computes descendant sets against the current state of the edge table.
///
/// Stateless: nothing is cached between calls, so every resolution sees
/// the latest edges.
#[derive(Clone, Copy)]
pub struct NetworkResolver<'a> {
    conn: &'a Connection,
}

impl<'a> NetworkResolver<'a> {
    /// Create a resolver bound to the given store.
    pub fn new(store: &'a HierarchyStore) -> Self {
        Self { conn: &store.conn }
    }

    /// Create a resolver over a raw connection (or an open transaction).
    pub fn on(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// All transitive descendants of `root` over every edge role.
    ///
    /// Never contains `root` itself and is empty for a leaf.
    pub fn resolve_descendants(&self, root: UserId) -> Result<BTreeSet<UserId>> {
        self.resolve_descendants_via(root, None)
    }

    /// Descendants of `root`, following only edges tagged `role` when given.
    pub fn resolve_descendants_via(
        &self,
        root: UserId,
        role: Option<EdgeRole>,
    ) -> Result<BTreeSet<UserId>> {
        let mut stmt = self.conn.prepare_cached(DESCENDANTS_SQL)?;
        let rows = stmt.query_map(params![root, role.map(|r| r.as_str())], |row| row.get(0))?;
        let mut ids = rows.collect::<std::result::Result<BTreeSet<UserId>, _>>()?;

        if ids.remove(&root) {
            tracing::warn!(
                root,
                "hierarchy cycle detected: user is its own descendant; returning loop-free result"
            );
        }
        tracing::debug!(root, role = ?role, count = ids.len(), "resolved descendants");
        Ok(ids)
    }

    /// Descendants of `root` keyed by their shortest distance from it.
    ///
    /// Breadth-first in process, one batch query per level, with a visited
    /// set so a malformed graph cannot loop.
    pub fn resolve_levels(
        &self,
        root: UserId,
        role: Option<EdgeRole>,
    ) -> Result<BTreeMap<UserId, u32>> {
        let mut depths: BTreeMap<UserId, u32> = BTreeMap::new();
        let mut frontier = vec![root];
        let mut depth = 0u32;
        let role = role.map(|r| r.as_str());

        while !frontier.is_empty() {
            depth += 1;
            let mut stmt = self.conn.prepare_cached(CHILDREN_OF_SQL)?;
            let rows = stmt.query_map(params![id_list(&frontier), role], |row| row.get(0))?;

            let mut next = Vec::new();
            for child in rows {
                let child: UserId = child?;
                if child == root {
                    tracing::warn!(root, "hierarchy cycle detected while walking levels");
                    continue;
                }
                if let std::collections::btree_map::Entry::Vacant(slot) = depths.entry(child) {
                    slot.insert(depth);
                    next.push(child);
                }
            }
            frontier = next;
        }
        Ok(depths)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::initialize_database;
    use crate::types::{NewUser, Role};
    use pretty_assertions::assert_eq;

    struct Fixture {
        store: HierarchyStore,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: HierarchyStore::from_connection(initialize_database(":memory:").unwrap()),
            }
        }

        fn user(&self, name: &str) -> UserId {
            self.store
                .insert_user(&NewUser::new(name, format!("{name}@iglesia.org"), &[Role::Disciple]))
                .unwrap()
                .id
        }

        fn edge(&self, parent: UserId, child: UserId, role: EdgeRole) {
            self.store.set_parent(child, parent, role).unwrap();
        }

        /// Insert an edge bypassing the cycle guard, to simulate corrupt data.
        fn raw_edge(&self, parent: UserId, child: UserId, role: EdgeRole) {
            self.store
                .conn
                .execute(
                    "INSERT INTO hierarchy_edges (parent_id, child_id, role, created_at) VALUES (?1, ?2, ?3, 'now')",
                    params![parent, child, role.as_str()],
                )
                .unwrap();
        }

        fn resolver(&self) -> NetworkResolver<'_> {
            NetworkResolver::new(&self.store)
        }
    }

    #[test]
    fn leaf_has_no_descendants() {
        let f = Fixture::new();
        let a = f.user("a");
        assert!(f.resolver().resolve_descendants(a).unwrap().is_empty());
        assert!(f.resolver().resolve_levels(a, None).unwrap().is_empty());
    }

    #[test]
    fn chain_scenario_with_role_filter() {
        let f = Fixture::new();
        let pastor = f.user("pastor");
        let a = f.user("a");
        let b = f.user("b");
        let c = f.user("c");
        f.edge(pastor, a, EdgeRole::LeaderOfTwelve);
        f.edge(a, b, EdgeRole::Disciple);
        f.edge(b, c, EdgeRole::Disciple);

        let r = f.resolver();
        assert_eq!(
            r.resolve_descendants_via(pastor, Some(EdgeRole::LeaderOfTwelve)).unwrap(),
            BTreeSet::from([a])
        );
        assert_eq!(r.resolve_descendants(pastor).unwrap(), BTreeSet::from([a, b, c]));
        assert_eq!(r.resolve_descendants(a).unwrap(), BTreeSet::from([b, c]));
    }

    #[test]
    fn multi_role_paths_are_deduplicated() {
        let f = Fixture::new();
        let pastor = f.user("pastor");
        let a = f.user("a");
        let b = f.user("b");
        f.edge(pastor, a, EdgeRole::Pastor);
        f.edge(a, b, EdgeRole::Disciple);
        // b is also a direct cell-leader child of the pastor
        f.edge(pastor, b, EdgeRole::CellLeader);

        let desc = f.resolver().resolve_descendants(pastor).unwrap();
        assert_eq!(desc, BTreeSet::from([a, b]));

        let levels = f.resolver().resolve_levels(pastor, None).unwrap();
        assert_eq!(levels.get(&b), Some(&1), "shortest path wins");
        assert_eq!(levels.get(&a), Some(&1));
    }

    #[test]
    fn terminates_on_corrupt_cycle() {
        let f = Fixture::new();
        let a = f.user("a");
        let b = f.user("b");
        let c = f.user("c");
        f.edge(a, b, EdgeRole::Disciple);
        f.edge(b, c, EdgeRole::Disciple);
        f.raw_edge(c, a, EdgeRole::CellLeader);

        let desc = f.resolver().resolve_descendants(a).unwrap();
        assert_eq!(desc, BTreeSet::from([b, c]));
        let levels = f.resolver().resolve_levels(a, None).unwrap();
        assert_eq!(levels, BTreeMap::from([(b, 1), (c, 2)]));
    }

    #[test]
    fn levels_record_depth() {
        let f = Fixture::new();
        let a = f.user("a");
        let b = f.user("b");
        let c = f.user("c");
        let d = f.user("d");
        f.edge(a, b, EdgeRole::Disciple);
        f.edge(b, c, EdgeRole::Disciple);
        f.edge(a, d, EdgeRole::CellLeader);

        let levels = f.resolver().resolve_levels(a, Some(EdgeRole::Disciple)).unwrap();
        assert_eq!(levels, BTreeMap::from([(b, 1), (c, 2)]));
    }
}
