//! Leader resolution: attributing a user (and the records it owns) to the
//! nearest ancestor holding a given role, for grouped reports.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::error::Result;
use crate::graph::store::HierarchyStore;
use crate::types::{EdgeRole, Role, UserId};

/// Maximum realistic hierarchy depth; walks stop after this many hops.
pub const DEFAULT_MAX_HOPS: usize = 5;

/// Where a record lands in a by-leader report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum LeaderBucket {
    Leader(UserId),
    Unassigned,
}

impl LeaderBucket {
    pub fn leader_id(&self) -> Option<UserId> {
        match self {
            Self::Leader(id) => Some(*id),
            Self::Unassigned => None,
        }
    }
}

/// Edge categories to try, in order, when the role's own edge is missing.
fn fallback_edges(role: EdgeRole) -> &'static [EdgeRole] {
    match role {
        EdgeRole::LeaderOfTwelve => &[EdgeRole::Pastor],
        _ => &[],
    }
}

/// Walks ancestor edges to find the responsible leader of a role.
pub struct LeaderResolver<'a> {
    store: &'a HierarchyStore,
    max_hops: usize,
}

impl<'a> LeaderResolver<'a> {
    pub fn new(store: &'a HierarchyStore) -> Self {
        Self {
            store,
            max_hops: DEFAULT_MAX_HOPS,
        }
    }

    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    /// Nearest ancestor of `user` (or `user` itself) holding `role`.
    ///
    /// Each hop follows the parent edge tagged with `role`; for
    /// `LeaderOfTwelve` a missing edge falls back to the Pastor edge.
    /// Returns `None` when the chain ends, revisits a user, or exceeds the
    /// hop bound. `NotFound` if `user` does not exist.
    pub fn resolve_ancestor_by_role(&self, user: UserId, role: Role) -> Result<Option<UserId>> {
        let start = self.store.require_user(user)?;
        if start.has_role(role) {
            return Ok(Some(user));
        }
        let Some(edge_role) = role.edge_role() else {
            return Ok(None);
        };

        let mut visited: HashSet<UserId> = HashSet::from([user]);
        let mut current = user;
        for _ in 0..self.max_hops {
            let Some(parent) = self.next_parent(current, edge_role)? else {
                return Ok(None);
            };
            if !visited.insert(parent) {
                tracing::warn!(user, parent, "cycle in ancestor chain while resolving leader");
                return Ok(None);
            }
            if self.store.get_roles(parent)?.contains(&role) {
                return Ok(Some(parent));
            }
            current = parent;
        }

        tracing::debug!(user, role = %role, hops = self.max_hops, "leader not found within hop bound");
        Ok(None)
    }

    fn next_parent(&self, child: UserId, role: EdgeRole) -> Result<Option<UserId>> {
        if let Some(edge) = self.store.get_parent_edge(child, role)? {
            return Ok(Some(edge.parent_id));
        }
        for &fallback in fallback_edges(role) {
            if let Some(edge) = self.store.get_parent_edge(child, fallback)? {
                return Ok(Some(edge.parent_id));
            }
        }
        Ok(None)
    }

    /// Bucket for a record owned by `owner` (`None` = unowned).
    pub fn attribute(&self, owner: Option<UserId>, role: Role) -> Result<LeaderBucket> {
        let Some(owner) = owner else {
            return Ok(LeaderBucket::Unassigned);
        };
        if !self.store.user_exists(owner)? {
            return Ok(LeaderBucket::Unassigned);
        }
        Ok(self
            .resolve_ancestor_by_role(owner, role)?
            .map(LeaderBucket::Leader)
            .unwrap_or(LeaderBucket::Unassigned))
    }

    /// Group owners by responsible leader. Each owner is resolved once.
    pub fn group_by_leader<I>(&self, owners: I, role: Role) -> Result<BTreeMap<LeaderBucket, Vec<UserId>>>
    where
        I: IntoIterator<Item = Option<UserId>>,
    {
        let mut groups: BTreeMap<LeaderBucket, Vec<UserId>> = BTreeMap::new();
        let mut unowned = 0usize;
        for owner in owners {
            let bucket = self.attribute(owner, role)?;
            match owner {
                Some(id) => groups.entry(bucket).or_default().push(id),
                None => {
                    unowned += 1;
                    groups.entry(bucket).or_default();
                }
            }
        }
        if unowned > 0 {
            tracing::debug!(unowned, "records without owner attributed to Unassigned");
        }
        Ok(groups)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
