//! Display tree of a user's discipleship lineage.
//!
//! The tree follows only Disciple-role edges; the other edge kinds affect
//! visibility (through the descendant set) but not placement. Records are
//! loaded in three batch queries (users, Disciple edges, guests), after
//! which the tree is assembled in memory.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::graph::store::HierarchyStore;
use crate::graph::traversal::NetworkResolver;
use crate::types::{EdgeRole, Guest, GuestId, Role, User, UserId};

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// One member in the display tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub id: UserId,
    pub display_name: String,
    pub email: String,
    pub roles: Vec<Role>,
    pub disciples: Vec<TreeNode>,
    /// Non-member guests attached to this member, rendered as terminal leaves.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guests: Vec<GuestLeaf>,
}

/// A guest shown under its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestLeaf {
    pub id: GuestId,
    pub name: String,
}

impl TreeNode {
    fn from_user(user: &User) -> Self {
        Self {
            id: user.id,
            display_name: user.display_name.clone(),
            email: user.email.clone(),
            roles: user.roles.clone(),
            disciples: Vec::new(),
            guests: Vec::new(),
        }
    }

    /// Ids of every member below this node, depth-first, excluding the node itself.
    pub fn flatten_ids(&self) -> Vec<UserId> {
        let mut out = Vec::new();
        let mut stack: Vec<&TreeNode> = self.disciples.iter().rev().collect();
        while let Some(node) = stack.pop() {
            out.push(node.id);
            stack.extend(node.disciples.iter().rev());
        }
        out
    }

    /// Number of members in the tree, this node included.
    pub fn size(&self) -> usize {
        1 + self.flatten_ids().len()
    }

    /// Plain-text rendering with box-drawing connectors.
    pub fn render_text(&self) -> String {
        let mut out = format!("{} (#{})\n", self.display_name, self.id);
        self.render_children("", &mut out);
        out
    }

    fn render_children(&self, prefix: &str, out: &mut String) {
        let total = self.disciples.len() + self.guests.len();
        let mut i = 0;
        for child in &self.disciples {
            i += 1;
            let last = i == total;
            out.push_str(&format!(
                "{prefix}{}{} (#{})\n",
                if last { "└── " } else { "├── " },
                child.display_name,
                child.id
            ));
            let next = format!("{prefix}{}", if last { "    " } else { "│   " });
            child.render_children(&next, out);
        }
        for guest in &self.guests {
            i += 1;
            let connector = if i == total { "└── " } else { "├── " };
            out.push_str(&format!("{prefix}{connector}[guest] {}\n", guest.name));
        }
    }
}

// ---------------------------------------------------------------------------
// TreeBuilder
// ---------------------------------------------------------------------------

/// Assembles [`TreeNode`]s from the store.
pub struct TreeBuilder<'a> {
    store: &'a HierarchyStore,
}

struct Loaded {
    users: HashMap<UserId, User>,
    children: HashMap<UserId, Vec<UserId>>,
    guests: HashMap<UserId, Vec<GuestLeaf>>,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(store: &'a HierarchyStore) -> Self {
        Self { store }
    }

    /// Build the discipleship tree rooted at `root`.
    ///
    /// Returns `NotFound` if `root` does not exist. Ids already placed are
    /// skipped rather than expanded again, so a malformed graph yields a
    /// partial, loop-free tree.
    pub fn build_tree(&self, root: UserId) -> Result<TreeNode> {
        self.store.require_user(root)?;

        let descendants = NetworkResolver::new(self.store).resolve_descendants(root)?;
        let mut ids: Vec<UserId> = Vec::with_capacity(descendants.len() + 1);
        ids.push(root);
        ids.extend(descendants);

        let loaded = self.load(&ids)?;
        let mut visited: HashSet<UserId> = HashSet::new();
        let tree = assemble(root, &loaded, &mut visited)
            .ok_or_else(|| crate::error::NetworkError::user_not_found(root))?;

        tracing::debug!(root, members = visited.len(), "network tree built");
        Ok(tree)
    }

    fn load(&self, ids: &[UserId]) -> Result<Loaded> {
        let users: HashMap<UserId, User> = self
            .store
            .get_users(ids)?
            .into_iter()
            .map(|u| (u.id, u))
            .collect();

        let mut children: HashMap<UserId, Vec<UserId>> = HashMap::new();
        for edge in self.store.get_edges_among(ids, Some(EdgeRole::Disciple))? {
            children.entry(edge.parent_id).or_default().push(edge.child_id);
        }
        for list in children.values_mut() {
            list.sort_by(|a, b| {
                let name = |id: &UserId| users.get(id).map(|u| u.display_name.to_lowercase());
                name(a).cmp(&name(b)).then(a.cmp(b))
            });
        }

        let mut guests: HashMap<UserId, Vec<GuestLeaf>> = HashMap::new();
        for guest in self.store.list_guests_for_owners(ids)? {
            if let Guest {
                id,
                name,
                assigned_to_id: Some(owner),
                converted_user_id: None,
                ..
            } = guest
            {
                guests.entry(owner).or_default().push(GuestLeaf { id, name });
            }
        }

        Ok(Loaded {
            users,
            children,
            guests,
        })
    }
}

fn assemble(id: UserId, loaded: &Loaded, visited: &mut HashSet<UserId>) -> Option<TreeNode> {
    if !visited.insert(id) {
        tracing::warn!(user = id, "user reached twice while building tree; skipping");
        return None;
    }
    let user = loaded.users.get(&id)?;
    let mut node = TreeNode::from_user(user);

    if let Some(children) = loaded.children.get(&id) {
        for &child in children {
            if let Some(sub) = assemble(child, loaded, visited) {
                node.disciples.push(sub);
            }
        }
    }
    if let Some(guests) = loaded.guests.get(&id) {
        node.guests = guests.clone();
    }
    Some(node)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
