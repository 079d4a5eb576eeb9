//! Actor-facing facade over the network core.
//!
//! Every operation takes the acting user, applies its [`Scope`] first and
//! only then reads or writes. HTTP handlers and the CLI go through here.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::config::schema::NetworkConfig;
use crate::error::{NetworkError, Result};
use crate::graph::leader::{LeaderBucket, LeaderResolver};
use crate::graph::store::HierarchyStore;
use crate::graph::traversal::NetworkResolver;
use crate::graph::tree::{TreeBuilder, TreeNode};
use crate::scope::{AuthorizationScope, Scope};
use crate::types::{Actor, EdgeRole, Guest, GuestId, NewGuest, NewUser, Role, User, UserId};

/// One group of a by-leader report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderGroup {
    pub leader: LeaderBucket,
    pub leader_name: Option<String>,
    pub guests: Vec<Guest>,
}

pub struct NetworkService {
    store: HierarchyStore,
    max_leader_hops: usize,
}

impl std::fmt::Debug for NetworkService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkService")
            .field("max_leader_hops", &self.max_leader_hops)
            .finish_non_exhaustive()
    }
}

impl NetworkService {
    pub fn new(store: HierarchyStore, config: &NetworkConfig) -> Self {
        Self {
            store,
            max_leader_hops: config.hierarchy.max_leader_hops,
        }
    }

    pub fn store(&self) -> &HierarchyStore {
        &self.store
    }

    /// Load the actor for an authenticated user id.
    pub fn actor(&self, user: UserId) -> Result<Actor> {
        Ok(self.store.require_user(user)?.actor())
    }

    pub fn scope(&self, actor: &Actor) -> Result<Scope> {
        AuthorizationScope::new(&self.store).scope_for(actor)
    }

    fn ensure_user_in_scope(&self, scope: &Scope, user: UserId) -> Result<()> {
        self.store.require_user(user)?;
        scope.ensure_allows(Some(user), "user", user)
    }

    fn leaders(&self) -> LeaderResolver<'_> {
        LeaderResolver::new(&self.store).with_max_hops(self.max_leader_hops)
    }

    // -------------------------------------------------------------------
    // Network reads
    // -------------------------------------------------------------------

    pub fn tree(&self, actor: &Actor, user: UserId) -> Result<TreeNode> {
        let scope = self.scope(actor)?;
        self.ensure_user_in_scope(&scope, user)?;
        TreeBuilder::new(&self.store).build_tree(user)
    }

    pub fn descendants(
        &self,
        actor: &Actor,
        user: UserId,
        role: Option<EdgeRole>,
    ) -> Result<BTreeSet<UserId>> {
        let scope = self.scope(actor)?;
        self.ensure_user_in_scope(&scope, user)?;
        NetworkResolver::new(&self.store).resolve_descendants_via(user, role)
    }

    pub fn leader_of(&self, actor: &Actor, user: UserId, role: Role) -> Result<Option<UserId>> {
        let scope = self.scope(actor)?;
        self.ensure_user_in_scope(&scope, user)?;
        self.leaders().resolve_ancestor_by_role(user, role)
    }

    // -------------------------------------------------------------------
    // Network writes
    // -------------------------------------------------------------------

    /// Make `leader` the Disciple-role parent of `user`, replacing any
    /// previous one. The leader must lie inside the actor's own scope.
    pub fn assign(&self, actor: &Actor, user: UserId, leader: UserId) -> Result<()> {
        let scope = self.scope(actor)?;
        self.ensure_user_in_scope(&scope, user)?;
        self.store.require_user(leader)?;
        if !scope.allows(leader) {
            tracing::warn!(actor = actor.id, leader, "assignment to leader outside scope rejected");
            return Err(NetworkError::InvalidInput(format!(
                "leader {leader} is outside your network"
            )));
        }
        self.store.set_parent(user, leader, EdgeRole::Disciple)?;
        Ok(())
    }

    /// Clear `user`'s Disciple-role parent. Its own disciples stay attached
    /// to it. Returns whether an edge was removed.
    pub fn remove(&self, actor: &Actor, user: UserId) -> Result<bool> {
        let scope = self.scope(actor)?;
        self.ensure_user_in_scope(&scope, user)?;
        self.store.clear_parent(user, EdgeRole::Disciple)
    }

    /// Register a member. Non-admin actors may only register under a parent
    /// in their scope (defaulting to themselves as Disciple-role parent) and
    /// may not grant `Admin`.
    pub fn register(
        &self,
        actor: &Actor,
        new_user: &NewUser,
        parent: Option<(UserId, EdgeRole)>,
    ) -> Result<User> {
        if actor.is_admin() {
            return match parent {
                Some((parent, role)) => self.store.insert_user_under(new_user, parent, role),
                None => self.store.insert_user(new_user),
            };
        }
        if new_user.roles.contains(&Role::Admin) {
            return Err(NetworkError::OutOfScope {
                entity: "role",
                id: actor.id,
            });
        }
        let (parent, role) = parent.unwrap_or((actor.id, EdgeRole::Disciple));
        let scope = self.scope(actor)?;
        self.ensure_user_in_scope(&scope, parent)?;
        self.store.insert_user_under(new_user, parent, role)
    }

    /// Admin-only. Children of the deleted user become roots.
    pub fn delete_user(&self, actor: &Actor, user: UserId) -> Result<()> {
        if !actor.is_admin() {
            return Err(NetworkError::OutOfScope {
                entity: "user",
                id: user,
            });
        }
        self.store.delete_user(user)
    }

    // -------------------------------------------------------------------
    // Guests
    // -------------------------------------------------------------------

    /// Record a guest owned by someone in scope (the actor by default).
    pub fn record_guest(&self, actor: &Actor, guest: &NewGuest) -> Result<Guest> {
        let mut guest = guest.clone();
        let owner = *guest.assigned_to_id.get_or_insert(actor.id);
        let scope = self.scope(actor)?;
        self.ensure_user_in_scope(&scope, owner)?;
        if guest.invited_by_id.is_none() {
            guest.invited_by_id = Some(actor.id);
        }
        self.store.insert_guest(&guest)
    }

    pub fn guest(&self, actor: &Actor, guest: GuestId) -> Result<Guest> {
        AuthorizationScope::new(&self.store).get_guest_scoped(actor, guest)
    }

    pub fn guests(&self, actor: &Actor) -> Result<Vec<Guest>> {
        AuthorizationScope::new(&self.store).list_guests_scoped(actor)
    }

    pub fn convert_guest(&self, actor: &Actor, guest: GuestId, new_user: &NewUser) -> Result<User> {
        self.guest(actor, guest)?;
        if !actor.is_admin() && new_user.roles.contains(&Role::Admin) {
            return Err(NetworkError::OutOfScope {
                entity: "role",
                id: actor.id,
            });
        }
        self.store.convert_guest(guest, new_user)
    }

    /// Visible guests grouped by the nearest leader of `role` above their owner.
    pub fn guests_by_leader(&self, actor: &Actor, role: Role) -> Result<Vec<LeaderGroup>> {
        let leaders = self.leaders();
        let mut groups: std::collections::BTreeMap<LeaderBucket, Vec<Guest>> =
            std::collections::BTreeMap::new();
        for guest in self.guests(actor)? {
            let bucket = leaders.attribute(guest.assigned_to_id, role)?;
            groups.entry(bucket).or_default().push(guest);
        }

        let leader_ids: Vec<UserId> = groups.keys().filter_map(LeaderBucket::leader_id).collect();
        let names: std::collections::HashMap<UserId, String> = self
            .store
            .get_users(&leader_ids)?
            .into_iter()
            .map(|u| (u.id, u.display_name))
            .collect();

        Ok(groups
            .into_iter()
            .map(|(leader, guests)| LeaderGroup {
                leader_name: leader.leader_id().and_then(|id| names.get(&id).cloned()),
                leader,
                guests,
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::initialize_database;

    struct World {
        svc: NetworkService,
        admin: Actor,
        pastor: User,
        l12: User,
        cell: User,
        disciple: User,
        outsider: User,
    }

    fn world() -> World {
        let store = HierarchyStore::from_connection(initialize_database(":memory:").unwrap());
        let add = |name: &str, roles: &[Role]| {
            store
                .insert_user(&NewUser::new(name, format!("{name}@iglesia.org"), roles))
                .unwrap()
        };
        let admin = add("admin", &[Role::Admin]);
        let pastor = add("pastor", &[Role::Pastor, Role::LeaderOfTwelve]);
        let l12 = add("l12", &[Role::LeaderOfTwelve]);
        let cell = add("cell", &[Role::CellLeader]);
        let disciple = add("disciple", &[Role::Disciple]);
        let outsider = add("outsider", &[Role::CellLeader]);
        store.set_parent(l12.id, pastor.id, EdgeRole::Pastor).unwrap();
        store.set_parent(cell.id, l12.id, EdgeRole::LeaderOfTwelve).unwrap();
        store.set_parent(disciple.id, cell.id, EdgeRole::Disciple).unwrap();

        World {
            svc: NetworkService::new(store, &NetworkConfig::default()),
            admin: admin.actor(),
            pastor,
            l12,
            cell,
            disciple,
            outsider,
        }
    }

    #[test]
    fn tree_requires_scope() {
        let w = world();
        let cell = w.cell.actor();
        assert!(w.svc.tree(&cell, w.disciple.id).is_ok());
        assert!(matches!(
            w.svc.tree(&cell, w.pastor.id),
            Err(NetworkError::OutOfScope { .. })
        ));
        assert!(matches!(
            w.svc.tree(&cell, 9_999),
            Err(NetworkError::NotFound { .. })
        ));
    }

    #[test]
    fn assign_rejects_cycle_and_foreign_leader() {
        let w = world();
        let pastor = w.pastor.actor();
        // Cycle: pastor under its own descendant.
        w.svc.assign(&w.admin, w.l12.id, w.pastor.id).unwrap();
        assert!(matches!(
            w.svc.assign(&w.admin, w.pastor.id, w.disciple.id),
            Err(NetworkError::CycleRejected { .. })
        ));
        // Leader outside the actor's scope.
        assert!(matches!(
            w.svc.assign(&pastor, w.disciple.id, w.outsider.id),
            Err(NetworkError::InvalidInput(_))
        ));
        // Legitimate move inside the network.
        w.svc.assign(&pastor, w.disciple.id, w.l12.id).unwrap();
        let edge = w
            .svc
            .store()
            .get_parent_edge(w.disciple.id, EdgeRole::Disciple)
            .unwrap()
            .unwrap();
        assert_eq!(edge.parent_id, w.l12.id);
    }

    #[test]
    fn remove_keeps_children_attached() {
        let w = world();
        let grandchild = w
            .svc
            .register(&w.disciple.actor(), &NewUser::new("nieto", "nieto@iglesia.org", &[]), None)
            .unwrap();
        assert!(w.svc.remove(&w.admin, w.disciple.id).unwrap());
        let edge = w
            .svc
            .store()
            .get_parent_edge(grandchild.id, EdgeRole::Disciple)
            .unwrap()
            .unwrap();
        assert_eq!(edge.parent_id, w.disciple.id);
        assert!(!w
            .svc
            .descendants(&w.admin, w.cell.id, None)
            .unwrap()
            .contains(&grandchild.id));
    }

    #[test]
    fn register_defaults_under_actor_and_blocks_admin_grant() {
        let w = world();
        let cell = w.cell.actor();
        let u = w
            .svc
            .register(&cell, &NewUser::new("nuevo", "nuevo@iglesia.org", &[Role::Disciple]), None)
            .unwrap();
        assert!(w.svc.descendants(&cell, w.cell.id, None).unwrap().contains(&u.id));

        let err = w
            .svc
            .register(&cell, &NewUser::new("jefe", "jefe@iglesia.org", &[Role::Admin]), None)
            .unwrap_err();
        assert!(matches!(err, NetworkError::OutOfScope { .. }));

        let err = w
            .svc
            .register(
                &cell,
                &NewUser::new("x", "x@iglesia.org", &[]),
                Some((w.outsider.id, EdgeRole::Disciple)),
            )
            .unwrap_err();
        assert!(matches!(err, NetworkError::OutOfScope { .. }));
    }

    #[test]
    fn delete_user_is_admin_only() {
        let w = world();
        assert!(w.svc.delete_user(&w.pastor.actor(), w.cell.id).is_err());
        w.svc.delete_user(&w.admin, w.cell.id).unwrap();
        assert!(w.svc.descendants(&w.admin, w.pastor.id, None).unwrap().len() == 1);
    }

    #[test]
    fn guests_by_leader_groups_visible_guests() {
        let w = world();
        let cell = w.cell.actor();
        w.svc
            .record_guest(
                &cell,
                &NewGuest {
                    name: "g1".into(),
                    phone: None,
                    assigned_to_id: Some(w.disciple.id),
                    invited_by_id: None,
                },
            )
            .unwrap();
        w.svc
            .record_guest(
                &w.outsider.actor(),
                &NewGuest {
                    name: "g2".into(),
                    phone: None,
                    assigned_to_id: None,
                    invited_by_id: None,
                },
            )
            .unwrap();

        let report = w.svc.guests_by_leader(&w.admin, Role::CellLeader).unwrap();
        assert_eq!(report.len(), 2);
        let by_cell = report
            .iter()
            .find(|g| g.leader == LeaderBucket::Leader(w.outsider.id))
            .unwrap();
        assert_eq!(by_cell.guests[0].name, "g2");
        assert_eq!(by_cell.leader_name.as_deref(), Some("outsider"));

        // The disciple's guest: disciple has no CellLeader edge and is not a
        // cell leader itself, so it lands in Unassigned.
        let unassigned = report
            .iter()
            .find(|g| g.leader == LeaderBucket::Unassigned)
            .unwrap();
        assert_eq!(unassigned.guests[0].name, "g1");

        let scoped = w.svc.guests_by_leader(&cell, Role::CellLeader).unwrap();
        assert_eq!(scoped.iter().map(|g| g.guests.len()).sum::<usize>(), 1);
    }

    #[test]
    fn record_guest_outside_scope_rejected() {
        let w = world();
        let err = w
            .svc
            .record_guest(
                &w.cell.actor(),
                &NewGuest {
                    name: "g".into(),
                    phone: None,
                    assigned_to_id: Some(w.outsider.id),
                    invited_by_id: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, NetworkError::OutOfScope { .. }));
    }

    #[test]
    fn convert_guest_through_service() {
        let w = world();
        let cell = w.cell.actor();
        let guest = w
            .svc
            .record_guest(
                &cell,
                &NewGuest {
                    name: "Rosa".into(),
                    phone: None,
                    assigned_to_id: None,
                    invited_by_id: None,
                },
            )
            .unwrap();
        let member = w
            .svc
            .convert_guest(&cell, guest.id, &NewUser::new("Rosa", "rosa@iglesia.org", &[Role::Disciple]))
            .unwrap();
        assert!(w.svc.descendants(&cell, w.cell.id, None).unwrap().contains(&member.id));
        assert!(matches!(
            w.svc.guest(&w.outsider.actor(), guest.id),
            Err(NetworkError::OutOfScope { .. })
        ));
    }

    #[test]
    fn leader_of_uses_configured_hops() {
        let w = world();
        assert_eq!(
            w.svc.leader_of(&w.admin, w.disciple.id, Role::CellLeader).unwrap(),
            None
        );
        assert_eq!(
            w.svc.leader_of(&w.admin, w.cell.id, Role::LeaderOfTwelve).unwrap(),
            Some(w.l12.id)
        );
    }
}
