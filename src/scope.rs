//! Hierarchy-scoped authorization.
//!
//! An actor's [`Scope`] is the allow-list of owner ids it may see or modify.
//! Every owner-scoped read or write applies it before touching data; a
//! record whose owner is outside the scope is reported as
//! [`NetworkError::OutOfScope`], even when it exists.

use std::collections::BTreeSet;

use rusqlite::params_from_iter;
use serde::Serialize;

use crate::db::converters::row_to_guest;
use crate::error::{NetworkError, Result};
use crate::graph::store::HierarchyStore;
use crate::graph::traversal::NetworkResolver;
use crate::types::{Actor, Guest, GuestId, Role, UserId};

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// The set of owner ids an actor is authorized for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Scope {
    /// No filter.
    All,
    /// Only records owned by one of these users.
    Restricted {
        #[serde(rename = "allowedIds")]
        allowed_ids: BTreeSet<UserId>,
    },
}

/// A `WHERE` fragment plus its bound parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlFilter {
    pub clause: String,
    pub params: Vec<UserId>,
}

impl Scope {
    pub fn allows(&self, owner: UserId) -> bool {
        match self {
            Self::All => true,
            Self::Restricted { allowed_ids } => allowed_ids.contains(&owner),
        }
    }

    /// `Ok(())` if `owner` is in scope; `OutOfScope` naming the addressed
    /// record otherwise. An unowned record is only visible to `All`.
    pub fn ensure_allows(&self, owner: Option<UserId>, entity: &'static str, id: i64) -> Result<()> {
        let ok = match owner {
            Some(owner) => self.allows(owner),
            None => matches!(self, Self::All),
        };
        if ok {
            Ok(())
        } else {
            Err(NetworkError::OutOfScope { entity, id })
        }
    }

    /// Keep only the items whose owner is in scope.
    pub fn filter_owned<T, F>(&self, items: impl IntoIterator<Item = T>, owner: F) -> Vec<T>
    where
        F: Fn(&T) -> Option<UserId>,
    {
        items
            .into_iter()
            .filter(|item| match owner(item) {
                Some(id) => self.allows(id),
                None => matches!(self, Self::All),
            })
            .collect()
    }

    pub fn allowed_ids(&self) -> Option<&BTreeSet<UserId>> {
        match self {
            Self::All => None,
            Self::Restricted { allowed_ids } => Some(allowed_ids),
        }
    }

    /// Row filter on `column`, numbering placeholders from `first_param`.
    pub fn sql_filter(&self, column: &str, first_param: usize) -> SqlFilter {
        match self {
            Self::All => SqlFilter {
                clause: "1=1".to_string(),
                params: Vec::new(),
            },
            Self::Restricted { allowed_ids } if allowed_ids.is_empty() => SqlFilter {
                clause: "0=1".to_string(),
                params: Vec::new(),
            },
            Self::Restricted { allowed_ids } => {
                let placeholders: Vec<String> = (0..allowed_ids.len())
                    .map(|i| format!("?{}", first_param + i))
                    .collect();
                SqlFilter {
                    clause: format!("{column} IN ({})", placeholders.join(", ")),
                    params: allowed_ids.iter().copied().collect(),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// AuthorizationScope
// ---------------------------------------------------------------------------

/// Derives scopes from hierarchy position and applies them to guest records.
pub struct AuthorizationScope<'a> {
    store: &'a HierarchyStore,
}

impl<'a> AuthorizationScope<'a> {
    pub fn new(store: &'a HierarchyStore) -> Self {
        Self { store }
    }

    /// | Actor role                             | Scope                          |
    /// |----------------------------------------|--------------------------------|
    /// | Admin                                  | `All`                          |
    /// | Pastor / LeaderOfTwelve / CellLeader   | actor ∪ descendants(actor)     |
    /// | anything else                          | actor only                     |
    pub fn scope_for(&self, actor: &Actor) -> Result<Scope> {
        if actor.is_admin() {
            return Ok(Scope::All);
        }
        let mut allowed_ids = BTreeSet::from([actor.id]);
        if actor.roles.iter().any(Role::is_network_leader) {
            allowed_ids.extend(NetworkResolver::new(self.store).resolve_descendants(actor.id)?);
        }
        tracing::debug!(actor = actor.id, allowed = allowed_ids.len(), "scope resolved");
        Ok(Scope::Restricted { allowed_ids })
    }

    /// Fetch a guest addressed by id. Missing → `NotFound`; owner outside
    /// the actor's scope → `OutOfScope`.
    pub fn get_guest_scoped(&self, actor: &Actor, guest_id: GuestId) -> Result<Guest> {
        let guest = self
            .store
            .get_guest(guest_id)?
            .ok_or_else(|| NetworkError::guest_not_found(guest_id))?;
        let scope = self.scope_for(actor)?;
        if let Err(err) = scope.ensure_allows(guest.assigned_to_id, "guest", guest_id) {
            tracing::warn!(actor = actor.id, guest = guest_id, "guest access outside scope");
            return Err(err);
        }
        Ok(guest)
    }

    /// Guests whose owner is in the actor's scope, filtered in SQL.
    pub fn list_guests_scoped(&self, actor: &Actor) -> Result<Vec<Guest>> {
        let scope = self.scope_for(actor)?;
        let filter = scope.sql_filter("assigned_to_id", 1);
        let sql = format!("SELECT * FROM guests WHERE {} ORDER BY id", filter.clause);
        let mut stmt = self.store.conn.prepare(&sql)?;
        let rows = stmt.query_and_then(params_from_iter(filter.params.iter()), row_to_guest)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
