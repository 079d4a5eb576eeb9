//! SQLite CRUD layer for the hierarchy.
//!
//! Every query goes through [`Connection::prepare_cached`]. Batch lookups
//! bind the id list as one JSON array and expand it with `json_each`, so a
//! whole network is fetched in a single round trip instead of one query per
//! user.
//!
//! All hierarchy edge writes funnel through [`HierarchyStore::set_parent`]
//! (or the private `write_parent_edge` it shares with guest conversion).
//! That boundary opens an `IMMEDIATE` transaction, runs the cycle check
//! against the transaction's view of the graph and only then writes, so the
//! check and the write are atomic with respect to every other writer.

use std::collections::HashMap;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::db::converters::{parse_role, row_to_edge, row_to_guest, row_to_user_row};
use crate::db::schema::initialize_database;
use crate::error::{NetworkError, Result};
use crate::graph::cycle::CycleGuard;
use crate::types::{EdgeRole, Guest, GuestId, HierarchyEdge, NewGuest, NewUser, Role, User, UserId};

// ---------------------------------------------------------------------------
// NetworkStats
// ---------------------------------------------------------------------------

/// Aggregate row counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct NetworkStats {
    pub users: usize,
    pub edges: usize,
    pub guests: usize,
}

// ---------------------------------------------------------------------------
// HierarchyStore
// ---------------------------------------------------------------------------

/// Typed CRUD wrapper around the network database.
pub struct HierarchyStore {
    pub conn: Connection,
}

impl std::fmt::Debug for HierarchyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchyStore").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// SQL constants
// ---------------------------------------------------------------------------

const INSERT_USER_SQL: &str = "\
INSERT INTO users (display_name, email, created_at) VALUES (?1, ?2, ?3)";

const INSERT_ROLE_SQL: &str = "\
INSERT OR IGNORE INTO user_roles (user_id, role) VALUES (?1, ?2)";

const SELECT_USERS_IN_SQL: &str = "\
SELECT id, display_name, email, created_at FROM users
WHERE id IN (SELECT value FROM json_each(?1))
ORDER BY id";

const SELECT_ROLES_IN_SQL: &str = "\
SELECT user_id, role FROM user_roles
WHERE user_id IN (SELECT value FROM json_each(?1))";

const UPSERT_EDGE_SQL: &str = "\
INSERT INTO hierarchy_edges (parent_id, child_id, role, created_at)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(child_id, role) DO UPDATE SET
  parent_id = excluded.parent_id,
  created_at = excluded.created_at";

const SELECT_EDGES_AMONG_SQL: &str = "\
SELECT parent_id, child_id, role FROM hierarchy_edges
WHERE parent_id IN (SELECT value FROM json_each(?1))
  AND child_id IN (SELECT value FROM json_each(?1))
  AND (?2 IS NULL OR role = ?2)
ORDER BY parent_id, child_id";

const INSERT_GUEST_SQL: &str = "\
INSERT INTO guests (name, phone, assigned_to_id, invited_by_id, created_at)
VALUES (?1, ?2, ?3, ?4, ?5)";

const SELECT_GUESTS_FOR_OWNERS_SQL: &str = "\
SELECT * FROM guests
WHERE assigned_to_id IN (SELECT value FROM json_each(?1))
ORDER BY id";

/// Serialize an id list as the JSON array consumed by `json_each`.
pub(crate) fn id_list(ids: &[UserId]) -> String {
    serde_json::Value::from(ids.to_vec()).to_string()
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

// ---------------------------------------------------------------------------
// Connection-level helpers (usable inside a transaction)
// ---------------------------------------------------------------------------

fn user_exists(conn: &Connection, id: UserId) -> Result<bool> {
    let mut stmt = conn.prepare_cached("SELECT 1 FROM users WHERE id = ?1")?;
    Ok(stmt.exists(params![id])?)
}

fn ensure_user(conn: &Connection, id: UserId) -> Result<()> {
    if user_exists(conn, id)? {
        Ok(())
    } else {
        Err(NetworkError::user_not_found(id))
    }
}

fn insert_user_on(conn: &Connection, new_user: &NewUser) -> Result<User> {
    new_user.validate()?;
    let created_at = now();
    let email = new_user.email.trim().to_lowercase();

    let mut stmt = conn.prepare_cached(INSERT_USER_SQL)?;
    stmt.execute(params![new_user.display_name.trim(), email, created_at])
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                NetworkError::InvalidInput(format!("email '{email}' is already registered"))
            }
            other => other.into(),
        })?;
    let id = conn.last_insert_rowid();

    let mut roles = new_user.roles.clone();
    roles.sort();
    roles.dedup();
    let mut role_stmt = conn.prepare_cached(INSERT_ROLE_SQL)?;
    for role in &roles {
        role_stmt.execute(params![id, role.as_str()])?;
    }

    Ok(User {
        id,
        display_name: new_user.display_name.trim().to_string(),
        email,
        roles,
        created_at,
    })
}

/// The single hierarchy edge-write path. Callers must hold an immediate
/// transaction on `conn`.
fn write_parent_edge(
    conn: &Connection,
    child: UserId,
    parent: UserId,
    role: EdgeRole,
) -> Result<HierarchyEdge> {
    ensure_user(conn, child)?;
    ensure_user(conn, parent)?;

    if CycleGuard::on(conn).would_create_cycle(child, parent)? {
        tracing::warn!(child, parent, role = %role, "rejected edge write: would create a cycle");
        return Err(NetworkError::CycleRejected { child, parent });
    }

    let mut stmt = conn.prepare_cached(UPSERT_EDGE_SQL)?;
    stmt.execute(params![parent, child, role.as_str(), now()])?;
    tracing::info!(child, parent, role = %role, "hierarchy edge written");

    Ok(HierarchyEdge {
        parent_id: parent,
        child_id: child,
        role,
    })
}

// ---------------------------------------------------------------------------
// Implementation
// ---------------------------------------------------------------------------

impl HierarchyStore {
    /// Open (or create) the database at `db_path`, apply the schema, and
    /// return a ready-to-use store.
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = initialize_database(db_path)?;
        Ok(Self { conn })
    }

    /// Wrap an already-open connection. Useful in tests where the caller
    /// has already called `initialize_database(":memory:")`.
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    fn immediate(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    // -------------------------------------------------------------------
    // Users
    // -------------------------------------------------------------------

    /// Create a user together with its role set.
    pub fn insert_user(&self, new_user: &NewUser) -> Result<User> {
        let tx = self.immediate()?;
        let user = insert_user_on(&tx, new_user)?;
        tx.commit()?;
        tracing::info!(user = user.id, "user registered");
        Ok(user)
    }

    /// Create a user and attach it under `parent` in one transaction. The
    /// edge goes through the same checked write path as [`Self::set_parent`].
    pub fn insert_user_under(
        &self,
        new_user: &NewUser,
        parent: UserId,
        role: EdgeRole,
    ) -> Result<User> {
        let tx = self.immediate()?;
        let user = insert_user_on(&tx, new_user)?;
        write_parent_edge(&tx, user.id, parent, role)?;
        tx.commit()?;
        tracing::info!(user = user.id, parent, role = %role, "user registered under leader");
        Ok(user)
    }

    /// Retrieve a single user by id, or `None` if it doesn't exist.
    pub fn get_user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.get_users(&[id])?.into_iter().next())
    }

    /// Like [`Self::get_user`] but a missing user is an error.
    pub fn require_user(&self, id: UserId) -> Result<User> {
        self.get_user(id)?
            .ok_or_else(|| NetworkError::user_not_found(id))
    }

    pub fn user_exists(&self, id: UserId) -> Result<bool> {
        user_exists(&self.conn, id)
    }

    /// Fetch many users (with roles) in one batch. Missing ids are skipped.
    pub fn get_users(&self, ids: &[UserId]) -> Result<Vec<User>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let json = id_list(ids);

        let mut roles: HashMap<UserId, Vec<Role>> = HashMap::new();
        {
            let mut stmt = self.conn.prepare_cached(SELECT_ROLES_IN_SQL)?;
            let mut rows = stmt.query(params![json])?;
            while let Some(row) = rows.next()? {
                let user_id: UserId = row.get(0)?;
                let name: String = row.get(1)?;
                roles
                    .entry(user_id)
                    .or_default()
                    .push(parse_role(1, &name)?);
            }
        }

        let mut stmt = self.conn.prepare_cached(SELECT_USERS_IN_SQL)?;
        let rows = stmt.query_and_then(params![json], row_to_user_row)?;
        let mut users = Vec::with_capacity(ids.len());
        for row in rows {
            let row = row?;
            let mut user_roles = roles.remove(&row.id).unwrap_or_default();
            user_roles.sort();
            users.push(User {
                id: row.id,
                display_name: row.display_name,
                email: row.email,
                roles: user_roles,
                created_at: row.created_at,
            });
        }
        Ok(users)
    }

    /// Every user, ordered by id.
    pub fn list_users(&self) -> Result<Vec<User>> {
        let ids: Vec<UserId> = {
            let mut stmt = self.conn.prepare_cached("SELECT id FROM users ORDER BY id")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };
        self.get_users(&ids)
    }

    /// Roles held by a user (empty if the user does not exist).
    pub fn get_roles(&self, id: UserId) -> Result<Vec<Role>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT role FROM user_roles WHERE user_id = ?1 ORDER BY role")?;
        let rows = stmt.query_and_then(params![id], |row| {
            let name: String = row.get(0)?;
            parse_role(0, &name)
        })?;
        let mut roles = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        roles.sort();
        Ok(roles)
    }

    pub fn add_role(&self, id: UserId, role: Role) -> Result<()> {
        ensure_user(&self.conn, id)?;
        let mut stmt = self.conn.prepare_cached(INSERT_ROLE_SQL)?;
        stmt.execute(params![id, role.as_str()])?;
        Ok(())
    }

    /// Returns whether the role was held.
    pub fn remove_role(&self, id: UserId, role: Role) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM user_roles WHERE user_id = ?1 AND role = ?2")?;
        Ok(stmt.execute(params![id, role.as_str()])? > 0)
    }

    /// Delete a user and every edge where it is parent or child. Its former
    /// children are not reparented; they become roots of their own subtrees.
    /// Guests assigned to the user stay, unassigned.
    pub fn delete_user(&self, id: UserId) -> Result<()> {
        let tx = self.immediate()?;
        ensure_user(&tx, id)?;

        let orphaned = tx
            .prepare_cached("DELETE FROM hierarchy_edges WHERE parent_id = ?1")?
            .execute(params![id])?;
        let detached = tx
            .prepare_cached("DELETE FROM hierarchy_edges WHERE child_id = ?1")?
            .execute(params![id])?;
        tx.prepare_cached("UPDATE guests SET assigned_to_id = NULL WHERE assigned_to_id = ?1")?
            .execute(params![id])?;
        tx.prepare_cached("UPDATE guests SET invited_by_id = NULL WHERE invited_by_id = ?1")?
            .execute(params![id])?;
        tx.prepare_cached("DELETE FROM user_roles WHERE user_id = ?1")?
            .execute(params![id])?;
        tx.prepare_cached("DELETE FROM users WHERE id = ?1")?
            .execute(params![id])?;
        tx.commit()?;

        tracing::info!(user = id, orphaned, detached, "user deleted");
        Ok(())
    }

    // -------------------------------------------------------------------
    // Edges: writes
    // -------------------------------------------------------------------

    /// Create or replace `child`'s parent for `role`.
    ///
    /// This is the only public edge-write entry point. It rejects self-loops
    /// and cycles with [`NetworkError::CycleRejected`] and unknown users with
    /// [`NetworkError::NotFound`].
    pub fn set_parent(&self, child: UserId, parent: UserId, role: EdgeRole) -> Result<HierarchyEdge> {
        let tx = self.immediate()?;
        let edge = write_parent_edge(&tx, child, parent, role)?;
        tx.commit()?;
        Ok(edge)
    }

    /// Remove `child`'s parent edge for `role`. Returns whether an edge existed.
    pub fn clear_parent(&self, child: UserId, role: EdgeRole) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM hierarchy_edges WHERE child_id = ?1 AND role = ?2")?;
        let removed = stmt.execute(params![child, role.as_str()])? > 0;
        if removed {
            tracing::info!(child, role = %role, "hierarchy edge cleared");
        }
        Ok(removed)
    }

    // -------------------------------------------------------------------
    // Edges: queries
    // -------------------------------------------------------------------

    /// The parent edge of `child` for `role`, if any.
    pub fn get_parent_edge(&self, child: UserId, role: EdgeRole) -> Result<Option<HierarchyEdge>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT parent_id, child_id, role FROM hierarchy_edges WHERE child_id = ?1 AND role = ?2",
        )?;
        Ok(stmt
            .query_row(params![child, role.as_str()], row_to_edge)
            .optional()?)
    }

    /// All incoming edges of `child` (at most one per role).
    pub fn get_parent_edges(&self, child: UserId) -> Result<Vec<HierarchyEdge>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT parent_id, child_id, role FROM hierarchy_edges WHERE child_id = ?1 ORDER BY role",
        )?;
        let rows = stmt.query_and_then(params![child], row_to_edge)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Outgoing edges of `parent`, optionally filtered by role.
    pub fn get_child_edges(&self, parent: UserId, role: Option<EdgeRole>) -> Result<Vec<HierarchyEdge>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT parent_id, child_id, role FROM hierarchy_edges
             WHERE parent_id = ?1 AND (?2 IS NULL OR role = ?2)
             ORDER BY child_id",
        )?;
        let rows = stmt.query_and_then(params![parent, role.map(|r| r.as_str())], row_to_edge)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Edges whose endpoints both lie in `ids`, in one batch query.
    pub fn get_edges_among(&self, ids: &[UserId], role: Option<EdgeRole>) -> Result<Vec<HierarchyEdge>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare_cached(SELECT_EDGES_AMONG_SQL)?;
        let rows = stmt.query_and_then(
            params![id_list(ids), role.map(|r| r.as_str())],
            row_to_edge,
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Every edge in the table.
    pub fn list_edges(&self) -> Result<Vec<HierarchyEdge>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT parent_id, child_id, role FROM hierarchy_edges ORDER BY parent_id, child_id",
        )?;
        let rows = stmt.query_and_then([], row_to_edge)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // -------------------------------------------------------------------
    // Guests
    // -------------------------------------------------------------------

    pub fn insert_guest(&self, guest: &NewGuest) -> Result<Guest> {
        if guest.name.trim().is_empty() {
            return Err(NetworkError::InvalidInput("guest name must not be empty".into()));
        }
        for id in [guest.assigned_to_id, guest.invited_by_id].into_iter().flatten() {
            ensure_user(&self.conn, id)?;
        }
        let mut stmt = self.conn.prepare_cached(INSERT_GUEST_SQL)?;
        stmt.execute(params![
            guest.name.trim(),
            guest.phone,
            guest.assigned_to_id,
            guest.invited_by_id,
            now(),
        ])?;
        Ok(Guest {
            id: self.conn.last_insert_rowid(),
            name: guest.name.trim().to_string(),
            phone: guest.phone.clone(),
            assigned_to_id: guest.assigned_to_id,
            invited_by_id: guest.invited_by_id,
            converted_user_id: None,
        })
    }

    pub fn get_guest(&self, id: GuestId) -> Result<Option<Guest>> {
        let mut stmt = self.conn.prepare_cached("SELECT * FROM guests WHERE id = ?1")?;
        Ok(stmt.query_row(params![id], row_to_guest).optional()?)
    }

    /// Guests assigned to any of `owners`, in one batch query.
    pub fn list_guests_for_owners(&self, owners: &[UserId]) -> Result<Vec<Guest>> {
        if owners.is_empty() {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare_cached(SELECT_GUESTS_FOR_OWNERS_SQL)?;
        let rows = stmt.query_and_then(params![id_list(owners)], row_to_guest)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn list_all_guests(&self) -> Result<Vec<Guest>> {
        let mut stmt = self.conn.prepare_cached("SELECT * FROM guests ORDER BY id")?;
        let rows = stmt.query_and_then([], row_to_guest)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Turn a guest into a member. The inviter (falling back to the assigned
    /// owner) becomes the new member's Disciple-role parent.
    pub fn convert_guest(&self, guest_id: GuestId, new_user: &NewUser) -> Result<User> {
        let tx = self.immediate()?;
        let guest = tx
            .prepare_cached("SELECT * FROM guests WHERE id = ?1")?
            .query_row(params![guest_id], row_to_guest)
            .optional()?
            .ok_or_else(|| NetworkError::guest_not_found(guest_id))?;
        if let Some(existing) = guest.converted_user_id {
            return Err(NetworkError::InvalidInput(format!(
                "guest {guest_id} was already converted to user {existing}"
            )));
        }

        let user = insert_user_on(&tx, new_user)?;
        if let Some(parent) = guest.invited_by_id.or(guest.assigned_to_id) {
            write_parent_edge(&tx, user.id, parent, EdgeRole::Disciple)?;
        }
        tx.prepare_cached("UPDATE guests SET converted_user_id = ?1 WHERE id = ?2")?
            .execute(params![user.id, guest_id])?;
        tx.commit()?;

        tracing::info!(guest = guest_id, user = user.id, "guest converted to member");
        Ok(user)
    }

    // -------------------------------------------------------------------
    // Aggregates
    // -------------------------------------------------------------------

    pub fn stats(&self) -> Result<NetworkStats> {
        let count = |sql: &str| -> Result<usize> {
            let mut stmt = self.conn.prepare_cached(sql)?;
            let n: i64 = stmt.query_row([], |row| row.get(0))?;
            Ok(n as usize)
        };
        Ok(NetworkStats {
            users: count("SELECT count(*) FROM users")?,
            edges: count("SELECT count(*) FROM hierarchy_edges")?,
            guests: count("SELECT count(*) FROM guests")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
