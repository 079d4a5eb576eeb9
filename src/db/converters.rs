//! Row → domain type conversions.
//!
//! Roles are stored as their `as_str` names; an unknown name in the table is
//! surfaced as a conversion error rather than silently dropped.

use rusqlite::types::Type;
use rusqlite::Row;

use crate::types::{EdgeRole, Guest, HierarchyEdge, Role};

fn unknown_role(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unknown role '{value}'").into(),
    )
}

/// Parse a stored role name.
pub fn parse_role(idx: usize, value: &str) -> rusqlite::Result<Role> {
    Role::from_str_loose(value).ok_or_else(|| unknown_role(idx, value))
}

/// Parse a stored edge role name.
pub fn parse_edge_role(idx: usize, value: &str) -> rusqlite::Result<EdgeRole> {
    EdgeRole::from_str_loose(value).ok_or_else(|| unknown_role(idx, value))
}

/// Convert a `hierarchy_edges` row selected as `parent_id, child_id, role`.
pub fn row_to_edge(row: &Row<'_>) -> rusqlite::Result<HierarchyEdge> {
    let role: String = row.get("role")?;
    Ok(HierarchyEdge {
        parent_id: row.get("parent_id")?,
        child_id: row.get("child_id")?,
        role: parse_edge_role(2, &role)?,
    })
}

/// Convert a `guests` row.
pub fn row_to_guest(row: &Row<'_>) -> rusqlite::Result<Guest> {
    Ok(Guest {
        id: row.get("id")?,
        name: row.get("name")?,
        phone: row.get("phone")?,
        assigned_to_id: row.get("assigned_to_id")?,
        invited_by_id: row.get("invited_by_id")?,
        converted_user_id: row.get("converted_user_id")?,
    })
}

/// Bare user columns; roles are attached separately from `user_roles`.
pub struct UserRow {
    pub id: i64,
    pub display_name: String,
    pub email: String,
    pub created_at: String,
}

pub fn row_to_user_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get("id")?,
        display_name: row.get("display_name")?,
        email: row.get("email")?,
        created_at: row.get("created_at")?,
    })
}
