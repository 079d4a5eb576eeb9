//! Core domain types for the discipleship network.
//!
//! Users carry a role set that is independent of where they sit in the
//! hierarchy; the hierarchy itself is a set of role-tagged parent→child
//! edges. See [`HierarchyEdge`] for the invariants the store enforces.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, Result};

/// Identifier of a user row.
pub type UserId = i64;

/// Identifier of a guest row.
pub type GuestId = i64;

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// Roles a user may hold. A user may hold several at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Pastor,
    LeaderOfTwelve,
    CellLeader,
    Disciple,
    Admin,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Pastor,
        Role::LeaderOfTwelve,
        Role::CellLeader,
        Role::Disciple,
        Role::Admin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pastor => "pastor",
            Self::LeaderOfTwelve => "leader_of_twelve",
            Self::CellLeader => "cell_leader",
            Self::Disciple => "disciple",
            Self::Admin => "admin",
        }
    }

    /// Parse from a loose string (case-insensitive, `-`/`_`/space accepted,
    /// plus the Spanish names still used by older clients).
    pub fn from_str_loose(s: &str) -> Option<Self> {
        let normalized: String = s
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == '-' || c == ' ' { '_' } else { c })
            .collect();
        match normalized.as_str() {
            "pastor" => Some(Self::Pastor),
            "leader_of_twelve" | "leaderoftwelve" | "l12" | "lider_doce" | "lider_de_doce" => {
                Some(Self::LeaderOfTwelve)
            }
            "cell_leader" | "cellleader" | "lider_celula" | "lider_de_celula" => {
                Some(Self::CellLeader)
            }
            "disciple" | "discipulo" => Some(Self::Disciple),
            "admin" | "administrator" => Some(Self::Admin),
            _ => None,
        }
    }

    /// Whether this role grants visibility over the holder's downstream network.
    pub fn is_network_leader(&self) -> bool {
        matches!(self, Self::Pastor | Self::LeaderOfTwelve | Self::CellLeader)
    }

    /// The hierarchy edge category matching this role, if any.
    pub fn edge_role(&self) -> Option<EdgeRole> {
        match self {
            Self::Pastor => Some(EdgeRole::Pastor),
            Self::LeaderOfTwelve => Some(EdgeRole::LeaderOfTwelve),
            Self::CellLeader => Some(EdgeRole::CellLeader),
            Self::Disciple => Some(EdgeRole::Disciple),
            Self::Admin => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// EdgeRole
// ---------------------------------------------------------------------------

/// The category of a hierarchy edge: which kind of leader the parent is for
/// the child. A child has at most one parent per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeRole {
    Pastor,
    LeaderOfTwelve,
    CellLeader,
    Disciple,
}

impl EdgeRole {
    pub const ALL: [EdgeRole; 4] = [
        EdgeRole::Pastor,
        EdgeRole::LeaderOfTwelve,
        EdgeRole::CellLeader,
        EdgeRole::Disciple,
    ];

    pub fn as_str(&self) -> &'static str {
        self.as_role().as_str()
    }

    pub fn as_role(&self) -> Role {
        match self {
            Self::Pastor => Role::Pastor,
            Self::LeaderOfTwelve => Role::LeaderOfTwelve,
            Self::CellLeader => Role::CellLeader,
            Self::Disciple => Role::Disciple,
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        Role::from_str_loose(s).and_then(|r| r.edge_role())
    }
}

impl std::fmt::Display for EdgeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// A member of the church.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub email: String,
    pub roles: Vec<Role>,
    pub created_at: String,
}

impl User {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn actor(&self) -> Actor {
        Actor {
            id: self.id,
            roles: self.roles.clone(),
        }
    }
}

/// Input for creating a user.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub display_name: String,
    pub email: String,
    #[serde(default)]
    pub roles: Vec<Role>,
}

impl NewUser {
    pub fn new(display_name: impl Into<String>, email: impl Into<String>, roles: &[Role]) -> Self {
        Self {
            display_name: display_name.into(),
            email: email.into(),
            roles: roles.to_vec(),
        }
    }

    /// Reject blank names and malformed emails before anything hits the store.
    pub fn validate(&self) -> Result<()> {
        if self.display_name.trim().is_empty() {
            return Err(NetworkError::InvalidInput(
                "display name must not be empty".into(),
            ));
        }
        if !is_valid_email(&self.email) {
            return Err(NetworkError::InvalidInput(format!(
                "'{}' is not a valid email address",
                self.email
            )));
        }
        Ok(())
    }
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern is a valid regex")
    })
}

pub fn is_valid_email(email: &str) -> bool {
    email_regex().is_match(email.trim())
}

/// The authenticated user on whose behalf an operation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: UserId,
    pub roles: Vec<Role>,
}

impl Actor {
    pub fn new(id: UserId, roles: &[Role]) -> Self {
        Self {
            id,
            roles: roles.to_vec(),
        }
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(Role::Admin)
    }
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// A directed, role-tagged parent→child relationship.
///
/// Invariants held by the store: `parent_id != child_id`, `(child_id, role)`
/// is unique, and no set of edges forms a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyEdge {
    pub parent_id: UserId,
    pub child_id: UserId,
    pub role: EdgeRole,
}

// ---------------------------------------------------------------------------
// Guests
// ---------------------------------------------------------------------------

/// A non-member visitor owned by (assigned to) a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Guest {
    pub id: GuestId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub assigned_to_id: Option<UserId>,
    pub invited_by_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub converted_user_id: Option<UserId>,
}

/// Input for recording a guest.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewGuest {
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    pub assigned_to_id: Option<UserId>,
    pub invited_by_id: Option<UserId>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
