//! Error types for the network core.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side
//! is [`NetworkError`]. The variants map one-to-one onto the outcomes callers
//! have to distinguish: missing records, rejected edge writes, and records
//! outside the actor's authorization scope.

use crate::types::UserId;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, NetworkError>;

/// All errors produced by the network core.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A referenced record does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// Writing the edge would make `child` an ancestor of its own ancestor.
    #[error(
        "cannot assign user {parent} as leader of user {child}: \
         {parent} already belongs to {child}'s network, this would create a cycle"
    )]
    CycleRejected { child: UserId, parent: UserId },

    /// The actor's scope does not contain the record's owner.
    #[error("not authorized to access {entity} {id}")]
    OutOfScope { entity: &'static str, id: i64 },

    /// Request-level validation failure (bad email, unknown role, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl NetworkError {
    pub fn user_not_found(id: UserId) -> Self {
        Self::NotFound { entity: "user", id }
    }

    pub fn guest_not_found(id: i64) -> Self {
        Self::NotFound { entity: "guest", id }
    }

    /// Stable machine-readable code, used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::CycleRejected { .. } => "cycle_rejected",
            Self::OutOfScope { .. } => "out_of_scope",
            Self::InvalidInput(_) => "invalid_input",
            Self::Config(_) => "config_error",
            Self::Database(_) => "database_error",
            Self::Io(_) => "io_error",
            Self::Other(_) => "unknown_error",
        }
    }
}

impl From<serde_yaml::Error> for NetworkError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}
