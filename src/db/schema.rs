//! SQLite schema initialization for the network store.
//!
//! The edge table is the single shared mutable resource of the core. Two of
//! its invariants are expressible in SQL and are enforced here (no self-loop,
//! one parent per `(child, role)`); acyclicity is not, and is enforced by
//! the store's checked write path instead.

use std::time::Duration;

use rusqlite::Connection;

// ---------------------------------------------------------------------------
// DDL constants
// ---------------------------------------------------------------------------

const CREATE_USERS: &str = "\
CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  display_name TEXT NOT NULL,
  email TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL
)";

const CREATE_USER_ROLES: &str = "\
CREATE TABLE IF NOT EXISTS user_roles (
  user_id INTEGER NOT NULL,
  role TEXT NOT NULL,
  PRIMARY KEY (user_id, role),
  FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
)";

const CREATE_HIERARCHY_EDGES: &str = "\
CREATE TABLE IF NOT EXISTS hierarchy_edges (
  parent_id INTEGER NOT NULL,
  child_id INTEGER NOT NULL,
  role TEXT NOT NULL,
  created_at TEXT NOT NULL,
  CHECK (parent_id <> child_id),
  UNIQUE (child_id, role),
  FOREIGN KEY (parent_id) REFERENCES users(id) ON DELETE CASCADE,
  FOREIGN KEY (child_id) REFERENCES users(id) ON DELETE CASCADE
)";

const CREATE_GUESTS: &str = "\
CREATE TABLE IF NOT EXISTS guests (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  phone TEXT,
  assigned_to_id INTEGER,
  invited_by_id INTEGER,
  converted_user_id INTEGER,
  created_at TEXT NOT NULL,
  FOREIGN KEY (assigned_to_id) REFERENCES users(id) ON DELETE SET NULL,
  FOREIGN KEY (invited_by_id) REFERENCES users(id) ON DELETE SET NULL,
  FOREIGN KEY (converted_user_id) REFERENCES users(id) ON DELETE SET NULL
)";

const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_edges_parent ON hierarchy_edges(parent_id, role)",
    "CREATE INDEX IF NOT EXISTS idx_edges_child ON hierarchy_edges(child_id)",
    "CREATE INDEX IF NOT EXISTS idx_guests_assigned ON guests(assigned_to_id)",
    "CREATE INDEX IF NOT EXISTS idx_user_roles_role ON user_roles(role)",
];

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Open (or create) the SQLite database at `db_path` and apply the schema.
///
/// The returned connection has WAL mode, foreign keys, synchronous NORMAL
/// and a busy timeout configured, so concurrent writers from other
/// processes wait for the immediate write lock instead of failing.
///
/// # Errors
///
/// Returns a `rusqlite::Error` if the database cannot be opened or any DDL
/// statement fails.
pub fn initialize_database(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(Duration::from_secs(5))?;

    conn.execute_batch(CREATE_USERS)?;
    conn.execute_batch(CREATE_USER_ROLES)?;
    conn.execute_batch(CREATE_HIERARCHY_EDGES)?;
    conn.execute_batch(CREATE_GUESTS)?;

    for ddl in CREATE_INDEXES {
        conn.execute_batch(ddl)?;
    }

    Ok(conn)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
