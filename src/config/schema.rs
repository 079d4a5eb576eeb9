//! Configuration data structures.
//!
//! Defines the YAML config format: database location, HTTP bind address,
//! hierarchy limits and the default log filter. Every field has a serde
//! default so partial files are valid.

use serde::{Deserialize, Serialize};

use crate::graph::leader::DEFAULT_MAX_HOPS;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
///
/// Loaded from YAML files and environment variables; see
/// [`crate::config::loader::load_config`] for the merge order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Config format version (currently "1.0").
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub hierarchy: HierarchyConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            database: DatabaseConfig::default(),
            server: ServerConfig::default(),
            hierarchy: HierarchyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path (`:memory:` for an ephemeral store).
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address for `serve`.
    #[serde(default = "default_addr")]
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyConfig {
    /// Upper bound on ancestor hops during leader resolution.
    #[serde(default = "default_max_leader_hops")]
    pub max_leader_hops: usize,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            max_leader_hops: default_max_leader_hops(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_version() -> String {
    "1.0".to_string()
}

fn default_db_path() -> String {
    "church-network.db".to_string()
}

fn default_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_leader_hops() -> usize {
    DEFAULT_MAX_HOPS
}

fn default_log_filter() -> String {
    "church_network=info".to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
