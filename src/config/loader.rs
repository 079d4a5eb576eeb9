//! Multi-source configuration loading.
//!
//! Sources, lowest priority first:
//! 1. built-in defaults
//! 2. user config: `<config dir>/church-network/config.yml`
//! 3. project config: `<project root>/.church-network.yml`
//! 4. an explicit file passed on the command line
//! 5. environment: `CHURCH_NETWORK_DB`, `CHURCH_NETWORK_ADDR`
//!
//! Files are merged section by section: a later file replaces only the
//! sections it actually contains.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;

use crate::config::schema::NetworkConfig;
use crate::error::{NetworkError, Result};

pub const PROJECT_CONFIG_FILE: &str = ".church-network.yml";
pub const ENV_DB: &str = "CHURCH_NETWORK_DB";
pub const ENV_ADDR: &str = "CHURCH_NETWORK_ADDR";

/// Path of the per-user config file, if a home directory can be determined.
pub fn user_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "church-network", "church-network")
        .map(|dirs| dirs.config_dir().join("config.yml"))
}

/// Load and merge every configuration source.
///
/// A missing optional file is skipped; a missing explicit file or any
/// unparsable file is an error.
pub fn load_config(explicit: Option<&Path>, project_root: Option<&Path>) -> Result<NetworkConfig> {
    let mut merged = serde_yaml::to_value(NetworkConfig::default())?;

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(user) = user_config_path() {
        candidates.push(user);
    }
    if let Some(root) = project_root {
        candidates.push(root.join(PROJECT_CONFIG_FILE));
    }
    for path in candidates {
        if path.is_file() {
            merge_file(&mut merged, &path)?;
        }
    }

    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(NetworkError::Config(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        merge_file(&mut merged, path)?;
    }

    let mut config: NetworkConfig = serde_yaml::from_value(merged)?;
    apply_env(&mut config, |key| std::env::var(key).ok());
    validate(&config)?;
    Ok(config)
}

fn merge_file(base: &mut serde_yaml::Value, path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path)?;
    let overlay: serde_yaml::Value = serde_yaml::from_str(&text)
        .map_err(|e| NetworkError::Config(format!("{}: {e}", path.display())))?;
    merge_values(base, overlay);
    tracing::debug!(path = %path.display(), "config file merged");
    Ok(())
}

fn merge_values(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        // An empty file parses as Null; it changes nothing.
        (_, serde_yaml::Value::Null) => {}
        (slot, value) => *slot = value,
    }
}

fn apply_env<F>(config: &mut NetworkConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = lookup(ENV_DB).filter(|v| !v.trim().is_empty()) {
        config.database.path = path;
    }
    if let Some(addr) = lookup(ENV_ADDR).filter(|v| !v.trim().is_empty()) {
        config.server.addr = addr;
    }
}

fn validate(config: &NetworkConfig) -> Result<()> {
    if config.hierarchy.max_leader_hops == 0 {
        return Err(NetworkError::Config(
            "hierarchy.max_leader_hops must be at least 1".into(),
        ));
    }
    if config.database.path.trim().is_empty() {
        return Err(NetworkError::Config("database.path must not be empty".into()));
    }
    Ok(())
}
