//! Church network: discipleship hierarchy library.
//!
//! Stores who leads whom in a SQLite-backed graph, resolves the transitive
//! network under any member, guards the graph against cycles, attributes
//! members to their nearest leader of a given role, and scopes every data
//! access to the caller's own network.

pub mod api;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod graph;
pub mod network;
pub mod observability;
pub mod scope;
pub mod types;
