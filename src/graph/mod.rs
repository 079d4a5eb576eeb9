//! Graph layer: SQLite-backed hierarchy store, traversal, and cycle checks.

pub mod cycle;
pub mod leader;
pub mod store;
pub mod traversal;
pub mod tree;
