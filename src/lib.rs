//! Orgtree - organizational hierarchy core
//!
//! This crate manages self-referencing hierarchies of departments, positions
//! and employees: cycle-safe and level-ordered mutations, cached aggregate
//! views (trees, org charts, headcounts) with cascading invalidation, and
//! bounded batch mutations with configurable atomicity.

pub mod bulk;
pub mod cache;
pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod events;
pub mod hierarchy;
pub mod integrity;
pub mod mutation;
pub mod permission;
pub mod request;
pub mod state;
pub mod store;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use state::OrgState;
