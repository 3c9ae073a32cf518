//! Hierarchy walks and invariants
//!
//! Stateless services over an injected [`Repository`](crate::store::Repository).
//! Every walk keeps an explicit visited set and a depth cap, so corrupted
//! parent chains written outside this system end the walk with an error
//! instead of looping.

pub mod cycle;
pub mod level;
pub mod tree;

pub use cycle::{CycleError, CycleGuard};
pub use level::{LevelError, LevelInvariant};
pub use tree::{
    Hierarchy, OrgChart, OrgChartEmployee, OrgChartPosition, TreeError, TreeIndex, TreeNode,
};

/// Default cap on parent-chain length
pub const DEFAULT_MAX_DEPTH: usize = 64;
