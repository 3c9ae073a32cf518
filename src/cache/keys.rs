use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::entity::EntityKind;

/// Aggregate views that get their own cache entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum View {
    Tree,
    OrgChart,
    Hierarchy,
    Subordinates,
    Count,
}

impl View {
    pub const ALL: [View; 5] = [
        View::Tree,
        View::OrgChart,
        View::Hierarchy,
        View::Subordinates,
        View::Count,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            View::Tree => "tree",
            View::OrgChart => "org_chart",
            View::Hierarchy => "hierarchy",
            View::Subordinates => "subordinates",
            View::Count => "count",
        }
    }

    /// Org charts exist for departments only
    pub fn applies_to(&self, kind: EntityKind) -> bool {
        match self {
            View::OrgChart => kind == EntityKind::Department,
            _ => true,
        }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for View {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        View::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| format!("unknown view: {}", s))
    }
}

/// Cache key without its namespace: `{Kind}:{id}[:{view}]`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub kind: EntityKind,
    pub id: i64,
    pub view: Option<View>,
}

impl CacheKey {
    /// Key of the single record
    pub fn record(kind: EntityKind, id: i64) -> Self {
        Self { kind, id, view: None }
    }

    pub fn view(kind: EntityKind, id: i64, view: View) -> Self {
        Self {
            kind,
            id,
            view: Some(view),
        }
    }

    /// Record key plus every view that applies to the kind
    pub fn all_for(kind: EntityKind, id: i64) -> Vec<Self> {
        std::iter::once(Self::record(kind, id))
            .chain(
                View::ALL
                    .into_iter()
                    .filter(|v| v.applies_to(kind))
                    .map(|v| Self::view(kind, id, v)),
            )
            .collect()
    }

    /// Prefix matching every key of a kind
    pub fn kind_prefix(kind: EntityKind) -> String {
        format!("{}:", kind)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.view {
            Some(view) => write!(f, "{}:{}:{}", self.kind, self.id, view),
            None => write!(f, "{}:{}", self.kind, self.id),
        }
    }
}
