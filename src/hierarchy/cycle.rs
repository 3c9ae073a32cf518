//! Cycle guard for parent-reference changes

use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;

use crate::entity::EntityKind;
use crate::store::{Repository, StoreResult};

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CycleError {
    #[error("a record cannot be its own parent ({id})")]
    SelfReference { id: i64 },

    #[error("{parent} descends from {id}, re-parenting would create a cycle")]
    Cycle { id: i64, parent: i64 },

    #[error("parent chain revisits {at}")]
    CorruptChain { at: i64 },

    #[error("parent chain is longer than {limit}")]
    DepthExceeded { limit: usize },
}

/// Rejects parent references that would close a loop
pub struct CycleGuard<'a> {
    repo: &'a dyn Repository,
    max_depth: usize,
}

impl<'a> CycleGuard<'a> {
    pub fn new(repo: &'a dyn Repository, max_depth: usize) -> Self {
        Self { repo, max_depth }
    }

    /// Check that `entity_id` may take `proposed_parent` as its parent.
    ///
    /// `entity_id` is `None` for a record not yet persisted. The outer result
    /// carries storage failures, the inner one the verdict.
    pub async fn validate(
        &self,
        kind: EntityKind,
        entity_id: Option<i64>,
        proposed_parent: Option<i64>,
    ) -> StoreResult<Result<(), CycleError>> {
        let Some(parent) = proposed_parent else {
            return Ok(Ok(()));
        };
        if entity_id == Some(parent) {
            return Ok(Err(CycleError::SelfReference { id: parent }));
        }

        let mut visited = HashSet::new();
        let mut current = parent;
        loop {
            if let Some(id) = entity_id.filter(|id| *id == current) {
                return Ok(Err(CycleError::Cycle { id, parent }));
            }
            if !visited.insert(current) {
                return Ok(Err(CycleError::CorruptChain { at: current }));
            }
            if visited.len() > self.max_depth {
                return Ok(Err(CycleError::DepthExceeded {
                    limit: self.max_depth,
                }));
            }

            // A missing or tombstoned node ends the chain
            let next = self
                .repo
                .find_live(kind, current)
                .await?
                .and_then(|r| r.parent_id());
            match next {
                Some(next) => current = next,
                None => return Ok(Ok(())),
            }
        }
    }
}
