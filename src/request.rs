//! Inbound requests
//!
//! Every request carries the caller's authorization decision; the core
//! refuses unauthorized requests before doing any work.

use serde::Deserialize;

use crate::bulk::BatchOptions;
use crate::cache::View;
use crate::entity::EntityKind;
use crate::error::{CoreError, CoreResult};
use crate::events::Operation;
use crate::permission::{Action, Permission, Role};

#[derive(Debug, Clone, Deserialize)]
pub struct MutationRequest {
    pub kind: EntityKind,
    pub operation: Operation,
    pub params: serde_json::Value,
    #[serde(default)]
    pub authorized: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub kind: EntityKind,
    pub operation: Operation,
    pub records: Vec<serde_json::Value>,
    /// Configured defaults apply when absent
    #[serde(default)]
    pub options: Option<BatchOptions>,
    #[serde(default)]
    pub authorized: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadRequest {
    pub kind: EntityKind,
    pub id: i64,
    /// The plain record when absent
    #[serde(default)]
    pub view: Option<View>,
    /// Skip the cache lookup
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub authorized: bool,
}

impl MutationRequest {
    /// Request with the decision taken for `role`
    pub fn for_role(
        role: Role,
        kind: EntityKind,
        operation: Operation,
        params: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            operation,
            params,
            authorized: role.allows(Permission::new(kind, operation.action())),
        }
    }
}

impl BatchRequest {
    pub fn for_role(
        role: Role,
        kind: EntityKind,
        operation: Operation,
        records: Vec<serde_json::Value>,
        options: Option<BatchOptions>,
    ) -> Self {
        Self {
            kind,
            operation,
            records,
            options,
            authorized: role.allows(Permission::new(kind, operation.action())),
        }
    }
}

impl ReadRequest {
    pub fn for_role(role: Role, kind: EntityKind, id: i64, view: Option<View>) -> Self {
        Self {
            kind,
            id,
            view,
            force: false,
            authorized: role.allows(Permission::new(kind, Action::View)),
        }
    }
}

/// Forbidden unless the request was authorized
pub fn ensure_authorized(authorized: bool) -> CoreResult<()> {
    if authorized {
        Ok(())
    } else {
        Err(CoreError::Forbidden)
    }
}
