//! Permission model
//!
//! A closed set of (resource, action) pairs with one evaluator per resource.
//! The core itself only consumes the boolean these evaluators produce; the
//! request layer resolves it and passes it along with each request.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::entity::EntityKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Department,
    Position,
    Employee,
}

impl From<EntityKind> for Resource {
    fn from(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Department => Resource::Department,
            EntityKind::Position => Resource::Position,
            EntityKind::Employee => Resource::Employee,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    View,
    Create,
    Update,
    Delete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub resource: Resource,
    pub action: Action,
}

impl Permission {
    pub fn new(resource: impl Into<Resource>, action: Action) -> Self {
        Self {
            resource: resource.into(),
            action,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{:?}", self.resource, self.action)
    }
}

/// Caller roles
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Full control over the organization structure
    Admin,
    /// Staffing: manages positions and employees, reads departments
    HrManager,
    /// Read-only
    Staff,
}

impl Role {
    /// Evaluate a permission for this role
    pub fn allows(&self, permission: Permission) -> bool {
        match permission.resource {
            Resource::Department => department_rule(*self, permission.action),
            Resource::Position => position_rule(*self, permission.action),
            Resource::Employee => employee_rule(*self, permission.action),
        }
    }
}

fn department_rule(role: Role, action: Action) -> bool {
    match role {
        Role::Admin => true,
        Role::HrManager | Role::Staff => action == Action::View,
    }
}

fn position_rule(role: Role, action: Action) -> bool {
    match role {
        Role::Admin | Role::HrManager => true,
        Role::Staff => action == Action::View,
    }
}

fn employee_rule(role: Role, action: Action) -> bool {
    match role {
        Role::Admin => true,
        // Employee records are removed by admins only
        Role::HrManager => action != Action::Delete,
        Role::Staff => action == Action::View,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_allows_everything() {
        for kind in EntityKind::ALL {
            for action in [Action::View, Action::Create, Action::Update, Action::Delete] {
                assert!(Role::Admin.allows(Permission::new(kind, action)));
            }
        }
    }

    #[test]
    fn test_hr_manager_rules() {
        let hr = Role::HrManager;
        assert!(hr.allows(Permission::new(EntityKind::Department, Action::View)));
        assert!(!hr.allows(Permission::new(EntityKind::Department, Action::Update)));
        assert!(hr.allows(Permission::new(EntityKind::Position, Action::Delete)));
        assert!(hr.allows(Permission::new(EntityKind::Employee, Action::Create)));
        assert!(!hr.allows(Permission::new(EntityKind::Employee, Action::Delete)));
    }

    #[test]
    fn test_staff_is_read_only() {
        assert!(Role::Staff.allows(Permission::new(EntityKind::Employee, Action::View)));
        assert!(!Role::Staff.allows(Permission::new(EntityKind::Position, Action::Create)));
    }
}
