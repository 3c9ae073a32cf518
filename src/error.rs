use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::entity::{EntityKind, Field, FieldValue};
use crate::hierarchy::{CycleError, LevelError, TreeError};
use crate::store::StoreError;

/// A single invariant or attribute violation, attached to a field
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Violation {
    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error(transparent)]
    Level(#[from] LevelError),

    #[error("required field is missing")]
    MissingRequiredField,

    #[error("value '{value}' is already taken")]
    DuplicateValue { value: FieldValue },

    #[error("{kind} {id} does not exist")]
    ReferencedEntityNotFound { kind: EntityKind, id: i64 },

    #[error("employee {employee_id} does not belong to the department's subtree")]
    ManagerOutsideSubtree { employee_id: i64 },

    #[error("live dependents exist: {}", join(.dependents))]
    DependentRecordsExist { dependents: Vec<Dependents> },

    #[error("{0}")]
    Invalid(String),
}

/// Violation bound to the offending field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: Field,
    #[serde(flatten)]
    pub violation: Violation,
}

impl FieldError {
    pub fn new(field: Field, violation: impl Into<Violation>) -> Self {
        Self {
            field,
            violation: violation.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.violation)
    }
}

/// Errors of one record inside a batch, by submission index
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordError {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub errors: Vec<FieldError>,
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record #{}: {}", self.index, join(&self.errors))
    }
}

/// Live dependents of one kind blocking a delete
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependents {
    pub kind: EntityKind,
    pub count: usize,
}

impl fmt::Display for Dependents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} x{}", self.kind, self.count)
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Core error types
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Access forbidden")]
    Forbidden,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Batch of {submitted} records exceeds the limit of {limit}")]
    BatchLimitExceeded { limit: usize, submitted: usize },

    #[error("Referenced {kind} records not found: {ids:?}")]
    ReferencedEntityNotFound { kind: EntityKind, ids: Vec<i64> },

    #[error("Validation failed: {}", join(.0))]
    ValidationFailed(Vec<FieldError>),

    #[error("Batch rejected: {}", join(.0))]
    BatchRejected(Vec<RecordError>),

    #[error("{kind} {id} still has live dependents: {}", join(.dependents))]
    DependentRecordsExist {
        kind: EntityKind,
        id: i64,
        dependents: Vec<Dependents>,
    },

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Hierarchy error: {0}")]
    Tree(#[from] TreeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Field errors carried by a rejected single mutation
    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            CoreError::ValidationFailed(errors) => errors,
            _ => &[],
        }
    }
}

/// Result type alias for the core
pub type CoreResult<T> = Result<T, CoreError>;

/// Helper trait for converting Option to CoreError::NotFound
pub trait OptionExt<T> {
    fn ok_or_not_found(self, msg: impl Into<String>) -> CoreResult<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, msg: impl Into<String>) -> CoreResult<T> {
        self.ok_or_else(|| CoreError::NotFound(msg.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_ext() {
        let opt: Option<i32> = None;
        let result = opt.ok_or_not_found("Item not found");
        assert!(matches!(result, Err(CoreError::NotFound(_))));
    }

    #[test]
    fn test_validation_message_lists_fields() {
        let err = CoreError::ValidationFailed(vec![
            FieldError::new(Field::Name, Violation::MissingRequiredField),
            FieldError::new(
                Field::ParentId,
                Violation::ReferencedEntityNotFound {
                    kind: EntityKind::Department,
                    id: 4,
                },
            ),
        ]);
        let message = err.to_string();
        assert!(message.contains("name: required field is missing"));
        assert!(message.contains("parent_id: Department 4 does not exist"));
        assert_eq!(err.field_errors().len(), 2);
    }

    #[test]
    fn test_field_error_serializes_flat() {
        let err = FieldError::new(
            Field::Email,
            Violation::DuplicateValue {
                value: FieldValue::Text("a@b.c".to_string()),
            },
        );
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["field"], "email");
        assert_eq!(json["type"], "duplicate_value");
        assert_eq!(json["value"], "a@b.c");
    }
}
