//! Entity module - SeaORM entity definitions
//!
//! Every entity here is hierarchical: it carries an optional reference to a
//! record of its own type (`parent_id` for departments and positions,
//! `manager_id` for employees) and a `deleted_at` tombstone.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod department;
pub mod employee;
pub mod position;

/// Hierarchical entity types managed by the core
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Department,
    Position,
    Employee,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [
        EntityKind::Department,
        EntityKind::Position,
        EntityKind::Employee,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Department => "Department",
            EntityKind::Position => "Position",
            EntityKind::Employee => "Employee",
        }
    }

    /// Field holding the self-referencing parent edge
    pub fn parent_field(&self) -> Field {
        match self {
            EntityKind::Department | EntityKind::Position => Field::ParentId,
            EntityKind::Employee => Field::ManagerId,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "department" => Ok(EntityKind::Department),
            "position" => Ok(EntityKind::Position),
            "employee" => Ok(EntityKind::Employee),
            other => Err(format!("unknown entity kind: {}", other)),
        }
    }
}

/// Named columns used by predicates and field-level errors
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Id,
    Name,
    Title,
    Email,
    Level,
    ParentId,
    ManagerId,
    DepartmentId,
    PositionId,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Id => "id",
            Field::Name => "name",
            Field::Title => "title",
            Field::Email => "email",
            Field::Level => "level",
            Field::ParentId => "parent_id",
            Field::ManagerId => "manager_id",
            Field::DepartmentId => "department_id",
            Field::PositionId => "position_id",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparable column value
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Id(i64),
    Text(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Id(id) => write!(f, "{}", id),
            FieldValue::Text(text) => f.write_str(text),
        }
    }
}

/// A row of any hierarchical entity
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record")]
pub enum Record {
    Department(department::Model),
    Position(position::Model),
    Employee(employee::Model),
}

impl Record {
    pub fn kind(&self) -> EntityKind {
        match self {
            Record::Department(_) => EntityKind::Department,
            Record::Position(_) => EntityKind::Position,
            Record::Employee(_) => EntityKind::Employee,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Record::Department(m) => m.id,
            Record::Position(m) => m.id,
            Record::Employee(m) => m.id,
        }
    }

    pub fn set_id(&mut self, id: i64) {
        match self {
            Record::Department(m) => m.id = id,
            Record::Position(m) => m.id = id,
            Record::Employee(m) => m.id = id,
        }
    }

    /// Self-referencing parent edge (manager for employees)
    pub fn parent_id(&self) -> Option<i64> {
        match self {
            Record::Department(m) => m.parent_id,
            Record::Position(m) => m.parent_id,
            Record::Employee(m) => m.manager_id,
        }
    }

    pub fn deleted_at(&self) -> Option<i64> {
        match self {
            Record::Department(m) => m.deleted_at,
            Record::Position(m) => m.deleted_at,
            Record::Employee(m) => m.deleted_at,
        }
    }

    pub fn set_deleted_at(&mut self, at: Option<i64>) {
        match self {
            Record::Department(m) => m.deleted_at = at,
            Record::Position(m) => m.deleted_at = at,
            Record::Employee(m) => m.deleted_at = at,
        }
    }

    pub fn is_live(&self) -> bool {
        self.deleted_at().is_none()
    }

    /// Display label used in logs and summaries
    pub fn label(&self) -> &str {
        match self {
            Record::Department(m) => &m.name,
            Record::Position(m) => &m.title,
            Record::Employee(m) => &m.name,
        }
    }

    /// Read a column by name; None when the column is absent or NULL
    pub fn field(&self, field: Field) -> Option<FieldValue> {
        let id = |v: i64| Some(FieldValue::Id(v));
        let text = |v: &str| Some(FieldValue::Text(v.to_string()));
        match (self, field) {
            (_, Field::Id) => id(self.id()),
            (Record::Department(m), Field::Name) => text(&m.name),
            (Record::Department(m), Field::ParentId) => m.parent_id.and_then(id),
            (Record::Department(m), Field::ManagerId) => m.manager_id.and_then(id),
            (Record::Position(m), Field::Title) => text(&m.title),
            (Record::Position(m), Field::Level) => id(i64::from(m.level)),
            (Record::Position(m), Field::ParentId) => m.parent_id.and_then(id),
            (Record::Position(m), Field::DepartmentId) => id(m.department_id),
            (Record::Employee(m), Field::Name) => text(&m.name),
            (Record::Employee(m), Field::Email) => text(&m.email),
            (Record::Employee(m), Field::ManagerId) => m.manager_id.and_then(id),
            (Record::Employee(m), Field::PositionId) => id(m.position_id),
            (Record::Employee(m), Field::DepartmentId) => id(m.department_id),
            _ => None,
        }
    }

    pub fn as_department(&self) -> Option<&department::Model> {
        match self {
            Record::Department(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_position(&self) -> Option<&position::Model> {
        match self {
            Record::Position(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_employee(&self) -> Option<&employee::Model> {
        match self {
            Record::Employee(m) => Some(m),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_employee() -> Record {
        Record::Employee(employee::Model {
            id: 3,
            name: "Ada".to_string(),
            email: "ada@example.com".to_string(),
            position_id: 9,
            department_id: 2,
            manager_id: Some(1),
            deleted_at: None,
        })
    }

    #[test]
    fn test_employee_parent_is_manager() {
        let record = sample_employee();
        assert_eq!(record.kind(), EntityKind::Employee);
        assert_eq!(record.parent_id(), Some(1));
        assert_eq!(EntityKind::Employee.parent_field(), Field::ManagerId);
    }

    #[test]
    fn test_field_lookup() {
        let record = sample_employee();
        assert_eq!(
            record.field(Field::Email),
            Some(FieldValue::Text("ada@example.com".to_string()))
        );
        assert_eq!(record.field(Field::Title), None);
        assert_eq!(record.field(Field::DepartmentId), Some(FieldValue::Id(2)));
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("department".parse::<EntityKind>(), Ok(EntityKind::Department));
        assert_eq!("Employee".parse::<EntityKind>(), Ok(EntityKind::Employee));
        assert!("team".parse::<EntityKind>().is_err());
    }
}
