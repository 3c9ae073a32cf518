//! Department entity
//!
//! Table: org_department

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "org_department")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Department name (unique among live departments)
    #[sea_orm(column_type = "String(Some(64))")]
    pub name: String,

    /// Parent department (None for a top-level department)
    #[sea_orm(nullable)]
    pub parent_id: Option<i64>,

    /// Department head, an employee of this department's subtree
    #[sea_orm(nullable)]
    pub manager_id: Option<i64>,

    /// Soft-delete marker (unix timestamp)
    #[sea_orm(nullable)]
    pub deleted_at: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

// Self-reference and cross-entity relations are resolved by manual queries

impl ActiveModelBehavior for ActiveModel {}

/// Short form embedded in aggregate views
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepartmentSummary {
    pub id: i64,
    pub name: String,
}

impl From<&Model> for DepartmentSummary {
    fn from(model: &Model) -> Self {
        Self {
            id: model.id,
            name: model.name.clone(),
        }
    }
}
