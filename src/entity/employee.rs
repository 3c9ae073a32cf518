//! Employee entity
//!
//! Table: org_employee

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "org_employee")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Full name
    #[sea_orm(column_type = "String(Some(64))")]
    pub name: String,

    /// Email (unique among live employees)
    #[sea_orm(column_type = "String(Some(128))")]
    pub email: String,

    /// Held position
    pub position_id: i64,

    /// Department of the held position (redundant, rewritten on every save)
    pub department_id: i64,

    /// Direct manager
    #[sea_orm(nullable)]
    pub manager_id: Option<i64>,

    /// Soft-delete marker (unix timestamp)
    #[sea_orm(nullable)]
    pub deleted_at: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmployeeSummary {
    pub id: i64,
    pub name: String,
}

impl From<&Model> for EmployeeSummary {
    fn from(model: &Model) -> Self {
        Self {
            id: model.id,
            name: model.name.clone(),
        }
    }
}
