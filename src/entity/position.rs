//! Position entity
//!
//! Table: org_position

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "org_position")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Position title (unique among live positions of a department)
    #[sea_orm(column_type = "String(Some(64))")]
    pub title: String,

    /// Owning department
    pub department_id: i64,

    /// Parent position; a child's level is always lower than its parent's
    #[sea_orm(nullable)]
    pub parent_id: Option<i64>,

    /// Rank of the position
    pub level: i32,

    /// Soft-delete marker (unix timestamp)
    #[sea_orm(nullable)]
    pub deleted_at: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSummary {
    pub id: i64,
    pub title: String,
    pub level: i32,
}

impl From<&Model> for PositionSummary {
    fn from(model: &Model) -> Self {
        Self {
            id: model.id,
            title: model.title.clone(),
            level: model.level,
        }
    }
}
