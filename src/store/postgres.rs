//! SeaORM-backed store
//!
//! `SeaStore` runs every call on the pool; `SeaTransaction` wraps a
//! `DatabaseTransaction`. Both share the query helpers below.

use async_trait::async_trait;
use sea_orm::sea_query::{Expr, SimpleExpr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection,
    DatabaseTransaction, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};

use super::{Predicate, Repository, Store, StoreError, StoreResult, Transaction};
use crate::entity::{department, employee, position, EntityKind, Field, FieldValue, Record};

#[derive(Clone)]
pub struct SeaStore {
    db: DatabaseConnection,
}

impl SeaStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

pub struct SeaTransaction {
    txn: DatabaseTransaction,
}

fn sea_value(value: &FieldValue) -> sea_orm::Value {
    match value {
        FieldValue::Id(id) => (*id).into(),
        FieldValue::Text(text) => text.clone().into(),
    }
}

fn column_expr(kind: EntityKind, field: Field, value: &FieldValue) -> StoreResult<SimpleExpr> {
    let v = sea_value(value);
    let expr = match (kind, field) {
        (EntityKind::Department, Field::Id) => department::Column::Id.eq(v),
        (EntityKind::Department, Field::Name) => department::Column::Name.eq(v),
        (EntityKind::Department, Field::ParentId) => department::Column::ParentId.eq(v),
        (EntityKind::Department, Field::ManagerId) => department::Column::ManagerId.eq(v),
        (EntityKind::Position, Field::Id) => position::Column::Id.eq(v),
        (EntityKind::Position, Field::Title) => position::Column::Title.eq(v),
        (EntityKind::Position, Field::Level) => position::Column::Level.eq(v),
        (EntityKind::Position, Field::ParentId) => position::Column::ParentId.eq(v),
        (EntityKind::Position, Field::DepartmentId) => position::Column::DepartmentId.eq(v),
        (EntityKind::Employee, Field::Id) => employee::Column::Id.eq(v),
        (EntityKind::Employee, Field::Name) => employee::Column::Name.eq(v),
        (EntityKind::Employee, Field::Email) => employee::Column::Email.eq(v),
        (EntityKind::Employee, Field::ManagerId) => employee::Column::ManagerId.eq(v),
        (EntityKind::Employee, Field::PositionId) => employee::Column::PositionId.eq(v),
        (EntityKind::Employee, Field::DepartmentId) => employee::Column::DepartmentId.eq(v),
        _ => return Err(StoreError::UnsupportedField { kind, field }),
    };
    Ok(expr)
}

fn condition(kind: EntityKind, predicate: &Predicate) -> StoreResult<Condition> {
    Ok(match predicate {
        Predicate::All => Condition::all(),
        Predicate::Eq(field, value) => Condition::all().add(column_expr(kind, *field, value)?),
        Predicate::And(parts) => {
            let mut cond = Condition::all();
            for part in parts {
                cond = cond.add(condition(kind, part)?);
            }
            cond
        }
    })
}

async fn find<C: ConnectionTrait>(conn: &C, kind: EntityKind, id: i64) -> StoreResult<Option<Record>> {
    let record = match kind {
        EntityKind::Department => department::Entity::find_by_id(id)
            .one(conn)
            .await?
            .map(Record::Department),
        EntityKind::Position => position::Entity::find_by_id(id)
            .one(conn)
            .await?
            .map(Record::Position),
        EntityKind::Employee => employee::Entity::find_by_id(id)
            .one(conn)
            .await?
            .map(Record::Employee),
    };
    Ok(record)
}

async fn find_all<C: ConnectionTrait>(
    conn: &C,
    kind: EntityKind,
    predicate: &Predicate,
) -> StoreResult<Vec<Record>> {
    let cond = condition(kind, predicate)?;
    let records = match kind {
        EntityKind::Department => department::Entity::find()
            .filter(cond)
            .filter(department::Column::DeletedAt.is_null())
            .order_by_asc(department::Column::Id)
            .all(conn)
            .await?
            .into_iter()
            .map(Record::Department)
            .collect(),
        EntityKind::Position => position::Entity::find()
            .filter(cond)
            .filter(position::Column::DeletedAt.is_null())
            .order_by_asc(position::Column::Id)
            .all(conn)
            .await?
            .into_iter()
            .map(Record::Position)
            .collect(),
        EntityKind::Employee => employee::Entity::find()
            .filter(cond)
            .filter(employee::Column::DeletedAt.is_null())
            .order_by_asc(employee::Column::Id)
            .all(conn)
            .await?
            .into_iter()
            .map(Record::Employee)
            .collect(),
    };
    Ok(records)
}

async fn missing_ids<C: ConnectionTrait>(
    conn: &C,
    kind: EntityKind,
    ids: &[i64],
) -> StoreResult<Vec<i64>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let found: Vec<i64> = match kind {
        EntityKind::Department => department::Entity::find()
            .filter(department::Column::Id.is_in(ids.iter().copied()))
            .filter(department::Column::DeletedAt.is_null())
            .all(conn)
            .await?
            .into_iter()
            .map(|m| m.id)
            .collect(),
        EntityKind::Position => position::Entity::find()
            .filter(position::Column::Id.is_in(ids.iter().copied()))
            .filter(position::Column::DeletedAt.is_null())
            .all(conn)
            .await?
            .into_iter()
            .map(|m| m.id)
            .collect(),
        EntityKind::Employee => employee::Entity::find()
            .filter(employee::Column::Id.is_in(ids.iter().copied()))
            .filter(employee::Column::DeletedAt.is_null())
            .all(conn)
            .await?
            .into_iter()
            .map(|m| m.id)
            .collect(),
    };

    let mut missing = Vec::new();
    for id in ids {
        if !found.contains(id) && !missing.contains(id) {
            missing.push(*id);
        }
    }
    Ok(missing)
}

async fn insert<C: ConnectionTrait>(conn: &C, record: Record) -> StoreResult<Record> {
    let inserted = match record {
        Record::Department(m) => Record::Department(
            department::ActiveModel {
                name: Set(m.name),
                parent_id: Set(m.parent_id),
                manager_id: Set(m.manager_id),
                deleted_at: Set(m.deleted_at),
                ..Default::default()
            }
            .insert(conn)
            .await?,
        ),
        Record::Position(m) => Record::Position(
            position::ActiveModel {
                title: Set(m.title),
                department_id: Set(m.department_id),
                parent_id: Set(m.parent_id),
                level: Set(m.level),
                deleted_at: Set(m.deleted_at),
                ..Default::default()
            }
            .insert(conn)
            .await?,
        ),
        Record::Employee(m) => Record::Employee(
            employee::ActiveModel {
                name: Set(m.name),
                email: Set(m.email),
                position_id: Set(m.position_id),
                department_id: Set(m.department_id),
                manager_id: Set(m.manager_id),
                deleted_at: Set(m.deleted_at),
                ..Default::default()
            }
            .insert(conn)
            .await?,
        ),
    };
    Ok(inserted)
}

async fn update<C: ConnectionTrait>(conn: &C, record: Record) -> StoreResult<Record> {
    let updated = match record {
        Record::Department(m) => Record::Department(
            department::ActiveModel {
                id: Set(m.id),
                name: Set(m.name),
                parent_id: Set(m.parent_id),
                manager_id: Set(m.manager_id),
                deleted_at: Set(m.deleted_at),
            }
            .update(conn)
            .await?,
        ),
        Record::Position(m) => Record::Position(
            position::ActiveModel {
                id: Set(m.id),
                title: Set(m.title),
                department_id: Set(m.department_id),
                parent_id: Set(m.parent_id),
                level: Set(m.level),
                deleted_at: Set(m.deleted_at),
            }
            .update(conn)
            .await?,
        ),
        Record::Employee(m) => Record::Employee(
            employee::ActiveModel {
                id: Set(m.id),
                name: Set(m.name),
                email: Set(m.email),
                position_id: Set(m.position_id),
                department_id: Set(m.department_id),
                manager_id: Set(m.manager_id),
                deleted_at: Set(m.deleted_at),
            }
            .update(conn)
            .await?,
        ),
    };
    Ok(updated)
}

async fn soft_delete<C: ConnectionTrait>(
    conn: &C,
    kind: EntityKind,
    id: i64,
    at: i64,
) -> StoreResult<()> {
    let result = match kind {
        EntityKind::Department => {
            department::Entity::update_many()
                .col_expr(department::Column::DeletedAt, Expr::value(at))
                .filter(department::Column::Id.eq(id))
                .exec(conn)
                .await?
        }
        EntityKind::Position => {
            position::Entity::update_many()
                .col_expr(position::Column::DeletedAt, Expr::value(at))
                .filter(position::Column::Id.eq(id))
                .exec(conn)
                .await?
        }
        EntityKind::Employee => {
            employee::Entity::update_many()
                .col_expr(employee::Column::DeletedAt, Expr::value(at))
                .filter(employee::Column::Id.eq(id))
                .exec(conn)
                .await?
        }
    };

    if result.rows_affected == 0 {
        return Err(StoreError::Missing { kind, id });
    }
    Ok(())
}

macro_rules! delegate_repository {
    ($ty:ty, $conn:ident) => {
        #[async_trait]
        impl Repository for $ty {
            fn as_repository(&self) -> &dyn Repository {
                self
            }

            async fn find(&self, kind: EntityKind, id: i64) -> StoreResult<Option<Record>> {
                find(&self.$conn, kind, id).await
            }

            async fn find_all(
                &self,
                kind: EntityKind,
                predicate: &Predicate,
            ) -> StoreResult<Vec<Record>> {
                find_all(&self.$conn, kind, predicate).await
            }

            async fn missing_ids(&self, kind: EntityKind, ids: &[i64]) -> StoreResult<Vec<i64>> {
                missing_ids(&self.$conn, kind, ids).await
            }

            async fn insert(&self, record: Record) -> StoreResult<Record> {
                insert(&self.$conn, record).await
            }

            async fn update(&self, record: Record) -> StoreResult<Record> {
                update(&self.$conn, record).await
            }

            async fn soft_delete(&self, kind: EntityKind, id: i64, at: i64) -> StoreResult<()> {
                soft_delete(&self.$conn, kind, id, at).await
            }
        }
    };
}

delegate_repository!(SeaStore, db);
delegate_repository!(SeaTransaction, txn);

#[async_trait]
impl Store for SeaStore {
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>> {
        let txn = self.db.begin().await?;
        Ok(Box::new(SeaTransaction { txn }))
    }
}

#[async_trait]
impl Transaction for SeaTransaction {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.txn.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.txn.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{DbBackend, QueryTrait};

    #[test]
    fn test_condition_renders_column_filters() {
        let cond = condition(
            EntityKind::Employee,
            &Predicate::And(vec![
                Predicate::eq(Field::PositionId, 3),
                Predicate::eq(Field::Email, "a@b.c"),
            ]),
        )
        .unwrap();
        let sql = employee::Entity::find()
            .filter(cond)
            .build(DbBackend::Postgres)
            .to_string();
        assert!(sql.contains(r#""org_employee"."position_id" = 3"#));
        assert!(sql.contains(r#""org_employee"."email" = 'a@b.c'"#));
    }

    #[test]
    fn test_unsupported_field_is_rejected() {
        let result = condition(EntityKind::Department, &Predicate::eq(Field::Email, "x"));
        assert!(matches!(
            result,
            Err(StoreError::UnsupportedField {
                kind: EntityKind::Department,
                field: Field::Email
            })
        ));
    }
}
