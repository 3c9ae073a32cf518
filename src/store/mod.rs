//! Storage abstraction
//!
//! The core reads and writes hierarchical records only through these traits.
//! `find` returns tombstoned rows (they stay addressable for audit), every
//! other read sees live rows only.

use async_trait::async_trait;
use thiserror::Error;

use crate::entity::{EntityKind, Field, FieldValue, Record};

pub mod memory;
pub mod postgres;

pub use memory::{AccessStats, MemoryStore};
pub use postgres::SeaStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("{kind} {id} not found")]
    Missing { kind: EntityKind, id: i64 },

    #[error("{kind} has no column {field}")]
    UnsupportedField { kind: EntityKind, field: Field },

    #[error("Transaction already finished")]
    TransactionClosed,
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Id(value)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

/// Row filter for `find_all`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Predicate {
    All,
    Eq(Field, FieldValue),
    And(Vec<Predicate>),
}

impl Predicate {
    pub fn eq(field: Field, value: impl Into<FieldValue>) -> Self {
        Predicate::Eq(field, value.into())
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Eq(field, value) => record.field(*field).as_ref() == Some(value),
            Predicate::And(parts) => parts.iter().all(|p| p.matches(record)),
        }
    }
}

/// Read/write access to hierarchical records
#[async_trait]
pub trait Repository: Send + Sync {
    /// Find a record by id, live or tombstoned
    async fn find(&self, kind: EntityKind, id: i64) -> StoreResult<Option<Record>>;

    /// Live records matching the predicate, ascending by id
    async fn find_all(&self, kind: EntityKind, predicate: &Predicate) -> StoreResult<Vec<Record>>;

    /// Ids from `ids` with no live record, in input order without repeats
    async fn missing_ids(&self, kind: EntityKind, ids: &[i64]) -> StoreResult<Vec<i64>>;

    /// Insert a new record; the id of the argument is ignored
    async fn insert(&self, record: Record) -> StoreResult<Record>;

    /// Overwrite an existing record
    async fn update(&self, record: Record) -> StoreResult<Record>;

    /// Set the tombstone of a record
    async fn soft_delete(&self, kind: EntityKind, id: i64, at: i64) -> StoreResult<()>;

    /// Plain repository view of a store or transaction
    fn as_repository(&self) -> &dyn Repository;

    async fn find_live(&self, kind: EntityKind, id: i64) -> StoreResult<Option<Record>> {
        Ok(self.find(kind, id).await?.filter(Record::is_live))
    }
}

/// Transaction scope; dropped without commit means rolled back
#[async_trait]
pub trait Transaction: Repository {
    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Source of truth able to open transactions
#[async_trait]
pub trait Store: Repository {
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>>;
}
