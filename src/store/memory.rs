//! In-memory store
//!
//! Holds all tables behind one lock. A transaction works on a private copy
//! of the tables and merges back only the rows it wrote, so overlapping
//! transactions keep each other's writes and the last commit wins per row.
//! Ids come from a shared sequence that rollbacks do not rewind. Every
//! repository call is counted, which lets callers prove that a request never
//! touched storage.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::{Predicate, Repository, Store, StoreError, StoreResult, Transaction};
use crate::entity::{EntityKind, Record};

#[derive(Clone, Debug, Default)]
struct Tables {
    rows: BTreeMap<EntityKind, BTreeMap<i64, Record>>,
    next_id: BTreeMap<EntityKind, i64>,
}

impl Tables {
    fn table(&self, kind: EntityKind) -> impl Iterator<Item = &Record> {
        self.rows.get(&kind).into_iter().flat_map(|rows| rows.values())
    }

    fn find(&self, kind: EntityKind, id: i64) -> Option<Record> {
        self.rows.get(&kind).and_then(|rows| rows.get(&id)).cloned()
    }

    fn find_all(&self, kind: EntityKind, predicate: &Predicate) -> Vec<Record> {
        self.table(kind)
            .filter(|r| r.is_live() && predicate.matches(r))
            .cloned()
            .collect()
    }

    fn missing_ids(&self, kind: EntityKind, ids: &[i64]) -> Vec<i64> {
        let mut missing = Vec::new();
        for id in ids {
            let live = self.find(kind, *id).is_some_and(|r| r.is_live());
            if !live && !missing.contains(id) {
                missing.push(*id);
            }
        }
        missing
    }

    fn put(&mut self, record: Record) {
        let kind = record.kind();
        let id = record.id();
        let next = self.next_id.entry(kind).or_insert(1);
        if *next <= id {
            *next = id + 1;
        }
        self.rows.entry(kind).or_default().insert(id, record);
    }

    fn allocate(&mut self, kind: EntityKind) -> i64 {
        let next = self.next_id.entry(kind).or_insert(1);
        let id = *next;
        *next += 1;
        id
    }

    fn insert(&mut self, mut record: Record) -> Record {
        record.set_id(self.allocate(record.kind()));
        self.put(record.clone());
        record
    }

    fn update(&mut self, record: Record) -> StoreResult<Record> {
        let (kind, id) = (record.kind(), record.id());
        match self.rows.get_mut(&kind).and_then(|rows| rows.get_mut(&id)) {
            Some(row) => {
                *row = record.clone();
                Ok(record)
            }
            None => Err(StoreError::Missing { kind, id }),
        }
    }

    fn soft_delete(&mut self, kind: EntityKind, id: i64, at: i64) -> StoreResult<()> {
        match self.rows.get_mut(&kind).and_then(|rows| rows.get_mut(&id)) {
            Some(row) => {
                row.set_deleted_at(Some(at));
                Ok(())
            }
            None => Err(StoreError::Missing { kind, id }),
        }
    }
}

/// Counters of repository calls
#[derive(Debug, Default)]
pub struct AccessStats {
    reads: AtomicU64,
    writes: AtomicU64,
    transactions: AtomicU64,
}

impl AccessStats {
    fn read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn transactions(&self) -> u64 {
        self.transactions.load(Ordering::Relaxed)
    }

    /// True when no call of any sort reached the store
    pub fn is_untouched(&self) -> bool {
        self.reads() == 0 && self.writes() == 0 && self.transactions() == 0
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    stats: Arc<AccessStats>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed rows verbatim, ids included, without any validation
    pub fn with_records(records: impl IntoIterator<Item = Record>) -> Self {
        let mut tables = Tables::default();
        for record in records {
            tables.put(record);
        }
        Self {
            tables: Arc::new(RwLock::new(tables)),
            stats: Arc::default(),
        }
    }

    pub fn stats(&self) -> &AccessStats {
        &self.stats
    }

    /// Number of rows of a kind, tombstoned included (not counted as access)
    pub async fn row_count(&self, kind: EntityKind) -> usize {
        self.tables.read().await.table(kind).count()
    }

    /// Direct row lookup that bypasses the access counters
    pub async fn peek(&self, kind: EntityKind, id: i64) -> Option<Record> {
        self.tables.read().await.find(kind, id)
    }
}

#[async_trait]
impl Repository for MemoryStore {
    fn as_repository(&self) -> &dyn Repository {
        self
    }

    async fn find(&self, kind: EntityKind, id: i64) -> StoreResult<Option<Record>> {
        self.stats.read();
        Ok(self.tables.read().await.find(kind, id))
    }

    async fn find_all(&self, kind: EntityKind, predicate: &Predicate) -> StoreResult<Vec<Record>> {
        self.stats.read();
        Ok(self.tables.read().await.find_all(kind, predicate))
    }

    async fn missing_ids(&self, kind: EntityKind, ids: &[i64]) -> StoreResult<Vec<i64>> {
        self.stats.read();
        Ok(self.tables.read().await.missing_ids(kind, ids))
    }

    async fn insert(&self, record: Record) -> StoreResult<Record> {
        self.stats.write();
        Ok(self.tables.write().await.insert(record))
    }

    async fn update(&self, record: Record) -> StoreResult<Record> {
        self.stats.write();
        self.tables.write().await.update(record)
    }

    async fn soft_delete(&self, kind: EntityKind, id: i64, at: i64) -> StoreResult<()> {
        self.stats.write();
        self.tables.write().await.soft_delete(kind, id, at)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>> {
        self.stats.transactions.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.tables.read().await.clone();
        Ok(Box::new(MemoryTransaction {
            shared: self.tables.clone(),
            staged: Mutex::new(Some(Staged {
                tables: snapshot,
                written: BTreeSet::new(),
            })),
            stats: self.stats.clone(),
        }))
    }
}

/// Private copy of the tables plus the rows written to it
struct Staged {
    tables: Tables,
    written: BTreeSet<(EntityKind, i64)>,
}

pub struct MemoryTransaction {
    shared: Arc<RwLock<Tables>>,
    staged: Mutex<Option<Staged>>,
    stats: Arc<AccessStats>,
}

impl MemoryTransaction {
    async fn with_staged<T>(&self, f: impl FnOnce(&mut Staged) -> StoreResult<T>) -> StoreResult<T> {
        let mut staged = self.staged.lock().await;
        let staged = staged.as_mut().ok_or(StoreError::TransactionClosed)?;
        f(staged)
    }

    async fn with_tables<T>(&self, f: impl FnOnce(&mut Tables) -> StoreResult<T>) -> StoreResult<T> {
        self.with_staged(|s| f(&mut s.tables)).await
    }
}

#[async_trait]
impl Repository for MemoryTransaction {
    fn as_repository(&self) -> &dyn Repository {
        self
    }

    async fn find(&self, kind: EntityKind, id: i64) -> StoreResult<Option<Record>> {
        self.stats.read();
        self.with_tables(|t| Ok(t.find(kind, id))).await
    }

    async fn find_all(&self, kind: EntityKind, predicate: &Predicate) -> StoreResult<Vec<Record>> {
        self.stats.read();
        self.with_tables(|t| Ok(t.find_all(kind, predicate))).await
    }

    async fn missing_ids(&self, kind: EntityKind, ids: &[i64]) -> StoreResult<Vec<i64>> {
        self.stats.read();
        self.with_tables(|t| Ok(t.missing_ids(kind, ids))).await
    }

    async fn insert(&self, mut record: Record) -> StoreResult<Record> {
        self.stats.write();
        let kind = record.kind();
        let id = self.shared.write().await.allocate(kind);
        record.set_id(id);
        self.with_staged(|s| {
            s.tables.put(record.clone());
            s.written.insert((kind, id));
            Ok(record)
        })
        .await
    }

    async fn update(&self, record: Record) -> StoreResult<Record> {
        self.stats.write();
        self.with_staged(|s| {
            let record = s.tables.update(record)?;
            s.written.insert((record.kind(), record.id()));
            Ok(record)
        })
        .await
    }

    async fn soft_delete(&self, kind: EntityKind, id: i64, at: i64) -> StoreResult<()> {
        self.stats.write();
        self.with_staged(|s| {
            s.tables.soft_delete(kind, id, at)?;
            s.written.insert((kind, id));
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let staged = self
            .staged
            .lock()
            .await
            .take()
            .ok_or(StoreError::TransactionClosed)?;
        let mut shared = self.shared.write().await;
        for (kind, id) in &staged.written {
            if let Some(row) = staged.tables.find(*kind, *id) {
                shared.put(row);
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.staged.lock().await.take();
        Ok(())
    }
}
