//! Bounded multi-record mutations
//!
//! A batch is checked up front (size, required fields, references,
//! uniqueness, dependents) and then executed record by record in submission
//! order, either inside one transaction (atomic) or one transaction per
//! record (best-effort). Change events go out once, after the last commit.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, info_span, warn, Instrument};

use crate::config::BulkConfig;
use crate::entity::{EntityKind, Field, Record};
use crate::error::{CoreError, CoreResult, FieldError, RecordError, Violation};
use crate::events::{ChangeEvent, ChangeFeed, Operation};
use crate::mutation::{unique_keys, Mutator, Params, UniqueKey};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Largest accepted batch
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// All-or-nothing when true, otherwise each record stands alone
    #[serde(default = "default_atomic", alias = "validate_all")]
    pub atomic: bool,
}

fn default_limit() -> usize {
    BulkConfig::default().limit
}

fn default_atomic() -> bool {
    BulkConfig::default().atomic
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            atomic: default_atomic(),
        }
    }
}

impl From<&BulkConfig> for BatchOptions {
    fn from(config: &BulkConfig) -> Self {
        Self {
            limit: config.limit,
            atomic: config.atomic,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub batch_id: String,
    pub succeeded: Vec<Record>,
    pub failed: Vec<RecordError>,
}

/// A decoded record that survived pre-flight so far
struct Pending {
    index: usize,
    params: Params,
    errors: Vec<FieldError>,
}

impl Pending {
    fn reject(&mut self, error: FieldError) {
        if !self.errors.contains(&error) {
            self.errors.push(error);
        }
    }

    fn failure(&self) -> RecordError {
        RecordError {
            index: self.index,
            id: self.params.id(),
            errors: self.errors.clone(),
        }
    }
}

pub struct BulkExecutor<'a> {
    store: &'a dyn Store,
    feed: &'a ChangeFeed,
    max_depth: usize,
}

impl<'a> BulkExecutor<'a> {
    pub fn new(store: &'a dyn Store, feed: &'a ChangeFeed, max_depth: usize) -> Self {
        Self {
            store,
            feed,
            max_depth,
        }
    }

    pub async fn execute(
        &self,
        operation: Operation,
        kind: EntityKind,
        records: Vec<serde_json::Value>,
        options: BatchOptions,
    ) -> CoreResult<BatchOutcome> {
        let batch_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!(
            "batch",
            id = %batch_id,
            kind = %kind,
            operation = ?operation,
            records = records.len(),
            atomic = options.atomic,
        );
        self.run(batch_id, operation, kind, records, options)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        batch_id: String,
        operation: Operation,
        kind: EntityKind,
        records: Vec<serde_json::Value>,
        options: BatchOptions,
    ) -> CoreResult<BatchOutcome> {
        if records.len() > options.limit {
            warn!("Batch of {} exceeds limit {}", records.len(), options.limit);
            return Err(CoreError::BatchLimitExceeded {
                limit: options.limit,
                submitted: records.len(),
            });
        }

        let mut pending = decode(kind, operation, records);
        self.check_references(operation, kind, &pending).await?;
        self.check_uniqueness(operation, kind, options.atomic, &mut pending)
            .await?;
        if operation == Operation::Delete {
            self.check_dependents(kind, &mut pending).await?;
        }

        let (ready, mut failed): (Vec<Pending>, Vec<Pending>) =
            pending.into_iter().partition(|p| p.errors.is_empty());

        let outcome = if options.atomic {
            if !failed.is_empty() {
                let errors: Vec<RecordError> = failed.iter().map(Pending::failure).collect();
                warn!("Batch rejected in pre-flight: {} record(s) invalid", errors.len());
                return Err(CoreError::BatchRejected(errors));
            }
            self.run_atomic(batch_id, operation, ready).await?
        } else {
            let mut outcome = self.run_each(batch_id, operation, ready).await?;
            outcome.failed.extend(failed.drain(..).map(|p| p.failure()));
            outcome.failed.sort_by_key(|f| f.index);
            outcome
        };

        info!(
            "Batch done: {} succeeded, {} failed",
            outcome.succeeded.len(),
            outcome.failed.len()
        );
        Ok(outcome)
    }

    /// One `missing_ids` call per referenced kind; any miss stops the batch
    async fn check_references(
        &self,
        operation: Operation,
        kind: EntityKind,
        pending: &[Pending],
    ) -> CoreResult<()> {
        let mut wanted: BTreeMap<EntityKind, Vec<i64>> = BTreeMap::new();
        for p in pending {
            if operation != Operation::Create {
                if let Some(id) = p.params.id() {
                    wanted.entry(kind).or_default().push(id);
                }
            }
            if operation != Operation::Delete {
                for (_, ref_kind, id) in p.params.references() {
                    wanted.entry(ref_kind).or_default().push(id);
                }
            }
        }

        for (ref_kind, ids) in wanted {
            let missing = self.store.missing_ids(ref_kind, &ids).await?;
            if !missing.is_empty() {
                warn!("Batch references missing {} ids {:?}", ref_kind, missing);
                return Err(CoreError::ReferencedEntityNotFound {
                    kind: ref_kind,
                    ids: missing,
                });
            }
        }
        Ok(())
    }

    /// Unique values must not clash with live rows. An atomic batch also
    /// refuses repeats inside the batch; a best-effort batch leaves them to
    /// execution, where only committed records hold a value.
    async fn check_uniqueness(
        &self,
        operation: Operation,
        kind: EntityKind,
        atomic: bool,
        pending: &mut [Pending],
    ) -> CoreResult<()> {
        if operation == Operation::Delete {
            return Ok(());
        }
        let mutator = Mutator::new(self.store.as_repository(), self.max_depth);
        let mut claimed: HashMap<UniqueKey, usize> = HashMap::new();

        for p in pending.iter_mut() {
            let base = match (operation, p.params.id()) {
                (Operation::Update, Some(id)) => self.store.find_live(kind, id).await?,
                _ => None,
            };
            let candidate = p.params.apply(base.as_ref());
            let previous = base.as_ref().map(unique_keys).unwrap_or_default();

            for key in unique_keys(&candidate) {
                if operation == Operation::Update && !touches(&p.params, key.field) {
                    continue;
                }
                let duplicate = FieldError::new(
                    key.field,
                    Violation::DuplicateValue {
                        value: key.value.clone(),
                    },
                );
                if atomic && claimed.contains_key(&key) {
                    p.reject(duplicate);
                    continue;
                }
                if !previous.contains(&key)
                    && mutator.conflicts(kind, &key, base.as_ref().map(Record::id)).await?
                {
                    p.reject(duplicate);
                    continue;
                }
                claimed.insert(key, p.index);
            }
        }
        Ok(())
    }

    async fn check_dependents(&self, kind: EntityKind, pending: &mut [Pending]) -> CoreResult<()> {
        let mutator = Mutator::new(self.store.as_repository(), self.max_depth);
        for p in pending.iter_mut() {
            let Some(id) = p.params.id() else { continue };
            let dependents = mutator.dependents(kind, id).await?;
            if !dependents.is_empty() {
                p.reject(FieldError::new(
                    Field::Id,
                    Violation::DependentRecordsExist { dependents },
                ));
            }
        }
        Ok(())
    }

    async fn run_atomic(
        &self,
        batch_id: String,
        operation: Operation,
        ready: Vec<Pending>,
    ) -> CoreResult<BatchOutcome> {
        let tx = self.store.begin().await?;
        let mut succeeded = Vec::with_capacity(ready.len());
        let mut events: Vec<ChangeEvent> = Vec::new();

        for p in &ready {
            let result = Mutator::new(tx.as_repository(), self.max_depth)
                .apply(operation, &p.params)
                .await;
            match result {
                Ok(applied) => {
                    succeeded.push(applied.record);
                    events.extend(applied.events);
                }
                Err(e) => {
                    tx.rollback().await?;
                    let failure = record_failure(p, e)?;
                    warn!("Batch rolled back at record #{}: {}", failure.index, failure);
                    return Err(CoreError::BatchRejected(vec![failure]));
                }
            }
        }

        tx.commit().await?;
        self.feed.publish(events).await;
        Ok(BatchOutcome {
            batch_id,
            succeeded,
            failed: Vec::new(),
        })
    }

    async fn run_each(
        &self,
        batch_id: String,
        operation: Operation,
        ready: Vec<Pending>,
    ) -> CoreResult<BatchOutcome> {
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        let mut events: Vec<ChangeEvent> = Vec::new();

        for p in &ready {
            match self.run_one(operation, p).await {
                Ok(Ok((record, record_events))) => {
                    succeeded.push(record);
                    events.extend(record_events);
                }
                Ok(Err(failure)) => failed.push(failure),
                Err(e) => {
                    // Records committed so far stay committed
                    self.feed.publish(events).await;
                    return Err(e);
                }
            }
        }

        self.feed.publish(events).await;
        Ok(BatchOutcome {
            batch_id,
            succeeded,
            failed,
        })
    }

    /// Outer error: infrastructure failure; inner error: the record was refused
    async fn run_one(
        &self,
        operation: Operation,
        p: &Pending,
    ) -> CoreResult<Result<(Record, Vec<ChangeEvent>), RecordError>> {
        let tx = self.store.begin().await?;
        let result = Mutator::new(tx.as_repository(), self.max_depth)
            .apply(operation, &p.params)
            .await;
        match result {
            Ok(applied) => {
                tx.commit().await?;
                Ok(Ok((applied.record, applied.events)))
            }
            Err(e) => {
                tx.rollback().await?;
                Ok(Err(record_failure(p, e)?))
            }
        }
    }
}

fn decode(kind: EntityKind, operation: Operation, records: Vec<serde_json::Value>) -> Vec<Pending> {
    records
        .into_iter()
        .enumerate()
        .map(|(index, value)| {
            let raw_id = value.get("id").and_then(serde_json::Value::as_i64);
            let (params, mut errors) = match Params::parse(kind, value) {
                Ok(params) => (params, Vec::new()),
                Err(e) => {
                    let params = match raw_id {
                        Some(id) => Params::target(kind, id),
                        None => Params::parse(kind, serde_json::json!({}))
                            .unwrap_or_else(|_| Params::target(kind, 0)),
                    };
                    (params, vec![FieldError::new(Field::Id, Violation::Invalid(e.to_string()))])
                }
            };

            if errors.is_empty() {
                match operation {
                    Operation::Create => errors.extend(
                        params
                            .missing_required()
                            .into_iter()
                            .map(|field| FieldError::new(field, Violation::MissingRequiredField)),
                    ),
                    Operation::Update | Operation::Delete => {
                        if params.id().is_none() {
                            errors.push(FieldError::new(Field::Id, Violation::MissingRequiredField));
                        }
                    }
                }
            }
            Pending {
                index,
                params,
                errors,
            }
        })
        .collect()
}

/// Fields a partial update actually sets
fn touches(params: &Params, field: Field) -> bool {
    match (params, field) {
        (Params::Department(p), Field::Name) => p.name.is_some(),
        (Params::Position(p), Field::Title) => p.title.is_some() || p.department_id.is_some(),
        (Params::Employee(p), Field::Email) => p.email.is_some(),
        _ => false,
    }
}

/// Turn a refused mutation into the record's error list
fn record_failure(p: &Pending, err: CoreError) -> CoreResult<RecordError> {
    let kind = p.params.kind();
    let errors = match err {
        CoreError::ValidationFailed(errors) => errors,
        CoreError::DependentRecordsExist { dependents, .. } => vec![FieldError::new(
            Field::Id,
            Violation::DependentRecordsExist { dependents },
        )],
        CoreError::NotFound(_) => vec![FieldError::new(
            Field::Id,
            Violation::ReferencedEntityNotFound {
                kind,
                id: p.params.id().unwrap_or_default(),
            },
        )],
        other => return Err(other),
    };
    Ok(RecordError {
        index: p.index,
        id: p.params.id(),
        errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::sample_org;
    use serde_json::json;

    fn options(limit: usize, atomic: bool) -> BatchOptions {
        BatchOptions { limit, atomic }
    }

    #[tokio::test]
    async fn test_over_limit_batch_touches_nothing() {
        let store = sample_org();
        let feed = ChangeFeed::new();
        let executor = BulkExecutor::new(&store, &feed, 64);
        let records: Vec<_> = (0..51).map(|i| json!({"name": format!("Dept {}", i)})).collect();

        let err = executor
            .execute(Operation::Create, EntityKind::Department, records, options(50, true))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::BatchLimitExceeded {
                limit: 50,
                submitted: 51
            }
        ));
        assert!(store.stats().is_untouched());
    }

    #[tokio::test]
    async fn test_atomic_duplicate_persists_nothing() {
        let store = sample_org();
        let feed = ChangeFeed::new();
        let mut watcher = feed.watch();
        let executor = BulkExecutor::new(&store, &feed, 64);
        let records = vec![json!({"name": "Finance"}), json!({"name": "Sales"})];

        let err = executor
            .execute(Operation::Create, EntityKind::Department, records, options(50, true))
            .await
            .unwrap_err();
        match err {
            CoreError::BatchRejected(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].index, 1);
                assert!(matches!(
                    failures[0].errors[0].violation,
                    Violation::DuplicateValue { .. }
                ));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.row_count(EntityKind::Department).await, 4);
        assert_eq!(store.stats().writes(), 0);
        assert!(watcher.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_best_effort_keeps_valid_records() {
        let store = sample_org();
        let feed = ChangeFeed::new();
        let mut watcher = feed.watch();
        let executor = BulkExecutor::new(&store, &feed, 64);
        let records = vec![
            json!({"name": "Finance"}),
            json!({"name": "Sales"}),
            json!({"name": "Legal", "parent_id": 1}),
            json!({"name": "Legal"}),
        ];

        let outcome = executor
            .execute(Operation::Create, EntityKind::Department, records, options(50, false))
            .await
            .unwrap();
        let names: Vec<&str> = outcome.succeeded.iter().map(Record::label).collect();
        assert_eq!(names, vec!["Finance", "Legal"]);
        let failed: Vec<usize> = outcome.failed.iter().map(|f| f.index).collect();
        assert_eq!(failed, vec![1, 3]);
        assert_eq!(store.row_count(EntityKind::Department).await, 6);
        assert!(!outcome.batch_id.is_empty());

        let first = watcher.recv().await.unwrap();
        let second = watcher.recv().await.unwrap();
        assert_eq!(first.operation, Operation::Create);
        assert_ne!(first.id, second.id);
        assert!(watcher.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_best_effort_value_of_a_failed_record_stays_free() {
        let store = sample_org();
        let feed = ChangeFeed::new();
        let executor = BulkExecutor::new(&store, &feed, 64);
        // The first "Lead" outranks the CEO (L10) and never commits
        let records = vec![
            json!({"title": "Lead", "department_id": 1, "parent_id": 10, "level": 11}),
            json!({"title": "Lead", "department_id": 1, "parent_id": 10, "level": 5}),
        ];

        let outcome = executor
            .execute(Operation::Create, EntityKind::Position, records.clone(), options(50, false))
            .await
            .unwrap();
        assert_eq!(outcome.succeeded.len(), 1);
        assert_eq!(outcome.succeeded[0].as_position().map(|p| p.level), Some(5));
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].index, 0);
        assert_eq!(outcome.failed[0].errors[0].field, Field::Level);
        assert_eq!(store.row_count(EntityKind::Position).await, 5);

        // Atomic batches still refuse the repeat up front
        let store = sample_org();
        let executor = BulkExecutor::new(&store, &feed, 64);
        let err = executor
            .execute(Operation::Create, EntityKind::Position, records, options(50, true))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BatchRejected(ref f) if f[0].index == 1));
        assert_eq!(store.stats().writes(), 0);
    }

    #[tokio::test]
    async fn test_missing_reference_is_fatal_in_both_modes() {
        for atomic in [true, false] {
            let store = sample_org();
            let feed = ChangeFeed::new();
            let executor = BulkExecutor::new(&store, &feed, 64);
            let records = vec![
                json!({"name": "Finance"}),
                json!({"name": "Orphans", "parent_id": 99}),
            ];
            let err = executor
                .execute(Operation::Create, EntityKind::Department, records, options(50, atomic))
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                CoreError::ReferencedEntityNotFound {
                    kind: EntityKind::Department,
                    ref ids,
                } if ids == &vec![99]
            ));
            assert_eq!(store.stats().writes(), 0);
        }
    }

    #[tokio::test]
    async fn test_atomic_execution_failure_rolls_back() {
        let store = sample_org();
        let feed = ChangeFeed::new();
        let executor = BulkExecutor::new(&store, &feed, 64);
        // The second record breaks level ordering under the CEO (L10)
        let records = vec![
            json!({"title": "COO", "department_id": 1, "parent_id": 10, "level": 9}),
            json!({"title": "Chair", "department_id": 1, "parent_id": 10, "level": 11}),
        ];
        let err = executor
            .execute(Operation::Create, EntityKind::Position, records, options(50, true))
            .await
            .unwrap_err();
        match err {
            CoreError::BatchRejected(failures) => {
                assert_eq!(failures[0].index, 1);
                assert_eq!(failures[0].errors[0].field, Field::Level);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.row_count(EntityKind::Position).await, 4);
    }

    #[tokio::test]
    async fn test_delete_batch_checks_dependents() {
        let store = sample_org();
        let feed = ChangeFeed::new();
        let executor = BulkExecutor::new(&store, &feed, 64);
        let records = vec![json!({"id": 22}), json!({"id": 21})];

        let outcome = executor
            .execute(Operation::Delete, EntityKind::Employee, records, options(50, false))
            .await
            .unwrap();
        assert_eq!(outcome.succeeded.len(), 1);
        assert_eq!(outcome.succeeded[0].id(), 22);
        assert_eq!(outcome.failed[0].id, Some(21));
        assert!(store.peek(EntityKind::Employee, 21).await.unwrap().is_live());
    }

    #[tokio::test]
    async fn test_update_batch_and_malformed_record() {
        let store = MemoryStore::with_records([
            crate::testing::dept(1, "HQ", None),
            crate::testing::dept(2, "Ops", Some(1)),
        ]);
        let feed = ChangeFeed::new();
        let executor = BulkExecutor::new(&store, &feed, 64);
        let records = vec![
            json!({"id": 2, "name": "Operations"}),
            json!({"id": 1, "colour": "blue"}),
        ];

        let outcome = executor
            .execute(Operation::Update, EntityKind::Department, records, options(50, false))
            .await
            .unwrap();
        assert_eq!(outcome.succeeded[0].label(), "Operations");
        assert_eq!(outcome.failed.len(), 1);
        assert!(matches!(outcome.failed[0].errors[0].violation, Violation::Invalid(_)));
    }

    #[test]
    fn test_options_accept_validate_all_alias() {
        let parsed: BatchOptions = serde_json::from_value(json!({"validate_all": false})).unwrap();
        assert_eq!(parsed, options(50, false));
    }
}
