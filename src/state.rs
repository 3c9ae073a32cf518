use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::bulk::{BatchOptions, BatchOutcome, BulkExecutor};
use crate::cache::{CacheBackend, CacheCoordinator, CacheInvalidator, CacheKey, View};
use crate::config::Config;
use crate::entity::{EntityKind, Record};
use crate::error::{CoreError, CoreResult, OptionExt};
use crate::events::{ChangeEvent, ChangeFeed};
use crate::hierarchy::{Hierarchy, OrgChart, TreeIndex, TreeNode};
use crate::mutation::{Mutator, Params};
use crate::request::{ensure_authorized, BatchRequest, MutationRequest, ReadRequest};
use crate::store::Store;

/// Core state shared by every caller
#[derive(Clone)]
pub struct OrgState {
    /// Source of truth
    pub store: Arc<dyn Store>,
    /// Read-through cache for records and views
    pub cache: Arc<CacheCoordinator>,
    /// Post-commit change events; the cache invalidator is subscribed
    pub feed: Arc<ChangeFeed>,
    /// Application configuration
    pub config: Arc<Config>,
}

impl OrgState {
    pub fn new(store: Arc<dyn Store>, backend: Arc<dyn CacheBackend>, config: Config) -> Self {
        let cache = Arc::new(CacheCoordinator::new(backend, &config.cache));
        let invalidator = Arc::new(CacheInvalidator::new(
            cache.clone(),
            store.clone(),
            config.hierarchy.max_depth,
        ));
        let feed = Arc::new(ChangeFeed::new().with_subscriber(invalidator));

        Self {
            store,
            cache,
            feed,
            config: Arc::new(config),
        }
    }

    fn max_depth(&self) -> usize {
        self.config.hierarchy.max_depth
    }

    fn tree(&self) -> TreeIndex<'_> {
        TreeIndex::new(self.store.as_repository(), self.max_depth())
    }

    /// Apply one mutation in its own transaction and publish its events
    pub async fn mutate(&self, request: MutationRequest) -> CoreResult<Record> {
        ensure_authorized(request.authorized)?;
        let params = Params::parse(request.kind, request.params)?;

        let tx = self.store.begin().await?;
        let result = Mutator::new(tx.as_repository(), self.max_depth())
            .apply(request.operation, &params)
            .await;
        let applied = match result {
            Ok(applied) => applied,
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };
        tx.commit().await?;

        debug!(
            "{:?} {} {} committed",
            request.operation,
            request.kind,
            applied.record.id()
        );
        self.feed.publish(applied.events).await;
        Ok(applied.record)
    }

    pub async fn execute_batch(&self, request: BatchRequest) -> CoreResult<BatchOutcome> {
        ensure_authorized(request.authorized)?;
        let options = request
            .options
            .unwrap_or_else(|| BatchOptions::from(&self.config.bulk));
        BulkExecutor::new(self.store.as_ref(), &self.feed, self.max_depth())
            .execute(request.operation, request.kind, request.records, options)
            .await
    }

    /// Record or view as JSON
    pub async fn read(&self, request: ReadRequest) -> CoreResult<serde_json::Value> {
        ensure_authorized(request.authorized)?;
        let (kind, id, force) = (request.kind, request.id, request.force);
        match request.view {
            None => to_json(self.record(kind, id, force).await?),
            Some(View::Tree) => to_json(self.tree_view(kind, id, force).await?),
            Some(View::Hierarchy) => to_json(self.hierarchy(kind, id, force).await?),
            Some(View::Subordinates) => to_json(self.subordinates(kind, id, force).await?),
            Some(View::Count) => to_json(self.count(kind, id, force).await?),
            Some(View::OrgChart) if kind == EntityKind::Department => {
                to_json(self.org_chart(id, force).await?)
            }
            Some(View::OrgChart) => Err(CoreError::NotFound(format!(
                "org chart of {} {}",
                kind, id
            ))),
        }
    }

    /// A record by id; tombstoned records stay readable
    pub async fn record(&self, kind: EntityKind, id: i64, force: bool) -> CoreResult<Record> {
        let key = CacheKey::record(kind, id);
        self.cache
            .fetch(&key, None, force, move || async move {
                self.store
                    .find(kind, id)
                    .await?
                    .ok_or_not_found(format!("{} {}", kind, id))
            })
            .await
    }

    pub async fn tree_view(&self, kind: EntityKind, id: i64, force: bool) -> CoreResult<TreeNode> {
        let key = CacheKey::view(kind, id, View::Tree);
        self.cache
            .fetch(&key, None, force, move || async move {
                Ok::<_, CoreError>(self.tree().tree(kind, id).await?)
            })
            .await
    }

    pub async fn hierarchy(&self, kind: EntityKind, id: i64, force: bool) -> CoreResult<Hierarchy> {
        let key = CacheKey::view(kind, id, View::Hierarchy);
        self.cache
            .fetch(&key, None, force, move || async move {
                Ok::<_, CoreError>(self.tree().hierarchy(kind, id).await?)
            })
            .await
    }

    pub async fn org_chart(&self, department_id: i64, force: bool) -> CoreResult<OrgChart> {
        let key = CacheKey::view(EntityKind::Department, department_id, View::OrgChart);
        self.cache
            .fetch(&key, None, force, move || async move {
                Ok::<_, CoreError>(self.tree().org_chart(department_id).await?)
            })
            .await
    }

    pub async fn subordinates(
        &self,
        kind: EntityKind,
        id: i64,
        force: bool,
    ) -> CoreResult<Vec<Record>> {
        let key = CacheKey::view(kind, id, View::Subordinates);
        self.cache
            .fetch(&key, None, force, move || async move {
                Ok::<_, CoreError>(self.tree().subordinates(kind, id).await?)
            })
            .await
    }

    pub async fn count(&self, kind: EntityKind, id: i64, force: bool) -> CoreResult<usize> {
        let key = CacheKey::view(kind, id, View::Count);
        self.cache
            .fetch(&key, None, force, move || async move {
                Ok::<_, CoreError>(self.tree().count(kind, id).await?)
            })
            .await
    }

    /// Every change event published from now on
    pub fn watch(&self) -> broadcast::Receiver<ChangeEvent> {
        self.feed.watch()
    }

    pub async fn close(&self) {
        self.cache.close().await;
        info!("Cache client closed");
    }
}

fn to_json<T: Serialize>(value: T) -> CoreResult<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::events::Operation;
    use crate::permission::Role;
    use crate::store::MemoryStore;
    use crate::testing::sample_org;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn state(store: &MemoryStore) -> OrgState {
        OrgState::new(
            Arc::new(store.clone()),
            Arc::new(MemoryCache::default()),
            Config::default(),
        )
    }

    fn admin(kind: EntityKind, operation: Operation, params: serde_json::Value) -> MutationRequest {
        MutationRequest::for_role(Role::Admin, kind, operation, params)
    }

    #[tokio::test]
    async fn test_unauthorized_requests_do_no_work() {
        let store = sample_org();
        let state = state(&store);

        let read = ReadRequest::for_role(Role::Staff, EntityKind::Department, 1, None);
        let mut denied = read.clone();
        denied.authorized = false;
        assert!(matches!(state.read(denied).await, Err(CoreError::Forbidden)));

        let create = MutationRequest::for_role(
            Role::Staff,
            EntityKind::Department,
            Operation::Create,
            json!({"name": "Shadow"}),
        );
        assert!(matches!(state.mutate(create).await, Err(CoreError::Forbidden)));
        assert!(store.stats().is_untouched());
    }

    #[tokio::test]
    async fn test_org_chart_is_fresh_after_position_rename() {
        let store = sample_org();
        let state = state(&store);

        let chart = state.org_chart(2, false).await.unwrap();
        assert_eq!(chart.positions[0].position.title, "CTO");
        let reads = store.stats().reads();

        // Served from cache
        state.org_chart(2, false).await.unwrap();
        assert_eq!(store.stats().reads(), reads);

        state
            .mutate(admin(
                EntityKind::Position,
                Operation::Update,
                json!({"id": 11, "title": "Chief Technology Officer"}),
            ))
            .await
            .unwrap();

        let chart = state.org_chart(2, false).await.unwrap();
        assert_eq!(chart.positions[0].position.title, "Chief Technology Officer");
        // Engineer(12) in Platform names the CTO as its parent
        let platform = state.org_chart(3, false).await.unwrap();
        assert_eq!(
            platform.positions[0].parent.as_ref().map(|p| p.title.as_str()),
            Some("Chief Technology Officer")
        );
    }

    #[tokio::test]
    async fn test_org_chart_is_fresh_after_department_rename() {
        let store = sample_org();
        let state = state(&store);

        let chart = state.org_chart(2, false).await.unwrap();
        assert_eq!(chart.department.name, "Engineering");
        let parent = state.org_chart(1, false).await.unwrap();
        assert!(parent.sub_departments.iter().any(|d| d.name == "Engineering"));
        let reads = store.stats().reads();
        state.org_chart(2, false).await.unwrap();
        assert_eq!(store.stats().reads(), reads);

        assert_ok!(
            state
                .mutate(admin(
                    EntityKind::Department,
                    Operation::Update,
                    json!({"id": 2, "name": "Research"}),
                ))
                .await
        );

        let chart = state.org_chart(2, false).await.unwrap();
        assert_eq!(chart.department.name, "Research");
        let parent = state.org_chart(1, false).await.unwrap();
        let names: Vec<&str> = parent.sub_departments.iter().map(|d| d.name.as_str()).collect();
        assert!(names.contains(&"Research"));
        assert!(!names.contains(&"Engineering"));
    }

    #[tokio::test]
    async fn test_ancestor_views_follow_reparenting() {
        let store = sample_org();
        let state = state(&store);

        assert_eq!(state.tree_view(EntityKind::Department, 2, false).await.unwrap().size(), 2);
        assert_eq!(state.tree_view(EntityKind::Department, 4, false).await.unwrap().size(), 1);
        assert_eq!(state.count(EntityKind::Department, 2, false).await.unwrap(), 2);

        assert_ok!(
            state
                .mutate(admin(
                    EntityKind::Department,
                    Operation::Update,
                    json!({"id": 3, "parent_id": 4}),
                ))
                .await
        );

        assert_eq!(state.tree_view(EntityKind::Department, 2, false).await.unwrap().size(), 1);
        assert_eq!(state.tree_view(EntityKind::Department, 4, false).await.unwrap().size(), 2);
        assert_eq!(state.count(EntityKind::Department, 2, false).await.unwrap(), 1);
        let hierarchy = state.hierarchy(EntityKind::Department, 3, false).await.unwrap();
        let chain: Vec<i64> = hierarchy.ancestors.iter().map(Record::id).collect();
        assert_eq!(chain, vec![4, 1]);
    }

    #[tokio::test]
    async fn test_employee_counts_refresh_after_hire() {
        let store = sample_org();
        let state = state(&store);
        assert_eq!(state.count(EntityKind::Position, 12, false).await.unwrap(), 1);
        assert_eq!(state.subordinates(EntityKind::Employee, 21, false).await.unwrap().len(), 1);

        let hired = state
            .mutate(admin(
                EntityKind::Employee,
                Operation::Create,
                json!({"name": "Barbara", "email": "barbara@example.com", "position_id": 12, "manager_id": 21}),
            ))
            .await
            .unwrap();
        assert_eq!(hired.as_employee().map(|e| e.department_id), Some(3));

        assert_eq!(state.count(EntityKind::Position, 12, false).await.unwrap(), 2);
        assert_eq!(state.subordinates(EntityKind::Employee, 21, false).await.unwrap().len(), 2);
        assert_eq!(state.count(EntityKind::Department, 1, false).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_delete_with_live_employee_is_refused() {
        let store = sample_org();
        let state = state(&store);
        let mut watcher = state.watch();

        let err = assert_err!(
            state
                .mutate(admin(EntityKind::Department, Operation::Delete, json!({"id": 4})))
                .await
        );
        assert!(matches!(err, CoreError::DependentRecordsExist { id: 4, .. }));
        assert!(store.peek(EntityKind::Department, 4).await.unwrap().is_live());
        assert!(watcher.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deleted_record_stays_addressable() {
        let store = sample_org();
        let state = state(&store);
        state
            .mutate(admin(EntityKind::Employee, Operation::Delete, json!({"id": 23})))
            .await
            .unwrap();

        let record = state.record(EntityKind::Employee, 23, false).await.unwrap();
        assert!(record.deleted_at().is_some());
        assert!(matches!(
            state.count(EntityKind::Employee, 23, false).await,
            Err(CoreError::Tree(_))
        ));
        assert_eq!(state.subordinates(EntityKind::Employee, 20, false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_read_returns_json_views() {
        let store = sample_org();
        let state = state(&store);
        let value = state
            .read(ReadRequest::for_role(
                Role::Staff,
                EntityKind::Department,
                1,
                Some(View::Count),
            ))
            .await
            .unwrap();
        assert_eq!(value, json!(4));

        let not_a_department = ReadRequest::for_role(
            Role::Staff,
            EntityKind::Position,
            10,
            Some(View::OrgChart),
        );
        assert!(matches!(
            state.read(not_a_department).await,
            Err(CoreError::NotFound(_))
        ));
    }
}
