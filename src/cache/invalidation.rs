//! Post-commit cache invalidation
//!
//! For each change event the invalidator collects every key whose value may
//! embed the changed entity, looking at both the old and the new version so
//! a re-parented record clears its former chain too. Chains that cannot be
//! walked (store failure, corrupted data) are covered by dropping every key
//! of the kind instead.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

use super::coordinator::CacheCoordinator;
use super::keys::{CacheKey, View};
use crate::entity::{EntityKind, Record};
use crate::events::{ChangeEvent, ChangeSubscriber};
use crate::hierarchy::{TreeError, TreeIndex};
use crate::store::Store;

/// Keys to drop, plus kinds whose whole prefix must go
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Invalidation {
    pub keys: BTreeSet<CacheKey>,
    pub kinds: BTreeSet<EntityKind>,
}

impl Invalidation {
    fn add_views(&mut self, kind: EntityKind, id: i64, views: &[View]) {
        self.keys
            .extend(views.iter().map(|view| CacheKey::view(kind, id, *view)));
    }

    fn add_all(&mut self, kind: EntityKind, id: i64) {
        self.keys.extend(CacheKey::all_for(kind, id));
    }

    /// Record the outcome of one chain walk; failure widens to the kind
    fn covered(&mut self, kind: EntityKind, walk: Result<(), TreeError>) {
        if let Err(e) = walk {
            warn!("Cannot enumerate {} keys, dropping every {} entry: {}", kind, kind, e);
            self.kinds.insert(kind);
        }
    }
}

pub struct CacheInvalidator {
    cache: Arc<CacheCoordinator>,
    store: Arc<dyn Store>,
    max_depth: usize,
}

impl CacheInvalidator {
    pub fn new(cache: Arc<CacheCoordinator>, store: Arc<dyn Store>, max_depth: usize) -> Self {
        Self {
            cache,
            store,
            max_depth,
        }
    }

    fn tree(&self) -> TreeIndex<'_> {
        TreeIndex::new(self.store.as_repository(), self.max_depth)
    }

    /// Work out everything a batch of committed events makes stale
    pub async fn plan(&self, events: &[ChangeEvent]) -> Invalidation {
        let mut plan = Invalidation::default();
        for event in events {
            plan.add_all(event.kind, event.id);

            let versions: Vec<&Record> = event.before.iter().chain(event.after.iter()).collect();
            for version in &versions {
                let walk = self.own_chain(version, &mut plan).await;
                plan.covered(event.kind, walk);
            }
            if let Some(current) = event.after.as_ref().filter(|r| r.is_live()) {
                let walk = self.descendants(current, &mut plan).await;
                plan.covered(event.kind, walk);
            }

            match event.kind {
                EntityKind::Department => {}
                EntityKind::Position => {
                    for version in &versions {
                        if let Some(position) = version.as_position() {
                            let walk = self
                                .department_chain(position.department_id, &[View::OrgChart], &mut plan)
                                .await;
                            plan.covered(EntityKind::Department, walk);
                        }
                    }
                    let walk = self.children_departments(event.kind, event.id, &mut plan).await;
                    plan.covered(EntityKind::Department, walk);
                }
                EntityKind::Employee => {
                    for version in &versions {
                        if let Some(employee) = version.as_employee() {
                            let walk = self
                                .position_chain(employee.position_id, &mut plan)
                                .await;
                            plan.covered(EntityKind::Position, walk);
                            let walk = self
                                .department_chain(
                                    employee.department_id,
                                    &[View::OrgChart, View::Count, View::Subordinates],
                                    &mut plan,
                                )
                                .await;
                            plan.covered(EntityKind::Department, walk);
                        }
                    }
                    let walk = self.children_departments(event.kind, event.id, &mut plan).await;
                    plan.covered(EntityKind::Department, walk);
                }
            }
        }
        plan
    }

    /// Every view of every ancestor of this version
    async fn own_chain(&self, record: &Record, plan: &mut Invalidation) -> Result<(), TreeError> {
        for ancestor in self.tree().ancestors_of(record).await? {
            plan.add_all(ancestor.kind(), ancestor.id());
        }
        Ok(())
    }

    /// Descendants embed the entity in their hierarchy view
    async fn descendants(&self, record: &Record, plan: &mut Invalidation) -> Result<(), TreeError> {
        for descendant in self.tree().descendants_of(record).await? {
            plan.add_views(descendant.kind(), descendant.id(), &[View::Hierarchy]);
        }
        Ok(())
    }

    /// The department and its ancestors
    async fn department_chain(
        &self,
        department_id: i64,
        views: &[View],
        plan: &mut Invalidation,
    ) -> Result<(), TreeError> {
        plan.add_views(EntityKind::Department, department_id, views);
        let tree = self.tree();
        let department = match tree.node(EntityKind::Department, department_id).await {
            Ok(department) => department,
            // A deleted department has no live chain left to clear
            Err(TreeError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        for ancestor in tree.ancestors_of(&department).await? {
            plan.add_views(EntityKind::Department, ancestor.id(), views);
        }
        Ok(())
    }

    /// Headcount views of the position and its ancestors
    async fn position_chain(&self, position_id: i64, plan: &mut Invalidation) -> Result<(), TreeError> {
        let views = [View::Count, View::Subordinates];
        plan.add_views(EntityKind::Position, position_id, &views);
        let tree = self.tree();
        let position = match tree.node(EntityKind::Position, position_id).await {
            Ok(position) => position,
            Err(TreeError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        for ancestor in tree.ancestors_of(&position).await? {
            plan.add_views(EntityKind::Position, ancestor.id(), &views);
        }
        Ok(())
    }

    /// Org charts summarize a parent position or manager that may live in
    /// another department
    async fn children_departments(
        &self,
        kind: EntityKind,
        id: i64,
        plan: &mut Invalidation,
    ) -> Result<(), TreeError> {
        for child in self.tree().children(kind, id).await? {
            let department_id = match &child {
                Record::Position(p) => p.department_id,
                Record::Employee(e) => e.department_id,
                Record::Department(_) => continue,
            };
            plan.add_views(EntityKind::Department, department_id, &[View::OrgChart]);
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeSubscriber for CacheInvalidator {
    async fn on_commit(&self, events: &[ChangeEvent]) {
        let plan = self.plan(events).await;
        for kind in &plan.kinds {
            self.cache.invalidate_by_prefix(&CacheKey::kind_prefix(*kind)).await;
        }
        for key in plan.keys.iter().filter(|k| !plan.kinds.contains(&k.kind)) {
            self.cache.invalidate(key).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::{CacheBackend, MemoryCache};
    use crate::config::CacheConfig;
    use crate::store::MemoryStore;
    use crate::testing::{dept, emp, sample_org};

    fn invalidator(store: MemoryStore) -> (CacheInvalidator, Arc<MemoryCache>) {
        let backend = Arc::new(MemoryCache::default());
        let cache = Arc::new(CacheCoordinator::new(backend.clone(), &CacheConfig::default()));
        (CacheInvalidator::new(cache, Arc::new(store), 64), backend)
    }

    #[tokio::test]
    async fn test_reparent_clears_old_and_new_chain() {
        let store = sample_org();
        // Platform(3) moved from Engineering(2) to Sales(4)
        let before = dept(3, "Platform", Some(2));
        let after = dept(3, "Platform", Some(4));
        let event = ChangeEvent::updated(&before, &after).unwrap();
        let (invalidator, _) = invalidator(store);

        let plan = invalidator.plan(&[event]).await;
        for id in [1, 2, 3, 4] {
            assert!(plan
                .keys
                .contains(&CacheKey::view(EntityKind::Department, id, View::Tree)));
        }
        assert!(plan.kinds.is_empty());
    }

    #[tokio::test]
    async fn test_employee_change_reaches_cross_kind_scopes() {
        let store = sample_org();
        let before = emp(22, "Ada", 12, 3, Some(21));
        let mut after = before.clone();
        if let Record::Employee(m) = &mut after {
            m.name = "Ada L.".into();
        }
        let event = ChangeEvent::updated(&before, &after).unwrap();
        let (invalidator, _) = invalidator(store);

        let plan = invalidator.plan(&[event]).await;
        let keys = &plan.keys;
        // manager chain
        assert!(keys.contains(&CacheKey::view(EntityKind::Employee, 21, View::Subordinates)));
        assert!(keys.contains(&CacheKey::view(EntityKind::Employee, 20, View::Count)));
        // position chain
        assert!(keys.contains(&CacheKey::view(EntityKind::Position, 12, View::Count)));
        assert!(keys.contains(&CacheKey::view(EntityKind::Position, 10, View::Subordinates)));
        // department chain
        assert!(keys.contains(&CacheKey::view(EntityKind::Department, 3, View::OrgChart)));
        assert!(keys.contains(&CacheKey::view(EntityKind::Department, 1, View::Count)));
        // unrelated branch untouched
        assert!(!keys.contains(&CacheKey::view(EntityKind::Department, 4, View::OrgChart)));
    }

    #[tokio::test]
    async fn test_corrupted_chain_falls_back_to_prefix() {
        // 1 -> 2 -> 1 loop written behind the mutator's back
        let store = MemoryStore::with_records([dept(1, "A", Some(2)), dept(2, "B", Some(1))]);
        let event = ChangeEvent::created(&dept(5, "C", Some(1)));
        let (invalidator, backend) = invalidator(store);
        backend
            .set("orgtree:dev:Department:9:tree", "{}".into(), std::time::Duration::from_secs(60))
            .await
            .unwrap();

        let plan = invalidator.plan(std::slice::from_ref(&event)).await;
        assert!(plan.kinds.contains(&EntityKind::Department));

        invalidator.on_commit(&[event]).await;
        assert_eq!(backend.get("orgtree:dev:Department:9:tree").await.unwrap(), None);
    }
}
