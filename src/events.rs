//! Change events
//!
//! Every committed mutation produces a [`ChangeEvent`]. The feed hands a
//! committed set of events to each registered subscriber in turn (the cache
//! invalidator is one) and then broadcasts them to any other observer.
//! Nothing is published before commit.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::entity::{EntityKind, Field, Record};
use crate::permission::Action;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Permission action guarding this operation
    pub fn action(&self) -> Action {
        match self {
            Operation::Create => Action::Create,
            Operation::Update => Action::Update,
            Operation::Delete => Action::Delete,
        }
    }
}

const TRACKED_FIELDS: [Field; 8] = [
    Field::Name,
    Field::Title,
    Field::Email,
    Field::Level,
    Field::ParentId,
    Field::ManagerId,
    Field::DepartmentId,
    Field::PositionId,
];

/// Fields whose value differs between two versions of a record
pub fn changed_fields(before: &Record, after: &Record) -> Vec<Field> {
    TRACKED_FIELDS
        .into_iter()
        .filter(|field| before.field(*field) != after.field(*field))
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub kind: EntityKind,
    pub id: i64,
    pub operation: Operation,
    pub changed_fields: Vec<Field>,
    /// State before the mutation (None on create)
    pub before: Option<Record>,
    /// State after the mutation (the tombstoned row on delete)
    pub after: Option<Record>,
}

impl ChangeEvent {
    pub fn created(record: &Record) -> Self {
        Self {
            kind: record.kind(),
            id: record.id(),
            operation: Operation::Create,
            changed_fields: TRACKED_FIELDS
                .into_iter()
                .filter(|field| record.field(*field).is_some())
                .collect(),
            before: None,
            after: Some(record.clone()),
        }
    }

    /// None when nothing changed
    pub fn updated(before: &Record, after: &Record) -> Option<Self> {
        let changed_fields = changed_fields(before, after);
        if changed_fields.is_empty() {
            return None;
        }
        Some(Self {
            kind: after.kind(),
            id: after.id(),
            operation: Operation::Update,
            changed_fields,
            before: Some(before.clone()),
            after: Some(after.clone()),
        })
    }

    pub fn deleted(before: &Record, after: &Record) -> Self {
        Self {
            kind: before.kind(),
            id: before.id(),
            operation: Operation::Delete,
            changed_fields: Vec::new(),
            before: Some(before.clone()),
            after: Some(after.clone()),
        }
    }

    /// Fold a later event for the same entity into this one
    fn absorb(&mut self, later: ChangeEvent) {
        self.operation = match (self.operation, later.operation) {
            (_, Operation::Delete) => Operation::Delete,
            (Operation::Create, _) => Operation::Create,
            (_, op) => op,
        };
        for field in later.changed_fields {
            if !self.changed_fields.contains(&field) {
                self.changed_fields.push(field);
            }
        }
        self.after = later.after;
    }
}

/// Merge events so each entity appears once, in first-seen order
pub fn coalesce(events: Vec<ChangeEvent>) -> Vec<ChangeEvent> {
    let mut order: Vec<(EntityKind, i64)> = Vec::new();
    let mut merged: BTreeMap<(EntityKind, i64), ChangeEvent> = BTreeMap::new();
    for event in events {
        let key = (event.kind, event.id);
        match merged.get_mut(&key) {
            Some(existing) => existing.absorb(event),
            None => {
                order.push(key);
                merged.insert(key, event);
            }
        }
    }
    order
        .into_iter()
        .filter_map(|key| merged.remove(&key))
        .collect()
}

/// Consumer of committed changes
#[async_trait]
pub trait ChangeSubscriber: Send + Sync {
    async fn on_commit(&self, events: &[ChangeEvent]);
}

pub struct ChangeFeed {
    subscribers: Vec<Arc<dyn ChangeSubscriber>>,
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1000);
        Self {
            subscribers: Vec::new(),
            sender,
        }
    }

    pub fn with_subscriber(mut self, subscriber: Arc<dyn ChangeSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Receive every published event
    pub fn watch(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    /// Deliver committed events; returns once every subscriber has run
    pub async fn publish(&self, events: Vec<ChangeEvent>) {
        let events = coalesce(events);
        if events.is_empty() {
            return;
        }
        tracing::debug!("Publishing {} change event(s)", events.len());

        for subscriber in &self.subscribers {
            subscriber.on_commit(&events).await;
        }
        for event in events {
            // No receivers is fine
            let _ = self.sender.send(event);
        }
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::department;
    use tokio::sync::Mutex;

    fn dept(id: i64, name: &str, parent_id: Option<i64>) -> Record {
        Record::Department(department::Model {
            id,
            name: name.to_string(),
            parent_id,
            manager_id: None,
            deleted_at: None,
        })
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<ChangeEvent>>,
    }

    #[async_trait]
    impl ChangeSubscriber for Recorder {
        async fn on_commit(&self, events: &[ChangeEvent]) {
            self.seen.lock().await.extend_from_slice(events);
        }
    }

    #[test]
    fn test_updated_lists_changed_fields() {
        let before = dept(1, "Ops", None);
        let after = dept(1, "Operations", Some(4));
        let event = ChangeEvent::updated(&before, &after).unwrap();
        assert_eq!(event.changed_fields, vec![Field::Name, Field::ParentId]);
        assert!(ChangeEvent::updated(&before, &before).is_none());
    }

    #[test]
    fn test_coalesce_keeps_one_event_per_entity() {
        let a0 = dept(1, "A", None);
        let a1 = dept(1, "A1", None);
        let a2 = dept(1, "A1", Some(2));
        let events = vec![
            ChangeEvent::created(&a0),
            ChangeEvent::created(&dept(2, "B", None)),
            ChangeEvent::updated(&a0, &a1).unwrap(),
            ChangeEvent::updated(&a1, &a2).unwrap(),
        ];
        let merged = coalesce(events);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].id, 1);
        assert_eq!(merged[0].operation, Operation::Create);
        assert_eq!(merged[0].after, Some(a2));
        assert_eq!(merged[1].id, 2);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_and_watchers() {
        let recorder = Arc::new(Recorder::default());
        let feed = ChangeFeed::new().with_subscriber(recorder.clone());
        let mut watcher = feed.watch();

        feed.publish(vec![ChangeEvent::created(&dept(3, "C", None))]).await;

        assert_eq!(recorder.seen.lock().await.len(), 1);
        let event = watcher.recv().await.unwrap();
        assert_eq!((event.kind, event.id), (EntityKind::Department, 3));
    }
}
