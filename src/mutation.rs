//! Single-record mutations
//!
//! Decodes a parameter map into typed changes, runs every entity-level
//! invariant (reference existence, cycle guard, level ordering, department
//! head scope, live uniqueness) and persists through the given repository.
//! The caller owns the transaction and publishes the returned events after
//! commit.

use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::entity::{department, employee, position, EntityKind, Field, FieldValue, Record};
use crate::error::{CoreError, CoreResult, Dependents, FieldError, OptionExt, Violation};
use crate::events::{changed_fields, ChangeEvent, Operation};
use crate::hierarchy::{CycleGuard, LevelInvariant, TreeError, TreeIndex};
use crate::store::{Predicate, Repository};

const MAX_LABEL_CHARS: usize = 64;
const MAX_EMAIL_CHARS: usize = 128;

/// Distinguishes an absent key from an explicit `null`
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DepartmentParams {
    pub id: Option<i64>,
    pub name: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub parent_id: Option<Option<i64>>,
    #[serde(default, deserialize_with = "nullable")]
    pub manager_id: Option<Option<i64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PositionParams {
    pub id: Option<i64>,
    pub title: Option<String>,
    pub department_id: Option<i64>,
    #[serde(default, deserialize_with = "nullable")]
    pub parent_id: Option<Option<i64>>,
    pub level: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmployeeParams {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub position_id: Option<i64>,
    #[serde(default, deserialize_with = "nullable")]
    pub manager_id: Option<Option<i64>>,
}

/// Typed parameter map of one mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Params {
    Department(DepartmentParams),
    Position(PositionParams),
    Employee(EmployeeParams),
}

impl Params {
    pub fn parse(kind: EntityKind, value: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            EntityKind::Department => Params::Department(serde_json::from_value(value)?),
            EntityKind::Position => Params::Position(serde_json::from_value(value)?),
            EntityKind::Employee => Params::Employee(serde_json::from_value(value)?),
        })
    }

    /// Parameters naming only a target id
    pub fn target(kind: EntityKind, id: i64) -> Self {
        match kind {
            EntityKind::Department => Params::Department(DepartmentParams {
                id: Some(id),
                ..Default::default()
            }),
            EntityKind::Position => Params::Position(PositionParams {
                id: Some(id),
                ..Default::default()
            }),
            EntityKind::Employee => Params::Employee(EmployeeParams {
                id: Some(id),
                ..Default::default()
            }),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Params::Department(_) => EntityKind::Department,
            Params::Position(_) => EntityKind::Position,
            Params::Employee(_) => EntityKind::Employee,
        }
    }

    pub fn id(&self) -> Option<i64> {
        match self {
            Params::Department(p) => p.id,
            Params::Position(p) => p.id,
            Params::Employee(p) => p.id,
        }
    }

    /// Fields a create must carry
    pub fn missing_required(&self) -> Vec<Field> {
        let mut missing = Vec::new();
        let mut need = |present: bool, field: Field| {
            if !present {
                missing.push(field);
            }
        };
        match self {
            Params::Department(p) => need(p.name.is_some(), Field::Name),
            Params::Position(p) => {
                need(p.title.is_some(), Field::Title);
                need(p.department_id.is_some(), Field::DepartmentId);
                need(p.level.is_some(), Field::Level);
            }
            Params::Employee(p) => {
                need(p.name.is_some(), Field::Name);
                need(p.email.is_some(), Field::Email);
                need(p.position_id.is_some(), Field::PositionId);
            }
        }
        missing
    }

    /// Foreign references carried by the parameters (target id excluded)
    pub fn references(&self) -> Vec<(Field, EntityKind, i64)> {
        let mut refs = Vec::new();
        let mut add = |field: Field, kind: EntityKind, id: Option<i64>| {
            if let Some(id) = id {
                refs.push((field, kind, id));
            }
        };
        match self {
            Params::Department(p) => {
                add(Field::ParentId, EntityKind::Department, p.parent_id.flatten());
                add(Field::ManagerId, EntityKind::Employee, p.manager_id.flatten());
            }
            Params::Position(p) => {
                add(Field::DepartmentId, EntityKind::Department, p.department_id);
                add(Field::ParentId, EntityKind::Position, p.parent_id.flatten());
            }
            Params::Employee(p) => {
                add(Field::PositionId, EntityKind::Position, p.position_id);
                add(Field::ManagerId, EntityKind::Employee, p.manager_id.flatten());
            }
        }
        refs
    }

    /// Overlay the parameters on a stored record, or on an empty one
    pub fn apply(&self, base: Option<&Record>) -> Record {
        match self {
            Params::Department(p) => {
                let mut m = match base {
                    Some(Record::Department(m)) => m.clone(),
                    _ => department::Model {
                        id: 0,
                        name: String::new(),
                        parent_id: None,
                        manager_id: None,
                        deleted_at: None,
                    },
                };
                if let Some(name) = &p.name {
                    m.name = name.clone();
                }
                if let Some(parent_id) = p.parent_id {
                    m.parent_id = parent_id;
                }
                if let Some(manager_id) = p.manager_id {
                    m.manager_id = manager_id;
                }
                Record::Department(m)
            }
            Params::Position(p) => {
                let mut m = match base {
                    Some(Record::Position(m)) => m.clone(),
                    _ => position::Model {
                        id: 0,
                        title: String::new(),
                        department_id: 0,
                        parent_id: None,
                        level: 0,
                        deleted_at: None,
                    },
                };
                if let Some(title) = &p.title {
                    m.title = title.clone();
                }
                if let Some(department_id) = p.department_id {
                    m.department_id = department_id;
                }
                if let Some(parent_id) = p.parent_id {
                    m.parent_id = parent_id;
                }
                if let Some(level) = p.level {
                    m.level = level;
                }
                Record::Position(m)
            }
            Params::Employee(p) => {
                let mut m = match base {
                    Some(Record::Employee(m)) => m.clone(),
                    _ => employee::Model {
                        id: 0,
                        name: String::new(),
                        email: String::new(),
                        position_id: 0,
                        department_id: 0,
                        manager_id: None,
                        deleted_at: None,
                    },
                };
                if let Some(name) = &p.name {
                    m.name = name.clone();
                }
                if let Some(email) = &p.email {
                    m.email = email.clone();
                }
                if let Some(position_id) = p.position_id {
                    m.position_id = position_id;
                }
                if let Some(manager_id) = p.manager_id {
                    m.manager_id = manager_id;
                }
                Record::Employee(m)
            }
        }
    }
}

/// A value that must be unique among live records, optionally per scope
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UniqueKey {
    pub field: Field,
    pub value: FieldValue,
    pub scope: Option<(Field, i64)>,
}

impl UniqueKey {
    pub fn predicate(&self) -> Predicate {
        let eq = Predicate::Eq(self.field, self.value.clone());
        match self.scope {
            Some((field, id)) => Predicate::And(vec![eq, Predicate::eq(field, id)]),
            None => eq,
        }
    }
}

pub fn unique_keys(record: &Record) -> Vec<UniqueKey> {
    match record {
        Record::Department(m) => vec![UniqueKey {
            field: Field::Name,
            value: m.name.as_str().into(),
            scope: None,
        }],
        Record::Position(m) => vec![UniqueKey {
            field: Field::Title,
            value: m.title.as_str().into(),
            scope: Some((Field::DepartmentId, m.department_id)),
        }],
        Record::Employee(m) => vec![UniqueKey {
            field: Field::Email,
            value: m.email.as_str().into(),
            scope: None,
        }],
    }
}

fn push(errors: &mut Vec<FieldError>, error: FieldError) {
    if !errors.contains(&error) {
        errors.push(error);
    }
}

fn check_label(field: Field, value: &str, errors: &mut Vec<FieldError>) {
    if value.trim().is_empty() {
        push(errors, FieldError::new(field, Violation::Invalid("must not be blank".into())));
    } else if value.chars().count() > MAX_LABEL_CHARS {
        push(
            errors,
            FieldError::new(
                field,
                Violation::Invalid(format!("must not exceed {} characters", MAX_LABEL_CHARS)),
            ),
        );
    }
}

fn valid_email(email: &str) -> bool {
    if email.chars().count() > MAX_EMAIL_CHARS {
        return false;
    }
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}

/// Plain attribute validation, independent of other records
pub fn attribute_errors(record: &Record) -> Vec<FieldError> {
    let mut errors = Vec::new();
    match record {
        Record::Department(m) => check_label(Field::Name, &m.name, &mut errors),
        Record::Position(m) => check_label(Field::Title, &m.title, &mut errors),
        Record::Employee(m) => {
            check_label(Field::Name, &m.name, &mut errors);
            if !valid_email(&m.email) {
                push(
                    &mut errors,
                    FieldError::new(Field::Email, Violation::Invalid("invalid email address".into())),
                );
            }
        }
    }
    errors
}

/// Result of a mutation; `events` is empty for an update that changed
/// nothing, otherwise the event of `record` comes first
#[derive(Debug, Clone)]
pub struct Applied {
    pub record: Record,
    pub events: Vec<ChangeEvent>,
}

pub struct Mutator<'a> {
    repo: &'a dyn Repository,
    max_depth: usize,
}

impl<'a> Mutator<'a> {
    pub fn new(repo: &'a dyn Repository, max_depth: usize) -> Self {
        Self { repo, max_depth }
    }

    fn guard(&self) -> CycleGuard<'a> {
        CycleGuard::new(self.repo, self.max_depth)
    }

    fn tree(&self) -> TreeIndex<'a> {
        TreeIndex::new(self.repo, self.max_depth)
    }

    pub async fn apply(&self, operation: Operation, params: &Params) -> CoreResult<Applied> {
        match operation {
            Operation::Create => self.create(params).await,
            Operation::Update => self.update(params).await,
            Operation::Delete => {
                let id = required_id(params)?;
                self.delete(params.kind(), id).await
            }
        }
    }

    pub async fn create(&self, params: &Params) -> CoreResult<Applied> {
        let missing = params.missing_required();
        if !missing.is_empty() {
            return Err(CoreError::ValidationFailed(
                missing
                    .into_iter()
                    .map(|field| FieldError::new(field, Violation::MissingRequiredField))
                    .collect(),
            ));
        }

        let mut candidate = params.apply(None);
        self.check(None, &mut candidate).await?;
        let record = self.repo.insert(candidate).await?;
        debug!("Created {} {} ({})", record.kind(), record.id(), record.label());

        let events = vec![ChangeEvent::created(&record)];
        Ok(Applied { record, events })
    }

    pub async fn update(&self, params: &Params) -> CoreResult<Applied> {
        let kind = params.kind();
        let id = required_id(params)?;
        let before = self
            .repo
            .find_live(kind, id)
            .await?
            .ok_or_not_found(format!("{} {}", kind, id))?;

        let mut candidate = params.apply(Some(&before));
        self.check(Some(&before), &mut candidate).await?;
        if changed_fields(&before, &candidate).is_empty() {
            return Ok(Applied {
                record: before,
                events: Vec::new(),
            });
        }

        let record = self.repo.update(candidate).await?;
        debug!("Updated {} {}", kind, id);
        let mut events: Vec<ChangeEvent> =
            ChangeEvent::updated(&before, &record).into_iter().collect();
        if let (Record::Position(old), Record::Position(new)) = (&before, &record) {
            if old.department_id != new.department_id {
                events.extend(self.move_holders(new.id, new.department_id).await?);
            }
        }
        Ok(Applied { record, events })
    }

    pub async fn delete(&self, kind: EntityKind, id: i64) -> CoreResult<Applied> {
        let before = self
            .repo
            .find_live(kind, id)
            .await?
            .ok_or_not_found(format!("{} {}", kind, id))?;

        let dependents = self.dependents(kind, id).await?;
        if !dependents.is_empty() {
            return Err(CoreError::DependentRecordsExist {
                kind,
                id,
                dependents,
            });
        }

        let at = chrono::Utc::now().timestamp();
        self.repo.soft_delete(kind, id, at).await?;
        debug!("Soft-deleted {} {}", kind, id);

        let mut after = before.clone();
        after.set_deleted_at(Some(at));
        Ok(Applied {
            events: vec![ChangeEvent::deleted(&before, &after)],
            record: after,
        })
    }

    /// Holders follow their position into its new department
    async fn move_holders(
        &self,
        position_id: i64,
        department_id: i64,
    ) -> CoreResult<Vec<ChangeEvent>> {
        let holders = self
            .repo
            .find_all(EntityKind::Employee, &Predicate::eq(Field::PositionId, position_id))
            .await?;
        let mut events = Vec::new();
        for before in holders {
            let mut after = before.clone();
            if let Record::Employee(m) = &mut after {
                m.department_id = department_id;
            }
            let after = self.repo.update(after).await?;
            events.extend(ChangeEvent::updated(&before, &after));
        }
        Ok(events)
    }

    /// Live records that keep `kind`/`id` from being deleted
    pub async fn dependents(&self, kind: EntityKind, id: i64) -> CoreResult<Vec<Dependents>> {
        let probes: &[(EntityKind, Field)] = match kind {
            EntityKind::Department => &[
                (EntityKind::Department, Field::ParentId),
                (EntityKind::Position, Field::DepartmentId),
                (EntityKind::Employee, Field::DepartmentId),
            ],
            EntityKind::Position => &[
                (EntityKind::Position, Field::ParentId),
                (EntityKind::Employee, Field::PositionId),
            ],
            EntityKind::Employee => &[
                (EntityKind::Employee, Field::ManagerId),
                (EntityKind::Department, Field::ManagerId),
            ],
        };

        let mut found = Vec::new();
        for (dependent_kind, field) in probes {
            let count = self
                .repo
                .find_all(*dependent_kind, &Predicate::eq(*field, id))
                .await?
                .len();
            if count > 0 {
                found.push(Dependents {
                    kind: *dependent_kind,
                    count,
                });
            }
        }
        Ok(found)
    }

    /// True when another live record already holds the key
    pub async fn conflicts(
        &self,
        kind: EntityKind,
        key: &UniqueKey,
        exclude: Option<i64>,
    ) -> CoreResult<bool> {
        Ok(self
            .repo
            .find_all(kind, &key.predicate())
            .await?
            .iter()
            .any(|r| Some(r.id()) != exclude))
    }

    async fn check(&self, before: Option<&Record>, candidate: &mut Record) -> CoreResult<()> {
        let mut errors = attribute_errors(candidate);
        match candidate {
            Record::Department(m) => {
                self.check_department(before.and_then(Record::as_department), m, &mut errors)
                    .await?
            }
            Record::Position(m) => {
                self.check_position(before.and_then(Record::as_position), m, &mut errors)
                    .await?
            }
            Record::Employee(m) => {
                self.check_employee(before.and_then(Record::as_employee), m, &mut errors)
                    .await?
            }
        }

        let previous = before.map(unique_keys).unwrap_or_default();
        for key in unique_keys(candidate) {
            if previous.contains(&key) {
                continue;
            }
            if self
                .conflicts(candidate.kind(), &key, before.map(Record::id))
                .await?
            {
                push(
                    &mut errors,
                    FieldError::new(key.field, Violation::DuplicateValue { value: key.value }),
                );
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::ValidationFailed(errors))
        }
    }

    /// Resolve a live reference, recording a field error when it is missing
    async fn require(
        &self,
        kind: EntityKind,
        field: Field,
        id: i64,
        errors: &mut Vec<FieldError>,
    ) -> CoreResult<Option<Record>> {
        let found = self.repo.find_live(kind, id).await?;
        if found.is_none() {
            push(
                errors,
                FieldError::new(field, Violation::ReferencedEntityNotFound { kind, id }),
            );
        }
        Ok(found)
    }

    async fn check_department(
        &self,
        before: Option<&department::Model>,
        m: &department::Model,
        errors: &mut Vec<FieldError>,
    ) -> CoreResult<()> {
        let id = before.map(|b| b.id);

        if before.map_or(true, |b| b.parent_id != m.parent_id) {
            if let Some(parent_id) = m.parent_id {
                let parent = self
                    .require(EntityKind::Department, Field::ParentId, parent_id, errors)
                    .await?;
                if parent.is_some() {
                    if let Err(e) = self
                        .guard()
                        .validate(EntityKind::Department, id, Some(parent_id))
                        .await?
                    {
                        push(errors, FieldError::new(Field::ParentId, e));
                    } else if let Some(id) = id {
                        self.check_heads_above(id, Some(parent_id), errors).await?;
                    }
                }
            } else if let Some(id) = id {
                self.check_heads_above(id, None, errors).await?;
            }
        }

        if before.map_or(true, |b| b.manager_id != m.manager_id) {
            if let Some(manager_id) = m.manager_id {
                let manager = self
                    .require(EntityKind::Employee, Field::ManagerId, manager_id, errors)
                    .await?;
                if let Some(Record::Employee(manager)) = manager {
                    // A new department has no staff yet, so nobody is inside it
                    let inside = match id {
                        Some(id) => {
                            match self
                                .tree()
                                .contains(EntityKind::Department, id, manager.department_id)
                                .await
                            {
                                Ok(inside) => inside,
                                Err(TreeError::NotFound { .. }) => false,
                                Err(e) => return Err(e.into()),
                            }
                        }
                        None => false,
                    };
                    if !inside {
                        push(
                            errors,
                            FieldError::new(
                                Field::ManagerId,
                                Violation::ManagerOutsideSubtree {
                                    employee_id: manager_id,
                                },
                            ),
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn check_position(
        &self,
        before: Option<&position::Model>,
        m: &position::Model,
        errors: &mut Vec<FieldError>,
    ) -> CoreResult<()> {
        let id = before.map(|b| b.id);
        let parent_changed = before.map_or(true, |b| b.parent_id != m.parent_id);
        let level_changed = before.map_or(true, |b| b.level != m.level);

        if before.map_or(true, |b| b.department_id != m.department_id) {
            let department = self
                .require(EntityKind::Department, Field::DepartmentId, m.department_id, errors)
                .await?;
            // Holders follow the position, so they must stay inside what they head
            if let (Some(id), Some(_)) = (id, department) {
                let holders = self
                    .repo
                    .find_all(EntityKind::Employee, &Predicate::eq(Field::PositionId, id))
                    .await?;
                for holder in &holders {
                    self.check_headed(holder.id(), m.department_id, Field::DepartmentId, errors)
                        .await?;
                }
            }
        }

        if let Some(parent_id) = m.parent_id {
            if parent_changed || level_changed {
                let parent = if parent_changed {
                    self.require(EntityKind::Position, Field::ParentId, parent_id, errors)
                        .await?
                } else {
                    self.repo.find_live(EntityKind::Position, parent_id).await?
                };

                let mut acyclic = true;
                if parent_changed && parent.is_some() {
                    if let Err(e) = self
                        .guard()
                        .validate(EntityKind::Position, id, Some(parent_id))
                        .await?
                    {
                        push(errors, FieldError::new(Field::ParentId, e));
                        acyclic = false;
                    }
                }
                if let (true, Some(Record::Position(parent))) = (acyclic, &parent) {
                    if let Err(e) = LevelInvariant::Position.validate(m.level, Some(parent.level)) {
                        push(errors, FieldError::new(Field::Level, e));
                    }
                }
            }
        }

        if let (Some(id), true) = (id, level_changed) {
            self.check_position_edges_below(id, m.level, errors).await?;
        }
        Ok(())
    }

    /// After a level change, every edge hanging off the position must still
    /// order correctly: child positions, and manager links of its holders
    async fn check_position_edges_below(
        &self,
        id: i64,
        level: i32,
        errors: &mut Vec<FieldError>,
    ) -> CoreResult<()> {
        let children = self
            .repo
            .find_all(EntityKind::Position, &Predicate::eq(Field::ParentId, id))
            .await?;
        for child in children.iter().filter_map(Record::as_position) {
            if let Err(e) = LevelInvariant::Position.validate(child.level, Some(level)) {
                push(errors, FieldError::new(Field::Level, e));
            }
        }

        let overriding = Some((id, level));
        let holders = self
            .repo
            .find_all(EntityKind::Employee, &Predicate::eq(Field::PositionId, id))
            .await?;
        for holder in holders.iter().filter_map(Record::as_employee) {
            if let Some(manager_id) = holder.manager_id {
                if let Some(Record::Employee(manager)) =
                    self.repo.find_live(EntityKind::Employee, manager_id).await?
                {
                    let upper = self.level_of(&manager, overriding).await?;
                    if let Err(e) = LevelInvariant::Manager.validate(level, upper) {
                        push(errors, FieldError::new(Field::Level, e));
                    }
                }
            }

            let reports = self
                .repo
                .find_all(EntityKind::Employee, &Predicate::eq(Field::ManagerId, holder.id))
                .await?;
            for report in reports.iter().filter_map(Record::as_employee) {
                if let Some(report_level) = self.level_of(report, overriding).await? {
                    if let Err(e) = LevelInvariant::Manager.validate(report_level, Some(level)) {
                        push(errors, FieldError::new(Field::Level, e));
                    }
                }
            }
        }
        Ok(())
    }

    async fn check_employee(
        &self,
        before: Option<&employee::Model>,
        m: &mut employee::Model,
        errors: &mut Vec<FieldError>,
    ) -> CoreResult<()> {
        let id = before.map(|b| b.id);
        let position_changed = before.map_or(true, |b| b.position_id != m.position_id);
        let manager_changed = before.map_or(true, |b| b.manager_id != m.manager_id);

        let position = if position_changed {
            self.require(EntityKind::Position, Field::PositionId, m.position_id, errors)
                .await?
        } else {
            self.repo.find_live(EntityKind::Position, m.position_id).await?
        };
        let own_level = match &position {
            Some(Record::Position(p)) => {
                m.department_id = p.department_id;
                Some(p.level)
            }
            _ => None,
        };

        if let Some(before) = before.filter(|b| b.department_id != m.department_id) {
            self.check_headed(before.id, m.department_id, Field::PositionId, errors)
                .await?;
        }

        if manager_changed || position_changed {
            if let Some(manager_id) = m.manager_id {
                let manager = if manager_changed {
                    self.require(EntityKind::Employee, Field::ManagerId, manager_id, errors)
                        .await?
                } else {
                    self.repo.find_live(EntityKind::Employee, manager_id).await?
                };

                let mut acyclic = true;
                if manager_changed && manager.is_some() {
                    if let Err(e) = self
                        .guard()
                        .validate(EntityKind::Employee, id, Some(manager_id))
                        .await?
                    {
                        push(errors, FieldError::new(Field::ManagerId, e));
                        acyclic = false;
                    }
                }
                if let (true, Some(level), Some(Record::Employee(manager))) =
                    (acyclic, own_level, &manager)
                {
                    let upper = self.level_of(manager, None).await?;
                    if let Err(e) = LevelInvariant::Manager.validate(level, upper) {
                        let field = if manager_changed {
                            Field::ManagerId
                        } else {
                            Field::PositionId
                        };
                        push(errors, FieldError::new(field, e));
                    }
                }
            }
        }

        if let (Some(id), true, Some(level)) = (id, position_changed, own_level) {
            let reports = self
                .repo
                .find_all(EntityKind::Employee, &Predicate::eq(Field::ManagerId, id))
                .await?;
            for report in reports.iter().filter_map(Record::as_employee) {
                if let Some(report_level) = self.level_of(report, None).await? {
                    if let Err(e) = LevelInvariant::Manager.validate(report_level, Some(level)) {
                        push(errors, FieldError::new(Field::PositionId, e));
                    }
                }
            }
        }
        Ok(())
    }

    /// Every department headed by `employee_id` must still contain
    /// `department_id`, the department the employee is about to work in
    async fn check_headed(
        &self,
        employee_id: i64,
        department_id: i64,
        field: Field,
        errors: &mut Vec<FieldError>,
    ) -> CoreResult<()> {
        let headed = self
            .repo
            .find_all(EntityKind::Department, &Predicate::eq(Field::ManagerId, employee_id))
            .await?;
        for department in &headed {
            let inside = match self
                .tree()
                .contains(EntityKind::Department, department.id(), department_id)
                .await
            {
                Ok(inside) => inside,
                Err(TreeError::NotFound { .. }) => false,
                Err(e) => return Err(e.into()),
            };
            if !inside {
                push(
                    errors,
                    FieldError::new(field, Violation::ManagerOutsideSubtree { employee_id }),
                );
            }
        }
        Ok(())
    }

    /// Re-parenting department `id` under `parent_id` takes its subtree away
    /// from every current ancestor that is not also above the new parent.
    /// Heads of those ancestors must not work inside the moving subtree.
    async fn check_heads_above(
        &self,
        id: i64,
        parent_id: Option<i64>,
        errors: &mut Vec<FieldError>,
    ) -> CoreResult<()> {
        let tree = self.tree();
        let mut kept = Vec::new();
        if let Some(parent_id) = parent_id {
            kept.push(parent_id);
            kept.extend(
                tree.ancestors(EntityKind::Department, parent_id)
                    .await?
                    .iter()
                    .map(Record::id),
            );
        }

        for ancestor in tree.ancestors(EntityKind::Department, id).await? {
            if kept.contains(&ancestor.id()) {
                continue;
            }
            let Some(head_id) = ancestor.as_department().and_then(|d| d.manager_id) else {
                continue;
            };
            if let Some(Record::Employee(head)) =
                self.repo.find_live(EntityKind::Employee, head_id).await?
            {
                let inside = match tree
                    .contains(EntityKind::Department, id, head.department_id)
                    .await
                {
                    Ok(inside) => inside,
                    Err(TreeError::NotFound { .. }) => false,
                    Err(e) => return Err(e.into()),
                };
                if inside {
                    push(
                        errors,
                        FieldError::new(
                            Field::ParentId,
                            Violation::ManagerOutsideSubtree {
                                employee_id: head_id,
                            },
                        ),
                    );
                }
            }
        }
        Ok(())
    }

    /// Level of an employee's position; `overriding` substitutes a pending
    /// level for one position id
    async fn level_of(
        &self,
        employee: &employee::Model,
        overriding: Option<(i64, i32)>,
    ) -> CoreResult<Option<i32>> {
        if let Some((position_id, level)) = overriding {
            if employee.position_id == position_id {
                return Ok(Some(level));
            }
        }
        Ok(self
            .repo
            .find_live(EntityKind::Position, employee.position_id)
            .await?
            .and_then(|r| r.as_position().map(|p| p.level)))
    }
}

fn required_id(params: &Params) -> CoreResult<i64> {
    params.id().ok_or_else(|| {
        CoreError::ValidationFailed(vec![FieldError::new(
            Field::Id,
            Violation::MissingRequiredField,
        )])
    })
}
