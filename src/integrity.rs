//! Integrity scan
//!
//! Reports corruption that mutations through this crate reject but rows
//! written by other tools, or racing re-parents, can leave behind: looping or overlong parent chains,
//! references to missing rows, broken level ordering and stale denormalized
//! department ids.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::entity::{employee, position, EntityKind, Field, Record};
use crate::error::CoreResult;
use crate::hierarchy::{LevelError, LevelInvariant, TreeError, TreeIndex};
use crate::store::{Predicate, Repository};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "problem", rename_all = "snake_case")]
pub enum Problem {
    Cycle { at: i64 },
    DepthExceeded { limit: usize },
    DanglingReference { field: Field, target: EntityKind, id: i64 },
    LevelOrder { field: Field, error: LevelError },
    ManagerOutsideSubtree { employee_id: i64 },
    StaleDepartment { expected: i64, actual: i64 },
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Problem::Cycle { at } => write!(f, "parent chain loops at {}", at),
            Problem::DepthExceeded { limit } => write!(f, "parent chain deeper than {}", limit),
            Problem::DanglingReference { field, target, id } => {
                write!(f, "{} points to missing {} {}", field, target, id)
            }
            Problem::LevelOrder { field, error } => write!(f, "{}: {}", field, error),
            Problem::ManagerOutsideSubtree { employee_id } => {
                write!(f, "head {} works outside the department subtree", employee_id)
            }
            Problem::StaleDepartment { expected, actual } => {
                write!(f, "department_id is {} but the position belongs to {}", actual, expected)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub kind: EntityKind,
    pub id: i64,
    #[serde(flatten)]
    pub problem: Problem,
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.kind, self.id, self.problem)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrityReport {
    pub scanned: usize,
    pub issues: Vec<Issue>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    fn push(&mut self, kind: EntityKind, id: i64, problem: Problem) {
        self.issues.push(Issue { kind, id, problem });
    }
}

type Table = BTreeMap<i64, Record>;

fn position_of<'t>(positions: &'t Table, e: &employee::Model) -> Option<&'t position::Model> {
    positions.get(&e.position_id).and_then(Record::as_position)
}

/// Walk every live record and collect what is wrong with it
pub async fn scan(repo: &dyn Repository, max_depth: usize) -> CoreResult<IntegrityReport> {
    let mut tables: BTreeMap<EntityKind, Table> = BTreeMap::new();
    for kind in EntityKind::ALL {
        let rows = repo.find_all(kind, &Predicate::All).await?;
        tables.insert(kind, rows.into_iter().map(|r| (r.id(), r)).collect());
    }
    let empty = Table::new();
    let table = |kind: EntityKind| tables.get(&kind).unwrap_or(&empty);

    let mut report = IntegrityReport {
        scanned: tables.values().map(BTreeMap::len).sum(),
        issues: Vec::new(),
    };
    let tree = TreeIndex::new(repo, max_depth);

    for kind in EntityKind::ALL {
        for record in table(kind).values() {
            let id = record.id();
            match tree.ancestors_of(record).await {
                Ok(_) => {}
                Err(TreeError::CycleDetected { id: at, .. }) => {
                    report.push(kind, id, Problem::Cycle { at })
                }
                Err(TreeError::DepthExceeded { limit, .. }) => {
                    report.push(kind, id, Problem::DepthExceeded { limit })
                }
                Err(e) => return Err(e.into()),
            }

            let mut dangling = |field: Field, target: EntityKind, target_id: Option<i64>| {
                if let Some(target_id) = target_id {
                    if !table(target).contains_key(&target_id) {
                        report.push(
                            kind,
                            id,
                            Problem::DanglingReference {
                                field,
                                target,
                                id: target_id,
                            },
                        );
                    }
                }
            };
            match record {
                Record::Department(m) => {
                    dangling(Field::ParentId, EntityKind::Department, m.parent_id);
                    dangling(Field::ManagerId, EntityKind::Employee, m.manager_id);
                }
                Record::Position(m) => {
                    dangling(Field::DepartmentId, EntityKind::Department, Some(m.department_id));
                    dangling(Field::ParentId, EntityKind::Position, m.parent_id);
                }
                Record::Employee(m) => {
                    dangling(Field::PositionId, EntityKind::Position, Some(m.position_id));
                    dangling(Field::ManagerId, EntityKind::Employee, m.manager_id);
                }
            }
        }
    }

    let positions = table(EntityKind::Position);
    let employees = table(EntityKind::Employee);

    for p in positions.values().filter_map(Record::as_position) {
        let parent = p
            .parent_id
            .and_then(|id| positions.get(&id))
            .and_then(Record::as_position);
        if let Some(parent) = parent {
            if let Err(error) = LevelInvariant::Position.validate(p.level, Some(parent.level)) {
                report.push(
                    EntityKind::Position,
                    p.id,
                    Problem::LevelOrder {
                        field: Field::Level,
                        error,
                    },
                );
            }
        }
    }

    for e in employees.values().filter_map(Record::as_employee) {
        let Some(own) = position_of(positions, e) else { continue };
        if own.department_id != e.department_id {
            report.push(
                EntityKind::Employee,
                e.id,
                Problem::StaleDepartment {
                    expected: own.department_id,
                    actual: e.department_id,
                },
            );
        }
        let manager = e
            .manager_id
            .and_then(|id| employees.get(&id))
            .and_then(Record::as_employee);
        if let Some(manager_position) = manager.and_then(|m| position_of(positions, m)) {
            if let Err(error) =
                LevelInvariant::Manager.validate(own.level, Some(manager_position.level))
            {
                report.push(
                    EntityKind::Employee,
                    e.id,
                    Problem::LevelOrder {
                        field: Field::ManagerId,
                        error,
                    },
                );
            }
        }
    }

    for d in table(EntityKind::Department).values().filter_map(Record::as_department) {
        let head = d
            .manager_id
            .and_then(|id| employees.get(&id))
            .and_then(Record::as_employee);
        if let Some(head) = head {
            let inside = match tree
                .contains(EntityKind::Department, d.id, head.department_id)
                .await
            {
                Ok(inside) => inside,
                // Loops are already reported above
                Err(
                    TreeError::NotFound { .. }
                    | TreeError::CycleDetected { .. }
                    | TreeError::DepthExceeded { .. },
                ) => false,
                Err(e) => return Err(e.into()),
            };
            if !inside {
                report.push(
                    EntityKind::Department,
                    d.id,
                    Problem::ManagerOutsideSubtree {
                        employee_id: head.id,
                    },
                );
            }
        }
    }

    Ok(report)
}
