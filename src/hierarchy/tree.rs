//! Tree index: ancestor/descendant walks and the aggregate views built on them
//!
//! Ancestors are always returned nearest-first (parent, grandparent, ..., root)
//! for every entity kind. Descendants come in pre-order with siblings in
//! ascending id order.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::entity::department::{self, DepartmentSummary};
use crate::entity::employee::{self, EmployeeSummary};
use crate::entity::position::{self, PositionSummary};
use crate::entity::{EntityKind, Field, Record};
use crate::store::{Predicate, Repository, StoreError};

#[derive(Error, Debug)]
pub enum TreeError {
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: i64 },

    #[error("{kind} chain loops back to {id}")]
    CycleDetected { kind: EntityKind, id: i64 },

    #[error("{kind} chain is deeper than {limit}")]
    DepthExceeded { kind: EntityKind, limit: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// An entity with its full reporting line in both directions
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hierarchy {
    pub node: Record,
    pub ancestors: Vec<Record>,
    pub descendants: Vec<Record>,
}

/// Nested descendant tree
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub record: Record,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    /// Number of nodes including this one
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(TreeNode::size).sum::<usize>()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgChartPosition {
    pub position: position::Model,
    pub parent: Option<PositionSummary>,
    pub employees: Vec<EmployeeSummary>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgChartEmployee {
    pub employee: employee::Model,
    pub position: Option<PositionSummary>,
    pub manager: Option<EmployeeSummary>,
}

/// Department with its positions and staff
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgChart {
    pub department: department::Model,
    pub sub_departments: Vec<DepartmentSummary>,
    pub positions: Vec<OrgChartPosition>,
    pub employees: Vec<OrgChartEmployee>,
}

pub struct TreeIndex<'a> {
    repo: &'a dyn Repository,
    max_depth: usize,
}

impl<'a> TreeIndex<'a> {
    pub fn new(repo: &'a dyn Repository, max_depth: usize) -> Self {
        Self { repo, max_depth }
    }

    /// Live record or NotFound
    pub async fn node(&self, kind: EntityKind, id: i64) -> Result<Record, TreeError> {
        self.repo
            .find_live(kind, id)
            .await?
            .ok_or(TreeError::NotFound { kind, id })
    }

    /// Direct live children over the parent edge
    pub async fn children(&self, kind: EntityKind, id: i64) -> Result<Vec<Record>, TreeError> {
        let predicate = Predicate::eq(kind.parent_field(), id);
        Ok(self.repo.find_all(kind, &predicate).await?)
    }

    pub async fn ancestors(&self, kind: EntityKind, id: i64) -> Result<Vec<Record>, TreeError> {
        let node = self.node(kind, id).await?;
        self.ancestors_of(&node).await
    }

    /// Walk up from `record`; a missing or tombstoned parent ends the chain
    pub async fn ancestors_of(&self, record: &Record) -> Result<Vec<Record>, TreeError> {
        let kind = record.kind();
        let mut visited = HashSet::from([record.id()]);
        let mut chain = Vec::new();
        let mut next = record.parent_id();

        while let Some(id) = next {
            if !visited.insert(id) {
                return Err(TreeError::CycleDetected { kind, id });
            }
            if chain.len() >= self.max_depth {
                return Err(TreeError::DepthExceeded {
                    kind,
                    limit: self.max_depth,
                });
            }
            match self.repo.find_live(kind, id).await? {
                Some(parent) => {
                    next = parent.parent_id();
                    chain.push(parent);
                }
                None => break,
            }
        }
        Ok(chain)
    }

    pub async fn descendants(&self, kind: EntityKind, id: i64) -> Result<Vec<Record>, TreeError> {
        let node = self.node(kind, id).await?;
        self.descendants_of(&node).await
    }

    /// Pre-order depth-first walk with an explicit stack
    pub async fn descendants_of(&self, root: &Record) -> Result<Vec<Record>, TreeError> {
        let kind = root.kind();
        let mut visited = HashSet::from([root.id()]);
        let mut out = Vec::new();
        let mut stack: Vec<(Record, usize)> = self
            .children(kind, root.id())
            .await?
            .into_iter()
            .rev()
            .map(|child| (child, 1))
            .collect();

        while let Some((record, depth)) = stack.pop() {
            if depth > self.max_depth {
                return Err(TreeError::DepthExceeded {
                    kind,
                    limit: self.max_depth,
                });
            }
            if !visited.insert(record.id()) {
                return Err(TreeError::CycleDetected {
                    kind,
                    id: record.id(),
                });
            }
            let children = self.children(kind, record.id()).await?;
            stack.extend(children.into_iter().rev().map(|child| (child, depth + 1)));
            out.push(record);
        }
        Ok(out)
    }

    pub async fn hierarchy(&self, kind: EntityKind, id: i64) -> Result<Hierarchy, TreeError> {
        let node = self.node(kind, id).await?;
        let ancestors = self.ancestors_of(&node).await?;
        let descendants = self.descendants_of(&node).await?;
        Ok(Hierarchy {
            node,
            ancestors,
            descendants,
        })
    }

    pub async fn tree(&self, kind: EntityKind, id: i64) -> Result<TreeNode, TreeError> {
        let node = self.node(kind, id).await?;
        let mut by_parent: HashMap<i64, Vec<Record>> = HashMap::new();
        for record in self.descendants_of(&node).await? {
            if let Some(parent) = record.parent_id() {
                by_parent.entry(parent).or_default().push(record);
            }
        }
        Ok(assemble(node, &mut by_parent))
    }

    /// True when `id` is `root` or lies below it
    pub async fn contains(&self, kind: EntityKind, root: i64, id: i64) -> Result<bool, TreeError> {
        if root == id {
            return Ok(true);
        }
        let node = self.node(kind, id).await?;
        Ok(self.ancestors_of(&node).await?.iter().any(|a| a.id() == root))
    }

    /// Live employees below an entity: a department's subtree staff, the
    /// holders of a position and its child positions, or an employee's reports
    pub async fn subordinates(&self, kind: EntityKind, id: i64) -> Result<Vec<Record>, TreeError> {
        let node = self.node(kind, id).await?;
        let scope_field = match kind {
            EntityKind::Employee => return self.descendants_of(&node).await,
            EntityKind::Department => Field::DepartmentId,
            EntityKind::Position => Field::PositionId,
        };

        let mut scope = vec![node.id()];
        scope.extend(self.descendants_of(&node).await?.iter().map(Record::id));
        let mut staff = Vec::new();
        for scope_id in scope {
            let predicate = Predicate::eq(scope_field, scope_id);
            staff.extend(self.repo.find_all(EntityKind::Employee, &predicate).await?);
        }
        Ok(staff)
    }

    /// Headcount view: subtree staff for a department, direct holders for a
    /// position, all reports for an employee
    pub async fn count(&self, kind: EntityKind, id: i64) -> Result<usize, TreeError> {
        match kind {
            EntityKind::Position => {
                self.node(kind, id).await?;
                let predicate = Predicate::eq(Field::PositionId, id);
                Ok(self.repo.find_all(EntityKind::Employee, &predicate).await?.len())
            }
            EntityKind::Department | EntityKind::Employee => {
                Ok(self.subordinates(kind, id).await?.len())
            }
        }
    }

    pub async fn org_chart(&self, department_id: i64) -> Result<OrgChart, TreeError> {
        let Record::Department(department) =
            self.node(EntityKind::Department, department_id).await?
        else {
            return Err(TreeError::NotFound {
                kind: EntityKind::Department,
                id: department_id,
            });
        };
        let sub_departments = self
            .children(EntityKind::Department, department_id)
            .await?
            .iter()
            .filter_map(Record::as_department)
            .map(DepartmentSummary::from)
            .collect();

        let scope = Predicate::eq(Field::DepartmentId, department_id);
        let positions: Vec<position::Model> = self
            .repo
            .find_all(EntityKind::Position, &scope)
            .await?
            .into_iter()
            .filter_map(|r| r.as_position().cloned())
            .collect();
        let employees: Vec<employee::Model> = self
            .repo
            .find_all(EntityKind::Employee, &scope)
            .await?
            .into_iter()
            .filter_map(|r| r.as_employee().cloned())
            .collect();

        let mut position_index: HashMap<i64, PositionSummary> = positions
            .iter()
            .map(|p| (p.id, PositionSummary::from(p)))
            .collect();
        let mut employee_index: HashMap<i64, EmployeeSummary> = employees
            .iter()
            .map(|e| (e.id, EmployeeSummary::from(e)))
            .collect();

        // Parents and managers may sit in another department
        for parent_id in positions.iter().filter_map(|p| p.parent_id) {
            if !position_index.contains_key(&parent_id) {
                if let Some(Record::Position(parent)) =
                    self.repo.find_live(EntityKind::Position, parent_id).await?
                {
                    position_index.insert(parent_id, PositionSummary::from(&parent));
                }
            }
        }
        for manager_id in employees.iter().filter_map(|e| e.manager_id) {
            if !employee_index.contains_key(&manager_id) {
                if let Some(Record::Employee(manager)) =
                    self.repo.find_live(EntityKind::Employee, manager_id).await?
                {
                    employee_index.insert(manager_id, EmployeeSummary::from(&manager));
                }
            }
        }

        let chart_positions = positions
            .iter()
            .map(|p| OrgChartPosition {
                position: p.clone(),
                parent: p.parent_id.and_then(|id| position_index.get(&id).cloned()),
                employees: employees
                    .iter()
                    .filter(|e| e.position_id == p.id)
                    .map(EmployeeSummary::from)
                    .collect(),
            })
            .collect();
        let chart_employees = employees
            .iter()
            .map(|e| OrgChartEmployee {
                employee: e.clone(),
                position: position_index.get(&e.position_id).cloned(),
                manager: e.manager_id.and_then(|id| employee_index.get(&id).cloned()),
            })
            .collect();

        Ok(OrgChart {
            department,
            sub_departments,
            positions: chart_positions,
            employees: chart_employees,
        })
    }
}

fn assemble(record: Record, by_parent: &mut HashMap<i64, Vec<Record>>) -> TreeNode {
    let children = by_parent.remove(&record.id()).unwrap_or_default();
    TreeNode {
        children: children
            .into_iter()
            .map(|child| assemble(child, by_parent))
            .collect(),
        record,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn dept(id: i64, parent_id: Option<i64>) -> Record {
        Record::Department(department::Model {
            id,
            name: format!("D{}", id),
            parent_id,
            manager_id: None,
            deleted_at: None,
        })
    }

    fn pos(id: i64, department_id: i64, parent_id: Option<i64>, level: i32) -> Record {
        Record::Position(position::Model {
            id,
            title: format!("P{}", id),
            department_id,
            parent_id,
            level,
            deleted_at: None,
        })
    }

    fn emp(id: i64, position_id: i64, department_id: i64, manager_id: Option<i64>) -> Record {
        Record::Employee(employee::Model {
            id,
            name: format!("E{}", id),
            email: format!("e{}@example.com", id),
            position_id,
            department_id,
            manager_id,
            deleted_at: None,
        })
    }

    fn ids(records: &[Record]) -> Vec<i64> {
        records.iter().map(Record::id).collect()
    }

    ///        1
    ///      /   \
    ///     2     3
    ///    / \
    ///   4   5
    fn departments() -> Vec<Record> {
        vec![
            dept(1, None),
            dept(2, Some(1)),
            dept(3, Some(1)),
            dept(4, Some(2)),
            dept(5, Some(2)),
        ]
    }

    #[tokio::test]
    async fn test_ancestors_nearest_first() {
        let store = MemoryStore::with_records(departments());
        let index = TreeIndex::new(&store, 64);
        let chain = index.ancestors(EntityKind::Department, 5).await.unwrap();
        assert_eq!(ids(&chain), vec![2, 1]);
        assert!(index.ancestors(EntityKind::Department, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_descendants_pre_order() {
        let store = MemoryStore::with_records(departments());
        let index = TreeIndex::new(&store, 64);
        let below = index.descendants(EntityKind::Department, 1).await.unwrap();
        assert_eq!(ids(&below), vec![2, 4, 5, 3]);
    }

    #[tokio::test]
    async fn test_tree_consistency() {
        let store = MemoryStore::with_records(departments());
        let index = TreeIndex::new(&store, 64);
        for id in 1..=5 {
            for descendant in index.descendants(EntityKind::Department, id).await.unwrap() {
                let up = index
                    .ancestors(EntityKind::Department, descendant.id())
                    .await
                    .unwrap();
                assert!(ids(&up).contains(&id));
            }
            for ancestor in index.ancestors(EntityKind::Department, id).await.unwrap() {
                let down = index
                    .descendants(EntityKind::Department, ancestor.id())
                    .await
                    .unwrap();
                assert!(ids(&down).contains(&id));
            }
            let up = index.ancestors(EntityKind::Department, id).await.unwrap();
            assert!(!ids(&up).contains(&id));
        }
    }

    #[tokio::test]
    async fn test_tombstoned_nodes_are_skipped() {
        let mut records = departments();
        records.push(Record::Department(department::Model {
            id: 6,
            name: "Closed".to_string(),
            parent_id: Some(3),
            manager_id: None,
            deleted_at: Some(1_700_000_000),
        }));
        let store = MemoryStore::with_records(records);
        let index = TreeIndex::new(&store, 64);
        let below = index.descendants(EntityKind::Department, 3).await.unwrap();
        assert!(below.is_empty());
        assert!(matches!(
            index.node(EntityKind::Department, 6).await,
            Err(TreeError::NotFound { id: 6, .. })
        ));
    }

    #[tokio::test]
    async fn test_corrupted_chain_fails_fast() {
        let store = MemoryStore::with_records([dept(1, Some(3)), dept(2, Some(1)), dept(3, Some(2))]);
        let index = TreeIndex::new(&store, 64);
        assert!(matches!(
            index.ancestors(EntityKind::Department, 1).await,
            Err(TreeError::CycleDetected { .. })
        ));
        assert!(matches!(
            index.descendants(EntityKind::Department, 1).await,
            Err(TreeError::CycleDetected { .. })
        ));
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let store = MemoryStore::with_records(departments());
        let index = TreeIndex::new(&store, 1);
        assert!(matches!(
            index.ancestors(EntityKind::Department, 4).await,
            Err(TreeError::DepthExceeded { limit: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_tree_and_hierarchy() {
        let store = MemoryStore::with_records(departments());
        let index = TreeIndex::new(&store, 64);

        let tree = index.tree(EntityKind::Department, 1).await.unwrap();
        assert_eq!(tree.size(), 5);
        assert_eq!(tree.children[0].record.id(), 2);
        assert_eq!(tree.children[0].children[1].record.id(), 5);

        let hierarchy = index.hierarchy(EntityKind::Department, 2).await.unwrap();
        assert_eq!(hierarchy.node.id(), 2);
        assert_eq!(ids(&hierarchy.ancestors), vec![1]);
        assert_eq!(ids(&hierarchy.descendants), vec![4, 5]);
        assert!(index.contains(EntityKind::Department, 1, 5).await.unwrap());
        assert!(!index.contains(EntityKind::Department, 3, 5).await.unwrap());
    }

    #[tokio::test]
    async fn test_org_chart_and_counts() {
        let mut records = departments();
        records.extend([
            pos(10, 2, None, 9),
            pos(11, 2, Some(10), 5),
            pos(12, 4, Some(11), 3),
            emp(20, 10, 2, None),
            emp(21, 11, 2, Some(20)),
            emp(22, 12, 4, Some(21)),
        ]);
        let store = MemoryStore::with_records(records);
        let index = TreeIndex::new(&store, 64);

        let chart = index.org_chart(2).await.unwrap();
        assert_eq!(chart.department.id, 2);
        assert_eq!(
            chart.sub_departments.iter().map(|d| d.id).collect::<Vec<_>>(),
            vec![4, 5]
        );
        assert_eq!(chart.positions.len(), 2);
        assert_eq!(chart.positions[1].parent.as_ref().map(|p| p.id), Some(10));
        assert_eq!(chart.positions[1].employees[0].id, 21);
        assert_eq!(chart.employees[1].manager.as_ref().map(|m| m.id), Some(20));

        // Manager from another department is still resolved
        let chart = index.org_chart(4).await.unwrap();
        assert_eq!(chart.employees[0].manager.as_ref().map(|m| m.name.as_str()), Some("E21"));
        assert_eq!(chart.positions[0].parent.as_ref().map(|p| p.id), Some(11));

        assert_eq!(index.count(EntityKind::Department, 2).await.unwrap(), 3);
        assert_eq!(index.count(EntityKind::Department, 4).await.unwrap(), 1);
        assert_eq!(index.count(EntityKind::Position, 11).await.unwrap(), 1);
        assert_eq!(index.count(EntityKind::Employee, 20).await.unwrap(), 2);
        let staff = index.subordinates(EntityKind::Position, 10).await.unwrap();
        assert_eq!(ids(&staff), vec![20, 21, 22]);
    }
}
