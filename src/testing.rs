//! Shared test fixtures

use crate::entity::{department, employee, position, Record};
use crate::store::MemoryStore;

pub fn dept(id: i64, name: &str, parent_id: Option<i64>) -> Record {
    Record::Department(department::Model {
        id,
        name: name.to_string(),
        parent_id,
        manager_id: None,
        deleted_at: None,
    })
}

pub fn pos(id: i64, title: &str, department_id: i64, parent_id: Option<i64>, level: i32) -> Record {
    Record::Position(position::Model {
        id,
        title: title.to_string(),
        department_id,
        parent_id,
        level,
        deleted_at: None,
    })
}

pub fn emp(
    id: i64,
    name: &str,
    position_id: i64,
    department_id: i64,
    manager_id: Option<i64>,
) -> Record {
    Record::Employee(employee::Model {
        id,
        name: name.to_string(),
        email: format!("{}@example.com", name.to_lowercase()),
        position_id,
        department_id,
        manager_id,
        deleted_at: None,
    })
}

/// Head Office(1) > Engineering(2) > Platform(3), Head Office(1) > Sales(4)
///
/// Positions: CEO(10, L10) > CTO(11, L8) > Engineer(12, L3), CEO > Account Exec(13, L4)
/// Employees: Grace(20, CEO) > Linus(21, CTO) > Ada(22, Engineer), Grace > Joan(23)
/// Engineering is headed by Linus.
pub fn sample_org() -> MemoryStore {
    let mut engineering = dept(2, "Engineering", Some(1));
    if let Record::Department(m) = &mut engineering {
        m.manager_id = Some(21);
    }
    MemoryStore::with_records([
        dept(1, "Head Office", None),
        engineering,
        dept(3, "Platform", Some(2)),
        dept(4, "Sales", Some(1)),
        pos(10, "CEO", 1, None, 10),
        pos(11, "CTO", 2, Some(10), 8),
        pos(12, "Engineer", 3, Some(11), 3),
        pos(13, "Account Exec", 4, Some(10), 4),
        emp(20, "Grace", 10, 1, None),
        emp(21, "Linus", 11, 2, Some(20)),
        emp(22, "Ada", 12, 3, Some(21)),
        emp(23, "Joan", 13, 4, Some(20)),
    ])
}
