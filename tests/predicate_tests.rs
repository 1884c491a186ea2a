/// Predicate tests
///
/// The remote filter text and the local closure compiled from the same
/// predicate must select the same entities.
/// Run with: cargo test --test predicate_tests

mod common;

use chrono::{TimeZone, Utc};
use common::manager;
use entitycache::prelude::*;
use entitycache::query::{FnNode, Operand};

const ALFREDS: &str = "Alfreds";
const BON_APP: &str = "Bon app";
const CHOP_SUEY: &str = "Chop-suey";

/// Three customers and six orders. Order 6 has no customer; Chop-suey has
/// no orders.
fn northwind() -> EntityManager {
    let mut em = manager();
    let mut customers = Vec::new();
    for name in [ALFREDS, BON_APP, CHOP_SUEY] {
        let key = uuid::Uuid::new_v4();
        em.attach_entity(
            Entity::new("Northwind.Customer")
                .with_value("CustomerID", key)
                .with_value("CompanyName", name),
            EntityState::Unchanged,
        )
        .unwrap();
        customers.push(key);
    }

    let orders: [(i32, f64, &str, i32, u32, Option<usize>); 6] = [
        (1, 32.38, "Reims", 5, 4, Some(0)),
        (2, 11.61, "Munster", 6, 5, Some(0)),
        (3, 65.83, "Rio de Janeiro", 4, 8, Some(1)),
        (4, 41.34, "Lyon", 3, 8, Some(1)),
        (5, 51.30, "Charleroi", 4, 9, Some(1)),
        (6, 148.33, "Bern", 3, 10, None),
    ];
    for (id, freight, city, employee, day, customer) in orders {
        let mut order = Entity::new("Northwind.Order")
            .with_value("OrderID", id)
            .with_value("Freight", freight)
            .with_value("ShipCity", city)
            .with_value("EmployeeID", employee)
            .with_value("OrderDate", Utc.with_ymd_and_hms(1996, 7, day, 0, 0, 0).unwrap());
        if let Some(index) = customer {
            order = order.with_value("CustomerID", customers[index]);
        }
        em.attach_entity(order, EntityState::Unchanged).unwrap();
    }
    em
}

fn local_order_ids(em: &EntityManager, predicate: &Predicate) -> Vec<i64> {
    let result = em
        .execute_query_locally(&EntityQuery::from("Orders").where_(predicate))
        .unwrap();
    let mut ids: Vec<i64> = result
        .entity_ids()
        .iter()
        .filter_map(|id| em.get_entity(*id))
        .filter_map(|e| e.get("OrderID").as_i64())
        .collect();
    ids.sort();
    ids
}

fn local_customer_names(em: &EntityManager, predicate: &Predicate) -> Vec<String> {
    let result = em
        .execute_query_locally(&EntityQuery::from("Customers").where_(predicate))
        .unwrap();
    let mut names: Vec<String> = result
        .entity_ids()
        .iter()
        .filter_map(|id| em.get_entity(*id))
        .map(|e| e.get("CompanyName").to_string())
        .collect();
    names.sort();
    names
}

#[test]
fn test_order_filters_agree_with_rendered_text() {
    let em = northwind();
    let store = em.metadata();
    let starts_with_r = Predicate::new("ShipCity", "startswith", "R").unwrap();
    let heavy = Predicate::new("Freight", "gt", 50).unwrap();
    let july_8 = Utc.with_ymd_and_hms(1996, 7, 8, 0, 0, 0).unwrap();

    let cases: Vec<(Predicate, String, Vec<i64>)> = vec![
        (heavy.clone(), "Freight gt 50m".into(), vec![3, 5, 6]),
        (Predicate::new("Freight", "le", 40).unwrap(), "Freight le 40m".into(), vec![1, 2]),
        (Predicate::new("EmployeeID", "eq", 4).unwrap(), "EmployeeID eq 4".into(), vec![3, 5]),
        (Predicate::new("EmployeeID", "lt", 4).unwrap(), "EmployeeID lt 4".into(), vec![4, 6]),
        (Predicate::new("EmployeeID", "ge", 5).unwrap(), "EmployeeID ge 5".into(), vec![1, 2]),
        (
            Predicate::new("ShipCity", "ne", "Lyon").unwrap(),
            "ShipCity ne 'Lyon'".into(),
            vec![1, 2, 3, 5, 6],
        ),
        (
            Predicate::new("OrderDate", "ge", july_8).unwrap(),
            format!("OrderDate ge {}", DataType::DateTime.format_odata(&Value::DateTime(july_8))),
            vec![3, 4, 5, 6],
        ),
        (starts_with_r.clone(), "startswith(ShipCity,'R') eq true".into(), vec![1, 3]),
        (
            Predicate::new("ShipCity", "endswith", "n").unwrap(),
            "endswith(ShipCity,'n') eq true".into(),
            vec![4, 6],
        ),
        (
            Predicate::new("ShipCity", "substringof", "er").unwrap(),
            "substringof('er',ShipCity) eq true".into(),
            vec![2, 5, 6],
        ),
        (
            Predicate::new("toupper(ShipCity)", "eq", "LYON").unwrap(),
            "toupper(ShipCity) eq 'LYON'".into(),
            vec![4],
        ),
        (
            Predicate::new("length(ShipCity)", "gt", 5).unwrap(),
            "length(ShipCity) gt 5".into(),
            vec![2, 3, 5],
        ),
        (heavy.not(), "not (Freight gt 50m)".into(), vec![1, 2, 4]),
        (
            Predicate::new("EmployeeID", "eq", 3)
                .unwrap()
                .or(&heavy.and(&starts_with_r)),
            "(EmployeeID eq 3) or ((Freight gt 50m) and (startswith(ShipCity,'R') eq true))".into(),
            vec![3, 4, 6],
        ),
        (
            Predicate::new("Customer.CompanyName", "eq", ALFREDS).unwrap(),
            "Customer/CompanyName eq 'Alfreds'".into(),
            vec![1, 2],
        ),
    ];

    for (predicate, odata, expected) in cases {
        assert_eq!(predicate.to_odata(store, Some("Order")).unwrap(), odata);
        assert_eq!(local_order_ids(&em, &predicate), expected, "local result for {}", odata);
    }
}

#[test]
fn test_collection_filters_agree_with_rendered_text() {
    let em = northwind();
    let store = em.metadata();
    let any_heavy = Predicate::any("Orders", Predicate::new("Freight", "gt", 50).unwrap());
    let all_light = Predicate::all("Orders", Predicate::new("Freight", "lt", 60).unwrap());

    assert_eq!(
        any_heavy.to_odata(store, Some("Customer")).unwrap(),
        "Orders/any(x1: x1/Freight gt 50m)"
    );
    assert_eq!(local_customer_names(&em, &any_heavy), vec![BON_APP.to_string()]);

    assert_eq!(
        all_light.to_odata(store, Some("Customer")).unwrap(),
        "Orders/all(x1: x1/Freight lt 60m)"
    );
    // a customer without orders satisfies "all"
    assert_eq!(
        local_customer_names(&em, &all_light),
        vec![ALFREDS.to_string(), CHOP_SUEY.to_string()]
    );
    assert_eq!(
        local_customer_names(&em, &all_light.not()),
        vec![BON_APP.to_string()]
    );
}

#[test]
fn test_rendered_comparison_reparses_to_the_same_filter() {
    let em = northwind();
    let store = em.metadata();
    let comparisons = [
        Predicate::new("Freight", "gt", 50).unwrap(),
        Predicate::new("Freight", "LessThanOrEqual", 40).unwrap(),
        Predicate::new("EmployeeID", "==", 4).unwrap(),
        Predicate::new("ShipCity", "!=", "Lyon").unwrap(),
        Predicate::new("ShipCity", "eq", "O'Neil").unwrap(),
    ];

    for predicate in comparisons {
        let rendered = predicate.to_odata(store, Some("Order")).unwrap();
        let mut parts = rendered.splitn(3, ' ');
        let (left, operator, right) = (
            parts.next().unwrap(),
            parts.next().unwrap(),
            parts.next().unwrap(),
        );
        let value = match FnNode::parse(right).unwrap() {
            FnNode::Literal { value, .. } => value,
            other => panic!("expected a literal in '{}', got {:?}", rendered, other),
        };
        let reparsed = Predicate::new(left, operator, Operand::Literal(value)).unwrap();

        assert_eq!(reparsed.operator(), predicate.operator());
        assert_eq!(reparsed.to_odata(store, Some("Order")).unwrap(), rendered);
        assert_eq!(local_order_ids(&em, &reparsed), local_order_ids(&em, &predicate));
    }
}
