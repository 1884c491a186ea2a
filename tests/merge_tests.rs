/// Merge tests
///
/// Identity resolution, merge strategies and graph fixup while query
/// results are merged into the cache.
/// Run with: cargo test --test merge_tests

mod common;

use common::{ScriptedService, manager_with};
use entitycache::prelude::*;
use entitycache::transport::QueryResponse;
use serde_json::json;

fn customer_node(id: &str, key: uuid::Uuid, name: &str) -> serde_json::Value {
    json!({"$id": id, "$type": "Northwind.Customer", "CustomerID": key.to_string(), "CompanyName": name})
}

#[tokio::test]
async fn test_merging_twice_is_idempotent() {
    let service = ScriptedService::new();
    let key = uuid::Uuid::new_v4();
    for _ in 0..2 {
        service.push_query(Ok(QueryResponse::new(vec![customer_node("1", key, "Alfreds")])));
    }
    let mut em = manager_with(service);

    let first = em.execute_query(&EntityQuery::from("Customers")).await.unwrap();
    let second = em.execute_query(&EntityQuery::from("Customers")).await.unwrap();
    assert_eq!(first.entity_ids(), second.entity_ids());
    assert_eq!(em.len(), 1);
    assert!(!em.has_changes());
}

#[tokio::test]
async fn test_references_resolve_in_either_order() {
    let service = ScriptedService::new();
    let key = uuid::Uuid::new_v4();
    service.push_query(Ok(QueryResponse::new(vec![
        json!({"$ref": "1"}),
        customer_node("1", key, "Alfreds"),
    ])));
    service.push_query(Ok(QueryResponse::new(vec![
        customer_node("7", key, "Alfreds"),
        json!({"$ref": "7"}),
    ])));
    let mut em = manager_with(service);

    for _ in 0..2 {
        let result = em.execute_query(&EntityQuery::from("Customers")).await.unwrap();
        let ids = result.entity_ids();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1]);
    }
    assert_eq!(em.len(), 1);
}

#[tokio::test]
async fn test_nested_graph_is_linked() {
    let service = ScriptedService::new();
    let key = uuid::Uuid::new_v4();
    service.push_query(Ok(QueryResponse::new(vec![
        json!({"OrderID": 1, "CustomerID": key.to_string(), "Customer": customer_node("c", key, "Alfreds")}),
        json!({"OrderID": 2, "CustomerID": key.to_string(), "Customer": {"$ref": "c"}}),
    ])));
    let mut em = manager_with(service);

    let result = em
        .execute_query(&EntityQuery::from("Orders").expand("Customer"))
        .await
        .unwrap();
    let orders = result.entity_ids();
    assert_eq!(orders.len(), 2);

    let customer = em.find_by_key_values("Customer", vec![Value::Guid(key)]).unwrap().unwrap();
    let mut linked = customer.related_collection("Orders").to_vec();
    linked.sort();
    assert_eq!(linked, orders);
    for order in &orders {
        assert_eq!(em.get_entity(*order).unwrap().related("Customer"), Some(customer.id()));
    }
}

#[tokio::test]
async fn test_preserve_and_overwrite_strategies() {
    let service = ScriptedService::new();
    for freight in [10.0, 20.0, 30.0] {
        service.push_query(Ok(QueryResponse::new(vec![json!({"OrderID": 5, "Freight": freight})])));
    }
    let mut em = manager_with(service);
    let query = EntityQuery::from("Orders");

    let id = em.execute_query(&query).await.unwrap().entity_ids()[0];
    em.set_value(id, "Freight", 99.0).unwrap();

    // default strategy keeps the local edit
    em.execute_query(&query).await.unwrap();
    let order = em.get_entity(id).unwrap();
    assert_eq!(order.get("Freight"), &Value::Double(99.0));
    assert!(order.state().is_modified());

    let overwrite = query.using(QueryOptions::new().merge_strategy(MergeStrategy::OverwriteChanges));
    em.execute_query(&overwrite).await.unwrap();
    let order = em.get_entity(id).unwrap();
    assert_eq!(order.get("Freight"), &Value::Double(30.0));
    assert!(order.state().is_unchanged());
    assert!(order.aspect().original_values().is_empty());
}

#[tokio::test]
async fn test_subtype_nodes_share_the_root_key_space() {
    let service = ScriptedService::new();
    service.push_query(Ok(QueryResponse::new(vec![json!({
        "$type": "Northwind.InternationalOrder",
        "OrderID": 9,
        "CustomsDescription": "Books"
    })])));
    let mut em = manager_with(service);

    em.execute_query(&EntityQuery::from("Orders")).await.unwrap();
    let order = em.find_by_key_values("Order", vec![Value::Integer(9)]).unwrap().unwrap();
    assert_eq!(order.entity_type_name(), "Northwind.InternationalOrder");
    assert_eq!(order.get("CustomsDescription"), &Value::from("Books"));

    // a local duplicate under the base type is refused
    let clash = Entity::new("Northwind.Order").with_value("OrderID", 9);
    assert!(matches!(
        em.attach_entity(clash, EntityState::Unchanged),
        Err(CacheError::DuplicateKey(_))
    ));
}

#[tokio::test]
async fn test_notifications_are_published_after_merge() {
    let service = ScriptedService::new();
    service.push_query(Ok(QueryResponse::new(vec![
        json!({"OrderID": 1}),
        json!({"OrderID": 2}),
    ])));
    let mut em = manager_with(service);
    let mut events = em.subscribe();

    em.execute_query(&EntityQuery::from("Orders")).await.unwrap();
    assert!(!em.is_loading());

    let mut attached = 0;
    while let Ok(event) = events.try_recv() {
        if event.action == EntityAction::AttachOnQuery {
            attached += 1;
        }
    }
    assert_eq!(attached, 2);
}

#[tokio::test]
async fn test_projection_rows() {
    let service = ScriptedService::new();
    service.push_query(Ok(QueryResponse::new(vec![
        json!({"Freight": 12.5, "Customer": {"CompanyName": "Alfreds"}}),
    ])));
    let mut em = manager_with(service);

    let result = em
        .execute_query(&EntityQuery::from("Orders").select("Freight, Customer.CompanyName"))
        .await
        .unwrap();
    assert!(result.entity_ids().is_empty());
    match &result.results[0] {
        QueryRow::Projection(row) => {
            assert_eq!(row["Freight"], ProjectionValue::Value(Value::Double(12.5)));
            assert_eq!(row["Customer_CompanyName"], ProjectionValue::Value(Value::from("Alfreds")));
        }
        other => panic!("expected a projection row, got {:?}", other),
    }
    assert!(em.is_empty());
}

#[tokio::test]
async fn test_failed_merge_leaves_cache_untouched() {
    let service = ScriptedService::new();
    let key = uuid::Uuid::new_v4();
    service.push_query(Ok(QueryResponse::new(vec![customer_node("1", key, "Alfreds")])));
    service.push_query(Ok(QueryResponse::new(vec![
        customer_node("1", key, "Renamed"),
        customer_node("2", uuid::Uuid::new_v4(), "Bon app'"),
        json!({"$type": "Northwind.Customer", "CompanyName": "no key"}),
    ])));
    let mut em = manager_with(service);
    em.execute_query(&EntityQuery::from("Customers")).await.unwrap();
    let mut events = em.subscribe();

    let err = em.execute_query(&EntityQuery::from("Customers")).await.unwrap_err();
    assert!(matches!(err, CacheError::MergeInconsistency(_)));
    assert_eq!(em.len(), 1);
    assert_eq!(em.entities_of_type("Customer").unwrap().len(), 1);
    let customer = em.find_by_key_values("Customer", vec![Value::Guid(key)]).unwrap().unwrap();
    assert_eq!(customer.get("CompanyName"), &Value::from("Alfreds"));
    assert!(customer.state().is_unchanged());
    assert!(!em.is_loading());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_child_nodes_before_their_parent_are_linked() {
    let service = ScriptedService::new();
    let key = uuid::Uuid::new_v4();
    service.push_query(Ok(QueryResponse::new(vec![
        json!({"OrderID": 1, "Customer": {"$ref": "c"}}),
        json!({"OrderID": 2, "CustomerID": key.to_string(), "Customer": {"$ref": "c"}}),
        customer_node("c", key, "Alfreds"),
    ])));
    let mut em = manager_with(service);

    let result = em
        .execute_query(&EntityQuery::from("Orders").expand("Customer"))
        .await
        .unwrap();
    assert_eq!(result.entity_ids().len(), 3);

    let customer = em
        .find_by_key_values("Customer", vec![Value::Guid(key)])
        .unwrap()
        .map(Entity::id)
        .unwrap();
    for order_id in [1, 2] {
        let order = em.find_by_key_values("Order", vec![Value::Integer(order_id)]).unwrap().unwrap();
        assert_eq!(order.related("Customer"), Some(customer));
        assert_eq!(order.get("CustomerID"), &Value::Guid(key));
        assert!(order.state().is_unchanged());
    }
    let mut linked = em.get_entity(customer).unwrap().related_collection("Orders").to_vec();
    linked.sort();
    assert_eq!(linked.len(), 2);
    assert!(!em.has_changes());
}
