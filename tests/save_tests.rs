/// Save tests
///
/// Save batches, key fixup, concurrency bumping and failure handling.
/// Run with: cargo test --test save_tests

mod common;

use common::{ScriptedService, manager, manager_with};
use entitycache::prelude::*;
use serde_json::json;

fn new_customer(em: &mut EntityManager, name: &str) -> EntityId {
    let customer = em.create_entity("Customer").unwrap();
    let id = em.add_entity(customer).unwrap();
    em.set_value(id, "CompanyName", name).unwrap();
    id
}

#[tokio::test]
async fn test_save_fixes_up_temporary_keys() {
    let service = ScriptedService::new();
    let mut em = manager_with(service.clone());

    let customer = new_customer(&mut em, "Around the Horn");
    let temp_customer = em.get_entity(customer).unwrap().get("CustomerID").clone();
    let order = em.create_entity("Order").unwrap();
    let order = em.add_entity(order).unwrap();
    em.set_navigation(order, "Customer", Some(customer)).unwrap();
    let temp_order = em.get_entity(order).unwrap().get("OrderID").clone();
    assert_eq!(temp_order, Value::Integer(-2));
    let detail = Entity::new("Northwind.OrderDetail")
        .with_value("OrderID", temp_order)
        .with_value("ProductID", 11)
        .with_value("Quantity", 3);
    let detail = em.add_entity(detail).unwrap();
    assert_eq!(em.get_entity(detail).unwrap().related("Order"), Some(order));
    assert_eq!(em.temp_keys().len(), 2);

    let real_customer = uuid::Uuid::new_v4();
    service.push_save(Ok(SaveResult {
        entities: vec![json!({
            "$type": "Northwind.Order",
            "OrderID": 10250,
            "CustomerID": real_customer.to_string(),
            "RowVersion": 1
        })],
        key_mappings: vec![
            KeyMapping::new("Customer", temp_customer, Value::Guid(real_customer)),
            KeyMapping::new("Order", -2, 10250),
        ],
    }));

    let outcome = em.save_changes(None, SaveOptions::new()).await.unwrap();
    assert_eq!(service.save_log.lock().unwrap()[0].entities.len(), 3);
    assert_eq!(outcome.key_mappings.len(), 2);

    let saved = em.get_entity(order).unwrap();
    assert_eq!(saved.get("OrderID"), &Value::Integer(10250));
    assert_eq!(saved.get("CustomerID"), &Value::Guid(real_customer));
    assert_eq!(saved.get("RowVersion"), &Value::Integer(1));
    assert_eq!(em.get_entity(detail).unwrap().get("OrderID"), &Value::Integer(10250));
    assert!(!em.has_changes());
    assert!(em.temp_keys().is_empty());

    // links survive and the real keys are indexed
    assert_eq!(em.get_entity(detail).unwrap().related("Order"), Some(order));
    assert_eq!(
        em.find_by_key_values("OrderDetail", vec![Value::Integer(10250), Value::Integer(11)])
            .unwrap()
            .map(|e| e.id()),
        Some(detail)
    );
}

#[tokio::test]
async fn test_modified_entity_gets_one_concurrency_bump() {
    let service = ScriptedService::new();
    let mut em = manager_with(service.clone());
    let order = em
        .attach_entity(
            Entity::new("Northwind.Order").with_value("OrderID", 4).with_value("RowVersion", 7),
            EntityState::Unchanged,
        )
        .unwrap();
    em.set_value(order, "Freight", 12.0).unwrap();

    em.save_changes(None, SaveOptions::new()).await.unwrap();
    let sent = &service.save_log.lock().unwrap()[0].entities[0];
    assert_eq!(sent.values["RowVersion"], json!(8));
    assert_eq!(sent.original_values["RowVersion"], json!(7));
    assert_eq!(sent.state, EntityState::Modified);
    assert!(em.get_entity(order).unwrap().state().is_unchanged());
}

#[tokio::test]
async fn test_save_rejections() {
    let service = ScriptedService::new();
    let mut em = manager_with(service.clone());
    let mut other = manager();

    let stranger = other.create_entity("Customer").unwrap();
    let stranger = other.add_entity(stranger).unwrap();
    assert!(matches!(
        em.save_changes(Some(&[stranger][..]), SaveOptions::new()).await,
        Err(CacheError::CrossManagerSave(ids)) if ids == vec![stranger]
    ));

    let customer = new_customer(&mut em, "Blondel");
    let in_flight = em.prepare_save(None, &SaveOptions::new()).unwrap();
    assert!(matches!(
        em.save_changes(None, SaveOptions::new()).await,
        Err(CacheError::ConcurrentSaveRejected(ids)) if ids == vec![customer]
    ));
    em.abort_save(&in_flight);

    em.set_value(customer, "CompanyName", "x".repeat(41)).unwrap();
    assert!(matches!(
        em.save_changes(None, SaveOptions::new()).await,
        Err(CacheError::ValidationFailed { .. })
    ));
    assert!(service.save_log.lock().unwrap().is_empty());
}

#[test]
fn test_missing_key_is_refused() {
    let mut em = manager();
    let product = em.create_entity("Product").unwrap();
    assert!(matches!(em.add_entity(product), Err(CacheError::MissingKey(_))));
    assert!(em.is_empty());
}

#[tokio::test]
async fn test_transport_failure_leaves_changes_pending() {
    let service = ScriptedService::new();
    service.push_save(Err(CacheError::Serialization("connection reset".to_string())));
    let mut em = manager_with(service.clone());
    let customer = new_customer(&mut em, "Bottom-Dollar");

    match em.save_changes(None, SaveOptions::new()).await {
        Err(CacheError::Transport { operation, .. }) => assert_eq!(operation, "save (1 entities)"),
        other => panic!("expected a transport error, got {:?}", other),
    }
    let entity = em.get_entity(customer).unwrap();
    assert!(entity.state().is_added());
    assert!(!entity.aspect().is_being_saved());

    // retry goes through
    em.save_changes(None, SaveOptions::new()).await.unwrap();
    assert!(em.get_entity(customer).unwrap().state().is_unchanged());
}

#[tokio::test]
async fn test_deleted_entities_leave_the_cache() {
    let service = ScriptedService::new();
    let mut em = manager_with(service);
    let order = em
        .attach_entity(Entity::new("Northwind.Order").with_value("OrderID", 3), EntityState::Unchanged)
        .unwrap();
    em.delete_entity(order).unwrap();

    let outcome = em.save_changes(None, SaveOptions::new()).await.unwrap();
    assert_eq!(outcome.entities, vec![order]);
    assert!(em.get_entity(order).is_none());
    assert!(em.find_by_key_values("Order", vec![Value::Integer(3)]).unwrap().is_none());
}
