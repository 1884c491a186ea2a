/// Export / import tests
///
/// Snapshotting a manager to JSON and loading it into another one.
/// Run with: cargo test --test export_tests

mod common;

use std::sync::Arc;

use common::manager;
use entitycache::manager::ExportDocument;
use entitycache::prelude::*;

#[test]
fn test_export_into_fresh_manager() {
    let mut source = manager();
    let key = uuid::Uuid::new_v4();
    let customer = source
        .attach_entity(
            Entity::new("Northwind.Customer")
                .with_value("CustomerID", key)
                .with_value("CompanyName", "Folk och fä"),
            EntityState::Unchanged,
        )
        .unwrap();
    let order = source.create_entity("Order").unwrap();
    let order = source.add_entity(order).unwrap();
    source.set_navigation(order, "Customer", Some(customer)).unwrap();
    source.set_value(customer, "CompanyName", "Folk och fä HB").unwrap();

    let json = source.export_entities(None, true).unwrap();
    let document: ExportDocument = serde_json::from_str(&json).unwrap();
    assert!(document.metadata_store.is_some());
    assert_eq!(document.entity_group_map.len(), 2);
    assert_eq!(document.temp_keys.len(), 1);

    let mut target = EntityManager::new(Arc::new(MetadataStore::new()), ManagerConfig::new("northwind"));
    let imported = target.import_entities(&json, MergeStrategy::PreserveChanges).unwrap();
    assert_eq!(imported.len(), 2);

    let customer = target.find_by_key_values("Customer", vec![Value::Guid(key)]).unwrap().unwrap();
    assert!(customer.state().is_modified());
    assert_eq!(
        customer.aspect().original_values().get("CompanyName"),
        Some(&Value::from("Folk och fä"))
    );
    assert_eq!(customer.related_collection("Orders").len(), 1);

    let order = target.get_entity(customer.related_collection("Orders")[0]).unwrap();
    assert!(order.state().is_added());
    assert!(order.aspect().has_temp_key());
    assert_eq!(target.temp_keys().len(), 1);
}

#[test]
fn test_import_respects_merge_strategy() {
    let mut source = manager();
    let order = source
        .attach_entity(
            Entity::new("Northwind.Order").with_value("OrderID", 1).with_value("Freight", 10.0),
            EntityState::Unchanged,
        )
        .unwrap();
    let json = source.export_entities(Some(&[order][..]), false).unwrap();

    let mut target = manager();
    let local = target
        .attach_entity(
            Entity::new("Northwind.Order").with_value("OrderID", 1).with_value("Freight", 10.0),
            EntityState::Unchanged,
        )
        .unwrap();
    target.set_value(local, "Freight", 55.0).unwrap();

    let ids = target.import_entities(&json, MergeStrategy::PreserveChanges).unwrap();
    assert_eq!(ids, vec![local]);
    assert_eq!(target.get_entity(local).unwrap().get("Freight"), &Value::Double(55.0));

    target.import_entities(&json, MergeStrategy::OverwriteChanges).unwrap();
    let merged = target.get_entity(local).unwrap();
    assert_eq!(merged.get("Freight"), &Value::Double(10.0));
    assert!(merged.state().is_unchanged());
}

#[test]
fn test_export_of_unknown_entity_fails() {
    let source = manager();
    let stray = Entity::new("Northwind.Order").id();
    assert!(matches!(
        source.export_entities(Some(&[stray][..]), false),
        Err(CacheError::EntityNotFound(id)) if id == stray
    ));
}
