//! Shared fixtures for the integration tests: a small Northwind model and a
//! scripted data service.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use entitycache::metadata::{AutoGeneratedKeyType, DataProperty, MetadataDocument, NavigationProperty, StructuralTypeDef};
use entitycache::transport::{DataService, QueryRequest, QueryResponse, SaveRequest, SaveResult};
use entitycache::{CacheError, DataType, EntityManager, ManagerConfig, MetadataStore, Result};

pub fn northwind_store() -> MetadataStore {
    let mut store = MetadataStore::new();
    store
        .register_type(
            StructuralTypeDef::complex("Location", "Northwind")
                .data_property(DataProperty::new("City", DataType::String))
                .data_property(DataProperty::new("Country", DataType::String)),
        )
        .unwrap();
    store
        .register_type(
            StructuralTypeDef::entity("Customer", "Northwind")
                .resource_name("Customers")
                .auto_generated_key(AutoGeneratedKeyType::KeyGenerator)
                .data_property(DataProperty::new("CustomerID", DataType::Guid).key())
                .data_property(DataProperty::new("CompanyName", DataType::String).not_null().with_max_length(40))
                .data_property(DataProperty::complex("Location", "Northwind.Location"))
                .navigation_property(
                    NavigationProperty::collection("Orders", "Order")
                        .association("Customer_Orders")
                        .inverse_foreign_keys(&["CustomerID"]),
                ),
        )
        .unwrap();
    store
        .register_type(
            StructuralTypeDef::entity("Employee", "Northwind")
                .resource_name("Employees")
                .auto_generated_key(AutoGeneratedKeyType::Identity)
                .data_property(DataProperty::new("EmployeeID", DataType::Int32).key())
                .data_property(DataProperty::new("LastName", DataType::String))
                .navigation_property(NavigationProperty::collection("Orders", "Order").association("Employee_Orders")),
        )
        .unwrap();
    store
        .register_type(
            StructuralTypeDef::entity("Order", "Northwind")
                .resource_name("Orders")
                .auto_generated_key(AutoGeneratedKeyType::Identity)
                .data_property(DataProperty::new("OrderID", DataType::Int32).key())
                .data_property(DataProperty::new("CustomerID", DataType::Guid))
                .data_property(DataProperty::new("EmployeeID", DataType::Int32))
                .data_property(DataProperty::new("Freight", DataType::Decimal))
                .data_property(DataProperty::new("ShipCity", DataType::String))
                .data_property(DataProperty::new("OrderDate", DataType::DateTime))
                .data_property(DataProperty::new("RowVersion", DataType::Int32).concurrency())
                .navigation_property(
                    NavigationProperty::scalar("Customer", "Customer")
                        .association("Customer_Orders")
                        .foreign_keys(&["CustomerID"]),
                )
                .navigation_property(
                    NavigationProperty::scalar("Employee", "Employee")
                        .association("Employee_Orders")
                        .foreign_keys(&["EmployeeID"]),
                )
                .navigation_property(
                    NavigationProperty::collection("OrderDetails", "OrderDetail")
                        .association("Order_Details")
                        .inverse_foreign_keys(&["OrderID"]),
                ),
        )
        .unwrap();
    store
        .register_type(
            StructuralTypeDef::entity("InternationalOrder", "Northwind")
                .base_type("Order")
                .data_property(DataProperty::new("CustomsDescription", DataType::String)),
        )
        .unwrap();
    store
        .register_type(
            StructuralTypeDef::entity("Product", "Northwind")
                .resource_name("Products")
                .data_property(DataProperty::new("ProductID", DataType::Int32).key())
                .data_property(DataProperty::new("ProductName", DataType::String)),
        )
        .unwrap();
    store
        .register_type(
            StructuralTypeDef::entity("OrderDetail", "Northwind")
                .resource_name("OrderDetails")
                .data_property(DataProperty::new("OrderID", DataType::Int32).key())
                .data_property(DataProperty::new("ProductID", DataType::Int32).key())
                .data_property(DataProperty::new("Quantity", DataType::Int16).not_null())
                .navigation_property(
                    NavigationProperty::scalar("Order", "Order")
                        .association("Order_Details")
                        .foreign_keys(&["OrderID"]),
                )
                .navigation_property(NavigationProperty::scalar("Product", "Product").foreign_keys(&["ProductID"])),
        )
        .unwrap();
    store
}

/// Data service that replays canned responses and records every request.
#[derive(Default)]
pub struct ScriptedService {
    metadata: Mutex<Option<MetadataDocument>>,
    queries: Mutex<VecDeque<Result<QueryResponse>>>,
    saves: Mutex<VecDeque<Result<SaveResult>>>,
    pub query_log: Mutex<Vec<QueryRequest>>,
    pub save_log: Mutex<Vec<SaveRequest>>,
}

impl ScriptedService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_metadata(document: MetadataDocument) -> Arc<Self> {
        let service = Self::default();
        *service.metadata.lock().unwrap() = Some(document);
        Arc::new(service)
    }

    pub fn push_query(&self, response: Result<QueryResponse>) {
        self.queries.lock().unwrap().push_back(response);
    }

    pub fn push_save(&self, result: Result<SaveResult>) {
        self.saves.lock().unwrap().push_back(result);
    }

    pub fn query_uris(&self) -> Vec<String> {
        self.query_log.lock().unwrap().iter().map(|r| r.uri.clone()).collect()
    }
}

#[async_trait]
impl DataService for ScriptedService {
    async fn fetch_metadata(&self, service_name: &str) -> Result<MetadataDocument> {
        self.metadata.lock().unwrap().clone().ok_or_else(|| CacheError::Transport {
            operation: "metadata".to_string(),
            manager: 0,
            message: format!("no metadata for {}", service_name),
        })
    }

    async fn execute_query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        self.query_log.lock().unwrap().push(request.clone());
        self.queries
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(QueryResponse::new(Vec::new())))
    }

    async fn save_changes(&self, request: &SaveRequest) -> Result<SaveResult> {
        self.save_log.lock().unwrap().push(request.clone());
        self.saves.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(SaveResult {
                entities: Vec::new(),
                key_mappings: Vec::new(),
            })
        })
    }
}

pub fn manager() -> EntityManager {
    EntityManager::new(Arc::new(northwind_store()), ManagerConfig::new("northwind"))
}

pub fn manager_with(service: Arc<ScriptedService>) -> EntityManager {
    manager().with_data_service(service)
}
