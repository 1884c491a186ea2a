// ============================================================================
// Transport boundary
// ============================================================================
//
// The cache never performs I/O. A `DataService` implementation carries
// rendered queries and save batches to the server and returns raw JSON
// nodes; a `JsonResultsAdapter` tells the merge pipeline how to read those
// nodes.
//
// ============================================================================

pub mod adapter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{Result, Value};
use crate::entity::{EntityId, EntityState};
use crate::metadata::MetadataDocument;

pub use adapter::{DefaultResultsAdapter, JsonResultsAdapter, NodeContext, NodeMeta};

/// A query ready to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub service_name: String,
    /// Resource path and unencoded query options.
    pub uri: String,
    pub resource_name: String,
    pub entity_type_name: Option<String>,
    pub inline_count: bool,
}

/// Raw result of a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub results: Vec<serde_json::Value>,
    #[serde(default)]
    pub inline_count: Option<usize>,
}

impl QueryResponse {
    pub fn new(results: Vec<serde_json::Value>) -> Self {
        Self {
            results,
            inline_count: None,
        }
    }

    pub fn with_inline_count(mut self, count: usize) -> Self {
        self.inline_count = Some(count);
        self
    }
}

/// One entity in a save batch, with server-side property names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveEntity {
    pub entity_id: EntityId,
    pub entity_type_name: String,
    #[serde(with = "state_name")]
    pub state: EntityState,
    pub values: serde_json::Map<String, serde_json::Value>,
    pub original_values: serde_json::Map<String, serde_json::Value>,
    pub has_temp_key: bool,
}

/// A save batch ready to be sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequest {
    pub service_name: String,
    pub resource_name: Option<String>,
    pub tag: Option<String>,
    pub entities: Vec<SaveEntity>,
}

/// A temporary key value the server replaced with a real one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMapping {
    pub entity_type_name: String,
    pub temp_value: Value,
    pub real_value: Value,
}

impl KeyMapping {
    pub fn new(entity_type_name: &str, temp_value: impl Into<Value>, real_value: impl Into<Value>) -> Self {
        Self {
            entity_type_name: entity_type_name.to_string(),
            temp_value: temp_value.into(),
            real_value: real_value.into(),
        }
    }
}

/// Raw result of a save: the saved entities as the server now sees them,
/// plus the key fixups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResult {
    pub entities: Vec<serde_json::Value>,
    #[serde(default)]
    pub key_mappings: Vec<KeyMapping>,
}

/// Remote data service. Implementations own retries, authentication and
/// the wire format; errors are reported back annotated with the operation.
#[async_trait]
pub trait DataService: Send + Sync {
    async fn fetch_metadata(&self, service_name: &str) -> Result<MetadataDocument>;

    async fn execute_query(&self, request: &QueryRequest) -> Result<QueryResponse>;

    async fn save_changes(&self, request: &SaveRequest) -> Result<SaveResult>;
}

mod state_name {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::entity::EntityState;

    pub fn serialize<S: Serializer>(state: &EntityState, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&state.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<EntityState, D::Error> {
        let name = String::deserialize(deserializer)?;
        EntityState::from_name(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown entity state '{}'", name)))
    }
}
