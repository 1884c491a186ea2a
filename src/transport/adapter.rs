use crate::metadata::MetadataStore;

/// Where a raw node sits in the response being merged.
#[derive(Clone, Copy)]
pub struct NodeContext<'a> {
    pub store: &'a MetadataStore,
    /// Type expected at this position: the query's type for top-level
    /// nodes, the navigation target for nested ones.
    pub expected_type: Option<&'a str>,
    /// Navigation property the node was read from, if nested.
    pub navigation: Option<&'a str>,
}

/// What the adapter learned about a raw node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeMeta {
    /// Qualified entity type, when the node is an entity.
    pub entity_type: Option<String>,
    /// Response-local id other nodes may reference.
    pub node_id: Option<String>,
    /// Set when the node only references another node in the response.
    pub node_ref_id: Option<String>,
    pub ignore: bool,
    /// Kept on the entity's aspect (e.g. a location URI).
    pub extra_metadata: Option<serde_json::Value>,
}

/// Reads the shape of raw result nodes for the merge pipeline.
pub trait JsonResultsAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn visit_node(&self, node: &serde_json::Value, context: &NodeContext<'_>) -> NodeMeta;

    /// True for keys that describe the node rather than hold data.
    fn is_annotation(&self, key: &str) -> bool {
        key.starts_with('$') || key.starts_with("__")
    }
}

/// Understands `$type`, `$id` and `$ref` annotations as well as OData v2
/// `__metadata` blocks and `__deferred` links.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResultsAdapter;

impl JsonResultsAdapter for DefaultResultsAdapter {
    fn name(&self) -> &str {
        "default"
    }

    fn visit_node(&self, node: &serde_json::Value, context: &NodeContext<'_>) -> NodeMeta {
        let Some(object) = node.as_object() else {
            return NodeMeta::default();
        };
        if object.contains_key("__deferred") {
            return NodeMeta {
                ignore: true,
                ..NodeMeta::default()
            };
        }

        let str_field = |key: &str| object.get(key).and_then(|v| v.as_str()).map(str::to_string);
        let metadata = object.get("__metadata");
        let declared_type = str_field("$type").or_else(|| {
            metadata
                .and_then(|m| m.get("type"))
                .and_then(|t| t.as_str())
                .map(str::to_string)
        });

        let entity_type = declared_type
            .as_deref()
            // .NET style "Namespace.Type, Assembly"
            .map(|t| t.split(',').next().unwrap_or(t).trim())
            .and_then(|t| context.store.find_entity_type(t))
            .or_else(|| context.expected_type.and_then(|t| context.store.find_entity_type(t)))
            .map(|t| t.name().to_string());

        let extra_metadata = metadata
            .and_then(|m| m.get("uri"))
            .map(|uri| serde_json::json!({ "uri": uri }));

        NodeMeta {
            entity_type,
            node_id: str_field("$id"),
            node_ref_id: str_field("$ref"),
            ignore: false,
            extra_metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::metadata::{DataProperty, StructuralTypeDef};
    use serde_json::json;

    fn store() -> MetadataStore {
        let mut store = MetadataStore::new();
        store
            .register_type(
                StructuralTypeDef::entity("Order", "Northwind")
                    .data_property(DataProperty::new("OrderID", DataType::Int32).key()),
            )
            .unwrap();
        store
    }

    #[test]
    fn test_reads_annotations() {
        let store = store();
        let ctx = NodeContext {
            store: &store,
            expected_type: None,
            navigation: None,
        };
        let meta = DefaultResultsAdapter.visit_node(
            &json!({"$id": "1", "$type": "Northwind.Order, Model", "OrderID": 5}),
            &ctx,
        );
        assert_eq!(meta.entity_type.as_deref(), Some("Northwind.Order"));
        assert_eq!(meta.node_id.as_deref(), Some("1"));

        let meta = DefaultResultsAdapter.visit_node(&json!({"$ref": "1"}), &ctx);
        assert_eq!(meta.node_ref_id.as_deref(), Some("1"));
        assert!(meta.entity_type.is_none());

        let meta = DefaultResultsAdapter.visit_node(&json!({"__deferred": {"uri": "x"}}), &ctx);
        assert!(meta.ignore);
    }

    #[test]
    fn test_falls_back_to_expected_type() {
        let store = store();
        let ctx = NodeContext {
            store: &store,
            expected_type: Some("Order"),
            navigation: None,
        };
        let meta = DefaultResultsAdapter.visit_node(
            &json!({"OrderID": 5, "__metadata": {"uri": "Orders(5)"}}),
            &ctx,
        );
        assert_eq!(meta.entity_type.as_deref(), Some("Northwind.Order"));
        assert_eq!(meta.extra_metadata, Some(json!({"uri": "Orders(5)"})));
    }
}
