use serde::{Deserialize, Serialize};

/// Conflict rule when server data meets a cached entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MergeStrategy {
    /// Server values replace local values, local changes are discarded.
    OverwriteChanges,
    /// Added, modified and deleted entities keep their local values.
    /// Relationships are still linked.
    #[default]
    PreserveChanges,
}

/// Where `execute_query` looks for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FetchStrategy {
    #[default]
    FromServer,
    FromLocalCache,
}

/// Entity manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Name of the remote service, passed to the data service on every call.
    pub service_name: String,

    /// Default merge strategy for queries and imports.
    pub merge_strategy: MergeStrategy,

    /// Default fetch strategy for `execute_query`.
    pub fetch_strategy: FetchStrategy,

    /// Allow a save to include entities that are still being saved.
    pub allow_concurrent_saves: bool,

    /// Run registered validators before every save.
    pub validate_on_save: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            merge_strategy: MergeStrategy::PreserveChanges,
            fetch_strategy: FetchStrategy::FromServer,
            allow_concurrent_saves: false,
            validate_on_save: true,
        }
    }
}

impl ManagerConfig {
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            ..Self::default()
        }
    }

    pub fn merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }

    pub fn fetch_strategy(mut self, strategy: FetchStrategy) -> Self {
        self.fetch_strategy = strategy;
        self
    }

    pub fn allow_concurrent_saves(mut self, allow: bool) -> Self {
        self.allow_concurrent_saves = allow;
        self
    }

    pub fn validate_on_save(mut self, validate: bool) -> Self {
        self.validate_on_save = validate;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.service_name.trim() != self.service_name {
            return Err("service_name cannot have surrounding whitespace".to_string());
        }
        Ok(())
    }
}

/// Per-query overrides of the manager defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryOptions {
    pub merge_strategy: Option<MergeStrategy>,
    pub fetch_strategy: Option<FetchStrategy>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = Some(strategy);
        self
    }

    pub fn fetch_strategy(mut self, strategy: FetchStrategy) -> Self {
        self.fetch_strategy = Some(strategy);
        self
    }
}

/// Per-save options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// Overrides `ManagerConfig::allow_concurrent_saves` when set.
    pub allow_concurrent_saves: Option<bool>,
    /// Resource the save is posted to; the data service default when unset.
    pub resource_name: Option<String>,
    /// Opaque value handed to the data service.
    pub tag: Option<String>,
}

impl SaveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_concurrent_saves(mut self, allow: bool) -> Self {
        self.allow_concurrent_saves = Some(allow);
        self
    }

    pub fn resource_name(mut self, name: &str) -> Self {
        self.resource_name = Some(name.to_string());
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.merge_strategy, MergeStrategy::PreserveChanges);
        assert_eq!(config.fetch_strategy, FetchStrategy::FromServer);
        assert!(!config.allow_concurrent_saves);
        assert!(config.validate_on_save);
    }

    #[test]
    fn test_builder() {
        let config = ManagerConfig::new("northwind")
            .merge_strategy(MergeStrategy::OverwriteChanges)
            .allow_concurrent_saves(true);
        assert_eq!(config.service_name, "northwind");
        assert!(config.allow_concurrent_saves);
        assert!(config.validate().is_ok());
        assert!(ManagerConfig::new(" northwind").validate().is_err());
    }
}
