//! Part registry: maps configured type names to constructors.

use crate::ConfigError;
use labflow_proto::{ExecutionPolicy, Part, PartKind, Value};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds a part instance from its configuration values.
pub type PartFactory =
    Arc<dyn Fn(&ConfigValues<'_>) -> Result<Arc<dyn Part>, ConfigError> + Send + Sync>;

/// How a registered type produces its parts.
#[derive(Clone)]
pub enum PartConstructor {
    Step(PartFactory),
    Decision(PartFactory),
    /// Flows have no logic of their own; only the policy differs.
    Flow(ExecutionPolicy),
}

/// A registered part type.
#[derive(Clone)]
pub struct PartType {
    pub name: String,
    pub description: String,
    pub constructor: PartConstructor,
}

impl PartType {
    pub fn kind(&self) -> PartKind {
        match self.constructor {
            PartConstructor::Step(_) => PartKind::Step,
            PartConstructor::Decision(_) => PartKind::Decision,
            PartConstructor::Flow(_) => PartKind::Flow,
        }
    }
}

impl std::fmt::Debug for PartType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartType")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

/// Typed access to a part's `config_values` during construction.
pub struct ConfigValues<'a> {
    part: &'a str,
    values: &'a serde_json::Map<String, Value>,
}

impl<'a> ConfigValues<'a> {
    pub fn new(part: &'a str, values: &'a serde_json::Map<String, Value>) -> Self {
        Self { part, values }
    }

    /// Identifier of the part being built, for error messages.
    pub fn part(&self) -> &str {
        self.part
    }

    /// Reads a required value.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, ConfigError> {
        self.get_optional(name)?
            .ok_or_else(|| ConfigError::MissingConfigValue {
                part: self.part.to_string(),
                name: name.to_string(),
            })
    }

    /// Reads a value that may be absent.
    pub fn get_optional<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, ConfigError> {
        self.values
            .get(name)
            .map(|value| {
                serde_json::from_value(value.clone()).map_err(|e| ConfigError::InvalidConfigValue {
                    part: self.part.to_string(),
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    /// Builds an `InvalidConfigValue` error for this part.
    pub fn invalid(&self, name: &str, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidConfigValue {
            part: self.part.to_string(),
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn raw(&self) -> &serde_json::Map<String, Value> {
        self.values
    }
}

/// Registry of the part types an experiment may use.
#[derive(Debug, Default, Clone)]
pub struct PartRegistry {
    types: HashMap<String, PartType>,
}

impl PartRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in part types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::parts::register_builtins(&mut registry);
        registry
    }

    /// Registers a type, replacing any previous type of the same name.
    pub fn register(&mut self, part_type: PartType) {
        self.types.insert(part_type.name.clone(), part_type);
    }

    pub fn register_step<F>(&mut self, name: &str, description: &str, factory: F)
    where
        F: Fn(&ConfigValues<'_>) -> Result<Arc<dyn Part>, ConfigError> + Send + Sync + 'static,
    {
        self.register(PartType {
            name: name.to_string(),
            description: description.to_string(),
            constructor: PartConstructor::Step(Arc::new(factory)),
        });
    }

    pub fn register_decision<F>(&mut self, name: &str, description: &str, factory: F)
    where
        F: Fn(&ConfigValues<'_>) -> Result<Arc<dyn Part>, ConfigError> + Send + Sync + 'static,
    {
        self.register(PartType {
            name: name.to_string(),
            description: description.to_string(),
            constructor: PartConstructor::Decision(Arc::new(factory)),
        });
    }

    pub fn register_flow(&mut self, name: &str, description: &str, policy: ExecutionPolicy) {
        self.register(PartType {
            name: name.to_string(),
            description: description.to_string(),
            constructor: PartConstructor::Flow(policy),
        });
    }

    /// Gets a type by name.
    pub fn get(&self, name: &str) -> Option<&PartType> {
        self.types.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Returns the number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns true if no types are registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtins_registered() {
        let registry = PartRegistry::with_builtins();
        for name in [
            "step.set",
            "step.expression",
            "step.dump",
            "decision.conditional",
            "flow.standard",
            "flow.parallel",
        ] {
            assert!(registry.contains(name), "missing builtin {name}");
        }
        assert_eq!(registry.get("flow.parallel").unwrap().kind(), PartKind::Flow);
        assert_eq!(
            registry.get("decision.conditional").unwrap().kind(),
            PartKind::Decision
        );
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = PartRegistry::new();
        registry.register_flow("flow.x", "first", ExecutionPolicy::Sequential);
        registry.register_flow("flow.x", "second", ExecutionPolicy::Parallel);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("flow.x").unwrap().description, "second");
    }

    #[test]
    fn test_config_values_access() {
        let map = json!({"count": 3, "label": "x"});
        let map = map.as_object().unwrap();
        let values = ConfigValues::new("p", map);
        assert_eq!(values.get::<u32>("count").unwrap(), 3);
        assert_eq!(values.get_optional::<String>("absent").unwrap(), None);
        assert!(matches!(
            values.get::<u32>("absent"),
            Err(ConfigError::MissingConfigValue { .. })
        ));
        assert!(matches!(
            values.get::<u32>("label"),
            Err(ConfigError::InvalidConfigValue { .. })
        ));
    }
}
