use crate::ConfigError;
use crate::registry::ConfigValues;
use indexmap::IndexMap;
use labflow_proto::{Outputs, Part, PartContext, PartOutput, PartResult, Value};

/// `step.set`: emits constant results.
#[derive(Debug, Clone)]
pub struct SetValues {
    values: IndexMap<String, Value>,
}

impl SetValues {
    pub fn new(values: IndexMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn from_config(config: &ConfigValues<'_>) -> Result<Self, ConfigError> {
        Ok(Self::new(config.get("values")?))
    }
}

impl Part for SetValues {
    fn execute(&self, _ctx: &PartContext<'_>) -> PartResult {
        let mut outputs = Outputs::new();
        for (name, value) in &self.values {
            outputs.insert(name.clone(), value.clone());
        }
        Ok(PartOutput::Outputs(outputs))
    }
}
