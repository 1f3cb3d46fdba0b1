use crate::ConfigError;
use crate::registry::ConfigValues;
use labflow_proto::{Outputs, Part, PartContext, PartOutput, PartResult};
use tracing::info;

/// `step.dump`: logs the data store, optionally limited to one namespace.
#[derive(Debug, Clone, Default)]
pub struct DumpStore {
    namespace: Option<String>,
}

impl DumpStore {
    pub fn from_config(config: &ConfigValues<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            namespace: config.get_optional("namespace")?,
        })
    }
}

impl Part for DumpStore {
    fn execute(&self, ctx: &PartContext<'_>) -> PartResult {
        let entries: Vec<_> = ctx
            .store
            .entries()
            .into_iter()
            .filter(|(key, _)| match &self.namespace {
                Some(ns) => key.strip_prefix(ns.as_str()).is_some_and(|rest| rest.starts_with('.')),
                None => true,
            })
            .collect();

        if entries.is_empty() {
            info!(part = %ctx.part_id, "Data store: (no data)");
        }
        for (key, value) in entries {
            info!(part = %ctx.part_id, %key, %value, "Data store entry");
        }
        Ok(PartOutput::Outputs(Outputs::new()))
    }
}
