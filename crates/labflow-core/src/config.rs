//! Experiment configuration loaded from YAML.

use indexmap::IndexMap;
use labflow_proto::{PartId, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Top-level experiment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub experiment: ExperimentSection,

    /// Top-level parts, in declaration order.
    #[serde(default)]
    pub parts: IndexMap<String, PartConfig>,
}

/// The `experiment:` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSection {
    pub name: String,

    /// First part to run. Defaults to the first declared top-level part.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_here: Option<String>,

    /// Root directory for run directories.
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,

    /// Values the data store holds when a run is created.
    #[serde(default)]
    pub initial_values: IndexMap<String, Value>,

    /// Default per-branch timeout for parallel flows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_timeout_seconds: Option<u64>,
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("runs")
}

/// Configuration of one part.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartConfig {
    pub type_name: String,

    /// Opaque values handed to the part type's constructor.
    #[serde(default)]
    pub config_values: serde_json::Map<String, Value>,

    /// Store key -> argument name.
    #[serde(default)]
    pub input_names: IndexMap<String, String>,

    /// Result name -> store key.
    #[serde(default)]
    pub output_names: IndexMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_part: Option<NextPartConfig>,

    /// Members of a flow, in declaration order.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub parts: IndexMap<String, PartConfig>,
}

/// `next_part`: a single target for steps and flows, a route map for decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NextPartConfig {
    Single(String),
    Routes(IndexMap<String, String>),
}

impl PartConfig {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            ..Self::default()
        }
    }

    pub fn config_value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config_values.insert(name.into(), value.into());
        self
    }

    pub fn input(mut self, store_key: impl Into<String>, arg: impl Into<String>) -> Self {
        self.input_names.insert(store_key.into(), arg.into());
        self
    }

    pub fn output(mut self, result: impl Into<String>, store_key: impl Into<String>) -> Self {
        self.output_names.insert(result.into(), store_key.into());
        self
    }

    pub fn next(mut self, target: impl Into<String>) -> Self {
        self.next_part = Some(NextPartConfig::Single(target.into()));
        self
    }

    pub fn route(mut self, route: impl Into<String>, target: impl Into<String>) -> Self {
        let mut routes = match self.next_part.take() {
            Some(NextPartConfig::Routes(routes)) => routes,
            _ => IndexMap::new(),
        };
        routes.insert(route.into(), target.into());
        self.next_part = Some(NextPartConfig::Routes(routes));
        self
    }

    pub fn member(mut self, name: impl Into<String>, part: PartConfig) -> Self {
        self.parts.insert(name.into(), part);
        self
    }

    /// Targets named by `next_part`, in declaration order.
    pub fn targets(&self) -> Vec<&str> {
        match &self.next_part {
            None => Vec::new(),
            Some(NextPartConfig::Single(target)) => vec![target.as_str()],
            Some(NextPartConfig::Routes(routes)) => routes.values().map(String::as_str).collect(),
        }
    }
}

impl ExperimentConfig {
    /// Creates an empty configuration for an experiment.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            experiment: ExperimentSection {
                name: name.into(),
                start_here: None,
                out_dir: default_out_dir(),
                initial_values: IndexMap::new(),
                branch_timeout_seconds: None,
            },
            parts: IndexMap::new(),
        }
    }

    /// Adds a top-level part.
    pub fn part(mut self, name: impl Into<String>, part: PartConfig) -> Self {
        self.parts.insert(name.into(), part);
        self
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        debug!(path = %path_ref.display(), "Loading experiment configuration");
        let content = std::fs::read_to_string(path_ref)?;
        let config = Self::parse_yaml(&content)?;
        debug!(
            experiment = %config.experiment.name,
            top_level_parts = config.parts.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parses configuration from YAML text.
    pub fn parse_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Identifier of the first part to run.
    pub fn start_part(&self) -> Option<PartId> {
        match &self.experiment.start_here {
            Some(start) => Some(PartId::new(start.clone())),
            None => self.parts.keys().next().map(|name| PartId::new(name.clone())),
        }
    }

    /// Every part with its dotted identifier, parents before members.
    pub fn flatten(&self) -> Vec<(PartId, &PartConfig)> {
        fn walk<'a>(
            prefix: Option<&PartId>,
            parts: &'a IndexMap<String, PartConfig>,
            out: &mut Vec<(PartId, &'a PartConfig)>,
        ) {
            for (name, part) in parts {
                let id = match prefix {
                    Some(parent) => parent.child(name),
                    None => PartId::new(name.clone()),
                };
                out.push((id.clone(), part));
                walk(Some(&id), &part.parts, out);
            }
        }

        let mut out = Vec::new();
        walk(None, &self.parts, &mut out);
        out
    }

    /// Validates the configuration and returns non-fatal warnings.
    ///
    /// Dangling `next_part` references are warnings only: they are resolved
    /// lazily when the run reaches them, and routed to manual resolution.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        if self.experiment.name.trim().is_empty() {
            return Err(ConfigError::InvalidName {
                name: self.experiment.name.clone(),
                reason: "experiment name must not be empty".to_string(),
            });
        }
        if self.parts.is_empty() {
            return Err(ConfigError::NoParts);
        }

        let flat = self.flatten();
        for (id, _) in &flat {
            validate_name(id.name())?;
        }

        let mut warnings = Vec::new();
        if let Some(start) = self.start_part()
            && !flat.iter().any(|(id, _)| *id == start)
        {
            warnings.push(ConfigWarning::UnknownStart {
                start: start.to_string(),
            });
        }

        for (id, part) in &flat {
            for target in part.targets() {
                if !resolves(&flat, id, target) {
                    warnings.push(ConfigWarning::DanglingReference {
                        part: id.to_string(),
                        target: target.to_string(),
                    });
                }
            }
            if part.type_name.starts_with("flow.") && part.parts.is_empty() {
                warnings.push(ConfigWarning::EmptyFlow {
                    part: id.to_string(),
                });
            }
        }

        Ok(warnings)
    }
}

fn validate_name(name: &str) -> Result<(), ConfigError> {
    let reason = if name.is_empty() {
        Some("part names must not be empty")
    } else if name.contains('.') {
        Some("part names must not contain '.'; nesting is expressed with `parts:`")
    } else if name == PartId::TERMINAL || name == PartId::LEAVE_FLOW {
        Some("part names must not shadow the routing sentinels 'quit' and 'done'")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(ConfigError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Mirrors the runtime resolution rule: sentinel, sibling, or sibling by
/// absolute identifier.
fn resolves(flat: &[(PartId, &PartConfig)], from: &PartId, target: &str) -> bool {
    if target == PartId::TERMINAL || target == PartId::LEAVE_FLOW {
        return true;
    }
    let parent = from.parent();
    let sibling = match &parent {
        Some(flow) => flow.child(target),
        None => PartId::new(target),
    };
    let absolute = PartId::new(target);
    flat.iter().any(|(id, _)| {
        *id == sibling || (*id == absolute && id.parent() == parent)
    })
}

/// Non-fatal configuration findings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A `next_part` target that does not resolve; reaching it suspends the run.
    DanglingReference { part: String, target: String },
    /// `start_here` names no defined part.
    UnknownStart { start: String },
    /// A flow with no members completes immediately.
    EmptyFlow { part: String },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::DanglingReference { part, target } => write!(
                f,
                "Warning [{part}.next_part]: '{target}' does not resolve to a part in the same flow"
            ),
            ConfigWarning::UnknownStart { start } => {
                write!(f, "Warning [experiment.start_here]: no part named '{start}'")
            }
            ConfigWarning::EmptyFlow { part } => {
                write!(f, "Warning [{part}.parts]: flow has no members")
            }
        }
    }
}

/// Configuration errors, all surfaced before a run begins.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("experiment defines no parts")]
    NoParts,

    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("part '{part}' has unknown type '{type_name}'")]
    UnknownPartType { part: String, type_name: String },

    #[error("part '{part}': {reason}")]
    InvalidPart { part: String, reason: String },

    #[error("part '{part}' is missing config value '{name}'")]
    MissingConfigValue { part: String, name: String },

    #[error("part '{part}' has an invalid config value '{name}': {reason}")]
    InvalidConfigValue {
        part: String,
        name: String,
        reason: String,
    },
}
