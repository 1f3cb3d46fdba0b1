//! The experiment graph: every part instance keyed by its identifier.

use crate::config::{ExperimentConfig, NextPartConfig, PartConfig};
use crate::registry::{ConfigValues, PartConstructor, PartRegistry};
use crate::{ConfigError, DataStore};
use indexmap::IndexMap;
use labflow_proto::{ExecutionPolicy, Part, PartId, PartKind, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Where a part goes after it completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextPart {
    /// No `next_part` declared.
    Unset,
    Single(String),
    /// Decision routes: route name -> target.
    Routes(IndexMap<String, String>),
}

/// The behavior behind a part.
#[derive(Clone)]
pub enum PartBody {
    Step(Arc<dyn Part>),
    Decision(Arc<dyn Part>),
    Flow(FlowBody),
}

/// Members and policy of a flow.
#[derive(Debug, Clone)]
pub struct FlowBody {
    pub policy: ExecutionPolicy,
    /// Member identifiers in declaration order.
    pub members: Vec<PartId>,
    /// `start_here` of a sequential flow; without it the researcher picks
    /// the first member.
    pub start: Option<PartId>,
    /// Per-branch timeout of a parallel flow.
    pub timeout: Option<Duration>,
}

/// One part of the experiment.
#[derive(Clone)]
pub struct PartNode {
    pub id: PartId,
    pub type_name: String,
    /// Store key -> argument name.
    pub input_names: IndexMap<String, String>,
    /// Result name -> store key.
    pub output_names: IndexMap<String, String>,
    pub next: NextPart,
    pub body: PartBody,
}

impl PartNode {
    pub fn kind(&self) -> PartKind {
        match self.body {
            PartBody::Step(_) => PartKind::Step,
            PartBody::Decision(_) => PartKind::Decision,
            PartBody::Flow(_) => PartKind::Flow,
        }
    }

    pub fn policy(&self) -> Option<ExecutionPolicy> {
        match &self.body {
            PartBody::Flow(flow) => Some(flow.policy),
            _ => None,
        }
    }
}

impl std::fmt::Debug for PartNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartNode")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("kind", &self.kind())
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}

/// A fully constructed experiment, ready to run.
#[derive(Debug, Clone)]
pub struct Experiment {
    name: String,
    start: Option<PartId>,
    nodes: IndexMap<PartId, PartNode>,
    top_level: Vec<PartId>,
    initial_values: IndexMap<String, Value>,
    branch_timeout: Option<Duration>,
}

impl Experiment {
    /// Builds every part declared in `config` using the types in `registry`.
    ///
    /// Unknown type names and structurally invalid parts are configuration
    /// errors; dangling `next_part` references are left for the run to hit.
    pub fn from_config(
        config: &ExperimentConfig,
        registry: &PartRegistry,
    ) -> Result<Self, ConfigError> {
        for warning in config.validate()? {
            debug!(%warning, "Configuration warning");
        }

        let mut nodes = IndexMap::new();
        for (id, part) in config.flatten() {
            let node = build_node(&id, part, registry)?;
            nodes.insert(id, node);
        }

        let top_level = config
            .parts
            .keys()
            .map(|name| PartId::new(name.clone()))
            .collect();

        let experiment = Self {
            name: config.experiment.name.clone(),
            start: config.start_part(),
            nodes,
            top_level,
            initial_values: config.experiment.initial_values.clone(),
            branch_timeout: config.experiment.branch_timeout_seconds.map(Duration::from_secs),
        };
        info!(
            experiment = %experiment.name,
            parts = experiment.nodes.len(),
            "Experiment constructed"
        );
        Ok(experiment)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configured first part.
    pub fn start(&self) -> Option<&PartId> {
        self.start.as_ref()
    }

    pub fn get(&self, id: &PartId) -> Option<&PartNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &PartId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Every part identifier in declaration order, parents before members.
    pub fn part_ids(&self) -> impl Iterator<Item = &PartId> {
        self.nodes.keys()
    }

    pub fn top_level(&self) -> &[PartId] {
        &self.top_level
    }

    /// Members of `flow`, or the top-level parts for `None`.
    pub fn members_of(&self, flow: Option<&PartId>) -> &[PartId] {
        match flow {
            None => &self.top_level,
            Some(id) => match self.nodes.get(id).map(|n| &n.body) {
                Some(PartBody::Flow(body)) => &body.members,
                _ => &[],
            },
        }
    }

    pub fn initial_values(&self) -> &IndexMap<String, Value> {
        &self.initial_values
    }

    /// A data store seeded with the initial values.
    pub fn initial_store(&self) -> DataStore {
        DataStore::from_initial(&self.initial_values)
    }

    /// Default per-branch timeout for parallel flows.
    pub fn branch_timeout(&self) -> Option<Duration> {
        self.branch_timeout
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn invalid(id: &PartId, reason: &str) -> ConfigError {
    ConfigError::InvalidPart {
        part: id.to_string(),
        reason: reason.to_string(),
    }
}

fn build_node(
    id: &PartId,
    part: &PartConfig,
    registry: &PartRegistry,
) -> Result<PartNode, ConfigError> {
    let part_type = registry
        .get(&part.type_name)
        .ok_or_else(|| ConfigError::UnknownPartType {
            part: id.to_string(),
            type_name: part.type_name.clone(),
        })?;
    let values = ConfigValues::new(id.as_str(), &part.config_values);

    let next = match &part.next_part {
        None => NextPart::Unset,
        Some(NextPartConfig::Single(target)) => NextPart::Single(target.clone()),
        Some(NextPartConfig::Routes(routes)) => NextPart::Routes(routes.clone()),
    };

    let body = match &part_type.constructor {
        PartConstructor::Step(factory) => {
            if !part.parts.is_empty() {
                return Err(invalid(id, "only flows may declare nested parts"));
            }
            if matches!(next, NextPart::Routes(_)) {
                return Err(invalid(id, "steps take a single next_part, not a route map"));
            }
            PartBody::Step(factory(&values)?)
        }
        PartConstructor::Decision(factory) => {
            if !part.parts.is_empty() {
                return Err(invalid(id, "only flows may declare nested parts"));
            }
            if !part.output_names.is_empty() {
                return Err(invalid(id, "decisions must not declare output_names"));
            }
            if matches!(next, NextPart::Single(_)) {
                return Err(invalid(id, "decisions take a route map as next_part"));
            }
            PartBody::Decision(factory(&values)?)
        }
        PartConstructor::Flow(policy) => {
            if !part.output_names.is_empty() || !part.input_names.is_empty() {
                return Err(invalid(id, "flows do not bind inputs or outputs"));
            }
            if matches!(next, NextPart::Routes(_)) {
                return Err(invalid(id, "flows take a single next_part, not a route map"));
            }
            PartBody::Flow(build_flow(id, part, *policy, &values)?)
        }
    };

    Ok(PartNode {
        id: id.clone(),
        type_name: part.type_name.clone(),
        input_names: part.input_names.clone(),
        output_names: part.output_names.clone(),
        next,
        body,
    })
}

fn build_flow(
    id: &PartId,
    part: &PartConfig,
    policy: ExecutionPolicy,
    values: &ConfigValues<'_>,
) -> Result<FlowBody, ConfigError> {
    let members: Vec<PartId> = part.parts.keys().map(|name| id.child(name)).collect();

    let start = match policy {
        ExecutionPolicy::Sequential => match values.get_optional::<String>("start_here")? {
            Some(name) => {
                let start = id.child(&name);
                if !members.contains(&start) {
                    return Err(values.invalid("start_here", format!("'{name}' is not a member")));
                }
                Some(start)
            }
            None => None,
        },
        ExecutionPolicy::Parallel => None,
    };

    let timeout = match policy {
        ExecutionPolicy::Parallel => values
            .get_optional::<u64>("timeout_seconds")?
            .map(Duration::from_secs),
        ExecutionPolicy::Sequential => None,
    };

    Ok(FlowBody {
        policy,
        members,
        start,
        timeout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> PartRegistry {
        PartRegistry::with_builtins()
    }

    fn set_step() -> PartConfig {
        PartConfig::new("step.set").config_value("values", json!({"v": 1}))
    }

    #[test]
    fn test_builds_nested_flow() {
        let config = ExperimentConfig::new("demo")
            .part(
                "seq",
                PartConfig::new("flow.standard")
                    .config_value("start_here", "b")
                    .member("a", set_step())
                    .member("b", set_step()),
            )
            .part(
                "fan",
                PartConfig::new("flow.parallel")
                    .config_value("timeout_seconds", 5)
                    .member("x", set_step()),
            );
        let experiment = Experiment::from_config(&config, &registry()).unwrap();
        assert_eq!(experiment.len(), 5);
        assert_eq!(experiment.start(), Some(&PartId::new("seq")));

        let seq = experiment.get(&PartId::new("seq")).unwrap();
        match &seq.body {
            PartBody::Flow(body) => {
                assert_eq!(body.policy, ExecutionPolicy::Sequential);
                assert_eq!(body.start, Some(PartId::new("seq.b")));
                assert_eq!(body.members.len(), 2);
            }
            _ => panic!("expected a flow"),
        }

        let fan = experiment.get(&PartId::new("fan")).unwrap();
        match &fan.body {
            PartBody::Flow(body) => assert_eq!(body.timeout, Some(Duration::from_secs(5))),
            _ => panic!("expected a flow"),
        }
        assert_eq!(
            experiment.members_of(Some(&PartId::new("fan"))),
            &[PartId::new("fan.x")]
        );
        assert_eq!(experiment.members_of(None).len(), 2);
    }

    #[test]
    fn test_unknown_type_is_fatal() {
        let config = ExperimentConfig::new("demo").part("a", PartConfig::new("step.nope"));
        assert!(matches!(
            Experiment::from_config(&config, &registry()),
            Err(ConfigError::UnknownPartType { type_name, .. }) if type_name == "step.nope"
        ));
    }

    #[test]
    fn test_decision_outputs_rejected() {
        let config = ExperimentConfig::new("demo").part(
            "d",
            PartConfig::new("decision.conditional")
                .config_value("statements", json!(["else stop"]))
                .output("x", "y")
                .route("stop", "quit"),
        );
        assert!(matches!(
            Experiment::from_config(&config, &registry()),
            Err(ConfigError::InvalidPart { .. })
        ));
    }

    #[test]
    fn test_nested_parts_only_on_flows() {
        let config =
            ExperimentConfig::new("demo").part("a", set_step().member("b", set_step()));
        assert!(matches!(
            Experiment::from_config(&config, &registry()),
            Err(ConfigError::InvalidPart { .. })
        ));
    }

    #[test]
    fn test_bad_start_here() {
        let config = ExperimentConfig::new("demo").part(
            "seq",
            PartConfig::new("flow.standard")
                .config_value("start_here", "zzz")
                .member("a", set_step()),
        );
        assert!(matches!(
            Experiment::from_config(&config, &registry()),
            Err(ConfigError::InvalidConfigValue { name, .. }) if name == "start_here"
        ));
    }

    #[test]
    fn test_sequential_flow_without_start_here_has_no_start() {
        let config = ExperimentConfig::new("demo").part(
            "seq",
            PartConfig::new("flow.standard")
                .member("a", set_step())
                .member("b", set_step()),
        );
        let experiment = Experiment::from_config(&config, &registry()).unwrap();
        match &experiment.get(&PartId::new("seq")).unwrap().body {
            PartBody::Flow(body) => assert_eq!(body.start, None),
            _ => panic!("expected a flow"),
        }
    }

    #[test]
    fn test_initial_store() {
        let mut config = ExperimentConfig::new("demo").part("a", set_step());
        config
            .experiment
            .initial_values
            .insert("seed".to_string(), json!(42));
        let experiment = Experiment::from_config(&config, &registry()).unwrap();
        assert_eq!(experiment.initial_store().get("seed"), Some(&json!(42)));
    }
}
