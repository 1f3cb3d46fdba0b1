//! The part capability and the values that flow in and out of it.

use crate::{PartError, PartId, Value, finite};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Structural variant of a part.
///
/// The engine branches on this only where binding rules differ: steps may
/// write outputs, decisions pick a route, flows hand their members to the
/// sub-flow executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartKind {
    Step,
    Decision,
    Flow,
}

impl PartKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PartKind::Step => "step",
            PartKind::Decision => "decision",
            PartKind::Flow => "flow",
        }
    }
}

/// How a flow runs its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPolicy {
    /// Members run one after another on the live store.
    Sequential,
    /// One isolated branch per member, merged at a join barrier.
    Parallel,
}

impl ExecutionPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionPolicy::Sequential => "sequential",
            ExecutionPolicy::Parallel => "parallel",
        }
    }
}

/// Read-only view of the data store handed to part logic.
pub trait StoreRead {
    /// Returns the value under `key`, or `None` when the key is missing.
    fn get(&self, key: &str) -> Option<&Value>;

    /// All entries, ordered by key.
    fn entries(&self) -> Vec<(String, Value)>;
}

/// Inputs bound for one execution, keyed by argument name.
///
/// An argument whose store key was absent is still bound, to the missing
/// value; reading it yields `None` rather than an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inputs {
    values: IndexMap<String, Option<Value>>,
}

impl Inputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `arg` to a value, or to the missing value.
    pub fn bind(&mut self, arg: impl Into<String>, value: Option<Value>) {
        self.values.insert(arg.into(), value);
    }

    /// Builder form of [`Inputs::bind`] for a present value.
    pub fn with(mut self, arg: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bind(arg, Some(value.into()));
        self
    }

    /// Returns the bound value, or `None` if it is missing or unbound.
    pub fn get(&self, arg: &str) -> Option<&Value> {
        self.values.get(arg).and_then(Option::as_ref)
    }

    /// Returns true if `arg` was declared in the part's input names.
    pub fn is_bound(&self, arg: &str) -> bool {
        self.values.contains_key(arg)
    }

    /// Returns true if `arg` was declared but its store key was absent.
    pub fn is_missing(&self, arg: &str) -> bool {
        matches!(self.values.get(arg), Some(None))
    }

    /// Returns the bound value or a part failure naming the argument.
    pub fn require(&self, arg: &str) -> Result<&Value, PartError> {
        match self.values.get(arg) {
            Some(Some(value)) => Ok(value),
            Some(None) => Err(PartError::execution(format!(
                "input '{arg}' is missing from the data store"
            ))),
            None => Err(PartError::execution(format!(
                "input '{arg}' is not mapped to any store key"
            ))),
        }
    }

    /// Deserializes the bound value into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, arg: &str) -> Result<Option<T>, PartError> {
        self.get(arg)
            .map(|value| {
                serde_json::from_value(value.clone()).map_err(|e| {
                    PartError::execution(format!("input '{arg}' has an unexpected shape: {e}"))
                })
            })
            .transpose()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Value>)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Results produced by a step, keyed by result name.
///
/// Every value is converted to the trace format when it is set, so a value
/// that cannot be persisted fails the step before anything is written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outputs {
    values: IndexMap<String, Value>,
    optional: HashSet<String>,
}

impl Outputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a result. Fails with `SerializationError` if `value` has no
    /// representation in the trace format, including NaN and infinite floats.
    pub fn set<T: Serialize + ?Sized>(
        &mut self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<(), PartError> {
        let name = name.into();
        let value = finite::check(value)
            .map_err(|e| e.to_string())
            .and_then(|()| serde_json::to_value(value).map_err(|e| e.to_string()))
            .map_err(|e| {
                PartError::serialization(format!("output '{name}' cannot be serialized: {e}"))
            })?;
        self.values.insert(name, value);
        Ok(())
    }

    /// Sets a result that is silently dropped when the part's configuration
    /// does not map it to a store key.
    pub fn set_optional<T: Serialize + ?Sized>(
        &mut self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<(), PartError> {
        let name = name.into();
        self.set(name.clone(), value)?;
        self.optional.insert(name);
        Ok(())
    }

    /// Inserts an already-converted value.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    /// Builder form of [`Outputs::insert`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn is_optional(&self, name: &str) -> bool {
        self.optional.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// What a part's logic produced.
#[derive(Debug, Clone, PartialEq)]
pub enum PartOutput {
    /// Step results, bound to store keys through the part's output names.
    Outputs(Outputs),
    /// The route chosen by a decision.
    Route(String),
}

impl PartOutput {
    pub fn route(name: impl Into<String>) -> Self {
        PartOutput::Route(name.into())
    }
}

pub type PartResult = Result<PartOutput, PartError>;

/// Everything a part sees while executing.
pub struct PartContext<'a> {
    pub part_id: &'a PartId,
    pub inputs: &'a Inputs,
    pub store: &'a dyn StoreRead,
}

/// A unit of work: one concrete step or decision type.
///
/// Implementations are built once from their `config_values` and may be
/// executed many times; a run resumed after a crash re-invokes the part that
/// was in progress, so `execute` must tolerate being called again against the
/// same store contents.
pub trait Part: Send + Sync {
    fn execute(&self, ctx: &PartContext<'_>) -> PartResult;
}
