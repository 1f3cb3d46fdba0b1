//! Built-in part types.
//!
//! | type name | kind |
//! |---|---|
//! | `step.set` | step |
//! | `step.expression` | step |
//! | `step.dump` | step |
//! | `decision.conditional` | decision |
//! | `flow.standard` | sequential flow |
//! | `flow.parallel` | parallel flow |

mod conditional;
mod dump;
mod expr;
mod expression;
mod set;

pub use conditional::ConditionalDecision;
pub use dump::DumpStore;
pub use expression::ExpressionStep;
pub use set::SetValues;

use crate::PartRegistry;
use labflow_proto::{ExecutionPolicy, PartContext, PartError, StoreRead, Value};
use std::sync::Arc;

/// Registers every built-in type.
pub fn register_builtins(registry: &mut PartRegistry) {
    registry.register_step(
        "step.set",
        "Emits the constant results listed in `values`",
        |values| Ok(Arc::new(SetValues::from_config(values)?)),
    );
    registry.register_step(
        "step.expression",
        "Evaluates `<result> = <expression>` statements",
        |values| Ok(Arc::new(ExpressionStep::from_config(values)?)),
    );
    registry.register_step(
        "step.dump",
        "Logs the contents of the data store",
        |values| Ok(Arc::new(DumpStore::from_config(values)?)),
    );
    registry.register_decision(
        "decision.conditional",
        "Takes the route of the first statement whose condition holds",
        |values| Ok(Arc::new(ConditionalDecision::from_config(values)?)),
    );
    registry.register_flow(
        "flow.standard",
        "Runs its members one after another",
        ExecutionPolicy::Sequential,
    );
    registry.register_flow(
        "flow.parallel",
        "Runs each member as an isolated branch and merges at a barrier",
        ExecutionPolicy::Parallel,
    );
}

/// Resolves a `{name}` reference: a bound input argument first, then the
/// store key of the same name.
pub(crate) fn lookup(ctx: &PartContext<'_>, name: &str) -> Result<Value, PartError> {
    if ctx.inputs.is_bound(name) {
        return ctx.inputs.require(name).cloned();
    }
    ctx.store
        .get(name)
        .cloned()
        .ok_or_else(|| PartError::execution(format!("'{name}' is neither an input nor in the data store")))
}
