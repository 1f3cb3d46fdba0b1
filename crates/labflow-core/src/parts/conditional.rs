use super::expr::{Expr, truthy};
use crate::ConfigError;
use crate::registry::ConfigValues;
use labflow_proto::{Part, PartContext, PartError, PartOutput, PartResult};

/// `decision.conditional`: picks the route of the first statement that holds.
///
/// ```text
/// statements:
///   - "go if {x} > 3"
///   - "retry if {attempts} < 5"
///   - "else stop"
/// ```
#[derive(Debug, Clone)]
pub struct ConditionalDecision {
    branches: Vec<(String, Option<Expr>)>,
}

impl ConditionalDecision {
    pub fn from_config(config: &ConfigValues<'_>) -> Result<Self, ConfigError> {
        let raw: Vec<String> = config.get("statements")?;
        let mut branches = Vec::with_capacity(raw.len());

        for (i, statement) in raw.iter().enumerate() {
            let statement = statement.trim();
            if let Some(route) = statement.strip_prefix("else ") {
                if i + 1 != raw.len() {
                    return Err(config.invalid("statements", "'else' must be the last statement"));
                }
                branches.push((route.trim().to_string(), None));
            } else if let Some((route, condition)) = statement.split_once(" if ") {
                let expr = Expr::parse(condition)
                    .map_err(|reason| config.invalid("statements", reason))?;
                branches.push((route.trim().to_string(), Some(expr)));
            } else {
                return Err(config.invalid(
                    "statements",
                    format!("'{statement}' is not '<route> if <condition>' or 'else <route>'"),
                ));
            }
        }

        if branches.iter().any(|(route, _)| route.is_empty()) {
            return Err(config.invalid("statements", "route names must not be empty"));
        }
        Ok(Self { branches })
    }
}

impl Part for ConditionalDecision {
    fn execute(&self, ctx: &PartContext<'_>) -> PartResult {
        for (route, condition) in &self.branches {
            let taken = match condition {
                None => true,
                Some(expr) => truthy(&expr.evaluate(&|name| super::lookup(ctx, name))?),
            };
            if taken {
                return Ok(PartOutput::route(route.clone()));
            }
        }
        Err(PartError::execution(
            "no condition held and there is no 'else' statement",
        ))
    }
}
