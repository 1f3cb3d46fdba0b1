use super::expr::Expr;
use crate::ConfigError;
use crate::registry::ConfigValues;
use labflow_proto::{Outputs, Part, PartContext, PartOutput, PartResult};

/// `step.expression`: evaluates `<result> = <expression>` statements.
///
/// Statements run in order; a `{name}` naming an earlier result of the same
/// step reads that result.
#[derive(Debug, Clone)]
pub struct ExpressionStep {
    statements: Vec<(String, Expr)>,
}

impl ExpressionStep {
    pub fn from_config(config: &ConfigValues<'_>) -> Result<Self, ConfigError> {
        let raw: Vec<String> = config.get("statements")?;
        let mut statements = Vec::with_capacity(raw.len());
        for statement in &raw {
            let (result, expression) = statement
                .split_once('=')
                .filter(|(lhs, rhs)| !lhs.trim().is_empty() && !rhs.starts_with('='))
                .ok_or_else(|| {
                    config.invalid(
                        "statements",
                        format!("'{statement}' is not of the form '<result> = <expression>'"),
                    )
                })?;
            let result = result.trim();
            if result.contains(char::is_whitespace) {
                return Err(config.invalid(
                    "statements",
                    format!("result name '{result}' must be a single word"),
                ));
            }
            let expr = Expr::parse(expression)
                .map_err(|reason| config.invalid("statements", reason))?;
            statements.push((result.to_string(), expr));
        }
        Ok(Self { statements })
    }
}

impl Part for ExpressionStep {
    fn execute(&self, ctx: &PartContext<'_>) -> PartResult {
        let mut outputs = Outputs::new();
        for (result, expr) in &self.statements {
            let value = expr.evaluate(&|name| match outputs.get(name) {
                Some(value) => Ok(value.clone()),
                None => super::lookup(ctx, name),
            })?;
            outputs.insert(result.clone(), value);
        }
        Ok(PartOutput::Outputs(outputs))
    }
}
