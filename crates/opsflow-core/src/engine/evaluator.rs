//! Condition tree evaluation over the working context.
//!
//! A condition node is either a conjunction (`and` non-empty), a disjunction
//! (`or` non-empty), or a leaf comparing a dot-path field against a value.
//! Both logical forms short-circuit. Field resolution requires every
//! non-terminal path segment to be a JSON object; anything else is a
//! `"field not found"` error that fails the step.
//!
//! Operator semantics follow the definition schema: equality compares the
//! rendered string form of both sides, ordering coerces both sides to f64,
//! `in` is membership in a sequence, `contains` is substring-or-membership
//! depending on the field shape, and `regex` compiles its pattern per call.

use opsflow_types::ContextMap;
use opsflow_types::workflow::{ConditionExpr, ConditionOp};
use serde_json::Value;

use super::EngineError;

/// Stateless evaluator for condition trees.
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// Evaluate a condition tree against the working context.
    pub fn evaluate(cond: &ConditionExpr, ctx: &ContextMap) -> Result<bool, EngineError> {
        if !cond.and.is_empty() {
            for sub in &cond.and {
                if !Self::evaluate(sub, ctx)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }

        if !cond.or.is_empty() {
            for sub in &cond.or {
                if Self::evaluate(sub, ctx)? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }

        Self::evaluate_leaf(cond, ctx)
    }

    fn evaluate_leaf(cond: &ConditionExpr, ctx: &ContextMap) -> Result<bool, EngineError> {
        let field = cond.field.as_deref().ok_or_else(|| {
            EngineError::Validation("condition leaf has no field".to_string())
        })?;
        let operator = cond.operator.ok_or_else(|| {
            EngineError::Validation(format!("condition on '{field}' has no operator"))
        })?;

        let actual = resolve_path(ctx, field)?;

        match operator {
            ConditionOp::Eq => Ok(render(actual) == render(&cond.value)),
            ConditionOp::Neq => Ok(render(actual) != render(&cond.value)),
            ConditionOp::Gt => numeric(actual, &cond.value, field).map(|(a, b)| a > b),
            ConditionOp::Gte => numeric(actual, &cond.value, field).map(|(a, b)| a >= b),
            ConditionOp::Lt => numeric(actual, &cond.value, field).map(|(a, b)| a < b),
            ConditionOp::Lte => numeric(actual, &cond.value, field).map(|(a, b)| a <= b),
            ConditionOp::In => {
                let Value::Array(candidates) = &cond.value else {
                    return Err(EngineError::Validation(format!(
                        "'in' condition on '{field}' requires a sequence value"
                    )));
                };
                let needle = render(actual);
                Ok(candidates.iter().any(|c| render(c) == needle))
            }
            ConditionOp::Contains => match actual {
                Value::String(s) => Ok(s.contains(&render(&cond.value))),
                Value::Array(items) => {
                    let needle = render(&cond.value);
                    Ok(items.iter().any(|i| render(i) == needle))
                }
                other => Err(EngineError::Validation(format!(
                    "'contains' condition on '{field}' requires a string or sequence, got {}",
                    kind_name(other)
                ))),
            },
            ConditionOp::Regex => {
                let pattern = render(&cond.value);
                let re = regex::Regex::new(&pattern).map_err(|e| {
                    EngineError::Validation(format!("invalid regex '{pattern}': {e}"))
                })?;
                Ok(re.is_match(&render(actual)))
            }
        }
    }
}

/// Resolve a dot-path against the context.
///
/// Every non-terminal segment must be an object and every segment must
/// exist; otherwise the whole path is reported as not found. Also used by
/// the interpreter to resolve `foreach` item references.
pub(crate) fn resolve_path<'a>(ctx: &'a ContextMap, path: &str) -> Result<&'a Value, EngineError> {
    let mut segments = path.split('.');
    let first = segments.next().unwrap_or_default();
    let mut current = ctx
        .get(first)
        .ok_or_else(|| EngineError::Validation(format!("field not found: {path}")))?;

    for segment in segments {
        let Value::Object(map) = current else {
            return Err(EngineError::Validation(format!("field not found: {path}")));
        };
        current = map
            .get(segment)
            .ok_or_else(|| EngineError::Validation(format!("field not found: {path}")))?;
    }

    Ok(current)
}

/// String form used by equality and membership comparisons.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn numeric(actual: &Value, expected: &Value, field: &str) -> Result<(f64, f64), EngineError> {
    let a = actual.as_f64().ok_or_else(|| {
        EngineError::Validation(format!(
            "numeric comparison on '{field}' requires a number, got {}",
            kind_name(actual)
        ))
    })?;
    let b = expected.as_f64().ok_or_else(|| {
        EngineError::Validation(format!(
            "numeric comparison on '{field}' requires a numeric value, got {}",
            kind_name(expected)
        ))
    })?;
    Ok((a, b))
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: serde_json::Value) -> ContextMap {
        serde_json::from_value(value).expect("object context")
    }

    fn leaf(field: &str, op: &str, value: serde_json::Value) -> ConditionExpr {
        serde_json::from_value(json!({ "field": field, "operator": op, "value": value }))
            .unwrap()
    }

    // -------------------------------------------------------------------
    // Field resolution
    // -------------------------------------------------------------------

    #[test]
    fn test_nested_field_resolution() {
        let ctx = ctx(json!({ "order": { "customer": { "tier": "gold" } } }));
        let cond = leaf("order.customer.tier", "eq", json!("gold"));
        assert!(ConditionEvaluator::evaluate(&cond, &ctx).unwrap());
    }

    #[test]
    fn test_missing_field_errors() {
        let ctx = ctx(json!({ "order": { "total": 10 } }));
        let cond = leaf("order.missing", "eq", json!("x"));
        let err = ConditionEvaluator::evaluate(&cond, &ctx).unwrap_err();
        assert_eq!(err.to_string(), "field not found: order.missing");
    }

    #[test]
    fn test_non_object_intermediate_errors() {
        let ctx = ctx(json!({ "order": { "total": 10 } }));
        let cond = leaf("order.total.cents", "eq", json!(10));
        let err = ConditionEvaluator::evaluate(&cond, &ctx).unwrap_err();
        assert_eq!(err.to_string(), "field not found: order.total.cents");
    }

    // -------------------------------------------------------------------
    // Equality
    // -------------------------------------------------------------------

    #[test]
    fn test_eq_string_form() {
        let ctx = ctx(json!({ "order": { "status": "open", "total": 1500 } }));
        assert!(
            ConditionEvaluator::evaluate(&leaf("order.status", "eq", json!("open")), &ctx)
                .unwrap()
        );
        // Numbers compare by rendered form, so 1500 == "1500".
        assert!(
            ConditionEvaluator::evaluate(&leaf("order.total", "eq", json!("1500")), &ctx)
                .unwrap()
        );
        assert!(
            ConditionEvaluator::evaluate(&leaf("order.status", "neq", json!("closed")), &ctx)
                .unwrap()
        );
    }

    // -------------------------------------------------------------------
    // Numeric ordering
    // -------------------------------------------------------------------

    #[test]
    fn test_numeric_operators() {
        let ctx = ctx(json!({ "order": { "total": 1500.5 } }));
        assert!(ConditionEvaluator::evaluate(&leaf("order.total", "gt", json!(1000)), &ctx).unwrap());
        assert!(ConditionEvaluator::evaluate(&leaf("order.total", "gte", json!(1500.5)), &ctx).unwrap());
        assert!(!ConditionEvaluator::evaluate(&leaf("order.total", "lt", json!(1000)), &ctx).unwrap());
        assert!(ConditionEvaluator::evaluate(&leaf("order.total", "lte", json!(2000)), &ctx).unwrap());
    }

    #[test]
    fn test_numeric_on_non_number_errors() {
        let ctx = ctx(json!({ "order": { "total": "lots" } }));
        let err =
            ConditionEvaluator::evaluate(&leaf("order.total", "gt", json!(10)), &ctx).unwrap_err();
        assert!(err.to_string().contains("requires a number"));
    }

    // -------------------------------------------------------------------
    // Membership & contains
    // -------------------------------------------------------------------

    #[test]
    fn test_in_operator() {
        let ctx = ctx(json!({ "customer": { "tier": "gold" } }));
        let cond = leaf("customer.tier", "in", json!(["silver", "gold"]));
        assert!(ConditionEvaluator::evaluate(&cond, &ctx).unwrap());

        let cond = leaf("customer.tier", "in", json!(["bronze"]));
        assert!(!ConditionEvaluator::evaluate(&cond, &ctx).unwrap());
    }

    #[test]
    fn test_in_requires_sequence_value() {
        let ctx = ctx(json!({ "customer": { "tier": "gold" } }));
        let cond = leaf("customer.tier", "in", json!("gold"));
        assert!(ConditionEvaluator::evaluate(&cond, &ctx).is_err());
    }

    #[test]
    fn test_contains_substring_and_membership() {
        let ctx = ctx(json!({
            "order": { "note": "expedite this order", "tags": ["vip", "fragile"] }
        }));
        assert!(
            ConditionEvaluator::evaluate(&leaf("order.note", "contains", json!("expedite")), &ctx)
                .unwrap()
        );
        assert!(
            ConditionEvaluator::evaluate(&leaf("order.tags", "contains", json!("vip")), &ctx)
                .unwrap()
        );
        assert!(
            !ConditionEvaluator::evaluate(&leaf("order.tags", "contains", json!("bulk")), &ctx)
                .unwrap()
        );
    }

    // -------------------------------------------------------------------
    // Regex
    // -------------------------------------------------------------------

    #[test]
    fn test_regex_operator() {
        let ctx = ctx(json!({ "customer": { "email": "amy@example.com" } }));
        let cond = leaf("customer.email", "regex", json!(r".+@example\.com$"));
        assert!(ConditionEvaluator::evaluate(&cond, &ctx).unwrap());
    }

    #[test]
    fn test_regex_invalid_pattern_errors() {
        let ctx = ctx(json!({ "customer": { "email": "amy@example.com" } }));
        let cond = leaf("customer.email", "regex", json!("("));
        let err = ConditionEvaluator::evaluate(&cond, &ctx).unwrap_err();
        assert!(err.to_string().contains("invalid regex"));
    }

    // -------------------------------------------------------------------
    // Logical trees
    // -------------------------------------------------------------------

    #[test]
    fn test_and_short_circuit() {
        let ctx = ctx(json!({ "order": { "total": 100 } }));
        // Second leaf references a missing field; the false first leaf must
        // short-circuit before it is evaluated.
        let cond: ConditionExpr = serde_json::from_value(json!({
            "and": [
                { "field": "order.total", "operator": "gt", "value": 1000 },
                { "field": "order.missing", "operator": "eq", "value": "x" }
            ]
        }))
        .unwrap();
        assert!(!ConditionEvaluator::evaluate(&cond, &ctx).unwrap());
    }

    #[test]
    fn test_or_short_circuit() {
        let ctx = ctx(json!({ "order": { "total": 5000 } }));
        let cond: ConditionExpr = serde_json::from_value(json!({
            "or": [
                { "field": "order.total", "operator": "gt", "value": 1000 },
                { "field": "order.missing", "operator": "eq", "value": "x" }
            ]
        }))
        .unwrap();
        assert!(ConditionEvaluator::evaluate(&cond, &ctx).unwrap());
    }

    #[test]
    fn test_nested_and_or() {
        let ctx = ctx(json!({
            "order": { "total": 2000 },
            "customer": { "tier": "gold" }
        }));
        let cond: ConditionExpr = serde_json::from_value(json!({
            "and": [
                { "field": "order.total", "operator": "gte", "value": 1000 },
                { "or": [
                    { "field": "customer.tier", "operator": "eq", "value": "gold" },
                    { "field": "customer.tier", "operator": "eq", "value": "platinum" }
                ]}
            ]
        }))
        .unwrap();
        assert!(ConditionEvaluator::evaluate(&cond, &ctx).unwrap());
    }

    #[test]
    fn test_symbol_operator_spellings() {
        let ctx = ctx(json!({ "order": { "total": 1500 } }));
        assert!(ConditionEvaluator::evaluate(&leaf("order.total", ">", json!(1000)), &ctx).unwrap());
        assert!(ConditionEvaluator::evaluate(&leaf("order.total", "==", json!(1500)), &ctx).unwrap());
        assert!(ConditionEvaluator::evaluate(&leaf("order.total", "!=", json!(99)), &ctx).unwrap());
    }
}
