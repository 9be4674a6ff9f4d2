//! Workflow definition parsing and load-time validation.
//!
//! Definitions arrive as JSON or YAML documents and deserialize into the
//! tagged IR in `opsflow-types`. Validation runs immediately after parse so
//! that structurally broken workflows (duplicate step ids, bad durations,
//! empty condition steps) are rejected before anything is persisted or
//! executed. The step graph itself may be cyclic -- the interpreter bounds
//! runaway walks with a step budget -- so no reachability or cycle analysis
//! happens here.

use std::collections::HashSet;

use opsflow_types::workflow::{Step, StepKind, WorkflowDefinition};

use super::EngineError;
use super::duration::parse_duration;

/// Parse a JSON document into a validated `WorkflowDefinition`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, EngineError> {
    let def: WorkflowDefinition = serde_json::from_str(json)
        .map_err(|e| EngineError::Validation(format!("definition parse error: {e}")))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse a YAML document into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, EngineError> {
    let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml)
        .map_err(|e| EngineError::Validation(format!("definition parse error: {e}")))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Step ids are non-empty and unique across the whole definition,
///   including steps nested inside `parallel` and `foreach` bodies.
/// - All duration strings (`definition.timeout`, `step.timeout`,
///   `wait.timeout`) parse.
/// - Condition steps carry an inline condition (`rule_id`-only steps are
///   rejected: this kernel ships no rule catalog).
/// - `foreach.items` is a `{{path}}` reference.
///
/// A definition with zero steps is valid; such an execution completes
/// immediately with result `executed`.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), EngineError> {
    if let Some(timeout) = &def.timeout {
        parse_duration(timeout).map_err(|e| {
            EngineError::Validation(format!("invalid workflow timeout '{timeout}': {e}"))
        })?;
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        validate_step(step, &mut seen_ids)?;
    }

    Ok(())
}

fn validate_step<'a>(
    step: &'a Step,
    seen_ids: &mut HashSet<&'a str>,
) -> Result<(), EngineError> {
    if step.id.is_empty() {
        return Err(EngineError::Validation(
            "step id must not be empty".to_string(),
        ));
    }
    if !seen_ids.insert(step.id.as_str()) {
        return Err(EngineError::Validation(format!(
            "duplicate step id: '{}'",
            step.id
        )));
    }

    if let Some(timeout) = &step.timeout {
        parse_duration(timeout).map_err(|e| {
            EngineError::Validation(format!(
                "step '{}' has invalid timeout '{timeout}': {e}",
                step.id
            ))
        })?;
    }

    match &step.kind {
        StepKind::Condition {
            condition, rule_id, ..
        } => match (condition, rule_id) {
            (Some(_), _) => {}
            (None, Some(rule)) => {
                return Err(EngineError::Validation(format!(
                    "condition step '{}' references rule '{rule}' but no rule catalog is configured",
                    step.id
                )));
            }
            (None, None) => {
                return Err(EngineError::Validation(format!(
                    "condition step '{}' has no condition",
                    step.id
                )));
            }
        },
        StepKind::Parallel { parallel } => {
            for inner in &parallel.steps {
                validate_step(inner, seen_ids)?;
            }
        }
        StepKind::Foreach { foreach } => {
            if !(foreach.items.starts_with("{{") && foreach.items.ends_with("}}")) {
                return Err(EngineError::Validation(format!(
                    "foreach step '{}' items must be a {{{{path}}}} reference, got '{}'",
                    step.id, foreach.items
                )));
            }
            for inner in &foreach.steps {
                validate_step(inner, seen_ids)?;
            }
        }
        StepKind::Wait { wait } => {
            if let Some(timeout) = &wait.timeout {
                parse_duration(timeout).map_err(|e| {
                    EngineError::Validation(format!(
                        "wait step '{}' has invalid timeout '{timeout}': {e}",
                        step.id
                    ))
                })?;
            }
        }
        StepKind::Action { .. } | StepKind::Execute { .. } => {}
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> Result<WorkflowDefinition, EngineError> {
        parse_workflow_json(&value.to_string())
    }

    #[test]
    fn test_valid_definition_parses() {
        let def = parse(json!({
            "timeout": "5m",
            "trigger": { "type": "event", "event": "order.created" },
            "steps": [
                { "id": "s1", "type": "condition",
                  "condition": { "field": "order.total", "operator": "gt", "value": 1000 },
                  "on_true": "s2" },
                { "id": "s2", "type": "action", "action": { "type": "block" } }
            ]
        }))
        .unwrap();
        assert_eq!(def.steps.len(), 2);
    }

    #[test]
    fn test_zero_steps_is_valid() {
        let def = parse(json!({
            "trigger": { "type": "manual" },
            "steps": []
        }))
        .unwrap();
        assert!(def.steps.is_empty());
    }

    #[test]
    fn test_duplicate_top_level_ids_rejected() {
        let err = parse(json!({
            "trigger": { "type": "manual" },
            "steps": [
                { "id": "a", "type": "execute", "execute": [] },
                { "id": "a", "type": "execute", "execute": [] }
            ]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("duplicate step id: 'a'"));
    }

    #[test]
    fn test_nested_id_collision_rejected() {
        // An inner parallel step colliding with a top-level id must fail at load.
        let err = parse(json!({
            "trigger": { "type": "manual" },
            "steps": [
                { "id": "outer", "type": "parallel", "parallel": { "steps": [
                    { "id": "outer", "type": "execute", "execute": [] }
                ]}}
            ]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("duplicate step id: 'outer'"));
    }

    #[test]
    fn test_invalid_timeout_rejected() {
        let err = parse(json!({
            "timeout": "sometime",
            "trigger": { "type": "manual" },
            "steps": []
        }))
        .unwrap_err();
        assert!(err.to_string().contains("invalid workflow timeout"));
    }

    #[test]
    fn test_condition_step_without_condition_rejected() {
        let err = parse(json!({
            "trigger": { "type": "manual" },
            "steps": [ { "id": "c", "type": "condition" } ]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("has no condition"));
    }

    #[test]
    fn test_rule_id_without_catalog_rejected() {
        let err = parse(json!({
            "trigger": { "type": "manual" },
            "steps": [ { "id": "c", "type": "condition", "rule_id": "r-42" } ]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("rule 'r-42'"));
    }

    #[test]
    fn test_foreach_items_must_be_reference() {
        let err = parse(json!({
            "trigger": { "type": "manual" },
            "steps": [
                { "id": "f", "type": "foreach",
                  "foreach": { "items": "order.items", "item_var": "item", "steps": [] } }
            ]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("{{path}}"));
    }

    #[test]
    fn test_yaml_parse_and_validate() {
        let yaml = r#"
trigger:
  type: event
  event: "order.*"
steps:
  - id: wait-approval
    type: wait
    wait:
      event: approval.granted
      timeout: 24h
"#;
        let def = parse_workflow_yaml(yaml).unwrap();
        assert_eq!(def.steps[0].kind.type_name(), "wait");
    }
}
