//! Append-only key/value store scoped to one workflow execution.

use serde_json::{json, Map, Value};

use flowpilot_core::{Step, StepStatus, Workflow};

use crate::error::{OrchestratorError, Result};
use crate::expr;

const STEPS_KEY: &str = "steps";

/// Results published by finished steps.
///
/// Each step's result lands under `step_{id}_result` and, when its name is
/// not taken yet, under `steps.{name}`. Keys are written once and never
/// replaced.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    values: Map<String, Value>,
}

impl ExecutionContext {
    /// Seed with workflow identity and the results of every step that has
    /// already finished, so a resumed workflow sees the same view.
    pub fn for_workflow(workflow: &Workflow) -> Self {
        let mut values = Map::new();
        values.insert(
            "workflow".to_string(),
            json!({
                "id": workflow.id,
                "name": workflow.name,
                "project_id": workflow.project_id,
                "metadata": workflow.metadata,
            }),
        );
        values.insert(STEPS_KEY.to_string(), Value::Object(Map::new()));

        let mut context = Self { values };
        for step in workflow.steps.iter().filter(|s| s.status.is_done()) {
            // first write wins; a fresh context cannot conflict
            let _ = context.record(step);
        }
        context
    }

    /// Publish a finished step's result.
    pub fn record(&mut self, step: &Step) -> Result<()> {
        if !matches!(step.status, StepStatus::Completed | StepStatus::Skipped) {
            return Ok(());
        }
        let key = step.context_key();
        if self.values.contains_key(&key) {
            return Err(OrchestratorError::ContextConflict(key));
        }

        let result = Value::Object(step.result.clone().unwrap_or_default());
        if let Some(Value::Object(by_name)) = self.values.get_mut(STEPS_KEY) {
            by_name
                .entry(step.name.clone())
                .or_insert_with(|| result.clone());
        }
        self.values.insert(key, result);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn lookup(&self, path: &str) -> Option<&Value> {
        expr::lookup(&self.values, path)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Every recorded step result object.
    pub fn step_results(&self) -> impl Iterator<Item = &Map<String, Value>> {
        self.values
            .iter()
            .filter(|(k, _)| k.starts_with("step_") && k.ends_with("_result"))
            .filter_map(|(_, v)| v.as_object())
    }

    pub fn render(&self, template: &str) -> Result<String> {
        expr::render(template, &self.values)
    }

    pub fn render_value(&self, value: &Value) -> Result<Value> {
        expr::render_value(value, &self.values)
    }

    pub fn evaluate(&self, condition: &str) -> Result<bool> {
        expr::evaluate(condition, &self.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowpilot_core::StepType;
    use uuid::Uuid;

    fn completed(name: &str, result: Value) -> Step {
        let mut step = Step::new(name, StepType::Command);
        step.complete(result.as_object().cloned().unwrap_or_default());
        step
    }

    #[test]
    fn test_record_namespaces_by_step_id() {
        let mut context = ExecutionContext::default();
        let step = completed("build", json!({"exit_code": 0}));
        context.record(&step).unwrap();

        assert_eq!(
            context.lookup(&format!("step_{}_result.exit_code", step.id)),
            Some(&json!(0))
        );
    }

    #[test]
    fn test_record_twice_conflicts() {
        let mut context = ExecutionContext::default();
        let step = completed("build", json!({}));
        context.record(&step).unwrap();
        assert!(matches!(
            context.record(&step),
            Err(OrchestratorError::ContextConflict(_))
        ));
    }

    #[test]
    fn test_pending_steps_are_not_recorded() {
        let mut context = ExecutionContext::default();
        let step = Step::new("later", StepType::Command);
        context.record(&step).unwrap();
        assert!(!context.contains(&step.context_key()));
    }

    #[test]
    fn test_for_workflow_seeds_identity_and_finished_steps() {
        let done = completed("deploy", json!({"url": "https://x"}));
        let workflow = Workflow::new("release", Uuid::new_v4())
            .with_step(done.clone())
            .with_step(Step::new("validate", StepType::Validation));

        let context = ExecutionContext::for_workflow(&workflow);
        assert_eq!(context.lookup("workflow.name"), Some(&json!("release")));
        assert_eq!(context.lookup("steps.deploy.url"), Some(&json!("https://x")));
        assert_eq!(context.step_results().count(), 1);
        assert_eq!(
            context.render("${steps.deploy.url}/health").unwrap(),
            "https://x/health"
        );
    }

    #[test]
    fn test_name_alias_first_write_wins() {
        let mut context = ExecutionContext::for_workflow(&Workflow::new("w", Uuid::new_v4()));
        context.record(&completed("check", json!({"n": 1}))).unwrap();
        context.record(&completed("check", json!({"n": 2}))).unwrap();
        assert_eq!(context.lookup("steps.check.n"), Some(&json!(1)));
        assert!(context.evaluate("steps.check.n == 1").unwrap());
    }
}
