//! Type-specific step logic. Each handler reads its step's config, calls at
//! most one collaborator and returns a small result map.

pub mod agent;
pub mod analysis;
pub mod command;
pub mod conditional;
pub mod deployment;
pub mod notification;
pub mod pull_request;
pub mod validation;

use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

use events::EventSink;
use flowpilot_core::Step;

use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};

pub type StepOutput = Map<String, Value>;

/// Everything a handler may read while running one step.
pub struct HandlerContext<'a> {
    pub workflow_id: Uuid,
    pub project_id: Uuid,
    pub step: &'a Step,
    pub context: &'a ExecutionContext,
    pub collaborators: &'a Collaborators,
    pub event_sink: Option<&'a Arc<dyn EventSink>>,
    pub config: &'a EngineConfig,
}

impl HandlerContext<'_> {
    /// Config value with `${..}` placeholders rendered.
    pub fn param(&self, key: &str) -> Result<Option<Value>> {
        self.step
            .config
            .get(key)
            .map(|value| self.context.render_value(value))
            .transpose()
    }

    /// Config string exactly as written, placeholders left in place.
    pub fn literal_str(&self, key: &str) -> Result<Option<String>> {
        match self.step.config.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(OrchestratorError::handler_failed(format!(
                "config '{}' is not a string: {}",
                key, other
            ))),
        }
    }

    pub fn require_literal_str(&self, key: &str) -> Result<String> {
        self.literal_str(key)?.ok_or_else(|| self.missing(key))
    }

    pub fn param_str(&self, key: &str) -> Result<Option<String>> {
        match self.param(key)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Ok(Some(other.to_string())),
        }
    }

    pub fn require_str(&self, key: &str) -> Result<String> {
        self.param_str(key)?.ok_or_else(|| self.missing(key))
    }

    pub fn param_f64(&self, key: &str) -> Result<Option<f64>> {
        match self.param(key)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => Ok(n.as_f64()),
            Some(Value::String(s)) => s.trim().parse().map(Some).map_err(|_| {
                OrchestratorError::handler_failed(format!("config '{}' is not a number: {}", key, s))
            }),
            Some(other) => Err(OrchestratorError::handler_failed(format!(
                "config '{}' is not a number: {}",
                key, other
            ))),
        }
    }

    pub fn param_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.param(key)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(b)),
            Some(Value::String(s)) => Ok(Some(matches!(s.as_str(), "true" | "yes" | "1"))),
            Some(other) => Err(OrchestratorError::handler_failed(format!(
                "config '{}' is not a boolean: {}",
                key, other
            ))),
        }
    }

    /// String list from an array (or a single string) config value.
    pub fn param_list(&self, key: &str) -> Result<Option<Vec<String>>> {
        match self.param(key)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(vec![s])),
            Some(Value::Array(items)) => Ok(Some(
                items
                    .into_iter()
                    .map(|item| match item {
                        Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .collect(),
            )),
            Some(other) => Err(OrchestratorError::handler_failed(format!(
                "config '{}' is not a list: {}",
                key, other
            ))),
        }
    }

    pub fn missing(&self, key: &str) -> OrchestratorError {
        OrchestratorError::handler_failed(format!(
            "{} step '{}' requires config '{}'",
            self.step.step_type, self.step.name, key
        ))
    }
}

/// Build a result map from key/value pairs.
pub(crate) fn output<const N: usize>(pairs: [(&str, Value); N]) -> StepOutput {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
