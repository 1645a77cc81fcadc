//! Readiness and validity of a workflow's dependency graph.

use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

use flowpilot_core::{StepStatus, Workflow};

use crate::error::{OrchestratorError, Result};

pub struct DependencyResolver;

impl DependencyResolver {
    /// Pending steps whose every prerequisite is `completed`, in declaration order.
    pub fn ready_steps(workflow: &Workflow) -> Vec<Uuid> {
        workflow
            .steps
            .iter()
            .filter(|step| step.status == StepStatus::Pending)
            .filter(|step| {
                workflow
                    .dependencies_of(step.id)
                    .iter()
                    .all(|dep| workflow.step_status(*dep) == Some(StepStatus::Completed))
            })
            .map(|step| step.id)
            .collect()
    }

    pub fn is_complete(workflow: &Workflow) -> bool {
        workflow.steps.iter().all(|s| s.status.is_done())
    }

    pub fn has_failed(workflow: &Workflow) -> bool {
        workflow.steps.iter().any(|s| s.status == StepStatus::Failed)
    }

    /// Pending steps that can never become ready because a prerequisite was skipped.
    pub fn blocked_by_skip(workflow: &Workflow) -> Vec<Uuid> {
        workflow
            .steps
            .iter()
            .filter(|step| step.status == StepStatus::Pending)
            .filter(|step| {
                workflow
                    .dependencies_of(step.id)
                    .iter()
                    .any(|dep| workflow.step_status(*dep) == Some(StepStatus::Skipped))
            })
            .map(|step| step.id)
            .collect()
    }

    /// Reject dependency maps that reference unknown steps or contain a cycle.
    pub fn validate(workflow: &Workflow) -> Result<()> {
        let ids: HashSet<Uuid> = workflow.steps.iter().map(|s| s.id).collect();
        if ids.len() != workflow.steps.len() {
            return Err(OrchestratorError::InvalidGraph(
                "duplicate step ids".to_string(),
            ));
        }

        for (step, deps) in &workflow.dependencies {
            if !ids.contains(step) {
                return Err(OrchestratorError::InvalidGraph(format!(
                    "dependencies declared for unknown step {}",
                    step
                )));
            }
            if let Some(missing) = deps.iter().find(|d| !ids.contains(d)) {
                return Err(OrchestratorError::InvalidGraph(format!(
                    "step {} depends on unknown step {}",
                    Self::label(workflow, *step),
                    missing
                )));
            }
        }

        // Kahn's algorithm; whatever is left unvisited sits on a cycle.
        let mut in_degree: HashMap<Uuid, usize> =
            workflow.steps.iter().map(|s| (s.id, 0)).collect();
        let mut dependents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for step in &workflow.steps {
            for dep in workflow.dependencies_of(step.id) {
                *in_degree.entry(step.id).or_default() += 1;
                dependents.entry(*dep).or_default().push(step.id);
            }
        }

        let mut queue: VecDeque<Uuid> = workflow
            .steps
            .iter()
            .filter(|s| in_degree.get(&s.id) == Some(&0))
            .map(|s| s.id)
            .collect();
        let mut visited = 0;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for next in dependents.get(&id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*next);
                    }
                }
            }
        }

        if visited < workflow.steps.len() {
            let cyclic: Vec<String> = workflow
                .steps
                .iter()
                .filter(|s| in_degree.get(&s.id).is_some_and(|d| *d > 0))
                .map(|s| s.name.clone())
                .collect();
            return Err(OrchestratorError::InvalidGraph(format!(
                "dependency cycle among {}",
                cyclic.join(", ")
            )));
        }

        Ok(())
    }

    fn label(workflow: &Workflow, id: Uuid) -> String {
        workflow
            .step(id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| id.to_string())
    }
}
