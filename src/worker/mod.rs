pub mod pm;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::state::{IssueState, WorkerRole};

/// Outcome status of one worker step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    NeedsClarification,
}

/// Quality metrics a worker may attach to its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub completeness_score: f64,
    pub critical_issues_count: u32,
    pub warnings_count: u32,
}

/// Immutable result of one worker execution.
///
/// Workers communicate expected outcomes (failure, need for clarification)
/// through `status`, never through errors; an `Err` from `execute` is reserved
/// for genuine faults and is converted by the controller into
/// [`StepResult::failure`] before it reaches the routing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub agent: WorkerRole,
    pub status: StepStatus,
    pub output: Map<String, Value>,
    pub confidence: f64,
    pub quality_metrics: Option<QualityMetrics>,
}

impl StepResult {
    pub fn new(agent: WorkerRole, status: StepStatus, confidence: f64) -> Self {
        Self {
            agent,
            status,
            output: Map::new(),
            confidence,
            quality_metrics: None,
        }
    }

    /// Synthetic failure the controller produces for worker errors and
    /// timeouts, so that all failure causes route through the same policy path.
    pub fn failure(agent: WorkerRole, reason: &str) -> Self {
        let mut result = Self::new(agent, StepStatus::Failed, 0.0);
        result
            .output
            .insert("reason".to_string(), Value::String(reason.to_string()));
        result
    }

    /// Synthetic success for states with no responsible worker, where the
    /// routing policy decides from accumulated context alone.
    pub fn orchestration() -> Self {
        Self::new(WorkerRole::ProjectManager, StepStatus::Success, 1.0)
    }

    pub fn with_output(mut self, key: &str, value: Value) -> Self {
        self.output.insert(key.to_string(), value);
        self
    }

    pub fn with_metrics(mut self, metrics: QualityMetrics) -> Self {
        self.quality_metrics = Some(metrics);
        self
    }

    /// Clarification questions attached to this result, if any.
    pub fn clarification_questions(&self) -> Vec<String> {
        self.output
            .get("clarification_questions")
            .and_then(Value::as_array)
            .map(|qs| {
                qs.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn output_flag(&self, key: &str) -> bool {
        self.output.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

/// The task handed to a worker: which state is executing and what the issue
/// asks for.
#[derive(Debug, Clone)]
pub struct WorkerTask {
    pub id: String,
    pub description: String,
    pub kind: IssueState,
}

/// Read-only projection of a workflow context exposed to workers.
///
/// A worker sees the issue, the prior outputs of every role (the developer
/// needs the analyst's acceptance criteria and the tester's file paths), any
/// guidance produced for a retry of this state, and the human replies
/// delivered so far.
#[derive(Debug, Clone)]
pub struct ContextView {
    pub issue_number: u64,
    pub issue_title: String,
    pub issue_description: String,
    pub repository: String,
    pub current_state: IssueState,
    pub step_outputs: HashMap<WorkerRole, Value>,
    pub feedback: Map<String, Value>,
    pub human_inputs: Vec<String>,
}

impl ContextView {
    pub fn output_for(&self, role: WorkerRole) -> Option<&Value> {
        self.step_outputs.get(&role)
    }
}

/// Uniform interface each worker implements.
#[async_trait]
pub trait Worker: Send + Sync {
    fn role(&self) -> WorkerRole;

    /// Execute the task for the current state. May suspend on network I/O;
    /// the controller bounds each call with a timeout.
    async fn execute(&self, task: &WorkerTask, view: &ContextView) -> Result<StepResult>;
}

/// Role -> implementation map, resolved once at startup.
pub struct WorkerSet {
    workers: Vec<Box<dyn Worker>>,
}

impl WorkerSet {
    pub fn new(workers: Vec<Box<dyn Worker>>) -> Self {
        Self { workers }
    }

    pub fn get(&self, role: WorkerRole) -> Option<&dyn Worker> {
        self.workers
            .iter()
            .find(|w| w.role() == role)
            .map(|w| w.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_result_has_zero_confidence_and_reason() {
        let result = StepResult::failure(WorkerRole::Developer, "timeout");
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(
            result.output.get("reason").and_then(Value::as_str),
            Some("timeout")
        );
    }

    #[test]
    fn test_clarification_questions_extraction() {
        let result = StepResult::new(WorkerRole::Analyst, StepStatus::NeedsClarification, 0.4)
            .with_output(
                "clarification_questions",
                serde_json::json!(["Which API version?", "Is auth in scope?"]),
            );
        assert_eq!(
            result.clarification_questions(),
            vec!["Which API version?", "Is auth in scope?"]
        );

        let empty = StepResult::new(WorkerRole::Analyst, StepStatus::Success, 0.9);
        assert!(empty.clarification_questions().is_empty());
    }

    #[test]
    fn test_output_flag() {
        let result = StepResult::new(WorkerRole::Tester, StepStatus::Success, 0.9)
            .with_output("tests_passed", Value::Bool(true));
        assert!(result.output_flag("tests_passed"));
        assert!(!result.output_flag("tests_affected"));
    }

    #[test]
    fn test_step_result_serde_round_trip() {
        let result = StepResult::new(WorkerRole::Tester, StepStatus::Success, 0.85)
            .with_output("test_file", Value::String("tests/login.rs".into()))
            .with_metrics(QualityMetrics {
                completeness_score: 0.9,
                critical_issues_count: 0,
                warnings_count: 2,
            });
        let json = serde_json::to_string(&result).unwrap();
        let back: StepResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.agent, WorkerRole::Tester);
        assert_eq!(back.status, StepStatus::Success);
        assert_eq!(back.quality_metrics.unwrap().warnings_count, 2);
    }
}
