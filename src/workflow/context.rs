use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AppError, Result};
use crate::platform::types::PullRequest;
use crate::state::{is_valid_transition, IssueState, WorkerRole};
use crate::worker::ContextView;

/// What caused a state transition. Diagnostic only; control flow never
/// branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Policy,
    Controller,
    Worker(WorkerRole),
    External,
}

/// One committed state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: IssueState,
    pub to: IssueState,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub triggered_by: Trigger,
}

/// The mutable record of one issue's processing.
///
/// Owned exclusively by the controller loop for the issue's lifetime and
/// mutated only through [`WorkflowContext::transition_to`] and the recording
/// helpers. Serializes to the persisted per-issue layout and restores with
/// identical invariants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub issue_number: u64,
    pub issue_title: String,
    pub issue_description: String,
    pub repository: String,
    pub current_state: IssueState,
    pub previous_states: Vec<IssueState>,
    pub state_transitions: Vec<StateTransition>,
    pub iteration_count: u32,
    pub max_iterations: u32,
    pub blocking_issues: Vec<String>,
    /// Latest output per role, available to later steps.
    pub step_outputs: HashMap<WorkerRole, Value>,
    /// Guidance attached by the routing policy for the next worker attempt.
    pub feedback: Map<String, Value>,
    /// Replies delivered by resumption events, oldest first.
    pub human_inputs: Vec<String>,
    pub pull_request: Option<PullRequest>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Read-only projection for observability.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSummary {
    pub issue_number: u64,
    pub current_state: IssueState,
    pub states_visited: Vec<IssueState>,
    pub total_iterations: u32,
    pub is_terminal: bool,
    pub is_waiting_for_human: bool,
    pub blocking_issues: Vec<String>,
    pub duration_seconds: i64,
}

impl WorkflowContext {
    pub fn new(
        issue_number: u64,
        issue_title: &str,
        issue_description: &str,
        repository: &str,
        max_iterations: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            issue_number,
            issue_title: issue_title.to_string(),
            issue_description: issue_description.to_string(),
            repository: repository.to_string(),
            current_state: IssueState::Received,
            previous_states: Vec::new(),
            state_transitions: Vec::new(),
            iteration_count: 0,
            max_iterations,
            blocking_issues: Vec::new(),
            step_outputs: HashMap::new(),
            feedback: Map::new(),
            human_inputs: Vec::new(),
            pull_request: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Commit a state transition.
    ///
    /// Validates against the transition graph first; on an illegal transition
    /// returns `InvalidTransition` and mutates nothing. On success the
    /// transition is recorded, the iteration counter increments by exactly
    /// one, and `completed_at` is set when the new state is terminal.
    pub fn transition_to(
        &mut self,
        new_state: IssueState,
        reason: &str,
        triggered_by: Trigger,
    ) -> Result<()> {
        if !is_valid_transition(self.current_state, new_state) {
            return Err(AppError::InvalidTransition {
                from: self.current_state,
                to: new_state,
            });
        }

        let now = Utc::now();
        tracing::debug!(
            issue = self.issue_number,
            from = %self.current_state,
            to = %new_state,
            reason = reason,
            "State transition"
        );

        self.state_transitions.push(StateTransition {
            from: self.current_state,
            to: new_state,
            timestamp: now,
            reason: reason.to_string(),
            triggered_by,
        });
        self.previous_states.push(self.current_state);
        self.current_state = new_state;
        self.iteration_count += 1;
        self.updated_at = now;
        if new_state.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Whether the workflow is cycling without progress: the last `window`
    /// visited states contain at most 2 distinct values.
    pub fn is_in_loop(&self, window: usize) -> bool {
        if self.previous_states.len() < window {
            return false;
        }
        let recent = &self.previous_states[self.previous_states.len() - window..];
        let mut distinct: Vec<IssueState> = Vec::with_capacity(window);
        for state in recent {
            if !distinct.contains(state) {
                distinct.push(*state);
            }
        }
        distinct.len() <= 2
    }

    pub fn is_terminal(&self) -> bool {
        self.current_state.is_terminal()
    }

    pub fn is_waiting_for_human(&self) -> bool {
        self.current_state.is_waiting()
    }

    pub fn record_step_output(&mut self, role: WorkerRole, output: Value) {
        self.step_outputs.insert(role, output);
        self.updated_at = Utc::now();
    }

    pub fn set_feedback(&mut self, feedback: Map<String, Value>) {
        self.feedback = feedback;
    }

    pub fn add_blocking_issue(&mut self, issue: &str) {
        self.blocking_issues.push(issue.to_string());
        self.updated_at = Utc::now();
    }

    pub fn push_human_input(&mut self, input: &str) {
        self.human_inputs.push(input.to_string());
        self.updated_at = Utc::now();
    }

    pub fn set_pull_request(&mut self, pr: PullRequest) {
        self.pull_request = Some(pr);
        self.updated_at = Utc::now();
    }

    /// The last `n` visited states, most recent last. Used as diagnostic
    /// context when escalating a detected loop.
    pub fn recent_states(&self, n: usize) -> Vec<IssueState> {
        let start = self.previous_states.len().saturating_sub(n);
        self.previous_states[start..].to_vec()
    }

    /// Read-only view handed to workers.
    pub fn view(&self) -> ContextView {
        ContextView {
            issue_number: self.issue_number,
            issue_title: self.issue_title.clone(),
            issue_description: self.issue_description.clone(),
            repository: self.repository.clone(),
            current_state: self.current_state,
            step_outputs: self.step_outputs.clone(),
            feedback: self.feedback.clone(),
            human_inputs: self.human_inputs.clone(),
        }
    }

    pub fn summary(&self) -> WorkflowSummary {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        WorkflowSummary {
            issue_number: self.issue_number,
            current_state: self.current_state,
            states_visited: self.previous_states.clone(),
            total_iterations: self.iteration_count,
            is_terminal: self.is_terminal(),
            is_waiting_for_human: self.is_waiting_for_human(),
            blocking_issues: self.blocking_issues.clone(),
            duration_seconds: (end - self.created_at).num_seconds(),
        }
    }
}
