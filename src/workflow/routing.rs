use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{AppError, Result};
use crate::state::{IssueState, WorkerRole};
use crate::worker::{StepResult, StepStatus};
use crate::workflow::context::WorkflowContext;
use crate::workflow::quality::QualityGate;

/// Orchestration-only actions the controller performs through the
/// integration shim before committing the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Post clarification questions on the issue and wait.
    PostQuestions,
    /// Ask a human for input on the issue and wait.
    RequestHumanInput,
    /// Escalate a stuck workflow to human intervention.
    Escalate,
    /// Close out the workflow at the iteration ceiling, with warnings.
    ForceComplete,
    /// Stop the workflow as failed.
    Halt,
    /// Plain transition, no external effect.
    Advance,
}

/// Who acts next: a worker in the pipeline, or the orchestrator itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionTarget {
    Worker(WorkerRole),
    Orchestrator(Directive),
}

/// The routing decision for one controller iteration. Produced by
/// [`RoutingPolicy::decide`], consumed by `apply_action`, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NextAction {
    pub target: ActionTarget,
    pub next_state: IssueState,
    pub input: Map<String, Value>,
    pub reason: String,
}

impl NextAction {
    fn advance(next_state: IssueState, reason: &str) -> Self {
        let target = match next_state.responsible_worker() {
            Some(role) => ActionTarget::Worker(role),
            None => ActionTarget::Orchestrator(Directive::Advance),
        };
        Self {
            target,
            next_state,
            input: Map::new(),
            reason: reason.to_string(),
        }
    }

    fn orchestrate(directive: Directive, next_state: IssueState, reason: &str) -> Self {
        Self {
            target: ActionTarget::Orchestrator(directive),
            next_state,
            input: Map::new(),
            reason: reason.to_string(),
        }
    }

    fn with_input(mut self, key: &str, value: Value) -> Self {
        self.input.insert(key.to_string(), value);
        self
    }
}

/// Confidence thresholds and limits driving the routing decisions.
///
/// These are policy, not constants: the low implementation bar in particular
/// trades review burden for PR throughput and is an operator choice.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    /// Analysis must clear this to move on to test creation.
    #[serde(default = "default_analysis_threshold")]
    pub analysis_confidence_threshold: f64,
    /// Test authoring must clear this to move on to implementation.
    #[serde(default = "default_test_threshold")]
    pub test_confidence_threshold: f64,
    /// Implementation above this goes straight to a pull request.
    #[serde(default = "default_implementation_threshold")]
    pub implementation_confidence_threshold: f64,
    /// Below this, stop retrying and ask a human.
    #[serde(default = "default_escalation_floor")]
    pub human_escalation_floor: f64,
    /// Validation warnings above this trigger a refactoring pass.
    #[serde(default = "default_warning_limit")]
    pub warning_refactor_limit: u32,
    /// How many recent states the loop detector examines.
    #[serde(default = "default_loop_window")]
    pub loop_window: usize,
}

fn default_analysis_threshold() -> f64 {
    0.8
}

fn default_test_threshold() -> f64 {
    0.7
}

fn default_implementation_threshold() -> f64 {
    0.5
}

fn default_escalation_floor() -> f64 {
    0.3
}

fn default_warning_limit() -> u32 {
    5
}

fn default_loop_window() -> usize {
    3
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            analysis_confidence_threshold: default_analysis_threshold(),
            test_confidence_threshold: default_test_threshold(),
            implementation_confidence_threshold: default_implementation_threshold(),
            human_escalation_floor: default_escalation_floor(),
            warning_refactor_limit: default_warning_limit(),
            loop_window: default_loop_window(),
        }
    }
}

/// The decision engine: maps a step result plus context to the next action.
///
/// Priority order: quality-gate failure, loop detection, iteration ceiling,
/// human-input requests, then the deterministic progression table. A
/// non-terminal state the table does not cover is a configuration error and
/// surfaces as `UnhandledState`; the policy never guesses.
pub struct RoutingPolicy {
    config: RoutingConfig,
}

impl RoutingPolicy {
    pub fn new(config: RoutingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    pub fn decide(
        &self,
        step: &StepResult,
        ctx: &WorkflowContext,
        gate: &QualityGate,
    ) -> Result<NextAction> {
        if !gate.passes(step) {
            return self.quality_failure(step, ctx, gate);
        }

        if ctx.is_in_loop(self.config.loop_window) {
            return Ok(self.escalate_loop(ctx));
        }

        if ctx.iteration_count > ctx.max_iterations {
            return Ok(self.force_complete(ctx));
        }

        if let Some(action) = self.human_input_request(step, ctx) {
            return Ok(action);
        }

        self.standard_progression(step, ctx)
    }

    /// Gate failure handling, by state category.
    fn quality_failure(
        &self,
        step: &StepResult,
        ctx: &WorkflowContext,
        gate: &QualityGate,
    ) -> Result<NextAction> {
        let state = ctx.current_state;
        let violations = gate.violations(step);

        let action = match state {
            // Analysis: either the result is hopeless and a human should look,
            // or the analyst retries with focus hints.
            IssueState::AnalyzingRequirements | IssueState::PlanningApproach => {
                if step.confidence < self.config.human_escalation_floor {
                    NextAction::orchestrate(
                        Directive::RequestHumanInput,
                        IssueState::WaitingForHumanInput,
                        "analysis confidence below escalation floor",
                    )
                    .with_input("violations", Value::from(violations))
                } else {
                    NextAction {
                        target: ActionTarget::Worker(WorkerRole::Analyst),
                        next_state: state,
                        input: Map::new(),
                        reason: "analysis below quality gate, retrying with focus hints"
                            .to_string(),
                    }
                    .with_input("focus", Value::from(violations))
                }
            }
            // Implementation: hand the quality issues back to the developer.
            IssueState::Implementing
            | IssueState::Refactoring
            | IssueState::AddressingFeedback => NextAction::advance(
                IssueState::FixingIssues,
                "implementation below quality gate",
            )
            .with_input("quality_issues", Value::from(violations)),
            IssueState::FixingIssues => NextAction::advance(
                IssueState::Implementing,
                "fixes below quality gate, reimplementing",
            )
            .with_input("quality_issues", Value::from(violations)),
            // Delivery: a failed pull-request step ends the workflow. The
            // bounded retry budget lives inside the project-manager worker.
            IssueState::CreatingPr => NextAction::orchestrate(
                Directive::Halt,
                IssueState::Failed,
                "pull request creation failed",
            ),
            // Anything else with a responsible worker retries in place.
            s => match s.responsible_worker() {
                Some(role) => NextAction {
                    target: ActionTarget::Worker(role),
                    next_state: s,
                    input: Map::new(),
                    reason: "below quality gate, retrying".to_string(),
                }
                .with_input("focus", Value::from(violations)),
                None => NextAction::orchestrate(
                    Directive::Escalate,
                    IssueState::RequiresHumanIntervention,
                    "quality failure in orchestration state",
                ),
            },
        };

        Ok(action)
    }

    fn escalate_loop(&self, ctx: &WorkflowContext) -> NextAction {
        let recent: Vec<String> = ctx
            .recent_states(self.config.loop_window + 1)
            .iter()
            .map(ToString::to_string)
            .collect();
        NextAction::orchestrate(
            Directive::Escalate,
            IssueState::RequiresHumanIntervention,
            "loop detected, escalating to human intervention",
        )
        .with_input("recent_states", Value::from(recent))
    }

    fn force_complete(&self, ctx: &WorkflowContext) -> NextAction {
        NextAction::orchestrate(
            Directive::ForceComplete,
            IssueState::Completed,
            "iteration ceiling exceeded, completing with warnings",
        )
        .with_input("completed_with_warnings", Value::Bool(true))
        .with_input(
            "blocking_issues",
            Value::from(ctx.blocking_issues.clone()),
        )
    }

    /// Explicit requests for human input, checked after the mechanical guards.
    fn human_input_request(&self, step: &StepResult, ctx: &WorkflowContext) -> Option<NextAction> {
        let state = ctx.current_state;

        if step.status == StepStatus::NeedsClarification {
            let questions = step.clarification_questions();
            if !questions.is_empty() {
                let action = if matches!(
                    state,
                    IssueState::AnalyzingRequirements
                        | IssueState::PlanningApproach
                        | IssueState::RequirementsUnclear
                ) {
                    NextAction::orchestrate(
                        Directive::PostQuestions,
                        IssueState::WaitingForRequirementsClarification,
                        "worker needs requirements clarification",
                    )
                } else {
                    NextAction::orchestrate(
                        Directive::RequestHumanInput,
                        IssueState::WaitingForHumanInput,
                        "worker needs human input",
                    )
                };
                return Some(action.with_input("questions", Value::from(questions)));
            }
            // No concrete questions yet: fall through so the progression
            // table can route back to analysis to formulate them.
        }

        if state == IssueState::RequirementsUnclear {
            let questions = pending_questions(ctx);
            if !questions.is_empty() {
                return Some(
                    NextAction::orchestrate(
                        Directive::PostQuestions,
                        IssueState::WaitingForRequirementsClarification,
                        "posting open clarification questions",
                    )
                    .with_input("questions", Value::from(questions)),
                );
            }
        }

        if step.confidence < self.config.human_escalation_floor
            && step.status == StepStatus::Success
            && state.responsible_worker().is_some()
        {
            return Some(NextAction::orchestrate(
                Directive::RequestHumanInput,
                IssueState::WaitingForHumanInput,
                "confidence below absolute floor",
            ));
        }

        None
    }

    /// Deterministic state-progression rules.
    fn standard_progression(&self, step: &StepResult, ctx: &WorkflowContext) -> Result<NextAction> {
        let cfg = &self.config;
        let success = step.status == StepStatus::Success;

        let action = match ctx.current_state {
            IssueState::Received => {
                NextAction::advance(IssueState::AnalyzingRequirements, "issue received")
            }
            IssueState::AnalyzingRequirements => {
                if step.status == StepStatus::NeedsClarification {
                    NextAction::advance(
                        IssueState::RequirementsUnclear,
                        "analysis needs clarification",
                    )
                } else if step.confidence >= cfg.analysis_confidence_threshold {
                    NextAction::advance(IssueState::CreatingTests, "requirements understood")
                } else {
                    NextAction::advance(
                        IssueState::RequirementsUnclear,
                        "analysis confidence below threshold",
                    )
                }
            }
            IssueState::RequirementsUnclear => {
                // Questions were handled above; none left means re-analysis.
                NextAction::advance(
                    IssueState::AnalyzingRequirements,
                    "no open questions, re-analyzing",
                )
            }
            IssueState::RequirementsClarified => NextAction::advance(
                IssueState::PlanningApproach,
                "clarification received, planning approach",
            ),
            IssueState::PlanningApproach => {
                if step.confidence >= cfg.analysis_confidence_threshold {
                    NextAction::advance(IssueState::CreatingTests, "approach planned")
                } else {
                    NextAction::advance(
                        IssueState::AnalyzingRequirements,
                        "plan confidence below threshold, re-analyzing",
                    )
                }
            }
            IssueState::CreatingTests => {
                if success && step.confidence > cfg.test_confidence_threshold {
                    NextAction::advance(IssueState::Implementing, "tests written")
                } else {
                    NextAction::advance(
                        IssueState::AnalyzingRequirements,
                        "test creation inconclusive, revisiting analysis",
                    )
                }
            }
            IssueState::UpdatingTests => {
                if success && step.confidence > cfg.test_confidence_threshold {
                    NextAction::advance(IssueState::RunningTests, "tests updated")
                } else {
                    NextAction::advance(
                        IssueState::CreatingTests,
                        "test update inconclusive, recreating tests",
                    )
                }
            }
            IssueState::RunningTests => {
                if step.output_flag("tests_passed") {
                    NextAction::advance(IssueState::CreatingPr, "tests passed")
                } else {
                    NextAction::advance(IssueState::FixingIssues, "tests failed")
                }
            }
            IssueState::Implementing => {
                if step.confidence > cfg.implementation_confidence_threshold {
                    NextAction::advance(IssueState::CreatingPr, "implementation ready")
                } else {
                    NextAction::advance(
                        IssueState::FixingIssues,
                        "implementation confidence below threshold",
                    )
                }
            }
            IssueState::FixingIssues => {
                if step.confidence > cfg.implementation_confidence_threshold {
                    NextAction::advance(IssueState::CreatingPr, "fixes ready")
                } else {
                    NextAction::advance(
                        IssueState::Implementing,
                        "fixes insufficient, reimplementing",
                    )
                }
            }
            IssueState::Refactoring => {
                if step.confidence > cfg.implementation_confidence_threshold {
                    NextAction::advance(IssueState::ValidatingSolution, "refactoring done")
                } else {
                    NextAction::advance(IssueState::FixingIssues, "refactoring regressed")
                }
            }
            IssueState::ValidatingSolution => {
                let metrics = step.quality_metrics.as_ref();
                let critical = metrics.map_or(0, |m| m.critical_issues_count);
                let warnings = metrics.map_or(0, |m| m.warnings_count);
                if critical > 0 {
                    NextAction::advance(
                        IssueState::FixingIssues,
                        "validation found critical issues",
                    )
                } else if warnings > cfg.warning_refactor_limit {
                    NextAction::advance(
                        IssueState::Refactoring,
                        "validation warnings above refactor limit",
                    )
                } else {
                    NextAction::advance(IssueState::CreatingPr, "solution validated")
                }
            }
            IssueState::AddressingFeedback => {
                if step.output_flag("tests_affected") {
                    NextAction::advance(IssueState::UpdatingTests, "feedback touched tests")
                } else if step.confidence > cfg.implementation_confidence_threshold {
                    NextAction::advance(IssueState::ValidatingSolution, "feedback addressed")
                } else {
                    NextAction::advance(
                        IssueState::FixingIssues,
                        "feedback handling below threshold",
                    )
                }
            }
            IssueState::CreatingPr => {
                if success {
                    NextAction::advance(IssueState::Completed, "pull request created")
                } else {
                    NextAction::orchestrate(
                        Directive::Halt,
                        IssueState::Failed,
                        "pull request creation failed",
                    )
                }
            }
            IssueState::HumanInputReceived => {
                if ctx.pull_request.is_some() {
                    NextAction::advance(
                        IssueState::AddressingFeedback,
                        "human feedback on open pull request",
                    )
                } else {
                    NextAction::advance(
                        IssueState::AnalyzingRequirements,
                        "re-analyzing with human input",
                    )
                }
            }
            state => return Err(AppError::UnhandledState(state)),
        };

        Ok(action)
    }
}

/// Clarification questions the analyst left in its last output.
fn pending_questions(ctx: &WorkflowContext) -> Vec<String> {
    ctx.step_outputs
        .get(&WorkerRole::Analyst)
        .and_then(|output| output.get("clarification_questions"))
        .and_then(Value::as_array)
        .map(|qs| {
            qs.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}
