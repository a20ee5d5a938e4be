//! Workflow state model: the set of issue-processing states, the legal
//! transition graph, and the worker role responsible for each state.
//!
//! Everything here is a pure lookup. The graph is the single source of truth
//! for transition legality; `WorkflowContext::transition_to` consults it and
//! nothing else mutates workflow state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Processing state of one issue.
///
/// `Completed`, `Failed`, and `RequiresHumanIntervention` are terminal: they
/// have no legal successors. The `WaitingFor*` states and `Blocked` have no
/// responsible worker and are only left via an externally delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    Received,
    AnalyzingRequirements,
    RequirementsUnclear,
    WaitingForRequirementsClarification,
    RequirementsClarified,
    PlanningApproach,
    CreatingTests,
    UpdatingTests,
    RunningTests,
    Implementing,
    FixingIssues,
    Refactoring,
    ValidatingSolution,
    AddressingFeedback,
    CreatingPr,
    Completed,
    WaitingForHumanInput,
    HumanInputReceived,
    Failed,
    Blocked,
    RequiresHumanIntervention,
}

/// All states, for exhaustive checks.
pub const ALL_STATES: [IssueState; 21] = [
    IssueState::Received,
    IssueState::AnalyzingRequirements,
    IssueState::RequirementsUnclear,
    IssueState::WaitingForRequirementsClarification,
    IssueState::RequirementsClarified,
    IssueState::PlanningApproach,
    IssueState::CreatingTests,
    IssueState::UpdatingTests,
    IssueState::RunningTests,
    IssueState::Implementing,
    IssueState::FixingIssues,
    IssueState::Refactoring,
    IssueState::ValidatingSolution,
    IssueState::AddressingFeedback,
    IssueState::CreatingPr,
    IssueState::Completed,
    IssueState::WaitingForHumanInput,
    IssueState::HumanInputReceived,
    IssueState::Failed,
    IssueState::Blocked,
    IssueState::RequiresHumanIntervention,
];

impl IssueState {
    /// Whether this state ends processing (no legal successors).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::RequiresHumanIntervention
        )
    }

    /// Whether this state suspends processing until an external event arrives.
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            Self::WaitingForRequirementsClarification | Self::WaitingForHumanInput | Self::Blocked
        )
    }

    /// Non-terminal, non-waiting: the controller loop keeps running here.
    pub fn is_active(self) -> bool {
        !self.is_terminal() && !self.is_waiting()
    }

    /// The worker role that executes in this state, if any.
    ///
    /// `None` means the state is handled by orchestration alone: waiting and
    /// terminal states, plus the decision-only states where the routing policy
    /// works from accumulated outputs rather than a fresh worker call.
    pub fn responsible_worker(self) -> Option<WorkerRole> {
        match self {
            Self::AnalyzingRequirements | Self::PlanningApproach => Some(WorkerRole::Analyst),
            Self::CreatingTests
            | Self::UpdatingTests
            | Self::RunningTests
            | Self::ValidatingSolution => Some(WorkerRole::Tester),
            Self::Implementing
            | Self::FixingIssues
            | Self::Refactoring
            | Self::AddressingFeedback => Some(WorkerRole::Developer),
            Self::CreatingPr => Some(WorkerRole::ProjectManager),
            _ => None,
        }
    }
}

impl fmt::Display for IssueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "Received",
            Self::AnalyzingRequirements => "AnalyzingRequirements",
            Self::RequirementsUnclear => "RequirementsUnclear",
            Self::WaitingForRequirementsClarification => "WaitingForRequirementsClarification",
            Self::RequirementsClarified => "RequirementsClarified",
            Self::PlanningApproach => "PlanningApproach",
            Self::CreatingTests => "CreatingTests",
            Self::UpdatingTests => "UpdatingTests",
            Self::RunningTests => "RunningTests",
            Self::Implementing => "Implementing",
            Self::FixingIssues => "FixingIssues",
            Self::Refactoring => "Refactoring",
            Self::ValidatingSolution => "ValidatingSolution",
            Self::AddressingFeedback => "AddressingFeedback",
            Self::CreatingPr => "CreatingPr",
            Self::Completed => "Completed",
            Self::WaitingForHumanInput => "WaitingForHumanInput",
            Self::HumanInputReceived => "HumanInputReceived",
            Self::Failed => "Failed",
            Self::Blocked => "Blocked",
            Self::RequiresHumanIntervention => "RequiresHumanIntervention",
        };
        write!(f, "{name}")
    }
}

/// The specialized workers in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Analyst,
    Tester,
    Developer,
    ProjectManager,
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Analyst => "analyst",
            Self::Tester => "tester",
            Self::Developer => "developer",
            Self::ProjectManager => "project-manager",
        };
        write!(f, "{name}")
    }
}

/// Legal transitions between issue states.
///
/// The graph encodes:
/// - `Failed` and `RequiresHumanIntervention` reachable from every non-terminal
///   state (uniform escape hatch).
/// - `Completed`, `WaitingForHumanInput`, and `Blocked` reachable from every
///   active state (forced completion at the iteration ceiling; low-confidence
///   escalation; an externally imposed hold).
/// - Self-edges exactly on the states where the routing policy issues a
///   same-state retry, so a retry is a recorded transition like any other.
/// - Explicit edges for the deterministic progression table.
///
/// Terminal states have no outgoing edges. Anything not listed is illegal and
/// `transition_to` refuses it; there is no implicit fallback.
pub fn is_valid_transition(from: IssueState, to: IssueState) -> bool {
    use IssueState::*;

    if from.is_terminal() {
        return false;
    }

    if matches!(to, Failed | RequiresHumanIntervention) {
        return true;
    }

    if matches!(to, Completed | WaitingForHumanInput | Blocked) && from.is_active() {
        return true;
    }

    matches!(
        (from, to),
        (Received, AnalyzingRequirements)
            // Analysis: retry, regress to clarification, or progress to tests
            | (AnalyzingRequirements, AnalyzingRequirements)
            | (AnalyzingRequirements, RequirementsUnclear)
            | (AnalyzingRequirements, CreatingTests)
            | (AnalyzingRequirements, WaitingForRequirementsClarification)
            | (RequirementsUnclear, WaitingForRequirementsClarification)
            | (RequirementsUnclear, AnalyzingRequirements)
            | (WaitingForRequirementsClarification, RequirementsClarified)
            | (RequirementsClarified, PlanningApproach)
            | (PlanningApproach, PlanningApproach)
            | (PlanningApproach, CreatingTests)
            | (PlanningApproach, AnalyzingRequirements)
            | (PlanningApproach, WaitingForRequirementsClarification)
            // Test authoring and execution
            | (CreatingTests, CreatingTests)
            | (CreatingTests, Implementing)
            | (CreatingTests, AnalyzingRequirements)
            | (UpdatingTests, UpdatingTests)
            | (UpdatingTests, RunningTests)
            | (UpdatingTests, CreatingTests)
            | (RunningTests, RunningTests)
            | (RunningTests, CreatingPr)
            | (RunningTests, FixingIssues)
            // Implementation and repair
            | (Implementing, CreatingPr)
            | (Implementing, FixingIssues)
            | (FixingIssues, CreatingPr)
            | (FixingIssues, Implementing)
            | (Refactoring, ValidatingSolution)
            | (Refactoring, FixingIssues)
            | (ValidatingSolution, ValidatingSolution)
            | (ValidatingSolution, FixingIssues)
            | (ValidatingSolution, Refactoring)
            | (ValidatingSolution, CreatingPr)
            | (AddressingFeedback, UpdatingTests)
            | (AddressingFeedback, ValidatingSolution)
            | (AddressingFeedback, FixingIssues)
            // Human input resumption
            | (WaitingForHumanInput, HumanInputReceived)
            | (Blocked, HumanInputReceived)
            | (HumanInputReceived, AddressingFeedback)
            | (HumanInputReceived, AnalyzingRequirements)
    )
}
