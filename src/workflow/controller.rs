use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::{AppError, Result};
use crate::platform::types::{CommentKind, PullRequest};
use crate::platform::Platform;
use crate::state::IssueState;
use crate::worker::{StepResult, WorkerSet, WorkerTask};
use crate::workflow::context::{Trigger, WorkflowContext, WorkflowSummary};
use crate::workflow::quality::QualityGate;
use crate::workflow::routing::{ActionTarget, Directive, NextAction, RoutingPolicy};

/// External event that resumes a waiting workflow.
#[derive(Debug, Clone)]
pub enum ResumeEvent {
    /// A reply to posted clarification questions.
    Clarification(String),
    /// A reply to a human-input request.
    HumanReply(String),
    /// A blocked workflow was unblocked.
    Unblocked,
}

impl ResumeEvent {
    fn body(&self) -> Option<&str> {
        match self {
            Self::Clarification(body) | Self::HumanReply(body) => Some(body),
            Self::Unblocked => None,
        }
    }
}

/// Drives one workflow context from `Received` to a terminal or waiting
/// state.
///
/// The loop is sequential per workflow: each step's outcome determines the
/// next step's task. Worker calls run under a bounded timeout; errors and
/// timeouts become failed step results so every failure cause routes through
/// the same policy path.
pub struct WorkflowController {
    workers: Arc<WorkerSet>,
    platform: Arc<dyn Platform>,
    policy: RoutingPolicy,
    gate: QualityGate,
    worker_timeout: Duration,
}

impl WorkflowController {
    pub fn new(
        workers: Arc<WorkerSet>,
        platform: Arc<dyn Platform>,
        policy: RoutingPolicy,
        gate: QualityGate,
        worker_timeout: Duration,
    ) -> Self {
        Self {
            workers,
            platform,
            policy,
            gate,
            worker_timeout,
        }
    }

    /// Run the workflow loop until it terminates or suspends.
    ///
    /// `is_cancelled` is checked at the top of every iteration; in-flight
    /// worker calls are not interrupted.
    pub async fn run<F, Fut>(
        &self,
        ctx: &mut WorkflowContext,
        is_cancelled: F,
    ) -> Result<WorkflowSummary>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        while self.run_once(ctx, &is_cancelled).await? {}
        Ok(ctx.summary())
    }

    /// Run a single loop iteration. Returns false once the workflow has
    /// reached a terminal or waiting state.
    ///
    /// Callers that share the context behind a lock (the workflow store) can
    /// release it between iterations, so observers are only blocked for one
    /// step at a time.
    pub async fn run_once<F, Fut>(&self, ctx: &mut WorkflowContext, is_cancelled: &F) -> Result<bool>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        if ctx.is_terminal() || ctx.is_waiting_for_human() {
            return Ok(false);
        }

        if is_cancelled().await {
            tracing::info!(issue = ctx.issue_number, "Workflow cancelled");
            ctx.transition_to(IssueState::Failed, "cancelled", Trigger::Controller)?;
            return Ok(false);
        }

        let window = self.policy.config().loop_window;
        if ctx.is_in_loop(window) {
            let action = NextAction {
                target: ActionTarget::Orchestrator(Directive::Escalate),
                next_state: IssueState::RequiresHumanIntervention,
                input: serde_json::Map::from_iter([(
                    "recent_states".to_string(),
                    Value::from(
                        ctx.recent_states(window + 1)
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>(),
                    ),
                )]),
                reason: "loop detected, escalating to human intervention".to_string(),
            };
            self.apply_action(ctx, &action).await?;
            return Ok(true);
        }

        if ctx.iteration_count > ctx.max_iterations {
            let action = NextAction {
                target: ActionTarget::Orchestrator(Directive::ForceComplete),
                next_state: IssueState::Completed,
                input: serde_json::Map::from_iter([(
                    "completed_with_warnings".to_string(),
                    Value::Bool(true),
                )]),
                reason: "iteration ceiling exceeded, completing with warnings".to_string(),
            };
            self.apply_action(ctx, &action).await?;
            return Ok(true);
        }

        let step = self.execute_state(ctx).await;

        if !step.output.is_empty() {
            ctx.record_step_output(step.agent, Value::Object(step.output.clone()));
        }
        capture_pull_request(ctx, &step);

        let action = match self.policy.decide(&step, ctx, &self.gate) {
            Ok(action) => action,
            Err(AppError::UnhandledState(state)) => {
                tracing::error!(
                    issue = ctx.issue_number,
                    state = %state,
                    "No routing rule for state"
                );
                ctx.add_blocking_issue(&format!("no routing rule for state {state}"));
                ctx.transition_to(
                    IssueState::Failed,
                    "unhandled state in routing policy",
                    Trigger::Controller,
                )?;
                return Ok(true);
            }
            Err(e) => return Err(e),
        };

        tracing::info!(
            issue = ctx.issue_number,
            state = %ctx.current_state,
            next = %action.next_state,
            reason = %action.reason,
            "Routing decision"
        );

        self.apply_action(ctx, &action).await?;
        Ok(true)
    }

    /// Record an external event on a waiting workflow: the waiting state
    /// transitions into its paired received state and the reply body is kept
    /// for the workers. The loop is not re-entered here.
    pub fn apply_resume_event(&self, ctx: &mut WorkflowContext, event: &ResumeEvent) -> Result<()> {
        let received = match ctx.current_state {
            IssueState::WaitingForRequirementsClarification => IssueState::RequirementsClarified,
            IssueState::WaitingForHumanInput | IssueState::Blocked => {
                IssueState::HumanInputReceived
            }
            state => {
                return Err(AppError::Internal(format!(
                    "workflow for issue #{} is not waiting (state {state})",
                    ctx.issue_number
                )))
            }
        };

        if let Some(body) = event.body() {
            ctx.push_human_input(body);
        }
        ctx.transition_to(received, "external event received", Trigger::External)
    }

    /// Resume a waiting workflow with an external event, then re-enter the
    /// loop.
    pub async fn resume<F, Fut>(
        &self,
        ctx: &mut WorkflowContext,
        event: ResumeEvent,
        is_cancelled: F,
    ) -> Result<WorkflowSummary>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        self.apply_resume_event(ctx, &event)?;
        self.run(ctx, is_cancelled).await
    }

    /// Execute the worker bound to the current state.
    ///
    /// States with no responsible worker produce a synthetic success so the
    /// routing policy can decide from context alone. Worker errors, missing
    /// registrations, and timeouts all become failed step results.
    async fn execute_state(&self, ctx: &WorkflowContext) -> StepResult {
        let Some(role) = ctx.current_state.responsible_worker() else {
            return StepResult::orchestration();
        };

        let Some(worker) = self.workers.get(role) else {
            tracing::error!(role = %role, "No worker registered for role");
            return StepResult::failure(role, &format!("no worker registered for role {role}"));
        };

        let task = state_task(ctx);
        let view = ctx.view();

        tracing::info!(
            issue = ctx.issue_number,
            state = %ctx.current_state,
            role = %role,
            "Executing worker"
        );

        match tokio::time::timeout(self.worker_timeout, worker.execute(&task, &view)).await {
            Ok(Ok(step)) => step,
            Ok(Err(e)) => {
                tracing::warn!(role = %role, error = %e, "Worker execution failed");
                StepResult::failure(role, &e.to_string())
            }
            Err(_) => {
                tracing::warn!(
                    role = %role,
                    timeout_secs = self.worker_timeout.as_secs(),
                    "Worker execution timed out"
                );
                StepResult::failure(role, "timeout")
            }
        }
    }

    /// Perform the action's external effect, if any, then commit its state
    /// transition. Comment posting is best-effort; delivery failures are the
    /// project-manager worker's concern.
    async fn apply_action(&self, ctx: &mut WorkflowContext, action: &NextAction) -> Result<()> {
        if let ActionTarget::Orchestrator(directive) = action.target {
            match directive {
                Directive::PostQuestions => {
                    let body = format!(
                        "I need some clarification before I can proceed:\n\n{}\n\nReply to this issue to continue.",
                        format_list(action.input.get("questions"))
                    );
                    self.post(ctx, CommentKind::Clarification, &body).await;
                }
                Directive::RequestHumanInput => {
                    let body = format!(
                        "I'm not confident enough to continue on my own: {}.\n\nReply to this issue to continue.",
                        action.reason
                    );
                    self.post(ctx, CommentKind::HumanInput, &body).await;
                }
                Directive::Escalate => {
                    ctx.add_blocking_issue(&action.reason);
                    let body = format!(
                        "This issue needs human intervention: {}.\n\nRecently visited states:\n{}",
                        action.reason,
                        format_list(action.input.get("recent_states"))
                    );
                    self.post(ctx, CommentKind::HumanInput, &body).await;
                }
                Directive::ForceComplete => {
                    ctx.add_blocking_issue(&format!(
                        "iteration ceiling of {} exceeded",
                        ctx.max_iterations
                    ));
                    let body = format!(
                        "Completed with warnings after reaching the iteration limit.\n\nOpen concerns:\n{}",
                        format_lines(&ctx.blocking_issues)
                    );
                    self.post(ctx, CommentKind::Status, &body).await;
                }
                Directive::Halt => {
                    ctx.add_blocking_issue(&action.reason);
                    let body = format!("Stopping work on this issue: {}.", action.reason);
                    self.post(ctx, CommentKind::Status, &body).await;
                }
                Directive::Advance => {}
            }
        }

        ctx.set_feedback(action.input.clone());
        ctx.transition_to(action.next_state, &action.reason, Trigger::Policy)
    }

    async fn post(&self, ctx: &WorkflowContext, kind: CommentKind, body: &str) {
        if let Err(e) = self
            .platform
            .post_comment(ctx.issue_number, kind, body)
            .await
        {
            tracing::warn!(
                issue = ctx.issue_number,
                kind = ?kind,
                error = %e,
                "Failed to post comment"
            );
        }
    }
}

/// The task handed to the responsible worker for the current state.
fn state_task(ctx: &WorkflowContext) -> WorkerTask {
    let description = match ctx.current_state {
        IssueState::AnalyzingRequirements => {
            "Analyze the issue and produce acceptance criteria"
        }
        IssueState::PlanningApproach => "Plan the implementation approach",
        IssueState::CreatingTests => "Write failing tests for the acceptance criteria",
        IssueState::UpdatingTests => "Update the tests for the revised change",
        IssueState::RunningTests => "Run the test suite and report results",
        IssueState::ValidatingSolution => {
            "Validate the full solution against the acceptance criteria"
        }
        IssueState::Implementing => "Implement the change",
        IssueState::FixingIssues => "Fix the reported issues",
        IssueState::Refactoring => "Refactor the change without altering behavior",
        IssueState::AddressingFeedback => "Address the review feedback",
        IssueState::CreatingPr => "Deliver the change as a pull request",
        other => {
            // No worker ever executes here; the description is for logs only.
            return WorkerTask {
                id: task_id(ctx),
                description: format!("orchestration step in {other}"),
                kind: other,
            };
        }
    };
    WorkerTask {
        id: task_id(ctx),
        description: description.to_string(),
        kind: ctx.current_state,
    }
}

fn task_id(ctx: &WorkflowContext) -> String {
    format!(
        "issue-{}-{}-{}",
        ctx.issue_number, ctx.current_state, ctx.iteration_count
    )
}

/// Remember the pull request once the delivery step reports one.
fn capture_pull_request(ctx: &mut WorkflowContext, step: &StepResult) {
    let number = step.output.get("pr_number").and_then(Value::as_u64);
    let url = step.output.get("pr_url").and_then(Value::as_str);
    if let (Some(number), Some(url)) = (number, url) {
        ctx.set_pull_request(PullRequest {
            number,
            url: url.to_string(),
            head_branch: step
                .output
                .get("head_branch")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            base_branch: step
                .output
                .get("base_branch")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }
}

fn format_list(value: Option<&Value>) -> String {
    let items: Vec<String> = value
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    format_lines(&items)
}

fn format_lines(items: &[String]) -> String {
    if items.is_empty() {
        return "- (none recorded)".to_string();
    }
    items
        .iter()
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::platform::types::CreatePullRequest;
    use crate::state::WorkerRole;
    use crate::worker::pm::ProjectManagerWorker;
    use crate::worker::{ContextView, StepStatus, Worker};
    use crate::workflow::routing::RoutingConfig;

    struct MockPlatform {
        comments: Mutex<Vec<(CommentKind, String)>>,
        pr_attempts: AtomicU32,
        fail_pr: bool,
        has_changes: bool,
    }

    impl MockPlatform {
        fn new() -> Self {
            Self {
                comments: Mutex::new(Vec::new()),
                pr_attempts: AtomicU32::new(0),
                fail_pr: false,
                has_changes: true,
            }
        }

        fn failing_pr() -> Self {
            Self {
                fail_pr: true,
                ..Self::new()
            }
        }

        fn comment_kinds(&self) -> Vec<CommentKind> {
            self.comments.lock().unwrap().iter().map(|(k, _)| *k).collect()
        }
    }

    #[async_trait]
    impl Platform for MockPlatform {
        async fn post_comment(
            &self,
            _issue_number: u64,
            kind: CommentKind,
            body: &str,
        ) -> crate::error::Result<()> {
            self.comments.lock().unwrap().push((kind, body.to_string()));
            Ok(())
        }

        async fn create_branch(&self, _branch: &str) -> crate::error::Result<()> {
            Ok(())
        }

        async fn commit_changes(&self, _message: &str) -> crate::error::Result<bool> {
            Ok(self.has_changes)
        }

        async fn push_branch(&self, _branch: &str) -> crate::error::Result<()> {
            Ok(())
        }

        async fn create_pull_request(
            &self,
            pr: &CreatePullRequest,
        ) -> crate::error::Result<crate::platform::types::PullRequest> {
            self.pr_attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_pr {
                return Err(AppError::GitHubApi("boom".to_string()));
            }
            Ok(crate::platform::types::PullRequest {
                number: 101,
                url: "https://github.com/acme/app/pull/101".to_string(),
                head_branch: pr.head_branch.clone(),
                base_branch: pr.base_branch.clone(),
            })
        }

        async fn read_existing_file(
            &self,
            _path: &Path,
        ) -> crate::error::Result<Option<String>> {
            Ok(None)
        }
    }

    /// Worker that replays a scripted sequence of results.
    struct ScriptedWorker {
        role: WorkerRole,
        results: Mutex<VecDeque<StepResult>>,
    }

    impl ScriptedWorker {
        fn new(role: WorkerRole, results: Vec<StepResult>) -> Self {
            Self {
                role,
                results: Mutex::new(results.into()),
            }
        }
    }

    #[async_trait]
    impl Worker for ScriptedWorker {
        fn role(&self) -> WorkerRole {
            self.role
        }

        async fn execute(
            &self,
            _task: &WorkerTask,
            _view: &ContextView,
        ) -> crate::error::Result<StepResult> {
            let next = self.results.lock().unwrap().pop_front();
            Ok(next.unwrap_or_else(|| StepResult::failure(self.role, "script exhausted")))
        }
    }

    struct ErroringWorker(WorkerRole);

    #[async_trait]
    impl Worker for ErroringWorker {
        fn role(&self) -> WorkerRole {
            self.0
        }

        async fn execute(
            &self,
            _task: &WorkerTask,
            _view: &ContextView,
        ) -> crate::error::Result<StepResult> {
            Err(AppError::WorkerExecution("connection reset".to_string()))
        }
    }

    struct SleepyWorker(WorkerRole);

    #[async_trait]
    impl Worker for SleepyWorker {
        fn role(&self) -> WorkerRole {
            self.0
        }

        async fn execute(
            &self,
            _task: &WorkerTask,
            _view: &ContextView,
        ) -> crate::error::Result<StepResult> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(StepResult::new(self.0, StepStatus::Success, 0.9))
        }
    }

    fn success(role: WorkerRole, confidence: f64) -> StepResult {
        StepResult::new(role, StepStatus::Success, confidence)
    }

    fn controller(
        workers: Vec<Box<dyn Worker>>,
        platform: Arc<MockPlatform>,
        gate: QualityGate,
    ) -> WorkflowController {
        WorkflowController::new(
            Arc::new(WorkerSet::new(workers)),
            platform,
            RoutingPolicy::new(RoutingConfig::default()),
            gate,
            Duration::from_secs(2),
        )
    }

    fn context() -> WorkflowContext {
        WorkflowContext::new(42, "Fix login", "Login breaks on empty password", "acme/app", 25)
    }

    fn never() -> impl Fn() -> std::future::Ready<bool> {
        || std::future::ready(false)
    }

    fn pm_worker(platform: Arc<MockPlatform>) -> Box<dyn Worker> {
        Box::new(ProjectManagerWorker::new(platform, "main", "conductor", 2))
    }

    #[tokio::test]
    async fn test_happy_path_reaches_completed() {
        let platform = Arc::new(MockPlatform::new());
        let workers: Vec<Box<dyn Worker>> = vec![
            Box::new(ScriptedWorker::new(
                WorkerRole::Analyst,
                vec![success(WorkerRole::Analyst, 0.9)],
            )),
            Box::new(ScriptedWorker::new(
                WorkerRole::Tester,
                vec![success(WorkerRole::Tester, 0.9)],
            )),
            Box::new(ScriptedWorker::new(
                WorkerRole::Developer,
                vec![success(WorkerRole::Developer, 0.9)
                    .with_output("summary", Value::String("reject empty passwords".into()))],
            )),
            pm_worker(Arc::clone(&platform)),
        ];
        let controller = controller(workers, Arc::clone(&platform), QualityGate::default());

        let mut ctx = context();
        let summary = controller.run(&mut ctx, never()).await.unwrap();

        assert_eq!(ctx.current_state, IssueState::Completed);
        assert!(summary.is_terminal);
        assert!(ctx.completed_at.is_some());
        assert_eq!(ctx.pull_request.as_ref().unwrap().number, 101);
        assert_eq!(
            ctx.previous_states,
            vec![
                IssueState::Received,
                IssueState::AnalyzingRequirements,
                IssueState::CreatingTests,
                IssueState::Implementing,
                IssueState::CreatingPr,
            ]
        );
        // Delivery posted a status comment with the PR link.
        assert!(platform
            .comment_kinds()
            .contains(&CommentKind::Status));
    }

    #[tokio::test]
    async fn test_confident_implementation_bypasses_further_fixes() {
        // Implementation at 0.55 goes straight to delivery when the gate
        // allows it: the deliberately low bar for getting PRs out.
        let platform = Arc::new(MockPlatform::new());
        let gate = QualityGate {
            min_confidence: 0.5,
            ..QualityGate::default()
        };
        let workers: Vec<Box<dyn Worker>> = vec![
            Box::new(ScriptedWorker::new(
                WorkerRole::Analyst,
                vec![success(WorkerRole::Analyst, 0.9)],
            )),
            Box::new(ScriptedWorker::new(
                WorkerRole::Tester,
                vec![success(WorkerRole::Tester, 0.9)],
            )),
            Box::new(ScriptedWorker::new(
                WorkerRole::Developer,
                vec![success(WorkerRole::Developer, 0.55)],
            )),
            pm_worker(Arc::clone(&platform)),
        ];
        let controller = controller(workers, Arc::clone(&platform), gate);

        let mut ctx = context();
        controller.run(&mut ctx, never()).await.unwrap();

        assert_eq!(ctx.current_state, IssueState::Completed);
        assert!(ctx
            .previous_states
            .windows(2)
            .any(|w| w == [IssueState::Implementing, IssueState::CreatingPr]));
    }

    #[tokio::test]
    async fn test_pr_failure_fails_workflow() {
        let platform = Arc::new(MockPlatform::failing_pr());
        let workers: Vec<Box<dyn Worker>> = vec![
            Box::new(ScriptedWorker::new(
                WorkerRole::Analyst,
                vec![success(WorkerRole::Analyst, 0.9)],
            )),
            Box::new(ScriptedWorker::new(
                WorkerRole::Tester,
                vec![success(WorkerRole::Tester, 0.9)],
            )),
            Box::new(ScriptedWorker::new(
                WorkerRole::Developer,
                vec![success(WorkerRole::Developer, 0.9)],
            )),
            pm_worker(Arc::clone(&platform)),
        ];
        let controller = controller(workers, Arc::clone(&platform), QualityGate::default());

        let mut ctx = context();
        let summary = controller.run(&mut ctx, never()).await.unwrap();

        assert_eq!(ctx.current_state, IssueState::Failed);
        assert!(ctx.completed_at.is_some());
        assert!(!summary.blocking_issues.is_empty());
        // The pm worker used its whole attempt budget before giving up.
        assert_eq!(platform.pr_attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_implementation_ping_pong_escalates() {
        // Developer oscillates between Implementing and FixingIssues until
        // the loop detector hands the issue to a human.
        let platform = Arc::new(MockPlatform::new());
        let gate = QualityGate {
            min_confidence: 0.5,
            ..QualityGate::default()
        };
        let workers: Vec<Box<dyn Worker>> = vec![
            Box::new(ScriptedWorker::new(
                WorkerRole::Analyst,
                vec![success(WorkerRole::Analyst, 0.9)],
            )),
            Box::new(ScriptedWorker::new(
                WorkerRole::Tester,
                vec![success(WorkerRole::Tester, 0.9)],
            )),
            Box::new(ScriptedWorker::new(
                WorkerRole::Developer,
                vec![
                    success(WorkerRole::Developer, 0.4),
                    success(WorkerRole::Developer, 0.4),
                    success(WorkerRole::Developer, 0.4),
                    success(WorkerRole::Developer, 0.4),
                ],
            )),
        ];
        let controller = controller(workers, Arc::clone(&platform), gate);

        let mut ctx = context();
        let summary = controller.run(&mut ctx, never()).await.unwrap();

        assert_eq!(ctx.current_state, IssueState::RequiresHumanIntervention);
        assert!(summary.is_terminal);
        assert!(!ctx.blocking_issues.is_empty());
        assert!(platform
            .comment_kinds()
            .contains(&CommentKind::HumanInput));
    }

    #[tokio::test]
    async fn test_iteration_ceiling_forces_completion_with_warnings() {
        let platform = Arc::new(MockPlatform::new());
        let workers: Vec<Box<dyn Worker>> = vec![
            Box::new(ScriptedWorker::new(
                WorkerRole::Analyst,
                vec![success(WorkerRole::Analyst, 0.9)],
            )),
            Box::new(ScriptedWorker::new(
                WorkerRole::Tester,
                vec![success(WorkerRole::Tester, 0.9)],
            )),
            Box::new(ScriptedWorker::new(
                WorkerRole::Developer,
                vec![success(WorkerRole::Developer, 0.75)],
            )),
        ];
        let controller = controller(workers, Arc::clone(&platform), QualityGate::default());

        let mut ctx =
            WorkflowContext::new(42, "Fix login", "Login breaks on empty password", "acme/app", 3);
        let summary = controller.run(&mut ctx, never()).await.unwrap();

        // Received -> Analyzing -> CreatingTests -> Implementing puts the
        // count one past the ceiling of 3; the next iteration force-completes.
        assert_eq!(ctx.current_state, IssueState::Completed);
        assert!(summary.is_terminal);
        assert!(!ctx.blocking_issues.is_empty());
        assert!(platform.comment_kinds().contains(&CommentKind::Status));
    }

    #[tokio::test]
    async fn test_worker_error_routes_like_returned_failure() {
        // An analyst that raises gets converted to a zero-confidence failure,
        // which escalates to a human just like a returned failure would.
        let platform = Arc::new(MockPlatform::new());
        let workers: Vec<Box<dyn Worker>> =
            vec![Box::new(ErroringWorker(WorkerRole::Analyst))];
        let controller = controller(workers, Arc::clone(&platform), QualityGate::default());

        let mut ctx = context();
        let summary = controller.run(&mut ctx, never()).await.unwrap();

        assert_eq!(ctx.current_state, IssueState::WaitingForHumanInput);
        assert!(summary.is_waiting_for_human);
        assert!(platform
            .comment_kinds()
            .contains(&CommentKind::HumanInput));
    }

    #[tokio::test]
    async fn test_worker_timeout_becomes_failed_step() {
        let platform = Arc::new(MockPlatform::new());
        let workers: Vec<Box<dyn Worker>> =
            vec![Box::new(SleepyWorker(WorkerRole::Analyst))];
        let controller = WorkflowController::new(
            Arc::new(WorkerSet::new(workers)),
            Arc::clone(&platform) as Arc<dyn Platform>,
            RoutingPolicy::new(RoutingConfig::default()),
            QualityGate::default(),
            Duration::from_millis(50),
        );

        let mut ctx = context();
        controller.run(&mut ctx, never()).await.unwrap();

        // Timeout -> failure -> analysis escalation, same as any failure.
        assert_eq!(ctx.current_state, IssueState::WaitingForHumanInput);
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_loop() {
        let platform = Arc::new(MockPlatform::new());
        let workers: Vec<Box<dyn Worker>> = vec![Box::new(ScriptedWorker::new(
            WorkerRole::Analyst,
            vec![success(WorkerRole::Analyst, 0.9)],
        ))];
        let controller = controller(workers, Arc::clone(&platform), QualityGate::default());

        let mut ctx = context();
        controller.run(&mut ctx, || std::future::ready(true)).await.unwrap();

        assert_eq!(ctx.current_state, IssueState::Failed);
        assert_eq!(
            ctx.state_transitions.last().unwrap().reason,
            "cancelled"
        );
    }

    #[tokio::test]
    async fn test_clarification_waits_then_resumes() {
        let platform = Arc::new(MockPlatform::new());
        let workers: Vec<Box<dyn Worker>> = vec![
            Box::new(ScriptedWorker::new(
                WorkerRole::Analyst,
                vec![
                    StepResult::new(WorkerRole::Analyst, StepStatus::NeedsClarification, 0.9)
                        .with_output(
                            "clarification_questions",
                            serde_json::json!(["Should OAuth users be affected?"]),
                        ),
                    success(WorkerRole::Analyst, 0.9),
                ],
            )),
            Box::new(ScriptedWorker::new(
                WorkerRole::Tester,
                vec![success(WorkerRole::Tester, 0.9)],
            )),
            Box::new(ScriptedWorker::new(
                WorkerRole::Developer,
                vec![success(WorkerRole::Developer, 0.9)],
            )),
            pm_worker(Arc::clone(&platform)),
        ];
        let controller = controller(workers, Arc::clone(&platform), QualityGate::default());

        let mut ctx = context();
        let summary = controller.run(&mut ctx, never()).await.unwrap();

        assert_eq!(
            ctx.current_state,
            IssueState::WaitingForRequirementsClarification
        );
        assert!(summary.is_waiting_for_human);
        assert!(platform
            .comment_kinds()
            .contains(&CommentKind::Clarification));

        // A human reply arrives; the workflow resumes through the paired
        // received state and runs to completion.
        let summary = controller
            .resume(
                &mut ctx,
                ResumeEvent::Clarification("Only password logins.".to_string()),
                never(),
            )
            .await
            .unwrap();

        assert_eq!(ctx.current_state, IssueState::Completed);
        assert!(summary.is_terminal);
        assert_eq!(ctx.human_inputs, vec!["Only password logins."]);
        assert!(ctx
            .previous_states
            .contains(&IssueState::RequirementsClarified));
        assert!(ctx.previous_states.contains(&IssueState::PlanningApproach));
    }

    #[tokio::test]
    async fn test_resume_rejects_non_waiting_context() {
        let platform = Arc::new(MockPlatform::new());
        let controller = controller(Vec::new(), Arc::clone(&platform), QualityGate::default());

        let mut ctx = context();
        let err = controller
            .resume(&mut ctx, ResumeEvent::Unblocked, never())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
    }
}
