use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::platform::types::{CommentKind, CreatePullRequest};
use crate::platform::Platform;
use crate::state::{IssueState, WorkerRole};
use crate::worker::{ContextView, StepResult, StepStatus, Worker, WorkerTask};

/// The one worker conductor ships: delivery of the finished change.
///
/// Bound to `CreatingPr`. Commits and pushes the work branch, then opens the
/// pull request, retrying PR creation up to `max_pr_attempts`. Exhausted
/// attempts come back as a failed step, which the routing policy turns into
/// a `Failed` workflow.
pub struct ProjectManagerWorker {
    platform: Arc<dyn Platform>,
    base_branch: String,
    branch_prefix: String,
    max_pr_attempts: u32,
}

impl ProjectManagerWorker {
    pub fn new(
        platform: Arc<dyn Platform>,
        base_branch: &str,
        branch_prefix: &str,
        max_pr_attempts: u32,
    ) -> Self {
        Self {
            platform,
            base_branch: base_branch.to_string(),
            branch_prefix: branch_prefix.to_string(),
            max_pr_attempts: max_pr_attempts.max(1),
        }
    }

    fn branch_for(&self, issue_number: u64) -> String {
        format!("{}/issue-{}", self.branch_prefix, issue_number)
    }

    async fn deliver(&self, view: &ContextView) -> StepResult {
        let branch = self.branch_for(view.issue_number);

        if let Err(e) = self.platform.create_branch(&branch).await {
            return StepResult::failure(
                WorkerRole::ProjectManager,
                &format!("branch setup failed: {e}"),
            );
        }

        let summary = view
            .output_for(WorkerRole::Developer)
            .and_then(|o| o.get("summary"))
            .and_then(Value::as_str)
            .unwrap_or("Automated change")
            .to_string();

        let commit_message = format!(
            "fix: resolve #{} - {}\n\n{}",
            view.issue_number, view.issue_title, summary
        );

        let committed = match self.platform.commit_changes(&commit_message).await {
            Ok(c) => c,
            Err(e) => {
                return StepResult::failure(
                    WorkerRole::ProjectManager,
                    &format!("commit failed: {e}"),
                );
            }
        };
        if !committed {
            return StepResult::failure(WorkerRole::ProjectManager, "no changes to deliver");
        }

        if let Err(e) = self.platform.push_branch(&branch).await {
            return StepResult::failure(
                WorkerRole::ProjectManager,
                &format!("push failed: {e}"),
            );
        }

        let request = CreatePullRequest {
            title: format!("Fix #{}: {}", view.issue_number, view.issue_title),
            body: format!(
                "Resolves #{}\n\n## Summary\n\n{}\n\n---\n*Automated by Conductor*",
                view.issue_number, summary
            ),
            head_branch: branch.clone(),
            base_branch: self.base_branch.clone(),
        };

        let mut last_error = String::new();
        for attempt in 1..=self.max_pr_attempts {
            match self.platform.create_pull_request(&request).await {
                Ok(pr) => {
                    let _ = self
                        .platform
                        .post_comment(
                            view.issue_number,
                            CommentKind::Status,
                            &format!("Opened pull request #{}: {}", pr.number, pr.url),
                        )
                        .await;

                    return StepResult::new(
                        WorkerRole::ProjectManager,
                        StepStatus::Success,
                        1.0,
                    )
                    .with_output("pr_number", Value::from(pr.number))
                    .with_output("pr_url", Value::String(pr.url))
                    .with_output("head_branch", Value::String(pr.head_branch))
                    .with_output("base_branch", Value::String(pr.base_branch));
                }
                Err(e) => {
                    tracing::warn!(
                        issue = view.issue_number,
                        attempt = attempt,
                        error = %e,
                        "Pull request creation failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        StepResult::failure(
            WorkerRole::ProjectManager,
            &format!(
                "pull request creation failed after {} attempts: {last_error}",
                self.max_pr_attempts
            ),
        )
    }
}

#[async_trait]
impl Worker for ProjectManagerWorker {
    fn role(&self) -> WorkerRole {
        WorkerRole::ProjectManager
    }

    async fn execute(&self, task: &WorkerTask, view: &ContextView) -> Result<StepResult> {
        match task.kind {
            IssueState::CreatingPr => Ok(self.deliver(view).await),
            other => Ok(StepResult::failure(
                WorkerRole::ProjectManager,
                &format!("project manager has no task for state {other}"),
            )),
        }
    }
}
