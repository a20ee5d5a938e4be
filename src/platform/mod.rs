pub mod github;
pub mod types;

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use types::{CommentKind, CreatePullRequest, PullRequest};

/// Narrow interface to source control and human notification.
///
/// Every operation is attempted at most once; no retries happen inside the
/// implementation. Callers decide whether a failure is retryable (routed back
/// through the routing policy) or fatal.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Post a comment on the issue.
    async fn post_comment(&self, issue_number: u64, kind: CommentKind, body: &str) -> Result<()>;

    /// Create and check out a work branch in the checkout.
    async fn create_branch(&self, branch: &str) -> Result<()>;

    /// Stage and commit all changes. Returns false when there was nothing to
    /// commit.
    async fn commit_changes(&self, message: &str) -> Result<bool>;

    /// Push a branch to origin.
    async fn push_branch(&self, branch: &str) -> Result<()>;

    /// Open a pull request.
    async fn create_pull_request(&self, pr: &CreatePullRequest) -> Result<PullRequest>;

    /// Read a file from the checkout, if it exists.
    async fn read_existing_file(&self, path: &Path) -> Result<Option<String>>;
}
