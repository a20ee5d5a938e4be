use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::error::{AppError, Result};
use crate::workflow::context::{WorkflowContext, WorkflowSummary};

/// One tracked workflow: the context plus its cancellation flag.
///
/// The mutex makes the controller loop's exclusive ownership explicit; the
/// flag lets the webhook handler request cancellation between iterations
/// without touching the context itself.
#[derive(Clone)]
pub struct StoredWorkflow {
    pub context: Arc<Mutex<WorkflowContext>>,
    cancelled: Arc<AtomicBool>,
}

impl StoredWorkflow {
    fn new(context: WorkflowContext) -> Self {
        Self {
            context: Arc::new(Mutex::new(context)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Collection of active workflows keyed by issue number.
///
/// Owned by the service layer and injected where needed; the controller and
/// state model know nothing about it. Snapshots serialize every context to a
/// single JSON file so workflows survive a restart.
pub struct WorkflowStore {
    workflows: RwLock<HashMap<u64, StoredWorkflow>>,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
        }
    }

    /// Track a new workflow. Replaces any previous entry for the issue.
    pub async fn insert(&self, context: WorkflowContext) -> StoredWorkflow {
        let issue_number = context.issue_number;
        let stored = StoredWorkflow::new(context);
        self.workflows
            .write()
            .await
            .insert(issue_number, stored.clone());
        stored
    }

    pub async fn get(&self, issue_number: u64) -> Option<StoredWorkflow> {
        self.workflows.read().await.get(&issue_number).cloned()
    }

    pub async fn contains(&self, issue_number: u64) -> bool {
        self.workflows.read().await.contains_key(&issue_number)
    }

    /// Flag a workflow for cancellation; its loop stops at the next
    /// iteration boundary.
    pub async fn cancel(&self, issue_number: u64) -> bool {
        match self.workflows.read().await.get(&issue_number) {
            Some(stored) => {
                tracing::info!(issue = issue_number, "Cancelling workflow");
                stored.cancel();
                true
            }
            None => false,
        }
    }

    /// Flag every workflow for cancellation, e.g. at shutdown. Waiting
    /// workflows are unaffected; they have no running loop.
    pub async fn cancel_all(&self) {
        for stored in self.workflows.read().await.values() {
            stored.cancel();
        }
    }

    /// Drop a retired workflow.
    pub async fn remove(&self, issue_number: u64) {
        self.workflows.write().await.remove(&issue_number);
    }

    /// Summaries of every tracked workflow, for observability.
    pub async fn summaries(&self) -> Vec<WorkflowSummary> {
        let workflows = self.workflows.read().await;
        let mut summaries = Vec::with_capacity(workflows.len());
        for stored in workflows.values() {
            summaries.push(stored.context.lock().await.summary());
        }
        summaries
    }

    /// Serialize every context to `path` as JSON.
    pub async fn snapshot(&self, path: &Path) -> Result<usize> {
        let workflows = self.workflows.read().await;
        let mut contexts = Vec::with_capacity(workflows.len());
        for stored in workflows.values() {
            contexts.push(stored.context.lock().await.clone());
        }
        drop(workflows);

        let json = serde_json::to_vec_pretty(&contexts)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, json).await?;
        Ok(contexts.len())
    }

    /// Load contexts from a snapshot file. Missing file is an empty store,
    /// not an error; a corrupt file is surfaced.
    pub async fn restore(&self, path: &Path) -> Result<usize> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(AppError::Io(e)),
        };
        let contexts: Vec<WorkflowContext> = serde_json::from_slice(&bytes)?;
        let count = contexts.len();

        let mut workflows = self.workflows.write().await;
        for context in contexts {
            workflows.insert(context.issue_number, StoredWorkflow::new(context));
        }
        Ok(count)
    }
}

impl Default for WorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::IssueState;
    use crate::workflow::context::Trigger;

    fn context(issue_number: u64) -> WorkflowContext {
        WorkflowContext::new(issue_number, "title", "body", "acme/app", 25)
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = WorkflowStore::new();
        store.insert(context(1)).await;
        assert!(store.contains(1).await);
        assert!(!store.contains(2).await);

        let stored = store.get(1).await.unwrap();
        assert_eq!(stored.context.lock().await.issue_number, 1);
    }

    #[tokio::test]
    async fn test_cancel_sets_flag() {
        let store = WorkflowStore::new();
        let stored = store.insert(context(1)).await;
        assert!(!stored.is_cancelled());

        assert!(store.cancel(1).await);
        assert!(stored.is_cancelled());
        assert!(!store.cancel(99).await);
    }

    #[tokio::test]
    async fn test_snapshot_and_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflows.json");

        let store = WorkflowStore::new();
        let stored = store.insert(context(7)).await;
        stored
            .context
            .lock()
            .await
            .transition_to(IssueState::AnalyzingRequirements, "start", Trigger::Controller)
            .unwrap();
        store.insert(context(8)).await;

        assert_eq!(store.snapshot(&path).await.unwrap(), 2);

        let restored = WorkflowStore::new();
        assert_eq!(restored.restore(&path).await.unwrap(), 2);
        let ctx = restored.get(7).await.unwrap();
        let ctx = ctx.context.lock().await;
        assert_eq!(ctx.current_state, IssueState::AnalyzingRequirements);
        assert_eq!(ctx.iteration_count, 1);
        assert_eq!(ctx.previous_states.len(), ctx.state_transitions.len());
    }

    #[tokio::test]
    async fn test_restore_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkflowStore::new();
        let count = store
            .restore(&dir.path().join("does-not-exist.json"))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_summaries() {
        let store = WorkflowStore::new();
        store.insert(context(1)).await;
        store.insert(context(2)).await;
        let summaries = store.summaries().await;
        assert_eq!(summaries.len(), 2);
    }
}
