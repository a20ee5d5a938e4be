use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::{routing::get, routing::post, Router};
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::error::Result;
use crate::platform::github::GitHubPlatform;
use crate::platform::Platform;
use crate::store::{StoredWorkflow, WorkflowStore};
use crate::worker::pm::ProjectManagerWorker;
use crate::worker::{Worker, WorkerSet};
use crate::workflow::context::{WorkflowContext, WorkflowSummary};
use crate::workflow::controller::{ResumeEvent, WorkflowController};
use crate::workflow::routing::RoutingPolicy;

pub struct AppState {
    pub config: AppConfig,
    pub store: WorkflowStore,
    pub platform: Arc<dyn Platform>,
    pub controller: WorkflowController,
}

impl AppState {
    /// Wire the service together.
    ///
    /// `pipeline_workers` are the analyst, tester, and developer
    /// implementations supplied by the embedding integration; the built-in
    /// project-manager worker is always registered.
    pub fn new(config: AppConfig, pipeline_workers: Vec<Box<dyn Worker>>) -> Result<Self> {
        let platform: Arc<dyn Platform> = Arc::new(GitHubPlatform::new(&config.github)?);

        let mut workers = pipeline_workers;
        workers.push(Box::new(ProjectManagerWorker::new(
            Arc::clone(&platform),
            &config.github.base_branch,
            &config.github.branch_prefix,
            config.workflow.pr_max_attempts,
        )));

        let controller = WorkflowController::new(
            Arc::new(WorkerSet::new(workers)),
            Arc::clone(&platform),
            RoutingPolicy::new(config.routing.clone()),
            config.quality.clone(),
            config.worker_timeout(),
        );

        Ok(Self {
            config,
            store: WorkflowStore::new(),
            platform,
            controller,
        })
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/webhooks/github",
            post(crate::webhook::handler::handle_webhook),
        )
        .route("/workflows", get(list_workflows))
        .route("/workflows/:issue_number", get(get_workflow))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

async fn list_workflows(State(state): State<Arc<AppState>>) -> Json<Vec<WorkflowSummary>> {
    Json(state.store.summaries().await)
}

async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(issue_number): Path<u64>,
) -> std::result::Result<Json<WorkflowSummary>, StatusCode> {
    match state.store.get(issue_number).await {
        Some(stored) => Ok(Json(stored.context.lock().await.summary())),
        None => Err(StatusCode::NOT_FOUND),
    }
}

/// Start tracking an issue and drive its workflow on a dedicated task.
pub async fn spawn_workflow(
    state: Arc<AppState>,
    issue_number: u64,
    issue_title: &str,
    issue_body: &str,
) {
    if let Some(existing) = state.store.get(issue_number).await {
        // A held lock means a loop iteration is in flight, so the workflow
        // is certainly active.
        let active = match existing.context.try_lock() {
            Ok(ctx) => !ctx.is_terminal(),
            Err(_) => true,
        };
        if active {
            tracing::info!(issue = issue_number, "Workflow already active, ignoring");
            return;
        }
    }

    let context = WorkflowContext::new(
        issue_number,
        issue_title,
        issue_body,
        &state.config.github.repository,
        state.config.workflow.max_iterations,
    );
    let stored = state.store.insert(context).await;

    tracing::info!(issue = issue_number, "Starting workflow");
    tokio::spawn(drive(state, stored));
}

/// Deliver a human reply to a waiting workflow and resume it.
pub async fn resume_workflow(state: Arc<AppState>, issue_number: u64, body: String) {
    let Some(stored) = state.store.get(issue_number).await else {
        tracing::debug!(issue = issue_number, "No workflow for comment, ignoring");
        return;
    };

    tokio::spawn(async move {
        {
            // Waiting workflows have no running loop, so the lock is free.
            let mut ctx = stored.context.lock().await;
            if !ctx.is_waiting_for_human() {
                tracing::debug!(
                    issue = issue_number,
                    state = %ctx.current_state,
                    "Workflow not waiting, ignoring comment"
                );
                return;
            }

            let event = match ctx.current_state {
                crate::state::IssueState::WaitingForRequirementsClarification => {
                    ResumeEvent::Clarification(body)
                }
                _ => ResumeEvent::HumanReply(body),
            };

            if let Err(e) = state.controller.apply_resume_event(&mut ctx, &event) {
                tracing::warn!(issue = issue_number, error = %e, "Failed to resume workflow");
                return;
            }
            tracing::info!(issue = issue_number, "Resuming workflow");
        }

        drive(state, stored).await;
    });
}

/// Drive one workflow to a terminal or waiting state, taking the context
/// lock per iteration so observers and the shutdown snapshot are never
/// blocked for more than one step.
async fn drive(state: Arc<AppState>, stored: StoredWorkflow) {
    let cancelled = stored.clone();
    let is_cancelled = move || std::future::ready(cancelled.is_cancelled());

    loop {
        let mut ctx = stored.context.lock().await;
        match state.controller.run_once(&mut ctx, &is_cancelled).await {
            Ok(true) => {}
            Ok(false) => {
                let summary = ctx.summary();
                tracing::info!(
                    issue = summary.issue_number,
                    state = %summary.current_state,
                    iterations = summary.total_iterations,
                    waiting = summary.is_waiting_for_human,
                    "Workflow stopped"
                );
                break;
            }
            Err(e) => {
                tracing::error!(issue = ctx.issue_number, error = %e, "Workflow errored");
                break;
            }
        }
    }
}
