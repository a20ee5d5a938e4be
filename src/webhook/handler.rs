use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};

use crate::server::{resume_workflow, spawn_workflow, AppState};
use crate::webhook::events::{IssueCommentEvent, IssuesEvent, WebhookEvent};
use crate::webhook::signature::verify_signature;

pub async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let signature = match headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
    {
        Some(sig) => sig.to_string(),
        None => {
            tracing::warn!("Missing X-Hub-Signature-256 header");
            return StatusCode::UNAUTHORIZED;
        }
    };

    let event_type = match headers.get("x-github-event").and_then(|v| v.to_str().ok()) {
        Some(et) => et.to_string(),
        None => {
            tracing::warn!("Missing X-GitHub-Event header");
            return StatusCode::BAD_REQUEST;
        }
    };

    if let Err(e) = verify_signature(state.config.webhook_secret(), &body, &signature) {
        tracing::warn!(error = %e, "Webhook signature verification failed");
        return StatusCode::UNAUTHORIZED;
    }

    let event = match WebhookEvent::parse(&event_type, &body) {
        Ok(event) => event,
        Err(e) => {
            tracing::error!(error = %e, event_type = %event_type, "Failed to parse webhook event");
            return StatusCode::BAD_REQUEST;
        }
    };

    tracing::info!(event_type = %event_type, "Received webhook event");

    match event {
        WebhookEvent::Issues(event) => handle_issues_event(state, event).await,
        WebhookEvent::IssueComment(event) => handle_issue_comment_event(state, event).await,
        WebhookEvent::Ping => StatusCode::OK,
        WebhookEvent::Unsupported(event_type) => {
            tracing::debug!(event_type = %event_type, "Ignoring unsupported event");
            StatusCode::OK
        }
    }
}

async fn handle_issues_event(state: Arc<AppState>, event: IssuesEvent) -> StatusCode {
    if event.repository.full_name != state.config.github.repository {
        tracing::debug!(repo = %event.repository.full_name, "Event for unconfigured repository");
        return StatusCode::OK;
    }

    let trigger_label = &state.config.github.trigger_label;

    // Closing or removing the trigger label cancels in-flight work.
    if event.action == "closed"
        || (event.action == "unlabeled"
            && event.label.as_ref().map(|l| l.name.as_str()) == Some(trigger_label))
    {
        tracing::info!(
            issue = event.issue.number,
            action = %event.action,
            "Issue closed or unlabeled, cancelling workflow"
        );
        state.store.cancel(event.issue.number).await;
        return StatusCode::OK;
    }

    if event.action != "labeled"
        || event.label.as_ref().map(|l| l.name.as_str()) != Some(trigger_label)
    {
        return StatusCode::OK;
    }

    // Pull requests also arrive via the issues event; skip them.
    if event.issue.pull_request.is_some() {
        return StatusCode::OK;
    }

    spawn_workflow(
        state,
        event.issue.number,
        &event.issue.title,
        event.issue.body.as_deref().unwrap_or_default(),
    )
    .await;

    StatusCode::ACCEPTED
}

async fn handle_issue_comment_event(state: Arc<AppState>, event: IssueCommentEvent) -> StatusCode {
    if event.action != "created" {
        return StatusCode::OK;
    }

    if event.repository.full_name != state.config.github.repository {
        return StatusCode::OK;
    }

    // Ignore comments from bots (including our own) to prevent feedback loops
    if event.comment.user.is_bot() {
        tracing::debug!(user = %event.comment.user.login, "Ignoring comment from bot");
        return StatusCode::OK;
    }

    let trigger_label = &state.config.github.trigger_label;
    if !event.issue.labels.iter().any(|l| &l.name == trigger_label) {
        return StatusCode::OK;
    }

    let body = event.comment.body.unwrap_or_default();

    // A comment on a tracked waiting issue is the resumption event; on an
    // untracked labeled issue it starts a workflow with the fresh context.
    if state.store.contains(event.issue.number).await {
        resume_workflow(state, event.issue.number, body).await;
    } else {
        spawn_workflow(
            state,
            event.issue.number,
            &event.issue.title,
            event.issue.body.as_deref().unwrap_or_default(),
        )
        .await;
    }

    StatusCode::ACCEPTED
}
