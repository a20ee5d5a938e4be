use std::path::{Path, PathBuf};

use async_trait::async_trait;
use git2::{Cred, IndexAddOption, PushOptions, RemoteCallbacks, Repository, Signature};
use octocrab::Octocrab;

use crate::config::GitHubConfig;
use crate::error::{AppError, Result};
use crate::platform::types::{CommentKind, CreatePullRequest, PullRequest};
use crate::platform::Platform;

/// GitHub-backed integration: octocrab for comments and pull requests, git2
/// on an existing checkout for branch, commit, and push operations.
pub struct GitHubPlatform {
    client: Octocrab,
    owner: String,
    repo: String,
    issue_repo: String,
    token: String,
    checkout_dir: PathBuf,
    committer_name: String,
    committer_email: String,
}

impl GitHubPlatform {
    pub fn new(config: &GitHubConfig) -> Result<Self> {
        if !config.checkout_dir.exists() {
            return Err(AppError::Config(format!(
                "Checkout directory not found at: {}",
                config.checkout_dir.display()
            )));
        }

        let (owner, repo) = parse_repo(&config.repository)?;

        let client = Octocrab::builder()
            .personal_token(config.token.clone())
            .build()
            .map_err(|e| AppError::GitHubApi(format!("Failed to build octocrab client: {e}")))?;

        Ok(Self {
            client,
            owner: owner.to_string(),
            repo: repo.to_string(),
            issue_repo: config.repository.clone(),
            token: config.token.clone(),
            checkout_dir: config.checkout_dir.clone(),
            committer_name: config.committer_name.clone(),
            committer_email: config.committer_email.clone(),
        })
    }
}

fn parse_repo(repo_full_name: &str) -> Result<(&str, &str)> {
    let parts: Vec<&str> = repo_full_name.splitn(2, '/').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(AppError::Config(format!(
            "Invalid repo name: {repo_full_name}"
        )));
    }
    Ok((parts[0], parts[1]))
}

/// Validate a branch name to prevent argument injection.
/// Rejects names starting with `-` as defence in depth.
fn validate_branch_name(name: &str) -> Result<()> {
    if name.starts_with('-') || name.is_empty() {
        return Err(AppError::Git(format!("Invalid branch name: {name}")));
    }
    Ok(())
}

/// Build `PushOptions` that authenticate via credential callback.
/// The token is captured by the closure and never written to disk.
fn make_push_options(token: &str) -> PushOptions<'_> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, _username_from_url, _allowed_types| {
        Cred::userpass_plaintext("x-access-token", token)
    });
    let mut opts = PushOptions::new();
    opts.remote_callbacks(callbacks);
    opts
}

/// Create the branch at HEAD if it does not exist yet, then check it out.
/// Re-entering an existing work branch is not an error.
async fn create_or_checkout_branch(dir: &Path, branch_name: &str) -> Result<()> {
    validate_branch_name(branch_name)?;

    let dir = dir.to_path_buf();
    let branch_name = branch_name.to_string();

    tokio::task::spawn_blocking(move || {
        let repo = Repository::open(&dir)?;
        if repo.find_branch(&branch_name, git2::BranchType::Local).is_err() {
            let head = repo.head()?;
            let commit = head.peel_to_commit()?;
            repo.branch(&branch_name, &commit, false)?;
        }
        let obj = repo.revparse_single(&format!("refs/heads/{branch_name}"))?;
        repo.checkout_tree(&obj, None)?;
        repo.set_head(&format!("refs/heads/{branch_name}"))?;
        Ok(())
    })
    .await
    .map_err(|e| AppError::Git(format!("Branch task panicked: {e}")))?
}

/// Stage everything and commit. Returns false when the working tree is clean.
async fn commit_all(dir: &Path, message: &str, name: &str, email: &str) -> Result<bool> {
    let dir = dir.to_path_buf();
    let message = message.to_string();
    let name = name.to_string();
    let email = email.to_string();

    tokio::task::spawn_blocking(move || {
        let repo = Repository::open(&dir)?;
        let statuses = repo.statuses(None)?;
        if statuses.is_empty() {
            return Ok(false);
        }

        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let sig = Signature::now(&name, &email)?;
        let tree_oid = index.write_tree()?;
        let tree = repo.find_tree(tree_oid)?;
        let head = repo.head()?;
        let parent = head.peel_to_commit()?;
        repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &[&parent])?;
        Ok(true)
    })
    .await
    .map_err(|e| AppError::Git(format!("Commit task panicked: {e}")))?
}

/// Push a branch to origin, overwriting a remote branch left over from a
/// previous attempt at the same issue.
async fn push(dir: &Path, branch_name: &str, token: &str) -> Result<()> {
    validate_branch_name(branch_name)?;

    let dir = dir.to_path_buf();
    let branch_name = branch_name.to_string();
    let token = token.to_string();

    tokio::task::spawn_blocking(move || {
        let repo = Repository::open(&dir)?;
        let mut remote = repo.find_remote("origin")?;
        let refspec = format!("+refs/heads/{branch_name}:refs/heads/{branch_name}");
        let mut push_opts = make_push_options(&token);
        remote.push(&[&refspec], Some(&mut push_opts))?;
        Ok(())
    })
    .await
    .map_err(|e| AppError::Git(format!("Push task panicked: {e}")))?
}

/// Resolve `requested` inside `root`, rejecting path traversal.
fn resolve_in_checkout(root: &Path, requested: &Path) -> Result<PathBuf> {
    let full_path = root.join(requested);
    let canonical = match full_path.canonicalize() {
        Ok(p) => p,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(full_path),
        Err(e) => return Err(AppError::Io(e)),
    };
    let canonical_root = root
        .canonicalize()
        .map_err(|e| AppError::Internal(format!("Failed to resolve checkout root: {e}")))?;
    if !canonical.starts_with(&canonical_root) {
        return Err(AppError::Internal(format!(
            "Path traversal detected: {} is outside the checkout",
            requested.display()
        )));
    }
    Ok(canonical)
}

#[async_trait]
impl Platform for GitHubPlatform {
    async fn post_comment(&self, issue_number: u64, kind: CommentKind, body: &str) -> Result<()> {
        let body = format!("**{}**\n\n{}\n\n---\n*Conductor*", kind.label(), body);
        self.client
            .issues(&self.owner, &self.repo)
            .create_comment(issue_number, body)
            .await?;
        Ok(())
    }

    async fn create_branch(&self, branch: &str) -> Result<()> {
        create_or_checkout_branch(&self.checkout_dir, branch).await
    }

    async fn commit_changes(&self, message: &str) -> Result<bool> {
        commit_all(
            &self.checkout_dir,
            message,
            &self.committer_name,
            &self.committer_email,
        )
        .await
    }

    async fn push_branch(&self, branch: &str) -> Result<()> {
        push(&self.checkout_dir, branch, &self.token).await
    }

    async fn create_pull_request(&self, pr: &CreatePullRequest) -> Result<PullRequest> {
        let created = self
            .client
            .pulls(&self.owner, &self.repo)
            .create(&pr.title, &pr.head_branch, &pr.base_branch)
            .body(&pr.body)
            .send()
            .await?;

        let url = created
            .html_url
            .map(|u| u.to_string())
            .unwrap_or_else(|| {
                format!(
                    "https://github.com/{}/pull/{}",
                    self.issue_repo, created.number
                )
            });

        Ok(PullRequest {
            number: created.number,
            url,
            head_branch: pr.head_branch.clone(),
            base_branch: pr.base_branch.clone(),
        })
    }

    async fn read_existing_file(&self, path: &Path) -> Result<Option<String>> {
        let resolved = resolve_in_checkout(&self.checkout_dir, path)?;
        match tokio::fs::read_to_string(&resolved).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }
}
