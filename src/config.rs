use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{AppError, Result};
use crate::workflow::quality::QualityGate;
use crate::workflow::routing::RoutingConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub github: GitHubConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default = "default_quality_gate")]
    pub quality: QualityGate,
    #[serde(default = "default_routing")]
    pub routing: RoutingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Deserialize, Clone)]
pub struct GitHubConfig {
    /// Personal access token used for API calls and git pushes.
    pub token: String,
    /// `owner/name` of the repository conductor works on.
    pub repository: String,
    pub webhook_secret: String,
    /// Path to an existing clone of the repository that workers edit.
    pub checkout_dir: PathBuf,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default = "default_trigger_label")]
    pub trigger_label: String,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Name and email used for workflow commits.
    #[serde(default = "default_committer_name")]
    pub committer_name: String,
    #[serde(default = "default_committer_email")]
    pub committer_email: String,
}

// Manual Debug impl to avoid leaking the token and webhook secret
impl std::fmt::Debug for GitHubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubConfig")
            .field("token", &"[REDACTED]")
            .field("repository", &self.repository)
            .field("webhook_secret", &"[REDACTED]")
            .field("checkout_dir", &self.checkout_dir)
            .field("base_branch", &self.base_branch)
            .field("trigger_label", &self.trigger_label)
            .field("branch_prefix", &self.branch_prefix)
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkflowConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_worker_timeout_secs")]
    pub worker_timeout_secs: u64,
    #[serde(default = "default_pr_max_attempts")]
    pub pr_max_attempts: u32,
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            worker_timeout_secs: default_worker_timeout_secs(),
            pr_max_attempts: default_pr_max_attempts(),
            snapshot_path: default_snapshot_path(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_trigger_label() -> String {
    "conductor".to_string()
}

fn default_branch_prefix() -> String {
    "conductor".to_string()
}

fn default_committer_name() -> String {
    "Conductor Bot".to_string()
}

fn default_committer_email() -> String {
    "conductor[bot]@users.noreply.github.com".to_string()
}

fn default_max_iterations() -> u32 {
    25
}

fn default_worker_timeout_secs() -> u64 {
    300
}

fn default_pr_max_attempts() -> u32 {
    3
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("/var/lib/conductor/workflows.json")
}

fn default_quality_gate() -> QualityGate {
    QualityGate::default()
}

fn default_routing() -> RoutingConfig {
    RoutingConfig::default()
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Load from file if specified
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        } else {
            // Try default paths
            builder = builder.add_source(config::File::with_name("conductor").required(false));
        }

        // Environment variable overrides with CONDUCTOR_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("CONDUCTOR")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))
    }

    pub fn webhook_secret(&self) -> &str {
        &self.github.webhook_secret
    }

    pub fn worker_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.workflow.worker_timeout_secs)
    }
}
