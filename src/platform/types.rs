use serde::{Deserialize, Serialize};

/// What kind of comment the workflow is posting, rendered as a header line so
/// humans can tell a clarification request from a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentKind {
    Clarification,
    HumanInput,
    Status,
}

impl CommentKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Clarification => "Clarification needed",
            Self::HumanInput => "Human input requested",
            Self::Status => "Status",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreatePullRequest {
    pub title: String,
    pub body: String,
    pub head_branch: String,
    pub base_branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
    pub head_branch: String,
    pub base_branch: String,
}
