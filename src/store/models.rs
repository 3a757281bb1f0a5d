//! Persisted row types for output projects and milestones.

use serde::{Deserialize, Serialize};

/// Lifecycle of an output project. Transitions are forward-only:
/// created → initialized (first agent spawn) → active (agent id captured).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ProjectStatus {
    Created,
    Initialized,
    Active,
}

impl ProjectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initialized => "initialized",
            Self::Active => "active",
        }
    }
}

/// A long-running agent engagement rooted at one workspace directory.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutputProject {
    pub id: String,
    /// Filesystem directory the agent runs from. Invariant across all
    /// milestones of the project.
    pub workspace_path: String,
    /// The agent's own conversation id, learned from its init frame.
    /// NULL until first capture; set once, then stable.
    pub agent_session_id: Option<String>,
    pub status: ProjectStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A single work unit within an output project.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Milestone {
    pub id: String,
    pub output_project_id: String,
    /// Workspace-relative context file the agent is directed to read.
    pub context_file_path: String,
    pub created_at: i64,
    /// Set when the milestone has been handed to the agent (by spawn or by
    /// stdin injection). NULL means not yet delivered.
    pub dispatched_at: Option<i64>,
    /// Written by external collaborators when the work unit finishes.
    pub completed_at: Option<i64>,
}
