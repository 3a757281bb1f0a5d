//! SQLite schema for output projects and milestones.

/// Complete schema, executed idempotently at startup.
pub const SCHEMA: &str = r#"
-- Table: output_projects
-- One row per long-running agent engagement. agent_session_id is learned
-- from the agent's first init frame and is set-once: the update that writes
-- it is conditional on the column still being NULL.
CREATE TABLE IF NOT EXISTS output_projects (
    id TEXT PRIMARY KEY,
    workspace_path TEXT NOT NULL,
    agent_session_id TEXT,
    status TEXT NOT NULL DEFAULT 'created',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Table: milestones
-- One row per work unit. dispatched_at is claimed set-if-null before the
-- work is handed to the agent, so a milestone is delivered at most once.
-- completed_at is written by external collaborators.
CREATE TABLE IF NOT EXISTS milestones (
    id TEXT PRIMARY KEY,
    output_project_id TEXT NOT NULL REFERENCES output_projects(id),
    context_file_path TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    dispatched_at INTEGER,
    completed_at INTEGER
);

-- Index: milestones by parent project
CREATE INDEX IF NOT EXISTS idx_milestones_project
    ON milestones(output_project_id, created_at);
"#;
