//! Persistence layer for output projects and milestones.
//!
//! Backed by SQLite via sqlx. The one operation with interesting semantics is
//! [`ProjectStore::set_agent_session_id_if_null`]: the agent's conversation id
//! must be written set-if-null so concurrent captures (two workers parsing
//! init lines for the same project) cannot overwrite an established id. The
//! same conditional-update shape is reused for milestone dispatch claims and
//! forward-only status transitions.

pub mod models;
pub mod schema;

use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;

use crate::util::now_ms;
use models::{Milestone, OutputProject, ProjectStatus};

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// SQLite-backed store for output projects and milestones.
pub struct ProjectStore {
    pool: SqlitePool,
    db_path: PathBuf,
}

impl ProjectStore {
    /// Open (creating if needed) the database at `db_path` and ensure the
    /// schema exists.
    pub async fn new(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .connect(&database_url)
            .await?;

        // WAL mode for concurrent readers alongside the writer
        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;

        sqlx::raw_sql(schema::SCHEMA).execute(&pool).await?;

        Ok(Self {
            pool,
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // ─── Projects ────────────────────────────────────────────────────────────

    /// Insert a new output project in status `created`.
    pub async fn create_project(
        &self,
        id: &str,
        workspace_path: &str,
    ) -> StoreResult<OutputProject> {
        let now = now_ms();
        sqlx::query(
            r#"
            INSERT INTO output_projects (id, workspace_path, status, created_at, updated_at)
            VALUES (?, ?, 'created', ?, ?)
            "#,
        )
        .bind(id)
        .bind(workspace_path)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(OutputProject {
            id: id.to_string(),
            workspace_path: workspace_path.to_string(),
            agent_session_id: None,
            status: ProjectStatus::Created,
            created_at: now,
            updated_at: now,
        })
    }

    /// Fetch a project by id.
    pub async fn project(&self, id: &str) -> StoreResult<Option<OutputProject>> {
        let row = sqlx::query_as::<_, OutputProject>(
            "SELECT id, workspace_path, agent_session_id, status, created_at, updated_at
             FROM output_projects WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Record the agent's conversation id, only if none is recorded yet.
    ///
    /// Returns `true` if this call won the write. `false` means the column was
    /// already non-null (a concurrent capture got there first, or the id was
    /// learned on an earlier run) and nothing was changed.
    pub async fn set_agent_session_id_if_null(
        &self,
        project_id: &str,
        agent_session_id: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE output_projects
             SET agent_session_id = ?, updated_at = ?
             WHERE id = ? AND agent_session_id IS NULL",
        )
        .bind(agent_session_id)
        .bind(now_ms())
        .bind(project_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Advance status created → initialized. Forward-only: a no-op (returning
    /// `false`) unless the project is currently `created`.
    pub async fn mark_initialized(&self, project_id: &str) -> StoreResult<bool> {
        self.advance_status(project_id, ProjectStatus::Created, ProjectStatus::Initialized)
            .await
    }

    /// Advance status initialized → active. Forward-only.
    pub async fn mark_active(&self, project_id: &str) -> StoreResult<bool> {
        self.advance_status(
            project_id,
            ProjectStatus::Initialized,
            ProjectStatus::Active,
        )
        .await
    }

    async fn advance_status(
        &self,
        project_id: &str,
        from: ProjectStatus,
        to: ProjectStatus,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE output_projects SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(to)
        .bind(now_ms())
        .bind(project_id)
        .bind(from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // ─── Milestones ──────────────────────────────────────────────────────────

    /// Insert a new milestone for a project.
    pub async fn create_milestone(
        &self,
        id: &str,
        output_project_id: &str,
        context_file_path: &str,
    ) -> StoreResult<Milestone> {
        let now = now_ms();
        sqlx::query(
            r#"
            INSERT INTO milestones (id, output_project_id, context_file_path, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(output_project_id)
        .bind(context_file_path)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Milestone {
            id: id.to_string(),
            output_project_id: output_project_id.to_string(),
            context_file_path: context_file_path.to_string(),
            created_at: now,
            dispatched_at: None,
            completed_at: None,
        })
    }

    /// Fetch a milestone by id.
    pub async fn milestone(&self, id: &str) -> StoreResult<Option<Milestone>> {
        let row = sqlx::query_as::<_, Milestone>(
            "SELECT id, output_project_id, context_file_path, created_at, dispatched_at, completed_at
             FROM milestones WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Claim a milestone for dispatch to the agent. Set-if-null on
    /// `dispatched_at`: returns `true` exactly once per milestone, so
    /// reconnecting to an already-delivered milestone's endpoint does not
    /// re-inject it.
    pub async fn claim_milestone_dispatch(&self, milestone_id: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE milestones SET dispatched_at = ? WHERE id = ? AND dispatched_at IS NULL",
        )
        .bind(now_ms())
        .bind(milestone_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> (tempfile::TempDir, ProjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path().join("test.db")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_project_roundtrip() {
        let (_dir, store) = test_store().await;
        store.create_project("op_A", "/ws/A").await.unwrap();

        let p = store.project("op_A").await.unwrap().unwrap();
        assert_eq!(p.workspace_path, "/ws/A");
        assert_eq!(p.status, ProjectStatus::Created);
        assert!(p.agent_session_id.is_none());

        assert!(store.project("op_missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_agent_session_id_set_once() {
        let (_dir, store) = test_store().await;
        store.create_project("op_A", "/ws/A").await.unwrap();

        assert!(store
            .set_agent_session_id_if_null("op_A", "ag_42")
            .await
            .unwrap());
        // Second writer loses and does not overwrite
        assert!(!store
            .set_agent_session_id_if_null("op_A", "ag_99")
            .await
            .unwrap());

        let p = store.project("op_A").await.unwrap().unwrap();
        assert_eq!(p.agent_session_id.as_deref(), Some("ag_42"));
    }

    #[tokio::test]
    async fn test_status_transitions_forward_only() {
        let (_dir, store) = test_store().await;
        store.create_project("op_A", "/ws/A").await.unwrap();

        assert!(store.mark_initialized("op_A").await.unwrap());
        // Repeat spawn does not re-transition
        assert!(!store.mark_initialized("op_A").await.unwrap());

        assert!(store.mark_active("op_A").await.unwrap());
        assert!(!store.mark_active("op_A").await.unwrap());
        // No regression back to initialized
        assert!(!store.mark_initialized("op_A").await.unwrap());

        let p = store.project("op_A").await.unwrap().unwrap();
        assert_eq!(p.status, ProjectStatus::Active);
    }

    #[tokio::test]
    async fn test_mark_active_requires_initialized() {
        let (_dir, store) = test_store().await;
        store.create_project("op_A", "/ws/A").await.unwrap();
        // created → active is not a legal jump
        assert!(!store.mark_active("op_A").await.unwrap());
        let p = store.project("op_A").await.unwrap().unwrap();
        assert_eq!(p.status, ProjectStatus::Created);
    }

    #[tokio::test]
    async fn test_milestone_dispatch_claimed_once() {
        let (_dir, store) = test_store().await;
        store.create_project("op_A", "/ws/A").await.unwrap();
        store
            .create_milestone("m_1", "op_A", "/ws/A/.planning/m_1/CONTEXT.md")
            .await
            .unwrap();

        let m = store.milestone("m_1").await.unwrap().unwrap();
        assert!(m.dispatched_at.is_none());

        assert!(store.claim_milestone_dispatch("m_1").await.unwrap());
        assert!(!store.claim_milestone_dispatch("m_1").await.unwrap());

        let m = store.milestone("m_1").await.unwrap().unwrap();
        assert!(m.dispatched_at.is_some());
    }
}
