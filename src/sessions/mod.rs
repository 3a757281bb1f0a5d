//! Live-session registry: the single source of truth for PTY sessions.
//!
//! [`SessionRegistry`] owns every live [`PtySession`], keyed by output-project
//! id, and enforces at most one live session per project. It supports:
//!
//! - **get_or_create** — lookup and spawn under one write lock, so two
//!   WebSocket connects racing for the same project cannot double-spawn.
//! - **Attach/detach** — bound-connection bookkeeping for reconnection; a
//!   WebSocket close detaches but never closes the session.
//! - **Sweep** — a janitor closes sessions that have been detached and idle
//!   past the configured timeout. Attached sessions are never idle-evicted.
//! - **Exit reaping** — a child exit removes its session from the registry
//!   exactly once; the next connect re-spawns (resuming via the stored agent
//!   id when one was captured).
//!
//! ## Concurrency
//!
//! The session map is behind an `RwLock` with short critical sections. Slow
//! operations (graceful close) run after the entry has been removed from the
//! map, outside the lock.

pub mod buffer;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::info;
use uuid::Uuid;

use crate::agent::command::AgentCommand;
use crate::error::SessionError;
use crate::util::short_id;
use session::PtySession;

/// Capacity of the capture tap handed to C3 on first spawn. Chunks are copied
/// in best-effort; the tap only needs to survive the agent's first lines.
const CAPTURE_TAP_CAPACITY: usize = 256;

/// Registry of live PTY sessions.
///
/// Cloneable — all clones share the same inner map.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
    max_sessions: usize,
    buffer_bytes: usize,
    close_grace: Duration,
    events: broadcast::Sender<serde_json::Value>,
}

/// Internal bookkeeping for one live session.
pub struct SessionEntry {
    pub session: Arc<PtySession>,
    /// Whether a terminal connection is currently bound.
    pub attached: bool,
    /// Last inbound or outbound activity (any terminal byte, or attach).
    pub last_activity: Instant,
}

/// Summary of a live session for the REST listing.
#[derive(Debug, serde::Serialize)]
pub struct SessionListItem {
    pub session_id: String,
    pub project_id: String,
    pub pid: u32,
    pub attached: bool,
    pub running: bool,
    pub agent_session_id: Option<String>,
    pub idle_secs: u64,
    pub created_at: i64,
}

impl SessionRegistry {
    pub fn new(
        max_sessions: usize,
        buffer_bytes: usize,
        close_grace: Duration,
        events: broadcast::Sender<serde_json::Value>,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_sessions,
            buffer_bytes,
            close_grace,
            events,
        }
    }

    /// Look up the live session for a project.
    pub async fn get(&self, project_id: &str) -> Option<Arc<PtySession>> {
        let sessions = self.sessions.read().await;
        sessions.get(project_id).map(|e| Arc::clone(&e.session))
    }

    /// Spawn a new session for a project. Fails with
    /// [`SessionError::AlreadyExists`] if one is live.
    ///
    /// Returns the session and the capture-tap receiver for the init-frame
    /// scan.
    pub async fn create(
        &self,
        project_id: &str,
        cmd: &AgentCommand,
        rows: u16,
        cols: u16,
    ) -> Result<(Arc<PtySession>, mpsc::Receiver<Vec<u8>>), SessionError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(project_id) {
            return Err(SessionError::AlreadyExists(project_id.to_string()));
        }
        self.spawn_locked(&mut sessions, project_id, cmd, rows, cols)
    }

    /// Atomic lookup-or-spawn, used on WebSocket connect.
    ///
    /// The lookup and the spawn happen under the same write lock, so two
    /// concurrent connects for one project bind to the same session and
    /// exactly one spawn occurs. The tap receiver is `Some` only for the
    /// connect that actually spawned.
    pub async fn get_or_create(
        &self,
        project_id: &str,
        cmd: &AgentCommand,
        rows: u16,
        cols: u16,
    ) -> Result<(Arc<PtySession>, Option<mpsc::Receiver<Vec<u8>>>), SessionError> {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get(project_id) {
            return Ok((Arc::clone(&entry.session), None));
        }
        let (session, tap_rx) = self.spawn_locked(&mut sessions, project_id, cmd, rows, cols)?;
        Ok((session, Some(tap_rx)))
    }

    fn spawn_locked(
        &self,
        sessions: &mut HashMap<String, SessionEntry>,
        project_id: &str,
        cmd: &AgentCommand,
        rows: u16,
        cols: u16,
    ) -> Result<(Arc<PtySession>, mpsc::Receiver<Vec<u8>>), SessionError> {
        if sessions.len() >= self.max_sessions {
            return Err(SessionError::LimitReached(self.max_sessions));
        }

        let session_id = Uuid::new_v4().to_string();
        let (tap_tx, tap_rx) = mpsc::channel(CAPTURE_TAP_CAPACITY);
        let session = Arc::new(PtySession::spawn(
            session_id,
            project_id.to_string(),
            cmd,
            rows,
            cols,
            self.buffer_bytes,
            Some(tap_tx),
        )?);

        sessions.insert(
            project_id.to_string(),
            SessionEntry {
                session: Arc::clone(&session),
                attached: true,
                last_activity: Instant::now(),
            },
        );

        self.spawn_exit_reaper(project_id.to_string(), Arc::clone(&session));

        info!(
            "session {} created for project {} (pid {}), total: {}",
            short_id(&session.id),
            short_id(project_id),
            session.pid,
            sessions.len()
        );
        let _ = self.events.send(json!({
            "type": "session.created",
            "session_id": session.id,
            "project_id": project_id,
            "pid": session.pid,
        }));

        Ok((session, tap_rx))
    }

    /// Remove a session from the map when its child exits. Exactly one
    /// removal happens per exit: an explicit `shutdown` that got there first
    /// wins, and the reaper then finds a different (or no) entry and does
    /// nothing.
    fn spawn_exit_reaper(&self, project_id: String, session: Arc<PtySession>) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut exit_rx = session.exit_status();
            let code = loop {
                if let Some(code) = *exit_rx.borrow_and_update() {
                    break code;
                }
                if exit_rx.changed().await.is_err() {
                    break -1;
                }
            };

            let removed = {
                let mut sessions = registry.sessions.write().await;
                match sessions.get(&project_id) {
                    Some(entry) if Arc::ptr_eq(&entry.session, &session) => {
                        sessions.remove(&project_id);
                        true
                    }
                    _ => false,
                }
            };

            if removed {
                info!(
                    "session {} (project {}) exited with code {code}, removed",
                    short_id(&session.id),
                    short_id(&project_id)
                );
                let _ = registry.events.send(json!({
                    "type": "session.destroyed",
                    "session_id": session.id,
                    "project_id": project_id,
                    "reason": "exited",
                    "exit_code": code,
                }));
            }
        });
    }

    /// Current replay-buffer contents for a project's session.
    pub async fn replay(&self, project_id: &str) -> Option<Vec<u8>> {
        let session = self.get(project_id).await?;
        let buf = session.buffer.lock().await;
        Some(buf.snapshot())
    }

    /// Mark a terminal connection bound to the session. Returns `false` if no
    /// session is live.
    pub async fn attach(&self, project_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(project_id) {
            entry.attached = true;
            entry.last_activity = Instant::now();
            true
        } else {
            false
        }
    }

    /// Unbind the terminal connection. The session keeps running and keeps
    /// buffering output.
    pub async fn detach(&self, project_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(project_id) {
            entry.attached = false;
            entry.last_activity = Instant::now();
        }
    }

    /// Record activity (called on every terminal byte in either direction).
    pub async fn touch(&self, project_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(project_id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Mirror the captured agent conversation id into the live session.
    pub async fn record_agent_session_id(&self, project_id: &str, agent_session_id: &str) {
        let session = self.get(project_id).await;
        if let Some(session) = session {
            session.set_agent_session_id(agent_session_id).await;
        }
    }

    /// Close a session (SIGTERM → grace → SIGKILL) and remove it.
    /// Returns `true` if a session existed.
    pub async fn shutdown(&self, project_id: &str) -> bool {
        let entry = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(project_id)
        };
        let Some(entry) = entry else {
            return false;
        };

        let code = entry.session.close(self.close_grace).await;
        info!(
            "session {} (project {}) shut down (exit: {code:?})",
            short_id(&entry.session.id),
            short_id(project_id)
        );
        let _ = self.events.send(json!({
            "type": "session.destroyed",
            "session_id": entry.session.id,
            "project_id": project_id,
            "reason": "shutdown",
            "exit_code": code,
        }));
        true
    }

    /// Close every live session (used at server shutdown).
    pub async fn shutdown_all(&self) {
        let entries: Vec<(String, SessionEntry)> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().collect()
        };
        let count = entries.len();
        for (project_id, entry) in entries {
            entry.session.close(self.close_grace).await;
            info!(
                "session {} (project {}) shut down",
                short_id(&entry.session.id),
                short_id(&project_id)
            );
        }
        if count > 0 {
            info!("shut down {count} session(s)");
        }
    }

    /// Janitor pass: close sessions that are detached and have been idle for
    /// at least `idle_timeout`. Attached sessions are never evicted. Returns
    /// the number of sessions closed.
    pub async fn sweep(&self, idle_timeout: Duration) -> usize {
        let expired: Vec<(String, SessionEntry)> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, e)| !e.attached && e.last_activity.elapsed() >= idle_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|e| (id, e)))
                .collect()
        };

        let count = expired.len();
        // Graceful close outside the lock
        for (project_id, entry) in expired {
            info!(
                "session {} (project {}) idle-timed-out, closing",
                short_id(&entry.session.id),
                short_id(&project_id)
            );
            entry.session.close(self.close_grace).await;
            let _ = self.events.send(json!({
                "type": "session.destroyed",
                "session_id": entry.session.id,
                "project_id": project_id,
                "reason": "idle_timeout",
            }));
        }
        count
    }

    /// Count of live sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// List live sessions for the REST surface.
    pub async fn list(&self) -> Vec<SessionListItem> {
        let sessions = self.sessions.read().await;
        let mut items = Vec::with_capacity(sessions.len());
        for (project_id, entry) in sessions.iter() {
            items.push(SessionListItem {
                session_id: entry.session.id.clone(),
                project_id: project_id.clone(),
                pid: entry.session.pid,
                attached: entry.attached,
                running: entry.session.is_running(),
                agent_session_id: entry.session.agent_session_id().await,
                idle_secs: entry.last_activity.elapsed().as_secs(),
                created_at: entry.session.created_at,
            });
        }
        items
    }

    /// Test hook: age a session's activity clock backwards.
    #[cfg(test)]
    pub(crate) async fn force_idle(&self, project_id: &str, age: Duration) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(project_id) {
            entry.last_activity = Instant::now()
                .checked_sub(age)
                .expect("age within Instant range");
        }
    }
}
