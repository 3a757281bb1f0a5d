//! One live agent process: pty, replay buffer, and the fan-out task.
//!
//! A [`PtySession`] wraps the agent process with output decoupled from any
//! WebSocket — the fan-out task drains pty chunks into the [`ReplayBuffer`]
//! regardless of whether a connection is attached, so the session survives
//! disconnects and a reconnecting client catches up from the buffer.
//!
//! While a capture tap is attached (first spawn only), every chunk is also
//! copied to it best-effort via `try_send`; the tap is dropped as soon as the
//! capture task stops listening.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::agent::command::AgentCommand;
use crate::agent::pty::PtyProcess;
use crate::error::SessionError;
use crate::util::{now_ms, short_id};

use super::buffer::ReplayBuffer;

/// A live agent session owned by the registry.
pub struct PtySession {
    /// Server-generated id, distinct from the agent's own conversation id.
    pub id: String,
    /// Owning output project. Unique among live sessions.
    pub project_id: String,
    /// OS process id of the agent (process group leader).
    pub pid: u32,
    /// Epoch milliseconds when the session was spawned.
    pub created_at: i64,
    /// Replay buffer fed by the fan-out task.
    pub buffer: Arc<Mutex<ReplayBuffer>>,
    pty: PtyProcess,
    /// Mirror of the persisted agent conversation id, once captured.
    agent_session_id: Mutex<Option<String>>,
    fanout: JoinHandle<()>,
}

impl PtySession {
    /// Spawn the agent and start the output fan-out.
    ///
    /// `capture_tx`, when present, receives a copy of every output chunk
    /// until its receiver goes away (the init-frame capture task).
    pub fn spawn(
        id: String,
        project_id: String,
        cmd: &AgentCommand,
        rows: u16,
        cols: u16,
        buffer_bytes: usize,
        capture_tx: Option<mpsc::Sender<Vec<u8>>>,
    ) -> Result<Self, SessionError> {
        let (pty, mut output) = PtyProcess::spawn(cmd, rows, cols)?;
        let pid = pty.pid();

        let buffer = Arc::new(Mutex::new(ReplayBuffer::new(buffer_bytes)));

        // Fan-out: pty chunks → replay buffer (+ capture tap while it lives).
        // Buffer waiters (bound connection pumps) are woken by the push.
        let buf = Arc::clone(&buffer);
        let sid = id.clone();
        let mut tap = capture_tx;
        let fanout = tokio::spawn(async move {
            while let Some(chunk) = output.read_chunk().await {
                if let Some(tx) = &tap {
                    match tx.try_send(chunk.clone()) {
                        Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                        Err(mpsc::error::TrySendError::Closed(_)) => tap = None,
                    }
                }
                buf.lock().await.push(chunk);
            }
            info!("session {}: pty output closed", short_id(&sid));
        });

        Ok(PtySession {
            id,
            project_id,
            pid,
            created_at: now_ms(),
            buffer,
            pty,
            agent_session_id: Mutex::new(None),
            fanout,
        })
    }

    /// Write raw bytes into the agent's terminal.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        self.pty.write(data).await
    }

    /// Write the pty EOF character.
    pub async fn send_eof(&self) -> Result<(), SessionError> {
        self.pty.send_eof().await
    }

    /// Resize the terminal and notify the process group.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), SessionError> {
        self.pty.resize(rows, cols)
    }

    /// Deliver a signal to the agent's process group.
    pub fn signal(&self, signal: i32) -> Result<(), SessionError> {
        self.pty.signal(signal)
    }

    pub fn is_running(&self) -> bool {
        self.pty.is_running()
    }

    /// Watch channel carrying the exit code once the agent terminates.
    pub fn exit_status(&self) -> watch::Receiver<Option<i32>> {
        self.pty.exit_status()
    }

    pub async fn agent_session_id(&self) -> Option<String> {
        self.agent_session_id.lock().await.clone()
    }

    pub async fn set_agent_session_id(&self, agent_session_id: &str) {
        *self.agent_session_id.lock().await = Some(agent_session_id.to_string());
    }

    /// Terminate the agent (SIGTERM → grace → SIGKILL) and stop the fan-out.
    ///
    /// Returns the exit code, or `None` if the grace period expired and the
    /// process group was force-killed.
    pub async fn close(&self, grace: Duration) -> Option<i32> {
        let code = self.pty.close(grace).await;
        self.fanout.abort();
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn cat_command() -> AgentCommand {
        AgentCommand {
            program: "/bin/cat".to_string(),
            args: Vec::new(),
            working_dir: PathBuf::from("/"),
            env: HashMap::new(),
        }
    }

    fn cat_session(capture_tx: Option<mpsc::Sender<Vec<u8>>>) -> PtySession {
        PtySession::spawn(
            "srv_test".to_string(),
            "op_A".to_string(),
            &cat_command(),
            24,
            80,
            64 * 1024,
            capture_tx,
        )
        .unwrap()
    }

    /// Wait until the session's buffer contains `needle`.
    async fn wait_for_output(session: &PtySession, needle: &[u8]) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let found = {
                    let buf = session.buffer.lock().await;
                    buf.snapshot().windows(needle.len()).any(|w| w == needle)
                };
                if found {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("output not observed in time");
    }

    #[tokio::test]
    async fn test_output_lands_in_replay_buffer() {
        let session = cat_session(None);
        session.write(b"hello\n").await.unwrap();
        wait_for_output(&session, b"hello").await;

        // Replay is deterministic across repeated reads
        let a = session.buffer.lock().await.snapshot();
        let b = session.buffer.lock().await.snapshot();
        assert_eq!(a, b);

        let _ = session.close(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_capture_tap_receives_output_copy() {
        let (tap_tx, mut tap_rx) = mpsc::channel(64);
        let session = cat_session(Some(tap_tx));
        session.write(b"tapped\n").await.unwrap();

        let chunk = tokio::time::timeout(Duration::from_secs(5), async {
            let mut seen = Vec::new();
            while let Some(chunk) = tap_rx.recv().await {
                seen.extend_from_slice(&chunk);
                if seen.windows(6).any(|w| w == b"tapped") {
                    break;
                }
            }
            seen
        })
        .await
        .unwrap();
        assert!(!chunk.is_empty());

        let _ = session.close(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_fanout_survives_dropped_tap() {
        let (tap_tx, tap_rx) = mpsc::channel(64);
        let session = cat_session(Some(tap_tx));
        drop(tap_rx);

        session.write(b"still flowing\n").await.unwrap();
        wait_for_output(&session, b"still flowing").await;

        let _ = session.close(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_agent_session_id_mirror() {
        let session = cat_session(None);
        assert!(session.agent_session_id().await.is_none());
        session.set_agent_session_id("ag_42").await;
        assert_eq!(session.agent_session_id().await.as_deref(), Some("ag_42"));
        let _ = session.close(Duration::from_secs(2)).await;
    }
}
