//! Capture of the agent's conversation id from its init frame.
//!
//! In stream-json mode the agent's first output line is a JSON object of the
//! shape `{"type":"system","subtype":"init","session_id":"..."}`. A capture
//! task taps the session's output stream, scans newline-delimited JSON for
//! that frame, and persists the id set-if-null so a later spawn can
//! `--resume` the conversation.
//!
//! The scan is bounded (line count and wall clock) so an agent that never
//! emits the frame cannot leak the task. Giving up is not an error — the
//! session simply has no resumable identity and the next run starts fresh.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::sessions::SessionRegistry;
use crate::store::ProjectStore;
use crate::util::short_id;

/// Bounds on the init-frame scan.
#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    /// Give up after this many complete output lines.
    pub max_lines: usize,
    /// Give up after this much wall-clock time.
    pub timeout: Duration,
}

impl CaptureSettings {
    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self {
            max_lines: cfg.capture_max_lines,
            timeout: Duration::from_secs(cfg.capture_timeout_secs),
        }
    }
}

enum ScanOutcome {
    /// Init frame seen and id recorded (or already established).
    Captured,
    /// Line bound exhausted without a usable init frame.
    Exhausted,
    /// The output stream ended (child exited or session closed).
    StreamEnded,
}

/// Extract the agent session id from one output line, if the line is the
/// init frame. Malformed JSON and non-init frames yield `None`.
pub fn parse_init_line(line: &[u8]) -> Option<String> {
    let trimmed = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|start| &line[start..])?;
    let value: serde_json::Value = serde_json::from_slice(trimmed).ok()?;
    if value.get("type")?.as_str()? != "system" {
        return None;
    }
    if value.get("subtype")?.as_str()? != "init" {
        return None;
    }
    Some(value.get("session_id")?.as_str()?.to_string())
}

/// Spawn the capture task for a freshly created session.
///
/// `tap` receives copies of the session's output chunks from the fan-out.
/// On success the id is persisted (set-if-null), mirrored into the live
/// session, and the project advances to `active` (first capture only).
pub fn spawn_capture(
    tap: mpsc::Receiver<Vec<u8>>,
    registry: SessionRegistry,
    store: Arc<ProjectStore>,
    project_id: String,
    settings: CaptureSettings,
    events: broadcast::Sender<serde_json::Value>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let scan = scan_for_init(
            tap,
            &registry,
            &store,
            &project_id,
            settings.max_lines,
            &events,
        );
        match tokio::time::timeout(settings.timeout, scan).await {
            Ok(ScanOutcome::Captured) => {}
            Ok(ScanOutcome::StreamEnded) => {
                debug!(
                    "project {}: output ended before an init frame was seen",
                    short_id(&project_id)
                );
            }
            Ok(ScanOutcome::Exhausted) | Err(_) => {
                warn!(
                    "project {}: no agent init frame within the scan bound, session has no resumable identity",
                    short_id(&project_id)
                );
            }
        }
    })
}

async fn scan_for_init(
    mut tap: mpsc::Receiver<Vec<u8>>,
    registry: &SessionRegistry,
    store: &ProjectStore,
    project_id: &str,
    max_lines: usize,
    events: &broadcast::Sender<serde_json::Value>,
) -> ScanOutcome {
    let mut pending: Vec<u8> = Vec::new();
    let mut lines_seen = 0usize;

    while let Some(chunk) = tap.recv().await {
        pending.extend_from_slice(&chunk);

        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            lines_seen += 1;

            if let Some(agent_session_id) = parse_init_line(&line) {
                match store
                    .set_agent_session_id_if_null(project_id, &agent_session_id)
                    .await
                {
                    Ok(won) => {
                        registry
                            .record_agent_session_id(project_id, &agent_session_id)
                            .await;
                        if won {
                            info!(
                                "project {}: captured agent session id {}",
                                short_id(project_id),
                                short_id(&agent_session_id)
                            );
                            match store.mark_active(project_id).await {
                                Ok(true) => {
                                    let _ = events.send(json!({
                                        "type": "project.status_changed",
                                        "project_id": project_id,
                                        "status": "active",
                                    }));
                                }
                                Ok(false) => {}
                                Err(e) => {
                                    warn!(
                                        "project {}: status update failed: {e}",
                                        short_id(project_id)
                                    );
                                }
                            }
                        }
                        return ScanOutcome::Captured;
                    }
                    // Storage failure: keep scanning, retry on the next
                    // qualifying line. Never fatal for the session.
                    Err(e) => {
                        warn!(
                            "project {}: persisting agent session id failed: {e}",
                            short_id(project_id)
                        );
                    }
                }
            }

            if lines_seen >= max_lines {
                return ScanOutcome::Exhausted;
            }
        }
    }

    ScanOutcome::StreamEnded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::ProjectStatus;

    const INIT_LINE: &[u8] = br#"{"type":"system","subtype":"init","session_id":"ag_42"}"#;

    #[test]
    fn test_parse_init_line_extracts_id() {
        assert_eq!(parse_init_line(INIT_LINE).as_deref(), Some("ag_42"));
    }

    #[test]
    fn test_parse_init_line_tolerates_leading_whitespace() {
        let mut line = b"  \t".to_vec();
        line.extend_from_slice(INIT_LINE);
        assert_eq!(parse_init_line(&line).as_deref(), Some("ag_42"));
    }

    #[test]
    fn test_parse_init_line_rejects_other_frames() {
        assert!(parse_init_line(br#"{"type":"assistant","message":"hi"}"#).is_none());
        assert!(parse_init_line(br#"{"type":"system","subtype":"status"}"#).is_none());
        assert!(parse_init_line(br#"{"type":"system","subtype":"init"}"#).is_none());
        assert!(
            parse_init_line(br#"{"type":"system","subtype":"init","session_id":7}"#).is_none()
        );
    }

    #[test]
    fn test_parse_init_line_skips_garbage() {
        assert!(parse_init_line(b"").is_none());
        assert!(parse_init_line(b"   ").is_none());
        assert!(parse_init_line(b"not json at all").is_none());
        assert!(parse_init_line(b"{\"type\":").is_none());
    }

    // ─── End-to-end capture task ─────────────────────────────────────────────

    async fn capture_fixture() -> (
        tempfile::TempDir,
        Arc<ProjectStore>,
        SessionRegistry,
        broadcast::Sender<serde_json::Value>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ProjectStore::new(dir.path().join("test.db")).await.unwrap());
        store.create_project("op_A", "/ws/A").await.unwrap();
        store.mark_initialized("op_A").await.unwrap();
        let (events, _) = broadcast::channel(16);
        let registry = SessionRegistry::new(4, 1024, Duration::from_secs(1), events.clone());
        (dir, store, registry, events)
    }

    fn settings() -> CaptureSettings {
        CaptureSettings {
            max_lines: 100,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_capture_persists_and_activates() {
        let (_dir, store, registry, events) = capture_fixture().await;
        let (tx, rx) = mpsc::channel(16);

        let handle = spawn_capture(
            rx,
            registry,
            Arc::clone(&store),
            "op_A".to_string(),
            settings(),
            events,
        );

        // Init frame split across two chunks, preceded by a blank line
        tx.send(b"\n{\"type\":\"system\",\"subtype\":\"in".to_vec())
            .await
            .unwrap();
        tx.send(b"it\",\"session_id\":\"ag_42\"}\nmore output\n".to_vec())
            .await
            .unwrap();

        handle.await.unwrap();

        let p = store.project("op_A").await.unwrap().unwrap();
        assert_eq!(p.agent_session_id.as_deref(), Some("ag_42"));
        assert_eq!(p.status, ProjectStatus::Active);
    }

    #[tokio::test]
    async fn test_capture_never_overwrites_established_id() {
        let (_dir, store, registry, events) = capture_fixture().await;
        store
            .set_agent_session_id_if_null("op_A", "ag_original")
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(16);
        let handle = spawn_capture(
            rx,
            registry,
            Arc::clone(&store),
            "op_A".to_string(),
            settings(),
            events,
        );

        let mut line = INIT_LINE.to_vec();
        line.push(b'\n');
        tx.send(line).await.unwrap();
        handle.await.unwrap();

        let p = store.project("op_A").await.unwrap().unwrap();
        assert_eq!(p.agent_session_id.as_deref(), Some("ag_original"));
    }

    #[tokio::test]
    async fn test_capture_gives_up_after_line_bound() {
        let (_dir, store, registry, events) = capture_fixture().await;
        let (tx, rx) = mpsc::channel(256);

        let handle = spawn_capture(
            rx,
            registry,
            Arc::clone(&store),
            "op_A".to_string(),
            CaptureSettings {
                max_lines: 10,
                timeout: Duration::from_secs(5),
            },
            events,
        );

        for i in 0..20 {
            // Sends stop failing only once the task has exited and dropped
            // the receiver; ignore errors past that point.
            let _ = tx.send(format!("plain output line {i}\n").into_bytes()).await;
        }
        drop(tx);
        handle.await.unwrap();

        let p = store.project("op_A").await.unwrap().unwrap();
        assert!(p.agent_session_id.is_none());
        assert_eq!(p.status, ProjectStatus::Initialized);
    }

    #[tokio::test]
    async fn test_capture_gives_up_after_timeout() {
        let (_dir, store, registry, events) = capture_fixture().await;
        let (tx, rx) = mpsc::channel(16);

        let handle = spawn_capture(
            rx,
            registry,
            Arc::clone(&store),
            "op_A".to_string(),
            CaptureSettings {
                max_lines: 100,
                timeout: Duration::from_millis(50),
            },
            events,
        );

        // Keep the sender alive but silent; the wall-clock bound must fire.
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        drop(tx);

        let p = store.project("op_A").await.unwrap().unwrap();
        assert!(p.agent_session_id.is_none());
    }

    #[tokio::test]
    async fn test_capture_skips_malformed_lines_before_init() {
        let (_dir, store, registry, events) = capture_fixture().await;
        let (tx, rx) = mpsc::channel(16);

        let handle = spawn_capture(
            rx,
            registry,
            Arc::clone(&store),
            "op_A".to_string(),
            settings(),
            events,
        );

        let mut payload = b"{\"broken\nnoise line\n".to_vec();
        payload.extend_from_slice(INIT_LINE);
        payload.push(b'\n');
        tx.send(payload).await.unwrap();
        handle.await.unwrap();

        let p = store.project("op_A").await.unwrap().unwrap();
        assert_eq!(p.agent_session_id.as_deref(), Some("ag_42"));
    }
}
