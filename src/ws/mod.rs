//! Terminal WebSocket transport.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to one of two endpoints (token validated before the
//!    upgrade completes):
//!    - `GET /api/milestones/{milestone_id}/terminal?token=<key>` — binds to
//!      the milestone's parent project's session, **creating it if absent**.
//!    - `GET /api/output-projects/{project_id}/terminal?token=<key>` — binds
//!      to an existing session only; closes with code 4004 if none is live.
//! 2. The server immediately sends `status{connected:true, session_id:null}`
//!    as a connection ack, then resolves the session and sends a second
//!    `status` carrying the server-side session id.
//! 3. A reconnecting client receives the session's replay buffer as `output`
//!    frames before any live output; replay and live output are one ordered
//!    stream with no duplication and no gap (oldest-prefix loss under buffer
//!    pressure is reported in the logs, not as an error).
//! 4. If the connect delivered a *new* milestone to an already-running agent,
//!    the server waits briefly and then writes `/new-milestone <path>` into
//!    the pty — the only input the server ever synthesizes.
//! 5. Three pumps then run concurrently (inbound frames, outbound output,
//!    exit watcher); the first to finish cancels the others, the connection
//!    detaches, and the socket closes. The session itself survives every
//!    disconnect — only child exit, idle eviction, or an explicit shutdown
//!    removes it.
//!
//! ## Frames
//!
//! | Direction | `type`   | Fields                          |
//! |-----------|----------|---------------------------------|
//! | C → S     | `input`  | `data`                          |
//! | C → S     | `resize` | `rows`, `cols`                  |
//! | C → S     | `signal` | `signal` (SIGINT\|SIGTERM\|EOF) |
//! | S → C     | `status` | `connected`, `session_id`       |
//! | S → C     | `output` | `data` (UTF-8, lossy)           |
//! | S → C     | `error`  | `code`, `message`               |
//! | S → C     | `closed` | `exit_code`                     |

pub mod protocol;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::capture::{spawn_capture, CaptureSettings};
use crate::agent::command::{new_milestone_line, AgentCommand};
use crate::error::SessionError;
use crate::sessions::session::PtySession;
use crate::util::short_id;
use crate::AppState;

use protocol::{ClientFrame, ServerFrame, SignalKind, CLOSE_BAD_ID, CLOSE_NO_SESSION};

/// Malformed inbound frames tolerated before the socket is closed.
const MAX_PROTOCOL_ERRORS: u32 = 5;

/// Query parameters for the WebSocket upgrade request.
#[derive(Deserialize)]
pub struct WsQuery {
    /// API key passed as a query parameter (browsers can't set headers on
    /// WebSocket upgrades).
    pub token: String,
}

/// Which URL shape the terminal was opened on.
enum TerminalTarget {
    /// Milestone endpoint: resolves to the parent project, creates the
    /// session if absent, and may deliver the milestone.
    Milestone(String),
    /// Project endpoint: observe/reconnect only, never creates.
    Project(String),
}

/// `GET /api/milestones/{milestone_id}/terminal` — WebSocket upgrade.
pub async fn milestone_terminal(
    State(state): State<AppState>,
    Path(milestone_id): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !crate::auth::constant_time_eq(state.config.auth.api_key.as_bytes(), query.token.as_bytes())
    {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }
    ws.on_upgrade(move |socket| {
        handle_terminal(socket, state, TerminalTarget::Milestone(milestone_id))
    })
}

/// `GET /api/output-projects/{output_project_id}/terminal` — WebSocket upgrade.
pub async fn project_terminal(
    State(state): State<AppState>,
    Path(output_project_id): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !crate::auth::constant_time_eq(state.config.auth.api_key.as_bytes(), query.token.as_bytes())
    {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }
    ws.on_upgrade(move |socket| {
        handle_terminal(socket, state, TerminalTarget::Project(output_project_id))
    })
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_default();
    socket.send(Message::Text(text.into())).await
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// Main terminal connection loop: ack, resolve, bind, pump, detach.
async fn handle_terminal(mut socket: WebSocket, state: AppState, target: TerminalTarget) {
    // Connection ack before any lookup
    if send_frame(
        &mut socket,
        &ServerFrame::Status {
            connected: true,
            session_id: None,
        },
    )
    .await
    .is_err()
    {
        return;
    }

    let Some((session, inject)) = resolve_session(&mut socket, &state, &target).await else {
        return; // socket already closed with the appropriate code
    };
    let project_id = session.project_id.clone();

    state.registry.attach(&project_id).await;
    info!(
        "terminal bound to session {} (project {})",
        short_id(&session.id),
        short_id(&project_id)
    );

    // Outgoing frames are funneled through a channel so the pumps can send
    // without sharing the sink.
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerFrame>(256);
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(t) => t,
                Err(e) => {
                    warn!("terminal send: failed to serialize frame: {e}");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    // Second status frame, now with the resolved server session id
    let _ = tx
        .send(ServerFrame::Status {
            connected: true,
            session_id: Some(session.id.clone()),
        })
        .await;

    // New milestone on a pre-existing session: give the agent a moment to be
    // receptive, then inject the slash-command. Fire-and-forget.
    if let Some(context_path) = inject {
        let session = Arc::clone(&session);
        let delay = Duration::from_millis(state.config.agent.milestone_delay_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let line = format!("{}\n", new_milestone_line(&context_path));
            match session.write(line.as_bytes()).await {
                Ok(()) => info!(
                    "project {}: delivered new milestone via stdin",
                    short_id(&session.project_id)
                ),
                Err(e) => warn!(
                    "project {}: milestone injection failed: {e}",
                    short_id(&session.project_id)
                ),
            }
        });
    }

    // Three pumps; the first to finish cancels the rest.
    tokio::select! {
        () = inbound_pump(&mut ws_stream, &state, &session, &tx) => {
            debug!("session {}: client side closed", short_id(&session.id));
        }
        () = outbound_pump(&state, &session, &tx) => {}
        () = exit_pump(&session, &tx) => {
            info!("session {}: child exit delivered to terminal", short_id(&session.id));
        }
    }

    // Unbind; the session survives the disconnect.
    state.registry.detach(&project_id).await;

    // Let queued frames (notably `closed`) flush, then tear the sink down.
    drop(tx);
    let _ = tokio::time::timeout(Duration::from_secs(5), &mut send_task).await;
    send_task.abort();

    info!(
        "terminal detached from project {}",
        short_id(&project_id)
    );
}

/// Resolve the URL target to a live session.
///
/// On the milestone endpoint this is where first-spawn wiring happens: the
/// capture task is attached to the new session's output tap, the project
/// advances created → initialized, and the milestone is claimed as delivered
/// (the spawn's argv carries it). On a pre-existing session the milestone is
/// claimed and handed back for stdin injection instead.
///
/// Returns `None` after closing the socket if the target cannot be served.
async fn resolve_session(
    socket: &mut WebSocket,
    state: &AppState,
    target: &TerminalTarget,
) -> Option<(Arc<PtySession>, Option<String>)> {
    match target {
        TerminalTarget::Project(project_id) => {
            match state.registry.get(project_id).await {
                Some(session) => Some((session, None)),
                None => {
                    close_with(socket, CLOSE_NO_SESSION, "no live session").await;
                    None
                }
            }
        }

        TerminalTarget::Milestone(milestone_id) => {
            let milestone = match state.store.milestone(milestone_id).await {
                Ok(Some(m)) => m,
                Ok(None) => {
                    close_with(socket, CLOSE_BAD_ID, "unknown milestone").await;
                    return None;
                }
                Err(e) => {
                    warn!("milestone {} lookup failed: {e}", short_id(milestone_id));
                    let _ = send_frame(socket, &ServerFrame::error("STORAGE_ERROR", "lookup failed"))
                        .await;
                    let _ = socket.send(Message::Close(None)).await;
                    return None;
                }
            };

            let project = match state.store.project(&milestone.output_project_id).await {
                Ok(Some(p)) => p,
                Ok(None) => {
                    close_with(socket, CLOSE_BAD_ID, "unknown project").await;
                    return None;
                }
                Err(e) => {
                    warn!(
                        "project {} lookup failed: {e}",
                        short_id(&milestone.output_project_id)
                    );
                    let _ = send_frame(socket, &ServerFrame::error("STORAGE_ERROR", "lookup failed"))
                        .await;
                    let _ = socket.send(Message::Close(None)).await;
                    return None;
                }
            };

            let cmd = AgentCommand::build(&state.config.agent, &project, &milestone);
            let rows = state.config.server.default_terminal_rows;
            let cols = state.config.server.default_terminal_cols;

            match state.registry.get_or_create(&project.id, &cmd, rows, cols).await {
                // Fresh spawn: this connect created the session
                Ok((session, Some(tap_rx))) => {
                    spawn_capture(
                        tap_rx,
                        state.registry.clone(),
                        Arc::clone(&state.store),
                        project.id.clone(),
                        CaptureSettings::from_config(&state.config.agent),
                        state.events.clone(),
                    );

                    match state.store.mark_initialized(&project.id).await {
                        Ok(true) => {
                            let _ = state.events.send(json!({
                                "type": "project.status_changed",
                                "project_id": project.id,
                                "status": "initialized",
                            }));
                        }
                        Ok(false) => {}
                        Err(e) => warn!(
                            "project {}: status update failed: {e}",
                            short_id(&project.id)
                        ),
                    }

                    // The spawn's argv carries this milestone; claim it so a
                    // reconnect does not re-inject.
                    if let Err(e) = state.store.claim_milestone_dispatch(&milestone.id).await {
                        warn!(
                            "milestone {}: dispatch claim failed: {e}",
                            short_id(&milestone.id)
                        );
                    }

                    Some((session, None))
                }

                // Live session: deliver the milestone over stdin, once.
                Ok((session, None)) => {
                    let inject = match state.store.claim_milestone_dispatch(&milestone.id).await {
                        Ok(true) => Some(milestone.context_file_path.clone()),
                        Ok(false) => None,
                        Err(e) => {
                            warn!(
                                "milestone {}: dispatch claim failed: {e}",
                                short_id(&milestone.id)
                            );
                            None
                        }
                    };
                    Some((session, inject))
                }

                Err(e) => {
                    warn!("project {}: session spawn failed: {e}", short_id(&project.id));
                    let code = match &e {
                        SessionError::Spawn(_) => "SPAWN_FAILURE",
                        SessionError::LimitReached(_) => "SESSION_LIMIT",
                        _ => "SESSION_ERROR",
                    };
                    let _ = send_frame(socket, &ServerFrame::error(code, e.to_string())).await;
                    let _ = socket.send(Message::Close(None)).await;
                    None
                }
            }
        }
    }
}

/// Inbound pump: client frames → pty.
///
/// Malformed frames are answered with an `error` frame; the connection is
/// only closed after [`MAX_PROTOCOL_ERRORS`] of them. Runtime failures
/// (write-to-closed, resize on a dead pty) are reported the same way — the
/// exit pump owns the close decision.
async fn inbound_pump(
    ws_stream: &mut SplitStream<WebSocket>,
    state: &AppState,
    session: &Arc<PtySession>,
    tx: &mpsc::Sender<ServerFrame>,
) {
    let mut protocol_errors = 0u32;

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                state.registry.touch(&session.project_id).await;

                let frame = match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        protocol_errors += 1;
                        let _ = tx
                            .send(ServerFrame::error(
                                "PROTOCOL_ERROR",
                                format!("malformed frame: {e}"),
                            ))
                            .await;
                        if protocol_errors >= MAX_PROTOCOL_ERRORS {
                            warn!(
                                "session {}: repeated protocol errors, closing",
                                short_id(&session.id)
                            );
                            return;
                        }
                        continue;
                    }
                };

                let result = match frame {
                    ClientFrame::Input { data } => session.write(data.as_bytes()).await,
                    ClientFrame::Resize { rows, cols } => session.resize(rows, cols),
                    ClientFrame::Signal { signal } => match signal {
                        SignalKind::Interrupt => session.signal(libc::SIGINT),
                        SignalKind::Terminate => session.signal(libc::SIGTERM),
                        SignalKind::Eof => session.send_eof().await,
                    },
                };
                if let Err(e) = result {
                    let _ = tx
                        .send(ServerFrame::error("SESSION_ERROR", e.to_string()))
                        .await;
                }
            }
            Message::Close(_) => return,
            // Ping/pong are handled by the transport; binary frames are not
            // part of the protocol.
            _ => {}
        }
    }
}

/// Outbound pump: replay buffer → client.
///
/// The cursor starts at session origin, so a reconnecting client first
/// receives the buffered history and then live output, in order, with no
/// duplication. Bytes evicted while the client was away are simply absent
/// from the front.
async fn outbound_pump(state: &AppState, session: &Arc<PtySession>, tx: &mpsc::Sender<ServerFrame>) {
    let mut cursor = 0u64;

    loop {
        let drained = {
            let buf = session.buffer.lock().await;
            if buf.has_since(cursor) {
                let (bytes, next, dropped) = buf.read_since(cursor);
                if dropped > 0 {
                    debug!(
                        "session {}: {dropped} byte(s) of replay prefix lost to buffer pressure",
                        short_id(&session.id)
                    );
                }
                cursor = next;
                Some(bytes)
            } else {
                None
            }
        };

        if let Some(bytes) = drained {
            if tx.send(ServerFrame::output(&bytes)).await.is_err() {
                return;
            }
            state.registry.touch(&session.project_id).await;
            continue;
        }

        // Register as a waiter before re-checking, so a push between the
        // check and the await cannot be missed.
        let notify = session.buffer.lock().await.notifier();
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !session.buffer.lock().await.has_since(cursor) {
            notified.await;
        }
    }
}

/// Exit pump: announce child exit with a `closed` frame.
async fn exit_pump(session: &Arc<PtySession>, tx: &mpsc::Sender<ServerFrame>) {
    let mut exit_rx = session.exit_status();
    let code = loop {
        if let Some(code) = *exit_rx.borrow_and_update() {
            break code;
        }
        if exit_rx.changed().await.is_err() {
            break -1;
        }
    };

    // Give the fan-out a moment to land trailing output before the close is
    // announced.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let _ = tx
        .send(ServerFrame::Closed {
            exit_code: Some(code),
        })
        .await;
}
