//! Terminal wire protocol.
//!
//! One WebSocket per user terminal; every frame is a single JSON text message
//! with a `type` discriminator. Inbound frames carry user keystrokes, resize
//! requests, and signals; outbound frames carry connection status, terminal
//! output, protocol errors, and the final close notification.

use serde::{Deserialize, Serialize};

/// WebSocket close code for a malformed or unknown id in the URL.
pub const CLOSE_BAD_ID: u16 = 4000;

/// WebSocket close code for the project-scoped endpoint when no live session
/// exists (that endpoint never creates sessions).
pub const CLOSE_NO_SESSION: u16 = 4004;

/// Client → server frames.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Raw bytes the user typed, including control codes; written verbatim
    /// into the pty.
    Input { data: String },
    /// New terminal window size.
    Resize { rows: u16, cols: u16 },
    /// Signal for the agent's process group (EOF is the pty's EOF character
    /// written to input).
    Signal { signal: SignalKind },
}

/// Signals a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    #[serde(rename = "SIGINT")]
    Interrupt,
    #[serde(rename = "SIGTERM")]
    Terminate,
    #[serde(rename = "EOF")]
    Eof,
}

/// Server → client frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    /// Connection lifecycle announcement. Sent at least twice per accept:
    /// once as a bare ack before any lookup (`session_id: null`), once after
    /// the session is resolved.
    Status {
        connected: bool,
        session_id: Option<String>,
    },
    /// A chunk of pty output, decoded as UTF-8 with replacement.
    Output { data: String },
    /// Protocol or runtime error. The connection stays open on a first
    /// offense.
    Error { code: String, message: String },
    /// Child exited or the session was closed.
    Closed { exit_code: Option<i32> },
}

impl ServerFrame {
    pub fn output(bytes: &[u8]) -> Self {
        ServerFrame::Output {
            data: String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_frame_parses() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"input","data":"ls -la\r"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Input {
                data: "ls -la\r".to_string()
            }
        );
    }

    #[test]
    fn test_resize_frame_parses() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"resize","rows":40,"cols":120}"#).unwrap();
        assert_eq!(frame, ClientFrame::Resize { rows: 40, cols: 120 });
    }

    #[test]
    fn test_signal_frame_names() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"signal","signal":"SIGINT"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Signal {
                signal: SignalKind::Interrupt
            }
        );
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"signal","signal":"EOF"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Signal {
                signal: SignalKind::Eof
            }
        );
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"reboot"}"#).is_err());
        assert!(serde_json::from_str::<ClientFrame>(r#"{"data":"no type"}"#).is_err());
        assert!(
            serde_json::from_str::<ClientFrame>(r#"{"type":"signal","signal":"SIGKILL"}"#)
                .is_err()
        );
    }

    #[test]
    fn test_status_frame_shape() {
        let json = serde_json::to_value(ServerFrame::Status {
            connected: true,
            session_id: None,
        })
        .unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["connected"], true);
        assert!(json["session_id"].is_null());
    }

    #[test]
    fn test_output_frame_lossy_utf8() {
        let frame = ServerFrame::output(&[b'h', b'i', 0xff]);
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "output");
        assert_eq!(json["data"], "hi\u{fffd}");
    }

    #[test]
    fn test_closed_frame_shape() {
        let json = serde_json::to_value(ServerFrame::Closed { exit_code: Some(0) }).unwrap();
        assert_eq!(json["type"], "closed");
        assert_eq!(json["exit_code"], 0);

        let json = serde_json::to_value(ServerFrame::Closed { exit_code: None }).unwrap();
        assert!(json["exit_code"].is_null());
    }
}
