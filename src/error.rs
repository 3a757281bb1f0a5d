//! Session-layer error types.
//!
//! One enum covers the whole session substrate (spawn, pty I/O, registry
//! lookups). Storage errors live in [`crate::store::StoreError`]; the two are
//! deliberately not unified — storage failures are contained where they occur
//! and never travel through the session paths.

use thiserror::Error;

/// Errors produced by the PTY primitive and the session registry.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A live session already exists for this project (`create` raced).
    #[error("a live session already exists for project {0}")]
    AlreadyExists(String),

    /// No live session for this project.
    #[error("no live session for project {0}")]
    NotFound(String),

    /// The registry is at its configured session limit.
    #[error("session limit reached (max {0})")]
    LimitReached(usize),

    /// The agent binary could not be started. No session was created.
    #[error("failed to spawn agent: {0}")]
    Spawn(#[source] std::io::Error),

    /// PTY allocation or ioctl failure.
    #[error("pty error: {0}")]
    Pty(#[from] nix::Error),

    /// Write or control operation on a session whose child has exited or
    /// whose pty has been closed.
    #[error("session is closed")]
    Closed,

    /// Signal delivery to the process group failed.
    #[error("failed to signal process group {pgid}: {message}")]
    Signal { pgid: u32, message: String },

    /// Other pty I/O failure.
    #[error("pty i/o error: {0}")]
    Io(#[from] std::io::Error),
}
