//! Agent process control.
//!
//! Three concerns live here:
//!
//! - **`pty`** — spawning the agent CLI attached to a pseudo-terminal and the
//!   byte-level read/write/resize/signal/close surface over it.
//! - **`command`** — assembling the agent invocation (stream-json flags,
//!   `--resume` when a prior conversation id is known, workspace cwd).
//! - **`capture`** — watching the agent's first output lines for its
//!   stream-json init frame and persisting the conversation id it announces.

pub mod capture;
pub mod command;
pub mod pty;

pub use command::AgentCommand;
pub use pty::{PtyOutput, PtyProcess};
