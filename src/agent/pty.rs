//! PTY allocation and byte-level control of the agent process.
//!
//! Uses the `nix` crate for POSIX PTY APIs. The PTY master fd is kept alive
//! for the session lifetime so resize and control operations can be performed
//! on it; reads and writes go through dup'd master fds wrapped as
//! `tokio::fs::File`, which routes the blocking syscalls onto tokio's
//! blocking pool.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::process::Stdio;
use std::time::Duration;

use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{watch, Mutex};

use crate::error::SessionError;

use super::command::AgentCommand;

/// The pty's EOF character (VEOF, `^D`). Written to the master to signal
/// end-of-input to the foreground process.
pub const EOF_BYTE: u8 = 0x04;

/// Maximum bytes per output chunk.
const READ_CHUNK: usize = 8192;

/// A child process attached to a pseudo-terminal.
///
/// The child is a session leader in its own process group with the PTY slave
/// as its controlling terminal, so signals sent to `-pgid` reach the whole
/// process tree. Exit is observed by a background wait task and published on
/// a watch channel; every control operation checks it, and `write` after exit
/// fails with [`SessionError::Closed`].
pub struct PtyProcess {
    pid: u32,
    master: OwnedFd,
    writer: Mutex<tokio::fs::File>,
    exit_rx: watch::Receiver<Option<i32>>,
}

/// The read half of the PTY master, taken once at spawn and owned by the
/// session's fan-out task.
pub struct PtyOutput {
    reader: tokio::fs::File,
}

impl PtyOutput {
    /// Yield the next available output chunk, or `None` on EOF.
    ///
    /// A read error is treated as EOF: Linux reports `EIO` on the master once
    /// the slave side is gone, which is the normal end-of-stream signal for a
    /// pty.
    pub async fn read_chunk(&mut self) -> Option<Vec<u8>> {
        let mut tmp = [0u8; READ_CHUNK];
        match self.reader.read(&mut tmp).await {
            Ok(0) | Err(_) => None,
            Ok(n) => Some(tmp[..n].to_vec()),
        }
    }
}

/// Allocate a PTY pair with the given terminal size.
fn allocate_pty(rows: u16, cols: u16) -> Result<OpenptyResult, nix::Error> {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    openpty(&winsize, None)
}

impl PtyProcess {
    /// Spawn the agent on a freshly allocated PTY.
    ///
    /// The child becomes a session leader with the PTY slave as its
    /// controlling terminal; stdin/stdout/stderr are all connected to the
    /// slave fd. Returns once the child has been spawned, not when it is
    /// ready.
    pub fn spawn(
        cmd: &AgentCommand,
        rows: u16,
        cols: u16,
    ) -> Result<(PtyProcess, PtyOutput), SessionError> {
        let OpenptyResult { master, slave } = allocate_pty(rows, cols)?;
        let slave_fd = slave.as_raw_fd();

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .current_dir(&cmd.working_dir)
            .envs(&cmd.env)
            .kill_on_drop(true);

        // All three stdio streams are attached to the PTY slave inside
        // pre_exec; null them here so tokio doesn't wire up pipes of its own.
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // SAFETY: runs between fork and exec; only async-signal-safe
        // syscalls below.
        unsafe {
            command.pre_exec(move || {
                // setsid makes the child a session leader in a fresh process
                // group, so kill(-pgid) later reaches its whole tree. The
                // slave then becomes the controlling terminal and backs
                // fds 0..=2.
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                for fd in 0..=2 {
                    if libc::dup2(slave_fd, fd) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                if slave_fd > 2 {
                    libc::close(slave_fd);
                }
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(SessionError::Spawn)?;
        let pid = child.id().unwrap_or(0);

        // Dup the master fd: one for writing, one for reading, the original
        // kept for resize ioctls.
        let master_raw: RawFd = master.as_raw_fd();
        let writer_fd: RawFd = unsafe { libc::dup(master_raw) };
        if writer_fd < 0 {
            return Err(SessionError::Io(std::io::Error::last_os_error()));
        }
        let reader_fd: RawFd = unsafe { libc::dup(master_raw) };
        if reader_fd < 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(writer_fd);
            }
            return Err(SessionError::Io(err));
        }

        // SAFETY: we own these file descriptors via dup
        let writer = tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(writer_fd) });
        let reader = tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(reader_fd) });

        // Wait task: owns the Child, reaps it, publishes the exit code.
        // Exit by signal is reported as -1.
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            };
            let _ = exit_tx.send(Some(code));
        });

        Ok((
            PtyProcess {
                pid,
                master,
                writer: Mutex::new(writer),
                exit_rx,
            },
            PtyOutput { reader },
        ))
    }

    /// OS process id of the child (equals the process group id, since the
    /// child is a session leader).
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the child is still running.
    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Watch channel carrying the child's exit code once it terminates.
    pub fn exit_status(&self) -> watch::Receiver<Option<i32>> {
        self.exit_rx.clone()
    }

    /// Write bytes to the pty master. Fails with [`SessionError::Closed`]
    /// once the child has exited or the pty is gone.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .await
            .map_err(|_| SessionError::Closed)?;
        writer.flush().await.map_err(|_| SessionError::Closed)
    }

    /// Write the pty EOF character, signalling end-of-input.
    pub async fn send_eof(&self) -> Result<(), SessionError> {
        self.write(&[EOF_BYTE]).await
    }

    /// Set the pty window size and notify the child's process group with
    /// SIGWINCH. Idempotent at the pty layer.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), SessionError> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCSWINSZ is a well-defined ioctl that reads a Winsize struct.
        let ret = unsafe {
            libc::ioctl(
                self.master.as_raw_fd(),
                libc::TIOCSWINSZ,
                std::ptr::addr_of!(winsize),
            )
        };
        if ret == -1 {
            return Err(SessionError::Pty(nix::Error::last()));
        }
        self.signal(libc::SIGWINCH)
    }

    /// Deliver a signal to the child's process group.
    pub fn signal(&self, signal: i32) -> Result<(), SessionError> {
        let pgid = self.pid as i32;
        if pgid <= 0 {
            return Err(SessionError::Closed);
        }
        // kill(-pgid, signal) sends to all processes in the group
        let ret = unsafe { libc::kill(-pgid, signal) };
        if ret == 0 {
            Ok(())
        } else {
            Err(SessionError::Signal {
                pgid: self.pid,
                message: std::io::Error::last_os_error().to_string(),
            })
        }
    }

    /// Terminate the child: SIGTERM to the process group, wait up to `grace`
    /// for it to exit, then SIGKILL survivors.
    ///
    /// Returns the exit code if the child exited within the grace period,
    /// `None` if it had to be force-killed. Never deadlocks — a child that
    /// ignores SIGTERM is killed unconditionally once the grace expires.
    pub async fn close(&self, grace: Duration) -> Option<i32> {
        let mut exit_rx = self.exit_rx.clone();
        if let Some(code) = *exit_rx.borrow_and_update() {
            return Some(code);
        }

        let _ = self.signal(libc::SIGTERM);

        let waited = tokio::time::timeout(grace, async {
            loop {
                if let Some(code) = *exit_rx.borrow_and_update() {
                    return code;
                }
                if exit_rx.changed().await.is_err() {
                    return -1;
                }
            }
        })
        .await;

        match waited {
            Ok(code) => Some(code),
            Err(_) => {
                // Still running after grace — force kill. The wait task reaps.
                let _ = self.signal(libc::SIGKILL);
                None
            }
        }
    }
}
