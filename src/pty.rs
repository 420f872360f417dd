//! Child process attached to a pseudo-terminal.
//!
//! A [`PtyHandle`] owns both halves of the lifecycle: the child and the PTY
//! master. Reads and writes go through a cloned reader and the taken writer
//! so they can live on their own blocking threads, while resizes share the
//! master through a [`PtyResizer`].

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    Open(String),

    #[error("failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("pty i/o setup failed: {0}")]
    Io(String),

    #[error("failed to resize pty: {0}")]
    Resize(String),

    #[error("pty device already closed")]
    Closed,
}

pub type PtyResult<T> = Result<T, PtyError>;

type SharedMaster = Arc<Mutex<Option<Box<dyn MasterPty + Send>>>>;

/// Something that can change a terminal's window size.
pub trait Resize: Send + Sync {
    fn resize(&self, rows: u16, cols: u16) -> PtyResult<()>;
}

/// Resizes the PTY master it was created from.
#[derive(Clone)]
pub struct PtyResizer {
    master: SharedMaster,
}

impl Resize for PtyResizer {
    fn resize(&self, rows: u16, cols: u16) -> PtyResult<()> {
        let guard = self
            .master
            .lock()
            .map_err(|_| PtyError::Resize("pty lock poisoned".to_string()))?;
        let master = guard.as_ref().ok_or(PtyError::Closed)?;
        master
            .resize(size(rows, cols))
            .map_err(|e| PtyError::Resize(e.to_string()))
    }
}

/// A running child process and the PTY device it is attached to.
pub struct PtyHandle {
    command: String,
    master: SharedMaster,
    child: Box<dyn Child + Send + Sync>,
    terminated: bool,
}

fn size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

impl PtyHandle {
    /// Spawn `command` with `args` on a fresh PTY of the given size.
    ///
    /// The child inherits this process's environment, with `TERM` set for
    /// xterm-compatible clients.
    pub fn spawn(command: &str, args: &[String], rows: u16, cols: u16) -> PtyResult<Self> {
        let pair = native_pty_system()
            .openpty(size(rows, cols))
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let mut cmd = CommandBuilder::new(command);
        cmd.args(args);
        cmd.env("TERM", "xterm-256color");

        let child = pair.slave.spawn_command(cmd).map_err(|e| PtyError::Spawn {
            command: command.to_string(),
            reason: e.to_string(),
        })?;
        drop(pair.slave);

        tracing::debug!(
            command = %command,
            args = ?args,
            pid = ?child.process_id(),
            "Spawned process on pty"
        );

        Ok(Self {
            command: command.to_string(),
            master: Arc::new(Mutex::new(Some(pair.master))),
            child,
            terminated: false,
        })
    }

    pub fn process_id(&self) -> Option<u32> {
        self.child.process_id()
    }

    /// A reader over the process output. Reads fail once the child is gone.
    pub fn reader(&self) -> PtyResult<Box<dyn Read + Send>> {
        let guard = self
            .master
            .lock()
            .map_err(|_| PtyError::Io("pty lock poisoned".to_string()))?;
        let master = guard.as_ref().ok_or(PtyError::Closed)?;
        master
            .try_clone_reader()
            .map_err(|e| PtyError::Io(e.to_string()))
    }

    /// The writer feeding the process input. Can only be taken once.
    pub fn writer(&self) -> PtyResult<Box<dyn Write + Send>> {
        let guard = self
            .master
            .lock()
            .map_err(|_| PtyError::Io("pty lock poisoned".to_string()))?;
        let master = guard.as_ref().ok_or(PtyError::Closed)?;
        master.take_writer().map_err(|e| PtyError::Io(e.to_string()))
    }

    pub fn resizer(&self) -> PtyResizer {
        PtyResizer {
            master: Arc::clone(&self.master),
        }
    }

    /// Kill the child and everything it started, then reap the child.
    ///
    /// Blocks until the process has exited. Every step is attempted even
    /// if an earlier one fails, and calling this again is a no-op.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        #[cfg(unix)]
        self.kill_process_group();

        if let Err(e) = self.child.kill() {
            // Already exited children report an error here; reaping below still applies.
            tracing::warn!(command = %self.command, error = %e, "Failed to kill process");
        }
        match self.child.wait() {
            Ok(status) => {
                tracing::debug!(command = %self.command, status = ?status, "Process reaped")
            }
            Err(e) => {
                tracing::warn!(command = %self.command, error = %e, "Failed to wait for process exit")
            }
        }
    }

    /// The child leads its own session, so its process group also holds any
    /// background jobs it left behind. Those keep the PTY slave open, and
    /// with it every reader of the master.
    #[cfg(unix)]
    fn kill_process_group(&self) {
        let Some(pid) = self.child.process_id() else {
            return;
        };
        // SAFETY: killpg only sends a signal; pid is our own unreaped child.
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            tracing::debug!(
                command = %self.command,
                pid,
                error = %std::io::Error::last_os_error(),
                "Failed to kill process group"
            );
        }
    }

    /// Close the PTY master. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        match self.master.lock() {
            Ok(mut guard) => guard.take().is_some(),
            Err(poisoned) => poisoned.into_inner().take().is_some(),
        }
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        self.terminate();
        self.close();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_spawn_missing_binary_fails() {
        let result = PtyHandle::spawn("/definitely/not/a/real/binary", &[], 24, 80);
        assert!(matches!(result, Err(PtyError::Spawn { .. })));
    }

    #[test]
    fn test_echo_output_and_idempotent_teardown() {
        let mut handle =
            PtyHandle::spawn("/bin/echo", &["hello-pty".to_string()], 24, 80).unwrap();
        let mut reader = handle.reader().unwrap();

        let mut seen = Vec::new();
        let mut buf = [0u8; 256];
        while !String::from_utf8_lossy(&seen).contains("hello-pty") {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => seen.extend_from_slice(&buf[..n]),
            }
        }
        assert!(String::from_utf8_lossy(&seen).contains("hello-pty"));

        handle.terminate();
        handle.terminate();
        assert!(handle.close());
        assert!(!handle.close());
    }

    #[test]
    fn test_terminate_releases_reader_held_by_background_job() {
        let script = "(trap '' HUP; exec sleep 20) & sleep 30".to_string();
        let mut handle = PtyHandle::spawn("/bin/sh", &["-c".to_string(), script], 24, 80).unwrap();
        let mut reader = handle.reader().unwrap();

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let mut buf = [0u8; 256];
            while let Ok(n) = reader.read(&mut buf) {
                if n == 0 {
                    break;
                }
            }
            let _ = done_tx.send(());
        });

        // Let the shell start its background job.
        std::thread::sleep(std::time::Duration::from_millis(300));
        handle.terminate();
        handle.close();

        assert!(done_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .is_ok());
    }

    #[test]
    fn test_resize_after_close_fails() {
        let handle = PtyHandle::spawn("/bin/cat", &[], 24, 80).unwrap();
        let resizer = handle.resizer();
        assert!(resizer.resize(40, 120).is_ok());
        handle.close();
        assert!(matches!(resizer.resize(40, 120), Err(PtyError::Closed)));
    }
}
