//! Command execution for job payloads.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

/// Upper bound on the error text recorded for a failed attempt.
pub const MAX_ERROR_BYTES: usize = 4096;

const WAIT_TICK: Duration = Duration::from_millis(10);

/// Runs a job's command string.
pub trait CommandRunner: Send + Sync {
    /// Run `command` to completion, or until `timeout` elapses.
    fn run(&self, command: &str, timeout: Option<Duration>) -> Result<CommandOutput, CommandError>;
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Error text for a failed run: exit status plus the tail of stderr
    /// (stdout when stderr is empty), bounded to [`MAX_ERROR_BYTES`].
    pub fn failure_message(&self) -> String {
        let status = match self.exit_code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        };

        let detail = match self.stderr.trim() {
            "" => self.stdout.trim(),
            stderr => stderr,
        };

        if detail.is_empty() {
            status
        } else {
            bounded(&format!("{status}: {detail}"))
        }
    }
}

/// Command could not be run to completion.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to start command: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("command timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
    #[error("failed to wait for command: {0}")]
    Wait(#[source] std::io::Error),
}

/// Keep the last [`MAX_ERROR_BYTES`] of `text`, cut on a char boundary.
pub fn bounded(text: &str) -> String {
    if text.len() <= MAX_ERROR_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - MAX_ERROR_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

/// Runs commands through `sh -c` on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellCommandRunner;

impl ShellCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for ShellCommandRunner {
    fn run(&self, command: &str, timeout: Option<Duration>) -> Result<CommandOutput, CommandError> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);

        let mut shell = Command::new("sh");
        shell
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group: a timeout kill reaches background children, and
        // a terminal Ctrl-C reaches only the daemon.
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut shell, 0);
        let mut child = shell.spawn().map_err(CommandError::Spawn)?;

        let (tx, rx) = mpsc::channel();
        if let Some(pipe) = child.stdout.take() {
            spawn_reader(Stream::Stdout, pipe, tx.clone());
        }
        if let Some(pipe) = child.stderr.take() {
            spawn_reader(Stream::Stderr, pipe, tx.clone());
        }
        drop(tx);

        let status = match wait_with_deadline(&mut child, deadline) {
            Ok(Some(status)) => status,
            Ok(None) => {
                terminate(&mut child);
                return Err(CommandError::TimedOut(timeout.unwrap_or_default()));
            }
            Err(err) => {
                terminate(&mut child);
                return Err(CommandError::Wait(err));
            }
        };

        // The shell has exited, but background children may still hold the pipes.
        let Some((stdout, stderr)) = collect_output(&rx, deadline) else {
            terminate(&mut child);
            return Err(CommandError::TimedOut(timeout.unwrap_or_default()));
        };

        Ok(CommandOutput {
            exit_code: status.code(),
            stdout,
            stderr,
            duration: started.elapsed(),
        })
    }
}

/// `Ok(None)` when the deadline passed first.
fn wait_with_deadline(
    child: &mut Child,
    deadline: Option<Instant>,
) -> std::io::Result<Option<ExitStatus>> {
    let Some(deadline) = deadline else {
        return child.wait().map(Some);
    };

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(WAIT_TICK.min(deadline - now));
    }
}

/// Kill the command's process group and reap the shell. Reader threads
/// still blocked on a pipe are left detached.
fn terminate(child: &mut Child) {
    if let Err(err) = kill_process_group(child.id()) {
        warn!(error = %err, "failed to kill command process group");
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    // SAFETY: killpg takes no pointers; an unknown group yields ESRCH.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) -> std::io::Result<()> {
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn spawn_reader<R>(stream: Stream, mut pipe: R, tx: Sender<(Stream, String)>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send((stream, String::from_utf8_lossy(&buf).into_owned()));
    });
}

/// Drain both readers. `None` when `deadline` passes before every pipe closed.
fn collect_output(
    rx: &Receiver<(Stream, String)>,
    deadline: Option<Instant>,
) -> Option<(String, String)> {
    let mut stdout = String::new();
    let mut stderr = String::new();

    loop {
        let received = match deadline {
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(deadline) => rx.recv_timeout(deadline.saturating_duration_since(Instant::now())),
        };
        match received {
            Ok((Stream::Stdout, text)) => stdout = text,
            Ok((Stream::Stderr, text)) => stderr = text,
            Err(RecvTimeoutError::Disconnected) => return Some((stdout, stderr)),
            Err(RecvTimeoutError::Timeout) => return None,
        }
    }
}
