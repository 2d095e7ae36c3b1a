//! Helpers for running child processes with timeouts, cancellation and bounded output.
//!
//! Each child runs in its own process group. On timeout or cancellation the
//! whole group is killed, so processes a script started in the background
//! cannot keep the output pipes open past the limit.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::Cancelled;

/// How often a waiting child is polled for cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long output readers may lag behind the exit of the interpreter.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_truncated_notice(&self) -> String {
        if self.stdout_truncated > 0 {
            format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated)
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self) -> String {
        if self.stderr_truncated > 0 {
            format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated)
        } else {
            String::new()
        }
    }
}

/// Limits applied to a single child process.
#[derive(Debug, Clone)]
pub struct ProcessLimits {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: usize,
}

/// Drains one pipe on a thread into a shared, size-bounded buffer.
///
/// The buffer stays readable if the thread has to be abandoned because some
/// process outside our reach still holds the pipe.
struct StreamReader {
    handle: thread::JoinHandle<Result<()>>,
    sink: Arc<Mutex<Captured>>,
}

impl StreamReader {
    fn spawn<R: Read + Send + 'static>(reader: R, limit: usize) -> Self {
        let sink = Arc::new(Mutex::new(Captured::default()));
        let thread_sink = Arc::clone(&sink);
        let handle = thread::spawn(move || read_stream_limited(reader, limit, &thread_sink));
        Self { handle, sink }
    }

    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    fn finish(self, name: &str) -> Result<Captured> {
        if self.handle.is_finished() {
            match self.handle.join() {
                Ok(result) => result.with_context(|| format!("read {name}"))?,
                Err(_) => return Err(anyhow!("{name} reader thread panicked")),
            }
        } else {
            warn!(stream = name, "abandoning output reader that is still blocked");
        }
        let mut captured = self
            .sink
            .lock()
            .map_err(|_| anyhow!("{name} buffer lock poisoned"))?;
        Ok(std::mem::take(&mut *captured))
    }
}

/// Run a command, capturing stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// The child's process group is killed on timeout (reported through `timed_out`) or when `cancel`
/// fires (reported as a [`Cancelled`] error). Processes that keep the pipes open after the child
/// exits are killed once `OUTPUT_DRAIN_GRACE` has passed.
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs(), output_limit_bytes = limits.output_limit_bytes))]
pub fn run_command(
    mut cmd: Command,
    limits: &ProcessLimits,
    cancel: &CancellationToken,
) -> Result<CommandOutput> {
    if cancel.is_cancelled() {
        return Err(Cancelled.into());
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = limits.output_limit_bytes;
    let stdout_reader = StreamReader::spawn(stdout, limit);
    let stderr_reader = StreamReader::spawn(stderr, limit);

    let deadline = Instant::now() + limits.timeout;
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child
            .wait_timeout(CANCEL_POLL_INTERVAL)
            .context("wait for command")?
        {
            break status;
        }
        if cancel.is_cancelled() {
            warn!("cancelled while command was running, killing");
            kill_process_group(&mut child)?;
            child.wait().context("wait command after kill")?;
            return Err(Cancelled.into());
        }
        if Instant::now() >= deadline {
            warn!(
                timeout_secs = limits.timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_process_group(&mut child)?;
            break child.wait().context("wait command after kill")?;
        }
    };

    let readers = [&stdout_reader, &stderr_reader];
    if !wait_for_readers(&readers, &mut child, cancel)? {
        warn!("output still held open after exit, killing process group");
        kill_process_group(&mut child)?;
        wait_for_readers(&readers, &mut child, cancel)?;
    }

    let stdout = stdout_reader.finish("stdout")?;
    let stderr = stderr_reader.finish("stderr")?;

    if stdout.truncated > 0 || stderr.truncated > 0 {
        warn!(
            stdout_truncated = stdout.truncated,
            stderr_truncated = stderr.truncated,
            "output truncated"
        );
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout: stdout.bytes,
        stderr: stderr.bytes,
        stdout_truncated: stdout.truncated,
        stderr_truncated: stderr.truncated,
        timed_out,
    })
}

/// Wait up to `OUTPUT_DRAIN_GRACE` for every reader to hit end of stream.
///
/// Returns `false` if some reader is still blocked when the grace runs out.
fn wait_for_readers(
    readers: &[&StreamReader],
    child: &mut Child,
    cancel: &CancellationToken,
) -> Result<bool> {
    let deadline = Instant::now() + OUTPUT_DRAIN_GRACE;
    loop {
        if readers.iter().all(|reader| reader.is_finished()) {
            return Ok(true);
        }
        if cancel.is_cancelled() {
            warn!("cancelled while draining output, killing");
            kill_process_group(child)?;
            return Err(Cancelled.into());
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        thread::sleep(DRAIN_POLL_INTERVAL);
    }
}

#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;

    // The child leads a new group whose id equals its pid.
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(child.id()).context("child pid out of range")?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        // Everything in the group already exited.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err).context("kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) -> Result<()> {
    match child.kill() {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(err) => Err(err).context("kill command"),
    }
}

fn read_stream_limited<R: Read>(
    mut reader: R,
    limit: usize,
    sink: &Mutex<Captured>,
) -> Result<()> {
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let mut captured = sink.lock().map_err(|_| anyhow!("output buffer lock poisoned"))?;
        let remaining = limit.saturating_sub(captured.bytes.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            captured.bytes.extend_from_slice(&chunk[..keep]);
            captured.truncated += n.saturating_sub(keep);
        } else {
            captured.truncated += n;
        }
    }

    Ok(())
}
