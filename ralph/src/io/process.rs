//! Helpers for running child processes with timeouts, cancellation and bounded output.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::interrupt::CancelToken;

/// How often the wait loop wakes to check the deadline and the cancel token.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Receives each stdout line (including its newline) as it is read.
pub type LineSink = Box<dyn FnMut(&[u8]) -> std::io::Result<()> + Send>;

/// Why the child stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    TimedOut,
    Cancelled,
}

/// Captured child process output.
///
/// `stdout` keeps the *last* `output_limit_bytes` bytes (completion markers
/// come at the end); `stdout_truncated` counts the leading bytes dropped.
/// `stderr` keeps the first bytes.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub termination: Termination,
}

impl CommandOutput {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Render stdout and stderr as one log document, truncated to `limit` bytes.
    pub fn render_log(&self, label: &str, limit: usize) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        if self.stdout_truncated > 0 {
            buf.push_str(&format!(
                "[{label} stdout: first {} bytes not kept]\n",
                self.stdout_truncated
            ));
        }
        buf.push_str(&String::from_utf8_lossy(&self.stdout));
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stderr));
        if self.stderr_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        match self.termination {
            Termination::Exited => {}
            Termination::TimedOut => buf.push_str(&format!("\n[{label} timed out]\n")),
            Termination::Cancelled => buf.push_str(&format!("\n[{label} cancelled]\n")),
        }
        truncate_log(buf, limit)
    }
}

/// Cut `buf` to at most `limit` bytes (on a char boundary) with a notice.
pub fn truncate_log(buf: String, limit: usize) -> String {
    if buf.len() <= limit {
        return buf;
    }
    let mut cut = limit;
    while !buf.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[truncated {} bytes]\n", &buf[..cut], buf.len() - cut)
}

/// Options for [`run_command`].
#[derive(Default)]
pub struct RunOptions<'a> {
    /// Kill the child once this much wall-clock time has passed.
    pub timeout: Option<Duration>,
    /// Bound on stdout/stderr kept in memory; the pipes are drained regardless
    /// and sinks see every line.
    pub output_limit_bytes: usize,
    pub cancel: Option<&'a CancelToken>,
    /// Every stdout line is handed to each sink in order.
    pub stdout_sinks: Vec<LineSink>,
}

/// Run a command, draining stdout/stderr on dedicated threads so the child can
/// never block on a full pipe.
///
/// On unix the child leads its own process group, and a timeout or cancel
/// kills the whole group so grandchildren holding the pipes die with it.
///
/// stdout is read line by line by a single reader which fans each line out to
/// the sinks and to the bounded accumulation buffer. A sink that fails is
/// dropped with a warning; reading continues.
#[instrument(skip_all, fields(timeout_secs = options.timeout.map(|t| t.as_secs()), output_limit_bytes = options.output_limit_bytes))]
pub fn run_command(mut cmd: Command, options: RunOptions<'_>) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

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

    let limit = options.output_limit_bytes;
    let sinks = options.stdout_sinks;
    let stdout_handle = thread::spawn(move || read_lines_fanout(stdout, limit, sinks));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let (status, termination) = wait_for_child(&mut child, options.timeout, options.cancel)?;

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), ?termination, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        termination,
    })
}

fn wait_for_child(
    child: &mut Child,
    timeout: Option<Duration>,
    cancel: Option<&CancelToken>,
) -> Result<(ExitStatus, Termination)> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        if let Some(status) = child
            .wait_timeout(POLL_INTERVAL)
            .context("wait for command")?
        {
            return Ok((status, Termination::Exited));
        }
        let termination = if cancel.is_some_and(CancelToken::is_cancelled) {
            warn!("cancel requested, killing command");
            Termination::Cancelled
        } else if deadline.is_some_and(|d| Instant::now() >= d) {
            warn!(
                timeout_secs = timeout.map(|t| t.as_secs()),
                "command timed out, killing"
            );
            Termination::TimedOut
        } else {
            continue;
        };
        kill_process_tree(child);
        let status = child.wait().context("wait command after kill")?;
        return Ok((status, termination));
    }
}

/// Kill the child and, on unix, every process in its group.
/// The child may exit on its own between the poll and the kill.
fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        match i32::try_from(child.id()) {
            Ok(pgid) => {
                if let Err(err) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                    debug!(err = %err, pgid, "killpg failed");
                }
            }
            Err(_) => debug!(pid = child.id(), "pid out of range for killpg"),
        }
    }
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill failed");
    }
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_lines_fanout<R: Read>(
    reader: R,
    limit: usize,
    mut sinks: Vec<LineSink>,
) -> Result<(Vec<u8>, usize)> {
    let mut reader = BufReader::new(reader);
    let mut collected: VecDeque<u8> = VecDeque::new();
    let mut truncated = 0usize;
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).context("read line")?;
        if n == 0 {
            break;
        }

        sinks.retain_mut(|sink| match sink(&line) {
            Ok(()) => true,
            Err(err) => {
                warn!(err = %err, "output sink failed, detaching it");
                false
            }
        });

        collected.extend(&line);
        let excess = collected.len().saturating_sub(limit);
        if excess > 0 {
            collected.drain(..excess);
            truncated += excess;
        }
    }

    Ok((collected.into(), truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_output_and_exit_code() {
        let output = run_command(
            sh("echo out; echo err >&2; exit 3"),
            RunOptions {
                output_limit_bytes: 1024,
                ..RunOptions::default()
            },
        )
        .expect("run");
        assert_eq!(output.exit_code(), Some(3));
        assert_eq!(output.stdout_lossy(), "out\n");
        assert_eq!(String::from_utf8_lossy(&output.stderr), "err\n");
        assert_eq!(output.termination, Termination::Exited);
    }

    #[test]
    fn bounded_buffer_still_feeds_sinks_every_line() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let failing: LineSink = Box::new(|_| Err(std::io::Error::other("display closed")));
        let recording: LineSink = Box::new(move |line| {
            sink_seen
                .lock()
                .map_err(|_| std::io::Error::other("poisoned"))?
                .push(String::from_utf8_lossy(line).into_owned());
            Ok(())
        });

        let output = run_command(
            sh("for i in 1 2 3 4 5; do echo line$i; done"),
            RunOptions {
                output_limit_bytes: 6,
                stdout_sinks: vec![failing, recording],
                ..RunOptions::default()
            },
        )
        .expect("run");

        assert_eq!(output.stdout_lossy(), "line5\n");
        assert_eq!(output.stdout_truncated, 24);
        assert_eq!(seen.lock().expect("lock").len(), 5);
    }

    #[test]
    fn timeout_kills_child() {
        let output = run_command(
            sh("echo started; exec sleep 5"),
            RunOptions {
                timeout: Some(Duration::from_millis(300)),
                output_limit_bytes: 1024,
                ..RunOptions::default()
            },
        )
        .expect("run");
        assert_eq!(output.termination, Termination::TimedOut);
        assert!(output.render_log("agent", 4096).contains("[agent timed out]"));
    }

    #[test]
    fn over_limit_output_keeps_the_final_lines() {
        let output = run_command(
            sh("i=0; while [ $i -lt 200 ]; do echo \"chatter line $i\"; i=$((i+1)); done; echo '<ralph>TASK_COMPLETE</ralph>'"),
            RunOptions {
                output_limit_bytes: 1000,
                ..RunOptions::default()
            },
        )
        .expect("run");

        assert_eq!(output.stdout.len(), 1000);
        assert!(output.stdout_truncated > 0);
        assert!(output.stdout_lossy().ends_with("<ralph>TASK_COMPLETE</ralph>\n"));
        assert!(output.render_log("agent", 1 << 20).contains("first"));
    }

    #[test]
    fn timeout_kills_grandchildren_holding_the_pipe() {
        let started = Instant::now();
        let output = run_command(
            sh("sleep 4; echo after"),
            RunOptions {
                timeout: Some(Duration::from_millis(300)),
                output_limit_bytes: 1024,
                ..RunOptions::default()
            },
        )
        .expect("run");

        assert_eq!(output.termination, Termination::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!output.stdout_lossy().contains("after"));
    }

    #[test]
    fn cancel_token_kills_child() {
        let token = CancelToken::new();
        token.cancel();
        let started = Instant::now();
        let output = run_command(
            sh("exec sleep 5"),
            RunOptions {
                output_limit_bytes: 1024,
                cancel: Some(&token),
                ..RunOptions::default()
            },
        )
        .expect("run");
        assert_eq!(output.termination, Termination::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn missing_binary_is_not_found() {
        let err = run_command(
            Command::new("definitely-not-a-real-binary-ralph"),
            RunOptions::default(),
        )
        .unwrap_err();
        let io = err.downcast_ref::<std::io::Error>().expect("io error");
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn truncate_log_respects_char_boundaries() {
        let log = truncate_log("héllo".to_string(), 2);
        assert!(log.starts_with('h'));
        assert!(log.contains("[truncated"));
    }
}
