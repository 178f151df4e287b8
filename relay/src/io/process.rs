//! Child processes with timeouts, bounded output, and optional log tee.
//!
//! Both workers and gate tools go through here. Output is drained on reader
//! threads while the child runs so a chatty child can never deadlock on a full
//! pipe. Each child leads its own process group; a timeout kills the whole
//! group, and readers still blocked on pipes held by stray descendants are
//! detached after a short grace period.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::shutdown::Shutdown;

type SharedLog = Arc<Mutex<BufWriter<File>>>;

/// How long readers may keep draining after the child is gone.
const READER_GRACE: Duration = Duration::from_secs(2);
/// Shutdown polling granularity while waiting on a child.
const WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: usize,
}

type SharedCapture = Arc<Mutex<Captured>>;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    /// Killed because shutdown was requested.
    pub interrupted: bool,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stdout and stderr joined, for tools that report on either stream.
    pub fn combined_text(&self) -> String {
        let mut text = self.stdout_text();
        let stderr = String::from_utf8_lossy(&self.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        text
    }
}

/// Run a command with a timeout and capture stdout/stderr.
///
/// `output_limit_bytes` bounds what is kept in memory per stream; anything
/// beyond it is drained and counted but discarded.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    spawn_and_wait(cmd, timeout, output_limit_bytes, None, None)
}

/// Like [`run_command_with_timeout`], but every stdout/stderr line is also
/// appended to `log_path` as it arrives, and the child is killed early once
/// `shutdown` is requested.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), log = %log_path.display()))]
pub fn run_command_logged(
    cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
    log_path: &Path,
    shutdown: Option<&Shutdown>,
) -> Result<CommandOutput> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let file =
        File::create(log_path).with_context(|| format!("create log {}", log_path.display()))?;
    let log = Arc::new(Mutex::new(BufWriter::new(file)));
    spawn_and_wait(cmd, timeout, output_limit_bytes, Some(log), shutdown)
}

/// Best-effort liveness check for a process on this host.
#[cfg(target_os = "linux")]
pub fn pid_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn pid_alive(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

/// True if `err` came from spawning a program that does not exist.
pub fn is_spawn_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|io_err| io_err.kind() == ErrorKind::NotFound)
    })
}

/// Last `max_chars` characters of `text`, starting on a line boundary when possible.
pub fn tail_text(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.trim().to_string();
    }
    let tail: String = text.chars().skip(total - max_chars).collect();
    match tail.split_once('\n') {
        Some((_, rest)) if !rest.trim().is_empty() => rest.trim().to_string(),
        _ => tail.trim().to_string(),
    }
}

fn spawn_and_wait(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
    log: Option<SharedLog>,
    shutdown: Option<&Shutdown>,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            if e.kind() == ErrorKind::NotFound {
                debug!(err = %e, "program not found");
            } else {
                error!(err = %e, "failed to spawn command");
            }
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

    let (done_tx, done_rx) = mpsc::channel();
    let stdout_capture = spawn_reader(stdout, output_limit_bytes, log.clone(), done_tx.clone());
    let stderr_capture = spawn_reader(stderr, output_limit_bytes, log, done_tx);

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let mut interrupted = false;
    let status = loop {
        let now = Instant::now();
        if now >= deadline {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing process group");
            timed_out = true;
            break kill_and_reap(&mut child)?;
        }
        if let Some(status) = child
            .wait_timeout((deadline - now).min(WAIT_SLICE))
            .context("wait for command")?
        {
            break status;
        }
        if shutdown.is_some_and(Shutdown::is_requested) {
            warn!("shutdown requested, killing process group");
            interrupted = true;
            break kill_and_reap(&mut child)?;
        }
    };

    let grace_end = Instant::now() + READER_GRACE;
    for _ in 0..2 {
        match done_rx.recv_timeout(grace_end.saturating_duration_since(Instant::now())) {
            Ok(result) => result.context("read output")?,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    grace_ms = READER_GRACE.as_millis() as u64,
                    "output pipes still open after exit; detaching readers"
                );
                break;
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("output reader thread panicked"));
            }
        }
    }
    let (stdout, stdout_truncated) = take_capture(&stdout_capture);
    let (stderr, stderr_truncated) = take_capture(&stderr_capture);

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, interrupted, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        interrupted,
    })
}

/// Kill the child's whole process group (falling back to the child) and reap it.
fn kill_and_reap(child: &mut Child) -> Result<ExitStatus> {
    if !kill_group(child.id()) {
        debug!("process group kill failed; killing child only");
        if let Err(err) = child.kill() {
            // Already exited between the last wait and the kill.
            debug!(err = %err, "kill child");
        }
    }
    child.wait().context("wait command after kill")
}

#[cfg(unix)]
fn kill_group(pgid: u32) -> bool {
    Command::new("kill")
        .args(["-KILL", "--", &format!("-{pgid}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) -> bool {
    false
}

fn spawn_reader<R: Read + Send + 'static>(
    reader: R,
    limit: usize,
    log: Option<SharedLog>,
    done: Sender<Result<()>>,
) -> SharedCapture {
    let capture = SharedCapture::default();
    let sink = capture.clone();
    thread::spawn(move || {
        let result = read_lines_limited(reader, limit, log, &sink);
        let _ = done.send(result);
    });
    capture
}

fn take_capture(capture: &SharedCapture) -> (Vec<u8>, usize) {
    let mut captured = capture.lock().unwrap_or_else(PoisonError::into_inner);
    let taken = std::mem::take(&mut *captured);
    (taken.bytes, taken.truncated)
}

fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    log: Option<SharedLog>,
    capture: &SharedCapture,
) -> Result<()> {
    let mut reader = BufReader::new(reader);
    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).context("read output")?;
        if n == 0 {
            return Ok(());
        }

        if let Some(log) = log.as_ref()
            && let Ok(mut writer) = log.lock()
            && let Err(e) = writer.write_all(&line).and_then(|()| writer.flush())
        {
            warn!(err = %e, "failed to write log line");
        }

        let mut captured = capture.lock().unwrap_or_else(PoisonError::into_inner);
        let remaining = limit.saturating_sub(captured.bytes.len());
        let keep = n.min(remaining);
        captured.bytes.extend_from_slice(&line[..keep]);
        captured.truncated += n - keep;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_both_streams() {
        let out = run_command_with_timeout(
            sh("echo out; echo err >&2; exit 3"),
            Duration::from_secs(5),
            1024,
        )
        .expect("run");
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.stdout_text(), "out\n");
        assert_eq!(out.combined_text(), "out\nerr\n");
        assert!(!out.timed_out);
    }

    #[test]
    fn output_beyond_limit_is_counted() {
        let out = run_command_with_timeout(sh("printf 'abcdefghij'"), Duration::from_secs(5), 4)
            .expect("run");
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 6);
    }

    #[test]
    fn timeout_kills_child() {
        let out = run_command_with_timeout(sh("sleep 5"), Duration::from_millis(100), 1024)
            .expect("run");
        assert!(out.timed_out);
        assert!(!out.status.success());
    }

    #[test]
    fn timeout_also_kills_background_children() {
        let start = Instant::now();
        let out = run_command_with_timeout(
            sh("sleep 30 & wait"),
            Duration::from_millis(200),
            1024,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "took {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn lingering_descendant_does_not_hold_the_caller() {
        let start = Instant::now();
        let out = run_command_with_timeout(
            sh("sleep 30 & echo done"),
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert!(!out.timed_out);
        assert!(out.status.success());
        assert_eq!(out.stdout_text(), "done\n");
        assert!(start.elapsed() < READER_GRACE + Duration::from_secs(3));
    }

    #[test]
    fn shutdown_stops_a_logged_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        let requester = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            trigger.request();
        });
        let start = Instant::now();
        let out = run_command_logged(
            sh("sleep 30"),
            Duration::from_secs(30),
            1024,
            &temp.path().join("w.log"),
            Some(&shutdown),
        )
        .expect("run");
        requester.join().expect("join");
        assert!(out.interrupted);
        assert!(!out.timed_out);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
        let mut child = Command::new("true").spawn().expect("spawn");
        let pid = child.id();
        child.wait().expect("wait");
        assert!(!pid_alive(pid));
    }

    #[test]
    fn logged_run_writes_log_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("logs/worker.log");
        run_command_logged(
            sh("echo hello; echo oops >&2"),
            Duration::from_secs(5),
            1024,
            &log,
            None,
        )
        .expect("run");
        let contents = fs::read_to_string(&log).expect("read log");
        assert!(contents.contains("hello"));
        assert!(contents.contains("oops"));
    }

    #[test]
    fn missing_program_is_detected() {
        let err = run_command_with_timeout(
            Command::new("relay-definitely-not-installed"),
            Duration::from_secs(1),
            16,
        )
        .expect_err("spawn fails");
        assert!(is_spawn_not_found(&err));
    }

    #[test]
    fn tail_prefers_line_boundary() {
        let text = "first line\nsecond line\nthird line";
        assert_eq!(tail_text(text, 15), "third line");
        assert_eq!(tail_text("short", 100), "short");
    }
}
