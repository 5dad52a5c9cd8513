//! Process spawning and output-driven completion waiting.
//!
//! The gateway and the CLI tools this shim drives report their exit status
//! unreliably, so completion is detected primarily by matching a marker in
//! the accumulated output. Exit status is consulted as a hint only.

use parking_lot::Mutex;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Interval for polling process output and status
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A fixed point in time after which a polling wait gives up.
///
/// Thin wrapper over the tokio clock so polling loops compose with the
/// cooperative scheduler and tests can use `tokio::time::pause`.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    end: tokio::time::Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            end: tokio::time::Instant::now() + timeout,
        }
    }

    pub fn expired(&self) -> bool {
        tokio::time::Instant::now() >= self.end
    }

    pub fn remaining(&self) -> Duration {
        self.end
            .saturating_duration_since(tokio::time::Instant::now())
    }
}

/// Handle to a spawned external process with buffered output.
///
/// Stdout and stderr are drained by background tasks into in-memory buffers
/// so that callers can inspect accumulated output at any point without
/// blocking the child on a full pipe.
pub struct ProcessHandle {
    child: Child,
    stdout: Arc<Mutex<String>>,
    stderr: Arc<Mutex<String>>,
}

impl ProcessHandle {
    /// Spawn the command with piped output and start the reader tasks
    pub fn spawn(mut cmd: Command) -> anyhow::Result<Self> {
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn()?;

        let stdout = Arc::new(Mutex::new(String::new()));
        let stderr = Arc::new(Mutex::new(String::new()));

        if let Some(out) = child.stdout.take() {
            spawn_reader(out, Arc::clone(&stdout));
        }
        if let Some(err) = child.stderr.take() {
            spawn_reader(err, Arc::clone(&stderr));
        }

        Ok(Self {
            child,
            stdout,
            stderr,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Snapshot of the stdout accumulated so far
    pub fn stdout_snapshot(&self) -> String {
        self.stdout.lock().clone()
    }

    /// Snapshot of the stderr accumulated so far
    pub fn stderr_snapshot(&self) -> String {
        self.stderr.lock().clone()
    }

    /// Snapshot of stdout and stderr combined, stdout first.
    ///
    /// Completion markers are matched against this view: gateways and CLI
    /// tools log to either stream interchangeably.
    pub fn output_snapshot(&self) -> String {
        let mut combined = self.stdout.lock().clone();
        let stderr = self.stderr.lock();
        combined.push_str(&stderr);
        combined
    }

    /// Exit status if the process has terminated.
    ///
    /// Treat this as a hint: the hosting environment is known to report
    /// process status unreliably. Output inspection takes precedence.
    pub fn try_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// SIGTERM the process, wait up to `grace`, then SIGKILL.
    ///
    /// Used only for shutdown cleanup of children this shim spawned; wait
    /// timeouts never terminate the process.
    pub async fn terminate(&mut self, grace: Duration) {
        if let Some(pid) = self.child.id() {
            debug!(pid, "Sending SIGTERM");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = self.child.start_kill();
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(?status, "Process exited");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Error waiting for process to exit");
            }
            Err(_) => {
                warn!(
                    grace_secs = grace.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = self.child.kill().await;
            }
        }
    }
}

fn spawn_reader<R>(stream: R, buffer: Arc<Mutex<String>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut buf = buffer.lock();
            buf.push_str(&line);
            buf.push('\n');
        }
    });
}

/// Result of waiting on a process
#[derive(Debug, Clone)]
pub struct WaitOutcome {
    /// Combined stdout and stderr accumulated up to the point the wait ended
    pub output: String,
    /// True if the predicate matched or the process reached terminal status
    /// before the timeout; false if the timeout elapsed first
    pub completed: bool,
}

/// Build a case-insensitive substring completion predicate.
///
/// This exact heuristic is load-bearing: downstream callers depend on
/// case-insensitive `contains`, so it is preserved as-is rather than
/// tightened to whole-word or anchored matching.
pub fn marker(needle: &str) -> impl Fn(&str) -> bool + Send + Sync {
    let needle = needle.to_lowercase();
    move |output: &str| output.to_lowercase().contains(&needle)
}

/// Poll a process until the completion predicate matches its accumulated
/// output (stdout and stderr combined), the process reaches terminal
/// status, or the timeout elapses.
///
/// Predicate matching takes precedence over exit status. On timeout the
/// accumulated output is returned with `completed = false`; the process is
/// left running and no retry is attempted here.
pub async fn wait_for<P>(handle: &mut ProcessHandle, timeout: Duration, predicate: P) -> WaitOutcome
where
    P: Fn(&str) -> bool,
{
    let deadline = Deadline::after(timeout);

    loop {
        let output = handle.output_snapshot();
        if predicate(&output) {
            return WaitOutcome {
                output,
                completed: true,
            };
        }

        if handle.try_status().is_some() {
            // Give the reader tasks one more beat to flush trailing output
            tokio::time::sleep(POLL_INTERVAL).await;
            return WaitOutcome {
                output: handle.output_snapshot(),
                completed: true,
            };
        }

        if deadline.expired() {
            debug!(
                timeout_secs = timeout.as_secs(),
                "Wait timed out before completion"
            );
            return WaitOutcome {
                output,
                completed: false,
            };
        }

        let interval = POLL_INTERVAL.min(deadline.remaining());
        tokio::time::sleep(interval).await;
    }
}
