//! External build tool invocation.
//!
//! The engine never implements a build tool; it only invokes them. The
//! [`Invoker`] trait is that seam: production uses [`ProcessInvoker`]
//! (real processes, cleared environment, output captured to the build
//! log), tests substitute scripted fakes.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use wait_timeout::ChildExt;

/// One tool invocation, fully resolved.
#[derive(Debug)]
pub struct ToolRequest<'a> {
    /// Program to run.
    pub program: &'a str,
    /// Argument list.
    pub args: &'a [String],
    /// Working directory the tool runs in.
    pub cwd: &'a Path,
    /// Complete environment for the child; the inherited environment is
    /// cleared first so host variables never leak into builds.
    pub env: &'a [(String, String)],
    /// File that receives the tool's stdout and stderr.
    pub log: &'a Path,
    /// Wall-clock bound for the invocation; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Run-level cancellation; a cancelled token kills the child.
    pub cancel: &'a CancellationToken,
}

/// How a tool invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    /// The process exited on its own with this status code.
    Exited(i32),
    /// The process exceeded the timeout and was killed.
    TimedOut,
    /// The run was cancelled and the process was killed.
    Cancelled,
}

impl ToolStatus {
    /// Whether the invocation succeeded (exit status zero).
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

/// Executes tool requests. Implemented by real process spawning in
/// production and by scripted fakes in tests.
pub trait Invoker: Send + Sync {
    /// Run the request to completion (or timeout/cancellation).
    ///
    /// # Errors
    ///
    /// Returns an error only when the process cannot be spawned or waited
    /// on; a non-zero exit is reported through [`ToolStatus`], not here.
    fn run(&self, req: &ToolRequest<'_>) -> std::io::Result<ToolStatus>;
}

/// Poll interval while waiting on a child process. Short enough that
/// cancellation feels immediate, long enough to stay off the scheduler.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// [`Invoker`] that spawns real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessInvoker;

impl Invoker for ProcessInvoker {
    fn run(&self, req: &ToolRequest<'_>) -> std::io::Result<ToolStatus> {
        if let Some(parent) = req.log.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(req.log)?;

        let mut cmd = Command::new(req.program);
        cmd.args(req.args)
            .current_dir(req.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file.try_clone()?))
            .stderr(Stdio::from(log_file));

        // Start from a blank slate so host env vars never leak in.
        cmd.env_clear();
        for (key, value) in req.env {
            cmd.env(key, value);
        }

        tracing::debug!(program = req.program, args = ?req.args, "invoking build tool");
        let mut child = cmd.spawn()?;

        let started = Instant::now();
        loop {
            if req.cancel.is_cancelled() {
                // kill() races with the child exiting on its own; either
                // way the run is over.
                let _ = child.kill();
                child.wait()?;
                return Ok(ToolStatus::Cancelled);
            }
            if let Some(limit) = req.timeout {
                if started.elapsed() >= limit {
                    let _ = child.kill();
                    child.wait()?;
                    return Ok(ToolStatus::TimedOut);
                }
            }
            if let Some(status) = child.wait_timeout(WAIT_SLICE)? {
                return Ok(ToolStatus::Exited(status.code().unwrap_or(-1)));
            }
        }
    }
}
