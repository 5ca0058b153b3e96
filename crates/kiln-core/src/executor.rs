//! Stage execution.
//!
//! Runs a [`ResolvedPlan`]'s actions strictly in order inside the build
//! working directory. Each action either invokes an external tool through
//! the [`Invoker`] seam (required zero exit status) or applies a declared
//! file patch. The first failure aborts the remaining stages — build tool
//! failures are rarely transient, so there are no automatic retries — and
//! is reported with the stage index and the tail of the captured output.
//!
//! Writes to the install prefix are not rolled back on failure; re-running
//! resolution is idempotent per descriptor.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use kiln_schema::{PackageName, Platform, Version};

use crate::error::OrchestrateError;
use crate::invoke::{Invoker, ToolRequest, ToolStatus};
use crate::plan::{ResolvedAction, ResolvedPlan};

/// How many log lines a failure report carries.
const FAILURE_TAIL_LINES: usize = 20;

/// Constructs the controlled environment every tool invocation runs with.
///
/// The inherited environment is cleared by the invoker; this is the
/// complete replacement: a minimal system `PATH` extended with each built
/// dependency's `bin/`, compiler and linker search flags aggregated from
/// every dependency prefix, and the install destination.
pub fn build_env(
    workdir: &Path,
    own_prefix: &Path,
    prefixes: &BTreeMap<PackageName, PathBuf>,
    platform: &Platform,
    jobs: usize,
) -> Vec<(String, String)> {
    let mut path_dirs = vec![
        "/usr/bin".to_string(),
        "/bin".to_string(),
        "/usr/sbin".to_string(),
        "/sbin".to_string(),
    ];

    let mut cflags: Vec<String> = Vec::new();
    let mut ldflags: Vec<String> = Vec::new();
    let mut pkg_config_paths: Vec<String> = Vec::new();

    for prefix in prefixes.values() {
        let bin = prefix.join("bin");
        if bin.is_dir() {
            path_dirs.insert(0, bin.to_string_lossy().to_string());
        }
        if prefix.join("include").exists() {
            cflags.push(format!("-I{}", prefix.join("include").to_string_lossy()));
        }
        if prefix.join("lib").exists() {
            ldflags.push(format!("-L{}", prefix.join("lib").to_string_lossy()));
        }
        if prefix.join("lib/pkgconfig").exists() {
            pkg_config_paths.push(prefix.join("lib/pkgconfig").to_string_lossy().to_string());
        }
    }

    let (cc, cxx) = match platform.os {
        kiln_schema::Os::Macos => ("clang", "clang++"),
        kiln_schema::Os::Linux => ("cc", "c++"),
    };

    let mut env = vec![
        ("PATH".to_string(), path_dirs.join(":")),
        ("HOME".to_string(), workdir.to_string_lossy().to_string()),
        ("TERM".to_string(), "dumb".to_string()),
        ("LANG".to_string(), "en_US.UTF-8".to_string()),
        ("CC".to_string(), cc.to_string()),
        ("CXX".to_string(), cxx.to_string()),
        ("ARCH".to_string(), platform.arch.rust_name().to_string()),
        (
            "PREFIX".to_string(),
            own_prefix.to_string_lossy().to_string(),
        ),
        ("JOBS".to_string(), jobs.to_string()),
    ];

    if !cflags.is_empty() {
        let flags = cflags.join(" ");
        env.push(("CFLAGS".to_string(), flags.clone()));
        env.push(("CPPFLAGS".to_string(), flags));
    }
    if !ldflags.is_empty() {
        env.push(("LDFLAGS".to_string(), ldflags.join(" ")));
    }
    if !pkg_config_paths.is_empty() {
        env.push(("PKG_CONFIG_PATH".to_string(), pkg_config_paths.join(":")));
    }

    env
}

/// Programs a plan invokes by bare name that do not resolve in the build
/// `PATH`.
///
/// Advisory only: the build environment is constructed, not inherited, so
/// a tool visible in the user's shell may still be absent here. Surfacing
/// that up front turns a cryptic stage failure into an actionable warning.
pub fn missing_tools(plan: &ResolvedPlan, env: &[(String, String)]) -> Vec<String> {
    let path = env
        .iter()
        .find(|(key, _)| key == "PATH")
        .map(|(_, value)| value.clone())
        .unwrap_or_default();

    let mut missing: Vec<String> = plan
        .steps
        .iter()
        .filter_map(|step| match step {
            ResolvedAction::Invoke { program, .. } if !program.contains('/') => {
                which::which_in(program, Some(&path), "/")
                    .is_err()
                    .then(|| program.clone())
            }
            _ => None,
        })
        .collect();
    missing.sort();
    missing.dedup();
    missing
}

/// Executes one resolved plan.
pub struct StageExecutor<'a> {
    /// Seam to the external build tools.
    pub invoker: &'a dyn Invoker,
    /// Run-level cancellation; checked before every stage.
    pub cancel: &'a CancellationToken,
    /// Wall-clock bound per tool invocation.
    pub timeout: Option<Duration>,
}

impl std::fmt::Debug for StageExecutor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecutor")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl StageExecutor<'_> {
    /// Run every step of `plan` in order, in `cwd`, with output captured to
    /// `log`.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestrateError::StageFailed`] naming the index of the
    /// first failed stage, or [`OrchestrateError::Cancelled`] when the run
    /// was cancelled between stages.
    pub fn execute(
        &self,
        package: &PackageName,
        version: &Version,
        platform: &Platform,
        plan: &ResolvedPlan,
        cwd: &Path,
        env: &[(String, String)],
        log: &Path,
    ) -> Result<(), OrchestrateError> {
        for (index, step) in plan.steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(OrchestrateError::Cancelled);
            }

            match step {
                ResolvedAction::Invoke {
                    program,
                    args,
                    env: step_env,
                } => {
                    let mut full_env = env.to_vec();
                    full_env.extend(step_env.iter().cloned());

                    let status = self.invoker.run(&ToolRequest {
                        program,
                        args,
                        cwd,
                        env: &full_env,
                        log,
                        timeout: self.timeout,
                        cancel: self.cancel,
                    })?;

                    match status {
                        ToolStatus::Exited(0) => {}
                        ToolStatus::Exited(code) => {
                            return Err(self.stage_failed(
                                package,
                                version,
                                platform,
                                index,
                                log,
                                &format!("{program} exited with status {code}"),
                            ));
                        }
                        ToolStatus::TimedOut => {
                            return Err(self.stage_failed(
                                package,
                                version,
                                platform,
                                index,
                                log,
                                &format!(
                                    "{program} timed out after {:?}",
                                    self.timeout.unwrap_or_default()
                                ),
                            ));
                        }
                        ToolStatus::Cancelled => return Err(OrchestrateError::Cancelled),
                    }
                }
                ResolvedAction::Patch {
                    file,
                    find,
                    replace,
                } => {
                    if let Err(reason) = apply_patch(file, find, replace) {
                        return Err(self.stage_failed(
                            package, version, platform, index, log, &reason,
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    fn stage_failed(
        &self,
        package: &PackageName,
        version: &Version,
        platform: &Platform,
        stage: usize,
        log: &Path,
        reason: &str,
    ) -> OrchestrateError {
        let tail = read_last_lines(log, FAILURE_TAIL_LINES).unwrap_or_default();
        let output = if tail.is_empty() {
            reason.to_string()
        } else {
            format!("{reason}\n{tail}")
        };
        OrchestrateError::StageFailed {
            package: package.clone(),
            version: version.clone(),
            platform: *platform,
            stage,
            output,
        }
    }
}

/// Apply one declared file mutation, in place.
fn apply_patch(file: &Path, find: &str, replace: &str) -> Result<(), String> {
    let content = std::fs::read_to_string(file)
        .map_err(|e| format!("patch target {} unreadable: {e}", file.display()))?;

    if !content.contains(find) {
        return Err(format!(
            "patch pattern '{find}' not found in {}",
            file.display()
        ));
    }

    std::fs::write(file, content.replace(find, replace))
        .map_err(|e| format!("patch target {} unwritable: {e}", file.display()))
}

/// Read the last N lines from a file efficiently.
///
/// Instead of loading the entire file, we seek to near the end and read a
/// fixed-size tail buffer. This prevents OOM on large build logs.
fn read_last_lines(path: &Path, n: usize) -> std::io::Result<String> {
    // Read at most 16KB from the end (enough for ~400 lines at 40 chars each)
    const TAIL_SIZE: u64 = 16 * 1024;

    let mut file = std::fs::File::open(path)?;
    let file_len = file.metadata()?.len();

    let seek_pos = file_len.saturating_sub(TAIL_SIZE);
    file.seek(SeekFrom::Start(seek_pos))?;

    let mut buffer = String::new();
    file.read_to_string(&mut buffer)?;

    // If we seeked mid-file, skip the first (partial) line in-place
    let content = if seek_pos > 0 {
        buffer
            .find('\n')
            .map_or(buffer.as_str(), |idx| &buffer[idx + 1..])
    } else {
        &buffer
    };

    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].join("\n"))
}
