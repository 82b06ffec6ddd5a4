//! Process Supervisor (C2): spawns and owns the assistant child process,
//! drains its stderr, and performs graceful-then-forceful termination
//! (spec §4.2).

use std::collections::BTreeMap;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time;
use tracing::{debug, trace, warn};

use crate::error::{Result, SdkError, SpawnError};

/// Env var the SDK sets to identify itself to the assistant process.
pub const ENTRYPOINT_ENV: &str = "CLAUDE_CODE_ENTRYPOINT";
/// Env var carrying this SDK's version string.
pub const SDK_VERSION_ENV: &str = "CLAUDE_CODE_SDK_VERSION";

const GRACEFUL_TERMINATE_WAIT: Duration = Duration::from_secs(5);
const FORCE_KILL_WAIT: Duration = Duration::from_secs(2);

#[cfg(target_os = "windows")]
const MAX_ARGV_BYTES: usize = 8000;
#[cfg(not(target_os = "windows"))]
const MAX_ARGV_BYTES: usize = 100_000;

pub(crate) type StderrCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Configuration for spawning the assistant process.
pub struct ProcessConfig {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub stderr_callback: Option<StderrCallback>,
    /// When false, stdin is closed immediately after spawn (spec §4.2).
    pub streaming: bool,
    pub sdk_version: String,
}

/// Owns a spawned child process: its stdin/stdout handles and the stderr
/// drainer task. stdin/stdout are taken exactly once by the transport that
/// wraps this supervisor.
pub struct ProcessSupervisor {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr_task: Option<tokio::task::JoinHandle<()>>,
    temp_files: Vec<NamedTempFile>,
}

impl ProcessSupervisor {
    pub async fn spawn(mut config: ProcessConfig) -> Result<Self> {
        if let Some(dir) = config.working_dir.as_ref() {
            if !dir.is_dir() {
                return Err(SpawnError::MissingWorkingDir(dir.clone()).into());
            }
        }

        let mut temp_files = Vec::new();
        let argv = indirect_oversize_argv(&config.args, &mut temp_files)?;

        let mut command = Command::new(&config.binary);
        command.args(&argv);
        if let Some(dir) = config.working_dir.as_ref() {
            command.current_dir(dir);
        }
        for (k, v) in &config.env {
            command.env(k, v);
        }
        command.env(ENTRYPOINT_ENV, "sdk-rust");
        command.env(SDK_VERSION_ENV, &config.sdk_version);

        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(if config.stderr_callback.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = spawn_with_retry(&mut command, &config.binary)?;

        let stdout = child.stdout.take();
        let mut stdin = child.stdin.take();

        let stderr_task = if let Some(callback) = config.stderr_callback.take() {
            child.stderr.take().map(|stderr| {
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    loop {
                        match lines.next_line().await {
                            Ok(Some(line)) => callback(line),
                            Ok(None) => break,
                            Err(err) => {
                                trace!("stderr drain ended with error: {err}");
                                break;
                            }
                        }
                    }
                })
            })
        } else {
            None
        };

        if !config.streaming {
            if let Some(mut stdin) = stdin.take() {
                let _ = stdin.shutdown().await;
            }
            stdin = None;
        }

        Ok(Self {
            child,
            stdin,
            stdout,
            stderr_task,
            temp_files,
        })
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Waits for the child to exit and returns its exit code, if any. Safe
    /// to call after stdin/stdout have already been taken; only the process
    /// itself is awaited.
    pub async fn wait_for_exit_code(&mut self) -> Option<i32> {
        self.child.wait().await.ok().and_then(|status| status.code())
    }

    /// Graceful-then-forceful teardown (spec §4.2): attempt graceful
    /// termination, wait up to 5s; if still alive, force-kill and wait up
    /// to 2s more; warn if the process still has not exited.
    pub async fn terminate(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }

        if matches!(self.child.try_wait(), Ok(Some(_))) {
            self.cleanup_temp_files();
            return;
        }

        request_graceful_termination(&mut self.child);

        if time::timeout(GRACEFUL_TERMINATE_WAIT, self.child.wait())
            .await
            .is_err()
        {
            debug!("process did not exit gracefully, force-killing");
            let _ = self.child.start_kill();
            if time::timeout(FORCE_KILL_WAIT, self.child.wait())
                .await
                .is_err()
            {
                warn!("process still has not exited after force-kill");
            }
        }

        self.cleanup_temp_files();
    }

    fn cleanup_temp_files(&mut self) {
        self.temp_files.clear();
    }
}

fn spawn_with_retry(command: &mut Command, binary: &Path) -> Result<Child> {
    let mut backoff = Duration::from_millis(2);
    for attempt in 0..5 {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) => {
                let is_busy = matches!(source.kind(), io::ErrorKind::ExecutableFileBusy)
                    || source.raw_os_error() == Some(26);
                let not_found = matches!(source.kind(), io::ErrorKind::NotFound);
                if not_found {
                    return Err(SpawnError::MissingBinary.into());
                }
                if is_busy && attempt < 4 {
                    std::thread::sleep(backoff);
                    backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                    continue;
                }
                return Err(SpawnError::Spawn {
                    binary: binary.to_path_buf(),
                    source,
                }
                .into());
            }
        }
    }
    unreachable!("spawn_with_retry should return before exhausting retries")
}

/// Rewrites an oversize argv into a single `@<path>` indirection argument
/// when the assembled length would exceed the platform limit (spec §6).
fn indirect_oversize_argv(
    args: &[String],
    temp_files: &mut Vec<NamedTempFile>,
) -> Result<Vec<String>> {
    let total: usize = args.iter().map(|a| a.len() + 1).sum();
    if total <= MAX_ARGV_BYTES || args.is_empty() {
        return Ok(args.to_vec());
    }

    let mut file = NamedTempFile::new().map_err(|err| {
        SdkError::ConnectionError(format!("failed to create argv spill file: {err}"))
    })?;
    for arg in args {
        writeln!(file.as_file_mut(), "{arg}").map_err(|err| {
            SdkError::ConnectionError(format!("failed to write argv spill file: {err}"))
        })?;
    }
    let path = file.path().to_path_buf();
    temp_files.push(file);

    Ok(vec![format!("@{}", path.display())])
}

#[cfg(unix)]
fn request_graceful_termination(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(id) = child.id() {
        if let Err(err) = kill(Pid::from_raw(id as i32), Signal::SIGTERM) {
            trace!("SIGTERM to pid {id} failed: {err}");
        }
    }
}

#[cfg(not(unix))]
fn request_graceful_termination(child: &mut Child) {
    let _ = child.start_kill();
}

/// Runs `<binary> --version`, waits up to 2s, and best-effort parses a
/// semver for a minimum-version warning. Never blocks connection and never
/// surfaces an error — any failure is swallowed (spec §4.2).
pub async fn probe_version(binary: &Path, minimum: Option<&semver::Version>) {
    if std::env::var_os("CLI_VERSION_PROBE_SKIP").is_some() {
        return;
    }

    let mut command = Command::new(binary);
    command.arg("--version");
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::null());

    let child = match command.spawn() {
        Ok(child) => child,
        Err(_) => return,
    };

    let output = match time::timeout(Duration::from_secs(2), child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        _ => return,
    };

    let text = String::from_utf8_lossy(&output.stdout);
    let Some(found) = extract_semver(&text) else {
        return;
    };
    let Ok(version) = semver::Version::parse(&found) else {
        return;
    };

    if let Some(minimum) = minimum {
        if &version < minimum {
            warn!(
                "assistant CLI version {version} is below the minimum supported version {minimum}"
            );
        }
    }
}

fn extract_semver(text: &str) -> Option<String> {
    let text = text.trim();
    text.split_whitespace().find_map(|token| {
        let candidate: String = token
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
            .collect();
        semver::Version::parse(&candidate).ok().map(|_| candidate)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_semver_from_typical_output() {
        assert_eq!(
            extract_semver("claude-code 1.2.3 (build abc)"),
            Some("1.2.3".to_string())
        );
    }

    #[test]
    fn extract_semver_returns_none_when_absent() {
        assert_eq!(extract_semver("no version here"), None);
    }

    #[test]
    fn small_argv_is_left_alone() {
        let mut temp_files = Vec::new();
        let args = vec!["--print".to_string(), "hello".to_string()];
        let out = indirect_oversize_argv(&args, &mut temp_files).unwrap();
        assert_eq!(out, args);
        assert!(temp_files.is_empty());
    }

    #[test]
    fn oversize_argv_is_spilled_to_a_file() {
        let mut temp_files = Vec::new();
        let args = vec!["x".repeat(MAX_ARGV_BYTES + 10)];
        let out = indirect_oversize_argv(&args, &mut temp_files).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].starts_with('@'));
        assert_eq!(temp_files.len(), 1);
    }
}
