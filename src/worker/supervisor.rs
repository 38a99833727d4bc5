use std::collections::VecDeque;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::{GateError, Result};
use crate::worker::shim::{ExecutionRequest, SELF_TERMINATION_EXIT_CODE};

/// Lines of stderr kept for the run report.
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for the output relays once the child is gone.
const RELAY_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    TimedOut,
    AbnormalExit,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::TimedOut => write!(f, "timed_out"),
            RunOutcome::AbnormalExit => write!(f, "abnormal_exit"),
        }
    }
}

/// Report of one executed job.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: Uuid,
    pub exit_code: Option<i32>,
    /// Signal that ended the child, if any
    pub signal: Option<i32>,
    /// The deadline was hit, by the watchdog or by the shim's own timer
    pub timed_out: bool,
    /// The shim's timer ended the run before the watchdog fired
    pub self_terminated: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub stderr_tail: Vec<String>,
}

impl RunResult {
    pub fn outcome(&self) -> RunOutcome {
        if self.timed_out {
            RunOutcome::TimedOut
        } else if self.exit_code == Some(0) {
            RunOutcome::Completed
        } else {
            RunOutcome::AbnormalExit
        }
    }
}

/// Runs composed scripts one at a time in a single staging slot.
///
/// Each child gets its own process group so the watchdog can take down
/// anything it spawned along with it.
#[derive(Debug, Clone)]
pub struct Supervisor {
    config: SandboxConfig,
}

impl Supervisor {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn staging_path(&self) -> &Path {
        &self.config.staging_path
    }

    /// Check that the runtime can be started at all. Used at startup, where a
    /// failure is a configuration error rather than a per-job one.
    pub async fn probe_runtime(&self) -> Result<()> {
        let mut child = Command::new(&self.config.runtime)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GateError::Config(format!(
                    "runtime '{}' could not be started: {}",
                    self.config.runtime, e
                ))
            })?;

        if tokio::time::timeout(PROBE_TIMEOUT, child.wait())
            .await
            .is_err()
        {
            let _ = child.kill().await;
            tracing::warn!(runtime = %self.config.runtime, "Runtime probe did not finish, continuing");
        }
        Ok(())
    }

    async fn stage(&self, source: &str) -> Result<()> {
        let path = &self.config.staging_path;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                GateError::LaunchFailed(format!(
                    "failed to create staging directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        tokio::fs::write(path, source).await.map_err(|e| {
            GateError::LaunchFailed(format!(
                "failed to stage job at {}: {}",
                path.display(),
                e
            ))
        })
    }

    async fn clear_slot(&self) {
        if let Err(e) = tokio::fs::remove_file(&self.config.staging_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.config.staging_path.display(),
                    error = %e,
                    "Failed to clear staging slot"
                );
            }
        }
    }

    /// Stage, launch and time-bound one composed script.
    ///
    /// `Err` means the job never started (`LaunchFailed`) or could not be
    /// waited on. A timeout or non-zero exit is reported in the `RunResult`.
    pub async fn run(&self, request: ExecutionRequest) -> Result<RunResult> {
        let run_id = Uuid::new_v4();
        self.stage(&request.composed_source).await?;

        let spawned = Command::new(&self.config.runtime)
            .args(&self.config.runtime_args)
            .arg(&self.config.staging_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.clear_slot().await;
                return Err(GateError::LaunchFailed(format!(
                    "failed to start runtime '{}': {}",
                    self.config.runtime, e
                )));
            }
        };

        let started = Instant::now();
        let started_at = Utc::now();
        let pid = child.id();
        tracing::info!(
            run_id = %run_id,
            pid = ?pid,
            runtime = %self.config.runtime,
            timeout_ms = request.timeout.as_millis() as u64,
            "Job started"
        );

        let stdout_relay = child
            .stdout
            .take()
            .map(|out| tokio::spawn(relay_lines(out, run_id, "stdout", 0)));
        let stderr_relay = child
            .stderr
            .take()
            .map(|err| tokio::spawn(relay_lines(err, run_id, "stderr", STDERR_TAIL_LINES)));

        // The group is only signalled while its leader is unreaped, so the
        // group id cannot have been handed to an unrelated process yet.
        let deadline = tokio::time::Instant::now() + request.timeout;
        let watched = match pid {
            Some(pid) => tokio::time::timeout_at(deadline, exited_unreaped(pid)).await,
            None => Ok(false),
        };
        let (waited, deadline_hit) = match watched {
            Ok(true) => {
                // Anything the job left behind in its group goes too.
                kill_group(pid);
                (child.wait().await, false)
            }
            // Once this wait reaps the leader, leftovers are not signalled.
            Ok(false) => match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(status) => (status, false),
                Err(_) => {
                    deadline_kill(run_id, &request, pid);
                    (child.wait().await, true)
                }
            },
            Err(_) => {
                deadline_kill(run_id, &request, pid);
                (child.wait().await, true)
            }
        };

        let elapsed = started.elapsed();
        let ended_at = Utc::now();

        drain(stdout_relay).await;
        let stderr_tail = drain(stderr_relay).await;
        self.clear_slot().await;

        let status = waited.map_err(|e| {
            tracing::error!(run_id = %run_id, error = %e, "Failed waiting for job");
            GateError::Io(e)
        })?;

        let exit_code = status.code();
        let self_terminated = !deadline_hit && exit_code == Some(SELF_TERMINATION_EXIT_CODE);
        let result = RunResult {
            run_id,
            exit_code,
            signal: status.signal(),
            timed_out: deadline_hit || self_terminated,
            self_terminated,
            started_at,
            ended_at,
            elapsed,
            stderr_tail,
        };

        match result.outcome() {
            RunOutcome::AbnormalExit => tracing::warn!(
                run_id = %run_id,
                exit_code = ?result.exit_code,
                signal = ?result.signal,
                elapsed_ms = elapsed.as_millis() as u64,
                stderr = %result.stderr_tail.join("\n"),
                "Job exited abnormally"
            ),
            outcome => tracing::info!(
                run_id = %run_id,
                status = %outcome,
                exit_code = ?result.exit_code,
                self_terminated = result.self_terminated,
                elapsed_ms = elapsed.as_millis() as u64,
                "Job finished"
            ),
        }

        Ok(result)
    }
}

fn deadline_kill(run_id: Uuid, request: &ExecutionRequest, pid: Option<u32>) {
    tracing::warn!(
        run_id = %run_id,
        timeout_ms = request.timeout.as_millis() as u64,
        "Job exceeded its deadline, killing process group"
    );
    kill_group(pid);
}

/// Wait until `pid` has exited without reaping it. `false` means the state
/// could not be observed and the caller has to fall back to a reaping wait.
async fn exited_unreaped(pid: u32) -> bool {
    let watched = tokio::task::spawn_blocking(move || loop {
        match waitid(
            Id::Pid(Pid::from_raw(pid as i32)),
            WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT,
        ) {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    })
    .await;
    match watched {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::debug!(pid, error = %e, "Exit watch failed, falling back to reaping wait");
            false
        }
        Err(e) => {
            tracing::debug!(pid, error = %e, "Exit watch task failed");
            false
        }
    }
}

/// SIGKILL the child's process group. The child is its own group leader, so
/// the group id equals its pid. A group that is already gone is fine.
/// Callers must not have reaped the leader yet.
fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, error = %e, "Failed to kill job process group"),
    }
}

async fn relay_lines<R>(reader: R, run_id: Uuid, stream: &'static str, keep: usize) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut segments = BufReader::new(reader).split(b'\n');
    let mut tail = VecDeque::with_capacity(keep);
    loop {
        match segments.next_segment().await {
            Ok(Some(bytes)) => {
                let line = String::from_utf8_lossy(&bytes).trim_end_matches('\r').to_string();
                tracing::info!(target: "jobgate::job", run_id = %run_id, stream, "{}", line);
                if keep > 0 {
                    if tail.len() == keep {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(run_id = %run_id, stream, error = %e, "Output relay stopped");
                break;
            }
        }
    }
    tail.into()
}

async fn drain(relay: Option<JoinHandle<Vec<String>>>) -> Vec<String> {
    let Some(mut handle) = relay else {
        return Vec::new();
    };
    match tokio::time::timeout(RELAY_DRAIN_TIMEOUT, &mut handle).await {
        Ok(Ok(lines)) => lines,
        Ok(Err(_)) => Vec::new(),
        Err(_) => {
            handle.abort();
            Vec::new()
        }
    }
}
