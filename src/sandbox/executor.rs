use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::error::ExecutionFailure;

/// Default per-command time limit
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);
/// Time between the graceful and the forceful termination signal
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// One external command to run
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    command: String,
    args: Vec<String>,
    working_dir: PathBuf,
    env: HashMap<String, String>,
    timeout: Duration,
}

impl ExecutionRequest {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: HashMap::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Overrides one variable of the inherited environment
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &HashMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Sets the time limit. There is no unbounded mode; zero is raised to 1ms.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.max(MIN_TIMEOUT);
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn time_limit(&self) -> Duration {
        self.timeout
    }
}

/// Outcome of a process that ran to completion, whatever its exit code
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecutionResult {
    fn from_output(status: ExitStatus, stdout: &[u8], stderr: &[u8]) -> Self {
        Self {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
            timed_out: false,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Once-only resolution slot: the first value settled wins, later ones are dropped
#[derive(Debug)]
pub struct Latch<T> {
    slot: Mutex<Option<T>>,
}

impl<T> Latch<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Returns `false` if the latch was already settled
    pub fn settle(&self, value: T) -> bool {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        true
    }

    pub fn is_settled(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn into_inner(self) -> Option<T> {
        self.slot.into_inner()
    }
}

impl<T> Default for Latch<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs external commands under a time limit
///
/// On timeout the whole process group gets SIGTERM, then SIGKILL if it is
/// still alive after `grace_period`.
#[derive(Debug, Clone)]
pub struct Executor {
    grace_period: Duration,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Runs one command to completion or until its time limit
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, ExecutionFailure> {
        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args)
            .current_dir(&request.working_dir)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| {
            log::warn!("Failed to spawn `{}`: {source}", request.command);
            ExecutionFailure::Spawn {
                command: request.command.clone(),
                source,
            }
        })?;
        let pid = child.id();
        let group = GroupGuard { pid };
        log::debug!(
            "Spawned `{}` {:?} as pid {pid:?} in {}",
            request.command,
            request.args,
            request.working_dir.display()
        );

        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);
        let readers: Vec<_> = [&stdout, &stderr]
            .into_iter()
            .flatten()
            .map(JoinHandle::abort_handle)
            .collect();

        let limit = request.timeout;
        let latch: Latch<Result<ExecutionResult, ExecutionFailure>> = Latch::new();

        tokio::select! {
            done = wait_with_output(&mut child, stdout, stderr) => {
                let outcome = done
                    .map(|(status, out, err)| ExecutionResult::from_output(status, &out, &err))
                    .map_err(|source| {
                        log::warn!("Failed to wait on `{}`: {source}", request.command);
                        ExecutionFailure::Wait {
                            command: request.command.clone(),
                            source,
                        }
                    });
                latch.settle(outcome);
            }
            _ = tokio::time::sleep(limit) => {
                latch.settle(Err(ExecutionFailure::TimeoutExceeded { limit }));
                log::warn!(
                    "`{}` exceeded {}ms, terminating",
                    request.command,
                    limit.as_millis()
                );

                let late = terminate(&mut child, pid, self.grace_period).await;
                for reader in &readers {
                    reader.abort();
                }
                if let Some(status) = late {
                    if !latch.settle(Ok(ExecutionResult::from_output(status, &[], &[]))) {
                        log::debug!("Ignoring exit ({status}) of `{}` after timeout", request.command);
                    }
                }
            }
        }
        group.disarm();

        match latch.into_inner() {
            Some(Ok(result)) => {
                log::debug!("`{}` exited with code {}", request.command, result.exit_code);
                Ok(result)
            }
            Some(Err(e)) => Err(e),
            None => unreachable!("both race arms settle the latch"),
        }
    }
}

fn spawn_reader<R>(mut pipe: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            log::debug!("Output pipe closed with error: {e}");
        }
        buf
    })
}

async fn wait_with_output(
    child: &mut Child,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
) -> std::io::Result<(ExitStatus, Vec<u8>, Vec<u8>)> {
    let status = child.wait().await?;
    let out = collect(stdout).await;
    let err = collect(stderr).await;
    Ok((status, out, err))
}

async fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    match reader {
        Some(handle) => handle.await.unwrap_or_default(),
        None => Vec::new(),
    }
}

/// SIGTERM, wait `grace`, SIGKILL. Returns the exit status if one was observed.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) -> Option<ExitStatus> {
    signal_group(pid, Signal::Terminate);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            // the leader is gone, stragglers in its group are not welcome either
            signal_group(pid, Signal::Kill);
            return Some(status);
        }
        Ok(Err(e)) => log::warn!("Failed to wait on pid {pid:?}: {e}"),
        Err(_) => log::debug!("pid {pid:?} ignored SIGTERM, sending SIGKILL"),
    }

    signal_group(pid, Signal::Kill);
    if let Err(e) = child.start_kill() {
        log::debug!("start_kill on pid {pid:?}: {e}");
    }
    child.wait().await.ok()
}

/// SIGKILLs the child's process group if `execute` is dropped before the
/// race settles. `kill_on_drop` alone only reaches the leader.
struct GroupGuard {
    pid: Option<u32>,
}

impl GroupGuard {
    fn disarm(mut self) {
        self.pid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if self.pid.is_some() {
            log::debug!("Execution of pid {:?} abandoned, killing its group", self.pid);
            signal_group(self.pid, Signal::Kill);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else {
        return;
    };
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: plain kill(2). The child was spawned with process_group(0),
    // so its pid is also its process group id.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), sig) };
    if rc != 0 {
        log::debug!(
            "kill({signal:?}) on group {pid}: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) {}
